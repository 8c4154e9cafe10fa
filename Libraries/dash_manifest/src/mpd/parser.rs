use crate::mpd::{AdaptationSet, Manifest, ManifestError, Representation, SegmentRun};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

#[allow(clippy::if_same_then_else)]
fn infer_content_type(mime_type: &str) -> &str {
    if mime_type.contains("audio") {
        "audio"
    } else if mime_type.contains("video") {
        "video"
    } else {
        "video" // fallback
    }
}

/// SegmentTemplate attributes as written, before representation resolution.
#[derive(Debug, Clone, Default)]
struct TemplateAttrs {
    timescale: Option<u64>,
    media: Option<String>,
    initialization: Option<String>,
}

impl TemplateAttrs {
    fn is_empty(&self) -> bool {
        self.timescale.is_none() && self.media.is_none() && self.initialization.is_none()
    }
}

/// A representation collected while its adaptation set is still open.
#[derive(Debug, Clone, Default)]
struct PendingRep {
    id: String,
    template: TemplateAttrs,
    timeline: Vec<SegmentRun>,
}

#[derive(Default)]
struct ParserState {
    manifest: Manifest,
    current_set: Option<(String, Vec<PendingRep>)>,
    set_template: TemplateAttrs,
    set_timeline: Vec<SegmentRun>,
    current_rep: Option<PendingRep>,
    inside_rep: bool,
    timeline: Vec<SegmentRun>,
    next_offset: u64,
}

impl ParserState {
    fn open(&mut self, e: &BytesStart) -> Result<(), ManifestError> {
        let name = e.name().to_owned();
        let tag = std::str::from_utf8(name.as_ref())?;

        match tag {
            "AdaptationSet" => {
                let mut mime = String::new();
                let mut content = String::new();
                for attr in e.attributes() {
                    let attr = attr?;
                    match attr.key.as_ref() {
                        b"mimeType" => mime = attr.unescape_value()?.to_string(),
                        b"contentType" => content = attr.unescape_value()?.to_string(),
                        _ => {}
                    }
                }
                let content_type = if !content.is_empty() {
                    content
                } else {
                    infer_content_type(&mime).to_string()
                };
                self.current_set = Some((content_type, Vec::new()));
                self.set_template = TemplateAttrs::default();
                self.set_timeline.clear();
            }
            "Representation" => {
                self.inside_rep = true;
                let mut rep = PendingRep::default();
                for attr in e.attributes() {
                    let attr = attr?;
                    if attr.key.as_ref() == b"id" {
                        rep.id = attr.unescape_value()?.to_string();
                    }
                }
                self.current_rep = Some(rep);
            }
            "SegmentTemplate" => {
                let template = template_attrs(e)?;
                if self.inside_rep {
                    if let Some(rep) = self.current_rep.as_mut() {
                        rep.template = template;
                    }
                } else {
                    self.set_template = template;
                }
            }
            "SegmentTimeline" => {
                self.timeline.clear();
                self.next_offset = 0;
            }
            "S" => {
                let run = segment_run(e, self.next_offset)?;
                self.next_offset = run
                    .start
                    .saturating_add(run.duration.saturating_mul(run.repeat.saturating_add(1)));
                self.timeline.push(run);
            }
            _ => {}
        }

        Ok(())
    }

    fn close(&mut self, tag: &str) {
        match tag {
            "SegmentTimeline" => {
                let runs = std::mem::take(&mut self.timeline);
                if self.inside_rep {
                    if let Some(rep) = self.current_rep.as_mut() {
                        rep.timeline = runs;
                    }
                } else {
                    self.set_timeline = runs;
                }
            }
            "Representation" => {
                self.inside_rep = false;
                if let Some(rep) = self.current_rep.take() {
                    if let Some((_, reps)) = self.current_set.as_mut() {
                        reps.push(rep);
                    }
                }
            }
            "AdaptationSet" => {
                if let Some((content_type, pending)) = self.current_set.take() {
                    let representations = pending
                        .into_iter()
                        .map(|rep| resolve(rep, &self.set_template, &self.set_timeline))
                        .collect();
                    self.manifest.adaptation_sets.push(AdaptationSet {
                        content_type,
                        representations,
                    });
                }
            }
            _ => {}
        }
    }
}

/// Resolve a representation against its adaptation set's SegmentTemplate:
/// representation-level attributes win, set-level ones fill the gaps.
fn resolve(rep: PendingRep, set_template: &TemplateAttrs, set_timeline: &[SegmentRun]) -> Representation {
    let template = if rep.template.is_empty() {
        set_template
    } else {
        &rep.template
    };
    let timeline = if rep.timeline.is_empty() {
        set_timeline.to_vec()
    } else {
        rep.timeline
    };

    let media = template
        .media
        .clone()
        .unwrap_or_default()
        .replace("$RepresentationID$", &rep.id);
    let initialization = template
        .initialization
        .clone()
        .unwrap_or_default()
        .replace("$RepresentationID$", &rep.id);

    Representation {
        id: rep.id,
        timescale: template.timescale.unwrap_or(1),
        media,
        initialization,
        timeline,
    }
}

/// Parse an unsigned integer attribute, surfacing a typed error on failure.
fn parse_u64(attr: &'static str, value: &str) -> Result<u64, ManifestError> {
    value.parse().map_err(|_| ManifestError::InvalidAttr {
        attr,
        value: value.to_string(),
    })
}

fn template_attrs(e: &BytesStart) -> Result<TemplateAttrs, ManifestError> {
    let mut template = TemplateAttrs::default();
    for attr in e.attributes() {
        let attr = attr?;
        match attr.key.as_ref() {
            b"timescale" => {
                template.timescale = Some(parse_u64("timescale", &attr.unescape_value()?)?);
            }
            b"media" => template.media = Some(attr.unescape_value()?.to_string()),
            b"initialization" => {
                template.initialization = Some(attr.unescape_value()?.to_string());
            }
            _ => {}
        }
    }
    Ok(template)
}

/// Parse one `<S>` element. A missing `t` continues from the previous run;
/// a missing `d` is a hard parse error since deletion decisions depend on it.
fn segment_run(e: &BytesStart, next_offset: u64) -> Result<SegmentRun, ManifestError> {
    let mut start: Option<u64> = None;
    let mut duration: Option<u64> = None;
    let mut repeat: u64 = 0;

    for attr in e.attributes() {
        let attr = attr?;
        match attr.key.as_ref() {
            b"t" => start = Some(parse_u64("t", &attr.unescape_value()?)?),
            b"d" => duration = Some(parse_u64("d", &attr.unescape_value()?)?),
            b"r" => {
                // Negative repeat counts ("until end of period") do not occur
                // in the live manifests the packager writes; clamp to zero.
                let value = attr.unescape_value()?;
                let parsed: i64 = value.parse().map_err(|_| ManifestError::InvalidAttr {
                    attr: "r",
                    value: value.to_string(),
                })?;
                repeat = parsed.max(0) as u64;
            }
            _ => {}
        }
    }

    let duration = duration.ok_or(ManifestError::InvalidAttr {
        attr: "d",
        value: "<missing>".to_string(),
    })?;

    Ok(SegmentRun {
        start: start.unwrap_or(next_offset),
        duration,
        repeat,
    })
}

pub fn parse_mpd(xml: &str) -> Result<Manifest, ManifestError> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();
    let mut state = ParserState::default();
    let mut open_elements: u32 = 0;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) => {
                open_elements += 1;
                state.open(e)?;
            }
            Event::Empty(ref e) => {
                state.open(e)?;
                let name = e.name().to_owned();
                let tag = std::str::from_utf8(name.as_ref())?.to_string();
                state.close(&tag);
            }
            Event::End(ref e) => {
                open_elements = open_elements.saturating_sub(1);
                let name = e.name().to_owned();
                let tag = std::str::from_utf8(name.as_ref())?.to_string();
                state.close(&tag);
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    // Deletion decisions hang off this document; a prefix of one is not one.
    if open_elements != 0 {
        return Err(ManifestError::Truncated(open_elements));
    }

    Ok(state.manifest)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIVE_MPD: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" profiles="urn:mpeg:dash:profile:isoff-live:2011" type="dynamic" minimumUpdatePeriod="PT500S">
  <Period id="0" start="PT0.0S">
    <AdaptationSet id="0" contentType="video" segmentAlignment="true">
      <Representation id="0" mimeType="video/mp4" codecs="avc1.64001f" bandwidth="1500000">
        <SegmentTemplate timescale="1000" initialization="init-stream$RepresentationID$.m4s" media="chunk-stream$RepresentationID$-$Time$.m4s" startNumber="1">
          <SegmentTimeline>
            <S t="0" d="1000" r="2" />
            <S d="960" />
          </SegmentTimeline>
        </SegmentTemplate>
      </Representation>
    </AdaptationSet>
    <AdaptationSet id="1" contentType="audio">
      <SegmentTemplate timescale="44100" initialization="init-stream$RepresentationID$.m4s" media="chunk-stream$RepresentationID$-$Time$.m4s">
        <SegmentTimeline>
          <S t="0" d="44100" r="3" />
        </SegmentTimeline>
      </SegmentTemplate>
      <Representation id="1" mimeType="audio/mp4" codecs="mp4a.40.2" bandwidth="128000" />
    </AdaptationSet>
  </Period>
</MPD>"#;

    #[test]
    fn parses_representation_level_template() {
        let manifest = parse_mpd(LIVE_MPD).unwrap();
        assert_eq!(manifest.adaptation_sets.len(), 2);

        let video = &manifest.adaptation_sets[0];
        assert_eq!(video.content_type, "video");
        let rep = &video.representations[0];
        assert_eq!(rep.id, "0");
        assert_eq!(rep.timescale, 1000);
        assert_eq!(rep.media, "chunk-stream0-$Time$.m4s");
        assert_eq!(rep.initialization, "init-stream0.m4s");
        assert_eq!(
            rep.timeline,
            vec![
                SegmentRun { start: 0, duration: 1000, repeat: 2 },
                // The second S has no t: it continues at 0 + 1000 * 3.
                SegmentRun { start: 3000, duration: 960, repeat: 0 },
            ]
        );
    }

    #[test]
    fn set_level_template_applies_to_bare_representations() {
        let manifest = parse_mpd(LIVE_MPD).unwrap();
        let audio = &manifest.adaptation_sets[1];
        assert_eq!(audio.content_type, "audio");
        let rep = &audio.representations[0];
        assert_eq!(rep.id, "1");
        assert_eq!(rep.timescale, 44100);
        assert_eq!(rep.media, "chunk-stream1-$Time$.m4s");
        assert_eq!(rep.timeline, vec![SegmentRun { start: 0, duration: 44100, repeat: 3 }]);
    }

    #[test]
    fn truncated_document_is_an_error() {
        // Cut in the middle of a tag so the document is unambiguously broken.
        let cut = LIVE_MPD.find("<SegmentTimeline>").unwrap() + 5;
        assert!(parse_mpd(&LIVE_MPD[..cut]).is_err());
    }

    #[test]
    fn missing_duration_is_an_error() {
        let xml = r#"<MPD><Period><AdaptationSet>
            <Representation id="0"><SegmentTemplate timescale="1000" media="m">
            <SegmentTimeline><S t="0" r="4"/></SegmentTimeline>
            </SegmentTemplate></Representation>
            </AdaptationSet></Period></MPD>"#;
        assert!(matches!(
            parse_mpd(xml),
            Err(ManifestError::InvalidAttr { attr: "d", .. })
        ));
    }

    #[test]
    fn negative_repeat_is_clamped() {
        let xml = r#"<MPD><Period><AdaptationSet>
            <Representation id="0"><SegmentTemplate timescale="1000" media="m">
            <SegmentTimeline><S t="500" d="1000" r="-1"/></SegmentTimeline>
            </SegmentTemplate></Representation>
            </AdaptationSet></Period></MPD>"#;
        let manifest = parse_mpd(xml).unwrap();
        let rep = &manifest.adaptation_sets[0].representations[0];
        assert_eq!(rep.timeline, vec![SegmentRun { start: 500, duration: 1000, repeat: 0 }]);
    }
}

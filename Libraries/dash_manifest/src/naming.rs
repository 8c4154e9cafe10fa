//! The segment filename convention shared between the packager and the
//! reconciler. The packager passes these templates to the external process;
//! the reconciler derives offsets back out of directory listings. The two
//! sides must agree exactly or live segments would be deleted.

/// Manifest filename inside every output directory.
pub const MANIFEST_FILE: &str = "stream.mpd";

/// Template handed to the packager for media segments.
pub const MEDIA_TEMPLATE: &str = "chunk-stream$RepresentationID$-$Time$.m4s";

/// Template handed to the packager for initialization segments.
pub const INIT_TEMPLATE: &str = "init-stream$RepresentationID$.m4s";

const CHUNK_PREFIX: &str = "chunk-stream";
const CHUNK_SUFFIX: &str = ".m4s";

/// Filename of the media segment for `(representation, start offset)`.
pub fn segment_file_name(rep_id: &str, offset: u64) -> String {
    format!("{CHUNK_PREFIX}{rep_id}-{offset}{CHUNK_SUFFIX}")
}

/// Filename of a representation's initialization segment.
pub fn init_file_name(rep_id: &str) -> String {
    format!("init-stream{rep_id}.m4s")
}

/// Inverse of [`segment_file_name`]. Returns `None` for anything that is not
/// a media segment of this convention (manifest, init segments, temp files).
pub fn parse_segment_file_name(name: &str) -> Option<(&str, u64)> {
    let stem = name.strip_prefix(CHUNK_PREFIX)?.strip_suffix(CHUNK_SUFFIX)?;
    let (rep_id, offset) = stem.rsplit_once('-')?;
    let offset = offset.parse().ok()?;
    if rep_id.is_empty() {
        return None;
    }
    Some((rep_id, offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_round_trips() {
        let name = segment_file_name("0", 3000);
        assert_eq!(name, "chunk-stream0-3000.m4s");
        assert_eq!(parse_segment_file_name(&name), Some(("0", 3000)));
    }

    #[test]
    fn foreign_files_are_not_segments() {
        assert_eq!(parse_segment_file_name(MANIFEST_FILE), None);
        assert_eq!(parse_segment_file_name(&init_file_name("0")), None);
        assert_eq!(parse_segment_file_name("chunk-stream0-12a.m4s"), None);
        assert_eq!(parse_segment_file_name("chunk-stream0.m4s"), None);
        assert_eq!(parse_segment_file_name("segment-5000.m4s"), None);
    }

    #[test]
    fn templates_match_the_convention() {
        let resolved = MEDIA_TEMPLATE
            .replace("$RepresentationID$", "7")
            .replace("$Time$", "42");
        assert_eq!(resolved, segment_file_name("7", 42));
        let init = INIT_TEMPLATE.replace("$RepresentationID$", "7");
        assert_eq!(init, init_file_name("7"));
    }
}

//! DASH manifest data structures (MPD and related types).
//! These represent parsed MPEG-DASH metadata including segment timelines
//! per representation.

pub mod parser;

use thiserror::Error;

/// One `<S>` element of a SegmentTimeline: a run of equally-spaced segments.
/// A repeat count of R represents R+1 occurrences starting at `start` with
/// stride `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentRun {
    /// Start offset of the first segment, in timescale units.
    pub start: u64,
    /// Duration of each segment in the run, in timescale units.
    pub duration: u64,
    /// Number of additional occurrences after the first.
    pub repeat: u64,
}

/// A single representation (track) within an adaptation set.
#[derive(Debug, Clone)]
pub struct Representation {
    /// Unique identifier for the representation.
    pub id: String,
    /// Timescale used to convert segment timing to seconds.
    pub timescale: u64,
    /// URL template for the media segments, with `$RepresentationID$` resolved.
    pub media: String,
    /// URL template for the initialization segment, with `$RepresentationID$` resolved.
    pub initialization: String,
    /// The segment timeline declared for this representation.
    pub timeline: Vec<SegmentRun>,
}

/// An adaptation set groups representations with the same content type.
#[derive(Debug, Clone)]
pub struct AdaptationSet {
    /// Content type of the adaptation set (e.g., "audio" or "video").
    pub content_type: String,
    /// All representations available in this adaptation set.
    pub representations: Vec<Representation>,
}

/// Top-level data parsed from an MPD document.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub adaptation_sets: Vec<AdaptationSet>,
}

impl Manifest {
    /// Iterate over every representation in the manifest.
    pub fn representations(&self) -> impl Iterator<Item = &Representation> {
        self.adaptation_sets
            .iter()
            .flat_map(|set| set.representations.iter())
    }
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("attribute error: {0}")]
    Attr(#[from] quick_xml::events::attributes::AttrError),
    #[error("invalid {attr} attribute: {value}")]
    InvalidAttr { attr: &'static str, value: String },
    #[error("tag name is not utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("document truncated: {0} elements left open")]
    Truncated(u32),
}

//! MPEG-DASH manifest tooling for the packaging pipeline.
//! Parses live MPD documents, expands segment timelines into the set of
//! expected segment offsets, and builds/parses the segment filename
//! convention shared with the packager.

pub mod mpd;
pub mod naming;
pub mod timeline;

pub use mpd::parser::parse_mpd;
pub use mpd::{AdaptationSet, Manifest, ManifestError, Representation, SegmentRun};

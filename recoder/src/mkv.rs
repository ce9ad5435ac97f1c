mod layout;
mod probe;
mod segment;

pub use layout::*;
pub use probe::*;
pub use segment::*;

use crate::ebml::EbmlId;

pub const EBML_HEADER: EbmlId = EbmlId(0x1a45dfa3);
pub const EBML_VERSION: EbmlId = EbmlId(0x4286);
pub const EBML_READ_VERSION: EbmlId = EbmlId(0x42f7);
pub const EBML_MAX_ID_LENGTH: EbmlId = EbmlId(0x42f2);
pub const EBML_MAX_SIZE_LENGTH: EbmlId = EbmlId(0x42f3);
pub const EBML_DOC_TYPE: EbmlId = EbmlId(0x4282);
pub const EBML_DOC_TYPE_VERSION: EbmlId = EbmlId(0x4287);
pub const EBML_DOC_TYPE_READ_VERSION: EbmlId = EbmlId(0x4285);
pub const SEGMENT: EbmlId = EbmlId(0x18538067);
pub const SEEK_HEAD: EbmlId = EbmlId(0x114d9b74);
pub const SEEK: EbmlId = EbmlId(0x4dbb);
pub const SEEK_ID: EbmlId = EbmlId(0x53ab);
pub const SEEK_POSITION: EbmlId = EbmlId(0x53ac);
pub const INFO: EbmlId = EbmlId(0x1549a966);
pub const TIMESTAMP_SCALE: EbmlId = EbmlId(0x2ad7b1);
pub const MUXING_APP: EbmlId = EbmlId(0x4d80);
pub const WRITING_APP: EbmlId = EbmlId(0x5741);
pub const DURATION: EbmlId = EbmlId(0x4489);
pub const DATE_UTC: EbmlId = EbmlId(0x4461);
pub const SEGMENT_UID: EbmlId = EbmlId(0x73a4);
pub const TRACKS: EbmlId = EbmlId(0x1654ae6b);
pub const CUES: EbmlId = EbmlId(0x1c53bb6b);
pub const CUE_POINT: EbmlId = EbmlId(0xbb);
pub const CUE_TIME: EbmlId = EbmlId(0xb3);
pub const CUE_TRACK_POSITIONS: EbmlId = EbmlId(0xb7);
pub const CUE_TRACK: EbmlId = EbmlId(0xf7);
pub const CUE_CLUSTER_POSITION: EbmlId = EbmlId(0xf1);
pub const CLUSTER: EbmlId = EbmlId(0x1f43b675);

#[derive(Debug, thiserror::Error)]
pub enum MkvError {
    #[error("No Segment element found at the top level")]
    NoSegment,

    #[error("First element of the Segment is not a SeekHead, it is {0:?}")]
    NotSeekHead(EbmlId),

    #[error("No Cues were found in the source")]
    NoCues,

    #[error("Cue cluster positions are not strictly increasing at time {0}")]
    CuesNotIncreasing(u64),

    #[error("Missing element {0:?}")]
    MissingElement(EbmlId),

    #[error("Clusters of {0} bytes overflow the planned slot of {1} bytes")]
    SlotOverflow(u64, u64),

    #[error("The planned header of {0} bytes overflows the first cue cluster offset {1}")]
    HeaderOverflow(u64, u64),

    #[error("{0}")]
    Ebml(#[from] crate::ebml::EbmlError),

    #[error("{0}")]
    Io(#[from] crate::io::IoError),
}

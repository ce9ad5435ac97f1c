use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use super::*;
use crate::ebml::{
    encode_id, read_element_at, read_float, read_uint, Children, RawElement,
};
use crate::io::{read_range, ReadSeek};

/// Everything the layout planner needs from the source file.
#[derive(Debug, Clone, Default)]
pub struct SourceInfo {
    pub timecode_scale: Option<u64>,
    pub duration: Option<f64>,
    /// Cue time (in timecode units) to cluster position, relative to the
    /// Segment body.
    pub cues: BTreeMap<u64, u64>,
    /// Size of the Segment body.
    pub segment_size: u64,
}

/// Header elements recovered from an encoded segment file.
#[derive(Debug, Clone, Default)]
pub struct SegmentHeaders {
    /// Raw bytes of the whole Tracks element.
    pub tracks: Option<Bytes>,
    pub timecode_scale: Option<u64>,
    pub duration: Option<f64>,
}

/// Locates the top-level Segment element, skipping the EBML header and any
/// other roots before it.
pub async fn find_segment<R: ReadSeek + ?Sized>(io: &mut R) -> Result<RawElement, MkvError> {
    let total = io.len();
    let mut offset = 0;

    while offset < total {
        let element = read_element_at(io, offset).await?;

        if element.id == SEGMENT {
            return Ok(element);
        }

        offset = element.body_start() + element.require_size()?;
    }

    Err(MkvError::NoSegment)
}

pub(crate) fn segment_body_end(io_len: u64, segment: &RawElement) -> u64 {
    match segment.size {
        Some(size) => segment.body_start() + size,
        // An unfinalised segment extends to the end of the file.
        None => io_len,
    }
}

/// Probes the remote source for the data the planner needs: the Cues table
/// through the SeekHead, TimecodeScale and Duration from Info, and the
/// Segment body size.
///
/// The first child of the Segment must be a SeekHead; anything else means
/// the source cannot be cheaply indexed and the encode is not started.
pub async fn probe_source<R: ReadSeek + ?Sized>(io: &mut R) -> Result<SourceInfo, MkvError> {
    let segment = find_segment(io).await?;
    let body_start = segment.body_start();

    let seek_head = read_element_at(io, body_start).await?;
    if seek_head.id != SEEK_HEAD {
        return Err(MkvError::NotSeekHead(seek_head.id));
    }

    let positions = parse_seek_head(io, &seek_head).await?;

    let mut info = SourceInfo {
        segment_size: segment.require_size()?,
        ..SourceInfo::default()
    };

    let cues_at = positions.cues.ok_or(MkvError::NoCues)?;
    info.cues = extract_cues(io, body_start + cues_at).await?;

    if info.cues.is_empty() {
        return Err(MkvError::NoCues);
    }

    validate_cues(&info.cues)?;

    let end = segment_body_end(io.len(), &segment);
    scan_for_info(io, seek_head.body_start() + seek_head.require_size()?, end, |scale, duration| {
        info.timecode_scale = scale;
        info.duration = duration;
    })
    .await?;

    debug!(
        cues = info.cues.len(),
        segment_size = info.segment_size,
        "probed source"
    );

    Ok(info)
}

/// Extracts the Tracks element and Info values from an encoded segment
/// file. Used on promoted encoder output, where the external encoder has
/// rewritten the track entries.
pub async fn probe_segment<R: ReadSeek + ?Sized>(io: &mut R) -> Result<SegmentHeaders, MkvError> {
    let segment = find_segment(io).await?;
    let body_start = segment.body_start();

    let seek_head = read_element_at(io, body_start).await?;
    if seek_head.id != SEEK_HEAD {
        return Err(MkvError::NotSeekHead(seek_head.id));
    }

    let positions = parse_seek_head(io, &seek_head).await?;

    let mut headers = SegmentHeaders::default();

    if let Some(tracks_at) = positions.tracks {
        let tracks = read_element_at(io, body_start + tracks_at).await?;

        if tracks.id == TRACKS {
            let total = tracks.total_size().ok_or(MkvError::MissingElement(TRACKS))?;
            headers.tracks = Some(read_range(io, tracks.offset, total).await?);
        } else {
            warn!(found = ?tracks.id, "SeekHead Tracks position does not point at a Tracks element");
        }
    }

    let end = segment_body_end(io.len(), &segment);
    scan_for_info(io, seek_head.body_start() + seek_head.require_size()?, end, |scale, duration| {
        headers.timecode_scale = scale;
        headers.duration = duration;
    })
    .await?;

    Ok(headers)
}

#[derive(Default)]
struct SeekPositions {
    tracks: Option<u64>,
    cues: Option<u64>,
}

/// Collects the Tracks and Cues positions from a SeekHead. Positions are
/// relative to the start of the Segment body.
async fn parse_seek_head<R: ReadSeek + ?Sized>(
    io: &mut R,
    seek_head: &RawElement,
) -> Result<SeekPositions, MkvError> {
    let mut tracks_id = BytesMut::new();
    encode_id(TRACKS, &mut tracks_id);
    let mut cues_id = BytesMut::new();
    encode_id(CUES, &mut cues_id);

    let mut positions = SeekPositions::default();
    let mut entries = Children::of(seek_head)?;

    while let Some(entry) = entries.next_element(io).await? {
        if entry.id != SEEK {
            continue;
        }

        let mut target_id = None;
        let mut target_pos = None;

        let mut fields = Children::of(&entry)?;
        while let Some(field) = fields.next_element(io).await? {
            let size = field.require_size()?;

            match field.id {
                self::SEEK_ID => {
                    target_id = Some(read_range(io, field.body_start(), size).await?);
                }
                self::SEEK_POSITION => {
                    target_pos = Some(read_uint(io, size).await?);
                }
                _ => {}
            }
        }

        let (Some(id), Some(pos)) = (target_id, target_pos) else {
            continue;
        };

        if id[..] == tracks_id[..] {
            positions.tracks = Some(pos);
        } else if id[..] == cues_id[..] {
            positions.cues = Some(pos);
        }
    }

    Ok(positions)
}

async fn extract_cues<R: ReadSeek + ?Sized>(
    io: &mut R,
    offset: u64,
) -> Result<BTreeMap<u64, u64>, MkvError> {
    let cues = read_element_at(io, offset).await?;
    let mut positions = BTreeMap::new();

    if cues.id != CUES {
        return Ok(positions);
    }

    let mut points = Children::of(&cues)?;

    while let Some(point) = points.next_element(io).await? {
        if point.id != CUE_POINT {
            continue;
        }

        let mut time = None;
        let mut cluster = None;

        let mut fields = Children::of(&point)?;
        while let Some(field) = fields.next_element(io).await? {
            match field.id {
                self::CUE_TIME => {
                    time = Some(read_uint(io, field.require_size()?).await?);
                }
                self::CUE_TRACK_POSITIONS => {
                    let mut inner = Children::of(&field)?;

                    while let Some(entry) = inner.next_element(io).await? {
                        if entry.id == CUE_CLUSTER_POSITION && cluster.is_none() {
                            cluster = Some(read_uint(io, entry.require_size()?).await?);
                        }
                    }
                }
                _ => {}
            }
        }

        if let (Some(time), Some(cluster)) = (time, cluster) {
            positions.insert(time, cluster);
        }
    }

    Ok(positions)
}

fn validate_cues(cues: &BTreeMap<u64, u64>) -> Result<(), MkvError> {
    let mut last = None;

    for (&time, &position) in cues {
        if let Some(previous) = last {
            if position <= previous {
                return Err(MkvError::CuesNotIncreasing(time));
            }
        }

        last = Some(position);
    }

    Ok(())
}

/// Walks Segment children from `start` until the first Cluster, feeding
/// TimecodeScale and Duration to `found` when an Info element turns up.
async fn scan_for_info<R, F>(io: &mut R, start: u64, end: u64, found: F) -> Result<(), MkvError>
where
    R: ReadSeek + ?Sized,
    F: FnOnce(Option<u64>, Option<f64>),
{
    let mut offset = start;

    while offset < end {
        let element = read_element_at(io, offset).await?;

        if element.id == CLUSTER {
            break;
        }

        if element.id == INFO {
            let mut scale = None;
            let mut duration = None;

            let mut fields = Children::of(&element)?;
            while let Some(field) = fields.next_element(io).await? {
                match field.id {
                    self::TIMESTAMP_SCALE => {
                        scale = Some(read_uint(io, field.require_size()?).await?);
                    }
                    self::DURATION => {
                        duration = Some(read_float(io, field.require_size()?).await?);
                    }
                    _ => {}
                }
            }

            found(scale, duration);
            return Ok(());
        }

        offset = element.body_start() + element.require_size()?;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::io::MemoryReader;
    use assert_matches::assert_matches;

    #[test]
    fn cues_must_strictly_increase() {
        let cues = BTreeMap::from([(0, 1000), (2000, 5000), (5000, 5000)]);

        assert_matches!(validate_cues(&cues), Err(MkvError::CuesNotIncreasing(5000)));

        let cues = BTreeMap::from([(0, 1000), (2000, 5000), (5000, 9000)]);

        assert_matches!(validate_cues(&cues), Ok(()));
    }

    #[tokio::test]
    async fn missing_segment() {
        let mut io = MemoryReader::new(Bytes::from_static(&[0xec, 0x81, 0x00]));

        assert_matches!(find_segment(&mut io).await, Err(MkvError::NoSegment));
    }
}

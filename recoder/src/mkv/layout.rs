use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use tracing::debug;

use super::*;
use crate::ebml::{
    create_void, encode_elements, encode_id, encode_size, encode_size_unknown, Element, EbmlError,
};
use crate::mkv::probe::SourceInfo;

/// Padding added to every cue cluster position so the rebuilt header always
/// fits in front of the first cluster.
pub const CUE_OFFSET: u64 = 50_000;

/// The Tracks element is placed at this offset past the start of the Info
/// element, with a Void filling the gap, so the SeekHead can be encoded
/// before the Info size is known.
const TRACKS_ANCHOR: u64 = 100;

const SEGMENT_UID_BYTES: &[u8; 16] = b"1234567890123456";
const APP_NAME: &str = "The Tidal Streamer";

/// The exact byte layout of the rebuilt container: everything before the
/// first cluster, plus the size of every cluster slot.
#[derive(Debug, Clone)]
pub struct Layout {
    /// EBML header, Segment header and the Segment body up to the first
    /// cluster slot.
    pub header: Bytes,
    /// Declared size of the Segment body.
    pub segment_size: u64,
    /// Sizes of the cluster slots, one per cue interval.
    pub cluster_slots: Vec<u64>,
    /// Total size of the virtual file.
    pub total_size: u64,
}

pub fn create_ebml_header() -> Result<Bytes, EbmlError> {
    encode_elements(&[Element::container(
        EBML_HEADER,
        vec![
            Element::uint(EBML_VERSION, 1),
            Element::uint(EBML_READ_VERSION, 1),
            Element::uint(EBML_MAX_ID_LENGTH, 4),
            Element::uint(EBML_MAX_SIZE_LENGTH, 8),
            Element::string(EBML_DOC_TYPE, "matroska"),
            Element::uint(EBML_DOC_TYPE_VERSION, 2),
            Element::uint(EBML_DOC_TYPE_READ_VERSION, 2),
        ],
    )])
}

pub fn create_info_element(timecode_scale: u64, duration: f64) -> Result<Bytes, EbmlError> {
    encode_elements(&[Element::container(
        INFO,
        vec![
            Element::uint(TIMESTAMP_SCALE, timecode_scale),
            Element::unicode(MUXING_APP, APP_NAME),
            Element::unicode(WRITING_APP, APP_NAME),
            Element::float(DURATION, duration),
            Element::date(DATE_UTC, Utc::now().fixed_offset()),
            Element::binary(SEGMENT_UID, Bytes::from_static(SEGMENT_UID_BYTES)),
        ],
    )])
}

/// SeekHead pointing at the Tracks and Cues offsets the composed body will
/// place them at.
fn create_seek_element(info_len: u64, tracks_len: u64) -> Result<Bytes, EbmlError> {
    let positions = [
        (TRACKS, TRACKS_ANCHOR + info_len),
        (CUES, TRACKS_ANCHOR + info_len + tracks_len),
    ];

    let mut entries = Vec::new();
    for (id, position) in positions {
        let mut raw_id = BytesMut::new();
        encode_id(id, &mut raw_id);

        entries.push(Element::container(
            SEEK,
            vec![
                Element::binary(SEEK_ID, raw_id.freeze()),
                Element::uint(SEEK_POSITION, position),
            ],
        ));
    }

    encode_elements(&[Element::container(SEEK_HEAD, entries)])
}

/// Rebuilds the Cues table with `size_offset` added to every cluster
/// position.
pub fn create_cues_element(
    cues: &BTreeMap<u64, u64>,
    size_offset: u64,
) -> Result<Bytes, EbmlError> {
    let points = cues
        .iter()
        .map(|(&time, &position)| {
            Element::container(
                CUE_POINT,
                vec![
                    Element::uint(CUE_TIME, time),
                    Element::container(
                        CUE_TRACK_POSITIONS,
                        vec![
                            Element::uint(CUE_TRACK, 1),
                            Element::uint(CUE_CLUSTER_POSITION, position + size_offset),
                        ],
                    ),
                ],
            )
        })
        .collect();

    encode_elements(&[Element::container(CUES, points)])
}

/// Segment element header with the given body size, or an unknown size for
/// live streams.
pub fn create_segment_header(size: Option<u64>) -> Result<Bytes, EbmlError> {
    let mut out = BytesMut::new();
    encode_id(SEGMENT, &mut out);

    match size {
        Some(size) => encode_size(size, &mut out)?,
        None => encode_size_unknown(&mut out),
    }

    Ok(out.freeze())
}

/// Plans the rebuilt container for a cue-indexed source.
///
/// The Segment body is `SeekHead ‖ Info ‖ Void ‖ Tracks ‖ Cues ‖ Void`
/// followed by one cluster slot per cue interval, the voids padding to the
/// offsets the SeekHead and Cues declare. The declared body size is the
/// source's plus `2 × CUE_OFFSET`, and the final slot runs to the end of
/// the declared body so the emitted file is byte-complete.
pub fn plan(source: &SourceInfo, tracks: &Bytes) -> Result<Layout, MkvError> {
    let timecode_scale = source.timecode_scale.unwrap_or(1_000_000);
    let duration = source.duration.ok_or(MkvError::MissingElement(DURATION))?;

    if source.cues.is_empty() {
        return Err(MkvError::NoCues);
    }

    let info = create_info_element(timecode_scale, duration)?;
    let seek = create_seek_element(info.len() as u64, tracks.len() as u64)?;
    let cues = create_cues_element(&source.cues, CUE_OFFSET)?;

    let mut body = BytesMut::new();
    body.extend_from_slice(&seek);
    body.extend_from_slice(&info);

    let tracks_at = TRACKS_ANCHOR + info.len() as u64;
    let pad = tracks_at
        .checked_sub(body.len() as u64)
        .ok_or(MkvError::HeaderOverflow(body.len() as u64, tracks_at))?;
    body.extend_from_slice(&create_void(pad)?);

    body.extend_from_slice(tracks);
    body.extend_from_slice(&cues);

    let first_cluster = first_cue(source) + CUE_OFFSET;
    let pad = first_cluster
        .checked_sub(body.len() as u64)
        .ok_or(MkvError::HeaderOverflow(body.len() as u64, first_cluster))?;
    body.extend_from_slice(&create_void(pad)?);

    let segment_size = source.segment_size + 2 * CUE_OFFSET;

    let mut header = BytesMut::new();
    header.extend_from_slice(&create_ebml_header()?);
    header.extend_from_slice(&create_segment_header(Some(segment_size))?);
    header.extend_from_slice(&body);

    let cluster_slots = cluster_slots(source, segment_size);
    let total_size = header.len() as u64 + cluster_slots.iter().sum::<u64>();

    debug!(
        header = header.len(),
        segment_size,
        slots = cluster_slots.len(),
        total_size,
        "planned container layout"
    );

    Ok(Layout {
        header: header.freeze(),
        segment_size,
        cluster_slots,
        total_size,
    })
}

/// Header for a live stream: no SeekHead, Cues or padding, and an unknown
/// Segment size. Duration is in timecode units.
pub fn streaming_header(
    timecode_scale: u64,
    duration: f64,
    tracks: &Bytes,
) -> Result<Bytes, MkvError> {
    let info = create_info_element(timecode_scale, duration)?;

    let mut header = BytesMut::new();
    header.extend_from_slice(&create_ebml_header()?);
    header.extend_from_slice(&create_segment_header(None)?);
    header.extend_from_slice(&info);
    header.extend_from_slice(tracks);

    Ok(header.freeze())
}

fn first_cue(source: &SourceInfo) -> u64 {
    source.cues.values().copied().next().unwrap_or(0)
}

/// Contiguous cluster byte ranges between consecutive shifted cue
/// positions; the last slot runs to the end of the declared Segment body.
fn cluster_slots(source: &SourceInfo, segment_size: u64) -> Vec<u64> {
    let mut slots = Vec::new();
    let mut last = None;

    for &position in source.cues.values() {
        let position = position + CUE_OFFSET;

        if let Some(last) = last {
            slots.push(position - last);
        }

        last = Some(position);
    }

    if let Some(last) = last {
        slots.push(segment_size - last);
    }

    slots
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::io::MemoryReader;
    use crate::mkv::probe::probe_source;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    fn source() -> SourceInfo {
        SourceInfo {
            timecode_scale: Some(1_000_000),
            duration: Some(5.0),
            cues: BTreeMap::from([(0, 1000), (2000, 5000), (5000, 9000)]),
            segment_size: 10_000,
        }
    }

    #[test]
    fn plan_layout() {
        let tracks = Bytes::from_static(b"TRK");
        let layout = plan(&source(), &tracks).unwrap();

        assert_eq!(110_000, layout.segment_size);
        assert_eq!(vec![4000, 4000, 51_000], layout.cluster_slots);

        // The header covers the body up to the first shifted cue position.
        let ebml = create_ebml_header().unwrap();
        let segment = create_segment_header(Some(110_000)).unwrap();
        let body_start = ebml.len() + segment.len();

        assert_eq!(body_start + 51_000, layout.header.len());
        assert_eq!(layout.header.len() as u64 + 59_000, layout.total_size);

        // Tracks sits exactly where the SeekHead points.
        let info = create_info_element(1_000_000, 5.0).unwrap();
        let tracks_at = body_start + TRACKS_ANCHOR as usize + info.len();

        assert_eq!(b"TRK", &layout.header[tracks_at..tracks_at + 3]);
    }

    #[tokio::test]
    async fn planned_header_probes_back() {
        let tracks = Bytes::from_static(b"TRK");
        let layout = plan(&source(), &tracks).unwrap();

        let mut io = MemoryReader::new(layout.header.clone());
        let probed = probe_source(&mut io).await.unwrap();

        assert_eq!(Some(1_000_000), probed.timecode_scale);
        assert_eq!(Some(5.0), probed.duration);
        assert_eq!(110_000, probed.segment_size);
        assert_eq!(
            BTreeMap::from([(0, 51_000), (2000, 55_000), (5000, 59_000)]),
            probed.cues
        );
    }

    #[test]
    fn shifted_cues_stay_monotonic() {
        let layout = plan(&source(), &Bytes::from_static(b"TRK")).unwrap();

        for slot in layout.cluster_slots {
            assert!(slot > 0);
        }
    }

    #[test]
    fn plan_requires_duration() {
        let mut source = source();
        source.duration = None;

        assert_matches!(
            plan(&source, &Bytes::new()),
            Err(MkvError::MissingElement(DURATION))
        );
    }

    #[test]
    fn streaming_header_has_unknown_size() {
        let tracks = Bytes::from_static(b"TRK");
        let header = streaming_header(1_000_000, 5_000.0, &tracks).unwrap();

        let ebml = create_ebml_header().unwrap();

        // Segment id followed by the reserved all-ones size.
        assert_eq!(
            &[0x18, 0x53, 0x80, 0x67, 0xff],
            &header[ebml.len()..ebml.len() + 5]
        );
        assert_eq!(b"TRK", &header[header.len() - 3..]);
    }
}

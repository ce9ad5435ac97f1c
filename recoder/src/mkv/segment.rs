use std::path::Path;

use bytes::{Bytes, BytesMut};
use tracing::trace;

use super::probe::{find_segment, segment_body_end};
use super::*;
use crate::ebml::{create_void, read_element_at};
use crate::io::{read_range, FileReader, ReadSeek};

/// Segment files are named `output-NNNNN.mkv`; the zero padding keeps the
/// lexicographic directory order equal to the numeric order.
pub fn segment_file_name(id: u64) -> String {
    format!("output-{id:05}.mkv")
}

pub fn parse_segment_file_name(name: &str) -> Option<u64> {
    let stem = name.split('.').next()?;

    stem.split('-').nth(1)?.parse().ok()
}

/// Extracts the raw bytes of every Cluster in the file's Segment and pads
/// the result with a Void so it exactly fills `expected_size` bytes, the
/// cluster slot the planned container reserved for it.
pub async fn wrap_segment(path: &Path, expected_size: u64) -> Result<Bytes, MkvError> {
    let mut io = FileReader::open(path).await?;

    wrap_clusters(&mut io, expected_size).await
}

pub async fn wrap_clusters<R: ReadSeek + ?Sized>(
    io: &mut R,
    expected_size: u64,
) -> Result<Bytes, MkvError> {
    let segment = find_segment(io).await?;
    let end = segment_body_end(io.len(), &segment);

    let mut out = BytesMut::with_capacity(expected_size as usize);
    let mut offset = segment.body_start();

    while offset < end {
        let element = read_element_at(io, offset).await?;
        let total = element.total_size().ok_or(MkvError::MissingElement(element.id))?;

        if element.id == CLUSTER {
            out.extend_from_slice(&read_range(io, element.offset, total).await?);
        }

        offset = element.offset + total;
    }

    let len = out.len() as u64;

    if len > expected_size {
        return Err(MkvError::SlotOverflow(len, expected_size));
    }

    let padding = expected_size - len;

    if padding > 0 {
        out.extend_from_slice(&create_void(padding)?);
    }

    trace!(clusters = len, padding, "wrapped segment");

    Ok(out.freeze())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ebml::{encode_elements, EbmlId, Element, RawElement, VOID};
    use crate::io::MemoryReader;
    use crate::mkv::layout::create_ebml_header;
    use assert_matches::assert_matches;
    use test_case::test_case;

    #[test_case("output-00000.mkv", Some(0))]
    #[test_case("output-00123.mkv", Some(123))]
    #[test_case("output-99999.mkv", Some(99999))]
    #[test_case("output.mkv", None)]
    #[test_case("output-abc.mkv", None)]
    #[test_case(".nfs000001", None)]
    fn file_names(name: &str, expected: Option<u64>) {
        assert_eq!(expected, parse_segment_file_name(name));
    }

    #[test]
    fn file_name_round_trip() {
        for id in [0, 1, 42, 12345] {
            assert_eq!(Some(id), parse_segment_file_name(&segment_file_name(id)));
        }
    }

    /// A cluster element whose total encoded size is exactly `total` bytes.
    fn cluster(total: usize) -> Element {
        // 4 byte id, 2 byte size field.
        Element::binary(CLUSTER, Bytes::from(vec![0xaa; total - 6]))
    }

    fn segment_file(children: Vec<Element>) -> Bytes {
        let mut data = BytesMut::new();
        data.extend_from_slice(&create_ebml_header().unwrap());
        data.extend_from_slice(&encode_elements(&[Element::container(SEGMENT, children)]).unwrap());

        data.freeze()
    }

    #[tokio::test]
    async fn wrap_pads_to_expected_size() {
        let file = segment_file(vec![
            Element::container(INFO, vec![Element::uint(TIMESTAMP_SCALE, 1_000_000)]),
            cluster(500),
            cluster(300),
        ]);

        let mut io = MemoryReader::new(file);
        let wrapped = wrap_clusters(&mut io, 1000).await.unwrap();

        assert_eq!(1000, wrapped.len());

        // The clusters are carried over byte for byte, headers included.
        let clusters = encode_elements(&[cluster(500), cluster(300)]).unwrap();
        assert_eq!(clusters, wrapped.slice(..800));

        // The tail is one valid Void of 200 bytes.
        let mut padded = MemoryReader::new(wrapped);
        let void = read_element_at(&mut padded, 800).await.unwrap();

        assert_matches!(
            void,
            RawElement {
                id: VOID,
                size: Some(size),
                ..
            } if void.header_len + size == 200
        );
    }

    #[tokio::test]
    async fn wrap_skips_non_cluster_elements() {
        let file = segment_file(vec![Element::container(
            INFO,
            vec![Element::uint(TIMESTAMP_SCALE, 1_000_000)],
        )]);

        let mut io = MemoryReader::new(file);
        let wrapped = wrap_clusters(&mut io, 100).await.unwrap();

        assert_eq!(100, wrapped.len());

        let mut padded = MemoryReader::new(wrapped);
        let void = read_element_at(&mut padded, 0).await.unwrap();

        assert_eq!(EbmlId(0xec), void.id);
    }

    #[tokio::test]
    async fn wrap_rejects_overflowing_clusters() {
        let file = segment_file(vec![cluster(500)]);

        let mut io = MemoryReader::new(file);

        assert_matches!(
            wrap_clusters(&mut io, 400).await,
            Err(MkvError::SlotOverflow(500, 400))
        );
    }
}

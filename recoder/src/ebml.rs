use bytes::{Bytes, BytesMut};
use chrono::{DateTime, FixedOffset, TimeZone, Utc};

use crate::io::{IoError, ReadSeek};

/// The Void element id is an EBML global and may appear inside any
/// container.
pub const VOID: EbmlId = EbmlId(0xec);

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EbmlId(pub u32);

impl std::fmt::Debug for EbmlId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "EbmlId(0x{:x})", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EbmlError {
    #[error("Unsupported VINT length {0}")]
    UnsupportedVint(u64),

    #[error("Unsupported element id length {0}")]
    UnsupportedVid(u8),

    #[error("Invalid float size {0}")]
    InvalidFloatSize(u64),

    #[error("Cannot encode a date with any length other than 8 bytes, got {0}")]
    InvalidDateSize(u64),

    #[error("Date is out of the representable nanosecond range")]
    DateOutOfRange,

    #[error("A Void element cannot occupy {0} bytes")]
    InvalidVoidSize(u64),

    #[error("Value {value} does not fit in a {length} byte size field")]
    SizeTooLarge { value: u64, length: u8 },

    #[error("Element {0:?} has an unknown size where a sized element is required")]
    UnknownSize(EbmlId),

    #[error("{0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("{0}")]
    Io(#[from] IoError),
}

async fn read_byte<R: ReadSeek + ?Sized>(io: &mut R) -> Result<u8, EbmlError> {
    let mut byte = [0u8; 1];
    io.read_exact(&mut byte).await?;

    Ok(byte[0])
}

/// Reads a variable-length integer, returning `(length, value)` with the
/// length marker stripped from the value.
pub async fn read_vint<R: ReadSeek + ?Sized>(io: &mut R) -> Result<(u8, u64), EbmlError> {
    let byte = read_byte(io).await?;
    let extra_bytes = byte.leading_zeros() as u8;
    let len = 1 + extra_bytes as usize;

    if extra_bytes > 7 {
        return Err(EbmlError::UnsupportedVint(extra_bytes as u64));
    }

    let mut bytes = [0u8; 7];
    if extra_bytes > 0 {
        io.read_exact(&mut bytes[..extra_bytes as usize]).await?;
    }

    let mut value = byte as u64 & ((1 << (8 - len)) - 1) as u64;

    for i in 0..extra_bytes {
        value <<= 8;
        value |= bytes[i as usize] as u64;
    }

    Ok((len as u8, value))
}

/// Reads an element size field. An all-ones VINT means the element size is
/// unknown and yields `None`.
pub async fn read_size<R: ReadSeek + ?Sized>(io: &mut R) -> Result<(u8, Option<u64>), EbmlError> {
    let (len, value) = read_vint(io).await?;

    if value == (1u64 << (7 * len)) - 1 {
        Ok((len, None))
    } else {
        Ok((len, Some(value)))
    }
}

/// Reads an element id. Unlike [read_vint] the marker bits are kept, so the
/// value compares directly against the id constants.
pub async fn read_vid<R: ReadSeek + ?Sized>(io: &mut R) -> Result<(u8, EbmlId), EbmlError> {
    let byte = read_byte(io).await?;
    let extra_bytes = byte.leading_zeros() as u8;

    if extra_bytes > 3 {
        return Err(EbmlError::UnsupportedVid(extra_bytes));
    }

    let mut bytes = [0u8; 3];
    if extra_bytes > 0 {
        io.read_exact(&mut bytes[..extra_bytes as usize]).await?;
    }

    let mut value = byte as u32;

    for i in 0..extra_bytes {
        value <<= 8;
        value |= bytes[i as usize] as u32;
    }

    Ok((1 + extra_bytes, EbmlId(value)))
}

pub async fn read_uint<R: ReadSeek + ?Sized>(io: &mut R, size: u64) -> Result<u64, EbmlError> {
    if size > 8 {
        return Err(EbmlError::UnsupportedVint(size));
    }

    let mut data = [0u8; 8];
    io.read_exact(&mut data[..size as usize]).await?;

    let mut value = 0u64;
    for i in 0..size {
        value <<= 8;
        value |= data[i as usize] as u64;
    }

    Ok(value)
}

pub async fn read_int<R: ReadSeek + ?Sized>(io: &mut R, size: u64) -> Result<i64, EbmlError> {
    if size == 0 {
        return Ok(0);
    }

    let value = read_uint(io, size).await?;
    let shift = 64 - 8 * size as u32;

    Ok(((value << shift) as i64) >> shift)
}

pub async fn read_float<R: ReadSeek + ?Sized>(io: &mut R, size: u64) -> Result<f64, EbmlError> {
    let mut data = [0u8; 8];

    let value = match size {
        0 => 0.0,
        4 => {
            io.read_exact(&mut data[..4]).await?;

            f32::from_be_bytes(data[..4].try_into().unwrap()) as f64
        }
        8 => {
            io.read_exact(&mut data[..8]).await?;

            f64::from_be_bytes(data)
        }
        _ => return Err(EbmlError::InvalidFloatSize(size)),
    };

    Ok(value)
}

pub async fn read_string<R: ReadSeek + ?Sized>(io: &mut R, size: u64) -> Result<String, EbmlError> {
    let mut data = vec![0u8; size as usize];

    io.read_exact(&mut data).await?;

    Ok(String::from_utf8(data)?)
}

/// A parsed element header. The body occupies
/// `[body_start(), body_start() + size)` of the underlying stream.
#[derive(Debug, Clone, Copy)]
pub struct RawElement {
    pub id: EbmlId,
    pub offset: u64,
    pub header_len: u64,
    pub size: Option<u64>,
}

impl RawElement {
    pub fn body_start(&self) -> u64 {
        self.offset + self.header_len
    }

    pub fn total_size(&self) -> Option<u64> {
        self.size.map(|size| self.header_len + size)
    }

    pub fn require_size(&self) -> Result<u64, EbmlError> {
        self.size.ok_or(EbmlError::UnknownSize(self.id))
    }
}

/// Reads the element header at `offset`, leaving the cursor at the start of
/// the element body.
pub async fn read_element_at<R: ReadSeek + ?Sized>(
    io: &mut R,
    offset: u64,
) -> Result<RawElement, EbmlError> {
    io.seek(offset).await?;

    let (id_len, id) = read_vid(io).await?;
    let (size_len, size) = read_size(io).await?;

    Ok(RawElement {
        id,
        offset,
        header_len: (id_len + size_len) as u64,
        size,
    })
}

/// Cursor over the children of a container body range.
pub struct Children {
    next: u64,
    end: u64,
}

impl Children {
    pub fn new(start: u64, end: u64) -> Self {
        Children { next: start, end }
    }

    pub fn of(parent: &RawElement) -> Result<Self, EbmlError> {
        let size = parent.require_size()?;

        Ok(Children::new(parent.body_start(), parent.body_start() + size))
    }

    /// Yields the next child, leaving the cursor at its body start.
    pub async fn next_element<R: ReadSeek + ?Sized>(
        &mut self,
        io: &mut R,
    ) -> Result<Option<RawElement>, EbmlError> {
        if self.next >= self.end {
            return Ok(None);
        }

        let element = read_element_at(io, self.next).await?;
        self.next = element.body_start() + element.require_size()?;

        Ok(Some(element))
    }
}

fn id_length(id: EbmlId) -> usize {
    match id.0 {
        0..=0xff => 1,
        0x100..=0xffff => 2,
        0x1_0000..=0xff_ffff => 3,
        _ => 4,
    }
}

pub fn encode_id(id: EbmlId, out: &mut BytesMut) {
    let len = id_length(id);

    out.extend_from_slice(&id.0.to_be_bytes()[4 - len..]);
}

/// Encodes a size field in exactly `length` bytes.
pub fn encode_size_with_length(
    value: u64,
    length: u8,
    out: &mut BytesMut,
) -> Result<(), EbmlError> {
    if length == 0 || length > 8 || value >= (1u64 << (7 * length)) - 1 {
        return Err(EbmlError::SizeTooLarge { value, length });
    }

    let encoded = (1u64 << (7 * length)) | value;

    out.extend_from_slice(&encoded.to_be_bytes()[8 - length as usize..]);

    Ok(())
}

/// Encodes a size field in the minimal number of bytes.
pub fn encode_size(value: u64, out: &mut BytesMut) -> Result<(), EbmlError> {
    for length in 1..=8u8 {
        if value < (1u64 << (7 * length)) - 1 {
            return encode_size_with_length(value, length, out);
        }
    }

    Err(EbmlError::SizeTooLarge { value, length: 8 })
}

/// Encodes the reserved all-ones VINT marking an unknown element size.
pub fn encode_size_unknown(out: &mut BytesMut) {
    out.extend_from_slice(&[0xff]);
}

pub fn encode_uint(value: u64) -> Bytes {
    let len = (((64 - value.leading_zeros()) + 7) / 8).max(1) as usize;

    Bytes::copy_from_slice(&value.to_be_bytes()[8 - len..])
}

pub fn encode_int(value: i64) -> Bytes {
    let mut len = 8;

    while len > 1 {
        let shift = 64 - 8 * (len - 1) as u32;

        if ((value << shift) >> shift) != value {
            break;
        }

        len -= 1;
    }

    Bytes::copy_from_slice(&value.to_be_bytes()[8 - len..])
}

pub fn encode_float(value: f64) -> Bytes {
    Bytes::copy_from_slice(&value.to_be_bytes())
}

/// Encodes a date as nanoseconds since 2001-01-01 UTC in 8 bytes. Values
/// carrying a UTC offset are normalised to UTC first. Any explicit length
/// other than 8 is unrepresentable.
pub fn encode_date(
    date: Option<DateTime<FixedOffset>>,
    length: Option<u64>,
) -> Result<Bytes, EbmlError> {
    let date = match date {
        Some(date) => date.with_timezone(&Utc),
        None => Utc::now(),
    };

    match length {
        None | Some(8) => {}
        Some(other) => return Err(EbmlError::InvalidDateSize(other)),
    }

    let epoch = Utc.with_ymd_and_hms(2001, 1, 1, 0, 0, 0).unwrap();
    let nanoseconds = date
        .signed_duration_since(epoch)
        .num_nanoseconds()
        .ok_or(EbmlError::DateOutOfRange)?;

    Ok(Bytes::copy_from_slice(&nanoseconds.to_be_bytes()))
}

#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Unicode(String),
    Date(DateTime<FixedOffset>),
    Binary(Bytes),
    Container(Vec<Element>),
}

#[derive(Debug, Clone)]
pub struct Element {
    pub id: EbmlId,
    pub value: Value,
}

impl Element {
    pub fn uint(id: EbmlId, value: u64) -> Self {
        Element {
            id,
            value: Value::UInt(value),
        }
    }

    pub fn float(id: EbmlId, value: f64) -> Self {
        Element {
            id,
            value: Value::Float(value),
        }
    }

    pub fn string(id: EbmlId, value: &str) -> Self {
        Element {
            id,
            value: Value::String(value.to_string()),
        }
    }

    pub fn unicode(id: EbmlId, value: &str) -> Self {
        Element {
            id,
            value: Value::Unicode(value.to_string()),
        }
    }

    pub fn date(id: EbmlId, value: DateTime<FixedOffset>) -> Self {
        Element {
            id,
            value: Value::Date(value),
        }
    }

    pub fn binary(id: EbmlId, value: Bytes) -> Self {
        Element {
            id,
            value: Value::Binary(value),
        }
    }

    pub fn container(id: EbmlId, children: Vec<Element>) -> Self {
        Element {
            id,
            value: Value::Container(children),
        }
    }
}

pub fn encode_element(element: &Element, out: &mut BytesMut) -> Result<(), EbmlError> {
    let payload = match &element.value {
        Value::Int(value) => encode_int(*value),
        Value::UInt(value) => encode_uint(*value),
        Value::Float(value) => encode_float(*value),
        Value::String(value) => Bytes::copy_from_slice(value.as_bytes()),
        Value::Unicode(value) => Bytes::copy_from_slice(value.as_bytes()),
        Value::Date(value) => encode_date(Some(*value), None)?,
        Value::Binary(value) => value.clone(),
        Value::Container(children) => encode_elements(children)?,
    };

    encode_id(element.id, out);
    encode_size(payload.len() as u64, out)?;
    out.extend_from_slice(&payload);

    Ok(())
}

/// Encodes a caller-supplied element tree. Child order is preserved, which
/// the layout planner relies on to reproduce exact header bytes.
pub fn encode_elements(elements: &[Element]) -> Result<Bytes, EbmlError> {
    let mut out = BytesMut::new();

    for element in elements {
        encode_element(element, &mut out)?;
    }

    Ok(out.freeze())
}

/// Produces a Void element occupying exactly `size` bytes, id and size
/// prefix included.
///
/// 129 and 16131 byte voids cannot be expressed with a single element, a
/// one byte longer size field would overshoot, so those two lengths are
/// filled with two concatenated voids.
pub fn create_void(size: u64) -> Result<Bytes, EbmlError> {
    if size < 2 {
        return Err(EbmlError::InvalidVoidSize(size));
    }

    if size == 129 {
        return Ok(concat_voids(100, 29)?);
    }

    if size == 16131 {
        return Ok(concat_voids(10000, 6131)?);
    }

    let prefix: u64 = if size >= 2_031_621 {
        5
    } else if size >= 16_132 {
        4
    } else if size >= 130 {
        3
    } else {
        2
    };

    let mut out = BytesMut::with_capacity(size as usize);
    encode_id(VOID, &mut out);
    encode_size_with_length(size - prefix, prefix as u8 - 1, &mut out)?;
    out.resize(size as usize, 0);

    Ok(out.freeze())
}

fn concat_voids(first: u64, second: u64) -> Result<Bytes, EbmlError> {
    let mut out = BytesMut::new();
    out.extend_from_slice(&create_void(first)?);
    out.extend_from_slice(&create_void(second)?);

    Ok(out.freeze())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::io::MemoryReader;
    use assert_matches::assert_matches;
    use test_case::test_case;

    #[test_case(&[0b1000_0010], 2)]
    #[test_case(&[0b0100_0000, 0b0000_0010], 2)]
    #[test_case(&[0b0010_0000, 0b0000_0000, 0b0000_0010], 2)]
    #[test_case(&[0b0001_0000, 0b0000_0000, 0b0000_0000, 0b0000_0010], 2)]
    #[tokio::test]
    async fn vint(bytes: &[u8], expected: u64) {
        let mut io = MemoryReader::new(Bytes::copy_from_slice(bytes));

        let value = read_vint(&mut io).await;

        assert_matches!(value, Ok((_, v)) if v == expected);
    }

    #[tokio::test]
    async fn read_write_size() {
        for i in (0..100_000u64).step_by(17) {
            let mut buf = BytesMut::new();
            encode_size(i, &mut buf).unwrap();

            let mut io = MemoryReader::new(buf.freeze());
            let (_len, value) = read_size(&mut io).await.unwrap();

            assert_eq!(Some(i), value);
        }
    }

    #[tokio::test]
    async fn unknown_size() {
        let mut io = MemoryReader::new(Bytes::from_static(&[0xff]));

        let (len, value) = read_size(&mut io).await.unwrap();

        assert_eq!(1, len);
        assert_eq!(None, value);
    }

    #[test_case(&[0xec], 0xec, 1)]
    #[test_case(&[0x42, 0x82], 0x4282, 2)]
    #[test_case(&[0x1a, 0x45, 0xdf, 0xa3], 0x1a45dfa3, 4)]
    #[tokio::test]
    async fn vid(bytes: &[u8], expected: u32, expected_len: u8) {
        let mut io = MemoryReader::new(Bytes::copy_from_slice(bytes));

        let (len, id) = read_vid(&mut io).await.unwrap();

        assert_eq!(expected_len, len);
        assert_eq!(EbmlId(expected), id);
    }

    #[test_case(0, &[0x00])]
    #[test_case(1, &[0x01])]
    #[test_case(0x100, &[0x01, 0x00])]
    #[test_case(1_000_000, &[0x0f, 0x42, 0x40])]
    fn uint_encoding(value: u64, expected: &[u8]) {
        assert_eq!(expected, &encode_uint(value)[..]);
    }

    #[tokio::test]
    async fn float_round_trip() {
        for value in [0.0, 5.0, -1.25, 1325.048] {
            let mut io = MemoryReader::new(encode_float(value));

            assert_eq!(value, read_float(&mut io, 8).await.unwrap());
        }

        let mut io = MemoryReader::new(Bytes::copy_from_slice(&2.5f32.to_be_bytes()));
        assert_eq!(2.5, read_float(&mut io, 4).await.unwrap());

        let mut io = MemoryReader::new(Bytes::new());
        assert_matches!(read_float(&mut io, 3).await, Err(EbmlError::InvalidFloatSize(3)));
    }

    #[tokio::test]
    async fn string_reading() {
        let mut io = MemoryReader::new(Bytes::from_static(b"matroska"));

        assert_eq!("matroska", read_string(&mut io, 8).await.unwrap());
    }

    #[test_case(0, &[0x00])]
    #[test_case(-1, &[0xff])]
    #[test_case(-129, &[0xff, 0x7f])]
    #[test_case(127, &[0x7f])]
    #[test_case(128, &[0x00, 0x80])]
    fn int_encoding(value: i64, expected: &[u8]) {
        assert_eq!(expected, &encode_int(value)[..]);
    }

    #[tokio::test]
    async fn int_round_trip() {
        for value in [0i64, 1, -1, 127, -128, 300, -300, i64::MAX, i64::MIN] {
            let encoded = encode_int(value);
            let len = encoded.len() as u64;

            let mut io = MemoryReader::new(encoded);

            assert_eq!(value, read_int(&mut io, len).await.unwrap());
        }
    }

    #[test]
    fn void_occupies_exact_size() {
        for size in (2..=300u64).chain([1000, 16130, 16131, 16132, 100_000, 2_031_620, 2_031_621])
        {
            let void = create_void(size).unwrap();

            assert_eq!(size as usize, void.len(), "void of size {size}");
            assert_eq!(0xec, void[0]);
        }
    }

    #[test]
    fn void_boundary_splits_in_two() {
        let void = create_void(129).unwrap();

        let mut expected = BytesMut::new();
        expected.extend_from_slice(&create_void(100).unwrap());
        expected.extend_from_slice(&create_void(29).unwrap());

        assert_eq!(expected.freeze(), void);
        assert_eq!(129, void.len());
    }

    #[test]
    fn void_too_small() {
        assert_matches!(create_void(1), Err(EbmlError::InvalidVoidSize(1)));
    }

    #[test]
    fn date_is_nanoseconds_since_2001() {
        let date = Utc
            .with_ymd_and_hms(2001, 1, 1, 0, 0, 1)
            .unwrap()
            .fixed_offset();

        let encoded = encode_date(Some(date), None).unwrap();

        assert_eq!(&1_000_000_000i64.to_be_bytes()[..], &encoded[..]);
    }

    #[test]
    fn date_normalises_offsets_to_utc() {
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        let local = offset.with_ymd_and_hms(2001, 1, 1, 2, 0, 1).unwrap();

        let encoded = encode_date(Some(local), None).unwrap();

        assert_eq!(&1_000_000_000i64.to_be_bytes()[..], &encoded[..]);
    }

    #[test]
    fn date_rejects_other_lengths() {
        assert_matches!(
            encode_date(None, Some(4)),
            Err(EbmlError::InvalidDateSize(4))
        );
    }

    #[test]
    fn container_encoding() {
        let tree = Element::container(EbmlId(0xe0), vec![Element::uint(EbmlId(0xd7), 1)]);

        let encoded = encode_elements(&[tree]).unwrap();

        assert_eq!(&[0xe0, 0x83, 0xd7, 0x81, 0x01], &encoded[..]);
    }

    #[tokio::test]
    async fn children_iteration() {
        let encoded = encode_elements(&[Element::container(
            EbmlId(0xe0),
            vec![Element::uint(EbmlId(0xd7), 1), Element::uint(EbmlId(0x83), 2)],
        )])
        .unwrap();

        let mut io = MemoryReader::new(encoded);

        let parent = read_element_at(&mut io, 0).await.unwrap();
        assert_eq!(EbmlId(0xe0), parent.id);

        let mut children = Children::of(&parent).unwrap();

        let first = children.next_element(&mut io).await.unwrap().unwrap();
        assert_eq!(EbmlId(0xd7), first.id);
        assert_eq!(1, read_uint(&mut io, first.size.unwrap()).await.unwrap());

        let second = children.next_element(&mut io).await.unwrap().unwrap();
        assert_eq!(EbmlId(0x83), second.id);
        assert_eq!(2, read_uint(&mut io, second.size.unwrap()).await.unwrap());

        assert_matches!(children.next_element(&mut io).await, Ok(None));
    }
}

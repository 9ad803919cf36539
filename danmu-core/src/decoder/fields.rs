//! Schema-less protobuf walking.
//!
//! A [`FieldTree`] keeps every `(field number, value)` pair of one message
//! level in wire order. Length-delimited values stay raw until an accessor
//! asks for them as a string or as a nested tree, because the wire format
//! does not say which they are.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::encoding::{decode_key, decode_varint, encode_key, encode_varint, WireType};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FieldError {
    #[error("Malformed field: {0}")]
    Malformed(String),

    #[error("Field {field} declares {declared} bytes, {remaining} remain")]
    Overrun {
        field: u32,
        declared: usize,
        remaining: usize,
    },

    #[error("Unsupported wire type {wire_type:?} on field {field}")]
    UnsupportedWireType { field: u32, wire_type: WireType },
}

impl From<prost::DecodeError> for FieldError {
    fn from(err: prost::DecodeError) -> Self {
        Self::Malformed(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Varint(u64),
    Fixed64(u64),
    Fixed32(u32),
    Bytes(Bytes),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldTree {
    fields: Vec<(u32, FieldValue)>,
}

impl FieldTree {
    /// Parse one message level.
    pub fn parse(data: Bytes) -> Result<Self, FieldError> {
        let mut buf = data;
        let mut fields = Vec::new();

        while buf.has_remaining() {
            let (field, wire_type) = decode_key(&mut buf)?;
            let value = match wire_type {
                WireType::Varint => FieldValue::Varint(decode_varint(&mut buf)?),
                WireType::SixtyFourBit => {
                    ensure_remaining(&buf, field, 8)?;
                    FieldValue::Fixed64(buf.get_u64_le())
                }
                WireType::ThirtyTwoBit => {
                    ensure_remaining(&buf, field, 4)?;
                    FieldValue::Fixed32(buf.get_u32_le())
                }
                WireType::LengthDelimited => {
                    let declared = usize::try_from(decode_varint(&mut buf)?)
                        .map_err(|_| FieldError::Malformed("length overflows usize".into()))?;
                    ensure_remaining(&buf, field, declared)?;
                    FieldValue::Bytes(buf.split_to(declared))
                }
                WireType::StartGroup | WireType::EndGroup => {
                    return Err(FieldError::UnsupportedWireType { field, wire_type });
                }
            };
            fields.push((field, value));
        }

        Ok(Self { fields })
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Last occurrence wins, as for protobuf scalars.
    pub fn get(&self, field: u32) -> Option<&FieldValue> {
        self.fields
            .iter()
            .rev()
            .find_map(|(number, value)| (*number == field).then_some(value))
    }

    /// Every occurrence, in wire order.
    pub fn all(&self, field: u32) -> impl Iterator<Item = &FieldValue> + '_ {
        self.fields
            .iter()
            .filter(move |(number, _)| *number == field)
            .map(|(_, value)| value)
    }

    pub fn uint(&self, field: u32) -> Option<u64> {
        match self.get(field)? {
            FieldValue::Varint(v) | FieldValue::Fixed64(v) => Some(*v),
            FieldValue::Fixed32(v) => Some(u64::from(*v)),
            FieldValue::Bytes(_) => None,
        }
    }

    pub fn uint_or_default(&self, field: u32) -> u64 {
        self.uint(field).unwrap_or_default()
    }

    pub fn bytes(&self, field: u32) -> Option<&Bytes> {
        match self.get(field)? {
            FieldValue::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// The field as UTF-8 text. Invalid UTF-8 yields `None`.
    pub fn string(&self, field: u32) -> Option<String> {
        self.bytes(field)
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
            .map(str::to_owned)
    }

    pub fn string_or_default(&self, field: u32) -> String {
        self.string(field).unwrap_or_default()
    }

    /// The field parsed as a nested message.
    pub fn tree(&self, field: u32) -> Option<Self> {
        self.bytes(field).and_then(|bytes| Self::parse(bytes.clone()).ok())
    }

    /// Every occurrence of a repeated message field that parses, in order.
    pub fn trees(&self, field: u32) -> Vec<Self> {
        self.all(field)
            .filter_map(|value| match value {
                FieldValue::Bytes(bytes) => match Self::parse(bytes.clone()) {
                    Ok(tree) => Some(tree),
                    Err(e) => {
                        tracing::trace!(field, error = %e, "skipping unparseable repeated item");
                        None
                    }
                },
                _ => None,
            })
            .collect()
    }
}

fn ensure_remaining(buf: &Bytes, field: u32, declared: usize) -> Result<(), FieldError> {
    if buf.remaining() < declared {
        return Err(FieldError::Overrun {
            field,
            declared,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

/// Builds schema-less protobuf, mirroring what [`FieldTree`] reads.
#[derive(Debug, Default)]
pub struct FieldWriter {
    buf: BytesMut,
}

impl FieldWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn uint(mut self, field: u32, value: u64) -> Self {
        encode_key(field, WireType::Varint, &mut self.buf);
        encode_varint(value, &mut self.buf);
        self
    }

    #[must_use]
    pub fn bytes(mut self, field: u32, value: &[u8]) -> Self {
        encode_key(field, WireType::LengthDelimited, &mut self.buf);
        encode_varint(value.len() as u64, &mut self.buf);
        self.buf.put_slice(value);
        self
    }

    #[must_use]
    pub fn string(self, field: u32, value: &str) -> Self {
        self.bytes(field, value.as_bytes())
    }

    #[must_use]
    pub fn message(self, field: u32, value: Self) -> Self {
        let nested = value.finish();
        self.bytes(field, &nested)
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A captured live comment frame.
    const COMMENT_FRAME: &str = "08b60210011a540a0433333039120739382e35e4b8872a4312220a0f337866686138786e70787773636a67120fe6809de5a6b9e5a6b9e5be88e985b71a0f4b504ce586b2e586b2e586b2efbc8122083836504b46773d3d38014200208691a1d0bf33";

    fn comment_frame() -> Bytes {
        Bytes::from(hex::decode(COMMENT_FRAME).unwrap())
    }

    #[test]
    fn test_walk_captured_frame() {
        let outer = FieldTree::parse(comment_frame()).unwrap();
        assert_eq!(outer.uint(1), Some(310));
        assert_eq!(outer.uint(2), Some(1));
        assert_eq!(outer.uint(4), Some(1_769_426_405_510));

        let feed = outer.tree(3).unwrap();
        assert_eq!(feed.string(1).as_deref(), Some("3309"));
        assert_eq!(feed.string(2).as_deref(), Some("98.5万"));

        let items = feed.trees(5);
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.uint(7), Some(1));
        assert_eq!(item.string(3).as_deref(), Some("KPL冲冲冲！"));

        let user = item.tree(2).unwrap();
        assert_eq!(user.string(1).as_deref(), Some("3xfha8xnpxwscjg"));
        assert_eq!(user.string(2).as_deref(), Some("思妹妹很酷"));
    }

    #[test]
    fn test_absent_fields_default() {
        let tree = FieldTree::parse(FieldWriter::new().uint(1, 5).finish()).unwrap();
        assert_eq!(tree.uint(2), None);
        assert_eq!(tree.uint_or_default(2), 0);
        assert_eq!(tree.string_or_default(3), "");
        assert!(tree.tree(4).is_none());
        assert!(tree.trees(5).is_empty());
    }

    #[test]
    fn test_repeated_items_keep_order() {
        let data = FieldWriter::new()
            .message(5, FieldWriter::new().string(3, "first"))
            .message(5, FieldWriter::new().string(3, "second"))
            .uint(5, 9)
            .message(5, FieldWriter::new().string(3, "third"))
            .finish();

        let tree = FieldTree::parse(data).unwrap();
        let contents: Vec<_> = tree
            .trees(5)
            .iter()
            .map(|item| item.string_or_default(3))
            .collect();
        assert_eq!(contents, ["first", "second", "third"]);
    }

    #[test]
    fn test_last_scalar_wins() {
        let tree = FieldTree::parse(FieldWriter::new().uint(1, 1).uint(1, 2).finish()).unwrap();
        assert_eq!(tree.uint(1), Some(2));
        assert_eq!(tree.all(1).count(), 2);
    }

    #[test]
    fn test_truncated_input_is_an_error() {
        let data = comment_frame();
        for cut in [2, 4, 20, data.len() - 1] {
            assert!(
                FieldTree::parse(data.slice(..cut)).is_err(),
                "cut at {cut} should fail"
            );
        }
    }

    #[test]
    fn test_overrun_reports_lengths() {
        // field 3, length-delimited, declares 10 bytes but only 2 follow
        let err = FieldTree::parse(Bytes::from_static(&[0x1a, 0x0a, 0x01, 0x02])).unwrap_err();
        assert_eq!(
            err,
            FieldError::Overrun {
                field: 3,
                declared: 10,
                remaining: 2
            }
        );
    }

    #[test]
    fn test_invalid_utf8_is_not_a_string() {
        let tree = FieldTree::parse(FieldWriter::new().bytes(1, &[0xff, 0xfe]).finish()).unwrap();
        assert!(tree.string(1).is_none());
        assert_eq!(tree.bytes(1).map(Bytes::len), Some(2));
    }
}

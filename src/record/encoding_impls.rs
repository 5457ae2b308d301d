//! Scheme persistence — `encoding` trait implementations.
//!
//! The scheme file stores the field layout so it can be validated on
//! reopen. Enums use the `[u32 variant]` convention of [`crate::encoding`].

use crate::encoding::{self, Decode, Encode, EncodingError};

use super::{FieldDesc, FieldKind, Scheme, SortOrder};

impl Encode for FieldKind {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let tag: u32 = match self {
            FieldKind::String => 0,
            FieldKind::U8 => 1,
            FieldKind::U16 => 2,
            FieldKind::U32 => 3,
            FieldKind::U64 => 4,
            FieldKind::I64 => 5,
        };
        tag.encode_to(buf)
    }
}

impl Decode for FieldKind {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, n) = u32::decode_from(buf)?;
        let kind = match tag {
            0 => FieldKind::String,
            1 => FieldKind::U8,
            2 => FieldKind::U16,
            3 => FieldKind::U32,
            4 => FieldKind::U64,
            5 => FieldKind::I64,
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: other,
                    type_name: "FieldKind",
                });
            }
        };
        Ok((kind, n))
    }
}

impl Encode for SortOrder {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let tag: u32 = match self {
            SortOrder::Asc => 0,
            SortOrder::Desc => 1,
        };
        tag.encode_to(buf)
    }
}

impl Decode for SortOrder {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, n) = u32::decode_from(buf)?;
        let order = match tag {
            0 => SortOrder::Asc,
            1 => SortOrder::Desc,
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: other,
                    type_name: "SortOrder",
                });
            }
        };
        Ok((order, n))
    }
}

impl Encode for FieldDesc {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.name.encode_to(buf)?;
        self.kind.encode_to(buf)?;
        self.order.encode_to(buf)?;
        self.key.encode_to(buf)?;
        self.timestamp.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for FieldDesc {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (name, n) = String::decode_from(&buf[off..])?;
        off += n;
        let (kind, n) = FieldKind::decode_from(&buf[off..])?;
        off += n;
        let (order, n) = SortOrder::decode_from(&buf[off..])?;
        off += n;
        let (key, n) = Option::<u32>::decode_from(&buf[off..])?;
        off += n;
        let (timestamp, n) = bool::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                name,
                kind,
                order,
                key,
                timestamp,
            },
            off,
        ))
    }
}

impl Scheme {
    /// Serializes the field list for the on-disk scheme file.
    pub fn encode(&self) -> Result<Vec<u8>, EncodingError> {
        let mut buf = Vec::new();
        encoding::encode_vec(&self.fields, &mut buf)?;
        Ok(buf)
    }

    /// Reconstructs a scheme from serialized field descriptors.
    ///
    /// Layout validation runs again, so a tampered scheme file cannot
    /// produce an inconsistent layout.
    pub fn decode(buf: &[u8]) -> Result<Self, super::RecordError> {
        let (fields, _) = encoding::decode_vec::<FieldDesc>(buf)
            .map_err(|e| super::RecordError::InvalidScheme(e.to_string()))?;
        Scheme::new(fields)
    }
}

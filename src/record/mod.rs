//! Record codec and scheme (field layout) handling.
//!
//! A record is a single contiguous, self-describing byte buffer:
//!
//! ```text
//! [flags:u8][lsn:u64 LE]              meta prefix, present in every record
//! [fixed fields, packed]              compile-time-known offsets per scheme
//! [var table: u32 size per var field]
//! [var payloads, in field order]
//! ```
//!
//! The scheme is the ordered list of field descriptors that gives the buffer
//! meaning: which fields are fixed-width, which are variable, which compose
//! the key and in what ordinal order. The scheme is persisted next to the
//! node files and validated on reopen — field set and types must not change
//! across restarts.
//!
//! Two derived encodings matter for the rest of the engine:
//!
//! - **Comparable form** ([`Scheme::comparable`]): the record rewritten with
//!   every non-key variable-length field zero-length. It compares equal to
//!   the original under [`Scheme::compare`] and is what page indexes store
//!   as min/max keys.
//! - **Index key** ([`Scheme::index_key`]): an order-preserving byte string
//!   over the key fields alone (big-endian integers, sign-flipped `i64`,
//!   `0x00`-escaped strings, byte-inverted for descending fields). Plain
//!   `memcmp` on two index keys agrees with [`Scheme::compare`] on the
//!   records they came from; the in-memory indexes and the MVCC intent
//!   index are keyed by it.

#[cfg(test)]
mod tests;

mod encoding_impls;

use std::cmp::Ordering;

use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Record flags
// ------------------------------------------------------------------------------------------------

/// Record flag bits, stored in the one-byte meta prefix.
pub mod flags {
    /// Plain value record.
    pub const NONE: u8 = 0;
    /// Tombstone: the key is deleted at this LSN.
    pub const DELETE: u8 = 1;
    /// Operand of the user merge function; folded at read or compaction.
    pub const UPSERT: u8 = 2;
    /// Read-only intent installed by MVCC `get` for conflict validation.
    pub const GET: u8 = 4;
    /// Non-head entry of a version chain.
    pub const DUP: u8 = 8;
    /// Multi-record transaction header in the WAL.
    pub const BEGIN: u8 = 16;
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by scheme construction and record encoding/decoding.
#[derive(Debug, Error)]
pub enum RecordError {
    /// Scheme definition rejected (no key, bad ordinals, duplicate names, …).
    #[error("invalid scheme: {0}")]
    InvalidScheme(String),

    /// A supplied field value does not match its declared fixed width.
    #[error("field '{name}' expects {expected} bytes, got {got}")]
    FieldWidth {
        /// Field name from the scheme.
        name: String,
        /// Declared width in bytes.
        expected: usize,
        /// Supplied width in bytes.
        got: usize,
    },

    /// Wrong number of field values for this scheme.
    #[error("scheme has {expected} fields, got {got} values")]
    FieldCount {
        /// Field count declared by the scheme.
        expected: usize,
        /// Values supplied by the caller.
        got: usize,
    },

    /// A record buffer is structurally inconsistent with the scheme.
    #[error("malformed record: {0}")]
    Malformed(String),
}

// ------------------------------------------------------------------------------------------------
// Scheme
// ------------------------------------------------------------------------------------------------

/// Semantic type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Variable-length byte string, compared bytewise.
    String,
    /// Unsigned 8-bit integer.
    U8,
    /// Unsigned 16-bit integer, little-endian in the record.
    U16,
    /// Unsigned 32-bit integer, little-endian in the record.
    U32,
    /// Unsigned 64-bit integer, little-endian in the record.
    U64,
    /// Signed 64-bit integer, little-endian in the record.
    I64,
}

impl FieldKind {
    /// Fixed width in bytes, or `None` for variable-length kinds.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            FieldKind::String => None,
            FieldKind::U8 => Some(1),
            FieldKind::U16 => Some(2),
            FieldKind::U32 => Some(4),
            FieldKind::U64 => Some(8),
            FieldKind::I64 => Some(8),
        }
    }
}

/// Sort direction a field contributes to key comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Natural ascending order.
    Asc,
    /// Reversed order.
    Desc,
}

/// One field of a scheme.
#[derive(Debug, Clone)]
pub struct FieldDesc {
    /// Field name, unique within the scheme.
    pub name: String,
    /// Semantic type.
    pub kind: FieldKind,
    /// Sort direction for key comparison.
    pub order: SortOrder,
    /// Key ordinal, `None` for value fields. Ordinals must form a
    /// contiguous range starting at zero.
    pub key: Option<u32>,
    /// Auto-populated wall-clock timestamp (seconds). Must be `U32`.
    pub timestamp: bool,
}

impl FieldDesc {
    /// Plain ascending key part.
    pub fn key(name: &str, kind: FieldKind, ordinal: u32) -> Self {
        Self {
            name: name.to_string(),
            kind,
            order: SortOrder::Asc,
            key: Some(ordinal),
            timestamp: false,
        }
    }

    /// Plain value field.
    pub fn value(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            order: SortOrder::Asc,
            key: None,
            timestamp: false,
        }
    }
}

/// Per-field layout slot, precomputed at scheme construction.
#[derive(Debug, Clone)]
struct FieldSlot {
    /// Byte offset of a fixed field past the meta prefix.
    fixed_offset: Option<usize>,
    /// Position of a variable field within the var table.
    var_index: Option<usize>,
}

/// An ordered field layout plus precomputed offsets and the key order.
#[derive(Debug)]
pub struct Scheme {
    fields: Vec<FieldDesc>,
    slots: Vec<FieldSlot>,
    /// Field indexes in key-ordinal order.
    key_order: Vec<usize>,
    /// Total bytes of packed fixed fields.
    fixed_size: usize,
    /// Number of variable-length fields.
    var_count: usize,
    /// Field index of the timestamp field, if declared.
    ts_field: Option<usize>,
}

/// Size of the meta prefix: one flags byte plus a 64-bit LSN.
pub const META_SIZE: usize = 1 + 8;

impl Scheme {
    /// Validates the field list and computes the layout.
    pub fn new(fields: Vec<FieldDesc>) -> Result<Self, RecordError> {
        if fields.is_empty() {
            return Err(RecordError::InvalidScheme("no fields".into()));
        }
        for (i, f) in fields.iter().enumerate() {
            if fields[..i].iter().any(|g| g.name == f.name) {
                return Err(RecordError::InvalidScheme(format!(
                    "duplicate field name '{}'",
                    f.name
                )));
            }
            if f.timestamp && f.kind != FieldKind::U32 {
                return Err(RecordError::InvalidScheme(format!(
                    "timestamp field '{}' must be u32",
                    f.name
                )));
            }
        }

        let key_parts = fields.iter().filter(|f| f.key.is_some()).count();
        if key_parts == 0 {
            return Err(RecordError::InvalidScheme("no key fields".into()));
        }
        let mut key_order = vec![usize::MAX; key_parts];
        for (i, f) in fields.iter().enumerate() {
            if let Some(ord) = f.key {
                let ord = ord as usize;
                if ord >= key_parts || key_order[ord] != usize::MAX {
                    return Err(RecordError::InvalidScheme(format!(
                        "key ordinal {ord} of field '{}' is out of range or repeated",
                        f.name
                    )));
                }
                key_order[ord] = i;
            }
        }

        let mut slots = Vec::with_capacity(fields.len());
        let mut fixed_size = 0usize;
        let mut var_count = 0usize;
        let mut ts_field = None;
        for (i, f) in fields.iter().enumerate() {
            match f.kind.fixed_width() {
                Some(w) => {
                    slots.push(FieldSlot {
                        fixed_offset: Some(fixed_size),
                        var_index: None,
                    });
                    fixed_size += w;
                }
                None => {
                    slots.push(FieldSlot {
                        fixed_offset: None,
                        var_index: Some(var_count),
                    });
                    var_count += 1;
                }
            }
            if f.timestamp && ts_field.is_none() {
                ts_field = Some(i);
            }
        }

        Ok(Self {
            fields,
            slots,
            key_order,
            fixed_size,
            var_count,
            ts_field,
        })
    }

    /// Field descriptors in declaration order.
    pub fn fields(&self) -> &[FieldDesc] {
        &self.fields
    }

    /// Number of fields.
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Number of key parts.
    pub fn key_count(&self) -> usize {
        self.key_order.len()
    }

    /// True when every field is fixed-width (pages pack records without an
    /// offset table).
    pub fn is_fixed(&self) -> bool {
        self.var_count == 0
    }

    /// Record size for a fully fixed scheme.
    pub fn fixed_record_size(&self) -> usize {
        META_SIZE + self.fixed_size
    }

    /// True when the two schemes declare the same field layout.
    pub fn layout_matches(&self, other: &Scheme) -> bool {
        self.fields.len() == other.fields.len()
            && self.fields.iter().zip(other.fields.iter()).all(|(a, b)| {
                a.name == b.name
                    && a.kind == b.kind
                    && a.order == b.order
                    && a.key == b.key
                    && a.timestamp == b.timestamp
            })
    }

    // --------------------------------------------------------------------------------------------
    // Comparison
    // --------------------------------------------------------------------------------------------

    /// Compares two records over the key fields in key-ordinal order.
    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        for &fi in &self.key_order {
            let desc = &self.fields[fi];
            let av = a.field_unchecked(self, fi);
            let bv = b.field_unchecked(self, fi);
            let ord = match desc.kind {
                FieldKind::String | FieldKind::U8 => av.cmp(bv),
                FieldKind::U16 => le_u16(av).cmp(&le_u16(bv)),
                FieldKind::U32 => le_u32(av).cmp(&le_u32(bv)),
                FieldKind::U64 => le_u64(av).cmp(&le_u64(bv)),
                FieldKind::I64 => le_i64(av).cmp(&le_i64(bv)),
            };
            let ord = match desc.order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Rewrites `rec` with every non-key variable-length field zero-length.
    ///
    /// The result compares equal to the original: `compare(rec,
    /// comparable(rec)) == Equal`.
    pub fn comparable(&self, rec: &Record) -> Record {
        let values: Vec<&[u8]> = self
            .fields
            .iter()
            .enumerate()
            .map(|(i, f)| {
                if f.key.is_none() && f.kind.fixed_width().is_none() {
                    &[][..]
                } else {
                    rec.field_unchecked(self, i)
                }
            })
            .collect();
        // Layout-correct by construction, so build cannot fail here.
        let mut out = Record::build_raw(self, &values);
        out.set_flags(rec.flags());
        out.set_lsn(rec.lsn());
        out
    }

    /// Produces the order-preserving index key for the record's key fields.
    pub fn index_key(&self, rec: &Record) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.fixed_size + 8);
        for &fi in &self.key_order {
            let desc = &self.fields[fi];
            let v = rec.field_unchecked(self, fi);
            encode_key_part(&mut out, desc, v);
        }
        out
    }

    /// Builds a search probe: key fields from `key_values` (in key-ordinal
    /// order), every other field defaulted.
    pub fn key_record(&self, key_values: &[&[u8]]) -> Result<Record, RecordError> {
        if key_values.len() != self.key_order.len() {
            return Err(RecordError::FieldCount {
                expected: self.key_order.len(),
                got: key_values.len(),
            });
        }
        let zero8 = [0u8; 8];
        let mut values: Vec<&[u8]> = self
            .fields
            .iter()
            .map(|f| match f.kind.fixed_width() {
                Some(w) => &zero8[..w],
                None => &[][..],
            })
            .collect();
        for (ord, &fi) in self.key_order.iter().enumerate() {
            values[fi] = key_values[ord];
        }
        Record::build(self, &values, flags::NONE, 0)
    }

    /// Timestamp of the record's designated timestamp field, if any.
    pub fn timestamp_of(&self, rec: &Record) -> Option<u32> {
        self.ts_field
            .map(|fi| le_u32(rec.field_unchecked(self, fi)))
    }

    /// Whether a timestamp field is declared.
    pub fn has_timestamp(&self) -> bool {
        self.ts_field.is_some()
    }
}

fn le_u16(b: &[u8]) -> u16 {
    u16::from_le_bytes([b[0], b[1]])
}

fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn le_u64(b: &[u8]) -> u64 {
    u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

fn le_i64(b: &[u8]) -> i64 {
    i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

/// Appends one memcomparable key part.
///
/// Integers become big-endian (sign-flipped for `i64`); strings are
/// `0x00`-escaped (`0x00` → `0x00 0x01`) and `0x00 0x00`-terminated so a
/// shorter string sorts before its extensions. Descending fields invert
/// every emitted byte.
fn encode_key_part(out: &mut Vec<u8>, desc: &FieldDesc, v: &[u8]) {
    let start = out.len();
    match desc.kind {
        FieldKind::U8 => out.push(v[0]),
        FieldKind::U16 => out.extend_from_slice(&le_u16(v).to_be_bytes()),
        FieldKind::U32 => out.extend_from_slice(&le_u32(v).to_be_bytes()),
        FieldKind::U64 => out.extend_from_slice(&le_u64(v).to_be_bytes()),
        FieldKind::I64 => {
            let biased = (le_i64(v) as u64) ^ (1u64 << 63);
            out.extend_from_slice(&biased.to_be_bytes());
        }
        FieldKind::String => {
            for &b in v {
                if b == 0x00 {
                    out.extend_from_slice(&[0x00, 0x01]);
                } else {
                    out.push(b);
                }
            }
            out.extend_from_slice(&[0x00, 0x00]);
        }
    }
    if desc.order == SortOrder::Desc {
        for b in &mut out[start..] {
            *b = !*b;
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Record
// ------------------------------------------------------------------------------------------------

/// An owned record buffer.
///
/// While a record is shared (behind `Arc`) its bytes are immutable except
/// for the LSN and flags, which are stamped at commit before the record is
/// published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    buf: Vec<u8>,
}

impl Record {
    /// Encodes a record from per-field values in declaration order.
    ///
    /// Fixed fields must match their declared width exactly, with one
    /// exception: an empty value for the scheme's timestamp field is
    /// replaced by the current wall-clock time.
    pub fn build(
        scheme: &Scheme,
        values: &[&[u8]],
        rec_flags: u8,
        lsn: u64,
    ) -> Result<Self, RecordError> {
        if values.len() != scheme.fields.len() {
            return Err(RecordError::FieldCount {
                expected: scheme.fields.len(),
                got: values.len(),
            });
        }

        let now_le = now_seconds().to_le_bytes();
        let ts_auto = scheme.ts_field.filter(|&fi| values[fi].is_empty());
        let mut resolved: Vec<&[u8]> = Vec::with_capacity(values.len());
        for (i, f) in scheme.fields.iter().enumerate() {
            let v: &[u8] = if ts_auto == Some(i) {
                &now_le
            } else {
                values[i]
            };
            if let Some(w) = f.kind.fixed_width() {
                if v.len() != w {
                    return Err(RecordError::FieldWidth {
                        name: f.name.clone(),
                        expected: w,
                        got: v.len(),
                    });
                }
            }
            resolved.push(v);
        }

        let mut rec = Self::build_raw(scheme, &resolved);
        rec.set_flags(rec_flags);
        rec.set_lsn(lsn);
        Ok(rec)
    }

    /// Encodes without width validation; values must already be
    /// layout-correct.
    fn build_raw(scheme: &Scheme, values: &[&[u8]]) -> Self {
        let var_bytes: usize = scheme
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.kind.fixed_width().is_none())
            .map(|(i, _)| values[i].len())
            .sum();
        let mut buf =
            Vec::with_capacity(META_SIZE + scheme.fixed_size + 4 * scheme.var_count + var_bytes);
        buf.extend_from_slice(&[0u8; META_SIZE]);

        for (i, f) in scheme.fields.iter().enumerate() {
            if f.kind.fixed_width().is_some() {
                buf.extend_from_slice(values[i]);
            }
        }
        for (i, f) in scheme.fields.iter().enumerate() {
            if f.kind.fixed_width().is_none() {
                buf.extend_from_slice(&(values[i].len() as u32).to_le_bytes());
            }
        }
        for (i, f) in scheme.fields.iter().enumerate() {
            if f.kind.fixed_width().is_none() {
                buf.extend_from_slice(values[i]);
            }
        }
        Self { buf }
    }

    /// Wraps and validates a raw buffer against the scheme layout.
    pub fn from_bytes(scheme: &Scheme, buf: Vec<u8>) -> Result<Self, RecordError> {
        let header = META_SIZE + scheme.fixed_size + 4 * scheme.var_count;
        if buf.len() < header {
            return Err(RecordError::Malformed(format!(
                "buffer of {} bytes shorter than layout header {header}",
                buf.len()
            )));
        }
        let mut var_total = 0usize;
        for vi in 0..scheme.var_count {
            let off = META_SIZE + scheme.fixed_size + 4 * vi;
            var_total += le_u32(&buf[off..off + 4]) as usize;
        }
        if buf.len() != header + var_total {
            return Err(RecordError::Malformed(format!(
                "buffer of {} bytes does not match layout size {}",
                buf.len(),
                header + var_total
            )));
        }
        Ok(Self { buf })
    }

    /// Record flags.
    pub fn flags(&self) -> u8 {
        self.buf[0]
    }

    /// True when the given flag bit is set.
    pub fn has_flag(&self, flag: u8) -> bool {
        self.buf[0] & flag != 0
    }

    /// Record LSN.
    pub fn lsn(&self) -> u64 {
        le_u64(&self.buf[1..9])
    }

    /// Replaces the flags byte.
    pub fn set_flags(&mut self, f: u8) {
        self.buf[0] = f;
    }

    /// ORs flag bits into the flags byte.
    pub fn add_flags(&mut self, f: u8) {
        self.buf[0] |= f;
    }

    /// Stamps the LSN.
    pub fn set_lsn(&mut self, lsn: u64) {
        self.buf[1..9].copy_from_slice(&lsn.to_le_bytes());
    }

    /// Total encoded size in bytes.
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// The raw record bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// View of one field's bytes.
    pub fn field<'a>(&'a self, scheme: &Scheme, idx: usize) -> Result<&'a [u8], RecordError> {
        if idx >= scheme.fields.len() {
            return Err(RecordError::Malformed(format!(
                "field index {idx} out of range"
            )));
        }
        Ok(self.field_unchecked(scheme, idx))
    }

    fn field_unchecked<'a>(&'a self, scheme: &Scheme, idx: usize) -> &'a [u8] {
        let slot = &scheme.slots[idx];
        if let Some(off) = slot.fixed_offset {
            let w = scheme.fields[idx].kind.fixed_width().unwrap_or(0);
            return &self.buf[META_SIZE + off..META_SIZE + off + w];
        }
        let vi = slot.var_index.unwrap_or(0);
        let table = META_SIZE + scheme.fixed_size;
        let mut payload = table + 4 * scheme.var_count;
        for j in 0..vi {
            payload += le_u32(&self.buf[table + 4 * j..table + 4 * j + 4]) as usize;
        }
        let len = le_u32(&self.buf[table + 4 * vi..table + 4 * vi + 4]) as usize;
        &self.buf[payload..payload + len]
    }
}

/// Wall-clock seconds since the UNIX epoch, saturating at `u32::MAX`.
pub fn now_seconds() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs().min(u32::MAX as u64) as u32)
        .unwrap_or(0)
}

//! Page and page-index formats.
//!
//! A node file is a sequence of pages followed by a trailing page index;
//! this module owns the byte-exact layout of both.
//!
//! # Page layout
//!
//! ```text
//! [page header: 64 B]
//! [offset table: u32 × count]     only for schemes with variable fields
//! [records, contiguous]
//! ```
//!
//! Records within a page are sorted by key, then by LSN descending within
//! equal-key runs; the first occurrence of a key has `DUP` clear, every
//! successor has `DUP` set. The header carries two CRC32 checksums: one
//! over the header itself (with the crc field zeroed) and one over the
//! body. A compression filter, when configured, would replace the body
//! with a compressed blob while keeping the uncompressed header readable —
//! codecs are external collaborators, so `size == size_origin` here, but
//! both fields are carried on disk.
//!
//! # Page index layout
//!
//! ```text
//! [entry: 40 B] × count
//! [key blobs: min-key then max-key per entry, comparable form]
//! [index header: 96 B]            last bytes of the node file
//! ```
//!
//! The index header locates the entry region through its `offset` field and
//! records the alignment pad inserted before the region for direct-I/O
//! files. The page index is the sole authoritative locator: pages are never
//! referenced except through it.

#[cfg(test)]
mod tests;

use std::cmp::Ordering;

use crc32fast::Hasher as Crc32;
use thiserror::Error;

use crate::record::{Record, Scheme, flags};
use crate::version::StorageVersion;

/// Serialized page header size.
pub const PAGE_HEADER_SIZE: usize = 64;

/// Serialized page-index entry size (keys excluded).
pub const INDEX_ENTRY_SIZE: usize = 40;

/// Serialized index header (node-file trailer) size.
pub const INDEX_HEADER_SIZE: usize = 96;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by page encoding and decoding.
#[derive(Debug, Error)]
pub enum PageError {
    /// Page or index header checksum mismatch.
    #[error("checksum mismatch in {0}")]
    ChecksumMismatch(&'static str),

    /// Storage-version magic rejected.
    #[error("incompatible storage version")]
    BadVersion,

    /// Structurally invalid bytes.
    #[error("malformed {what}: {detail}")]
    Malformed {
        /// Which structure failed to parse.
        what: &'static str,
        /// Failure description.
        detail: String,
    },
}

// ------------------------------------------------------------------------------------------------
// Page header
// ------------------------------------------------------------------------------------------------

/// Decoded page header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageHeader {
    /// CRC32 over the header bytes (crc field zeroed).
    pub crc: u32,
    /// CRC32 over the page body.
    pub crc_data: u32,
    /// Record count.
    pub count: u32,
    /// Records carrying `DUP`.
    pub count_dup: u32,
    /// Stored body size in bytes.
    pub size: u32,
    /// Uncompressed body size in bytes.
    pub size_origin: u32,
    /// Smallest LSN in the page.
    pub lsn_min: u64,
    /// Largest LSN in the page.
    pub lsn_max: u64,
    /// Smallest LSN among `DUP` records; `u64::MAX` when none.
    pub lsn_mindup: u64,
    /// Earliest record timestamp; `u32::MAX` when the scheme has none.
    pub ts_min: u32,
}

impl PageHeader {
    fn encode(&self) -> [u8; PAGE_HEADER_SIZE] {
        let mut out = [0u8; PAGE_HEADER_SIZE];
        out[4..8].copy_from_slice(&self.crc_data.to_le_bytes());
        out[8..12].copy_from_slice(&self.count.to_le_bytes());
        out[12..16].copy_from_slice(&self.count_dup.to_le_bytes());
        out[16..20].copy_from_slice(&self.size.to_le_bytes());
        out[20..24].copy_from_slice(&self.size_origin.to_le_bytes());
        out[24..32].copy_from_slice(&self.lsn_min.to_le_bytes());
        out[32..40].copy_from_slice(&self.lsn_max.to_le_bytes());
        out[40..48].copy_from_slice(&self.lsn_mindup.to_le_bytes());
        out[48..52].copy_from_slice(&self.ts_min.to_le_bytes());
        let crc = crc32(&out[4..]);
        out[0..4].copy_from_slice(&crc.to_le_bytes());
        out
    }

    fn decode(buf: &[u8]) -> Result<Self, PageError> {
        if buf.len() < PAGE_HEADER_SIZE {
            return Err(PageError::Malformed {
                what: "page header",
                detail: format!("{} bytes, need {PAGE_HEADER_SIZE}", buf.len()),
            });
        }
        let crc = le_u32(&buf[0..4]);
        if crc32(&buf[4..PAGE_HEADER_SIZE]) != crc {
            return Err(PageError::ChecksumMismatch("page header"));
        }
        Ok(Self {
            crc,
            crc_data: le_u32(&buf[4..8]),
            count: le_u32(&buf[8..12]),
            count_dup: le_u32(&buf[12..16]),
            size: le_u32(&buf[16..20]),
            size_origin: le_u32(&buf[20..24]),
            lsn_min: le_u64(&buf[24..32]),
            lsn_max: le_u64(&buf[32..40]),
            lsn_mindup: le_u64(&buf[40..48]),
            ts_min: le_u32(&buf[48..52]),
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Page builder
// ------------------------------------------------------------------------------------------------

/// Statistics and bytes of one finished page.
#[derive(Debug)]
pub struct BuiltPage {
    /// Complete page bytes (header + body).
    pub bytes: Vec<u8>,
    /// Comparable-form min key record bytes.
    pub min_key: Vec<u8>,
    /// Comparable-form max key record bytes.
    pub max_key: Vec<u8>,
    /// Record count.
    pub count: u32,
    /// `DUP` record count.
    pub count_dup: u32,
    /// Smallest LSN.
    pub lsn_min: u64,
    /// Largest LSN.
    pub lsn_max: u64,
    /// Smallest LSN among duplicates.
    pub lsn_mindup: u64,
    /// Earliest record timestamp.
    pub ts_min: u32,
}

/// Accumulates a sorted run of records into one page.
pub struct PageBuilder<'s> {
    scheme: &'s Scheme,
    offsets: Vec<u32>,
    records: Vec<u8>,
    count: u32,
    count_dup: u32,
    lsn_min: u64,
    lsn_max: u64,
    lsn_mindup: u64,
    ts_min: u32,
    first: Option<Record>,
    last: Option<Record>,
}

impl<'s> PageBuilder<'s> {
    /// Creates an empty builder for the given scheme.
    pub fn new(scheme: &'s Scheme) -> Self {
        Self {
            scheme,
            offsets: Vec::new(),
            records: Vec::new(),
            count: 0,
            count_dup: 0,
            lsn_min: u64::MAX,
            lsn_max: 0,
            lsn_mindup: u64::MAX,
            ts_min: u32::MAX,
            first: None,
            last: None,
        }
    }

    /// Appends the next record of the sorted stream.
    ///
    /// `dup` marks a non-head chain position; the flag is stamped into the
    /// serialized copy, leaving the caller's record untouched.
    pub fn add(&mut self, rec: &Record, dup: bool) {
        let start = self.records.len();
        if !self.scheme.is_fixed() {
            self.offsets.push(start as u32);
        }
        self.records.extend_from_slice(rec.as_bytes());
        if dup {
            self.records[start] |= flags::DUP;
            self.count_dup += 1;
            self.lsn_mindup = self.lsn_mindup.min(rec.lsn());
        } else {
            self.records[start] &= !flags::DUP;
        }

        self.count += 1;
        self.lsn_min = self.lsn_min.min(rec.lsn());
        self.lsn_max = self.lsn_max.max(rec.lsn());
        if let Some(ts) = self.scheme.timestamp_of(rec) {
            self.ts_min = self.ts_min.min(ts);
        }
        if self.first.is_none() {
            self.first = Some(rec.clone());
        }
        self.last = Some(rec.clone());
    }

    /// Current record count.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Accumulated uncompressed body size.
    pub fn body_size(&self) -> usize {
        4 * self.offsets.len() + self.records.len()
    }

    /// True when nothing was added.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Finalizes the page: computes checksums, emits header + body.
    pub fn finish(self) -> BuiltPage {
        let mut body = Vec::with_capacity(self.body_size());
        for off in &self.offsets {
            body.extend_from_slice(&off.to_le_bytes());
        }
        body.extend_from_slice(&self.records);

        let header = PageHeader {
            crc: 0,
            crc_data: crc32(&body),
            count: self.count,
            count_dup: self.count_dup,
            size: body.len() as u32,
            size_origin: body.len() as u32,
            lsn_min: self.lsn_min,
            lsn_max: self.lsn_max,
            lsn_mindup: self.lsn_mindup,
            ts_min: self.ts_min,
        };

        let mut bytes = Vec::with_capacity(PAGE_HEADER_SIZE + body.len());
        bytes.extend_from_slice(&header.encode());
        bytes.extend_from_slice(&body);

        let min_key = self
            .first
            .as_ref()
            .map(|r| self.scheme.comparable(r).as_bytes().to_vec())
            .unwrap_or_default();
        let max_key = self
            .last
            .as_ref()
            .map(|r| self.scheme.comparable(r).as_bytes().to_vec())
            .unwrap_or_default();

        BuiltPage {
            bytes,
            min_key,
            max_key,
            count: self.count,
            count_dup: self.count_dup,
            lsn_min: self.lsn_min,
            lsn_max: self.lsn_max,
            lsn_mindup: self.lsn_mindup,
            ts_min: self.ts_min,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Page view
// ------------------------------------------------------------------------------------------------

/// A parsed, validated view over one page's bytes.
pub struct Page<'a> {
    header: PageHeader,
    body: &'a [u8],
    /// Record stride for fully-fixed schemes; `None` means offset table.
    fixed: Option<usize>,
}

impl<'a> Page<'a> {
    /// Parses and CRC-validates a page.
    pub fn parse(scheme: &Scheme, bytes: &'a [u8]) -> Result<Self, PageError> {
        let header = PageHeader::decode(bytes)?;
        let body = &bytes[PAGE_HEADER_SIZE..];
        if body.len() != header.size as usize {
            return Err(PageError::Malformed {
                what: "page body",
                detail: format!("{} bytes, header says {}", body.len(), header.size),
            });
        }
        if crc32(body) != header.crc_data {
            return Err(PageError::ChecksumMismatch("page body"));
        }
        Ok(Self {
            header,
            body,
            fixed: scheme.is_fixed().then(|| scheme.fixed_record_size()),
        })
    }

    /// Parsed header.
    pub fn header(&self) -> &PageHeader {
        &self.header
    }

    /// Record count.
    pub fn count(&self) -> usize {
        self.header.count as usize
    }

    /// Raw bytes of record `i`.
    pub fn rec_bytes(&self, i: usize) -> Result<&'a [u8], PageError> {
        let count = self.count();
        if i >= count {
            return Err(PageError::Malformed {
                what: "record index",
                detail: format!("{i} out of {count}"),
            });
        }
        match self.fixed {
            Some(stride) => Ok(&self.body[i * stride..(i + 1) * stride]),
            None => {
                let table = 4 * count;
                let heap = &self.body[table..];
                let start = le_u32(&self.body[4 * i..4 * i + 4]) as usize;
                let end = if i + 1 < count {
                    le_u32(&self.body[4 * (i + 1)..4 * (i + 1) + 4]) as usize
                } else {
                    heap.len()
                };
                if start > end || end > heap.len() {
                    return Err(PageError::Malformed {
                        what: "offset table",
                        detail: format!("record {i} spans {start}..{end} of {}", heap.len()),
                    });
                }
                Ok(&heap[start..end])
            }
        }
    }

    /// Record `i` as an owned, validated [`Record`].
    pub fn rec(&self, scheme: &Scheme, i: usize) -> Result<Record, PageError> {
        let bytes = self.rec_bytes(i)?;
        Record::from_bytes(scheme, bytes.to_vec()).map_err(|e| PageError::Malformed {
            what: "record",
            detail: e.to_string(),
        })
    }

    /// Index of the first record whose key is `>=` the probe's key.
    ///
    /// Because equal-key runs are contiguous with the chain head first,
    /// the result always lands on a run head.
    pub fn lower_bound(&self, scheme: &Scheme, probe: &Record) -> Result<usize, PageError> {
        let mut lo = 0usize;
        let mut hi = self.count();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let rec = self.rec(scheme, mid)?;
            if scheme.compare(&rec, probe) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// Index of the first record whose key is `>` the probe's key.
    pub fn upper_bound(&self, scheme: &Scheme, probe: &Record) -> Result<usize, PageError> {
        let mut lo = 0usize;
        let mut hi = self.count();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let rec = self.rec(scheme, mid)?;
            if scheme.compare(&rec, probe) != Ordering::Greater {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }
}

// ------------------------------------------------------------------------------------------------
// Page index
// ------------------------------------------------------------------------------------------------

/// Decoded page-index entry: locator plus comparable min/max keys.
#[derive(Debug, Clone)]
pub struct PageIndexEntry {
    /// File offset of the page.
    pub offset: u64,
    /// Offset of this entry's key blobs within the blob region.
    pub offset_index: u32,
    /// Stored page size (header + body).
    pub size: u32,
    /// Uncompressed page size.
    pub size_origin: u32,
    /// Min-key blob length.
    pub size_min: u16,
    /// Max-key blob length.
    pub size_max: u16,
    /// Smallest LSN in the page.
    pub lsn_min: u64,
    /// Largest LSN in the page.
    pub lsn_max: u64,
    /// Comparable-form min key.
    pub min_key: Vec<u8>,
    /// Comparable-form max key.
    pub max_key: Vec<u8>,
}

/// Decoded node-file trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexHeader {
    /// CRC32 over the remaining header bytes.
    pub crc: u32,
    /// Storage version stamp.
    pub version: StorageVersion,
    /// File offset of the page-index entry region.
    pub offset: u64,
    /// Size of the entry region plus key blobs.
    pub size: u32,
    /// Largest per-entry key blob size.
    pub size_vmax: u32,
    /// Page count.
    pub count: u32,
    /// Total record count.
    pub keys: u32,
    /// Total stored page bytes.
    pub total: u64,
    /// Total uncompressed page bytes.
    pub total_origin: u64,
    /// Earliest record timestamp in the node.
    pub ts_min: u32,
    /// Smallest LSN in the node.
    pub lsn_min: u64,
    /// Largest LSN in the node.
    pub lsn_max: u64,
    /// Total `DUP` records in the node.
    pub dupkeys: u32,
    /// Smallest LSN among duplicates.
    pub dupmin: u64,
    /// Alignment pad inserted before the entry region.
    pub align: u16,
}

impl IndexHeader {
    /// Serialized trailer size.
    pub const SIZE: usize = INDEX_HEADER_SIZE;

    /// Serializes into the fixed trailer layout, computing the CRC.
    pub fn encode(&self) -> [u8; INDEX_HEADER_SIZE] {
        let mut out = [0u8; INDEX_HEADER_SIZE];
        out[4..16].copy_from_slice(&self.version.encode());
        out[16..24].copy_from_slice(&self.offset.to_le_bytes());
        out[24..28].copy_from_slice(&self.size.to_le_bytes());
        out[28..32].copy_from_slice(&self.size_vmax.to_le_bytes());
        out[32..36].copy_from_slice(&self.count.to_le_bytes());
        out[36..40].copy_from_slice(&self.keys.to_le_bytes());
        out[40..48].copy_from_slice(&self.total.to_le_bytes());
        out[48..56].copy_from_slice(&self.total_origin.to_le_bytes());
        out[56..60].copy_from_slice(&self.ts_min.to_le_bytes());
        out[60..68].copy_from_slice(&self.lsn_min.to_le_bytes());
        out[68..76].copy_from_slice(&self.lsn_max.to_le_bytes());
        out[76..80].copy_from_slice(&self.dupkeys.to_le_bytes());
        out[80..88].copy_from_slice(&self.dupmin.to_le_bytes());
        out[88..90].copy_from_slice(&self.align.to_le_bytes());
        let crc = crc32(&out[4..]);
        out[0..4].copy_from_slice(&crc.to_le_bytes());
        out
    }

    /// Parses and validates the trailer (CRC, then version magic).
    pub fn decode(buf: &[u8]) -> Result<Self, PageError> {
        if buf.len() < INDEX_HEADER_SIZE {
            return Err(PageError::Malformed {
                what: "index header",
                detail: format!("{} bytes, need {INDEX_HEADER_SIZE}", buf.len()),
            });
        }
        let crc = le_u32(&buf[0..4]);
        if crc32(&buf[4..INDEX_HEADER_SIZE]) != crc {
            return Err(PageError::ChecksumMismatch("index header"));
        }
        let version = StorageVersion::decode(&buf[4..16]).ok_or(PageError::BadVersion)?;
        if !version.compatible() {
            return Err(PageError::BadVersion);
        }
        Ok(Self {
            crc,
            version,
            offset: le_u64(&buf[16..24]),
            size: le_u32(&buf[24..28]),
            size_vmax: le_u32(&buf[28..32]),
            count: le_u32(&buf[32..36]),
            keys: le_u32(&buf[36..40]),
            total: le_u64(&buf[40..48]),
            total_origin: le_u64(&buf[48..56]),
            ts_min: le_u32(&buf[56..60]),
            lsn_min: le_u64(&buf[60..68]),
            lsn_max: le_u64(&buf[68..76]),
            dupkeys: le_u32(&buf[76..80]),
            dupmin: le_u64(&buf[80..88]),
            align: le_u16(&buf[88..90]),
        })
    }
}

/// In-memory page index of one node.
#[derive(Debug, Clone)]
pub struct PageIndex {
    /// Trailer metadata.
    pub header: IndexHeader,
    /// One entry per page, in key order.
    pub entries: Vec<PageIndexEntry>,
}

impl PageIndex {
    /// Parses the entry region (entries + key blobs) described by `header`.
    pub fn parse(header: IndexHeader, region: &[u8]) -> Result<Self, PageError> {
        let count = header.count as usize;
        let entries_size = count * INDEX_ENTRY_SIZE;
        if region.len() < entries_size {
            return Err(PageError::Malformed {
                what: "page index",
                detail: format!("{} bytes, need {entries_size}", region.len()),
            });
        }
        let blobs = &region[entries_size..];
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let e = &region[i * INDEX_ENTRY_SIZE..(i + 1) * INDEX_ENTRY_SIZE];
            let offset_index = le_u32(&e[8..12]);
            let size_min = le_u16(&e[20..22]);
            let size_max = le_u16(&e[22..24]);
            let kstart = offset_index as usize;
            let kmid = kstart + size_min as usize;
            let kend = kmid + size_max as usize;
            if kend > blobs.len() {
                return Err(PageError::Malformed {
                    what: "page index",
                    detail: format!("key blob {kstart}..{kend} beyond {}", blobs.len()),
                });
            }
            entries.push(PageIndexEntry {
                offset: le_u64(&e[0..8]),
                offset_index,
                size: le_u32(&e[12..16]),
                size_origin: le_u32(&e[16..20]),
                size_min,
                size_max,
                lsn_min: le_u64(&e[24..32]),
                lsn_max: le_u64(&e[32..40]),
                min_key: blobs[kstart..kmid].to_vec(),
                max_key: blobs[kmid..kend].to_vec(),
            });
        }
        Ok(Self { header, entries })
    }

    /// Number of pages.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// True when the node holds no pages.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the first page that may contain keys `>=` the probe
    /// (its max key is `>=` probe).
    pub fn lower_bound(
        &self,
        scheme: &Scheme,
        probe: &Record,
    ) -> Result<usize, crate::record::RecordError> {
        let mut lo = 0usize;
        let mut hi = self.entries.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let max = Record::from_bytes(scheme, self.entries[mid].max_key.clone())?;
            if scheme.compare(&max, probe) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// Index of the first page whose min key is `>` the probe, i.e. one
    /// past the last page that may contain the probe's key.
    pub fn upper_bound(
        &self,
        scheme: &Scheme,
        probe: &Record,
    ) -> Result<usize, crate::record::RecordError> {
        let mut lo = 0usize;
        let mut hi = self.entries.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let min = Record::from_bytes(scheme, self.entries[mid].min_key.clone())?;
            if scheme.compare(&min, probe) != Ordering::Greater {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }
}

// ------------------------------------------------------------------------------------------------
// Page index builder
// ------------------------------------------------------------------------------------------------

/// Accumulates page descriptors while a node file is written, then emits
/// the trailer (entries, key blobs, index header) with the caller-supplied
/// alignment pad.
pub struct PageIndexBuilder {
    entries: Vec<PageIndexEntry>,
    keys: u32,
    total: u64,
    total_origin: u64,
    ts_min: u32,
    lsn_min: u64,
    lsn_max: u64,
    dupkeys: u32,
    dupmin: u64,
}

impl Default for PageIndexBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PageIndexBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            keys: 0,
            total: 0,
            total_origin: 0,
            ts_min: u32::MAX,
            lsn_min: u64::MAX,
            lsn_max: 0,
            dupkeys: 0,
            dupmin: u64::MAX,
        }
    }

    /// Registers one finished page at the given file offset.
    pub fn add(&mut self, page: &BuiltPage, offset: u64) {
        self.keys += page.count;
        self.total += page.bytes.len() as u64;
        self.total_origin += page.bytes.len() as u64;
        self.ts_min = self.ts_min.min(page.ts_min);
        self.lsn_min = self.lsn_min.min(page.lsn_min);
        self.lsn_max = self.lsn_max.max(page.lsn_max);
        self.dupkeys += page.count_dup;
        self.dupmin = self.dupmin.min(page.lsn_mindup);
        self.entries.push(PageIndexEntry {
            offset,
            offset_index: 0, // assigned at finish
            size: page.bytes.len() as u32,
            size_origin: page.bytes.len() as u32,
            size_min: page.min_key.len() as u16,
            size_max: page.max_key.len() as u16,
            lsn_min: page.lsn_min,
            lsn_max: page.lsn_max,
            min_key: page.min_key.clone(),
            max_key: page.max_key.clone(),
        });
    }

    /// Pages registered so far.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Total stored page bytes registered so far.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Largest LSN registered so far.
    pub fn lsn_max(&self) -> u64 {
        self.lsn_max
    }

    /// Serializes the trailer.
    ///
    /// `file_offset` is where the trailer begins (end of the last page);
    /// `align` pads the entry region start up to the next multiple of the
    /// given power of two (0 or 1 disables padding). Returns the complete
    /// trailer bytes (pad + entries + blobs + index header) and the decoded
    /// header for in-memory use.
    pub fn finish(mut self, file_offset: u64, align: u16) -> (Vec<u8>, PageIndex) {
        let pad = if align > 1 {
            let a = align as u64;
            ((a - (file_offset % a)) % a) as usize
        } else {
            0
        };

        let mut blob_off = 0u32;
        let mut size_vmax = 0u32;
        for e in &mut self.entries {
            e.offset_index = blob_off;
            let blob = e.size_min as u32 + e.size_max as u32;
            blob_off += blob;
            size_vmax = size_vmax.max(blob);
        }

        let entries_size = self.entries.len() * INDEX_ENTRY_SIZE;
        let region_size = entries_size + blob_off as usize;

        let header = IndexHeader {
            crc: 0,
            version: StorageVersion::CURRENT,
            offset: file_offset + pad as u64,
            size: region_size as u32,
            size_vmax,
            count: self.entries.len() as u32,
            keys: self.keys,
            total: self.total,
            total_origin: self.total_origin,
            ts_min: self.ts_min,
            lsn_min: self.lsn_min,
            lsn_max: self.lsn_max,
            dupkeys: self.dupkeys,
            dupmin: self.dupmin,
            align: pad as u16,
        };

        let mut out = Vec::with_capacity(pad + region_size + INDEX_HEADER_SIZE);
        out.resize(pad, 0);
        for e in &self.entries {
            let mut entry = [0u8; INDEX_ENTRY_SIZE];
            entry[0..8].copy_from_slice(&e.offset.to_le_bytes());
            entry[8..12].copy_from_slice(&e.offset_index.to_le_bytes());
            entry[12..16].copy_from_slice(&e.size.to_le_bytes());
            entry[16..20].copy_from_slice(&e.size_origin.to_le_bytes());
            entry[20..22].copy_from_slice(&e.size_min.to_le_bytes());
            entry[22..24].copy_from_slice(&e.size_max.to_le_bytes());
            entry[24..32].copy_from_slice(&e.lsn_min.to_le_bytes());
            entry[32..40].copy_from_slice(&e.lsn_max.to_le_bytes());
            out.extend_from_slice(&entry);
        }
        for e in &self.entries {
            out.extend_from_slice(&e.min_key);
            out.extend_from_slice(&e.max_key);
        }
        let encoded = header.encode();
        out.extend_from_slice(&encoded);

        // Hand back the decoded header with its final CRC.
        let header = IndexHeader {
            crc: le_u32(&encoded[0..4]),
            ..header
        };
        let index = PageIndex {
            header,
            entries: self.entries,
        };
        (out, index)
    }
}

// ------------------------------------------------------------------------------------------------
// Byte helpers
// ------------------------------------------------------------------------------------------------

fn crc32(data: &[u8]) -> u32 {
    let mut h = Crc32::new();
    h.update(data);
    h.finalize()
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

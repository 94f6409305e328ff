//! Deduplication — block splitting, the dedup frame, and the global index.
//!
//! # Dedup frame (chunk payload when the DEDUP flag is set)
//!
//! ```text
//! Offset  Size          Field
//!    0     44           header (below)
//!   44     index_sz_cmp index table, transposed, possibly lzma-compressed
//!    …     data_sz_cmp  data section, possibly preprocessed + compressed
//! ```
//!
//! Header (all integers big-endian):
//!
//! ```text
//! Offset  Size  Field
//!    0      4   block_count
//!    4      8   index_sz       uncompressed index bytes (block_count × 4)
//!   12      8   data_sz        uncompressed data section bytes
//!   20      8   index_sz_cmp   index bytes as stored
//!   28      8   data_sz_cmp    data bytes as stored
//!   36      8   orig_len       plaintext chunk length
//! ```
//!
//! The compressed sizes are patched in by the pipeline after it has run
//! the index and data stages ([`DedupHdr::update_in`]).
//!
//! # Index entries
//!
//! One u32 BE per source block, in stream order:
//!
//! ```text
//! bit 31 clear             unique block; low 31 bits = block length;
//!                          its bytes appear next in the data section
//! bit 31 set, bit 30 clear duplicate; low 30 bits = ordinal of the
//!                          referenced unique block within this chunk
//! bits 31+30 set           cross-chunk duplicate (global mode); low 30
//!                          bits = ordinal into the chunk's ref table
//! ```
//!
//! The data section is `[ref table | unique blocks]`; each ref is
//! `offset:8 | len:4` (BE) into the plaintext stream written so far.
//! Before storage the index is matrix-transposed with a 4-byte stride —
//! entry bytes of equal significance end up adjacent, which compresses
//! far better than interleaved counters.
//!
//! # Splitting
//!
//! Fixed mode cuts at multiples of the configured block size.
//! Content-defined mode cuts where a gear rolling hash masks to zero,
//! bounded to `avg/4 ..= avg*4`, so insertions shift boundaries only
//! locally.
//!
//! # Global mode
//!
//! A process-wide content index maps block hash → (stream offset, len).
//! Workers consult it strictly in chunk order (the pipeline's token ring),
//! so every stored ref points at plaintext that precedes the referencing
//! chunk.  On extraction the same ring guarantees the referenced bytes
//! are already durable in the scratch file before any chunk needs them.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Mutex;
use thiserror::Error;

use crate::checksum::{digest, ChecksumId};

pub const DEDUP_HDR_SIZE: usize = 44;
pub const GLOBAL_REF_SIZE: usize = 12;
/// Index entries at or above this size are worth lzma-compressing.
pub const INDEX_COMPRESS_MIN: u64 = 90;
/// Index stride used for the transpose.
pub const INDEX_STRIDE: usize = 4;

const ENTRY_DUP: u32 = 0x8000_0000;
const ENTRY_GLOBAL: u32 = 0x4000_0000;
/// Value bits of a unique entry: bit 31 is the only flag, so the block
/// length gets the low 31 bits.
const ENTRY_LEN: u32 = 0x7FFF_FFFF;
/// Value bits of a duplicate entry: bits 31 and 30 are flags, leaving a
/// 30-bit ordinal.
const ENTRY_ORD: u32 = 0x3FFF_FFFF;

#[derive(Error, Debug)]
pub enum DedupError {
    #[error("Dedup frame shorter than its header")]
    Truncated,
    #[error("Dedup header sizes inconsistent with payload")]
    BadHeader,
    #[error("Dedup index entry references block {0} which does not exist yet")]
    BadOrdinal(usize),
    #[error("Dedup data section exhausted while rebuilding chunk")]
    DataExhausted,
    #[error("Rebuilt chunk is {got} bytes, header says {want}")]
    LengthMismatch { got: u64, want: u64 },
    #[error("Cross-chunk reference without a scratch data source")]
    NoScratch,
    #[error("Cross-chunk reference read failed: {0}")]
    ScratchRead(#[from] std::io::Error),
}

// ── Header ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupHdr {
    pub block_count:  u32,
    pub index_sz:     u64,
    pub data_sz:      u64,
    pub index_sz_cmp: u64,
    pub data_sz_cmp:  u64,
    pub orig_len:     u64,
}

impl DedupHdr {
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.block_count.to_be_bytes());
        buf[4..12].copy_from_slice(&self.index_sz.to_be_bytes());
        buf[12..20].copy_from_slice(&self.data_sz.to_be_bytes());
        buf[20..28].copy_from_slice(&self.index_sz_cmp.to_be_bytes());
        buf[28..36].copy_from_slice(&self.data_sz_cmp.to_be_bytes());
        buf[36..44].copy_from_slice(&self.orig_len.to_be_bytes());
    }

    pub fn parse(buf: &[u8]) -> Result<Self, DedupError> {
        if buf.len() < DEDUP_HDR_SIZE {
            return Err(DedupError::Truncated);
        }
        let h = Self {
            block_count:  u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            index_sz:     u64::from_be_bytes(buf[4..12].try_into().unwrap()),
            data_sz:      u64::from_be_bytes(buf[12..20].try_into().unwrap()),
            index_sz_cmp: u64::from_be_bytes(buf[20..28].try_into().unwrap()),
            data_sz_cmp:  u64::from_be_bytes(buf[28..36].try_into().unwrap()),
            orig_len:     u64::from_be_bytes(buf[36..44].try_into().unwrap()),
        };
        if h.index_sz != h.block_count as u64 * INDEX_STRIDE as u64 {
            return Err(DedupError::BadHeader);
        }
        Ok(h)
    }

    /// Patch the stored sizes after the index and data stages have run.
    pub fn update_in(frame: &mut [u8], index_sz_cmp: u64, data_sz_cmp: u64) {
        frame[20..28].copy_from_slice(&index_sz_cmp.to_be_bytes());
        frame[28..36].copy_from_slice(&data_sz_cmp.to_be_bytes());
    }
}

// ── Block splitting ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitMode {
    /// Fixed-size blocks (`-F`).
    Fixed,
    /// Content-defined boundaries via a gear rolling hash (`-D`).
    Content,
}

/// Average dedup block size for a `-B` class: 0 → 2 KiB … 5 → 64 KiB.
pub fn rab_blk_size(class: u8) -> usize {
    2048usize << class.min(5)
}

const fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

const GEAR: [u64; 256] = {
    let mut t = [0u64; 256];
    let mut i = 0usize;
    while i < 256 {
        t[i] = splitmix64(i as u64);
        i += 1;
    }
    t
};

/// Split `data` into blocks, returning the length of each block.
fn split_blocks(data: &[u8], mode: SplitMode, avg: usize) -> Vec<usize> {
    let mut lens = Vec::with_capacity(data.len() / avg + 1);
    match mode {
        SplitMode::Fixed => {
            for b in data.chunks(avg) {
                lens.push(b.len());
            }
        }
        SplitMode::Content => {
            let min = avg / 4;
            let max = avg * 4;
            let mask = (avg as u64).next_power_of_two() - 1;
            let mut start = 0usize;
            let mut h = 0u64;
            let mut i = 0usize;
            while i < data.len() {
                h = (h << 1).wrapping_add(GEAR[data[i] as usize]);
                let len = i - start + 1;
                if (len >= min && h & mask == 0) || len >= max {
                    lens.push(len);
                    start = i + 1;
                    h = 0;
                }
                i += 1;
            }
            if start < data.len() {
                lens.push(data.len() - start);
            }
        }
    }
    lens
}

// ── Global index ─────────────────────────────────────────────────────────────

/// Content-addressed index shared across all chunks of a global-dedup run.
///
/// The pipeline's token ring serializes access in chunk order, so the
/// mutex never contends; it exists to make the sharing safe at the type
/// level.
#[derive(Default)]
pub struct GlobalIndex {
    map: Mutex<HashMap<[u8; 32], (u64, u32)>>,
}

impl GlobalIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Sequential re-reader over already-materialized plaintext, used on
/// extraction to resolve cross-chunk refs.
pub struct ScratchReader {
    file: File,
}

impl ScratchReader {
    pub fn new(file: File) -> Self {
        Self { file }
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }
}

// ── Compression side ─────────────────────────────────────────────────────────

/// Dedup one chunk.  On success (`true`) `dst` holds the complete frame
/// with `index_sz_cmp`/`data_sz_cmp` still equal to the raw sizes; the
/// pipeline patches them after running the index/data stages.  `false`
/// means no redundancy worth keeping was found and the chunk passes
/// through unframed.
///
/// `file_offset` is the chunk's absolute position in the plaintext
/// stream; with a global index it anchors the refs this chunk publishes.
pub fn dedup_compress(
    src: &[u8],
    dst: &mut Vec<u8>,
    mode: SplitMode,
    avg_blk: usize,
    global: Option<(&GlobalIndex, u64)>,
) -> bool {
    if src.len() < avg_blk / 2 {
        return false;
    }
    let lens = split_blocks(src, mode, avg_blk);

    let mut entries: Vec<u32> = Vec::with_capacity(lens.len());
    let mut uniques: Vec<(usize, usize)> = Vec::new(); // (offset, len) into src
    let mut refs: Vec<(u64, u32)> = Vec::new();
    let mut seen: HashMap<[u8; 32], u32> = HashMap::new();
    let mut dup_found = false;
    let mut unique_bytes = 0usize;

    let mut gmap = global.map(|(gi, _)| gi.map.lock().unwrap());
    let file_offset = global.map(|(_, off)| off).unwrap_or(0);

    let mut off = 0usize;
    for &len in &lens {
        let block = &src[off..off + len];
        // Block identity is always BLAKE2b-256, independent of the
        // container checksum (CRC64 is rejected for dedup upstream).
        let h: [u8; 32] = digest(ChecksumId::Blake256, block).try_into().unwrap();

        if let Some(&ord) = seen.get(&h) {
            debug_assert!(ord <= ENTRY_ORD);
            entries.push(ENTRY_DUP | ord);
            dup_found = true;
        } else if let Some(found) = gmap.as_ref().and_then(|m| m.get(&h).copied()) {
            debug_assert!(refs.len() as u32 <= ENTRY_ORD);
            entries.push(ENTRY_DUP | ENTRY_GLOBAL | refs.len() as u32);
            refs.push(found);
            dup_found = true;
        } else {
            let ord = uniques.len() as u32;
            seen.insert(h, ord);
            uniques.push((off, len));
            unique_bytes += len;
            // Block lengths are bounded at avg*4 by the splitter, far
            // below the 31-bit entry field.
            debug_assert!(len <= ENTRY_LEN as usize);
            entries.push(len as u32);
            if let Some(m) = gmap.as_mut() {
                m.insert(h, (file_offset + off as u64, len as u32));
            }
        }
        off += len;
    }
    drop(gmap);

    let index_sz = entries.len() * INDEX_STRIDE;
    let data_sz = refs.len() * GLOBAL_REF_SIZE + unique_bytes;
    let frame_len = DEDUP_HDR_SIZE + index_sz + data_sz;
    if !dup_found || frame_len >= src.len() {
        return false;
    }

    dst.clear();
    dst.reserve(frame_len);
    dst.resize(DEDUP_HDR_SIZE, 0);
    DedupHdr {
        block_count:  entries.len() as u32,
        index_sz:     index_sz as u64,
        data_sz:      data_sz as u64,
        index_sz_cmp: index_sz as u64,
        data_sz_cmp:  data_sz as u64,
        orig_len:     src.len() as u64,
    }
    .write_to(&mut dst[..DEDUP_HDR_SIZE]);

    for e in &entries {
        dst.extend_from_slice(&e.to_be_bytes());
    }
    for (goff, glen) in &refs {
        dst.extend_from_slice(&goff.to_be_bytes());
        dst.extend_from_slice(&glen.to_be_bytes());
    }
    for (boff, blen) in &uniques {
        dst.extend_from_slice(&src[*boff..*boff + *blen]);
    }
    debug_assert_eq!(dst.len(), frame_len);
    true
}

// ── Extraction side ──────────────────────────────────────────────────────────

/// Rebuild a chunk from its untransposed index and raw data section.
/// `scratch` resolves cross-chunk refs (global mode only).
pub fn dedup_reconstruct(
    hdr: &DedupHdr,
    index: &[u8],
    data: &[u8],
    mut scratch: Option<&mut ScratchReader>,
) -> Result<Vec<u8>, DedupError> {
    if index.len() as u64 != hdr.index_sz || data.len() as u64 != hdr.data_sz {
        return Err(DedupError::BadHeader);
    }

    let entries: Vec<u32> = index
        .chunks_exact(INDEX_STRIDE)
        .map(|c| u32::from_be_bytes(c.try_into().unwrap()))
        .collect();

    let ref_count = entries
        .iter()
        .filter(|e| **e & (ENTRY_DUP | ENTRY_GLOBAL) == (ENTRY_DUP | ENTRY_GLOBAL))
        .count();
    let refs_len = ref_count * GLOBAL_REF_SIZE;
    if refs_len > data.len() {
        return Err(DedupError::BadHeader);
    }
    let (ref_table, mut blocks) = data.split_at(refs_len);

    let mut out = Vec::with_capacity(hdr.orig_len as usize);
    let mut uniques: Vec<(usize, usize)> = Vec::new(); // (out offset, len)

    for e in &entries {
        if e & ENTRY_DUP == 0 {
            let len = (e & ENTRY_LEN) as usize;
            if blocks.len() < len {
                return Err(DedupError::DataExhausted);
            }
            uniques.push((out.len(), len));
            out.extend_from_slice(&blocks[..len]);
            blocks = &blocks[len..];
        } else if e & ENTRY_GLOBAL == 0 {
            let ord = (e & ENTRY_ORD) as usize;
            let &(at, len) = uniques.get(ord).ok_or(DedupError::BadOrdinal(ord))?;
            // Ranges never overlap the growing tail, but keep the copy
            // index-based so a corrupt ordinal cannot alias.
            let copy: Vec<u8> = out[at..at + len].to_vec();
            out.extend_from_slice(&copy);
        } else {
            let ord = (e & ENTRY_ORD) as usize;
            if ord >= ref_count {
                return Err(DedupError::BadOrdinal(ord));
            }
            let at = ord * GLOBAL_REF_SIZE;
            let goff = u64::from_be_bytes(ref_table[at..at + 8].try_into().unwrap());
            let glen = u32::from_be_bytes(ref_table[at + 8..at + 12].try_into().unwrap());
            let reader = scratch.as_deref_mut().ok_or(DedupError::NoScratch)?;
            let start = out.len();
            out.resize(start + glen as usize, 0);
            reader.read_at(goff, &mut out[start..])?;
        }
    }

    if !blocks.is_empty() {
        return Err(DedupError::BadHeader);
    }
    if out.len() as u64 != hdr.orig_len {
        return Err(DedupError::LengthMismatch { got: out.len() as u64, want: hdr.orig_len });
    }
    Ok(out)
}

// ── Index transpose ──────────────────────────────────────────────────────────

/// Rearrange `src` (rows of `stride` bytes) column-major into `dst`.
/// Equal-significance bytes of consecutive entries become adjacent.
pub fn transpose(src: &[u8], dst: &mut Vec<u8>, stride: usize) {
    let rows = src.len() / stride;
    dst.clear();
    dst.resize(src.len(), 0);
    for r in 0..rows {
        for c in 0..stride {
            dst[c * rows + r] = src[r * stride + c];
        }
    }
}

/// Inverse of [`transpose`].
pub fn untranspose(src: &[u8], dst: &mut Vec<u8>, stride: usize) {
    let rows = src.len() / stride;
    dst.clear();
    dst.resize(src.len(), 0);
    for r in 0..rows {
        for c in 0..stride {
            dst[r * stride + c] = src[c * rows + r];
        }
    }
}

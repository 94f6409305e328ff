//! Chunk frame — per-chunk framing, flags, and the integrity tag slot.
//!
//! # On-disk layout (all integers big-endian)
//!
//! ```text
//! Offset            Size         Field
//! 0                 8            len_cmp       payload length
//! 8                 cksum_bytes  checksum      plaintext digest, group-swapped
//!                                              (absent — zero bytes — when encrypted)
//! 8+ck              mac_bytes    mac_or_crc    HMAC (group-swapped) or CRC32 BE;
//!                                              zeroed while the tag is computed
//! 8+ck+mac          1            flags
//! 9+ck+mac          len_cmp      payload
//! 9+ck+mac+len_cmp  8            raw_len       iff flags.CHSIZE
//! ```
//!
//! A frame with `len_cmp == 0` is the stream trailer: exactly eight zero
//! bytes, nothing after them.
//!
//! # Flags
//!
//! ```text
//! bit 0  COMPRESSED   payload went through a compression codec
//! bit 1  DEDUP        payload is a dedup frame (header | index | data)
//! bit 2  PREPROC      payload starts with the 9-byte preprocessing sub-header
//! bit 3  reserved     must be 0
//! bits 4–5            adaptive sub-codec id (1 bzip2, 2 lzma, 3 ppmd)
//! bit 6  reserved     must be 0
//! bit 7  CHSIZE       raw_len < chunksize; 8-byte raw_len trailer present
//! ```
//!
//! # Tag discipline
//!
//! The integrity tag covers `len_cmp | checksum | mac slot | flags |
//! payload | raw_len` with the mac slot read as zeroes.  Both sides treat
//! the slot as zero for the duration of the computation; [`FrameView`]
//! hands the hasher the surrounding segments so the stored tag never has
//! to be overwritten in place.

use std::io::Read;
use thiserror::Error;

use crate::checksum::{crc32_parts, group_swap, to_wire, ChecksumId, KeyedMac, CRC32_MAC_BYTES};

pub const CHUNK_FLAG_COMPRESSED: u8 = 0x01;
pub const CHUNK_FLAG_DEDUP: u8 = 0x02;
pub const CHUNK_FLAG_PREPROC: u8 = 0x04;
pub const CHUNK_FLAG_ADAPT_MASK: u8 = 0x30;
pub const CHUNK_FLAG_ADAPT_SHIFT: u8 = 4;
pub const CHUNK_FLAG_CHSIZE: u8 = 0x80;
const CHUNK_FLAG_RESERVED: u8 = 0x48;

/// Width of the `len_cmp` field.
pub const LEN_CMP_SZ: usize = 8;
/// Width of the trailing `raw_len` field.
pub const RAW_LEN_SZ: usize = 8;
/// Width of the flag byte.
pub const CHUNK_FLAG_SZ: usize = 1;

/// The stream trailer: a zero `len_cmp`.
pub const TRAILER: [u8; LEN_CMP_SZ] = [0u8; LEN_CMP_SZ];

/// Payloads may exceed `chunksize` by at most this much (preprocessing
/// sub-header and codec framing).  Anything larger is tampering.
pub const CHUNK_SLACK: u64 = 256;

/// Containers older than this carry no MAC slot and no header digest.
pub const MIN_MAC_VERSION: u16 = 5;

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("I/O error reading chunk: {0}")]
    Io(#[from] std::io::Error),
    #[error("Incomplete chunk — file corrupt or truncated")]
    Truncated,
    #[error("Compressed length {len} too big for chunk size {chunksize} — file tampered?")]
    OversizedFrame { len: u64, chunksize: u64 },
    #[error("Chunk frame shorter than its fixed header")]
    ShortFrame,
    #[error("Reserved chunk flag bits set ({0:#04x})")]
    ReservedFlags(u8),
}

// ── Frame geometry ───────────────────────────────────────────────────────────

/// Container-wide frame geometry, fixed by the header: how wide the
/// checksum and MAC slots are.
#[derive(Debug, Clone, Copy)]
pub struct FrameParams {
    pub cksum_bytes: usize,
    pub mac_bytes:   usize,
}

impl FrameParams {
    /// Geometry for a container using `alg`, with or without encryption.
    /// Version < 5 containers predate both the MAC slot and the header
    /// digest.
    pub fn new(alg: ChecksumId, encrypted: bool, version: u16) -> Self {
        if version < MIN_MAC_VERSION {
            return Self { cksum_bytes: alg.cksum_bytes(), mac_bytes: 0 };
        }
        if encrypted {
            // The HMAC authenticates everything; no plaintext digest.
            Self { cksum_bytes: 0, mac_bytes: alg.mac_bytes() }
        } else {
            Self { cksum_bytes: alg.cksum_bytes(), mac_bytes: CRC32_MAC_BYTES }
        }
    }

    /// Fixed bytes between `len_cmp` and the payload.
    #[inline]
    pub fn head_len(&self) -> usize {
        self.cksum_bytes + self.mac_bytes + CHUNK_FLAG_SZ
    }

    #[inline]
    fn mac_off(&self) -> usize {
        self.cksum_bytes
    }

    #[inline]
    fn flags_off(&self) -> usize {
        self.cksum_bytes + self.mac_bytes
    }
}

/// How the chunk tag is keyed: CRC32 when unencrypted, HMAC when encrypted.
pub enum ChunkTag<'a> {
    Crc32,
    Hmac(&'a KeyedMac),
}

impl ChunkTag<'_> {
    /// Tag over the zeroed-slot frame segments, already in wire order.
    fn compute(&self, len_cmp_be: &[u8], pre_mac: &[u8], mac_bytes: usize, post_mac: &[u8]) -> Vec<u8> {
        let zeros = vec![0u8; mac_bytes];
        match self {
            ChunkTag::Crc32 => {
                let crc = crc32_parts(&[len_cmp_be, pre_mac, &zeros, post_mac]);
                crc.to_be_bytes().to_vec()
            }
            ChunkTag::Hmac(mac) => {
                to_wire(&mac.compute(&[len_cmp_be, pre_mac, &zeros, post_mac]))
            }
        }
    }
}

// ── Encode ───────────────────────────────────────────────────────────────────

/// Assemble a complete sealed frame: header fields, payload, optional
/// `raw_len` trailer, and the integrity tag written into its slot.
///
/// `checksum` is the plaintext digest in canonical order (empty when
/// encrypted); it is group-swapped on the way in.
pub fn encode_frame(
    params: &FrameParams,
    tag: &ChunkTag,
    flags: u8,
    checksum: &[u8],
    payload: &[u8],
    raw_len: Option<u64>,
) -> Vec<u8> {
    debug_assert_eq!(checksum.len(), params.cksum_bytes);
    debug_assert_eq!(flags & CHUNK_FLAG_CHSIZE != 0, raw_len.is_some());

    let total = LEN_CMP_SZ
        + params.head_len()
        + payload.len()
        + if raw_len.is_some() { RAW_LEN_SZ } else { 0 };
    let mut frame = Vec::with_capacity(total);

    frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    frame.extend_from_slice(&to_wire(checksum));
    frame.extend_from_slice(&vec![0u8; params.mac_bytes]);
    frame.push(flags);
    frame.extend_from_slice(payload);
    if let Some(r) = raw_len {
        frame.extend_from_slice(&r.to_be_bytes());
    }

    if params.mac_bytes > 0 {
        let mac_off = LEN_CMP_SZ + params.mac_off();
        let tag_bytes = tag.compute(
            &frame[..LEN_CMP_SZ],
            &frame[LEN_CMP_SZ..mac_off],
            params.mac_bytes,
            &frame[mac_off + params.mac_bytes..],
        );
        frame[mac_off..mac_off + params.mac_bytes].copy_from_slice(&tag_bytes);
    }
    frame
}

// ── Decode ───────────────────────────────────────────────────────────────────

/// One frame as pulled off the wire by the reader thread: the stored
/// length plus everything after it.
pub struct RawChunk {
    pub len_cmp: u64,
    /// `checksum | mac | flags | payload | [raw_len]`.
    pub body: Vec<u8>,
}

/// Read the next frame.  Returns `None` at the trailer.  The buffer is
/// recycled from `body` to keep the per-worker allocation stable.
pub fn read_frame(
    r: &mut dyn Read,
    params: &FrameParams,
    chunksize: u64,
    mut body: Vec<u8>,
) -> Result<Option<RawChunk>, ChunkError> {
    let mut len_be = [0u8; LEN_CMP_SZ];
    read_exact_or(r, &mut len_be)?;
    let len_cmp = u64::from_be_bytes(len_be);

    if len_cmp == 0 {
        return Ok(None);
    }
    if len_cmp > chunksize + CHUNK_SLACK {
        return Err(ChunkError::OversizedFrame { len: len_cmp, chunksize });
    }

    let head = params.head_len();
    body.clear();
    body.resize(head + len_cmp as usize, 0);
    read_exact_or(r, &mut body)?;

    let flags = body[params.flags_off()];
    if flags & CHUNK_FLAG_CHSIZE != 0 {
        let at = body.len();
        body.resize(at + RAW_LEN_SZ, 0);
        read_exact_or(r, &mut body[at..])?;
    }

    Ok(Some(RawChunk { len_cmp, body }))
}

fn read_exact_or(r: &mut dyn Read, buf: &mut [u8]) -> Result<(), ChunkError> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ChunkError::Truncated
        } else {
            ChunkError::Io(e)
        }
    })
}

/// Typed accessors over a raw frame body.  Never hands out two writable
/// aliases; verification feeds the hasher segment by segment with the MAC
/// slot replaced by zeroes.
pub struct FrameView<'a> {
    params:  FrameParams,
    len_cmp: u64,
    body:    &'a [u8],
}

impl<'a> FrameView<'a> {
    pub fn parse(params: FrameParams, chunk: &'a RawChunk) -> Result<Self, ChunkError> {
        if chunk.body.len() < params.head_len() {
            return Err(ChunkError::ShortFrame);
        }
        let v = Self { params, len_cmp: chunk.len_cmp, body: &chunk.body };
        if v.flags() & CHUNK_FLAG_RESERVED != 0 {
            return Err(ChunkError::ReservedFlags(v.flags()));
        }
        let want = params.head_len()
            + v.len_cmp as usize
            + if v.flags() & CHUNK_FLAG_CHSIZE != 0 { RAW_LEN_SZ } else { 0 };
        if v.body.len() != want {
            return Err(ChunkError::ShortFrame);
        }
        Ok(v)
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        self.body[self.params.flags_off()]
    }

    #[inline]
    pub fn len_cmp(&self) -> u64 {
        self.len_cmp
    }

    /// Plaintext digest, restored to canonical byte order.
    pub fn checksum(&self) -> Vec<u8> {
        let mut c = self.body[..self.params.cksum_bytes].to_vec();
        group_swap(&mut c);
        c
    }

    pub fn payload(&self) -> &'a [u8] {
        let start = self.params.head_len();
        &self.body[start..start + self.len_cmp as usize]
    }

    /// The stored plaintext length: the `raw_len` trailer when CHSIZE is
    /// set, otherwise the container chunk size applies.
    pub fn raw_len(&self, chunksize: u64) -> u64 {
        if self.flags() & CHUNK_FLAG_CHSIZE != 0 {
            let at = self.body.len() - RAW_LEN_SZ;
            u64::from_be_bytes(self.body[at..].try_into().unwrap())
        } else {
            chunksize
        }
    }

    /// Check the stored tag against a recomputation over the zeroed-slot
    /// frame.  Constant-time comparison is not needed here: the tag is a
    /// MAC over data the holder of the container already has.
    pub fn verify_tag(&self, tag: &ChunkTag) -> bool {
        if self.params.mac_bytes == 0 {
            return true;
        }
        let mac_off = self.params.mac_off();
        let stored = &self.body[mac_off..mac_off + self.params.mac_bytes];
        let len_be = self.len_cmp.to_be_bytes();
        let computed = tag.compute(
            &len_be,
            &self.body[..mac_off],
            self.params.mac_bytes,
            &self.body[mac_off + self.params.mac_bytes..],
        );
        stored == computed.as_slice()
    }
}

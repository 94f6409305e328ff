//! Chunk preprocessing — LZP and delta2, wrapped in a 9-byte sub-header.
//!
//! # Sub-frame layout (present iff the chunk's PREPROC flag is set)
//!
//! ```text
//! Offset  Size  Field
//!    0      1   type mask    0x1=LZP applied  0x2=delta2 applied
//!                            0x4=final codec applied (PREPROC_COMPRESSED)
//!    1      8   mid_len      buffer size after preprocessing, before the
//!                            final codec (BE u64)
//!    9      …   body         codec output, or the preprocessed bytes
//!                            verbatim when the codec failed to shrink
//! ```
//!
//! A transform that fails or does not shrink its input is skipped and its
//! type bit stays clear; the stage after it still runs.  A chunk can
//! therefore be preprocessed but not compressed (`type & 0x4 == 0`) — the
//! decoder reverses whatever the mask names, in reverse order: codec,
//! then delta2, then LZP.
//!
//! # LZP
//! Hash-predicted match transform: a table keyed by the previous 3 bytes
//! predicts the next run; predicted runs are replaced by an escape byte
//! plus a length.  Both sides maintain the table identically over the
//! plaintext, so no positions are stored.
//!
//! # delta2
//! Arithmetic-series encoder for tables of fixed-width integers: maximal
//! runs of constant-difference big-endian words collapse to
//! (first, delta, count) segments, literals pass through.

use thiserror::Error;

use crate::codec::{Codec, CodecError, CompressOutcome};

pub const PREPROC_TYPE_LZP: u8 = 0x1;
pub const PREPROC_TYPE_DELTA2: u8 = 0x2;
pub const PREPROC_COMPRESSED: u8 = 0x4;
const PREPROC_TYPE_VALID: u8 = 0x7;

/// Fixed sub-header width: type byte + mid-length.
pub const PREPROC_HDR_SIZE: usize = 9;

#[derive(Error, Debug)]
pub enum PreprocError {
    #[error("Preprocessed sub-frame shorter than its header")]
    Truncated,
    #[error("Invalid preprocessing flags {0:#x}")]
    InvalidType(u8),
    #[error("Preprocessing stage produced {got} bytes, expected {want}")]
    SizeMismatch { got: u64, want: u64 },
    #[error("LZP stream corrupt: {0}")]
    Lzp(&'static str),
    #[error("delta2 stream corrupt: {0}")]
    Delta2(&'static str),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

// ── Sub-frame assembly ───────────────────────────────────────────────────────

/// Run the preprocessing stack and the final codec over `src`, producing a
/// complete sub-frame in `dst`.
///
/// Returns the sub-header type mask, or `None` when neither LZP nor delta2
/// changed the buffer — the caller then takes the plain codec path and the
/// chunk carries no PREPROC flag.
pub fn preproc_compress(
    codec: &mut dyn Codec,
    src: &[u8],
    dst: &mut Vec<u8>,
    level: u8,
    use_lzp: bool,
    delta2_span: usize,
) -> Result<Option<u8>, PreprocError> {
    let mut ptype = 0u8;
    let mut owned: Option<Vec<u8>> = None;

    if use_lzp {
        if let Some(enc) = lzp_compress(src, lzp_hash_bits(level)) {
            owned = Some(enc);
            ptype |= PREPROC_TYPE_LZP;
        }
    }
    if delta2_span > 0 {
        let cur: &[u8] = owned.as_deref().unwrap_or(src);
        if let Some(enc) = delta2_encode(cur, delta2_span) {
            owned = Some(enc);
            ptype |= PREPROC_TYPE_DELTA2;
        }
    }
    if ptype == 0 {
        return Ok(None);
    }
    let stage: &[u8] = owned.as_deref().unwrap_or(src);

    let mid_len = stage.len() as u64;
    dst.clear();
    dst.push(0);
    dst.extend_from_slice(&mid_len.to_be_bytes());

    let mut cmp = Vec::new();
    match codec.compress(stage, &mut cmp, level)? {
        CompressOutcome::Compressed => {
            ptype |= PREPROC_COMPRESSED;
            dst.extend_from_slice(&cmp);
        }
        CompressOutcome::Incompressible => {
            dst.extend_from_slice(stage);
        }
    }
    dst[0] = ptype;
    Ok(Some(ptype))
}

/// Reverse a sub-frame: codec, then delta2, then LZP.  `raw_len` is the
/// expected plaintext length, `chdr` the chunk flag byte (adaptive codec
/// dispatch).
pub fn preproc_decompress(
    codec: &mut dyn Codec,
    src: &[u8],
    dst: &mut Vec<u8>,
    raw_len: u64,
    level: u8,
    chdr: u8,
) -> Result<(), PreprocError> {
    if src.len() < PREPROC_HDR_SIZE {
        return Err(PreprocError::Truncated);
    }
    let ptype = src[0];
    if ptype & !PREPROC_TYPE_VALID != 0 || ptype == 0 {
        return Err(PreprocError::InvalidType(ptype));
    }
    let mid_len = u64::from_be_bytes(src[1..9].try_into().unwrap());
    let body = &src[PREPROC_HDR_SIZE..];

    let mut working: Vec<u8>;
    if ptype & PREPROC_COMPRESSED != 0 {
        working = Vec::new();
        codec.decompress(body, &mut working, mid_len, chdr)?;
    } else {
        if body.len() as u64 != mid_len {
            return Err(PreprocError::SizeMismatch { got: body.len() as u64, want: mid_len });
        }
        working = body.to_vec();
    }

    if ptype & PREPROC_TYPE_DELTA2 != 0 {
        working = delta2_decode(&working)?;
    }
    if ptype & PREPROC_TYPE_LZP != 0 {
        working = lzp_decompress(&working, lzp_hash_bits(level))?;
    }

    if working.len() as u64 != raw_len {
        return Err(PreprocError::SizeMismatch { got: working.len() as u64, want: raw_len });
    }
    dst.clear();
    *dst = working;
    Ok(())
}

// ── LZP ──────────────────────────────────────────────────────────────────────

const LZP_ESCAPE: u8 = 0xF8;
const LZP_MIN_MATCH: usize = 8;

/// Table size grows with the compression level.
fn lzp_hash_bits(level: u8) -> u32 {
    16 + (level as u32 / 4).min(4)
}

#[inline]
fn lzp_hash(b: &[u8], bits: u32) -> usize {
    let ctx = ((b[0] as u32) << 16) | ((b[1] as u32) << 8) | b[2] as u32;
    (ctx.wrapping_mul(2654435761) >> (32 - bits)) as usize
}

/// LZP-encode `src`.  Returns `None` when the result would not shrink.
pub fn lzp_compress(src: &[u8], bits: u32) -> Option<Vec<u8>> {
    let mut table = vec![u32::MAX; 1usize << bits];
    let mut out = Vec::with_capacity(src.len());
    let mut i = 0usize;

    while i < src.len() {
        if i >= 3 {
            let h = lzp_hash(&src[i - 3..i], bits);
            let cand = table[h];
            table[h] = i as u32;

            if cand != u32::MAX {
                let cand = cand as usize;
                let max = src.len() - i;
                let mut len = 0usize;
                while len < max && src[cand + len] == src[i + len] {
                    len += 1;
                }
                if len >= LZP_MIN_MATCH {
                    out.push(LZP_ESCAPE);
                    let mut v = len - LZP_MIN_MATCH + 1;
                    while v >= 255 {
                        out.push(255);
                        v -= 255;
                    }
                    out.push(v as u8);
                    // Keep the table identical to what the decoder will
                    // build while copying these bytes.
                    for p in i + 1..i + len {
                        let h = lzp_hash(&src[p - 3..p], bits);
                        table[h] = p as u32;
                    }
                    i += len;
                    continue;
                }
            }
        }
        let b = src[i];
        out.push(b);
        if b == LZP_ESCAPE {
            out.push(0);
        }
        i += 1;
        if out.len() >= src.len() {
            return None;
        }
    }

    if out.len() < src.len() {
        Some(out)
    } else {
        None
    }
}

pub fn lzp_decompress(src: &[u8], bits: u32) -> Result<Vec<u8>, PreprocError> {
    let mut table = vec![u32::MAX; 1usize << bits];
    let mut out: Vec<u8> = Vec::with_capacity(src.len() * 2);
    let mut s = 0usize;

    while s < src.len() {
        let i = out.len();
        let mut cand = u32::MAX;
        if i >= 3 {
            let h = lzp_hash(&out[i - 3..i], bits);
            cand = table[h];
            table[h] = i as u32;
        }

        let b = src[s];
        s += 1;
        if b != LZP_ESCAPE {
            out.push(b);
            continue;
        }

        // Escape: 0 = literal escape byte, otherwise a match length.
        let first = *src.get(s).ok_or(PreprocError::Lzp("truncated escape"))?;
        s += 1;
        if first == 0 {
            out.push(LZP_ESCAPE);
            continue;
        }
        let mut acc = first as usize;
        let mut last = first;
        while last == 255 {
            last = *src.get(s).ok_or(PreprocError::Lzp("truncated length"))?;
            s += 1;
            acc += last as usize;
        }
        let len = LZP_MIN_MATCH + acc - 1;

        if cand == u32::MAX {
            return Err(PreprocError::Lzp("match with empty prediction slot"));
        }
        let cand = cand as usize;
        if cand >= i {
            return Err(PreprocError::Lzp("prediction ahead of output"));
        }
        // Byte-wise copy: the source range may overlap the output tail.
        for k in 0..len {
            let byte = out[cand + k];
            out.push(byte);
        }
        for p in i + 1..i + len {
            let h = lzp_hash(&out[p - 3..p], bits);
            table[h] = p as u32;
        }
    }
    Ok(out)
}

// ── delta2 ───────────────────────────────────────────────────────────────────

const DELTA2_MIN_WORDS: usize = 4;
const DELTA2_SEG_LITERAL: u8 = 0;
const DELTA2_SEG_RUN: u8 = 1;

/// Encode constant-difference word runs.  Returns `None` when the result
/// would not shrink.  Output begins with the span byte so the stream is
/// self-describing.
pub fn delta2_encode(src: &[u8], span: usize) -> Option<Vec<u8>> {
    if !(span == 4 || span == 8) || src.len() < span * DELTA2_MIN_WORDS {
        return None;
    }
    // Segment lengths are u32 on the wire.
    if src.len() > u32::MAX as usize {
        return None;
    }
    let word = |at: usize| -> u64 {
        let mut v = 0u64;
        for &b in &src[at..at + span] {
            v = (v << 8) | b as u64;
        }
        v
    };

    let mut out = Vec::with_capacity(src.len());
    out.push(span as u8);
    let mut lit_start = 0usize;
    let mut i = 0usize;
    let mut found_run = false;

    let flush_literal = |out: &mut Vec<u8>, from: usize, to: usize| {
        if to > from {
            out.push(DELTA2_SEG_LITERAL);
            out.extend_from_slice(&((to - from) as u32).to_be_bytes());
            out.extend_from_slice(&src[from..to]);
        }
    };

    while i + 2 * span <= src.len() {
        let a = word(i);
        let b = word(i + span);
        let delta = b.wrapping_sub(a);
        let mut count = 2usize;
        let mut prev = b;
        while i + (count + 1) * span <= src.len() {
            let next = word(i + count * span);
            if next.wrapping_sub(prev) != delta {
                break;
            }
            prev = next;
            count += 1;
        }
        if count >= DELTA2_MIN_WORDS {
            flush_literal(&mut out, lit_start, i);
            out.push(DELTA2_SEG_RUN);
            out.extend_from_slice(&(count as u32).to_be_bytes());
            out.extend_from_slice(&a.to_be_bytes()[8 - span..]);
            out.extend_from_slice(&delta.to_be_bytes());
            i += count * span;
            lit_start = i;
            found_run = true;
        } else {
            i += span;
        }
        if out.len() >= src.len() {
            return None;
        }
    }
    flush_literal(&mut out, lit_start, src.len());

    if found_run && out.len() < src.len() {
        Some(out)
    } else {
        None
    }
}

pub fn delta2_decode(src: &[u8]) -> Result<Vec<u8>, PreprocError> {
    let span = *src.first().ok_or(PreprocError::Delta2("empty stream"))? as usize;
    if !(span == 4 || span == 8) {
        return Err(PreprocError::Delta2("bad span"));
    }
    let mut out = Vec::with_capacity(src.len() * 2);
    let mut s = 1usize;

    while s < src.len() {
        let tag = src[s];
        s += 1;
        match tag {
            DELTA2_SEG_LITERAL => {
                let len = read_u32(src, &mut s)? as usize;
                let lit = src.get(s..s + len).ok_or(PreprocError::Delta2("short literal"))?;
                out.extend_from_slice(lit);
                s += len;
            }
            DELTA2_SEG_RUN => {
                let count = read_u32(src, &mut s)? as usize;
                let first_bytes =
                    src.get(s..s + span).ok_or(PreprocError::Delta2("short run header"))?;
                let mut v = 0u64;
                for &b in first_bytes {
                    v = (v << 8) | b as u64;
                }
                s += span;
                let delta = u64::from_be_bytes(
                    src.get(s..s + 8)
                        .ok_or(PreprocError::Delta2("short run delta"))?
                        .try_into()
                        .unwrap(),
                );
                s += 8;
                let mask = if span == 8 { u64::MAX } else { (1u64 << (span * 8)) - 1 };
                for _ in 0..count {
                    out.extend_from_slice(&(v & mask).to_be_bytes()[8 - span..]);
                    v = v.wrapping_add(delta);
                }
            }
            _ => return Err(PreprocError::Delta2("bad segment tag")),
        }
    }
    Ok(out)
}

fn read_u32(src: &[u8], s: &mut usize) -> Result<u32, PreprocError> {
    let v = src
        .get(*s..*s + 4)
        .ok_or(PreprocError::Delta2("short length"))?;
    *s += 4;
    Ok(u32::from_be_bytes(v.try_into().unwrap()))
}

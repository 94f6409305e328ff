//! Codec registry — frozen 8-byte algorithm tags + compression shims.
//!
//! # Identity rules
//! Every codec is identified by an 8-byte ASCII tag, space-padded
//! (`"zlib    "`, `"lzma    "`, …).  That tag is written at offset 0 of
//! every container and is the authoritative identity: a reader that does
//! not recognise the tag MUST treat the input as not a `.pz` container,
//! and a reader that recognises a tag it cannot supply (`ppmd`, `lzfx`,
//! `libbsc` in this build) MUST fail immediately with a distinguished
//! error.  There is no negotiation and no fallback.
//!
//! `lzmaMt` is a tag alias: the multithreaded variant of the original
//! encoder produces the same stream, so it decodes through the lzma shim.
//!
//! # Failure split
//! [`Codec::compress`] distinguishes soft from hard failure.  Soft
//! (`CompressOutcome::Incompressible`) means "store this chunk verbatim
//! and clear the COMPRESSED flag" — it is how expansion on incompressible
//! data is handled and is never an error.  A hard `Err` aborts the whole
//! pipeline.  [`Codec::decompress`] has no soft path: anything wrong with
//! a stored stream is corruption.

pub mod adapt;

use std::io::Read;
use thiserror::Error;

pub use adapt::AdaptCodec;

/// Width of the algorithm tag at offset 0 of the container.
pub const ALGO_TAG_LEN: usize = 8;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Not a .pz container (unknown algorithm tag {0:?})")]
    UnknownTag(String),
    #[error("Invalid algorithm '{0}'")]
    UnknownName(String),
    /// The tag is part of the format but this build carries no
    /// implementation for it.  Decoding MUST NOT continue.
    #[error("Algorithm '{0}' is not built into this binary — cannot proceed")]
    Unavailable(&'static str),
    #[error("{algo} compression failed: {msg}")]
    Compress { algo: &'static str, msg: String },
    #[error("{algo} decompression failed: {msg}")]
    Decompress { algo: &'static str, msg: String },
    #[error("Decompressed length {got} does not match recorded length {want}")]
    LengthMismatch { got: u64, want: u64 },
}

// ── CodecId ──────────────────────────────────────────────────────────────────

/// Algorithm selector.  Carries the frozen on-disk tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecId {
    None,
    Zlib,
    Lzma,
    LzmaMt,
    Bzip2,
    Lz4,
    Lzfx,
    Ppmd,
    Libbsc,
    Adapt,
    Adapt2,
}

impl CodecId {
    /// The 8-byte space-padded tag written at container offset 0.
    pub fn tag(self) -> [u8; ALGO_TAG_LEN] {
        let mut t = [b' '; ALGO_TAG_LEN];
        let name = self.name();
        t[..name.len()].copy_from_slice(name.as_bytes());
        t
    }

    /// Resolve a stored tag.  `None` means the input is not a container.
    pub fn from_tag(tag: &[u8; ALGO_TAG_LEN]) -> Option<Self> {
        let name = std::str::from_utf8(tag).ok()?.trim_end_matches(' ');
        Self::from_name(name)
    }

    /// Parse a `-c` argument or a trimmed tag.
    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "none"   => Some(CodecId::None),
            "zlib"   => Some(CodecId::Zlib),
            "lzma"   => Some(CodecId::Lzma),
            "lzmaMt" => Some(CodecId::LzmaMt),
            "bzip2"  => Some(CodecId::Bzip2),
            "lz4"    => Some(CodecId::Lz4),
            "lzfx"   => Some(CodecId::Lzfx),
            "ppmd"   => Some(CodecId::Ppmd),
            "libbsc" => Some(CodecId::Libbsc),
            "adapt"  => Some(CodecId::Adapt),
            "adapt2" => Some(CodecId::Adapt2),
            _        => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CodecId::None   => "none",
            CodecId::Zlib   => "zlib",
            CodecId::Lzma   => "lzma",
            CodecId::LzmaMt => "lzmaMt",
            CodecId::Bzip2  => "bzip2",
            CodecId::Lz4    => "lz4",
            CodecId::Lzfx   => "lzfx",
            CodecId::Ppmd   => "ppmd",
            CodecId::Libbsc => "libbsc",
            CodecId::Adapt  => "adapt",
            CodecId::Adapt2 => "adapt2",
        }
    }

    /// Default `-l` level when the user gave none.
    pub fn default_level(self) -> u8 {
        match self {
            CodecId::Lz4 => 1,
            _            => 6,
        }
    }
}

// ── Codec trait ──────────────────────────────────────────────────────────────

/// Per-codec tuning the pipeline reads before sizing its buffers.
#[derive(Debug, Clone, Copy)]
pub struct CodecProps {
    /// Worst-case growth over the input the codec may need in its output
    /// buffer (zlib-style bound).
    pub buf_extra: u64,
    /// Stride for delta2 preprocessing; 0 disables delta2 for this codec.
    pub delta2_span: usize,
    /// Codec-internal thread fanout (informational; chunk-level threading
    /// is the pipeline's job).
    pub nthreads: usize,
    /// The codec wants the whole stream as one chunk.
    pub is_single_chunk: bool,
}

impl Default for CodecProps {
    fn default() -> Self {
        Self { buf_extra: 0, delta2_span: 8, nthreads: 1, is_single_chunk: false }
    }
}

/// Outcome of a compression attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressOutcome {
    /// `dst` holds a stream strictly smaller than the input.
    Compressed,
    /// The codec could not shrink the input; the caller stores it
    /// verbatim with the COMPRESSED flag clear.
    Incompressible,
}

/// One chunk-transform codec.  Each pipeline worker owns its own instance;
/// implementations need only be thread-safe per instance.
pub trait Codec: Send {
    fn id(&self) -> CodecId;

    fn props(&self, _level: u8, _chunksize: u64) -> CodecProps {
        CodecProps::default()
    }

    /// Compress `src` into `dst` (cleared by the callee).  Returning
    /// `Incompressible` is the soft-failure path; `Err` is fatal.
    fn compress(&mut self, src: &[u8], dst: &mut Vec<u8>, level: u8)
        -> Result<CompressOutcome, CodecError>;

    /// Decompress `src` into `dst` (cleared by the callee).  `raw_len` is
    /// the expected output length; `chdr` is the chunk flag byte (adaptive
    /// codecs read their sub-codec id out of it).
    fn decompress(&mut self, src: &[u8], dst: &mut Vec<u8>, raw_len: u64, chdr: u8)
        -> Result<(), CodecError>;

    /// Adaptive codecs report which sub-codec the last `compress` call
    /// chose, for stamping into the chunk flags.
    fn adapt_choice(&self) -> Option<u8> {
        None
    }

    /// Diagnostics hook, called once per pipeline run when statistics are
    /// requested.  Most codecs have nothing to say.
    fn stats(&self, _verbose: bool) {}
}

/// Instantiate the codec for `id`, or fail hard if the tag is recognised
/// but not built in.
pub fn new_codec(id: CodecId) -> Result<Box<dyn Codec>, CodecError> {
    match id {
        CodecId::None   => Ok(Box::new(NoneCodec)),
        CodecId::Zlib   => Ok(Box::new(ZlibCodec)),
        CodecId::Lzma | CodecId::LzmaMt => Ok(Box::new(LzmaCodec)),
        CodecId::Bzip2  => Ok(Box::new(Bzip2Codec)),
        CodecId::Lz4    => Ok(Box::new(Lz4Codec)),
        CodecId::Adapt  => Ok(Box::new(AdaptCodec::adapt())),
        CodecId::Adapt2 => Ok(Box::new(AdaptCodec::adapt2())),
        CodecId::Ppmd   => Err(CodecError::Unavailable("ppmd")),
        CodecId::Lzfx   => Err(CodecError::Unavailable("lzfx")),
        CodecId::Libbsc => Err(CodecError::Unavailable("libbsc")),
    }
}

// ── Built-in shims ───────────────────────────────────────────────────────────

/// No compression.  Always reports `Incompressible` so the pipeline stores
/// chunks verbatim; useful together with dedup for external post-processing.
pub struct NoneCodec;

impl Codec for NoneCodec {
    fn id(&self) -> CodecId {
        CodecId::None
    }

    fn compress(&mut self, _src: &[u8], _dst: &mut Vec<u8>, _level: u8)
        -> Result<CompressOutcome, CodecError>
    {
        Ok(CompressOutcome::Incompressible)
    }

    fn decompress(&mut self, src: &[u8], dst: &mut Vec<u8>, raw_len: u64, _chdr: u8)
        -> Result<(), CodecError>
    {
        dst.clear();
        dst.extend_from_slice(src);
        check_len(dst.len() as u64, raw_len)
    }
}

pub struct ZlibCodec;

impl Codec for ZlibCodec {
    fn id(&self) -> CodecId {
        CodecId::Zlib
    }

    fn props(&self, _level: u8, chunksize: u64) -> CodecProps {
        // Deflate stored-block bound: n + n/1000 + small constant.
        CodecProps { buf_extra: chunksize / 1000 + 64, ..CodecProps::default() }
    }

    fn compress(&mut self, src: &[u8], dst: &mut Vec<u8>, level: u8)
        -> Result<CompressOutcome, CodecError>
    {
        dst.clear();
        let lvl = flate2::Compression::new(level.min(9) as u32);
        let mut enc = flate2::bufread::ZlibEncoder::new(src, lvl);
        enc.read_to_end(dst)
            .map_err(|e| CodecError::Compress { algo: "zlib", msg: e.to_string() })?;
        Ok(outcome(dst.len(), src.len()))
    }

    fn decompress(&mut self, src: &[u8], dst: &mut Vec<u8>, raw_len: u64, _chdr: u8)
        -> Result<(), CodecError>
    {
        dst.clear();
        dst.reserve(raw_len as usize);
        let mut dec = flate2::bufread::ZlibDecoder::new(src);
        dec.read_to_end(dst)
            .map_err(|e| CodecError::Decompress { algo: "zlib", msg: e.to_string() })?;
        check_len(dst.len() as u64, raw_len)
    }
}

pub struct LzmaCodec;

impl Codec for LzmaCodec {
    fn id(&self) -> CodecId {
        CodecId::Lzma
    }

    fn props(&self, _level: u8, chunksize: u64) -> CodecProps {
        CodecProps { buf_extra: chunksize / 100 + 128, ..CodecProps::default() }
    }

    fn compress(&mut self, src: &[u8], dst: &mut Vec<u8>, _level: u8)
        -> Result<CompressOutcome, CodecError>
    {
        dst.clear();
        lzma_rs::lzma_compress(&mut &src[..], dst)
            .map_err(|e| CodecError::Compress { algo: "lzma", msg: e.to_string() })?;
        Ok(outcome(dst.len(), src.len()))
    }

    fn decompress(&mut self, src: &[u8], dst: &mut Vec<u8>, raw_len: u64, _chdr: u8)
        -> Result<(), CodecError>
    {
        dst.clear();
        dst.reserve(raw_len as usize);
        lzma_rs::lzma_decompress(&mut &src[..], dst)
            .map_err(|e| CodecError::Decompress { algo: "lzma", msg: e.to_string() })?;
        check_len(dst.len() as u64, raw_len)
    }
}

pub struct Bzip2Codec;

impl Codec for Bzip2Codec {
    fn id(&self) -> CodecId {
        CodecId::Bzip2
    }

    fn props(&self, _level: u8, chunksize: u64) -> CodecProps {
        CodecProps { buf_extra: chunksize / 100 + 600, ..CodecProps::default() }
    }

    fn compress(&mut self, src: &[u8], dst: &mut Vec<u8>, level: u8)
        -> Result<CompressOutcome, CodecError>
    {
        dst.clear();
        let lvl = bzip2::Compression::new(level.clamp(1, 9) as u32);
        let mut enc = bzip2::read::BzEncoder::new(src, lvl);
        enc.read_to_end(dst)
            .map_err(|e| CodecError::Compress { algo: "bzip2", msg: e.to_string() })?;
        Ok(outcome(dst.len(), src.len()))
    }

    fn decompress(&mut self, src: &[u8], dst: &mut Vec<u8>, raw_len: u64, _chdr: u8)
        -> Result<(), CodecError>
    {
        dst.clear();
        dst.reserve(raw_len as usize);
        let mut dec = bzip2::read::BzDecoder::new(src);
        dec.read_to_end(dst)
            .map_err(|e| CodecError::Decompress { algo: "bzip2", msg: e.to_string() })?;
        check_len(dst.len() as u64, raw_len)
    }
}

pub struct Lz4Codec;

impl Codec for Lz4Codec {
    fn id(&self) -> CodecId {
        CodecId::Lz4
    }

    fn props(&self, _level: u8, chunksize: u64) -> CodecProps {
        // LZ4 worst case: n + n/255 + 16, plus the length prefix.
        CodecProps { buf_extra: chunksize / 255 + 32, ..CodecProps::default() }
    }

    fn compress(&mut self, src: &[u8], dst: &mut Vec<u8>, _level: u8)
        -> Result<CompressOutcome, CodecError>
    {
        dst.clear();
        *dst = lz4_flex::compress_prepend_size(src);
        Ok(outcome(dst.len(), src.len()))
    }

    fn decompress(&mut self, src: &[u8], dst: &mut Vec<u8>, raw_len: u64, _chdr: u8)
        -> Result<(), CodecError>
    {
        dst.clear();
        *dst = lz4_flex::decompress_size_prepended(src)
            .map_err(|e| CodecError::Decompress { algo: "lz4", msg: e.to_string() })?;
        check_len(dst.len() as u64, raw_len)
    }
}

#[inline]
fn outcome(out_len: usize, in_len: usize) -> CompressOutcome {
    if out_len < in_len {
        CompressOutcome::Compressed
    } else {
        CompressOutcome::Incompressible
    }
}

#[inline]
fn check_len(got: u64, want: u64) -> Result<(), CodecError> {
    if got == want {
        Ok(())
    } else {
        Err(CodecError::LengthMismatch { got, want })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"compress me compress me compress me compress me compress me";

    fn roundtrip(id: CodecId) {
        let mut c = new_codec(id).unwrap();
        let mut cmp = Vec::new();
        let out = c.compress(SAMPLE, &mut cmp, 6).unwrap();
        assert_eq!(out, CompressOutcome::Compressed, "{:?} should shrink SAMPLE", id);

        let mut plain = Vec::new();
        c.decompress(&cmp, &mut plain, SAMPLE.len() as u64, 0).unwrap();
        assert_eq!(plain, SAMPLE);
    }

    #[test]
    fn zlib_roundtrip() {
        roundtrip(CodecId::Zlib);
    }

    #[test]
    fn lzma_roundtrip() {
        roundtrip(CodecId::Lzma);
    }

    #[test]
    fn bzip2_roundtrip() {
        roundtrip(CodecId::Bzip2);
    }

    #[test]
    fn lz4_roundtrip() {
        roundtrip(CodecId::Lz4);
    }

    #[test]
    fn incompressible_input_reports_soft_failure() {
        // A short high-entropy buffer cannot shrink.
        let src: Vec<u8> = (0..64u16).map(|i| (i.wrapping_mul(197) >> 3) as u8).collect();
        let mut c = new_codec(CodecId::Lz4).unwrap();
        let mut dst = Vec::new();
        assert_eq!(
            c.compress(&src, &mut dst, 1).unwrap(),
            CompressOutcome::Incompressible
        );
    }

    #[test]
    fn tag_roundtrip_all_ids() {
        for id in [
            CodecId::None, CodecId::Zlib, CodecId::Lzma, CodecId::LzmaMt,
            CodecId::Bzip2, CodecId::Lz4, CodecId::Lzfx, CodecId::Ppmd,
            CodecId::Libbsc, CodecId::Adapt, CodecId::Adapt2,
        ] {
            let tag = id.tag();
            assert_eq!(tag.len(), ALGO_TAG_LEN);
            assert_eq!(CodecId::from_tag(&tag), Some(id));
        }
    }

    #[test]
    fn unavailable_codecs_fail_hard() {
        for id in [CodecId::Ppmd, CodecId::Lzfx, CodecId::Libbsc] {
            assert!(matches!(new_codec(id), Err(CodecError::Unavailable(_))));
        }
    }

    #[test]
    fn unknown_tag_is_not_a_container() {
        assert_eq!(CodecId::from_tag(b"gzip    "), None);
    }

    #[test]
    fn lzma_mt_decodes_through_lzma() {
        let mut c = new_codec(CodecId::LzmaMt).unwrap();
        assert_eq!(c.id(), CodecId::Lzma);
    }
}

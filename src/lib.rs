//! # parz — chunked parallel multi-algorithm compression
//!
//! Container guarantees (frozen for format version 10):
//! - All integers are big-endian; digests, MACs, salts and nonces are
//!   stored with every 8-byte group byte-reversed
//! - The 8-byte algorithm tag at offset 0 is the authoritative codec
//!   identity; unknown tags are "not a container", known-but-unbuilt tags
//!   fail hard — no negotiation, no fallback
//! - Chunks appear strictly in input order; the writer drains workers
//!   round-robin so the on-disk order never depends on worker timing
//! - Every chunk carries an integrity tag (CRC32, or HMAC when
//!   encrypted) computed over the frame with the tag slot zeroed; any
//!   mismatch cancels the whole pipeline with no partial output
//! - A zero compressed-length frame (eight zero bytes) terminates the
//!   stream; truncating it makes decompression fail
//! - Readers accept container versions 7..=10; writers emit 10 only

pub mod archive;
pub mod checksum;
pub mod chunk;
pub mod codec;
pub mod crypto;
pub mod dedup;
pub mod header;
pub mod pipeline;
pub mod preproc;

use thiserror::Error;

// Flat re-exports for the most common types.
pub use archive::ArchiveError;
pub use checksum::{ChecksumError, ChecksumId};
pub use chunk::{ChunkError, FrameParams, FrameView};
pub use codec::{new_codec, Codec, CodecError, CodecId};
pub use crypto::{CryptoAlg, CryptoError};
pub use dedup::DedupError;
pub use header::{FileHeader, HeaderError, ParsedHeader, VERSION};
pub use pipeline::{
    compress_stream, decompress_stream, ChunkStats, CryptoOpts, DedupOpts, PipelineOpts,
    ScratchSpec,
};
pub use preproc::PreprocError;

/// Crate-level error: every fatal condition a pipeline run can surface.
#[derive(Error, Debug)]
pub enum PzError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Preproc(#[from] PreprocError),
    #[error(transparent)]
    Dedup(#[from] DedupError),
    #[error(transparent)]
    Checksum(#[from] ChecksumError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("Chunk {id}: HMAC verification failed")]
    ChunkMac { id: u64 },
    #[error("Chunk {id}: checksums do not match")]
    ChunkChecksum { id: u64 },
    #[error("Chunk {id}: recovered {got} bytes, expected {want}")]
    ChunkLength { id: u64, got: u64, want: u64 },
    #[error("Container is encrypted — a password is required")]
    PasswordRequired,
    #[error("{0}")]
    InvalidConfig(String),
    #[error("Cancelled")]
    Cancelled,
    #[error("Chunk {id}: {source}")]
    InChunk {
        id: u64,
        #[source]
        source: Box<PzError>,
    },
}

impl PzError {
    /// Attach the failing chunk id, unless the error already names one.
    pub(crate) fn chunk_context(id: u64, e: PzError) -> PzError {
        match e {
            e @ (PzError::ChunkMac { .. }
            | PzError::ChunkChecksum { .. }
            | PzError::ChunkLength { .. }
            | PzError::InChunk { .. }
            | PzError::Cancelled) => e,
            other => PzError::InChunk { id, source: Box::new(other) },
        }
    }
}

//! Adaptive pseudo-codec — picks a real codec per chunk.
//!
//! `adapt` and `adapt2` are not algorithms of their own: each chunk is run
//! through a small set of candidate codecs and the smallest result wins.
//! The winner's identity is stamped into bits 4–5 of the chunk flag byte
//! so the decoder can dispatch without trying anything:
//!
//! ```text
//! 1  bzip2
//! 2  lzma
//! 3  ppmd   (recognised on decode; not built in — fails as unavailable)
//! ```
//!
//! The choice is a tagged variant, never a function pointer: decode
//! dispatch goes through [`AdaptCodec::decompress`] matching on the
//! stamped id.

use crate::chunk::{CHUNK_FLAG_ADAPT_MASK, CHUNK_FLAG_ADAPT_SHIFT};

use super::{
    Bzip2Codec, Codec, CodecError, CodecId, CodecProps, CompressOutcome, LzmaCodec,
};

/// Sub-codec ids as stored in chunk flag bits 4–5.
pub const ADAPT_BZIP2: u8 = 1;
pub const ADAPT_LZMA: u8 = 2;
pub const ADAPT_PPMD: u8 = 3;

pub struct AdaptCodec {
    id:        CodecId,
    /// Candidate sub-codec ids tried on every chunk, in order.
    candidates: &'static [u8],
    bzip2:     Bzip2Codec,
    lzma:      LzmaCodec,
    /// Winner of the last `compress` call.
    choice:    u8,
    scratch:   Vec<u8>,
}

impl AdaptCodec {
    /// `adapt` — bzip2 only in this build (the original pairs it with ppmd).
    pub fn adapt() -> Self {
        Self::new(CodecId::Adapt, &[ADAPT_BZIP2])
    }

    /// `adapt2` — bzip2 vs lzma, best of both.
    pub fn adapt2() -> Self {
        Self::new(CodecId::Adapt2, &[ADAPT_BZIP2, ADAPT_LZMA])
    }

    fn new(id: CodecId, candidates: &'static [u8]) -> Self {
        Self {
            id,
            candidates,
            bzip2: Bzip2Codec,
            lzma: LzmaCodec,
            choice: 0,
            scratch: Vec::new(),
        }
    }

    fn sub_compress(
        &mut self,
        sub: u8,
        src: &[u8],
        dst: &mut Vec<u8>,
        level: u8,
    ) -> Result<CompressOutcome, CodecError> {
        match sub {
            ADAPT_BZIP2 => self.bzip2.compress(src, dst, level),
            ADAPT_LZMA  => self.lzma.compress(src, dst, level),
            _           => unreachable!("candidate list only holds built-in ids"),
        }
    }
}

impl Codec for AdaptCodec {
    fn id(&self) -> CodecId {
        self.id
    }

    fn props(&self, level: u8, chunksize: u64) -> CodecProps {
        // Worst case over the candidate set.
        let b = self.bzip2.props(level, chunksize).buf_extra;
        let l = self.lzma.props(level, chunksize).buf_extra;
        CodecProps { buf_extra: b.max(l), ..CodecProps::default() }
    }

    fn compress(&mut self, src: &[u8], dst: &mut Vec<u8>, level: u8)
        -> Result<CompressOutcome, CodecError>
    {
        self.choice = 0;
        dst.clear();

        let mut best: Option<u8> = None;
        let candidates = self.candidates;
        for &sub in candidates {
            let mut scratch = std::mem::take(&mut self.scratch);
            let out = self.sub_compress(sub, src, &mut scratch, level)?;
            if out == CompressOutcome::Compressed
                && (best.is_none() || scratch.len() < dst.len())
            {
                best = Some(sub);
                std::mem::swap(dst, &mut scratch);
            }
            scratch.clear();
            self.scratch = scratch;
        }

        match best {
            Some(sub) => {
                self.choice = sub;
                Ok(CompressOutcome::Compressed)
            }
            None => Ok(CompressOutcome::Incompressible),
        }
    }

    fn decompress(&mut self, src: &[u8], dst: &mut Vec<u8>, raw_len: u64, chdr: u8)
        -> Result<(), CodecError>
    {
        let sub = (chdr & CHUNK_FLAG_ADAPT_MASK) >> CHUNK_FLAG_ADAPT_SHIFT;
        match sub {
            ADAPT_BZIP2 => self.bzip2.decompress(src, dst, raw_len, chdr),
            ADAPT_LZMA  => self.lzma.decompress(src, dst, raw_len, chdr),
            ADAPT_PPMD  => Err(CodecError::Unavailable("ppmd")),
            other => Err(CodecError::Decompress {
                algo: "adapt",
                msg: format!("invalid sub-codec id {other} in chunk flags"),
            }),
        }
    }

    fn adapt_choice(&self) -> Option<u8> {
        if self.choice == 0 {
            None
        } else {
            Some(self.choice)
        }
    }

    fn stats(&self, verbose: bool) {
        if verbose {
            let name = match self.choice {
                ADAPT_BZIP2 => "bzip2",
                ADAPT_LZMA  => "lzma",
                _           => "none",
            };
            log::debug!("adaptive codec last choice: {name}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::CHUNK_FLAG_ADAPT_SHIFT;

    const SAMPLE: &[u8] =
        b"adaptively compress me adaptively compress me adaptively compress me";

    #[test]
    fn adapt2_roundtrip_via_stamped_choice() {
        let mut c = AdaptCodec::adapt2();
        let mut cmp = Vec::new();
        assert_eq!(
            c.compress(SAMPLE, &mut cmp, 6).unwrap(),
            CompressOutcome::Compressed
        );
        let sub = c.adapt_choice().expect("a winner must be recorded");
        assert!(sub == ADAPT_BZIP2 || sub == ADAPT_LZMA);

        let chdr = sub << CHUNK_FLAG_ADAPT_SHIFT;
        let mut plain = Vec::new();
        c.decompress(&cmp, &mut plain, SAMPLE.len() as u64, chdr).unwrap();
        assert_eq!(plain, SAMPLE);
    }

    #[test]
    fn adapt_stamps_bzip2() {
        let mut c = AdaptCodec::adapt();
        let mut cmp = Vec::new();
        c.compress(SAMPLE, &mut cmp, 6).unwrap();
        assert_eq!(c.adapt_choice(), Some(ADAPT_BZIP2));
    }

    #[test]
    fn ppmd_choice_fails_as_unavailable() {
        let mut c = AdaptCodec::adapt2();
        let mut out = Vec::new();
        let chdr = ADAPT_PPMD << CHUNK_FLAG_ADAPT_SHIFT;
        assert!(matches!(
            c.decompress(b"xx", &mut out, 2, chdr),
            Err(CodecError::Unavailable("ppmd"))
        ));
    }

    #[test]
    fn no_winner_on_incompressible_input() {
        let src: Vec<u8> = (0..48u16).map(|i| (i.wrapping_mul(193) >> 2) as u8).collect();
        let mut c = AdaptCodec::adapt2();
        let mut cmp = Vec::new();
        assert_eq!(
            c.compress(&src, &mut cmp, 6).unwrap(),
            CompressOutcome::Incompressible
        );
        assert_eq!(c.adapt_choice(), None);
    }
}

//! Checksum registry — plaintext digests and keyed chunk/header MACs.
//!
//! # Algorithm identifiers
//!
//! The container header carries the checksum algorithm in bits 8..11 of the
//! global flags word.  These values are frozen:
//!
//! ```text
//! Id      Name        Digest  HMAC
//! 0x100   CRC64       8       32 (HMAC-SHA256, see below)
//! 0x200   BLAKE256    32      32
//! 0x300   BLAKE512    64      64
//! 0x400   SHA256      32      32
//! 0x500   SHA512      64      64
//! 0x600   KECCAK256   32      32
//! 0x700   KECCAK512   64      64
//! 0x800   SKEIN256    read-only alias of BLAKE256
//! 0x900   SKEIN512    read-only alias of BLAKE512
//! ```
//!
//! BLAKE here is BLAKE2b truncated to the digest size.  KECCAK is the
//! original Keccak permutation, not SHA-3.  CRC64 is CRC-64/XZ; it has no
//! keyed form, so encrypted containers that selected CRC64 authenticate
//! with HMAC-SHA256.
//!
//! # Wire form
//!
//! Digests, MACs, salts and nonces are stored group-swapped: every full
//! 8-byte group has its byte order reversed.  The transform is its own
//! inverse and is applied symmetrically on read ([`group_swap`]).  CRC32
//! values are stored as plain big-endian u32 and never group-swapped.
//!
//! # Mode rules
//!
//! Unencrypted containers carry a `cksum_bytes` plaintext digest per chunk
//! and a 4-byte CRC32 in the MAC slot.  Encrypted containers drop the
//! plaintext digest entirely (`cksum_bytes == 0`) and carry a full HMAC in
//! the slot instead.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Blake2b512};
use crc::Crc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};
use sha3::{Keccak256, Keccak512};
use thiserror::Error;

/// BLAKE2b truncated to 256 bits.
type Blake2b256 = Blake2b<U32>;

const CRC64_XZ: Crc<u64> = Crc::<u64>::new(&crc::CRC_64_XZ);

/// Bit mask extracting the checksum id from the global header flags.
pub const CKSUM_MASK: u16 = 0xF00;

/// MAC slot width in unencrypted mode: a CRC32.
pub const CRC32_MAC_BYTES: usize = 4;

/// Largest digest any algorithm in the registry produces.
pub const CKSUM_MAX_BYTES: usize = 64;

pub const DEFAULT_CHECKSUM: ChecksumId = ChecksumId::Blake256;

#[derive(Error, Debug)]
pub enum ChecksumError {
    #[error("Unknown checksum algorithm code {0:#x} — file corrupt?")]
    UnknownId(u16),
    #[error("Unknown checksum name '{0}'")]
    UnknownName(String),
    #[error("Checksum {0} cannot be written by this version (read-only legacy id)")]
    WriteLegacy(&'static str),
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// Container-wide checksum algorithm.  The discriminant is the on-disk id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ChecksumId {
    Crc64     = 0x100,
    Blake256  = 0x200,
    Blake512  = 0x300,
    Sha256    = 0x400,
    Sha512    = 0x500,
    Keccak256 = 0x600,
    Keccak512 = 0x700,
}

impl ChecksumId {
    /// Resolve the id bits of a header flags word.
    ///
    /// The legacy SKEIN ids decode with the BLAKE2 implementations; they are
    /// accepted on read only ([`ChecksumId::to_flags`] never emits them).
    pub fn from_flags(flags: u16) -> Result<Self, ChecksumError> {
        match flags & CKSUM_MASK {
            0x100 => Ok(ChecksumId::Crc64),
            0x200 => Ok(ChecksumId::Blake256),
            0x300 => Ok(ChecksumId::Blake512),
            0x400 => Ok(ChecksumId::Sha256),
            0x500 => Ok(ChecksumId::Sha512),
            0x600 => Ok(ChecksumId::Keccak256),
            0x700 => Ok(ChecksumId::Keccak512),
            0x800 => Ok(ChecksumId::Blake256),   // SKEIN256, legacy
            0x900 => Ok(ChecksumId::Blake512),   // SKEIN512, legacy
            other => Err(ChecksumError::UnknownId(other)),
        }
    }

    #[inline]
    pub fn to_flags(self) -> u16 {
        self as u16
    }

    /// Parse a `-S` argument.
    pub fn from_name(s: &str) -> Result<Self, ChecksumError> {
        match s.to_uppercase().as_str() {
            "CRC64"     => Ok(ChecksumId::Crc64),
            "BLAKE256"  => Ok(ChecksumId::Blake256),
            "BLAKE512"  => Ok(ChecksumId::Blake512),
            "SHA256"    => Ok(ChecksumId::Sha256),
            "SHA512"    => Ok(ChecksumId::Sha512),
            "KECCAK256" => Ok(ChecksumId::Keccak256),
            "KECCAK512" => Ok(ChecksumId::Keccak512),
            "SKEIN256" | "SKEIN512" => Err(ChecksumError::WriteLegacy("SKEIN")),
            other => Err(ChecksumError::UnknownName(other.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ChecksumId::Crc64     => "CRC64",
            ChecksumId::Blake256  => "BLAKE256",
            ChecksumId::Blake512  => "BLAKE512",
            ChecksumId::Sha256    => "SHA256",
            ChecksumId::Sha512    => "SHA512",
            ChecksumId::Keccak256 => "KECCAK256",
            ChecksumId::Keccak512 => "KECCAK512",
        }
    }

    /// Plaintext digest width.
    pub fn cksum_bytes(self) -> usize {
        match self {
            ChecksumId::Crc64 => 8,
            ChecksumId::Blake256 | ChecksumId::Sha256 | ChecksumId::Keccak256 => 32,
            ChecksumId::Blake512 | ChecksumId::Sha512 | ChecksumId::Keccak512 => 64,
        }
    }

    /// HMAC output width in encrypted mode.  CRC64 falls back to HMAC-SHA256.
    pub fn mac_bytes(self) -> usize {
        match self {
            ChecksumId::Crc64 | ChecksumId::Blake256
            | ChecksumId::Sha256 | ChecksumId::Keccak256 => 32,
            ChecksumId::Blake512 | ChecksumId::Sha512 | ChecksumId::Keccak512 => 64,
        }
    }
}

// ── Digests ──────────────────────────────────────────────────────────────────

/// Compute the plaintext digest of `parts` concatenated, in canonical
/// (non-group-swapped) byte order.  CRC64 is emitted big-endian.
pub fn digest_parts(alg: ChecksumId, parts: &[&[u8]]) -> Vec<u8> {
    match alg {
        ChecksumId::Crc64 => {
            let mut d = CRC64_XZ.digest();
            for p in parts {
                d.update(p);
            }
            d.finalize().to_be_bytes().to_vec()
        }
        ChecksumId::Blake256  => hash_parts::<Blake2b256>(parts),
        ChecksumId::Blake512  => hash_parts::<Blake2b512>(parts),
        ChecksumId::Sha256    => hash_parts::<Sha256>(parts),
        ChecksumId::Sha512    => hash_parts::<Sha512>(parts),
        ChecksumId::Keccak256 => hash_parts::<Keccak256>(parts),
        ChecksumId::Keccak512 => hash_parts::<Keccak512>(parts),
    }
}

pub fn digest(alg: ChecksumId, data: &[u8]) -> Vec<u8> {
    digest_parts(alg, &[data])
}

fn hash_parts<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
    let mut h = D::new();
    for p in parts {
        h.update(p);
    }
    h.finalize().to_vec()
}

// ── CRC32 ────────────────────────────────────────────────────────────────────

/// CRC32 (IEEE) over `parts` concatenated.  Used for the header digest and
/// the per-chunk MAC slot whenever encryption is off.
pub fn crc32_parts(parts: &[&[u8]]) -> u32 {
    let mut h = crc32fast::Hasher::new();
    for p in parts {
        h.update(p);
    }
    h.finalize()
}

// ── Keyed MACs ───────────────────────────────────────────────────────────────

/// A reusable HMAC keyed by the derived encryption key.
///
/// One instance lives per worker (chunk MACs) plus one for the header.  Each
/// [`KeyedMac::compute`] call works on a fresh clone of the keyed state, so
/// a single instance may sign any number of messages.
#[derive(Clone)]
pub enum KeyedMac {
    Sha256(Hmac<Sha256>),
    Sha512(Hmac<Sha512>),
    Blake256(Hmac<Blake2b256>),
    Blake512(Hmac<Blake2b512>),
    Keccak256(Hmac<Keccak256>),
    Keccak512(Hmac<Keccak512>),
}

impl KeyedMac {
    /// HMAC keyed with `key`, using the hash that backs `alg` in encrypted
    /// mode (CRC64 maps to SHA256).
    pub fn new(alg: ChecksumId, key: &[u8]) -> Self {
        // new_from_slice only fails for unsized keys, which cannot happen
        // with HMAC's arbitrary-length key handling.
        match alg {
            ChecksumId::Crc64 | ChecksumId::Sha256 => {
                KeyedMac::Sha256(Hmac::new_from_slice(key).unwrap())
            }
            ChecksumId::Sha512    => KeyedMac::Sha512(Hmac::new_from_slice(key).unwrap()),
            ChecksumId::Blake256  => KeyedMac::Blake256(Hmac::new_from_slice(key).unwrap()),
            ChecksumId::Blake512  => KeyedMac::Blake512(Hmac::new_from_slice(key).unwrap()),
            ChecksumId::Keccak256 => KeyedMac::Keccak256(Hmac::new_from_slice(key).unwrap()),
            ChecksumId::Keccak512 => KeyedMac::Keccak512(Hmac::new_from_slice(key).unwrap()),
        }
    }

    /// MAC over `parts` concatenated, canonical byte order.
    pub fn compute(&self, parts: &[&[u8]]) -> Vec<u8> {
        macro_rules! run {
            ($proto:expr) => {{
                let mut m = $proto.clone();
                for p in parts {
                    m.update(p);
                }
                m.finalize().into_bytes().to_vec()
            }};
        }
        match self {
            KeyedMac::Sha256(m)    => run!(m),
            KeyedMac::Sha512(m)    => run!(m),
            KeyedMac::Blake256(m)  => run!(m),
            KeyedMac::Blake512(m)  => run!(m),
            KeyedMac::Keccak256(m) => run!(m),
            KeyedMac::Keccak512(m) => run!(m),
        }
    }
}

// ── Wire serialization ───────────────────────────────────────────────────────

/// Reverse the byte order of every full 8-byte group in `buf`, in place.
///
/// This is the on-disk form of digests, MACs, salts and nonces.  A trailing
/// partial group is left untouched.  Applying the transform twice restores
/// the original, so the same call serves both directions.
pub fn group_swap(buf: &mut [u8]) {
    for group in buf.chunks_exact_mut(8) {
        group.reverse();
    }
}

/// Copy `src` into a new buffer in wire (group-swapped) order.
pub fn to_wire(src: &[u8]) -> Vec<u8> {
    let mut v = src.to_vec();
    group_swap(&mut v);
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_roundtrip_every_algorithm() {
        for alg in [
            ChecksumId::Crc64, ChecksumId::Blake256, ChecksumId::Blake512,
            ChecksumId::Sha256, ChecksumId::Sha512,
            ChecksumId::Keccak256, ChecksumId::Keccak512,
        ] {
            assert_eq!(ChecksumId::from_flags(alg.to_flags()).unwrap(), alg);
            assert_eq!(ChecksumId::from_name(alg.name()).unwrap(), alg);
        }
    }

    #[test]
    fn legacy_skein_ids_read_as_blake() {
        assert_eq!(ChecksumId::from_flags(0x800).unwrap(), ChecksumId::Blake256);
        assert_eq!(ChecksumId::from_flags(0x900).unwrap(), ChecksumId::Blake512);
        assert!(ChecksumId::from_name("SKEIN256").is_err());
    }

    #[test]
    fn digest_widths_match_registry() {
        let data = b"the quick brown fox";
        for alg in [
            ChecksumId::Crc64, ChecksumId::Blake256, ChecksumId::Blake512,
            ChecksumId::Sha256, ChecksumId::Sha512,
            ChecksumId::Keccak256, ChecksumId::Keccak512,
        ] {
            assert_eq!(digest(alg, data).len(), alg.cksum_bytes());
        }
    }

    #[test]
    fn digest_parts_equals_whole() {
        let whole = digest(ChecksumId::Sha256, b"hello world");
        let split = digest_parts(ChecksumId::Sha256, &[b"hello", b" ", b"world"]);
        assert_eq!(whole, split);
    }

    #[test]
    fn keccak_is_not_sha3() {
        // Keccak256("") differs from SHA3-256("") — the padding differs.
        let d = digest(ChecksumId::Keccak256, b"");
        assert_eq!(
            hex::encode(&d),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn group_swap_is_involution() {
        let orig: Vec<u8> = (0..28).collect();
        let mut buf = orig.clone();
        group_swap(&mut buf);
        assert_ne!(buf, orig);
        // 24 full-group bytes reversed in groups of 8; tail of 4 untouched.
        assert_eq!(&buf[24..], &orig[24..]);
        group_swap(&mut buf);
        assert_eq!(buf, orig);
    }

    #[test]
    fn keyed_mac_is_stable_and_key_sensitive() {
        let mac = KeyedMac::new(ChecksumId::Blake256, b"key material");
        let a = mac.compute(&[b"msg"]);
        let b = mac.compute(&[b"msg"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), ChecksumId::Blake256.mac_bytes());

        let other = KeyedMac::new(ChecksumId::Blake256, b"different key");
        assert_ne!(a, other.compute(&[b"msg"]));
    }
}

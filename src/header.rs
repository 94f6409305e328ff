//! File header — container anchor at offset 0.
//!
//! # On-disk layout (all integers big-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      8   algo        ASCII codec tag, space-padded ("zlib    ", …)
//!    8      2   version     current = 10; readers accept 7..=10
//!   10      2   flags       see below
//!   12      8   chunksize   bytes
//!   20      4   level       0..=14
//! — iff a crypto bit is set in flags —
//!   24      4   saltlen
//!   28      n   salt        group-swapped
//!    …      N   nonce       N = 8 (AES) or 24 (XSalsa20), group-swapped
//!    …      4   keylen      16 or 32
//! — then —
//!    …      m   digest      HMAC over all preceding bytes (encrypted,
//!                           group-swapped) or CRC32 BE (unencrypted, m=4)
//! ```
//!
//! # Flags
//!
//! ```text
//! 0x0001  FLAG_DEDUP          content-defined dedup
//! 0x0002  FLAG_DEDUP_FIXED    fixed-block dedup
//!         (both set: global dedup across the whole stream)
//! 0x0004  FLAG_SINGLE_CHUNK   the container holds exactly one chunk
//! 0x0008  FLAG_ARCHIVE        payload stream is an archive, not a file
//! 0x0030  crypto algorithm    0x10 AES-CTR, 0x20 XSalsa20
//! 0x0F00  checksum algorithm  see checksum.rs
//! ```
//!
//! The digest is verified before anything else is done with the header
//! fields; in encrypted mode that verification doubles as the password
//! check, and the two failure causes are deliberately indistinguishable.

use byteorder::{BigEndian, ReadBytesExt};
use std::io::Read;
use thiserror::Error;

use crate::checksum::{crc32_parts, group_swap, to_wire, ChecksumError, ChecksumId, KeyedMac};
use crate::codec::{CodecId, ALGO_TAG_LEN};
use crate::crypto::{CryptoAlg, CryptoError, MAX_SALT_LEN};

/// Container format version written by this build.
pub const VERSION: u16 = 10;
/// Oldest version this build reads.
pub const MIN_VERSION: u16 = VERSION - 3;

pub const MAX_LEVEL: u8 = 14;
pub const DEFAULT_CHUNKSIZE: u64 = 8 * 1024 * 1024;
pub const MIN_CHUNK: u64 = 4096;

pub const FLAG_DEDUP: u16 = 0x0001;
pub const FLAG_DEDUP_FIXED: u16 = 0x0002;
pub const FLAG_SINGLE_CHUNK: u16 = 0x0004;
pub const FLAG_ARCHIVE: u16 = 0x0008;

/// Fixed part of the header, before any crypto extension.
pub const FIXED_HDR_LEN: usize = ALGO_TAG_LEN + 2 + 2 + 8 + 4;

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("I/O error reading header: {0}")]
    Io(#[from] std::io::Error),
    #[error("Input is not a .pz container")]
    NotPz,
    #[error("Cannot handle newer container version {0}, capability {VERSION}")]
    VersionTooNew(u16),
    #[error("Unsupported container version {0} (oldest readable: {MIN_VERSION})")]
    VersionTooOld(u16),
    #[error("Chunk size must not exceed 80% of total RAM")]
    ChunksizeTooLarge,
    #[error("Invalid chunk size in header: {0}")]
    BadChunksize(u64),
    #[error("Invalid compression level in header: {0}")]
    BadLevel(u32),
    #[error("Salt length {0} out of range")]
    BadSaltLen(u32),
    #[error(transparent)]
    Checksum(#[from] ChecksumError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("Header verification failed — file tampered or wrong password")]
    Verification,
}

/// Chunk size cap relative to physical memory.
pub fn eighty_pct(ram: u64) -> u64 {
    ram - ram / 5
}

/// Total physical memory, best effort.  `None` disables the RAM guard.
pub fn total_ram() -> Option<u64> {
    let info = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = info.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

// ── Header model ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CryptoHeader {
    pub alg:    CryptoAlg,
    pub salt:   Vec<u8>,
    pub nonce:  Vec<u8>,
    pub keylen: u32,
}

#[derive(Debug, Clone)]
pub struct FileHeader {
    pub algo:      CodecId,
    pub version:   u16,
    pub flags:     u16,
    pub chunksize: u64,
    pub level:     u8,
    pub crypto:    Option<CryptoHeader>,
}

impl FileHeader {
    pub fn checksum(&self) -> Result<ChecksumId, ChecksumError> {
        ChecksumId::from_flags(self.flags)
    }

    #[inline]
    pub fn is_archive(&self) -> bool {
        self.flags & FLAG_ARCHIVE != 0
    }

    #[inline]
    pub fn is_single_chunk(&self) -> bool {
        self.flags & FLAG_SINGLE_CHUNK != 0
    }

    /// Serialize every field the digest covers, in digest order.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FIXED_HDR_LEN + 72);
        buf.extend_from_slice(&self.algo.tag());
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.chunksize.to_be_bytes());
        buf.extend_from_slice(&(self.level as u32).to_be_bytes());
        if let Some(ch) = &self.crypto {
            buf.extend_from_slice(&(ch.salt.len() as u32).to_be_bytes());
            buf.extend_from_slice(&to_wire(&ch.salt));
            buf.extend_from_slice(&to_wire(&ch.nonce));
            buf.extend_from_slice(&ch.keylen.to_be_bytes());
        }
        buf
    }

    /// Write the header and its digest.  `hmac` must be given exactly when
    /// the header carries a crypto extension.
    pub fn write(&self, w: &mut dyn std::io::Write, hmac: Option<&KeyedMac>) -> std::io::Result<()> {
        let body = self.to_bytes();
        w.write_all(&body)?;
        match (&self.crypto, hmac) {
            (Some(_), Some(mac)) => {
                w.write_all(&to_wire(&mac.compute(&[&body])))?;
            }
            (None, None) => {
                w.write_all(&crc32_parts(&[&body]).to_be_bytes())?;
            }
            _ => unreachable!("crypto extension and header HMAC go together"),
        }
        Ok(())
    }
}

// ── Parsing ──────────────────────────────────────────────────────────────────

/// A header as read off the wire: the parsed fields, the raw bytes the
/// digest covers, and the stored digest (canonical order).
///
/// Verification is split out because the HMAC key does not exist until the
/// password has been read and the KDF has run.
pub struct ParsedHeader {
    pub header: FileHeader,
    raw:        Vec<u8>,
    digest:     Vec<u8>,
}

impl ParsedHeader {
    /// Parse and sanity-check a header.  `ram` enables the chunk size
    /// guard when known.
    pub fn read(r: &mut dyn Read, ram: Option<u64>) -> Result<Self, HeaderError> {
        let mut tag = [0u8; ALGO_TAG_LEN];
        r.read_exact(&mut tag)?;
        let algo = CodecId::from_tag(&tag).ok_or(HeaderError::NotPz)?;

        let version = r.read_u16::<BigEndian>()?;
        let flags = r.read_u16::<BigEndian>()?;
        let chunksize = r.read_u64::<BigEndian>()?;
        let level = r.read_u32::<BigEndian>()?;

        // Reject ridiculous values before trusting anything downstream.
        if version > VERSION {
            return Err(HeaderError::VersionTooNew(version));
        }
        if version < MIN_VERSION {
            return Err(HeaderError::VersionTooOld(version));
        }
        if chunksize == 0 {
            return Err(HeaderError::BadChunksize(chunksize));
        }
        if let Some(ram) = ram {
            if chunksize > eighty_pct(ram) {
                return Err(HeaderError::ChunksizeTooLarge);
            }
        }
        if level > MAX_LEVEL as u32 {
            return Err(HeaderError::BadLevel(level));
        }
        let cksum = ChecksumId::from_flags(flags)?;

        let crypto_alg = CryptoAlg::from_flags(flags)?;
        let crypto = match crypto_alg {
            None => None,
            Some(alg) => {
                let saltlen = r.read_u32::<BigEndian>()?;
                if saltlen == 0 || saltlen as usize > MAX_SALT_LEN {
                    return Err(HeaderError::BadSaltLen(saltlen));
                }
                let mut salt = vec![0u8; saltlen as usize];
                r.read_exact(&mut salt)?;
                group_swap(&mut salt);

                let mut nonce = vec![0u8; alg.nonce_len()];
                r.read_exact(&mut nonce)?;
                group_swap(&mut nonce);

                let keylen = r.read_u32::<BigEndian>()?;
                Some(CryptoHeader { alg, salt, nonce, keylen })
            }
        };

        let header = FileHeader { algo, version, flags, chunksize, level: level as u8, crypto };
        let raw = header.to_bytes();

        let digest_len = if header.crypto.is_some() {
            cksum.mac_bytes()
        } else if version >= crate::chunk::MIN_MAC_VERSION {
            4
        } else {
            0
        };
        let mut digest = vec![0u8; digest_len];
        r.read_exact(&mut digest)?;
        if header.crypto.is_some() {
            group_swap(&mut digest);
        }

        Ok(Self { header, raw, digest })
    }

    /// CRC verification for unencrypted containers.
    pub fn verify_crc(&self) -> Result<(), HeaderError> {
        if self.digest.is_empty() {
            return Ok(()); // pre-digest container version
        }
        let crc = crc32_parts(&[&self.raw]);
        if self.digest == crc.to_be_bytes() {
            Ok(())
        } else {
            Err(HeaderError::Verification)
        }
    }

    /// HMAC verification for encrypted containers; also the password check.
    pub fn verify_hmac(&self, mac: &KeyedMac) -> Result<(), HeaderError> {
        if mac.compute(&[&self.raw]) == self.digest {
            Ok(())
        } else {
            Err(HeaderError::Verification)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CRYPTO_ALG_AES;

    fn plain_header() -> FileHeader {
        FileHeader {
            algo:      CodecId::Zlib,
            version:   VERSION,
            flags:     ChecksumId::Blake256.to_flags(),
            chunksize: DEFAULT_CHUNKSIZE,
            level:     6,
            crypto:    None,
        }
    }

    fn write_to_vec(h: &FileHeader, mac: Option<&KeyedMac>) -> Vec<u8> {
        let mut buf = Vec::new();
        h.write(&mut buf, mac).unwrap();
        buf
    }

    #[test]
    fn plain_header_roundtrip() {
        let h = plain_header();
        let buf = write_to_vec(&h, None);
        let parsed = ParsedHeader::read(&mut &buf[..], None).unwrap();
        parsed.verify_crc().unwrap();

        assert_eq!(parsed.header.algo, CodecId::Zlib);
        assert_eq!(parsed.header.version, VERSION);
        assert_eq!(parsed.header.chunksize, DEFAULT_CHUNKSIZE);
        assert_eq!(parsed.header.level, 6);
        assert_eq!(parsed.header.checksum().unwrap(), ChecksumId::Blake256);
        assert!(parsed.header.crypto.is_none());
    }

    #[test]
    fn encrypted_header_roundtrip() {
        let mac = KeyedMac::new(ChecksumId::Blake256, b"derived key");
        let mut h = plain_header();
        h.flags |= CRYPTO_ALG_AES;
        h.crypto = Some(CryptoHeader {
            alg:    CryptoAlg::Aes,
            salt:   (0..32).collect(),
            nonce:  vec![9; 8],
            keylen: 32,
        });
        let buf = write_to_vec(&h, Some(&mac));
        let parsed = ParsedHeader::read(&mut &buf[..], None).unwrap();
        parsed.verify_hmac(&mac).unwrap();

        let ch = parsed.header.crypto.as_ref().unwrap();
        assert_eq!(ch.salt, (0..32).collect::<Vec<u8>>());
        assert_eq!(ch.nonce, vec![9; 8]);
        assert_eq!(ch.keylen, 32);
    }

    #[test]
    fn wrong_key_fails_verification() {
        let mac = KeyedMac::new(ChecksumId::Blake256, b"derived key");
        let mut h = plain_header();
        h.flags |= CRYPTO_ALG_AES;
        h.crypto = Some(CryptoHeader {
            alg:    CryptoAlg::Aes,
            salt:   vec![1; 32],
            nonce:  vec![2; 8],
            keylen: 32,
        });
        let buf = write_to_vec(&h, Some(&mac));
        let parsed = ParsedHeader::read(&mut &buf[..], None).unwrap();

        let wrong = KeyedMac::new(ChecksumId::Blake256, b"other key");
        assert!(matches!(parsed.verify_hmac(&wrong), Err(HeaderError::Verification)));
    }

    #[test]
    fn every_single_bit_flip_is_caught() {
        let h = plain_header();
        let buf = write_to_vec(&h, None);
        for byte in 0..buf.len() {
            for bit in 0..8 {
                let mut bad = buf.clone();
                bad[byte] ^= 1 << bit;
                let caught = match ParsedHeader::read(&mut &bad[..], None) {
                    Err(_) => true,
                    Ok(p) => p.verify_crc().is_err(),
                };
                assert!(caught, "flip of byte {byte} bit {bit} went undetected");
            }
        }
    }

    #[test]
    fn version_gate() {
        let mut h = plain_header();
        h.version = VERSION + 1;
        let buf = write_to_vec(&h, None);
        assert!(matches!(
            ParsedHeader::read(&mut &buf[..], None),
            Err(HeaderError::VersionTooNew(_))
        ));

        h.version = MIN_VERSION - 1;
        let buf = write_to_vec(&h, None);
        assert!(matches!(
            ParsedHeader::read(&mut &buf[..], None),
            Err(HeaderError::VersionTooOld(_))
        ));
    }

    #[test]
    fn legacy_skein_flag_decodes_via_blake() {
        let mut h = plain_header();
        h.version = MIN_VERSION;
        h.flags = 0x800; // SKEIN256 in an old container
        let buf = write_to_vec(&h, None);
        let parsed = ParsedHeader::read(&mut &buf[..], None).unwrap();
        parsed.verify_crc().unwrap();
        assert_eq!(parsed.header.checksum().unwrap(), ChecksumId::Blake256);
    }

    #[test]
    fn unknown_tag_is_not_a_container() {
        let mut buf = write_to_vec(&plain_header(), None);
        buf[..8].copy_from_slice(b"tarball ");
        assert!(matches!(
            ParsedHeader::read(&mut &buf[..], None),
            Err(HeaderError::NotPz)
        ));
    }

    #[test]
    fn ram_guard_rejects_giant_chunksize() {
        let mut h = plain_header();
        h.chunksize = 1 << 50;
        let buf = write_to_vec(&h, None);
        assert!(matches!(
            ParsedHeader::read(&mut &buf[..], Some(16 << 30)),
            Err(HeaderError::ChunksizeTooLarge)
        ));
    }
}

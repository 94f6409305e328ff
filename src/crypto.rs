//! Chunk encryption — scrypt key derivation, AES-CTR and XSalsa20.
//!
//! Both ciphers run in counter/stream mode: encryption never changes the
//! payload length and decryption is the same keystream XOR.  The keystream
//! position is keyed by the chunk id so that workers encrypt chunks in any
//! order without coordination:
//!
//! - AES-CTR: 16-byte IV = `nonce (8) | chunk id as u32 BE | 0u32`.  The
//!   trailing zero word leaves 2^32 counter blocks (64 GiB of keystream)
//!   per chunk before any overlap could occur.
//! - XSalsa20: 24-byte per-chunk nonce = header nonce with its last 8
//!   bytes XORed with the chunk id (BE).
//!
//! Key derivation is scrypt (log2 N = 14, r = 8, p = 1) over the password
//! and a random 32-byte salt.  The derived key is kept in two places: the
//! cipher key (needed for every chunk) and a MAC-keying copy that
//! [`CryptoCtx::clean_pkey`] wipes as soon as the header HMAC and the
//! per-worker chunk HMACs have been keyed.  Everything remaining is wiped
//! on drop.
//!
//! Key length is 32 (AES-256 / XSalsa20) or 16 (AES-128).  16-byte keys
//! are accepted only when reading containers older than version 7.

use aes::cipher::generic_array::GenericArray;
use aes::{Aes128, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use rand::RngCore;
use salsa20::XSalsa20;
use thiserror::Error;
use zeroize::Zeroize;

use crate::checksum::{ChecksumId, KeyedMac};

/// Global-flags bit: chunks are AES-CTR encrypted.
pub const CRYPTO_ALG_AES: u16 = 0x10;
/// Global-flags bit: chunks are XSalsa20 encrypted.
pub const CRYPTO_ALG_SALSA20: u16 = 0x20;
/// Mask covering every crypto algorithm bit.
pub const CRYPTO_MASK: u16 = 0x30;

pub const SALT_LEN: usize = 32;
pub const AES_NONCE_LEN: usize = 8;
pub const XSALSA20_NONCE_LEN: usize = 24;
pub const DEFAULT_KEYLEN: usize = 32;
/// Key length implied by containers older than version 7.
pub const OLD_KEYLEN: usize = 16;
pub const MAX_SALT_LEN: usize = 64;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Invalid encryption algorithm — must be AES or SALSA20")]
    InvalidAlgorithm,
    #[error("Invalid encryption algorithm code {0:#x} — file corrupt?")]
    InvalidAlgorithmCode(u16),
    #[error("Encryption key length must be 16 or 32, got {0}")]
    InvalidKeyLength(usize),
    #[error("XSalsa20 requires a 256-bit key")]
    SalsaKeyLength,
    #[error("Key derivation failed")]
    KeyDerivation,
    #[error("Chunk id {0} exceeds the keystream counter space")]
    CounterOverflow(u64),
    #[error("Salt length {0} out of range")]
    SaltLength(usize),
    #[error("Failed to read password file: {0}")]
    PasswordRead(#[source] std::io::Error),
    #[error("Password is empty")]
    EmptyPassword,
}

// ── Algorithm selection ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoAlg {
    Aes,
    Salsa20,
}

impl CryptoAlg {
    pub fn from_name(s: &str) -> Result<Self, CryptoError> {
        match s.to_uppercase().as_str() {
            "AES"     => Ok(CryptoAlg::Aes),
            "SALSA20" => Ok(CryptoAlg::Salsa20),
            _         => Err(CryptoError::InvalidAlgorithm),
        }
    }

    /// Resolve the crypto bits of a header flags word.  Zero means
    /// unencrypted; any other residue is corruption.
    pub fn from_flags(flags: u16) -> Result<Option<Self>, CryptoError> {
        match flags & CRYPTO_MASK {
            0                  => Ok(None),
            CRYPTO_ALG_AES     => Ok(Some(CryptoAlg::Aes)),
            CRYPTO_ALG_SALSA20 => Ok(Some(CryptoAlg::Salsa20)),
            other              => Err(CryptoError::InvalidAlgorithmCode(other)),
        }
    }

    #[inline]
    pub fn to_flags(self) -> u16 {
        match self {
            CryptoAlg::Aes     => CRYPTO_ALG_AES,
            CryptoAlg::Salsa20 => CRYPTO_ALG_SALSA20,
        }
    }

    #[inline]
    pub fn nonce_len(self) -> usize {
        match self {
            CryptoAlg::Aes     => AES_NONCE_LEN,
            CryptoAlg::Salsa20 => XSALSA20_NONCE_LEN,
        }
    }
}

// ── Key material ─────────────────────────────────────────────────────────────

enum CipherKey {
    Aes128([u8; 16]),
    Aes256([u8; 32]),
    Salsa([u8; 32]),
}

impl Drop for CipherKey {
    fn drop(&mut self) {
        match self {
            CipherKey::Aes128(k) => k.zeroize(),
            CipherKey::Aes256(k) => k.zeroize(),
            CipherKey::Salsa(k)  => k.zeroize(),
        }
    }
}

/// Per-container crypto state.  Created once per pipeline run; workers
/// share it read-only for [`CryptoCtx::crypto_buf`] and clone
/// [`KeyedMac`]s out of it before [`CryptoCtx::clean_pkey`] runs.
pub struct CryptoCtx {
    pub alg:    CryptoAlg,
    pub keylen: usize,
    pub salt:   Vec<u8>,
    pub nonce:  Vec<u8>,
    cipher:     CipherKey,
    /// Derived-key copy used only to key HMACs; wiped by `clean_pkey`.
    mac_key:    Vec<u8>,
}

impl CryptoCtx {
    /// Derive key material for a new container: fresh random salt + nonce.
    pub fn for_encrypt(pw: &[u8], alg: CryptoAlg, keylen: usize) -> Result<Self, CryptoError> {
        let mut salt = vec![0u8; SALT_LEN];
        let mut nonce = vec![0u8; alg.nonce_len()];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce);
        Self::init(pw, alg, salt, nonce, keylen)
    }

    /// Rebuild key material from the salt and nonce stored in a container
    /// header.
    pub fn for_decrypt(
        pw: &[u8],
        alg: CryptoAlg,
        salt: Vec<u8>,
        nonce: Vec<u8>,
        keylen: usize,
    ) -> Result<Self, CryptoError> {
        Self::init(pw, alg, salt, nonce, keylen)
    }

    fn init(
        pw: &[u8],
        alg: CryptoAlg,
        salt: Vec<u8>,
        nonce: Vec<u8>,
        keylen: usize,
    ) -> Result<Self, CryptoError> {
        if pw.is_empty() {
            return Err(CryptoError::EmptyPassword);
        }
        if keylen != 16 && keylen != 32 {
            return Err(CryptoError::InvalidKeyLength(keylen));
        }
        if salt.is_empty() || salt.len() > MAX_SALT_LEN {
            return Err(CryptoError::SaltLength(salt.len()));
        }

        let mut key = vec![0u8; keylen];
        let params = scrypt::Params::new(14, 8, 1, keylen)
            .map_err(|_| CryptoError::KeyDerivation)?;
        scrypt::scrypt(pw, &salt, &params, &mut key)
            .map_err(|_| CryptoError::KeyDerivation)?;

        let cipher = match (alg, keylen) {
            (CryptoAlg::Aes, 16) => CipherKey::Aes128(key[..16].try_into().unwrap()),
            (CryptoAlg::Aes, 32) => CipherKey::Aes256(key[..32].try_into().unwrap()),
            (CryptoAlg::Salsa20, 32) => CipherKey::Salsa(key[..32].try_into().unwrap()),
            (CryptoAlg::Salsa20, _) => {
                key.zeroize();
                return Err(CryptoError::SalsaKeyLength);
            }
            _ => unreachable!("keylen validated above"),
        };

        let ctx = Self { alg, keylen, salt, nonce, cipher, mac_key: key };
        Ok(ctx)
    }

    /// Key an HMAC for chunk or header authentication.  Must be called
    /// before [`CryptoCtx::clean_pkey`].
    pub fn keyed_mac(&self, alg: ChecksumId) -> KeyedMac {
        debug_assert!(!self.mac_key.is_empty(), "keyed_mac after clean_pkey");
        KeyedMac::new(alg, &self.mac_key)
    }

    /// Wipe the MAC-keying copy of the derived key.  Called as soon as the
    /// header HMAC and all per-worker chunk HMACs have been keyed.
    pub fn clean_pkey(&mut self) {
        self.mac_key.zeroize();
        self.mac_key = Vec::new();
    }

    /// Apply the chunk keystream to `buf` in place.  Encryption and
    /// decryption are the same operation; the position is derived from
    /// `id` alone, so chunks may be processed in any order.
    pub fn crypto_buf(&self, buf: &mut [u8], id: u64) -> Result<(), CryptoError> {
        match &self.cipher {
            CipherKey::Aes128(key) => {
                let iv = aes_iv(&self.nonce, id)?;
                let mut c = Ctr128BE::<Aes128>::new(key.into(), GenericArray::from_slice(&iv));
                c.apply_keystream(buf);
            }
            CipherKey::Aes256(key) => {
                let iv = aes_iv(&self.nonce, id)?;
                let mut c = Ctr128BE::<Aes256>::new(key.into(), GenericArray::from_slice(&iv));
                c.apply_keystream(buf);
            }
            CipherKey::Salsa(key) => {
                let mut nonce: [u8; XSALSA20_NONCE_LEN] =
                    self.nonce.as_slice().try_into().map_err(|_| CryptoError::SaltLength(self.nonce.len()))?;
                let ctr = id.to_be_bytes();
                for (n, c) in nonce[16..].iter_mut().zip(ctr.iter()) {
                    *n ^= c;
                }
                let mut c = XSalsa20::new(key.into(), &nonce.into());
                c.apply_keystream(buf);
            }
        }
        Ok(())
    }
}

impl Drop for CryptoCtx {
    fn drop(&mut self) {
        self.mac_key.zeroize();
        self.salt.zeroize();
        self.nonce.zeroize();
    }
}

fn aes_iv(nonce: &[u8], id: u64) -> Result<[u8; 16], CryptoError> {
    if id > u32::MAX as u64 {
        return Err(CryptoError::CounterOverflow(id));
    }
    let mut iv = [0u8; 16];
    iv[..AES_NONCE_LEN].copy_from_slice(nonce);
    iv[8..12].copy_from_slice(&(id as u32).to_be_bytes());
    Ok(iv)
}

// ── Password handling ────────────────────────────────────────────────────────

/// Read the password from `path`, then overwrite the file with zeros and
/// truncate it.  Trailing whitespace is stripped.
pub fn read_password_file(path: &std::path::Path) -> Result<Vec<u8>, CryptoError> {
    use std::io::{Seek, SeekFrom, Write};

    let mut pw = std::fs::read(path).map_err(CryptoError::PasswordRead)?;
    // Shred before acting on the contents so a later error cannot leave the
    // password on disk.
    let shred = || -> std::io::Result<()> {
        let mut f = std::fs::OpenOptions::new().write(true).open(path)?;
        let zeros = vec![0u8; pw.len()];
        f.seek(SeekFrom::Start(0))?;
        f.write_all(&zeros)?;
        f.set_len(0)?;
        Ok(())
    };
    shred().map_err(CryptoError::PasswordRead)?;

    while pw.last().is_some_and(|b| b.is_ascii_whitespace()) {
        pw.pop();
    }
    if pw.is_empty() {
        return Err(CryptoError::EmptyPassword);
    }
    Ok(pw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(alg: CryptoAlg, keylen: usize) -> CryptoCtx {
        CryptoCtx::for_encrypt(b"correct horse battery staple", alg, keylen).unwrap()
    }

    #[test]
    fn roundtrip_all_algorithms() {
        for (alg, keylen) in [
            (CryptoAlg::Aes, 16),
            (CryptoAlg::Aes, 32),
            (CryptoAlg::Salsa20, 32),
        ] {
            let c = ctx(alg, keylen);
            let plain: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
            let mut buf = plain.clone();
            c.crypto_buf(&mut buf, 7).unwrap();
            assert_ne!(buf, plain);
            c.crypto_buf(&mut buf, 7).unwrap();
            assert_eq!(buf, plain);
        }
    }

    #[test]
    fn distinct_chunk_ids_distinct_keystreams() {
        let c = ctx(CryptoAlg::Aes, 32);
        let mut a = vec![0u8; 64];
        let mut b = vec![0u8; 64];
        c.crypto_buf(&mut a, 0).unwrap();
        c.crypto_buf(&mut b, 1).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn decrypt_side_matches_encrypt_side() {
        let enc = ctx(CryptoAlg::Salsa20, 32);
        let dec = CryptoCtx::for_decrypt(
            b"correct horse battery staple",
            CryptoAlg::Salsa20,
            enc.salt.clone(),
            enc.nonce.clone(),
            32,
        )
        .unwrap();

        let mut buf = b"attack at dawn".to_vec();
        enc.crypto_buf(&mut buf, 3).unwrap();
        dec.crypto_buf(&mut buf, 3).unwrap();
        assert_eq!(buf, b"attack at dawn");
    }

    #[test]
    fn wrong_password_wrong_keystream() {
        let enc = ctx(CryptoAlg::Aes, 32);
        let dec = CryptoCtx::for_decrypt(
            b"not the password",
            CryptoAlg::Aes,
            enc.salt.clone(),
            enc.nonce.clone(),
            32,
        )
        .unwrap();
        let mut buf = b"attack at dawn".to_vec();
        enc.crypto_buf(&mut buf, 0).unwrap();
        dec.crypto_buf(&mut buf, 0).unwrap();
        assert_ne!(buf, b"attack at dawn");
    }

    #[test]
    fn salsa_rejects_short_key() {
        assert!(matches!(
            CryptoCtx::for_encrypt(b"pw", CryptoAlg::Salsa20, 16),
            Err(CryptoError::SalsaKeyLength)
        ));
    }

    #[test]
    fn clean_pkey_keeps_chunk_cipher_usable() {
        let mut c = ctx(CryptoAlg::Aes, 32);
        let mac = c.keyed_mac(crate::checksum::ChecksumId::Blake256);
        c.clean_pkey();
        // HMAC cloned out beforehand still signs; the cipher still runs.
        let _ = mac.compute(&[b"still works"]);
        let mut buf = vec![0u8; 16];
        c.crypto_buf(&mut buf, 0).unwrap();
    }

    #[test]
    fn password_file_is_shredded_after_read() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"hunter2\n").unwrap();
        let pw = read_password_file(f.path()).unwrap();
        assert_eq!(pw, b"hunter2");
        assert_eq!(std::fs::metadata(f.path()).unwrap().len(), 0);
    }
}

use std::io::Cursor;

use parz::checksum::ChecksumId;
use parz::chunk::{encode_frame, ChunkTag, FrameParams, TRAILER};
use parz::crypto::CryptoAlg;
use parz::dedup::SplitMode;
use parz::header::{FileHeader, ParsedHeader, MIN_VERSION, VERSION};
use parz::pipeline::{
    compress_stream, decompress_stream, CryptoOpts, DedupOpts, PipelineOpts, ScratchSpec,
};
use parz::{CodecId, PzError};

// ── Helpers ──────────────────────────────────────────────────────────────────

fn compress(opts: PipelineOpts, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    compress_stream(opts, &mut Cursor::new(data), &mut out, Some(data.len() as u64)).unwrap();
    out
}

fn decompress(container: &[u8], password: Option<&[u8]>) -> Result<Vec<u8>, PzError> {
    let mut input = Cursor::new(container);
    let parsed = ParsedHeader::read(&mut input, None)?;
    let mut out = Vec::new();
    decompress_stream(
        parsed,
        &mut input,
        &mut out,
        password.map(|p| p.to_vec()),
        0,
        ScratchSpec::None,
    )?;
    Ok(out)
}

fn opts(algo: CodecId, chunksize: u64) -> PipelineOpts {
    PipelineOpts { chunksize, ..PipelineOpts::new(algo) }
}

/// Deterministic high-entropy bytes (xorshift-mixed counter).
fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}

fn compressible(len: usize) -> Vec<u8> {
    b"hello\n".iter().copied().cycle().take(len).collect()
}

// ── Round trips ──────────────────────────────────────────────────────────────

#[test]
fn roundtrip_every_codec_every_edge_length() {
    for chunksize in [4096u64, 65536] {
        let s = chunksize as usize;
        let inputs: Vec<Vec<u8>> = vec![
            Vec::new(),
            vec![0x42],
            noise(s - 1, 7),
            noise(s, 11),
            noise(s + 1, 13),
            noise(3 * s + 7, 17),
            compressible(600),
            noise(2 * s + 31, 23),
        ];
        for algo in [
            CodecId::None,
            CodecId::Zlib,
            CodecId::Lzma,
            CodecId::Bzip2,
            CodecId::Lz4,
            CodecId::Adapt2,
        ] {
            for data in &inputs {
                let c = compress(opts(algo, chunksize), data);
                let d = decompress(&c, None).unwrap();
                assert_eq!(
                    &d, data,
                    "roundtrip failed: algo={algo:?} chunksize={chunksize} len={}",
                    data.len()
                );
            }
        }
    }
}

#[test]
fn roundtrip_every_checksum() {
    let data = noise(100_000, 29);
    for cksum in [
        ChecksumId::Crc64,
        ChecksumId::Blake256,
        ChecksumId::Blake512,
        ChecksumId::Sha256,
        ChecksumId::Sha512,
        ChecksumId::Keccak256,
        ChecksumId::Keccak512,
    ] {
        let mut o = opts(CodecId::Lz4, 16384);
        o.checksum = cksum;
        let c = compress(o, &data);
        assert_eq!(decompress(&c, None).unwrap(), data, "checksum {cksum:?}");
    }
}

#[test]
fn roundtrip_transform_stack_combinations() {
    // Redundant + structured data so every transform has something to do.
    let mut data = Vec::new();
    let block = compressible(8192);
    for _ in 0..6 {
        data.extend_from_slice(&block);
    }
    let mut v = 1_000u64;
    for _ in 0..4096 {
        data.extend_from_slice(&v.to_be_bytes());
        v = v.wrapping_add(97);
    }

    let dedup_modes: [Option<DedupOpts>; 3] = [
        None,
        Some(DedupOpts { mode: SplitMode::Content, global: false, blk_class: 1 }),
        Some(DedupOpts { mode: SplitMode::Fixed, global: false, blk_class: 1 }),
    ];
    for dedup in dedup_modes {
        for (lzp, delta2) in [(false, false), (true, false), (false, true), (true, true)] {
            let mut o = opts(CodecId::Zlib, 32768);
            o.dedup = dedup.clone();
            o.lzp = lzp;
            o.delta2 = delta2;
            let c = compress(o, &data);
            assert_eq!(
                decompress(&c, None).unwrap(),
                data,
                "dedup={dedup:?} lzp={lzp} delta2={delta2}"
            );
        }
    }
}

#[test]
fn roundtrip_encryption_matrix() {
    let data = noise(200_000, 31);
    for (alg, keylen) in [
        (CryptoAlg::Aes, 16usize),
        (CryptoAlg::Aes, 32),
        (CryptoAlg::Salsa20, 32),
    ] {
        for cksum in [ChecksumId::Blake256, ChecksumId::Sha512] {
            let mut o = opts(CodecId::Lz4, 65536);
            o.checksum = cksum;
            o.crypto = Some(CryptoOpts { alg, keylen, password: b"tr0ub4dor&3".to_vec() });
            let c = compress(o, &data);
            assert_eq!(
                decompress(&c, Some(b"tr0ub4dor&3")).unwrap(),
                data,
                "alg={alg:?} keylen={keylen} cksum={cksum:?}"
            );
        }
    }
}

// ── Tamper detection ─────────────────────────────────────────────────────────

#[test]
fn encrypted_header_bit_flips_are_fatal() {
    let data = noise(10_000, 37);
    let mut o = opts(CodecId::Lz4, 4096);
    o.crypto = Some(CryptoOpts {
        alg:      CryptoAlg::Aes,
        keylen:   32,
        password: b"secret".to_vec(),
    });
    let c = compress(o, &data);

    // The encrypted header: fixed fields + salt + nonce + keylen + HMAC.
    let header_len = 24 + 4 + 32 + 8 + 4 + 32;
    for byte in 0..header_len {
        let mut bad = c.clone();
        bad[byte] ^= 0x01;
        assert!(
            decompress(&bad, Some(b"secret")).is_err(),
            "header byte {byte} flip went undetected"
        );
    }
}

#[test]
fn encrypted_chunk_bit_flips_are_fatal() {
    let data = noise(30_000, 41);
    let mut o = opts(CodecId::Lz4, 8192);
    o.crypto = Some(CryptoOpts {
        alg:      CryptoAlg::Salsa20,
        keylen:   32,
        password: b"secret".to_vec(),
    });
    let c = compress(o, &data);

    let header_len = 24 + 4 + 32 + 24 + 4 + 32;
    // Sample bit positions across the chunk region (every ~700th byte).
    for byte in (header_len..c.len() - 8).step_by(701) {
        let mut bad = c.clone();
        bad[byte] ^= 0x80;
        assert!(
            decompress(&bad, Some(b"secret")).is_err(),
            "chunk byte {byte} flip went undetected"
        );
    }
}

#[test]
fn wrong_password_fails_like_tampering() {
    let data = noise(5_000, 43);
    let mut o = opts(CodecId::None, 4096);
    o.crypto = Some(CryptoOpts {
        alg:      CryptoAlg::Aes,
        keylen:   32,
        password: b"right".to_vec(),
    });
    let c = compress(o, &data);

    let err = decompress(&c, Some(b"wrong")).unwrap_err();
    assert!(
        matches!(err, PzError::Header(parz::HeaderError::Verification)),
        "wrong password must fail header verification, got {err}"
    );
}

#[test]
fn plain_chunk_corruption_is_fatal() {
    let data = compressible(50_000);
    let c = compress(opts(CodecId::Zlib, 8192), &data);
    for at in [40, c.len() / 2, c.len() - 20] {
        let mut bad = c.clone();
        bad[at] ^= 0x04;
        assert!(decompress(&bad, None).is_err(), "flip at {at} undetected");
    }
}

// ── Ordering and structure ───────────────────────────────────────────────────

#[test]
fn order_invariance_across_thread_counts() {
    // Chunks carry their ordinal so any reordering corrupts the data.
    let chunksize = 2048usize;
    let nchunks = 80;
    let mut data = Vec::with_capacity(chunksize * nchunks);
    for i in 0..nchunks as u32 {
        let mut block = noise(chunksize, 1000 + i as u64);
        block[..4].copy_from_slice(&i.to_be_bytes());
        data.extend_from_slice(&block);
    }

    for n in [1usize, 2, 4, 8] {
        let mut o = opts(CodecId::Lz4, chunksize as u64);
        o.nthreads = n;
        let c = compress(o, &data);

        let mut input = Cursor::new(&c);
        let parsed = ParsedHeader::read(&mut input, None).unwrap();
        let mut out = Vec::new();
        decompress_stream(parsed, &mut input, &mut out, None, n, ScratchSpec::None).unwrap();
        assert_eq!(out, data, "order broken at {n} threads");
    }
}

#[test]
fn incompressible_chunks_store_verbatim() {
    let data = noise(3 * 4096, 47);
    let c = compress(opts(CodecId::Zlib, 4096), &data);
    // Verbatim storage: each chunk is payload == 4096 plus fixed framing.
    // The container must be (slightly) larger than the input, never
    // smaller, and still round-trip.
    assert!(c.len() > data.len());
    assert_eq!(decompress(&c, None).unwrap(), data);
}

#[test]
fn trailer_is_eight_zero_bytes_and_required() {
    let data = compressible(10_000);
    let c = compress(opts(CodecId::Zlib, 4096), &data);
    assert_eq!(&c[c.len() - 8..], &TRAILER);

    let cut = &c[..c.len() - 8];
    assert!(decompress(cut, None).is_err());
}

#[test]
fn global_dedup_roundtrips_in_order() {
    // Repeated cross-chunk blocks: later chunks reference earlier ones.
    let block = noise(8192, 53);
    let mut data = Vec::new();
    for i in 0..64u32 {
        if i % 3 == 0 {
            data.extend_from_slice(&block);
        } else {
            let mut b = noise(8192, 100 + i as u64);
            b[..4].copy_from_slice(&i.to_be_bytes());
            data.extend_from_slice(&b);
        }
    }

    let mut o = opts(CodecId::Lz4, 4 * 8192);
    o.nthreads = 4;
    o.dedup = Some(DedupOpts { mode: SplitMode::Fixed, global: true, blk_class: 2 });
    let c = compress(o, &data);
    assert!(c.len() < data.len());

    let dir = tempfile::tempdir().unwrap();
    let out_path = dir.path().join("restored");
    let mut out = std::fs::File::create(&out_path).unwrap();
    let mut input = Cursor::new(&c);
    let parsed = ParsedHeader::read(&mut input, None).unwrap();
    decompress_stream(
        parsed,
        &mut input,
        &mut out,
        None,
        4,
        ScratchSpec::Output(out_path.clone()),
    )
    .unwrap();
    drop(out);
    assert_eq!(std::fs::read(&out_path).unwrap(), data);
}

// ── Archive mode ─────────────────────────────────────────────────────────────

#[test]
fn archive_roundtrip_restores_tree_in_sorted_order() {
    use std::fs;

    let src = tempfile::tempdir().unwrap();
    let root = src.path().join("tree");
    fs::create_dir_all(root.join("sub")).unwrap();
    fs::write(root.join("big.log"), compressible(9000)).unwrap();
    fs::write(root.join("small.log"), b"tiny").unwrap();
    fs::write(root.join("sub/data.txt"), noise(3000, 59)).unwrap();
    fs::write(root.join("notes.txt"), b"some notes").unwrap();

    let mut container = Vec::new();
    let o = opts(CodecId::Zlib, 16384);
    parz::archive::compress_archive(&[root.clone()], true, o, &mut container).unwrap();

    // The decompressed stream is a tar archive whose file entries appear
    // in (extension, size) order.
    let tar_bytes = decompress(&container, None).unwrap();
    let mut names = Vec::new();
    let mut ar = tar::Archive::new(Cursor::new(&tar_bytes));
    for entry in ar.entries().unwrap() {
        let entry = entry.unwrap();
        if entry.header().entry_type().is_file() {
            names.push(entry.path().unwrap().to_string_lossy().into_owned());
        }
    }
    assert_eq!(
        names,
        ["tree/small.log", "tree/big.log", "tree/notes.txt", "tree/sub/data.txt"]
    );

    // Full extraction restores contents.
    let dst = tempfile::tempdir().unwrap();
    let mut input = Cursor::new(&container);
    let parsed = ParsedHeader::read(&mut input, None).unwrap();
    parz::archive::extract_archive(
        parsed,
        &mut input,
        dst.path(),
        None,
        0,
        false,
        parz::archive::ExtractOpts::default(),
    )
    .unwrap();

    let restored = dst.path().join("tree");
    assert_eq!(fs::read(restored.join("big.log")).unwrap(), compressible(9000));
    assert_eq!(fs::read(restored.join("small.log")).unwrap(), b"tiny");
    assert_eq!(fs::read(restored.join("sub/data.txt")).unwrap(), noise(3000, 59));
}

// ── Legacy read ──────────────────────────────────────────────────────────────

#[test]
fn legacy_skein_container_decodes_via_blake() {
    // Hand-build a VERSION-3 container flagged SKEIN256 (0x800): readers
    // must fall back to the BLAKE256 table and verify cleanly.
    let payload = b"legacy chunk payload".to_vec();
    let header = FileHeader {
        algo:      CodecId::None,
        version:   MIN_VERSION,
        flags:     0x800 | parz::header::FLAG_SINGLE_CHUNK,
        chunksize: 4096,
        level:     6,
        crypto:    None,
    };
    let mut container = Vec::new();
    header.write(&mut container, None).unwrap();

    let params = FrameParams::new(ChecksumId::Blake256, false, MIN_VERSION);
    let ck = parz::checksum::digest(ChecksumId::Blake256, &payload);
    let frame = encode_frame(
        &params,
        &ChunkTag::Crc32,
        parz::chunk::CHUNK_FLAG_CHSIZE,
        &ck,
        &payload,
        Some(payload.len() as u64),
    );
    container.extend_from_slice(&frame);
    container.extend_from_slice(&TRAILER);

    assert_eq!(decompress(&container, None).unwrap(), payload);
    assert_eq!(MIN_VERSION, VERSION - 3);
}

//! The chunk pipeline — reader, worker pool, and sequenced writer.
//!
//! # Shape
//!
//! One reader (the calling thread), `nthreads` workers, one writer
//! thread.  Every worker owns a buffer pair that cycles through three
//! bounded(1) channels:
//!
//! ```text
//!            job[k]            done[k]
//!   reader ─────────▶ worker k ─────────▶ writer
//!      ▲                                    │
//!      └────────────────────────────────────┘
//!                     free[k]
//! ```
//!
//! `free[k]` is seeded with one empty pair ("buffer ready to fill"), so
//! the cycle is exactly the start / cmp_done / write_done semaphore
//! triple: the reader cannot lap a worker still holding its buffer, the
//! writer cannot pass a worker still computing, and queue depth is
//! exactly N chunks.
//!
//! Both reader and writer walk workers round-robin `0..N-1, 0..N-1, …`.
//! Chunk `i` always lands on worker `i mod N`, and the writer drains in
//! the same order, so on-disk order equals input order no matter how
//! workers finish.  The reader keeps one spare buffer and swaps it into
//! the worker's pair, so the next read overlaps the previous chunk's
//! compression.
//!
//! # Cancellation
//!
//! Any fatal error stores itself in the shared error slot, raises
//! `cancel`, and tears down its channel endpoints.  Disconnection
//! propagates around the cycle (and around the global-dedup token ring),
//! so every thread unblocks at its next suspension point and exits; the
//! first recorded error wins.
//!
//! # Global-dedup token ring
//!
//! With global dedup a `()` token circulates through per-worker channels
//! in chunk order.  Compressing, worker `k` takes its token, consults the
//! shared index, and passes the token on — index access is strictly
//! ordered.  Extracting, the *writer* hands worker `k+1` its token only
//! after chunk `k` is durable, so cross-chunk refs always resolve against
//! bytes already written.

use crossbeam_channel::{bounded, Receiver, Sender};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use zeroize::Zeroize;

use crate::checksum::{digest, ChecksumId};
use crate::chunk::{
    encode_frame, read_frame, ChunkTag, FrameParams, FrameView, RawChunk, CHUNK_FLAG_ADAPT_SHIFT,
    CHUNK_FLAG_CHSIZE, CHUNK_FLAG_COMPRESSED, CHUNK_FLAG_DEDUP, CHUNK_FLAG_PREPROC, TRAILER,
};
use crate::codec::{new_codec, Codec, CompressOutcome, LzmaCodec};
use crate::crypto::{CryptoAlg, CryptoCtx};
use crate::dedup::{
    dedup_compress, dedup_reconstruct, rab_blk_size, transpose, untranspose, DedupHdr,
    GlobalIndex, ScratchReader, SplitMode, DEDUP_HDR_SIZE, INDEX_COMPRESS_MIN, INDEX_STRIDE,
};
use crate::header::{
    CryptoHeader, FileHeader, ParsedHeader, FLAG_ARCHIVE, FLAG_DEDUP, FLAG_DEDUP_FIXED,
    FLAG_SINGLE_CHUNK, VERSION,
};
use crate::preproc::{preproc_compress, preproc_decompress, PREPROC_COMPRESSED};
use crate::{CodecId, PzError};

// ── Options ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DedupOpts {
    pub mode:      SplitMode,
    pub global:    bool,
    pub blk_class: u8,
}

pub struct CryptoOpts {
    pub alg:      CryptoAlg,
    pub keylen:   usize,
    pub password: Vec<u8>,
}

pub struct PipelineOpts {
    pub algo:      CodecId,
    pub level:     u8,
    pub chunksize: u64,
    /// Requested worker count; 0 means one per core.
    pub nthreads:  usize,
    pub checksum:  ChecksumId,
    pub dedup:     Option<DedupOpts>,
    pub lzp:       bool,
    pub delta2:    bool,
    pub crypto:    Option<CryptoOpts>,
    pub archive:   bool,
}

impl PipelineOpts {
    pub fn new(algo: CodecId) -> Self {
        Self {
            algo,
            level:     algo.default_level(),
            chunksize: crate::header::DEFAULT_CHUNKSIZE,
            nthreads:  0,
            checksum:  crate::checksum::DEFAULT_CHECKSUM,
            dedup:     None,
            lzp:       false,
            delta2:    false,
            crypto:    None,
            archive:   false,
        }
    }
}

/// Where extraction materializes plaintext for cross-chunk refs.
pub enum ScratchSpec {
    /// No global dedup in the container.
    None,
    /// Tee every plaintext chunk into this file; it is removed on success.
    Tee(PathBuf),
    /// Workers re-read the main output file itself.
    Output(PathBuf),
}

// ── Statistics ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkStats {
    pub chunks:    u64,
    pub smallest:  u64,
    pub largest:   u64,
    pub total_cmp: u64,
}

impl ChunkStats {
    fn record(&mut self, len_cmp: u64) {
        if self.chunks == 0 || len_cmp < self.smallest {
            self.smallest = len_cmp;
        }
        if len_cmp > self.largest {
            self.largest = len_cmp;
        }
        self.total_cmp += len_cmp;
        self.chunks += 1;
    }

    pub fn average(&self) -> u64 {
        if self.chunks == 0 {
            0
        } else {
            self.total_cmp / self.chunks
        }
    }
}

// ── Shared plumbing ──────────────────────────────────────────────────────────

struct Shared {
    cancel: AtomicBool,
    error:  Mutex<Option<PzError>>,
}

impl Shared {
    fn new() -> Arc<Self> {
        Arc::new(Self { cancel: AtomicBool::new(false), error: Mutex::new(None) })
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// First error wins; every fatality also raises the cancel flag.
    fn fail(&self, e: PzError) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(e);
        }
        self.cancel.store(true, Ordering::Relaxed);
    }

    fn take(&self) -> Option<PzError> {
        self.error.lock().unwrap().take()
    }
}

struct BufPair {
    input: Vec<u8>,
    frame: Vec<u8>,
}

fn resolve_nthreads(requested: usize, input_size: Option<u64>, chunksize: u64) -> usize {
    let cores = num_cpus::get().max(1);
    let mut n = if requested == 0 { cores } else { requested.min(cores) };
    if let Some(sz) = input_size {
        let chunks = sz.div_ceil(chunksize).max(1);
        n = n.min(chunks as usize);
    }
    n.max(1)
}

/// Read until `buf` is full or EOF.
fn read_full(r: &mut dyn Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut got = 0usize;
    while got < buf.len() {
        match r.read(&mut buf[got..])? {
            0 => break,
            n => got += n,
        }
    }
    Ok(got)
}

// ── Compression ──────────────────────────────────────────────────────────────

struct CompressJob {
    id:          u64,
    raw_len:     usize,
    file_offset: u64,
    pair:        BufPair,
}

struct CompressDone {
    id:      u64,
    len_cmp: u64,
    pair:    BufPair,
}

/// Run one chunk through the preprocessing stack and final codec.
/// Returns the stage output plus the PREPROC / COMPRESSED flag states.
/// The output never exceeds the input: expansion falls back to verbatim.
fn data_stage(
    codec: &mut dyn Codec,
    src: &[u8],
    level: u8,
    lzp: bool,
    delta2_span: usize,
) -> Result<(Vec<u8>, bool, bool), PzError> {
    if lzp || delta2_span > 0 {
        let mut sub = Vec::new();
        if let Some(ptype) = preproc_compress(codec, src, &mut sub, level, lzp, delta2_span)? {
            if sub.len() < src.len() {
                return Ok((sub, true, ptype & PREPROC_COMPRESSED != 0));
            }
            return Ok((src.to_vec(), false, false));
        }
    }
    let mut out = Vec::new();
    match codec.compress(src, &mut out, level)? {
        CompressOutcome::Compressed => Ok((out, false, true)),
        CompressOutcome::Incompressible => Ok((src.to_vec(), false, false)),
    }
}

struct CompressWorker {
    codec:       Box<dyn Codec>,
    index_codec: LzmaCodec,
    mac:         Option<crate::checksum::KeyedMac>,
    crypto:      Option<Arc<CryptoCtx>>,
    params:      FrameParams,
    cksum:       ChecksumId,
    level:       u8,
    chunksize:   u64,
    lzp:         bool,
    delta2_span: usize,
    dedup:       Option<DedupOpts>,
    gidx:        Option<Arc<GlobalIndex>>,
    ring_rx:     Option<Receiver<()>>,
    ring_tx:     Option<Sender<()>>,
}

impl CompressWorker {
    /// Returns the payload length (`len_cmp`) of the sealed frame.
    fn process(&mut self, job: &mut CompressJob) -> Result<u64, PzError> {
        let src = &job.pair.input[..job.raw_len];
        let mut flags = 0u8;

        // 1. Dedup.  Global mode takes the index token, publishes/queries,
        //    and passes the token on — strict chunk order.
        let mut dedup_frame = Vec::new();
        let mut deduped = false;
        if let Some(d) = &self.dedup {
            if d.global {
                let rx = self.ring_rx.as_ref().expect("global dedup ring");
                rx.recv().map_err(|_| PzError::Cancelled)?;
                let gidx = self.gidx.as_ref().expect("global index");
                deduped = dedup_compress(
                    src,
                    &mut dedup_frame,
                    d.mode,
                    rab_blk_size(d.blk_class),
                    Some((gidx, job.file_offset)),
                );
                let _ = self.ring_tx.as_ref().expect("ring tx").send(());
            } else {
                deduped = dedup_compress(
                    src,
                    &mut dedup_frame,
                    d.mode,
                    rab_blk_size(d.blk_class),
                    None,
                );
            }
        }

        // 2. Plaintext digest (replaced by the chunk HMAC when encrypting).
        let checksum = if self.crypto.is_none() {
            digest(self.cksum, src)
        } else {
            Vec::new()
        };

        // 3–5. Build the payload.
        let mut payload;
        if deduped {
            let hdr = DedupHdr::parse(&dedup_frame)?;
            let index = &dedup_frame[DEDUP_HDR_SIZE..DEDUP_HDR_SIZE + hdr.index_sz as usize];
            let data = &dedup_frame[DEDUP_HDR_SIZE + hdr.index_sz as usize..];

            // Index: transpose always; lzma only when big enough to win.
            let mut tindex = Vec::new();
            transpose(index, &mut tindex, INDEX_STRIDE);
            let mut index_cmp = Vec::new();
            let stored_index: &[u8] = if hdr.index_sz >= INDEX_COMPRESS_MIN {
                match self.index_codec.compress(&tindex, &mut index_cmp, self.level) {
                    Ok(CompressOutcome::Compressed) => &index_cmp,
                    _ => &tindex,
                }
            } else {
                &tindex
            };

            let (data_cmp, pre, comp) =
                data_stage(self.codec.as_mut(), data, self.level, self.lzp, self.delta2_span)?;

            payload = Vec::with_capacity(DEDUP_HDR_SIZE + stored_index.len() + data_cmp.len());
            payload.extend_from_slice(&dedup_frame[..DEDUP_HDR_SIZE]);
            payload.extend_from_slice(stored_index);
            payload.extend_from_slice(&data_cmp);
            DedupHdr::update_in(&mut payload, stored_index.len() as u64, data_cmp.len() as u64);

            flags |= CHUNK_FLAG_DEDUP;
            if pre {
                flags |= CHUNK_FLAG_PREPROC;
            }
            if comp {
                flags |= CHUNK_FLAG_COMPRESSED;
            }
        } else {
            let (out, pre, comp) =
                data_stage(self.codec.as_mut(), src, self.level, self.lzp, self.delta2_span)?;
            payload = out;
            if pre {
                flags |= CHUNK_FLAG_PREPROC;
            }
            if comp {
                flags |= CHUNK_FLAG_COMPRESSED;
            }
        }

        // 6. Adaptive sub-codec id.
        if flags & CHUNK_FLAG_COMPRESSED != 0 {
            if let Some(choice) = self.codec.adapt_choice() {
                flags |= choice << CHUNK_FLAG_ADAPT_SHIFT;
            }
        }

        // 7. Encrypt in place; the keystream position is the chunk id.
        if let Some(ctx) = &self.crypto {
            ctx.crypto_buf(&mut payload, job.id)?;
        }

        // 8. Short chunk carries its own length.
        let raw_len = if (job.raw_len as u64) < self.chunksize {
            flags |= CHUNK_FLAG_CHSIZE;
            Some(job.raw_len as u64)
        } else {
            None
        };

        // 9. Seal the frame; the tag covers the zeroed MAC slot.
        let tag = match &self.mac {
            Some(mac) => ChunkTag::Hmac(mac),
            None => ChunkTag::Crc32,
        };
        let len_cmp = payload.len() as u64;
        job.pair.frame = encode_frame(&self.params, &tag, flags, &checksum, &payload, raw_len);
        Ok(len_cmp)
    }
}

/// Compress `input` into `output` as a complete container (header, chunk
/// frames, trailer).  `input_size`, when known, enables the single-chunk
/// layout and bounds the worker count.
pub fn compress_stream(
    mut opts: PipelineOpts,
    input: &mut dyn Read,
    output: &mut (dyn Write + Send),
    input_size: Option<u64>,
) -> Result<ChunkStats, PzError> {
    if opts.chunksize == 0 {
        return Err(PzError::InvalidConfig("Chunk size must be non-zero".into()));
    }
    if opts.dedup.is_some() && opts.checksum == ChecksumId::Crc64 {
        return Err(PzError::InvalidConfig(
            "CRC64 checksum is not suitable for deduplication".into(),
        ));
    }
    // Probe codec availability up front, not in a worker.
    new_codec(opts.algo)?;

    let chunksize = opts.chunksize;
    let mut single_chunk = false;
    if let Some(sz) = input_size {
        if sz > 0 && sz <= chunksize && !opts.archive {
            single_chunk = true;
            if let Some(d) = opts.dedup.as_mut() {
                // Global dedup degenerates with one chunk.
                d.global = false;
            }
        }
    }
    let nthreads = if single_chunk {
        1
    } else {
        resolve_nthreads(opts.nthreads, input_size, chunksize)
    };
    log::info!("Scaling to {} thread(s)", nthreads);

    // Header flags.
    let mut flags = opts.checksum.to_flags();
    if let Some(d) = &opts.dedup {
        flags |= match (d.global, d.mode) {
            (true, _)                  => FLAG_DEDUP | FLAG_DEDUP_FIXED,
            (false, SplitMode::Content) => FLAG_DEDUP,
            (false, SplitMode::Fixed)   => FLAG_DEDUP_FIXED,
        };
    }
    if single_chunk {
        flags |= FLAG_SINGLE_CHUNK;
    }
    if opts.archive {
        flags |= FLAG_ARCHIVE;
    }

    // Crypto: derive the key, key the per-worker HMACs, write the header,
    // then wipe the MAC-keying copy before any payload moves.
    let mut crypto_ctx = None;
    if let Some(c) = opts.crypto.as_mut() {
        flags |= c.alg.to_flags();
        let ctx = CryptoCtx::for_encrypt(&c.password, c.alg, c.keylen)?;
        c.password.zeroize();
        crypto_ctx = Some(ctx);
    }

    let params = FrameParams::new(opts.checksum, crypto_ctx.is_some(), VERSION);
    let header = FileHeader {
        algo: opts.algo,
        version: VERSION,
        flags,
        chunksize,
        level: opts.level,
        crypto: crypto_ctx.as_ref().map(|ctx| CryptoHeader {
            alg:    ctx.alg,
            salt:   ctx.salt.clone(),
            nonce:  ctx.nonce.clone(),
            keylen: ctx.keylen as u32,
        }),
    };

    let worker_macs: Vec<_> = (0..nthreads)
        .map(|_| crypto_ctx.as_ref().map(|ctx| ctx.keyed_mac(opts.checksum)))
        .collect();
    match &mut crypto_ctx {
        Some(ctx) => {
            let hdr_mac = ctx.keyed_mac(opts.checksum);
            header.write(output, Some(&hdr_mac))?;
            ctx.clean_pkey();
        }
        None => header.write(output, None)?,
    }
    let crypto_ctx = crypto_ctx.map(Arc::new);

    let gidx = opts
        .dedup
        .as_ref()
        .filter(|d| d.global)
        .map(|_| Arc::new(GlobalIndex::new()));

    // Channels: the three-semaphore cycle, plus the dedup token ring.
    let shared = Shared::new();
    let mut job_txs = Vec::new();
    let mut job_rxs = Vec::new();
    let mut done_txs = Vec::new();
    let mut done_rxs = Vec::new();
    let mut free_txs = Vec::new();
    let mut free_rxs = Vec::new();
    for _ in 0..nthreads {
        let (jt, jr) = bounded::<CompressJob>(1);
        let (dt, dr) = bounded::<Result<CompressDone, PzError>>(1);
        let (ft, fr) = bounded::<BufPair>(1);
        // write_done starts at 1: the buffer is empty and fillable.
        ft.send(BufPair { input: vec![0u8; chunksize as usize], frame: Vec::new() })
            .unwrap();
        job_txs.push(jt);
        job_rxs.push(jr);
        done_txs.push(dt);
        done_rxs.push(dr);
        free_txs.push(ft);
        free_rxs.push(fr);
    }

    let mut ring_rxs: Vec<Option<Receiver<()>>> = (0..nthreads).map(|_| None).collect();
    let mut ring_txs: Vec<Option<Sender<()>>> = (0..nthreads).map(|_| None).collect();
    if gidx.is_some() {
        let mut rx_ring = Vec::new();
        let mut tx_ring = Vec::new();
        for _ in 0..nthreads {
            let (t, r) = bounded::<()>(2);
            tx_ring.push(t);
            rx_ring.push(r);
        }
        // The first worker starts without waiting.
        tx_ring[0].send(()).unwrap();
        for k in 0..nthreads {
            ring_rxs[k] = Some(rx_ring[k].clone());
            ring_txs[k] = Some(tx_ring[(k + 1) % nthreads].clone());
        }
        drop(tx_ring);
    }

    let delta2_span = if opts.delta2 {
        new_codec(opts.algo)?.props(opts.level, chunksize).delta2_span
    } else {
        0
    };

    let stats = thread::scope(|s| -> Result<ChunkStats, PzError> {
        // Workers.
        for k in 0..nthreads {
            let job_rx = job_rxs.remove(0);
            let done_tx = done_txs.remove(0);
            let shared = Arc::clone(&shared);
            let mut w = CompressWorker {
                codec:       new_codec(opts.algo)?,
                index_codec: LzmaCodec,
                mac:         worker_macs[k].clone(),
                crypto:      crypto_ctx.clone(),
                params,
                cksum:       opts.checksum,
                level:       opts.level,
                chunksize,
                lzp:         opts.lzp,
                delta2_span,
                dedup:       opts.dedup.clone(),
                gidx:        gidx.clone(),
                ring_rx:     ring_rxs[k].take(),
                ring_tx:     ring_txs[k].take(),
            };
            s.spawn(move || {
                for mut job in job_rx.iter() {
                    if shared.cancelled() {
                        break;
                    }
                    let id = job.id;
                    match w.process(&mut job) {
                        Ok(len_cmp) => {
                            let done = CompressDone { id, len_cmp, pair: job.pair };
                            if done_tx.send(Ok(done)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            shared.fail(PzError::chunk_context(id, e));
                            let _ = done_tx.send(Err(PzError::Cancelled));
                            break;
                        }
                    }
                }
            });
        }

        // Writer: drain workers round-robin, preserving chunk order.
        let writer = {
            let shared = Arc::clone(&shared);
            let out: &mut (dyn Write + Send) = &mut *output;
            s.spawn(move || {
                let mut stats = ChunkStats::default();
                'outer: loop {
                    for k in 0..nthreads {
                        let msg = match done_rxs[k].recv() {
                            Ok(m) => m,
                            Err(_) => break 'outer, // all chunks drained
                        };
                        let done = match msg {
                            Ok(d) => d,
                            Err(_) => break 'outer, // worker already recorded it
                        };
                        if let Err(e) = out.write_all(&done.pair.frame) {
                            shared.fail(e.into());
                            break 'outer;
                        }
                        stats.record(done.len_cmp);
                        let _ = free_txs[k].send(done.pair);
                    }
                }
                stats
            })
        };

        // Reader: round-robin fill with one read-ahead buffer.
        let mut cread = vec![0u8; chunksize as usize];
        let mut rbytes = match read_full(input, &mut cread) {
            Ok(n) => n,
            Err(e) => {
                shared.fail(e.into());
                0
            }
        };
        let mut id = 0u64;
        let mut file_offset = 0u64;
        'outer: loop {
            for k in 0..nthreads {
                if shared.cancelled() || rbytes == 0 {
                    break 'outer;
                }
                let mut pair = match free_rxs[k].recv() {
                    Ok(p) => p,
                    Err(_) => break 'outer,
                };
                std::mem::swap(&mut pair.input, &mut cread);
                let job = CompressJob { id, raw_len: rbytes, file_offset, pair };
                id += 1;
                file_offset += rbytes as u64;
                if job_txs[k].send(job).is_err() {
                    break 'outer;
                }
                // Read ahead while worker k runs.
                if single_chunk {
                    rbytes = 0;
                } else {
                    rbytes = match read_full(input, &mut cread) {
                        Ok(n) => n,
                        Err(e) => {
                            shared.fail(e.into());
                            break 'outer;
                        }
                    };
                }
            }
        }
        drop(job_txs); // workers drain and exit; writer follows

        Ok(writer.join().expect("writer thread panicked"))
    })?;

    if let Some(e) = shared.take() {
        return Err(e);
    }
    output.write_all(&TRAILER)?;
    Ok(stats)
}

// ── Decompression ────────────────────────────────────────────────────────────

struct DecompressJob {
    id:  u64,
    raw: RawChunk,
}

struct DecompressDone {
    id:    u64,
    plain: Vec<u8>,
    body:  Vec<u8>,
}

struct DecompressWorker {
    codec:       Box<dyn Codec>,
    index_codec: LzmaCodec,
    mac:         Option<crate::checksum::KeyedMac>,
    crypto:      Option<Arc<CryptoCtx>>,
    params:      FrameParams,
    cksum:       ChecksumId,
    level:       u8,
    chunksize:   u64,
    ring_rx:     Option<Receiver<()>>,
    scratch_path: Option<PathBuf>,
    scratch:     Option<ScratchReader>,
}

impl DecompressWorker {
    fn process(&mut self, job: DecompressJob) -> Result<DecompressDone, PzError> {
        let id = job.id;
        let view = FrameView::parse(self.params, &job.raw)?;
        let flags = view.flags();
        let raw_len = view.raw_len(self.chunksize);

        // Verify the integrity tag before touching anything else.
        let tag = match &self.mac {
            Some(mac) => ChunkTag::Hmac(mac),
            None => ChunkTag::Crc32,
        };
        if !view.verify_tag(&tag) {
            return Err(PzError::ChunkMac { id });
        }
        let stored_ck = view.checksum();

        // Decrypt.  Stream cipher: length unchanged, in place.
        let mut payload = view.payload().to_vec();
        if let Some(ctx) = &self.crypto {
            ctx.crypto_buf(&mut payload, id)?;
        }

        // Global mode: wait for every earlier chunk to be durable before
        // resolving anything, deduped or not — the ring stays balanced.
        if let Some(rx) = &self.ring_rx {
            rx.recv().map_err(|_| PzError::Cancelled)?;
        }

        let plain = if flags & CHUNK_FLAG_DEDUP != 0 {
            self.undedup(&payload, flags)?
        } else if flags & CHUNK_FLAG_PREPROC != 0 {
            let mut out = Vec::new();
            preproc_decompress(
                self.codec.as_mut(),
                &payload,
                &mut out,
                raw_len,
                self.level,
                flags,
            )?;
            out
        } else if flags & CHUNK_FLAG_COMPRESSED != 0 {
            let mut out = Vec::new();
            self.codec.as_mut().decompress(&payload, &mut out, raw_len, flags)?;
            out
        } else {
            payload
        };

        if plain.len() as u64 != raw_len {
            return Err(PzError::ChunkLength { id, got: plain.len() as u64, want: raw_len });
        }
        // Plaintext digest check; encrypted containers rely on the HMAC.
        if self.crypto.is_none() && digest(self.cksum, &plain) != stored_ck {
            return Err(PzError::ChunkChecksum { id });
        }

        Ok(DecompressDone { id, plain, body: job.raw.body })
    }

    fn undedup(&mut self, payload: &[u8], flags: u8) -> Result<Vec<u8>, PzError> {
        let hdr = DedupHdr::parse(payload)?;
        let index_end = DEDUP_HDR_SIZE + hdr.index_sz_cmp as usize;
        let data_end = index_end + hdr.data_sz_cmp as usize;
        if payload.len() != data_end {
            return Err(crate::dedup::DedupError::BadHeader.into());
        }
        let index_cmp = &payload[DEDUP_HDR_SIZE..index_end];
        let data_cmp = &payload[index_end..data_end];

        // Data section first.
        let data: Vec<u8> = if flags & CHUNK_FLAG_PREPROC != 0 {
            let mut d = Vec::new();
            preproc_decompress(
                self.codec.as_mut(),
                data_cmp,
                &mut d,
                hdr.data_sz,
                self.level,
                flags,
            )?;
            d
        } else if flags & CHUNK_FLAG_COMPRESSED != 0 {
            let mut d = Vec::new();
            self.codec.as_mut().decompress(data_cmp, &mut d, hdr.data_sz, flags)?;
            d
        } else {
            if data_cmp.len() as u64 != hdr.data_sz {
                return Err(crate::dedup::DedupError::BadHeader.into());
            }
            data_cmp.to_vec()
        };

        // Index: stored at least 90 bytes means it may be lzma-compressed.
        let mut tindex = Vec::new();
        let stored: &[u8] = if hdr.index_sz >= INDEX_COMPRESS_MIN && hdr.index_sz > hdr.index_sz_cmp
        {
            self.index_codec.decompress(index_cmp, &mut tindex, hdr.index_sz, 0)?;
            &tindex
        } else {
            if index_cmp.len() as u64 != hdr.index_sz {
                return Err(crate::dedup::DedupError::BadHeader.into());
            }
            index_cmp
        };
        let mut index = Vec::new();
        untranspose(stored, &mut index, INDEX_STRIDE);

        // Cross-chunk refs read from the scratch file; open lazily — by
        // the time a ref can exist, the writer has created the file.
        if self.scratch.is_none() {
            if let Some(p) = &self.scratch_path {
                self.scratch = Some(ScratchReader::new(std::fs::File::open(p)?));
            }
        }
        Ok(dedup_reconstruct(&hdr, &index, &data, self.scratch.as_mut())?)
    }
}

/// Decompress the chunk stream following an already-parsed header.
///
/// The caller has opened `input` past the header, chosen `output`, and
/// (for encrypted containers) obtained the password.  `scratch` must be
/// set when the header declares global dedup.
pub fn decompress_stream(
    parsed: ParsedHeader,
    input: &mut dyn Read,
    output: &mut (dyn Write + Send),
    password: Option<Vec<u8>>,
    nthreads_req: usize,
    scratch: ScratchSpec,
) -> Result<ChunkStats, PzError> {
    let header = &parsed.header;
    let cksum = header.checksum()?;
    let chunksize = header.chunksize;
    let global = header.flags & (FLAG_DEDUP | FLAG_DEDUP_FIXED)
        == (FLAG_DEDUP | FLAG_DEDUP_FIXED);

    // Crypto setup doubles as header verification: the HMAC check is the
    // password check.
    let mut crypto_ctx = None;
    match &header.crypto {
        Some(ch) => {
            let mut pw = password.ok_or(PzError::PasswordRequired)?;
            let ctx = CryptoCtx::for_decrypt(
                &pw,
                ch.alg,
                ch.salt.clone(),
                ch.nonce.clone(),
                ch.keylen as usize,
            )?;
            pw.zeroize();
            let hdr_mac = ctx.keyed_mac(cksum);
            parsed.verify_hmac(&hdr_mac)?;
            crypto_ctx = Some(ctx);
        }
        None => parsed.verify_crc()?,
    }

    let nthreads = if header.is_single_chunk() {
        1
    } else {
        resolve_nthreads(nthreads_req, None, chunksize)
    };
    log::info!("Scaling to {} thread(s)", nthreads);

    let params = FrameParams::new(cksum, crypto_ctx.is_some(), header.version);
    let worker_macs: Vec<_> = (0..nthreads)
        .map(|_| crypto_ctx.as_ref().map(|ctx| ctx.keyed_mac(cksum)))
        .collect();
    if let Some(ctx) = &mut crypto_ctx {
        ctx.clean_pkey();
    }
    let crypto_ctx = crypto_ctx.map(Arc::new);

    let (scratch_path, tee_path): (Option<PathBuf>, Option<PathBuf>) = match &scratch {
        ScratchSpec::None => {
            if global {
                return Err(PzError::InvalidConfig(
                    "global dedup container needs a seekable output (not a pipe)".into(),
                ));
            }
            (None, None)
        }
        ScratchSpec::Tee(p) => (Some(p.clone()), Some(p.clone())),
        ScratchSpec::Output(p) => (Some(p.clone()), None),
    };

    // Instantiate every worker's codec up front so an unavailable
    // algorithm fails before any thread is spawned or file is created.
    let mut codecs: Vec<Box<dyn Codec>> = Vec::with_capacity(nthreads);
    for _ in 0..nthreads {
        codecs.push(new_codec(header.algo)?);
    }

    let mut tee = match &tee_path {
        Some(p) => Some(std::fs::File::create(p)?),
        None => None,
    };

    let shared = Shared::new();
    let mut job_txs = Vec::new();
    let mut job_rxs = Vec::new();
    let mut done_txs = Vec::new();
    let mut done_rxs = Vec::new();
    let mut free_txs = Vec::new();
    let mut free_rxs = Vec::new();
    for _ in 0..nthreads {
        let (jt, jr) = bounded::<DecompressJob>(1);
        let (dt, dr) = bounded::<Result<DecompressDone, PzError>>(1);
        let (ft, fr) = bounded::<Vec<u8>>(1);
        ft.send(Vec::new()).unwrap();
        job_txs.push(jt);
        job_rxs.push(jr);
        done_txs.push(dt);
        done_rxs.push(dr);
        free_txs.push(ft);
        free_rxs.push(fr);
    }

    // Extraction ring: the writer produces tokens, workers consume.
    let mut ring_rxs: Vec<Option<Receiver<()>>> = (0..nthreads).map(|_| None).collect();
    let mut writer_ring: Vec<Sender<()>> = Vec::new();
    if global {
        let mut rxs = Vec::new();
        for _ in 0..nthreads {
            let (t, r) = bounded::<()>(2);
            writer_ring.push(t);
            rxs.push(r);
        }
        // Chunk 0 never has back-refs; its worker starts immediately.
        writer_ring[0].send(()).unwrap();
        for (k, r) in rxs.into_iter().enumerate() {
            ring_rxs[k] = Some(r);
        }
    }

    let mut stats = ChunkStats::default();

    thread::scope(|s| {
        for k in 0..nthreads {
            let job_rx = job_rxs.remove(0);
            let done_tx = done_txs.remove(0);
            let shared = Arc::clone(&shared);
            let mut w = DecompressWorker {
                codec:        codecs.remove(0),
                index_codec:  LzmaCodec,
                mac:          worker_macs[k].clone(),
                crypto:       crypto_ctx.clone(),
                params,
                cksum,
                level:        header.level,
                chunksize,
                ring_rx:      ring_rxs[k].take(),
                scratch_path: scratch_path.clone(),
                scratch:      None,
            };
            s.spawn(move || {
                for job in job_rx.iter() {
                    if shared.cancelled() {
                        break;
                    }
                    let id = job.id;
                    match w.process(job) {
                        Ok(done) => {
                            if done_tx.send(Ok(done)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            shared.fail(PzError::chunk_context(id, e));
                            let _ = done_tx.send(Err(PzError::Cancelled));
                            break;
                        }
                    }
                }
            });
        }

        // Writer: emit plaintext in id order, tee for the scratch file,
        // and release the next worker's ring token once durable.
        let writer = {
            let shared = Arc::clone(&shared);
            let out: &mut (dyn Write + Send) = &mut *output;
            let writer_ring = writer_ring;
            let mut tee = tee.take();
            s.spawn(move || {
                let mut written = 0u64;
                'outer: loop {
                    for k in 0..nthreads {
                        let msg = match done_rxs[k].recv() {
                            Ok(m) => m,
                            Err(_) => break 'outer,
                        };
                        let done = match msg {
                            Ok(d) => d,
                            Err(_) => break 'outer,
                        };
                        if let Err(e) = out.write_all(&done.plain) {
                            shared.fail(e.into());
                            break 'outer;
                        }
                        if let Some(t) = tee.as_mut() {
                            // Workers read this through their own handles;
                            // same-process page cache keeps them coherent.
                            if let Err(e) = t.write_all(&done.plain) {
                                shared.fail(e.into());
                                break 'outer;
                            }
                        } else if !writer_ring.is_empty() {
                            // Re-reading the output file: make the bytes
                            // visible to the workers' read handles.
                            if let Err(e) = out.flush() {
                                shared.fail(e.into());
                                break 'outer;
                            }
                        }
                        written += done.plain.len() as u64;
                        if !writer_ring.is_empty() {
                            let _ = writer_ring[(k + 1) % nthreads].send(());
                        }
                        let _ = free_txs[k].send(done.body);
                    }
                }
                written
            })
        };

        // Reader: parse frames round-robin until the trailer.
        let mut id = 0u64;
        'outer: loop {
            for k in 0..nthreads {
                if shared.cancelled() {
                    break 'outer;
                }
                let body = match free_rxs[k].recv() {
                    Ok(b) => b,
                    Err(_) => break 'outer,
                };
                let raw = match read_frame(input, &params, chunksize, body) {
                    Ok(Some(raw)) => raw,
                    Ok(None) => break 'outer, // trailer
                    Err(e) => {
                        shared.fail(PzError::chunk_context(id, e.into()));
                        break 'outer;
                    }
                };
                stats.record(raw.len_cmp);
                if job_txs[k].send(DecompressJob { id, raw }).is_err() {
                    break 'outer;
                }
                id += 1;
            }
        }
        drop(job_txs);

        let _ = writer.join().expect("writer thread panicked");
    });

    if let Some(p) = &tee_path {
        let _ = std::fs::remove_file(p);
    }
    if let Some(e) = shared.take() {
        return Err(e);
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::DEFAULT_CHUNKSIZE;
    use std::io::Cursor;

    fn compress_to_vec(opts: PipelineOpts, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut input = Cursor::new(data);
        compress_stream(opts, &mut input, &mut out, Some(data.len() as u64)).unwrap();
        out
    }

    fn decompress_to_vec(container: &[u8], password: Option<Vec<u8>>) -> Result<Vec<u8>, PzError> {
        let mut input = Cursor::new(container);
        let parsed = ParsedHeader::read(&mut input, None)?;
        let mut out = Vec::new();
        decompress_stream(parsed, &mut input, &mut out, password, 4, ScratchSpec::None)?;
        Ok(out)
    }

    fn opts(algo: CodecId) -> PipelineOpts {
        PipelineOpts { chunksize: 4096, ..PipelineOpts::new(algo) }
    }

    #[test]
    fn empty_input_roundtrips_to_empty() {
        let container = compress_to_vec(opts(CodecId::Zlib), b"");
        assert_eq!(&container[container.len() - 8..], &TRAILER);
        assert_eq!(decompress_to_vec(&container, None).unwrap(), b"");
    }

    #[test]
    fn hello_with_none_codec_single_chunk() {
        // One chunk, stored verbatim, CHSIZE set, raw_len = 5.
        let container = compress_to_vec(opts(CodecId::None), b"hello");
        assert_eq!(decompress_to_vec(&container, None).unwrap(), b"hello");

        let mut input = Cursor::new(&container);
        let parsed = ParsedHeader::read(&mut input, None).unwrap();
        assert!(parsed.header.is_single_chunk());
        assert_eq!(parsed.header.chunksize, 4096);

        let params = FrameParams::new(ChecksumId::Blake256, false, VERSION);
        let raw = read_frame(&mut input, &params, 4096, Vec::new()).unwrap().unwrap();
        let view = FrameView::parse(params, &raw).unwrap();
        assert_eq!(view.flags() & CHUNK_FLAG_COMPRESSED, 0);
        assert_eq!(view.flags() & CHUNK_FLAG_CHSIZE, CHUNK_FLAG_CHSIZE);
        assert_eq!(view.raw_len(4096), 5);
        assert_eq!(view.payload(), b"hello");
    }

    #[test]
    fn multi_chunk_order_is_preserved() {
        // 40 chunks over 4 workers, distinguishable content per chunk.
        let mut data = Vec::new();
        for i in 0..40u32 {
            let mut block = vec![0u8; 4096];
            block[..4].copy_from_slice(&i.to_be_bytes());
            for (j, b) in block.iter_mut().enumerate().skip(4) {
                *b = (i as usize * 31 + j) as u8;
            }
            data.extend_from_slice(&block);
        }
        let mut o = opts(CodecId::Lz4);
        o.nthreads = 4;
        let container = compress_to_vec(o, &data);
        assert_eq!(decompress_to_vec(&container, None).unwrap(), data);
    }

    #[test]
    fn short_final_chunk_law() {
        let data = vec![7u8; 4096 * 3 + 100];
        let container = compress_to_vec(opts(CodecId::Zlib), &data);
        assert_eq!(decompress_to_vec(&container, None).unwrap(), data);

        // Exactly one CHSIZE chunk, and it is the last one.
        let mut input = Cursor::new(&container);
        let _ = ParsedHeader::read(&mut input, None).unwrap();
        let params = FrameParams::new(ChecksumId::Blake256, false, VERSION);
        let mut chsize_seen = Vec::new();
        while let Some(raw) = read_frame(&mut input, &params, 4096, Vec::new()).unwrap() {
            let view = FrameView::parse(params, &raw).unwrap();
            chsize_seen.push(view.flags() & CHUNK_FLAG_CHSIZE != 0);
        }
        assert_eq!(chsize_seen.len(), 4);
        assert_eq!(chsize_seen.iter().filter(|c| **c).count(), 1);
        assert!(chsize_seen[3]);
    }

    #[test]
    fn truncated_trailer_fails() {
        let data = vec![3u8; 10_000];
        let container = compress_to_vec(opts(CodecId::Zlib), &data);
        let cut = &container[..container.len() - 8];
        assert!(decompress_to_vec(cut, None).is_err());
    }

    #[test]
    fn encrypted_roundtrip_and_wrong_password() {
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let mut o = opts(CodecId::Lz4);
        o.crypto = Some(CryptoOpts {
            alg:      CryptoAlg::Aes,
            keylen:   32,
            password: b"open sesame".to_vec(),
        });
        let container = compress_to_vec(o, &data);

        let ok = decompress_to_vec(&container, Some(b"open sesame".to_vec())).unwrap();
        assert_eq!(ok, data);

        let err = decompress_to_vec(&container, Some(b"wrong".to_vec())).unwrap_err();
        assert!(matches!(err, PzError::Header(crate::header::HeaderError::Verification)));

        assert!(matches!(
            decompress_to_vec(&container, None).unwrap_err(),
            PzError::PasswordRequired
        ));
    }

    #[test]
    fn chunk_tamper_is_fatal() {
        let data = vec![9u8; 30_000];
        let container = compress_to_vec(opts(CodecId::Zlib), &data);
        // Flip one bit well past the header, inside a chunk frame.
        let mut bad = container.clone();
        let at = bad.len() / 2;
        bad[at] ^= 0x10;
        assert!(decompress_to_vec(&bad, None).is_err());
    }

    #[test]
    fn dedup_container_roundtrips() {
        let block: Vec<u8> = (0..4096u32).map(|i| (i % 191) as u8).collect();
        let mut data = Vec::new();
        for _ in 0..12 {
            data.extend_from_slice(&block);
        }
        let mut o = PipelineOpts::new(CodecId::Lz4);
        o.chunksize = 16 * 4096;
        o.dedup = Some(DedupOpts { mode: SplitMode::Fixed, global: false, blk_class: 1 });
        let container = compress_to_vec(o, &data);
        assert!(container.len() < data.len() / 2);
        assert_eq!(decompress_to_vec(&container, None).unwrap(), data);
    }

    #[test]
    fn preproc_container_roundtrips() {
        let mut data = Vec::new();
        let mut v = 5u64;
        for _ in 0..4096 {
            data.extend_from_slice(&v.to_be_bytes());
            v = v.wrapping_add(13);
        }
        let mut o = opts(CodecId::None);
        o.delta2 = true;
        let container = compress_to_vec(o, &data);
        assert!(container.len() < data.len() / 2);
        assert_eq!(decompress_to_vec(&container, None).unwrap(), data);
    }

    #[test]
    fn dedup_rejects_crc64() {
        let mut o = opts(CodecId::Lz4);
        o.checksum = ChecksumId::Crc64;
        o.dedup = Some(DedupOpts { mode: SplitMode::Fixed, global: false, blk_class: 1 });
        let mut out = Vec::new();
        let err = compress_stream(o, &mut Cursor::new(b"x"), &mut out, Some(1)).unwrap_err();
        assert!(matches!(err, PzError::InvalidConfig(_)));
    }

    #[test]
    fn default_chunksize_is_8_mib() {
        assert_eq!(DEFAULT_CHUNKSIZE, 8 * 1024 * 1024);
    }
}

use clap::{ArgAction, Parser};
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use parz::archive::{self, ExtractOpts};
use parz::checksum::ChecksumId;
use parz::crypto::{read_password_file, CryptoAlg, DEFAULT_KEYLEN};
use parz::dedup::SplitMode;
use parz::header::{eighty_pct, total_ram, ParsedHeader, DEFAULT_CHUNKSIZE, MAX_LEVEL, MIN_CHUNK};
use parz::pipeline::{
    compress_stream, decompress_stream, ChunkStats, CryptoOpts, DedupOpts, PipelineOpts,
    ScratchSpec,
};
use parz::{CodecId, PzError};

/// Extension appended to compressed output.
const COMP_EXTN: &str = ".pz";

#[derive(Parser)]
#[command(
    name = "parz",
    version,
    about = "Chunked parallel multi-algorithm compressor producing .pz containers"
)]
struct Cli {
    /// Compress with ALGO: lzfx, lz4, zlib, lzma, lzmaMt, bzip2, ppmd,
    /// libbsc, adapt, adapt2, none
    #[arg(short = 'c', value_name = "ALGO")]
    compress: Option<String>,

    /// Decompress
    #[arg(short = 'd')]
    decompress: bool,

    /// Pipe mode: read stdin, write stdout
    #[arg(short = 'p')]
    pipe: bool,

    /// Chunk size in bytes, with optional k/m/g suffix (default 8m)
    #[arg(short = 's', value_name = "SIZE")]
    chunk_size: Option<String>,

    /// Compression level 0..14 (default 6; 1 for lz4)
    #[arg(short = 'l', value_name = "LEVEL")]
    level: Option<u8>,

    /// Worker thread count 1..256 (default: one per core)
    #[arg(short = 't', value_name = "N")]
    threads: Option<usize>,

    /// Content-defined deduplication
    #[arg(short = 'D')]
    dedup: bool,

    /// Fixed-block deduplication
    #[arg(short = 'F')]
    dedup_fixed: bool,

    /// Global deduplication across the whole stream (needs -D or -F)
    #[arg(short = 'G')]
    global_dedup: bool,

    /// Delta encoding inside dedup; repeat for looser matching
    #[arg(short = 'E', action = ArgAction::Count)]
    delta: u8,

    /// Average dedup block size class: 0 (2k) .. 5 (64k)
    #[arg(short = 'B', value_name = "0..5")]
    dedup_block: Option<u8>,

    /// LZP preprocessing
    #[arg(short = 'L')]
    lzp: bool,

    /// Adaptive delta2 preprocessing for embedded numeric tables
    #[arg(short = 'P')]
    delta2: bool,

    /// Chunk checksum (default BLAKE256)
    #[arg(short = 'S', value_name = "NAME")]
    checksum: Option<String>,

    /// Encrypt chunks: AES or SALSA20 (CTR stream mode)
    #[arg(short = 'e', value_name = "ALGO")]
    encrypt: Option<String>,

    /// File holding the password; zeroed out after reading
    #[arg(short = 'w', value_name = "PWFILE")]
    password_file: Option<PathBuf>,

    /// Encryption key length: 16 or 32 (default 32)
    #[arg(short = 'k', value_name = "LEN")]
    keylen: Option<usize>,

    /// Archive mode: pack the given paths into one stream
    #[arg(short = 'a')]
    archive: bool,

    /// Disable archive member sorting
    #[arg(short = 'n')]
    no_sort: bool,

    /// Force permissions on extracted archive members
    #[arg(short = 'm')]
    force_perms: bool,

    /// Skip archive members older than what is on disk
    #[arg(short = 'K')]
    no_overwrite_newer: bool,

    /// Verbose diagnostics
    #[arg(short = 'v')]
    verbose: bool,

    /// Display memory statistics
    #[arg(short = 'M')]
    mem_stats: bool,

    /// Display compression statistics
    #[arg(short = 'C')]
    cmp_stats: bool,

    /// SRC [DST]; with -a, one or more paths followed by an optional DST
    #[arg(value_name = "FILE")]
    files: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter))
        .format_timestamp(None)
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    if cli.compress.is_some() == cli.decompress {
        return Err("Exactly one of -c and -d is required".into());
    }
    if cli.pipe && !cli.files.is_empty() {
        return Err("Filename(s) unexpected for pipe mode".into());
    }
    if cli.decompress && (cli.dedup || cli.dedup_fixed || cli.global_dedup || cli.delta > 0) {
        return Err("Deduplication is only used during compression".into());
    }
    if cli.decompress && cli.encrypt.is_some() {
        return Err("Encryption only makes sense when compressing".into());
    }

    match &cli.compress {
        Some(algo) => do_compress(cli, algo),
        None => do_decompress(cli),
    }
}

// ── Compression ──────────────────────────────────────────────────────────────

fn do_compress(cli: &Cli, algo: &str) -> Result<(), Box<dyn std::error::Error>> {
    let algo = CodecId::from_name(algo).ok_or_else(|| format!("Invalid algorithm {algo}"))?;

    let level = match cli.level {
        Some(l) if l <= MAX_LEVEL => l,
        Some(_) => return Err("Compression level should be in range 0 - 14".into()),
        None => algo.default_level(),
    };
    let chunksize = match &cli.chunk_size {
        Some(s) => parse_chunksize(s)?,
        None => DEFAULT_CHUNKSIZE,
    };
    let nthreads = match cli.threads {
        Some(t) if (1..=256).contains(&t) => t,
        Some(_) => return Err("Thread count should be in range 1 - 256".into()),
        None => 0,
    };
    let checksum = match &cli.checksum {
        Some(name) => ChecksumId::from_name(name)?,
        None => ChecksumId::Blake256,
    };
    let dedup = dedup_opts(cli)?;
    let crypto = crypto_opts(cli)?;

    let opts = PipelineOpts {
        algo,
        level,
        chunksize,
        nthreads,
        checksum,
        dedup,
        lzp: cli.lzp,
        delta2: cli.delta2,
        crypto,
        archive: cli.archive,
    };

    if cli.pipe {
        if opts.dedup.as_ref().is_some_and(|d| d.global) {
            return Err("Global deduplication is not supported with pipe mode".into());
        }
        let mut input = io::stdin();
        let mut output = io::stdout();
        let stats = compress_stream(opts, &mut input, &mut output, None)?;
        output.flush()?;
        print_stats(cli, chunksize, &stats);
        return Ok(());
    }

    if cli.files.is_empty() {
        return Err("Expected at least one filename".into());
    }

    // Archive mode: every path but an optional trailing DST is a member.
    if cli.archive {
        let (paths, target) = split_archive_args(&cli.files)?;
        let sort = !cli.no_sort
            && if algo == CodecId::Lz4 { level > 2 } else { level > 6 };
        let src_name = paths[0].clone();
        return write_container(cli, &src_name, target, chunksize, |out| {
            archive::compress_archive(&paths, sort, opts, out)
        });
    }

    let src = PathBuf::from(&cli.files[0]);
    let meta = std::fs::metadata(&src).map_err(|e| format!("Cannot stat: {}: {e}", src.display()))?;
    if !meta.is_file() {
        return Err(format!("File {} is not a regular file", src.display()).into());
    }
    let size = meta.len();
    if let Some(d) = &opts.dedup {
        if d.global && size <= chunksize {
            log::info!("Input fits one chunk, using segmented deduplication");
        }
    }

    let target = cli.files.get(1).map(String::as_str);
    write_container(cli, &src, target, chunksize, |out| {
        let mut input = BufReader::new(File::open(&src)?);
        let stats = compress_stream(opts, &mut input, out, Some(size))?;
        Ok(stats)
    })
    .inspect(|_| {
        // Target carries the source's permission bits.
        if let (Some(dst), Ok(meta)) = (resolved_target(&src, target), std::fs::metadata(&src)) {
            let _ = std::fs::set_permissions(dst, meta.permissions());
        }
    })
}

/// Resolve the output path for a compression run: explicit DST, or
/// `SRC.pz`; `-` means stdout.
fn resolved_target(src: &Path, dst: Option<&str>) -> Option<PathBuf> {
    match dst {
        Some("-") => None,
        Some(d) => Some(PathBuf::from(format!("{d}{COMP_EXTN}"))),
        None => Some(PathBuf::from(format!("{}{COMP_EXTN}", src.display()))),
    }
}

/// Run `body` against the chosen output: stdout for `-`, otherwise a
/// dot-temporary that is renamed over the target on success and unlinked
/// on failure.
fn write_container<F>(
    cli: &Cli,
    src: &Path,
    dst: Option<&str>,
    chunksize: u64,
    body: F,
) -> Result<(), Box<dyn std::error::Error>>
where
    F: FnOnce(&mut (dyn Write + Send)) -> Result<ChunkStats, PzError>,
{
    let Some(target) = resolved_target(src, dst) else {
        let mut out = io::stdout();
        let stats = body(&mut out)?;
        out.flush()?;
        print_stats(cli, chunksize, &stats);
        return Ok(());
    };

    if target.exists() {
        return Err(format!("Compressed file {} exists", target.display()).into());
    }
    let tmp = target.with_extension("pz.tmp");
    let mut out = File::create(&tmp)?;

    match body(&mut out).and_then(|stats| {
        out.sync_all()?;
        Ok(stats)
    }) {
        Ok(stats) => {
            drop(out);
            std::fs::rename(&tmp, &target)?;
            print_stats(cli, chunksize, &stats);
            Ok(())
        }
        Err(e) => {
            drop(out);
            let _ = std::fs::remove_file(&tmp);
            Err(format!("Error compressing {}: {e}", src.display()).into())
        }
    }
}

/// With several paths the last one names the archive; a single path
/// derives the archive name from itself.
fn split_archive_args(files: &[String]) -> Result<(Vec<PathBuf>, Option<&str>), String> {
    let (member_args, target) = if files.len() > 1 {
        (&files[..files.len() - 1], Some(files[files.len() - 1].as_str()))
    } else {
        (files, None)
    };
    let mut paths: Vec<PathBuf> = Vec::new();
    for f in member_args {
        let p = PathBuf::from(f);
        if p.exists() {
            paths.push(p);
        } else {
            log::warn!("{f}: skipped (not found)");
        }
    }
    if paths.is_empty() {
        return Err("No usable paths found to archive".into());
    }
    Ok((paths, target))
}

// ── Decompression ────────────────────────────────────────────────────────────

fn do_decompress(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let nthreads = match cli.threads {
        Some(t) if (1..=256).contains(&t) => t,
        Some(_) => return Err("Thread count should be in range 1 - 256".into()),
        None => 0,
    };
    let password = match &cli.password_file {
        Some(p) => Some(read_password_file(p)?),
        None => None,
    };

    if cli.pipe {
        let mut input = BufReader::new(io::stdin());
        let parsed = ParsedHeader::read(&mut input, total_ram())?;
        if parsed.header.is_archive() {
            return Err("Archive containers cannot be extracted to stdout".into());
        }
        let chunksize = parsed.header.chunksize;
        let mut output = io::stdout();
        let stats = decompress_stream(parsed, &mut input, &mut output, password, nthreads,
            ScratchSpec::None)?;
        output.flush()?;
        print_stats(cli, chunksize, &stats);
        return Ok(());
    }

    if cli.files.is_empty() {
        return Err("Expected at least one filename".into());
    }
    let src = PathBuf::from(&cli.files[0]);
    let from_stdin = cli.files[0] == "-";
    let mut input: Box<dyn std::io::Read> = if from_stdin {
        Box::new(BufReader::new(io::stdin()))
    } else {
        Box::new(BufReader::new(
            File::open(&src).map_err(|e| format!("Cannot open: {}: {e}", src.display()))?,
        ))
    };
    let input = input.as_mut();
    let parsed = ParsedHeader::read(input, total_ram()).map_err(|e| match e {
        parz::HeaderError::NotPz if from_stdin => "Input stream is not a .pz container".to_string(),
        parz::HeaderError::NotPz => format!("{} is not a .pz container", src.display()),
        other => other.to_string(),
    })?;
    let global = parsed.header.flags & (parz::header::FLAG_DEDUP | parz::header::FLAG_DEDUP_FIXED)
        == (parz::header::FLAG_DEDUP | parz::header::FLAG_DEDUP_FIXED);
    let chunksize = parsed.header.chunksize;

    // Archive containers extract into a directory.
    if parsed.header.is_archive() {
        let dest = PathBuf::from(cli.files.get(1).map(String::as_str).unwrap_or("."));
        let xopts = ExtractOpts {
            force_perms:        cli.force_perms,
            no_overwrite_newer: cli.no_overwrite_newer,
        };
        let stats = archive::extract_archive(
            parsed, &mut input, &dest, password, nthreads, global, xopts,
        )?;
        print_stats(cli, chunksize, &stats);
        return Ok(());
    }

    let target = match cli.files.get(1) {
        Some(t) => PathBuf::from(t),
        None if from_stdin => return Err("Reading from stdin requires a target filename".into()),
        None => default_uncompressed_name(&src),
    };
    if target.exists() {
        return Err(format!("File {} exists", target.display()).into());
    }

    // Global-dedup containers re-read the growing output for back-refs,
    // so the file is written unbuffered.
    let mut output = File::create(&target)?;
    let scratch = if global {
        ScratchSpec::Output(target.clone())
    } else {
        ScratchSpec::None
    };
    match decompress_stream(parsed, &mut input, &mut output, password, nthreads, scratch) {
        Ok(stats) => {
            output.sync_all()?;
            // Mode follows the container file, as close as we get to the
            // original's ownership carry-over.
            if let Ok(meta) = std::fs::metadata(&src) {
                let _ = std::fs::set_permissions(&target, meta.permissions());
            }
            print_stats(cli, chunksize, &stats);
            Ok(())
        }
        Err(e) => {
            drop(output);
            let _ = std::fs::remove_file(&target);
            Err(e.into())
        }
    }
}

/// `foo.pz` → `foo`; anything else gets `.out` appended, with a warning.
fn default_uncompressed_name(src: &Path) -> PathBuf {
    let s = src.to_string_lossy();
    if let Some(stripped) = s.strip_suffix(COMP_EXTN).or_else(|| s.strip_suffix(".PZ")) {
        PathBuf::from(stripped)
    } else {
        let out = format!("{s}.out");
        log::warn!("Using {out} for output file name");
        PathBuf::from(out)
    }
}

// ── Option assembly ──────────────────────────────────────────────────────────

fn dedup_opts(cli: &Cli) -> Result<Option<DedupOpts>, String> {
    // -E implies content-defined dedup; -G without a mode defaults to it.
    let content = cli.dedup || cli.delta > 0;
    if cli.dedup_fixed && content {
        return Err("Content-defined and fixed-block deduplication are mutually exclusive".into());
    }
    let enabled = content || cli.dedup_fixed || cli.global_dedup;
    if !enabled {
        if cli.dedup_block.is_some() {
            return Err("-B requires a deduplication mode".into());
        }
        return Ok(None);
    }
    let mode = if cli.dedup_fixed { SplitMode::Fixed } else { SplitMode::Content };
    let blk_class = match cli.dedup_block {
        Some(b) if b <= 5 => b,
        Some(_) => return Err("Average dedup block class must be in range 0 (2k) .. 5 (64k)".into()),
        None if cli.global_dedup => 2,
        None => 1,
    };
    Ok(Some(DedupOpts { mode, global: cli.global_dedup, blk_class }))
}

fn crypto_opts(cli: &Cli) -> Result<Option<CryptoOpts>, Box<dyn std::error::Error>> {
    let Some(alg) = &cli.encrypt else {
        if cli.keylen.is_some() {
            return Err("-k requires -e".into());
        }
        return Ok(None);
    };
    let alg = CryptoAlg::from_name(alg)?;
    let keylen = match cli.keylen {
        Some(k) if k == 16 || k == 32 => k,
        Some(_) => return Err("Encryption KEY length should be 16 or 32".into()),
        None => DEFAULT_KEYLEN,
    };
    let Some(pwfile) = &cli.password_file else {
        return Err("Encryption requires the password in a file (-w)".into());
    };
    let password = read_password_file(pwfile)?;
    Ok(Some(CryptoOpts { alg, keylen, password }))
}

/// Parse a `-s` argument: bytes with an optional k/m/g suffix.
fn parse_chunksize(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (num, mult) = if let Some(n) = s.strip_suffix(['k', 'K']) {
        (n, 1u64 << 10)
    } else if let Some(n) = s.strip_suffix(['m', 'M']) {
        (n, 1u64 << 20)
    } else if let Some(n) = s.strip_suffix(['g', 'G']) {
        (n, 1u64 << 30)
    } else {
        (s, 1)
    };
    let n: u64 = num.parse().map_err(|_| format!("Invalid number {s}"))?;
    let size = n.checked_mul(mult).ok_or_else(|| format!("Chunk size too large {s}"))?;
    if size < MIN_CHUNK {
        return Err(format!("Minimum chunk size is {MIN_CHUNK}"));
    }
    if let Some(ram) = total_ram() {
        if size > eighty_pct(ram) {
            return Err("Chunk size must not exceed 80% of total RAM".into());
        }
    }
    Ok(size)
}

fn print_stats(cli: &Cli, chunksize: u64, stats: &ChunkStats) {
    if !cli.cmp_stats && !cli.mem_stats {
        return;
    }
    println!("\nCompression Statistics");
    println!("======================");
    println!("Total chunks           : {}", stats.chunks);
    if stats.chunks == 0 {
        println!("No statistics to display.");
        return;
    }
    let pct = |v: u64| {
        if chunksize == 0 {
            String::new()
        } else {
            format!(" ({:.2}%)", v as f64 / chunksize as f64 * 100.0)
        }
    };
    println!("Best compressed chunk  : {}{}", human_size(stats.smallest), pct(stats.smallest));
    println!("Worst compressed chunk : {}{}", human_size(stats.largest), pct(stats.largest));
    println!("Avg compressed chunk   : {}{}", human_size(stats.average()), pct(stats.average()));
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut v = bytes as f64;
    let mut u = 0;
    while v >= 1024.0 && u + 1 < UNITS.len() {
        v /= 1024.0;
        u += 1;
    }
    if u == 0 {
        format!("{bytes} B")
    } else {
        format!("{v:.2} {}", UNITS[u])
    }
}

//! Archive mode — a pax tar stream fed through the chunk pipeline.
//!
//! The pipeline sees archives as an opaque byte source (compressing) or
//! byte sink (extracting); all archive knowledge lives here.
//!
//! # Member order
//!
//! Members are sorted by extension, ties broken by size, both ascending —
//! files sharing an extension cluster together and similar-sized files
//! sit near each other, which measurably helps the downstream codec.  A
//! member with no extension sorts under the first four characters of its
//! name.  Sorting is skipped under `-n`.  The sort runs over a key
//! buffer reserved with fallible allocation; when that reservation
//! fails the members are archived in walk order instead of aborting.
//!
//! # Plumbing
//!
//! An archiver thread builds the tar stream into an in-memory pipe whose
//! read side is the pipeline's input; extraction reverses the roles.  A
//! pipe endpoint dropping early surfaces as a broken-pipe error on the
//! other side, which the pipeline turns into cancellation.

use crossbeam_channel::{bounded, Receiver, Sender};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use thiserror::Error;

use crate::pipeline::{compress_stream, decompress_stream, ChunkStats, PipelineOpts, ScratchSpec};
use crate::{ParsedHeader, PzError};

/// Scratch file used during global-dedup extraction, removed afterwards.
pub const SCRATCH_DATA_FILE: &str = ".data";

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("No usable paths found to archive")]
    NoPaths,
    #[error("Target path is not a directory")]
    NotADirectory,
    #[error("Archive walk failed: {0}")]
    Walk(String),
    #[error("Archiver thread failed: {0}")]
    Archiver(#[source] io::Error),
    #[error("Extractor thread failed: {0}")]
    Extractor(#[source] io::Error),
}

/// Extraction behavior switches (`-m`, `-K`).
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractOpts {
    pub force_perms:        bool,
    pub no_overwrite_newer: bool,
}

// ── In-memory pipe ───────────────────────────────────────────────────────────

struct PipeWriter {
    tx: Sender<Vec<u8>>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader gone"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct PipeReader {
    rx:  Receiver<Vec<u8>>,
    cur: Vec<u8>,
    pos: usize,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.cur.len() {
            match self.rx.recv() {
                Ok(next) => {
                    self.cur = next;
                    self.pos = 0;
                }
                Err(_) => return Ok(0), // writer closed: EOF
            }
        }
        let n = (self.cur.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.cur[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = bounded::<Vec<u8>>(8);
    (PipeWriter { tx }, PipeReader { rx, cur: Vec::new(), pos: 0 })
}

// ── Member collection and ordering ───────────────────────────────────────────

struct Member {
    path: PathBuf,
    name: PathBuf,
    size: u64,
    dir:  bool,
}

/// Sort key: extension (or the first four name characters when there is
/// none), then size.
fn sort_key(m: &Member) -> (String, u64) {
    let name = m.name.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let ext = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_ascii_lowercase(),
        _ => name.chars().take(4).collect::<String>().to_ascii_lowercase(),
    };
    (ext, m.size)
}

/// Precomputed member ordering.  Directories sort before any file (so
/// structure exists before the entries that need it) and by name among
/// themselves; files follow in (extension, size) order.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
enum MemberKey {
    Dir(PathBuf),
    File(String, u64),
}

fn member_key(m: &Member) -> MemberKey {
    if m.dir {
        MemberKey::Dir(m.name.clone())
    } else {
        let (ext, size) = sort_key(m);
        MemberKey::File(ext, size)
    }
}

/// Sort via a fallibly-allocated key buffer.  When the buffer cannot be
/// reserved the members come back in walk order — archiving degrades
/// to unsorted rather than failing.  The sort itself is `sort_unstable`,
/// which allocates nothing.
fn sorted_members(mut members: Vec<Member>) -> Vec<Member> {
    let mut keyed: Vec<(MemberKey, Member)> = Vec::new();
    let mut out: Vec<Member> = Vec::new();
    if keyed.try_reserve_exact(members.len()).is_err()
        || out.try_reserve_exact(members.len()).is_err()
    {
        log::warn!("Cannot allocate member sort buffer, archiving unsorted");
        return members;
    }
    keyed.extend(members.drain(..).map(|m| (member_key(&m), m)));
    keyed.sort_unstable_by(|a, b| a.0.cmp(&b.0));
    out.extend(keyed.into_iter().map(|(_, m)| m));
    out
}

fn collect_members(paths: &[PathBuf], sort: bool) -> Result<Vec<Member>, ArchiveError> {
    let mut members = Vec::new();
    for root in paths {
        let base = root.parent().map(Path::to_path_buf).unwrap_or_default();
        for entry in walkdir::WalkDir::new(root).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|e| ArchiveError::Walk(e.to_string()))?;
            let meta = entry
                .metadata()
                .map_err(|e| ArchiveError::Walk(e.to_string()))?;
            let name = entry
                .path()
                .strip_prefix(&base)
                .unwrap_or(entry.path())
                .to_path_buf();
            if name.as_os_str().is_empty() {
                continue;
            }
            members.push(Member {
                path: entry.path().to_path_buf(),
                name,
                size: meta.len(),
                dir:  meta.is_dir(),
            });
        }
    }
    if members.is_empty() {
        return Err(ArchiveError::NoPaths);
    }
    if sort {
        members = sorted_members(members);
    }
    Ok(members)
}

// ── Compression side ─────────────────────────────────────────────────────────

/// Archive `paths` and compress the stream into `output`.
///
/// `sort` should already reflect the level heuristic (sorting pays off at
/// higher levels) and the `-n` override.
pub fn compress_archive(
    paths: &[PathBuf],
    sort: bool,
    mut opts: PipelineOpts,
    output: &mut (dyn Write + Send),
) -> Result<ChunkStats, PzError> {
    let members = collect_members(paths, sort)?;
    opts.archive = true;

    let (pw, mut pr) = pipe();
    let archiver = thread::spawn(move || -> io::Result<()> {
        let mut builder = tar::Builder::new(pw);
        builder.follow_symlinks(false);
        for m in &members {
            builder.append_path_with_name(&m.path, &m.name)?;
        }
        builder.finish()
    });

    let result = compress_stream(opts, &mut pr, output, None);

    let arch = archiver.join().expect("archiver thread panicked");
    match (result, arch) {
        (Ok(stats), Ok(())) => Ok(stats),
        // A broken pipe on the archiver side is the echo of a pipeline
        // failure, not the cause.
        (Err(e), Err(a)) if a.kind() == io::ErrorKind::BrokenPipe => Err(e),
        (_, Err(a)) => Err(ArchiveError::Archiver(a).into()),
        (Err(e), Ok(())) => Err(e),
    }
}

// ── Extraction side ──────────────────────────────────────────────────────────

/// Decompress an archive container into the directory `dest` (created if
/// missing), restoring permissions and mtimes.
pub fn extract_archive(
    parsed: ParsedHeader,
    input: &mut dyn Read,
    dest: &Path,
    password: Option<Vec<u8>>,
    nthreads: usize,
    global_dedup: bool,
    xopts: ExtractOpts,
) -> Result<ChunkStats, PzError> {
    if dest.exists() {
        if !dest.is_dir() {
            return Err(ArchiveError::NotADirectory.into());
        }
    } else {
        fs::create_dir_all(dest)?;
    }

    let scratch = if global_dedup {
        ScratchSpec::Tee(scratch_path(dest))
    } else {
        ScratchSpec::None
    };

    let (mut pw, pr) = pipe();
    let dest = dest.to_path_buf();
    let extractor = thread::spawn(move || -> io::Result<()> {
        let mut ar = tar::Archive::new(pr);
        ar.set_preserve_permissions(true);
        ar.set_preserve_mtime(true);
        ar.set_overwrite(true);
        if xopts.force_perms {
            ar.set_mask(0);
        }
        for entry in ar.entries()? {
            let mut entry = entry?;
            if xopts.no_overwrite_newer && on_disk_is_newer(&dest, &entry)? {
                io::copy(&mut entry, &mut io::sink())?;
                continue;
            }
            entry.unpack_in(&dest)?;
        }
        Ok(())
    });

    let result = decompress_stream(parsed, input, &mut pw, password, nthreads, scratch);

    drop(pw); // close the pipe so the extractor sees EOF
    let unpacked = extractor.join().expect("extractor thread panicked");
    match (result, unpacked) {
        (Ok(stats), Ok(())) => Ok(stats),
        // A broken pipe on the pipeline side means the extractor died
        // first — its error is the root cause.
        (Err(e), Err(a)) => {
            if matches!(&e, PzError::Io(ioe) if ioe.kind() == io::ErrorKind::BrokenPipe) {
                Err(ArchiveError::Extractor(a).into())
            } else {
                Err(e)
            }
        }
        (Err(e), Ok(())) => Err(e),
        (Ok(_), Err(a)) => Err(ArchiveError::Extractor(a).into()),
    }
}

/// Location of the global-dedup scratch file for an extraction into
/// `dest`.  `PARZ_CACHE_DIR` overrides the directory when set and usable.
pub fn scratch_path(dest: &Path) -> PathBuf {
    if let Ok(dir) = std::env::var("PARZ_CACHE_DIR") {
        let d = PathBuf::from(dir);
        if d.is_dir() {
            return d.join(SCRATCH_DATA_FILE);
        }
    }
    dest.join(SCRATCH_DATA_FILE)
}

fn on_disk_is_newer<R: Read>(dest: &Path, entry: &tar::Entry<'_, R>) -> io::Result<bool> {
    let Ok(path) = entry.path() else { return Ok(false) };
    let on_disk = dest.join(path.as_ref());
    let Ok(meta) = fs::metadata(&on_disk) else { return Ok(false) };
    let disk_mtime = filetime::FileTime::from_last_modification_time(&meta);
    let entry_mtime = entry.header().mtime().unwrap_or(0);
    Ok(disk_mtime.unix_seconds() >= entry_mtime as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str, size: u64) -> Member {
        Member { path: PathBuf::new(), name: PathBuf::from(name), size, dir: false }
    }

    fn dir_member(name: &str) -> Member {
        Member { path: PathBuf::new(), name: PathBuf::from(name), size: 0, dir: true }
    }

    #[test]
    fn members_sort_by_extension_then_size() {
        let ms = vec![
            member("zeta.txt", 50),
            member("alpha.log", 10),
            member("beta.txt", 5),
            member("gamma.log", 99),
        ];
        let sorted = sorted_members(ms);
        let order: Vec<&str> = sorted.iter().map(|m| m.name.to_str().unwrap()).collect();
        assert_eq!(order, ["alpha.log", "gamma.log", "beta.txt", "zeta.txt"]);
    }

    #[test]
    fn directories_sort_before_files() {
        let ms = vec![
            member("readme.txt", 10),
            dir_member("zoo"),
            member("tiny.log", 1),
            dir_member("attic"),
        ];
        let sorted = sorted_members(ms);
        let order: Vec<&str> = sorted.iter().map(|m| m.name.to_str().unwrap()).collect();
        assert_eq!(order, ["attic", "zoo", "tiny.log", "readme.txt"]);
    }

    #[test]
    fn extensionless_members_key_on_name_prefix() {
        let m = member("Makefile", 1);
        assert_eq!(sort_key(&m).0, "make");
        let hidden = member(".bashrc", 1);
        // A leading dot is a hidden-file marker, not an extension stem.
        assert_eq!(sort_key(&hidden).0, ".bas");
    }

    #[test]
    fn pipe_moves_bytes_and_signals_eof() {
        let (mut w, mut r) = pipe();
        let t = thread::spawn(move || {
            w.write_all(b"hello ").unwrap();
            w.write_all(b"world").unwrap();
        });
        let mut out = String::new();
        r.read_to_string(&mut out).unwrap();
        t.join().unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn pipe_write_after_reader_drop_is_broken_pipe() {
        let (mut w, r) = pipe();
        drop(r);
        let err = w.write_all(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}

//! Bundle discovery: walks a directory tree, classifies bundle files, and
//! splits newline-delimited files into byte-ranged chunks without loading them.

use anyhow::{Context, Result};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use tokio::sync::mpsc;

/// Size of the buffer used for calculating file chunks.
const CHUNK_SCAN_BUFFER_SIZE: usize = 4096;

/// Locates one transaction bundle on disk: a file, a 1-based bundle index
/// within that file, and the half-open byte range `[start, end)` of the
/// payload. Single-bundle files have `index = 1` and a range covering the
/// whole file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BundleIdentifier {
    pub path: PathBuf,
    pub index: u32,
    pub start: u64,
    pub end: u64,
}

impl fmt::Display for BundleIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.extension().is_some_and(|ext| ext == "ndjson") {
            write!(f, "{} (bundle {})", self.path.display(), self.index)
        } else {
            write!(f, "{}", self.path.display())
        }
    }
}

/// How a file's payload has to be read for upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Plain single-bundle JSON
    Json,
    /// Gzip-compressed single-bundle JSON
    JsonGz,
    /// Bzip2-compressed single-bundle JSON
    JsonBz2,
    /// Newline-delimited multi-bundle file
    Ndjson,
}

/// Classify a file by its suffix; anything unknown is skipped by discovery.
pub fn classify(path: &Path) -> Option<FileKind> {
    let name = path.file_name()?.to_string_lossy();
    if name.ends_with(".json") {
        Some(FileKind::Json)
    } else if name.ends_with(".json.gz") {
        Some(FileKind::JsonGz)
    } else if name.ends_with(".json.bz2") {
        Some(FileKind::JsonBz2)
    } else if name.ends_with(".ndjson") {
        Some(FileKind::Ndjson)
    } else {
        None
    }
}

/// One discovered bundle. If `error` is set the identifier may be partial and
/// downstream must surface the error without opening the file.
#[derive(Debug)]
pub struct DiscoveredBundle {
    pub id: BundleIdentifier,
    pub kind: FileKind,
    pub error: Option<anyhow::Error>,
}

/// Files a directory walk considers uploadable, in walk order.
#[derive(Debug, Default)]
pub struct ProcessableFiles {
    pub single_bundle_files: Vec<PathBuf>,
    pub multi_bundle_files: Vec<PathBuf>,
}

/// Recursively collects processable files under `dir`. Directory entries are
/// visited in name order so repeated runs enumerate identically.
pub fn find_processable_files(dir: &Path) -> Result<ProcessableFiles> {
    let mut files = ProcessableFiles::default();
    collect_files(dir, &mut files)?;
    Ok(files)
}

fn collect_files(dir: &Path, files: &mut ProcessableFiles) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("error while reading directory {}", dir.display()))?
        .collect::<std::io::Result<_>>()
        .with_context(|| format!("error while reading directory {}", dir.display()))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, files)?;
        } else {
            match classify(&path) {
                Some(FileKind::Ndjson) => files.multi_bundle_files.push(path),
                Some(_) => files.single_bundle_files.push(path),
                None => {}
            }
        }
    }
    Ok(())
}

/// A chunk within a file, delimited by its byte positions counted from the
/// file's beginning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileChunk {
    pub chunk_number: u32,
    pub start: u64,
    pub end: u64,
}

/// A single result of a file chunk calculation. The chunk number is
/// meaningful even in the presence of an error.
#[derive(Debug)]
pub struct FileChunkResult {
    pub chunk: FileChunk,
    pub error: Option<std::io::Error>,
}

/// Calculates all chunks of `r` that are delimited by `delimiter`, reading in
/// a streamed fashion. Zero-length chunks are dropped. A read error carries
/// the would-be chunk number and terminates the stream.
pub fn calculate_file_chunks<R: Read>(mut r: R, delimiter: u8, results: &Sender<FileChunkResult>) {
    let mut next_chunk_start: u64 = 0;
    let mut already_read: u64 = 0;
    let mut chunk_number: u32 = 0;
    let mut buf = [0u8; CHUNK_SCAN_BUFFER_SIZE];

    loop {
        match r.read(&mut buf) {
            Ok(0) => {
                // For when r does not end with the delimiter.
                if already_read > next_chunk_start {
                    chunk_number += 1;
                    let _ = results.send(FileChunkResult {
                        chunk: FileChunk {
                            chunk_number,
                            start: next_chunk_start,
                            end: already_read,
                        },
                        error: None,
                    });
                }
                return;
            }
            Ok(n) => {
                for (idx, &b) in buf[..n].iter().enumerate() {
                    if b == delimiter {
                        let end = already_read + idx as u64;
                        if end > next_chunk_start {
                            chunk_number += 1;
                            let _ = results.send(FileChunkResult {
                                chunk: FileChunk {
                                    chunk_number,
                                    start: next_chunk_start,
                                    end,
                                },
                                error: None,
                            });
                        }
                        next_chunk_start = end + 1;
                    }
                }
                already_read += n as u64;
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => {
                let _ = results.send(FileChunkResult {
                    chunk: FileChunk {
                        chunk_number: chunk_number + 1,
                        start: next_chunk_start,
                        end: already_read,
                    },
                    error: Some(err),
                });
                return;
            }
        }
    }
}

/// Discovers every bundle under `dir`. Two producers run concurrently, one
/// over single-bundle files and one over newline-delimited files, feeding a
/// shared channel; the result keeps per-file order but interleaves files.
pub async fn discover_bundles(dir: &Path) -> Result<Vec<DiscoveredBundle>> {
    let files = find_processable_files(dir)?;
    let (tx, mut rx) = mpsc::channel::<DiscoveredBundle>(64);

    let single_tx = tx.clone();
    let single_files = files.single_bundle_files;
    let single_producer = tokio::task::spawn_blocking(move || {
        for path in single_files {
            let kind = classify(&path).unwrap_or(FileKind::Json);
            let bundle = match std::fs::metadata(&path) {
                // Zero-length ranges are dropped, never transmitted.
                Ok(meta) if meta.len() == 0 => {
                    log::debug!("skipping empty file {}", path.display());
                    continue;
                }
                Ok(meta) => DiscoveredBundle {
                    id: BundleIdentifier {
                        path,
                        index: 1,
                        start: 0,
                        end: meta.len(),
                    },
                    kind,
                    error: None,
                },
                Err(err) => DiscoveredBundle {
                    id: BundleIdentifier {
                        path,
                        index: 1,
                        start: 0,
                        end: 0,
                    },
                    kind,
                    error: Some(anyhow::Error::new(err).context("error while inspecting file")),
                },
            };
            if single_tx.blocking_send(bundle).is_err() {
                return;
            }
        }
    });

    let multi_tx = tx;
    let multi_files = files.multi_bundle_files;
    let multi_producer = tokio::task::spawn_blocking(move || {
        for path in multi_files {
            let file = match File::open(&path) {
                Ok(file) => file,
                Err(err) => {
                    let bundle = DiscoveredBundle {
                        id: BundleIdentifier {
                            path,
                            index: 1,
                            start: 0,
                            end: 0,
                        },
                        kind: FileKind::Ndjson,
                        error: Some(anyhow::Error::new(err).context("error while opening file")),
                    };
                    if multi_tx.blocking_send(bundle).is_err() {
                        return;
                    }
                    continue;
                }
            };

            let (chunk_tx, chunk_rx) = std::sync::mpsc::channel();
            calculate_file_chunks(BufReader::new(file), b'\n', &chunk_tx);
            drop(chunk_tx);

            for result in chunk_rx {
                let error = result.error.map(|err| {
                    anyhow::Error::new(err).context("error while scanning file for bundles")
                });
                let bundle = DiscoveredBundle {
                    id: BundleIdentifier {
                        path: path.clone(),
                        index: result.chunk.chunk_number,
                        start: result.chunk.start,
                        end: result.chunk.end,
                    },
                    kind: FileKind::Ndjson,
                    error,
                };
                if multi_tx.blocking_send(bundle).is_err() {
                    return;
                }
            }
        }
    });

    let mut bundles = Vec::new();
    while let Some(bundle) = rx.recv().await {
        bundles.push(bundle);
    }
    single_producer.await.context("single-bundle producer failed")?;
    multi_producer.await.context("multi-bundle producer failed")?;

    Ok(bundles)
}

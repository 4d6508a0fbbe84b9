//! Streams a file in fixed-size chunks, producing the per-chunk MD5 table
//! and the whole-file MD5.
//!
//! The chunking loop uses `tools::fs::file_chunker`, which gives the
//! required `O(chunk_size)` memory bound. The per-chunk hashing wrapper is a
//! CRC32/HMAC-style reader shape but hashes MD5 via the `md5` crate —
//! grounded on `harborgrid-justin-caddy`'s `md5 = "0.7"` dependency, the
//! pack's only explicit MD5 crate. The sidecar is written atomically via
//! `tools::fs::replace_file`'s temp-and-rename discipline.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{format_err, Error};
use thiserror::Error as ThisError;

use crate::tools::fs::{file_chunker, replace_file};

#[derive(ThisError, Debug)]
pub enum ChecksumError {
    #[error("checksum I/O error: {0}")]
    ChecksumIOError(String),
    #[error("source file disappeared while checksumming")]
    SourceMissing,
}

/// One line of the `.checksums` sidecar: byte offset, length, MD5 hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkChecksum {
    pub offset: u64,
    pub length: u64,
    pub md5_hex: String,
}

/// Result of checksumming one file.
#[derive(Debug, Clone)]
pub struct ChecksumResult {
    pub chunks: Vec<ChunkChecksum>,
    pub whole_file_md5: String,
}

pub struct Checksummer {
    chunk_size: usize,
}

impl Checksummer {
    pub fn new(chunk_size: usize) -> Self {
        Checksummer { chunk_size }
    }

    /// Reads `src`, computing the per-chunk and whole-file MD5, and writes
    /// `dst` (the `.checksums` sidecar) atomically. Cooperative cancellation:
    /// `should_cancel` is polled at every chunk boundary.
    pub fn run<F>(&self, src: &Path, dst: &Path, mut should_cancel: F) -> Result<ChecksumResult, Error>
    where
        F: FnMut() -> bool,
    {
        let file = File::open(src).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::new(ChecksumError::SourceMissing)
            } else {
                Error::new(ChecksumError::ChecksumIOError(err.to_string()))
            }
        })?;

        let mut whole_file_hasher = md5::Context::new();
        let mut chunks = Vec::new();
        let mut cancelled = false;

        file_chunker(file, self.chunk_size, |offset, data| {
            if should_cancel() {
                cancelled = true;
                return Ok(false);
            }
            whole_file_hasher.consume(data);
            let mut chunk_hasher = md5::Context::new();
            chunk_hasher.consume(data);
            chunks.push(ChunkChecksum {
                offset,
                length: data.len() as u64,
                md5_hex: hex::encode(chunk_hasher.compute().0),
            });
            Ok(true)
        })
        .map_err(|err| format_err!("{}", ChecksumError::ChecksumIOError(err.to_string())))?;

        if cancelled {
            return Err(format_err!("checksum job cancelled"));
        }

        let whole_file_md5 = hex::encode(whole_file_hasher.compute().0);

        let mut sidecar = String::new();
        for chunk in &chunks {
            sidecar.push_str(&format!("{} {} {}\n", chunk.offset, chunk.length, chunk.md5_hex));
        }
        replace_file(dst, sidecar.as_bytes())
            .map_err(|err| format_err!("{}", ChecksumError::ChecksumIOError(err.to_string())))?;

        Ok(ChecksumResult {
            chunks,
            whole_file_md5,
        })
    }
}

/// Parses a `.checksums` sidecar back into its chunk table, used by the
/// range-serving path to align `Range` requests to chunk boundaries.
pub fn read_sidecar(path: &Path) -> Result<Vec<ChunkChecksum>, Error> {
    let mut contents = String::new();
    File::open(path)?.read_to_string(&mut contents)?;

    let mut out = Vec::new();
    for line in contents.lines() {
        let mut parts = line.split(' ');
        let offset: u64 = parts
            .next()
            .ok_or_else(|| format_err!("malformed checksum sidecar line: {:?}", line))?
            .parse()?;
        let length: u64 = parts
            .next()
            .ok_or_else(|| format_err!("malformed checksum sidecar line: {:?}", line))?
            .parse()?;
        let md5_hex = parts
            .next()
            .ok_or_else(|| format_err!("malformed checksum sidecar line: {:?}", line))?
            .to_string();
        out.push(ChunkChecksum { offset, length, md5_hex });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> std::path::PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("irobot-checksummer-test-{}", crate::tools::fs::random_entity_dirname()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn chunk_count_matches_file_size_and_last_chunk_is_short() {
        let dir = scratch_dir();
        let src = dir.join("data");
        std::fs::write(&src, vec![9u8; 10_000]).unwrap();

        let summer = Checksummer::new(4096);
        let result = summer.run(&src, &dir.join("checksums"), || false).unwrap();

        assert_eq!(result.chunks.len(), 3);
        assert_eq!(result.chunks[2].length, 10_000 - 2 * 4096);
        for (i, chunk) in result.chunks.iter().enumerate() {
            assert_eq!(chunk.offset, (i * 4096) as u64);
        }
    }

    #[test]
    fn whole_file_md5_matches_known_vector() {
        let dir = scratch_dir();
        let src = dir.join("data");
        std::fs::write(&src, b"hello world").unwrap();

        let summer = Checksummer::new(1024 * 1024);
        let result = summer.run(&src, &dir.join("checksums"), || false).unwrap();
        assert_eq!(result.whole_file_md5, "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn sidecar_round_trips() {
        let dir = scratch_dir();
        let src = dir.join("data");
        std::fs::write(&src, vec![1u8; 9000]).unwrap();
        let sidecar_path = dir.join("checksums");

        let summer = Checksummer::new(4096);
        let result = summer.run(&src, &sidecar_path, || false).unwrap();

        let parsed = read_sidecar(&sidecar_path).unwrap();
        assert_eq!(parsed, result.chunks);
    }

    #[test]
    fn missing_source_reports_source_missing() {
        let dir = scratch_dir();
        let summer = Checksummer::new(4096);
        let err = summer
            .run(&dir.join("does-not-exist"), &dir.join("checksums"), || false)
            .unwrap_err();
        assert!(err.to_string().contains("disappeared"));
    }
}

//! Filesystem helpers: atomic writes and fixed-size chunked reads.
//!
//! Atomic writes go through a temp file plus rename; reads walk a file in
//! fixed-size chunks so large objects never need to sit fully in memory.

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Error};
use nix::unistd;

/// Write `data` to `path` atomically: write to a sibling temp file created
/// with `mkstemp`, then `rename(2)` it into place. A reader can never observe
/// a partially-written file at `path`.
pub fn replace_file<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<(), Error> {
    let path = path.as_ref();

    let mut template = path.to_owned();
    template.set_extension("tmp_XXXXXX");
    let (fd, tmp_path) = match unistd::mkstemp(&template) {
        Ok((fd, path)) => (fd, path),
        Err(err) => bail!("mkstemp {:?} failed: {}", template, err),
    };

    let tmp_path = tmp_path.as_path();

    use std::os::unix::io::FromRawFd;
    let mut file = unsafe { File::from_raw_fd(fd) };

    if let Err(err) = file.write_all(data) {
        let _ = unistd::unlink(tmp_path);
        bail!("write failed: {}", err);
    }
    if let Err(err) = file.sync_all() {
        let _ = unistd::unlink(tmp_path);
        bail!("fsync failed: {}", err);
    }

    if let Err(err) = std::fs::rename(tmp_path, path) {
        let _ = unistd::unlink(tmp_path);
        bail!("atomic rename failed for file {:?} - {}", path, err);
    }

    Ok(())
}

/// Streams `file` in fixed-size chunks of `chunk_size`, invoking `chunk_cb`
/// with `(offset, data)` for each chunk in ascending order, using a single
/// read buffer (`O(chunk_size)` memory regardless of file size).
///
/// The last chunk may be shorter than `chunk_size`. `chunk_cb` returning
/// `false` stops iteration early (used for cooperative cancellation).
pub fn file_chunker<C, R>(mut file: R, chunk_size: usize, mut chunk_cb: C) -> Result<(), Error>
where
    C: FnMut(u64, &[u8]) -> Result<bool, Error>,
    R: Read,
{
    const READ_BUFFER_SIZE: usize = 4 * 1024 * 1024;

    let read_buffer_size = READ_BUFFER_SIZE.max(chunk_size);
    let mut buf = vec![0u8; read_buffer_size];

    let mut pos = 0;
    let mut file_pos: u64 = 0;
    loop {
        let mut eof = false;
        let mut tmp = &mut buf[..];
        while pos < chunk_size {
            match file.read(tmp) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => {
                    pos += n;
                    if pos > chunk_size {
                        break;
                    }
                    tmp = &mut tmp[n..];
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => { /* retry */ }
                Err(e) => bail!("read chunk failed - {}", e),
            }
        }

        let mut start = 0;
        while start + chunk_size <= pos {
            if !(chunk_cb)(file_pos, &buf[start..start + chunk_size])? {
                return Ok(());
            }
            file_pos += chunk_size as u64;
            start += chunk_size;
        }

        if eof {
            if start < pos {
                (chunk_cb)(file_pos, &buf[start..pos])?;
            }
            break;
        } else {
            let rest = pos - start;
            if rest > 0 {
                let ptr = buf.as_mut_ptr();
                unsafe {
                    std::ptr::copy_nonoverlapping(ptr.add(start), ptr, rest);
                }
                pos = rest;
            } else {
                pos = 0;
            }
        }
    }

    Ok(())
}

/// Generates an opaque, collision-free directory name for a fresh entity.
/// Uses the PID, the current time, and a small counter seeded from the
/// address of a stack value so repeated calls within the same process never
/// collide even within the same clock tick.
pub fn random_entity_dirname() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    let now = crate::tools::time::epoch_f64();
    format!("{:x}-{:x}-{:x}", (now * 1e6) as u64, pid, n)
}

/// Renames `dir` to a tombstone name in the same parent directory, then
/// removes the tombstone recursively. Concurrent readers that already hold
/// open file descriptors into `dir` are unaffected by the rename; only a
/// fresh lookup by the original path would fail, and the admission lock
/// guarantees no fresh lookup races the delete.
pub fn tombstone_and_remove_dir(dir: &Path) -> Result<(), Error> {
    if !dir.exists() {
        return Ok(());
    }
    let mut tombstone: PathBuf = dir.to_owned();
    let file_name = tombstone
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    tombstone.set_file_name(format!(".{}.deleted-{}", file_name.to_string_lossy(), std::process::id()));

    std::fs::rename(dir, &tombstone)
        .map_err(|err| anyhow::format_err!("rename to tombstone {:?} failed: {}", tombstone, err))?;
    std::fs::remove_dir_all(&tombstone)
        .map_err(|err| anyhow::format_err!("remove tombstone {:?} failed: {}", tombstone, err))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn scratch_dir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("irobot-fs-test-{}", random_entity_dirname()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn replace_file_is_atomic_and_readable() {
        let dir = scratch_dir();
        let path = dir.join("sidecar");
        replace_file(&path, b"hello world").unwrap();
        let data = std::fs::read(&path).unwrap();
        assert_eq!(data, b"hello world");
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn file_chunker_splits_into_fixed_size_chunks_with_short_last_chunk() {
        let data = vec![7u8; 10_500];
        let mut chunks = Vec::new();
        file_chunker(Cursor::new(data.clone()), 4096, |offset, chunk| {
            chunks.push((offset, chunk.len()));
            Ok(true)
        })
        .unwrap();

        assert_eq!(chunks, vec![(0, 4096), (4096, 4096), (8192, 2308)]);
    }

    #[test]
    fn file_chunker_stops_early_when_callback_returns_false() {
        let data = vec![1u8; 20_000];
        let mut seen = 0;
        file_chunker(Cursor::new(data), 4096, |_offset, _chunk| {
            seen += 1;
            Ok(seen < 2)
        })
        .unwrap();
        assert_eq!(seen, 2);
    }

    #[test]
    fn tombstone_and_remove_dir_deletes_directory_tree() {
        let dir = scratch_dir();
        std::fs::write(dir.join("data"), b"x").unwrap();
        tombstone_and_remove_dir(&dir).unwrap();
        assert!(!dir.exists());
    }
}

//! Filesystem helpers shared by staging, reporting and the run lock.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use serde::Serialize;
use sha2::{Digest, Sha256};

pub(crate) const COPY_BUFFER: usize = 1024 * 1024;

/// Serialize `value` as pretty JSON and move it into place atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path without parent '{}'", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("creating parent directory '{}'", parent.display()))?;
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    let mut payload =
        serde_json::to_vec_pretty(value).with_context(|| format!("serializing '{}'", path.display()))?;
    payload.push(b'\n');
    fs::write(&tmp, payload).with_context(|| format!("writing temp file '{}'", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "renaming temp file '{}' to '{}'",
            tmp.display(),
            path.display()
        )
    })?;
    Ok(())
}

/// Streaming sha256 of a file, with its size.
pub fn sha256_file(path: &Path) -> io::Result<(String, u64)> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_BUFFER];
    let mut size = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

/// Rename, falling back to copy and remove across filesystems.
pub fn atomic_rename(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(src, dst)?;
            fs::remove_file(src)
        }
    }
}

/// Hardlink `src` to `dest`, replacing `dest`; copy when linking fails.
pub fn hardlink_or_copy(src: &Path, dest: &Path) -> io::Result<()> {
    match fs::remove_file(dest) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }

    // Fast path: same filesystem, no copy cost.
    if fs::hard_link(src, dest).is_ok() {
        return Ok(());
    }

    let tmp = dest.with_extension("tmp");
    fs::copy(src, &tmp)?;
    atomic_rename(&tmp, dest)
}

/// Whether both paths name the same inode.
pub fn same_file(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (fs::metadata(a), fs::metadata(b)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

/// Exclusive lock on an output root, released on drop.
///
/// The lock file itself is left in place: unlinking it would let one process
/// lock the old inode while another locks a fresh file at the same path.
#[derive(Debug)]
pub struct OutputLock {
    file: File,
}

impl OutputLock {
    pub const FILE_NAME: &'static str = ".refplat-builder.lock";

    pub fn acquire(root: &Path) -> Result<Self> {
        let path = root.join(Self::FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("creating lock file '{}'", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            drop(file);
            return Err(anyhow!(
                "output directory is locked by another run: {}",
                path.display()
            ));
        }

        Ok(Self { file })
    }
}

impl Drop for OutputLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sha256_of_known_content() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("abc");
        fs::write(&path, b"abc").unwrap();
        let (sha, size) = sha256_file(&path).unwrap();
        assert_eq!(
            sha,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(size, 3);
    }

    #[test]
    fn test_hardlink_or_copy_replaces_existing() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src.qcow2");
        let dest = tmp.path().join("dest.qcow2");
        fs::write(&src, b"new").unwrap();
        fs::write(&dest, b"old").unwrap();
        hardlink_or_copy(&src, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"new");
    }

    #[test]
    fn test_json_is_written_atomically() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/manifest.json");
        write_json_atomic(&path, &serde_json::json!({"images": []})).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.ends_with('\n'));
        assert_eq!(fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn test_second_lock_on_same_root_fails() {
        let tmp = TempDir::new().unwrap();
        let first = OutputLock::acquire(tmp.path()).unwrap();
        assert!(OutputLock::acquire(tmp.path()).is_err());
        drop(first);
        let _again = OutputLock::acquire(tmp.path()).unwrap();
    }

    #[test]
    fn test_lock_file_survives_release() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(OutputLock::FILE_NAME);
        drop(OutputLock::acquire(tmp.path()).unwrap());
        assert!(path.is_file());

        // The same inode is locked again, not a replacement file.
        let before = tmp.path().join("before.lock");
        fs::hard_link(&path, &before).unwrap();
        let _held = OutputLock::acquire(tmp.path()).unwrap();
        assert!(same_file(&path, &before));
    }
}

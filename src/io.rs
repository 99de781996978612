// Copyright (c) 2026-present, the quartz-index authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Low-level file access: positioned block reads and writes with
//! interrupted-call retry, fsync helpers and atomic file replacement.

use std::fs::File;
use std::io::{Error as IoError, ErrorKind, Write};
use std::path::Path;

#[cfg(unix)]
pub fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;

    while !buf.is_empty() {
        match file.read_at(buf, offset) {
            Ok(0) => {
                return Err(IoError::new(
                    ErrorKind::UnexpectedEof,
                    format!("short read at offset {offset}"),
                ));
            }
            Ok(n) => {
                let rest = buf;
                buf = rest.get_mut(n..).unwrap_or_default();
                offset += n as u64;
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(unix)]
pub fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;

    while !buf.is_empty() {
        match file.write_at(buf, offset) {
            Ok(0) => {
                return Err(IoError::new(
                    ErrorKind::WriteZero,
                    format!("zero-length write at offset {offset}"),
                ));
            }
            Ok(n) => {
                buf = buf.get(n..).unwrap_or_default();
                offset += n as u64;
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(windows)]
pub fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;

    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => {
                return Err(IoError::new(
                    ErrorKind::UnexpectedEof,
                    format!("short read at offset {offset}"),
                ));
            }
            Ok(n) => {
                let rest = buf;
                buf = rest.get_mut(n..).unwrap_or_default();
                offset += n as u64;
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(windows)]
pub fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;

    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => {
                return Err(IoError::new(
                    ErrorKind::WriteZero,
                    format!("zero-length write at offset {offset}"),
                ));
            }
            Ok(n) => {
                buf = buf.get(n..).unwrap_or_default();
                offset += n as u64;
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Atomically rewrites a file.
pub fn rewrite_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let folder = path.parent().ok_or_else(|| {
        IoError::new(ErrorKind::InvalidInput, "path has no parent directory")
    })?;

    let mut temp_file = tempfile::NamedTempFile::new_in(folder)?;
    temp_file.write_all(content)?;
    temp_file.flush()?;
    temp_file.as_file_mut().sync_all()?;
    temp_file.persist(path)?;

    #[cfg(not(target_os = "windows"))]
    {
        let file = File::open(path)?;
        file.sync_all()?;
        fsync_directory(folder)?;
    }

    Ok(())
}

#[cfg(not(target_os = "windows"))]
pub fn fsync_directory(path: &Path) -> std::io::Result<()> {
    let file = File::open(path)?;
    debug_assert!(file.metadata()?.is_dir());
    file.sync_all()
}

#[cfg(target_os = "windows")]
pub fn fsync_directory(_path: &Path) -> std::io::Result<()> {
    // Cannot fsync directory on Windows
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn atomic_rewrite() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;

        let path = dir.path().join("test.txt");
        std::fs::write(&path, "asdasdasdasdasd")?;

        rewrite_atomic(&path, b"newcontent")?;

        let content = std::fs::read_to_string(&path)?;
        assert_eq!("newcontent", content);

        Ok(())
    }

    #[test]
    fn positioned_read_write_roundtrip() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("blocks");

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        write_all_at(&file, &[1u8; 4096], 0)?;
        write_all_at(&file, &[2u8; 4096], 4096)?;

        let mut buf = [0u8; 4096];
        read_exact_at(&file, &mut buf, 4096)?;
        assert_eq!([2u8; 4096], buf);

        read_exact_at(&file, &mut buf, 0)?;
        assert_eq!([1u8; 4096], buf);

        // Reading off the end of the file must fail, not hand back garbage.
        assert!(read_exact_at(&file, &mut buf, 3 * 4096).is_err());

        Ok(())
    }
}

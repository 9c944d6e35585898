//! # Output File Storage
//!
//! Filesystem collaborator for receiver sessions: output directory
//! preparation, output-path naming, the positioned-write file handle, and
//! the protocol's 32-bit XOR content hash.

use std::fs;
use std::fs::{File, OpenOptions};
use std::io;
use std::io::Read;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::registry::SessionHandle;

/// A failed storage operation.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("failed to ensure directory '{path}': {source}")]
    EnsureDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to open output file '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Create `path` (and missing parents) if it does not exist yet.
pub fn ensure_directory(path: &Path) -> Result<(), StorageError> {
    fs::create_dir_all(path).map_err(|source| StorageError::EnsureDir {
        path: path.to_path_buf(),
        source,
    })
}

/// Where a session stores its download: `<dir>/<handle>.<filename>`, or the
/// same name relative to the working directory when no output directory is
/// configured. The handle prefix keeps concurrent downloads of the same
/// file apart.
pub fn output_path(out_dir: Option<&Path>, handle: SessionHandle, filename: &str) -> PathBuf {
    let name = format!("{}.{}", handle, filename);
    match out_dir {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    }
}

/// Open `path` for positioned writes, creating it and truncating any
/// previous content. The handle is also readable so the content hash can be
/// recomputed after completion.
pub fn open_for_write(path: &Path) -> Result<File, StorageError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|source| StorageError::Open {
            path: path.to_path_buf(),
            source,
        })
}

/// XOR hash of a file's content, read as little-endian `u32` words with the
/// trailing partial word zero-padded. Matches the hash the sender reports
/// in the handshake reply.
pub fn file_hash(path: &Path) -> io::Result<u32> {
    let mut file = File::open(path)?;
    let mut buf = [0u8; 4096];
    let mut carry: Vec<u8> = vec![];
    let mut sum: u32 = 0;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        carry.extend_from_slice(&buf[..n]);
        let whole = carry.len() / 4 * 4;
        for chunk in carry[..whole].chunks_exact(4) {
            sum ^= LittleEndian::read_u32(chunk);
        }
        carry.drain(..whole);
    }
    if !carry.is_empty() {
        let mut last = [0u8; 4];
        last[..carry.len()].copy_from_slice(&carry);
        sum ^= LittleEndian::read_u32(&last);
    }
    Ok(sum)
}

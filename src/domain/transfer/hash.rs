//! Whole-file SHA-256 hashing.
//!
//! Hashing is CPU bound, so the async entry point runs on tokio's blocking pool.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

const HASH_BUFFER_SIZE: usize = 1024 * 1024;

pub async fn compute_sha256(path: &Path) -> io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || compute_sha256_sync(&path))
        .await
        .map_err(|e| io::Error::other(format!("hash task failed: {e}")))?
}

pub fn compute_sha256_sync(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

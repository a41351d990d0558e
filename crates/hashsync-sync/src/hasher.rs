//! Streaming SHA-256 content identity
//!
//! Stateless helpers: content is read in bounded chunks, so memory use does
//! not grow with file size.

use hashsync_types::{BufferSize, ContentHash, Error, Result};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Hash an in-memory buffer
pub fn hash_bytes(data: &[u8]) -> ContentHash {
    ContentHash::from_bytes(Sha256::digest(data).into())
}

/// Hash everything a reader yields, returning the digest and byte count
///
/// ```rust
/// use hashsync_sync::{hash_bytes, hash_reader};
/// use hashsync_types::BufferSize;
///
/// # tokio_test::block_on(async {
/// let mut reader: &[u8] = b"hello";
/// let (hash, len) = hash_reader(&mut reader, BufferSize::default()).await.unwrap();
/// assert_eq!(hash, hash_bytes(b"hello"));
/// assert_eq!(len, 5);
/// # });
/// ```
pub async fn hash_reader<R>(reader: &mut R, buffer_size: BufferSize) -> std::io::Result<(ContentHash, u64)>
where
    R: AsyncRead + Unpin,
{
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; buffer_size.get()];
    let mut total = 0u64;

    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        total += read as u64;
    }

    Ok((ContentHash::from_bytes(hasher.finalize().into()), total))
}

/// Hash a file's full content, returning the digest and its length
pub async fn digest_file(path: &Path, buffer_size: BufferSize) -> Result<(ContentHash, u64)> {
    let mut file = File::open(path)
        .await
        .map_err(|e| Error::io_at(path, "open", &e))?;
    hash_reader(&mut file, buffer_size)
        .await
        .map_err(|e| Error::io_at(path, "read", &e))
}

/// Hash a file's full content
pub async fn hash_file(path: &Path, buffer_size: BufferSize) -> Result<ContentHash> {
    digest_file(path, buffer_size).await.map(|(hash, _)| hash)
}

//! Resume decisions for partially staged blobs

use hashsync_types::{Error, Result};
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncSeekExt;

/// What to do with the blob slot before touching the network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePoint {
    /// The slot already holds `size` bytes; only verification is needed
    Verify,
    /// Request the blob from this offset and append
    Resume(u64),
    /// The slot holds more than `size` bytes and must be discarded first
    Discard,
}

impl ResumePoint {
    /// Decide from the staged length and the manifest size
    pub fn decide(staged_len: u64, size: u64, exists: bool) -> Self {
        if staged_len > size {
            Self::Discard
        } else if staged_len == size && exists {
            Self::Verify
        } else {
            Self::Resume(staged_len)
        }
    }
}

/// Bytes of a staged blob that count as already downloaded
///
/// Oversized leftovers are discarded before the transfer, so they count as
/// nothing.
pub fn counted_len(staged_len: u64, size: u64) -> u64 {
    if staged_len <= size {
        staged_len
    } else {
        0
    }
}

/// Open the blob slot for writing at `start`, dropping anything past it
pub async fn open_at(path: &Path, start: u64) -> Result<File> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await
        .map_err(|e| Error::io_at(path, "open staged blob", &e))?;

    file.set_len(start)
        .await
        .map_err(|e| Error::io_at(path, "truncate staged blob", &e))?;
    file.seek(SeekFrom::Start(start))
        .await
        .map_err(|e| Error::io_at(path, "seek staged blob", &e))?;

    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    #[rstest]
    #[case(0, 100, false, ResumePoint::Resume(0))]
    #[case(40, 100, true, ResumePoint::Resume(40))]
    #[case(100, 100, true, ResumePoint::Verify)]
    #[case(150, 100, true, ResumePoint::Discard)]
    #[case(0, 0, true, ResumePoint::Verify)]
    #[case(0, 0, false, ResumePoint::Resume(0))]
    fn test_decide(
        #[case] staged: u64,
        #[case] size: u64,
        #[case] exists: bool,
        #[case] expected: ResumePoint,
    ) {
        assert_eq!(ResumePoint::decide(staged, size, exists), expected);
    }

    #[test]
    fn test_counted_len() {
        assert_eq!(counted_len(30, 100), 30);
        assert_eq!(counted_len(100, 100), 100);
        assert_eq!(counted_len(101, 100), 0);
    }

    #[tokio::test]
    async fn test_open_at_truncates_and_appends() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("blob");
        tokio::fs::write(&path, b"0123456789").await.unwrap();

        let mut file = open_at(&path, 4).await.unwrap();
        file.write_all(b"abc").await.unwrap();
        file.flush().await.unwrap();
        drop(file);

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"0123abc");
    }
}

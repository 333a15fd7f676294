use std::path::Path;

use md5::{Digest, Md5};
use tokio::io::AsyncReadExt;

const BUF_SIZE: usize = 64 * 1024;

/// Compute the MD5 hash of a file, reading in 64 KB chunks.
/// Returns the hex-encoded hash string (32 chars, lowercase).
///
/// On open or read failure the empty sentinel is returned; the
/// reconciler treats it as "content unknown, force transfer".
pub async fn hash_file(path: &Path) -> String {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot open for hashing");
            return String::new();
        }
    };

    let mut hasher = Md5::new();
    let mut buf = vec![0u8; BUF_SIZE];

    loop {
        let n = match file.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "read failed while hashing");
                return String::new();
            }
        };
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    hex_encode(&hasher.finalize())
}

/// MD5 of a string, used for directory hash aggregation.
pub fn hash_string(s: &str) -> String {
    hash_bytes(s.as_bytes())
}

/// MD5 of a byte slice.
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex_encode(&Md5::digest(bytes))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn md5_of_known_content() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"hello world").unwrap();
        f.flush().unwrap();

        let hash = hash_file(f.path()).await;
        // MD5 of "hello world" is 5eb63bbbe01eeed093cb22bb8f5acdc3
        assert_eq!(hash, "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[tokio::test]
    async fn md5_of_empty_file() {
        let f = NamedTempFile::new().unwrap();
        let hash = hash_file(f.path()).await;
        // MD5 of empty content is d41d8cd98f00b204e9800998ecf8427e
        assert_eq!(hash, "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[tokio::test]
    async fn missing_file_yields_sentinel() {
        let hash = hash_file(Path::new("/nonexistent/definitely-not-here")).await;
        assert!(hash.is_empty());
    }

    #[test]
    fn md5_of_string() {
        assert_eq!(hash_string("hello world"), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }
}

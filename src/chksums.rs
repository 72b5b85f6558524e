use digest::Digest;
use md5::Md5;
use sha2::Sha256;
use std::pin::Pin;
use std::task::Poll;
use tokio::io::{self, AsyncRead, ReadBuf};

/// Tee reader that hashes everything passing through it. Downloads use it to
/// compute the MD5SUM-side digest and the provenance SHA-256 in one pass.
pub struct Hasher<R> {
    reader: R,
    md5: Md5,
    sha256: Sha256,
    size: u64,
}

impl<R: AsyncRead + Unpin> AsyncRead for Hasher<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        if let Poll::Ready(x) = Pin::new(&mut self.reader).poll_read(cx, buf) {
            let buf = buf.filled();
            let new = &buf[before..];
            self.md5.update(new);
            self.sha256.update(new);
            self.size = self.size.saturating_add(new.len() as u64);
            Poll::Ready(x)
        } else {
            Poll::Pending
        }
    }
}

impl<R> Hasher<R> {
    pub fn new(reader: R) -> Self {
        Hasher {
            reader,
            md5: Md5::new(),
            sha256: Sha256::new(),
            size: 0,
        }
    }

    pub fn digests(self) -> (R, Checksums) {
        (
            self.reader,
            Checksums {
                md5: hex::encode(self.md5.finalize()),
                sha256: hex::encode(self.sha256.finalize()),
                size: self.size,
            },
        )
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct Checksums {
    pub md5: String,
    pub sha256: String,
    pub size: u64,
}

pub fn md5_hex(data: &[u8]) -> String {
    let mut md5 = Md5::new();
    md5.update(data);
    hex::encode(md5.finalize())
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut sha256 = Sha256::new();
    sha256.update(data);
    hex::encode(sha256.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_hasher_stream() {
        let data = b"abc".to_vec();
        let mut hasher = Hasher::new(&data[..]);
        let mut sink = Vec::new();
        hasher.read_to_end(&mut sink).await.unwrap();
        assert_eq!(sink, b"abc");

        let (_, chksums) = hasher.digests();
        assert_eq!(chksums.size, 3);
        assert_eq!(chksums.md5, "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(
            chksums.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_md5_hex() {
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
    }
}

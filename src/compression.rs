use crate::errors::*;
use async_compression::tokio::bufread::{BzDecoder, GzipDecoder, XzDecoder, ZstdDecoder};
use std::io::ErrorKind;
use std::path::Path;
use std::pin::Pin;
use std::task::Poll;
use tokio::fs::File;
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader, ReadBuf};

pub const MAGIC_ZSTD: &[u8] = b"\x28\xb5\x2f\xfd";
pub const MAGIC_GZIP: &[u8] = b"\x1f\x8b";
pub const MAGIC_XZ: &[u8] = b"\xfd7zXZ\x00";
pub const MAGIC_BZ2: &[u8] = b"BZ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Zstd,
    Gzip,
    Xz,
    Bzip2,
    Plain,
}

impl Format {
    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Zstd => "zstd",
            Format::Gzip => "gzip",
            Format::Xz => "xz",
            Format::Bzip2 => "bzip2",
            Format::Plain => "plain",
        }
    }
}

/// Detect the compression format from the first bytes of a stream.
pub fn detect_format(data: &[u8]) -> Format {
    if data.starts_with(MAGIC_ZSTD) {
        Format::Zstd
    } else if data.starts_with(MAGIC_XZ) {
        Format::Xz
    } else if data.starts_with(MAGIC_GZIP) {
        Format::Gzip
    } else if data.starts_with(MAGIC_BZ2) {
        Format::Bzip2
    } else {
        Format::Plain
    }
}

pub enum Decompressor<R> {
    Plain(R),
    Zstd(ZstdDecoder<R>),
    Gz(GzipDecoder<R>),
    Xz(XzDecoder<R>),
    Bz2(BzDecoder<R>),
}

impl<R: AsyncBufRead> Decompressor<R> {
    pub fn new(format: Format, reader: R) -> Self {
        match format {
            Format::Plain => Decompressor::Plain(reader),
            Format::Zstd => Decompressor::Zstd(ZstdDecoder::new(reader)),
            Format::Gzip => Decompressor::Gz(GzipDecoder::new(reader)),
            Format::Xz => Decompressor::Xz(XzDecoder::new(reader)),
            Format::Bzip2 => {
                let mut decoder = BzDecoder::new(reader);
                decoder.multiple_members(true);
                Decompressor::Bz2(decoder)
            }
        }
    }

    pub fn into_inner(self) -> R {
        match self {
            Decompressor::Plain(r) => r,
            Decompressor::Zstd(r) => r.into_inner(),
            Decompressor::Gz(r) => r.into_inner(),
            Decompressor::Xz(r) => r.into_inner(),
            Decompressor::Bz2(r) => r.into_inner(),
        }
    }
}

impl<R: AsyncBufRead + Unpin> AsyncRead for Decompressor<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Decompressor::Plain(r) => Pin::new(r).poll_read(cx, buf),
            Decompressor::Zstd(r) => Pin::new(r).poll_read(cx, buf),
            Decompressor::Gz(r) => Pin::new(r).poll_read(cx, buf),
            Decompressor::Xz(r) => Pin::new(r).poll_read(cx, buf),
            Decompressor::Bz2(r) => Pin::new(r).poll_read(cx, buf),
        }
    }
}

/// Decompress a full in-memory buffer, auto-detecting the format.
/// Unknown magic passes through untouched.
pub async fn decompress_bytes(data: &[u8]) -> Result<Vec<u8>> {
    let format = detect_format(data);
    if format == Format::Plain {
        return Ok(data.to_vec());
    }
    let mut reader = Decompressor::new(format, data);
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await.map_err(|err| {
        if err.kind() == ErrorKind::UnexpectedEof {
            Error::TruncatedStream
        } else {
            Error::Io(err)
        }
    })?;
    Ok(buf)
}

/// Open a compressed file as a decompressed byte stream.
pub async fn open_decompressed_stream(path: &Path) -> Result<Decompressor<BufReader<File>>> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let magic = reader.fill_buf().await?;
    let format = detect_format(magic);
    Ok(Decompressor::new(format, reader))
}

/// Decompress a file and decode it as UTF-8 text.
///
/// Fails with `UnknownCompression` when the magic is unrecognized and the
/// raw bytes are not valid text either.
pub async fn decompress_to_string(path: &Path) -> Result<String> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let magic = reader.fill_buf().await?;
    let format = detect_format(magic);

    let mut buf = Vec::new();
    Decompressor::new(format, reader)
        .read_to_end(&mut buf)
        .await
        .map_err(|err| {
            if err.kind() == ErrorKind::UnexpectedEof {
                Error::TruncatedStream
            } else {
                Error::Io(err)
            }
        })?;

    match String::from_utf8(buf) {
        Ok(text) => Ok(text),
        Err(_) if format == Format::Plain => Err(Error::UnknownCompression),
        Err(err) => Ok(String::from_utf8_lossy(err.as_bytes()).into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_compression::tokio::bufread::{GzipEncoder, ZstdEncoder};

    #[test]
    fn test_detect_format() {
        assert_eq!(detect_format(b"\x28\xb5\x2f\xfd\x00\x00"), Format::Zstd);
        assert_eq!(detect_format(b"\x1f\x8b\x08\x00"), Format::Gzip);
        assert_eq!(detect_format(b"\xfd7zXZ\x00\x00"), Format::Xz);
        assert_eq!(detect_format(b"BZh91AY"), Format::Bzip2);
        assert_eq!(detect_format(b"@summary@vim"), Format::Plain);
        assert_eq!(detect_format(b""), Format::Plain);
    }

    #[tokio::test]
    async fn test_decompress_zstd_roundtrip() {
        let mut encoder = ZstdEncoder::new(&b"hello"[..]);
        let mut compressed = Vec::new();
        encoder.read_to_end(&mut compressed).await.unwrap();
        assert_eq!(detect_format(&compressed), Format::Zstd);

        let decompressed = decompress_bytes(&compressed).await.unwrap();
        assert_eq!(decompressed, b"hello");
    }

    #[tokio::test]
    async fn test_decompress_gzip_roundtrip() {
        let mut encoder = GzipEncoder::new(&b"@info@vim-9.0-1.mga9.x86_64@0@1000@Editors"[..]);
        let mut compressed = Vec::new();
        encoder.read_to_end(&mut compressed).await.unwrap();

        let decompressed = decompress_bytes(&compressed).await.unwrap();
        assert_eq!(decompressed, b"@info@vim-9.0-1.mga9.x86_64@0@1000@Editors");
    }

    #[tokio::test]
    async fn test_plain_passthrough() {
        let decompressed = decompress_bytes(b"plain text").await.unwrap();
        assert_eq!(decompressed, b"plain text");
    }

    #[tokio::test]
    async fn test_truncated_zstd() {
        let mut encoder = ZstdEncoder::new(&b"some data that compresses to more than ten bytes"[..]);
        let mut compressed = Vec::new();
        encoder.read_to_end(&mut compressed).await.unwrap();
        compressed.truncate(compressed.len() / 2);

        assert!(decompress_bytes(&compressed).await.is_err());
    }
}

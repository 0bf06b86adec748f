//! Compression codecs and checksum plumbing.
//!
//! Checksums are computed over the uncompressed bytes on both sides of
//! the pipeline: the generator hashes before encoding, the applier hashes
//! after decoding. Files can therefore be recompressed without
//! invalidating the manifest.

use std::io::{self, Read, Write};

use sha2::{Digest, Sha256};

use steep_types::CompressionCodec;

/// A writer that hashes everything passing through it.
pub struct Sha256Writer<W: Write> {
    inner: W,
    hasher: Sha256,
    bytes: u64,
}

impl<W: Write> Sha256Writer<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    /// Finishes the inner writer and returns (hex digest, byte count).
    pub fn finish(self) -> io::Result<(String, u64, W)> {
        let digest = self.hasher.finalize();
        let mut hex = String::with_capacity(64);
        for byte in digest {
            use std::fmt::Write as _;
            write!(hex, "{byte:02x}").expect("writing to a String cannot fail");
        }
        Ok((hex, self.bytes, self.inner))
    }
}

impl<W: Write> Write for Sha256Writer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        self.bytes += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// A file writer applying the snapshot's codec.
pub enum EncodingWriter<W: Write> {
    Plain(W),
    Gzip(flate2::write::GzEncoder<W>),
    Lz4(Box<lz4_flex::frame::FrameEncoder<W>>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> EncodingWriter<W> {
    pub fn new(codec: CompressionCodec, inner: W) -> io::Result<Self> {
        Ok(match codec {
            CompressionCodec::None => EncodingWriter::Plain(inner),
            CompressionCodec::Gzip => EncodingWriter::Gzip(flate2::write::GzEncoder::new(
                inner,
                flate2::Compression::default(),
            )),
            CompressionCodec::Lz4 => {
                EncodingWriter::Lz4(Box::new(lz4_flex::frame::FrameEncoder::new(inner)))
            }
            CompressionCodec::Zstd => {
                EncodingWriter::Zstd(zstd::stream::write::Encoder::new(inner, 0)?)
            }
        })
    }

    /// Flushes codec framing and returns the inner writer.
    pub fn finish(self) -> io::Result<W> {
        match self {
            EncodingWriter::Plain(mut w) => {
                w.flush()?;
                Ok(w)
            }
            EncodingWriter::Gzip(w) => w.finish(),
            EncodingWriter::Lz4(w) => w
                .finish()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e)),
            EncodingWriter::Zstd(w) => w.finish(),
        }
    }
}

impl<W: Write> Write for EncodingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            EncodingWriter::Plain(w) => w.write(buf),
            EncodingWriter::Gzip(w) => w.write(buf),
            EncodingWriter::Lz4(w) => w.write(buf),
            EncodingWriter::Zstd(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            EncodingWriter::Plain(w) => w.flush(),
            EncodingWriter::Gzip(w) => w.flush(),
            EncodingWriter::Lz4(w) => w.flush(),
            EncodingWriter::Zstd(w) => w.flush(),
        }
    }
}

/// A file reader reversing the snapshot's codec.
pub enum DecodingReader<R: Read> {
    Plain(R),
    Gzip(flate2::read::GzDecoder<R>),
    Lz4(Box<lz4_flex::frame::FrameDecoder<R>>),
    Zstd(zstd::stream::read::Decoder<'static, io::BufReader<R>>),
}

impl<R: Read> DecodingReader<R> {
    pub fn new(codec: CompressionCodec, inner: R) -> io::Result<Self> {
        Ok(match codec {
            CompressionCodec::None => DecodingReader::Plain(inner),
            CompressionCodec::Gzip => DecodingReader::Gzip(flate2::read::GzDecoder::new(inner)),
            CompressionCodec::Lz4 => {
                DecodingReader::Lz4(Box::new(lz4_flex::frame::FrameDecoder::new(inner)))
            }
            CompressionCodec::Zstd => DecodingReader::Zstd(zstd::stream::read::Decoder::new(inner)?),
        })
    }
}

impl<R: Read> Read for DecodingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            DecodingReader::Plain(r) => r.read(buf),
            DecodingReader::Gzip(r) => r.read(buf),
            DecodingReader::Lz4(r) => r.read(buf),
            DecodingReader::Zstd(r) => r.read(buf),
        }
    }
}

/// Streams a reader to completion, returning (hex digest, byte count).
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut bytes = 0u64;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        bytes += n as u64;
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write as _;
        write!(hex, "{byte:02x}").expect("writing to a String cannot fail");
    }
    Ok((hex, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(CompressionCodec::None; "plain")]
    #[test_case(CompressionCodec::Gzip; "gzip")]
    #[test_case(CompressionCodec::Lz4; "lz4")]
    #[test_case(CompressionCodec::Zstd; "zstd")]
    fn encode_decode_preserves_bytes_and_checksum(codec: CompressionCodec) {
        let payload = b"id,name\n1,a\n2,b\n".repeat(1000);

        // Generator side: hash uncompressed, then encode.
        let mut encoder =
            EncodingWriter::new(codec, Vec::new()).expect("encoder");
        let mut hashed = Sha256Writer::new(&mut encoder);
        hashed.write_all(&payload).unwrap();
        let (write_digest, write_bytes, _) = hashed.finish().unwrap();
        let compressed = encoder.finish().unwrap();
        assert_eq!(write_bytes, payload.len() as u64);

        // Applier side: decode, then hash.
        let reader = DecodingReader::new(codec, compressed.as_slice()).expect("decoder");
        let (read_digest, read_bytes) = hash_reader(reader).unwrap();
        assert_eq!(read_bytes, payload.len() as u64);
        assert_eq!(read_digest, write_digest);
    }

    #[test]
    fn checksum_is_codec_independent() {
        let payload = b"same logical content";
        let mut digests = Vec::new();
        for codec in [
            CompressionCodec::None,
            CompressionCodec::Gzip,
            CompressionCodec::Lz4,
            CompressionCodec::Zstd,
        ] {
            let mut encoder = EncodingWriter::new(codec, Vec::new()).unwrap();
            let mut hashed = Sha256Writer::new(&mut encoder);
            hashed.write_all(payload).unwrap();
            let (digest, _, _) = hashed.finish().unwrap();
            encoder.finish().unwrap();
            digests.push(digest);
        }
        assert!(digests.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn tampered_byte_changes_digest() {
        let payload = b"id,name\n1,a\n2,b\n".to_vec();
        let (clean, _) = hash_reader(payload.as_slice()).unwrap();
        let mut tampered = payload;
        tampered[5] ^= 0x01;
        let (dirty, _) = hash_reader(tampered.as_slice()).unwrap();
        assert_ne!(clean, dirty);
    }
}

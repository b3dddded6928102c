//! Length-prefixed deflate block codec
//!
//! A writer/reader pair moving data as independent compressed blocks, so
//! that `flush` on the writing side actually compresses and transmits
//! everything buffered so far and the reading side never has to block on a
//! half-delivered compression frame. Each block on the wire is:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  2 bytes: magic 0x1F 0x8F                    │
//! ├──────────────────────────────────────────────┤
//! │  4 bytes: u32 big-endian compressed length   │
//! ├──────────────────────────────────────────────┤
//! │  4 bytes: u32 big-endian uncompressed length │
//! ├──────────────────────────────────────────────┤
//! │  N bytes: deflate data                       │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Not thread-safe; wrap in the revivable streams for concurrent use.

use std::io::{self, Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::config::codec::{COMPRESS_OVERHEAD, DEFAULT_MAX_BUFFER_SIZE, MAGIC_NUMBER};

/// Writer that compresses data into blocks. A block is generated and
/// transmitted once `block_size` bytes have been written, or on `flush`.
pub struct CompressedBlockWriter<W: Write> {
    out: Option<W>,
    in_buf: Vec<u8>,
    block_size: usize,
    level: Compression,
}

impl<W: Write> CompressedBlockWriter<W> {
    /// Write to `out`, emitting a block every `block_size` bytes, at the
    /// default compression level.
    pub fn new(out: W, block_size: usize) -> Self {
        Self::with_compression(out, block_size, Compression::default())
    }

    /// Write to `out` with an explicit compression level.
    ///
    /// # Panics
    ///
    /// Panics if `block_size` is 0.
    pub fn with_compression(out: W, block_size: usize, level: Compression) -> Self {
        assert!(block_size > 0, "block size must be > 0");
        Self {
            out: Some(out),
            in_buf: Vec::with_capacity(block_size),
            block_size,
            level,
        }
    }

    /// Compress the buffered bytes into one block and send it, flushing the
    /// underlying writer. Does nothing when the buffer is empty.
    fn compress_and_send(&mut self) -> io::Result<()> {
        if self.in_buf.is_empty() {
            return Ok(());
        }

        let mut encoder = DeflateEncoder::new(
            Vec::with_capacity(self.in_buf.len() + COMPRESS_OVERHEAD),
            self.level,
        );
        encoder.write_all(&self.in_buf)?;
        let compressed = encoder.finish()?;

        let out = self.out.as_mut().expect("writer used after finish");
        out.write_all(&MAGIC_NUMBER)?;
        out.write_all(&(compressed.len() as u32).to_be_bytes())?;
        out.write_all(&(self.in_buf.len() as u32).to_be_bytes())?;
        out.write_all(&compressed)?;
        out.flush()?;

        self.in_buf.clear();
        Ok(())
    }

    /// Send any buffered bytes as a final block and return the underlying
    /// writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.compress_and_send()?;
        Ok(self.out.take().expect("writer used after finish"))
    }
}

impl<W: Write> Write for CompressedBlockWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut remaining = buf;
        while self.in_buf.len() + remaining.len() > self.block_size {
            let to_copy = self.block_size - self.in_buf.len();
            self.in_buf.extend_from_slice(&remaining[..to_copy]);
            self.compress_and_send()?;
            remaining = &remaining[to_copy..];
        }
        self.in_buf.extend_from_slice(remaining);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.compress_and_send()?;
        self.out.as_mut().expect("writer used after finish").flush()
    }
}

impl<W: Write> Drop for CompressedBlockWriter<W> {
    fn drop(&mut self) {
        if self.out.is_some() {
            let _ = self.compress_and_send();
        }
    }
}

/// Reader decompressing blocks produced by [`CompressedBlockWriter`].
///
/// After any read failure the stream stays failed: every subsequent call
/// raises an error naming the original failure.
pub struct CompressedBlockReader<R: Read> {
    input: R,
    out_buf: Vec<u8>,
    out_offs: usize,
    /// Cap on both block buffers, against maliciously crafted headers
    max_buffer_size: usize,
    eof_reached: bool,
    failed: Option<(io::ErrorKind, String)>,
}

impl<R: Read> CompressedBlockReader<R> {
    /// Read blocks from `input` with the default 1 MiB buffer cap.
    pub fn new(input: R) -> Self {
        Self::with_max_buffer_size(input, DEFAULT_MAX_BUFFER_SIZE)
    }

    /// Read blocks from `input`, rejecting any block whose header asks for
    /// more than `max_buffer_size` bytes on either side. Keep this in sync
    /// with the block size configured on the writer.
    pub fn with_max_buffer_size(input: R, max_buffer_size: usize) -> Self {
        Self {
            input,
            out_buf: Vec::new(),
            out_offs: 0,
            max_buffer_size,
            eof_reached: false,
            failed: None,
        }
    }

    /// Lower bound on the bytes readable without touching the underlying
    /// reader.
    pub fn ready_bytes(&self) -> usize {
        self.out_buf.len() - self.out_offs
    }

    fn check_not_failed(&self) -> io::Result<()> {
        if let Some((kind, message)) = &self.failed {
            return Err(io::Error::new(
                *kind,
                format!("stream unavailable, reading already failed: {message}"),
            ));
        }
        Ok(())
    }

    /// Read and decompress the next block. Returns false on a clean end of
    /// stream (including a stream truncated mid-block, mirroring how EOF
    /// anywhere inside a block terminates reading). Failures become sticky.
    fn read_and_decompress(&mut self) -> io::Result<bool> {
        if self.eof_reached {
            return Ok(false);
        }
        match self.read_block() {
            Ok(Some(())) => Ok(true),
            Ok(None) => {
                self.eof_reached = true;
                Ok(false)
            }
            Err(error) => {
                self.failed = Some((error.kind(), error.to_string()));
                Err(error)
            }
        }
    }

    fn read_block(&mut self) -> io::Result<Option<()>> {
        let mut magic = [0u8; 2];
        // EOF at the block boundary, or anywhere inside the header or
        // body, ends the stream.
        match read_exact_or_eof(&mut self.input, &mut magic)? {
            Some(()) => {}
            None => return Ok(None),
        }
        if magic != MAGIC_NUMBER {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "wrong magic number: incoming data is not a compressed block stream",
            ));
        }

        let mut len_buf = [0u8; 4];
        if read_exact_or_eof(&mut self.input, &mut len_buf)?.is_none() {
            return Ok(None);
        }
        let in_length = u32::from_be_bytes(len_buf) as usize;

        if read_exact_or_eof(&mut self.input, &mut len_buf)?.is_none() {
            return Ok(None);
        }
        let out_length = u32::from_be_bytes(len_buf) as usize;

        if in_length > self.max_buffer_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "compressed block size exceeds maximum buffer size: {}/{}",
                    in_length, self.max_buffer_size
                ),
            ));
        }
        if out_length > self.max_buffer_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "decompressed block size exceeds maximum buffer size: {}/{}",
                    out_length, self.max_buffer_size
                ),
            ));
        }

        let mut in_buf = vec![0u8; in_length];
        if read_exact_or_eof(&mut self.input, &mut in_buf)?.is_none() {
            return Ok(None);
        }

        let mut out = Vec::with_capacity(out_length);
        DeflateDecoder::new(&in_buf[..])
            .take(out_length as u64)
            .read_to_end(&mut out)
            .map_err(|e| {
                io::Error::new(io::ErrorKind::InvalidData, format!("data format error: {e}"))
            })?;

        self.out_buf = out;
        self.out_offs = 0;
        Ok(Some(()))
    }
}

/// `read_exact` that reports a clean EOF as `None` instead of an error.
fn read_exact_or_eof<R: Read>(input: &mut R, buf: &mut [u8]) -> io::Result<Option<()>> {
    match input.read_exact(buf) {
        Ok(()) => Ok(Some(())),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

impl<R: Read> Read for CompressedBlockReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_not_failed()?;
        if buf.is_empty() {
            return Ok(0);
        }

        let mut count = 0;
        while count < buf.len() {
            if self.out_offs >= self.out_buf.len() {
                // Having produced something, return it rather than block on
                // the next block's arrival.
                if count > 0 {
                    return Ok(count);
                }
                if !self.read_and_decompress()? {
                    return Ok(0);
                }
            }

            let to_copy = (self.out_buf.len() - self.out_offs).min(buf.len() - count);
            buf[count..count + to_copy]
                .copy_from_slice(&self.out_buf[self.out_offs..self.out_offs + to_copy]);
            self.out_offs += to_copy;
            count += to_copy;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn compress(data: &[u8], block_size: usize) -> Vec<u8> {
        let mut writer = CompressedBlockWriter::new(Vec::new(), block_size);
        writer.write_all(data).unwrap();
        writer.finish().unwrap()
    }

    fn decompress_all(wire: Vec<u8>) -> Vec<u8> {
        let mut reader = CompressedBlockReader::new(Cursor::new(wire));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        out
    }

    // --- round trips ---

    #[test]
    fn single_block_round_trip() {
        let data = b"compress me, block codec".to_vec();
        assert_eq!(decompress_all(compress(&data, 1024)), data);
    }

    #[test]
    fn multi_block_round_trip() {
        let data: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();
        // Small blocks force many block boundaries.
        assert_eq!(decompress_all(compress(&data, 64)), data);
    }

    #[test]
    fn empty_input_is_clean_eof() {
        let wire = compress(&[], 128);
        assert!(wire.is_empty(), "no data must produce no blocks");
        assert_eq!(decompress_all(wire), Vec::<u8>::new());
    }

    #[test]
    fn flush_emits_a_partial_block() {
        let mut writer = CompressedBlockWriter::new(Vec::new(), 1024);
        writer.write_all(b"early").unwrap();
        writer.flush().unwrap();
        let after_flush = writer.out.as_ref().map(Vec::len).unwrap_or(0);
        assert!(after_flush > 0, "flush must transmit the buffered bytes");

        writer.write_all(b" late").unwrap();
        let wire = writer.finish().unwrap();
        assert_eq!(decompress_all(wire), b"early late".to_vec());
    }

    #[test]
    fn reads_smaller_than_a_block_work() {
        let data = b"0123456789".to_vec();
        let wire = compress(&data, 1024);
        let mut reader = CompressedBlockReader::new(Cursor::new(wire));

        let mut out = Vec::new();
        let mut buf = [0u8; 3];
        loop {
            let n = reader.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, data);
    }

    // --- wire format ---

    #[test]
    fn block_starts_with_magic_and_lengths() {
        let wire = compress(b"abc", 16);
        assert_eq!(&wire[..2], &MAGIC_NUMBER);
        let compressed_len = u32::from_be_bytes(wire[2..6].try_into().unwrap()) as usize;
        let uncompressed_len = u32::from_be_bytes(wire[6..10].try_into().unwrap()) as usize;
        assert_eq!(uncompressed_len, 3);
        assert_eq!(wire.len(), 10 + compressed_len);
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut reader = CompressedBlockReader::new(Cursor::new(vec![0x1F, 0x8B, 0, 0]));
        let err = reader.read(&mut [0u8; 4]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("wrong magic number"));
    }

    #[test]
    fn oversized_header_is_rejected() {
        let mut wire = MAGIC_NUMBER.to_vec();
        wire.extend_from_slice(&u32::MAX.to_be_bytes()); // absurd compressed length
        wire.extend_from_slice(&4u32.to_be_bytes());

        let mut reader = CompressedBlockReader::with_max_buffer_size(Cursor::new(wire), 1024);
        let err = reader.read(&mut [0u8; 4]).unwrap_err();
        assert!(err.to_string().contains("maximum buffer size"));
    }

    #[test]
    fn truncated_block_reads_as_eof() {
        let mut wire = compress(b"payload", 64);
        wire.truncate(wire.len() - 3);

        let mut reader = CompressedBlockReader::new(Cursor::new(wire));
        let mut out = Vec::new();
        assert_eq!(reader.read_to_end(&mut out).unwrap(), 0);
    }

    // --- sticky failure ---

    #[test]
    fn failure_is_sticky() {
        let mut reader = CompressedBlockReader::new(Cursor::new(vec![0xAA, 0xBB, 0, 0]));
        let first = reader.read(&mut [0u8; 4]).unwrap_err();
        assert!(first.to_string().contains("wrong magic number"));

        let second = reader.read(&mut [0u8; 4]).unwrap_err();
        assert!(second.to_string().contains("reading already failed"));
        assert!(second.to_string().contains("wrong magic number"));
    }

    #[test]
    fn ready_bytes_lower_bound() {
        let wire = compress(b"abcdef", 64);
        let mut reader = CompressedBlockReader::new(Cursor::new(wire));
        assert_eq!(reader.ready_bytes(), 0);

        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(reader.ready_bytes(), 4);
    }
}

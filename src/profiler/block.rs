//! Buffered file I/O for trace streams.
//!
//! Everything after the 15-byte prelude passes through a fixed-size logical
//! buffer. In uncompressed mode a flush writes the buffer through verbatim;
//! in deflate mode each flush becomes one framed packet:
//!
//! ```text
//! packet: compressed_len(u16, big-endian) + deflate block
//! ```
//!
//! The prelude is written and read with the `raw` methods, bypassing the
//! buffer entirely, so readers can sniff magic and version without knowing
//! the compression mode.

use std::fs::File;
use std::io::{Error, ErrorKind, Read, Result, Write};
use std::path::Path;

pub const BLOCK_SIZE: usize = 4096;

/// Body compression mode. Selected out of band: the reader must be opened
/// with the same mode the writer used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    #[cfg(feature = "compress")]
    Deflate,
}

pub struct BlockWriter {
    file: Option<File>,
    buf: Vec<u8>,
    physical: u64,
    compression: Compression,
}

impl BlockWriter {
    pub fn create(path: &Path, compression: Compression) -> Result<Self> {
        let file = File::create(path)?;
        Ok(BlockWriter {
            file: Some(file),
            buf: Vec::with_capacity(BLOCK_SIZE),
            physical: 0,
            compression,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.file.is_some()
    }

    /// Logical stream position: physical bytes on disk plus pending buffer.
    /// Under compression this counts post-compression bytes, which is what
    /// segment-size rotation cares about.
    pub fn position(&self) -> u64 {
        self.physical + self.buf.len() as u64
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "write to a closed trace stream"))
    }

    /// Write bytes straight through, bypassing buffering and compression.
    /// Only valid for the file prelude, before any buffered write.
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        debug_assert!(self.buf.is_empty());
        let len = bytes.len() as u64;
        self.file_mut()?.write_all(bytes)?;
        self.physical += len;
        Ok(())
    }

    pub fn write_u8(&mut self, byte: u8) -> Result<()> {
        if self.buf.len() + 1 > BLOCK_SIZE {
            self.flush_block()?;
        }
        self.buf.push(byte);
        Ok(())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if self.buf.len() + bytes.len() > BLOCK_SIZE {
            self.flush_block()?;
        }
        if bytes.len() > BLOCK_SIZE {
            match self.compression {
                // No framing to respect, write straight through
                Compression::None => {
                    let len = bytes.len() as u64;
                    self.file_mut()?.write_all(bytes)?;
                    self.physical += len;
                }
                // Keep packets decodable into a block-sized buffer
                #[cfg(feature = "compress")]
                Compression::Deflate => {
                    for chunk in bytes.chunks(BLOCK_SIZE) {
                        self.buf.extend_from_slice(chunk);
                        self.flush_block()?;
                    }
                }
            }
            return Ok(());
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        match self.compression {
            Compression::None => {
                let len = self.buf.len() as u64;
                let file = self
                    .file
                    .as_mut()
                    .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "write to a closed trace stream"))?;
                file.write_all(&self.buf)?;
                self.physical += len;
            }
            #[cfg(feature = "compress")]
            Compression::Deflate => {
                use flate2::write::DeflateEncoder;

                let mut encoder =
                    DeflateEncoder::new(Vec::with_capacity(self.buf.len()), flate2::Compression::default());
                encoder.write_all(&self.buf)?;
                let packet = encoder.finish()?;
                if packet.len() > u16::MAX as usize {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        "compressed packet exceeds 16-bit length frame",
                    ));
                }
                let file = self
                    .file
                    .as_mut()
                    .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "write to a closed trace stream"))?;
                file.write_all(&(packet.len() as u16).to_be_bytes())?;
                file.write_all(&packet)?;
                self.physical += 2 + packet.len() as u64;
            }
        }
        self.buf.clear();
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.flush_block()?;
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }

    /// Close the underlying file, flushing first.
    pub fn close(&mut self) -> Result<()> {
        self.flush()?;
        self.file = None;
        Ok(())
    }

    /// Drop the file descriptor without flushing pending bytes. Used by a
    /// forked child to discard its copy of the parent's open handle.
    pub fn shut(&mut self) {
        self.buf.clear();
        self.file = None;
    }
}

impl Write for BlockWriter {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.write_bytes(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<()> {
        BlockWriter::flush(self)
    }
}

#[derive(Debug)]
pub struct BlockReader {
    file: File,
    buf: Vec<u8>,
    pos: usize,
    compression: Compression,
}

impl BlockReader {
    pub fn open(path: &Path, compression: Compression) -> Result<Self> {
        let file = File::open(path)?;
        Ok(BlockReader {
            file,
            buf: Vec::with_capacity(BLOCK_SIZE),
            pos: 0,
            compression,
        })
    }

    /// Read prelude bytes directly from the file, before any buffered read.
    pub fn read_raw_exact(&mut self, out: &mut [u8]) -> Result<()> {
        debug_assert!(self.buf.is_empty());
        self.file.read_exact(out)
    }

    /// Read the next buffered byte, or `None` at a clean end of stream.
    pub fn read_u8_opt(&mut self) -> Result<Option<u8>> {
        if self.pos == self.buf.len() && self.fill()? == 0 {
            return Ok(None);
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(Some(b))
    }

    pub fn skip(&mut self, mut n: usize) -> Result<()> {
        while n > 0 {
            let avail = self.buf.len() - self.pos;
            if avail == 0 {
                if self.fill()? == 0 {
                    return Err(Error::new(
                        ErrorKind::UnexpectedEof,
                        "end of stream while skipping record payload",
                    ));
                }
                continue;
            }
            let step = avail.min(n);
            self.pos += step;
            n -= step;
        }
        Ok(())
    }

    /// Refill the logical buffer. Returns 0 at end of stream.
    fn fill(&mut self) -> Result<usize> {
        self.pos = 0;
        self.buf.clear();
        match self.compression {
            Compression::None => {
                self.buf.resize(BLOCK_SIZE, 0);
                let n = self.file.read(&mut self.buf)?;
                self.buf.truncate(n);
                Ok(n)
            }
            #[cfg(feature = "compress")]
            Compression::Deflate => {
                use flate2::read::DeflateDecoder;

                let mut len_bytes = [0u8; 2];
                let got = read_full(&mut self.file, &mut len_bytes)?;
                if got == 0 {
                    return Ok(0);
                }
                if got < 2 {
                    return Err(Error::new(
                        ErrorKind::UnexpectedEof,
                        "truncated compressed packet length",
                    ));
                }
                let packet_len = u16::from_be_bytes(len_bytes) as usize;
                let mut packet = vec![0u8; packet_len];
                self.file.read_exact(&mut packet)?;
                DeflateDecoder::new(&packet[..]).read_to_end(&mut self.buf)?;
                Ok(self.buf.len())
            }
        }
    }
}

impl Read for BlockReader {
    fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.pos == self.buf.len() && self.fill()? == 0 {
            return Ok(0);
        }
        let avail = &self.buf[self.pos..];
        let n = avail.len().min(out.len());
        out[..n].copy_from_slice(&avail[..n]);
        self.pos += n;
        Ok(n)
    }
}

/// Like `read_exact` but reports how many bytes arrived before EOF instead
/// of failing.
#[cfg(feature = "compress")]
fn read_full(r: &mut impl Read, out: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < out.len() {
        let n = r.read(&mut out[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

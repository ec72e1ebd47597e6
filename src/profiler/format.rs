//! Binary trace wire format (v1).
//!
//! ## File layout
//! ```text
//! Prelude (never buffered or compressed):
//!   MAGIC (14 bytes) + VERSION (u8) = 15 bytes
//!
//! Header records (no size prefix, terminated by HEADER_SEPARATOR):
//!   201: RuntimeVersion   → tag(u8) + major(varint) + minor(varint) + patch(varint)
//!   202: TickDuration     → tag(u8) + interval_us(varint)
//!   203: StackDepth       → tag(u8) + depth(varint)
//!   204: LibraryVersion   → tag(u8) + major(varint) + minor(varint) + patch(varint)
//!   205: Genealogy        → tag(u8) + ordinal(varint) + parent_ordinal(varint) + id(24) + parent_id(24)
//!   200: CustomMeta       → tag(u8) + size(varint) + key(string) + value(string)
//!   254: HeaderSeparator  → tag(u8)
//!
//! Body records (tag + payload size + payload; unknown tags are skipped by size):
//!     1: SampleStart      → weight(varint) + op_name(string)
//!     2: SampleEnd        → (empty)
//!     3: SubFrame         → package(string) + name(string) + file(string) + line(varint) + first_line(varint)
//!     4: EvalFrame        → file(string) + line(varint)
//!     5: XSubFrame        → package(string) + name(string)
//!     6: MainFrame        → file(string) + line(varint)
//!     7: EvalString       → file(string) + text(string)
//!   198: SectionStart     → name(string)
//!   199: SectionEnd       → name(string)
//!   200: CustomMeta       → key(string) + value(string)
//!   252: FileEnd          → (empty; segment boundary, more files may follow)
//!   253: StreamEnd        → (empty; monitoring stopped for good)
//! ```
//!
//! Primitives: varint is big-endian base-128 (7-bit groups, MSB set on every
//! byte except the last), covering `[0, 2^32)`. A string is one flag byte
//! (bit 0 set when the bytes are UTF-8) + varint length + raw bytes; the
//! primitive layer round-trips arbitrary byte strings.
//!
//! Identity words are written little-endian so files are portable across
//! hosts.

use std::io::{Error, ErrorKind, Read, Result, Write};

use serde::Serialize;

pub const MAGIC: &[u8; 14] = b"=tickprofiler=";
pub const FORMAT_VERSION: u8 = 1;
pub const PRELUDE_SIZE: usize = 15; // 14 magic + 1 version

/// Words in a context identity.
pub const ID_WORDS: usize = 6;

// Record tags
pub const TAG_SAMPLE_START: u8 = 1;
pub const TAG_SAMPLE_END: u8 = 2;
pub const TAG_SUB_FRAME: u8 = 3;
pub const TAG_EVAL_FRAME: u8 = 4;
pub const TAG_XSUB_FRAME: u8 = 5;
pub const TAG_MAIN_FRAME: u8 = 6;
pub const TAG_EVAL_STRING: u8 = 7;
pub const TAG_SECTION_START: u8 = 198;
pub const TAG_SECTION_END: u8 = 199;
pub const TAG_CUSTOM_META: u8 = 200;
pub const TAG_RUNTIME_VERSION: u8 = 201;
pub const TAG_TICK_DURATION: u8 = 202;
pub const TAG_STACK_DEPTH: u8 = 203;
pub const TAG_LIBRARY_VERSION: u8 = 204;
pub const TAG_GENEALOGY: u8 = 205;
pub const TAG_FILE_END: u8 = 252;
pub const TAG_STREAM_END: u8 = 253;
pub const TAG_HEADER_SEPARATOR: u8 = 254;
/// Reserved for records larger than a varint size field.
pub const TAG_CONTINUATION: u8 = 255;

/// How a trace terminates: at a segment boundary, with further files to
/// follow, or for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TraceEnd {
    /// `FILE_END`: this segment is complete; the stream continues in the
    /// next ordinal (or did so until the process went away).
    Segment,
    /// `STREAM_END`: monitoring stopped; no further segments exist.
    Stream,
}

impl TraceEnd {
    pub(crate) fn tag(self) -> u8 {
        match self {
            TraceEnd::Segment => TAG_FILE_END,
            TraceEnd::Stream => TAG_STREAM_END,
        }
    }
}

/// Encoded size of a varint in bytes.
pub fn varint_size(value: u32) -> usize {
    match value {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        0x4000..=0x1f_ffff => 3,
        0x20_0000..=0xfff_ffff => 4,
        _ => 5,
    }
}

/// Encoded size of a string with `len` payload bytes (flag + length + bytes).
pub fn string_size(len: usize) -> usize {
    1 + varint_size(len as u32) + len
}

pub fn write_varint(w: &mut impl Write, value: u32) -> Result<()> {
    let mut buf = [0u8; 5];
    let mut pos = buf.len();
    let mut v = value;
    loop {
        pos -= 1;
        buf[pos] = (v & 0x7f) as u8 | 0x80;
        v >>= 7;
        if v == 0 {
            break;
        }
    }
    buf[4] &= 0x7f;
    w.write_all(&buf[pos..])
}

pub fn read_varint(r: &mut impl Read) -> Result<u32> {
    let mut res: u32 = 0;
    for _ in 0..5 {
        let b = read_u8(r)?;
        res = (res << 7) | (b & 0x7f) as u32;
        if b & 0x80 == 0 {
            return Ok(res);
        }
    }
    Err(Error::new(ErrorKind::InvalidData, "varint longer than 5 bytes"))
}

pub fn write_string(w: &mut impl Write, bytes: &[u8], utf8: bool) -> Result<()> {
    w.write_all(&[utf8 as u8])?;
    write_varint(w, bytes.len() as u32)?;
    w.write_all(bytes)
}

/// Read a string as raw bytes plus its UTF-8 flag.
pub fn read_string(r: &mut impl Read) -> Result<(Vec<u8>, bool)> {
    let flags = read_u8(r)?;
    let len = read_varint(r)? as usize;
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes)?;
    Ok((bytes, flags & 1 != 0))
}

/// Read a string, requiring valid UTF-8.
pub fn read_string_utf8(r: &mut impl Read) -> Result<String> {
    let (bytes, _) = read_string(r)?;
    String::from_utf8(bytes)
        .map_err(|_| Error::new(ErrorKind::InvalidData, "invalid UTF-8 in string record"))
}

pub fn read_u8(r: &mut impl Read) -> Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

pub fn write_id_words(w: &mut impl Write, words: &[u32; ID_WORDS]) -> Result<()> {
    for word in words {
        w.write_all(&word.to_le_bytes())?;
    }
    Ok(())
}

pub fn read_id_words(r: &mut impl Read) -> Result<[u32; ID_WORDS]> {
    let mut raw = [0u8; ID_WORDS * 4];
    r.read_exact(&mut raw)?;
    let mut words = [0u32; ID_WORDS];
    for (i, chunk) in raw.chunks_exact(4).enumerate() {
        words[i] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Ok(words)
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(512))]

        #[test]
        fn varint_roundtrip_is_identity(value in any::<u32>()) {
            let mut buf = Vec::new();
            write_varint(&mut buf, value).unwrap();
            prop_assert_eq!(buf.len(), varint_size(value));
            let back = read_varint(&mut Cursor::new(buf)).unwrap();
            prop_assert_eq!(back, value);
        }

        #[test]
        fn string_roundtrip_is_identity(bytes in proptest::collection::vec(any::<u8>(), 0..2048), utf8 in any::<bool>()) {
            let mut buf = Vec::new();
            write_string(&mut buf, &bytes, utf8).unwrap();
            prop_assert_eq!(buf.len(), string_size(bytes.len()));
            let (back, flag) = read_string(&mut Cursor::new(buf)).unwrap();
            prop_assert_eq!(back, bytes);
            prop_assert_eq!(flag, utf8);
        }
    }
}

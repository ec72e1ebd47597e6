//! Trace stream reader.
//!
//! The header is parsed eagerly on open and must be intact: a bad magic,
//! an unsupported version, or a file that ends inside the header is a hard
//! error. The body is read one record at a time and is forgiving in the
//! ways a live profile needs: an unknown tag is skipped by its declared
//! size, and a file cut off mid-record (the writer process died) is a soft
//! segment end rather than corruption.

use std::collections::HashMap;
use std::io::{Error, ErrorKind, Read, Result};
use std::path::Path;

use serde::Serialize;

use crate::profiler::block::{BlockReader, Compression};
use crate::profiler::format::{
    read_id_words, read_string_utf8, read_varint, TraceEnd, FORMAT_VERSION, MAGIC,
    TAG_CUSTOM_META, TAG_EVAL_FRAME, TAG_EVAL_STRING, TAG_FILE_END, TAG_GENEALOGY,
    TAG_HEADER_SEPARATOR, TAG_LIBRARY_VERSION, TAG_MAIN_FRAME, TAG_RUNTIME_VERSION,
    TAG_SAMPLE_END, TAG_SAMPLE_START, TAG_SECTION_END, TAG_SECTION_START, TAG_STACK_DEPTH,
    TAG_STREAM_END, TAG_SUB_FRAME, TAG_TICK_DURATION, TAG_XSUB_FRAME,
};
use crate::profiler::identity::{ContextId, Genealogy, VersionTriple};
use crate::profiler::sample::{Frame, Sample};

/// Parsed trace file header.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TraceHeader {
    pub format_version: u8,
    pub runtime_version: VersionTriple,
    pub library_version: VersionTriple,
    pub tick_duration_us: u32,
    pub stack_depth: u32,
    pub genealogy: Genealogy,
    /// Header metadata in file order; duplicates are kept.
    pub meta: Vec<(String, String)>,
}

/// One item from the body of a trace stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TraceItem {
    Sample(Sample),
    End(TraceEnd),
}

#[derive(Debug)]
pub struct TraceFileReader {
    input: BlockReader,
    header: TraceHeader,
    /// Live depth per section name, as of the last record read.
    active_sections: HashMap<String, u32>,
    /// Metadata accumulated so far, last write wins.
    custom_meta: HashMap<String, String>,
    /// Eval source text by pseudo-file name.
    source_code: HashMap<String, String>,
    finished: Option<TraceEnd>,
}

impl TraceFileReader {
    /// Open `path` and parse the header. The compression mode is not
    /// recorded in the file and must match what the writer used.
    pub fn open(path: &Path, compression: Compression) -> Result<TraceFileReader> {
        let mut input = BlockReader::open(path, compression)?;

        let mut magic = [0u8; 14];
        input.read_raw_exact(&mut magic)?;
        if magic != *MAGIC {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "not a trace file (bad magic)",
            ));
        }
        let mut version = [0u8; 1];
        input.read_raw_exact(&mut version)?;
        let format_version = version[0];
        if format_version == 0 || format_version > FORMAT_VERSION {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("unsupported trace format version {format_version}"),
            ));
        }

        let mut reader = TraceFileReader {
            input,
            header: TraceHeader {
                format_version,
                ..TraceHeader::default()
            },
            active_sections: HashMap::new(),
            custom_meta: HashMap::new(),
            source_code: HashMap::new(),
            finished: None,
        };
        reader.read_header()?;
        Ok(reader)
    }

    pub fn header(&self) -> &TraceHeader {
        &self.header
    }

    pub fn format_version(&self) -> u8 {
        self.header.format_version
    }

    /// Sections open as of the last record read.
    pub fn active_sections(&self) -> &HashMap<String, u32> {
        &self.active_sections
    }

    /// All metadata seen so far, header entries included, last write wins.
    pub fn custom_meta(&self) -> &HashMap<String, String> {
        &self.custom_meta
    }

    /// Eval source text collected so far.
    pub fn source_code(&self) -> &HashMap<String, String> {
        &self.source_code
    }

    /// Read forward to the next sample or the end of the stream. Once an
    /// end has been returned, every further call repeats it.
    pub fn read_trace(&mut self) -> Result<TraceItem> {
        if let Some(end) = self.finished {
            return Ok(TraceItem::End(end));
        }
        let mut current: Option<Sample> = None;
        loop {
            let Some(tag) = self.next_tag()? else {
                return self.finish(TraceEnd::Segment);
            };
            match self.read_record(tag, &mut current) {
                Ok(Some(TraceItem::End(end))) => return self.finish(end),
                Ok(Some(item)) => return Ok(item),
                Ok(None) => {}
                Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                    // Record cut off mid-write; everything before it stands.
                    return self.finish(TraceEnd::Segment);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Drain the stream, returning every sample and how it ended.
    pub fn read_all_samples(&mut self) -> Result<(Vec<Sample>, TraceEnd)> {
        let mut samples = Vec::new();
        loop {
            match self.read_trace()? {
                TraceItem::Sample(sample) => samples.push(sample),
                TraceItem::End(end) => return Ok((samples, end)),
            }
        }
    }

    fn read_header(&mut self) -> Result<()> {
        loop {
            let tag = match self.input.read_u8_opt()? {
                Some(tag) => tag,
                None => {
                    return Err(Error::new(
                        ErrorKind::UnexpectedEof,
                        "file ends inside trace header",
                    ));
                }
            };
            match tag {
                TAG_HEADER_SEPARATOR => return Ok(()),
                TAG_RUNTIME_VERSION => {
                    self.header.runtime_version = read_version(&mut self.input)?;
                }
                TAG_LIBRARY_VERSION => {
                    self.header.library_version = read_version(&mut self.input)?;
                }
                TAG_TICK_DURATION => {
                    self.header.tick_duration_us = read_varint(&mut self.input)?;
                }
                TAG_STACK_DEPTH => {
                    self.header.stack_depth = read_varint(&mut self.input)?;
                }
                TAG_GENEALOGY => {
                    let ordinal = read_varint(&mut self.input)?;
                    let parent_ordinal = read_varint(&mut self.input)?;
                    let id = ContextId(read_id_words(&mut self.input)?);
                    let parent_id = ContextId(read_id_words(&mut self.input)?);
                    self.header.genealogy = Genealogy {
                        id,
                        parent_id,
                        ordinal,
                        parent_ordinal,
                    };
                }
                TAG_CUSTOM_META => {
                    let _size = read_varint(&mut self.input)?;
                    let key = read_string_utf8(&mut self.input)?;
                    let value = read_string_utf8(&mut self.input)?;
                    self.custom_meta.insert(key.clone(), value.clone());
                    self.header.meta.push((key, value));
                }
                other => {
                    // Header records have no size prefix, so an unknown tag
                    // cannot be skipped.
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        format!("invalid trace header record tag {other}"),
                    ));
                }
            }
        }
    }

    /// Parse one body record. Returns an item to surface, or `None` for
    /// records that only update reader state.
    fn read_record(&mut self, tag: u8, current: &mut Option<Sample>) -> Result<Option<TraceItem>> {
        let size = read_varint(&mut self.input)? as usize;
        match tag {
            TAG_SAMPLE_START => {
                if current.is_some() {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        "sample start inside an open sample",
                    ));
                }
                let weight = read_varint(&mut self.input)?;
                let op_name = read_string_utf8(&mut self.input)?;
                *current = Some(Sample {
                    weight,
                    op_name,
                    frames: Vec::new(),
                });
                Ok(None)
            }
            TAG_SAMPLE_END => match current.take() {
                Some(sample) => {
                    self.input.skip(size)?;
                    Ok(Some(TraceItem::Sample(sample)))
                }
                None => Err(Error::new(
                    ErrorKind::InvalidData,
                    "sample end without a sample start",
                )),
            },
            TAG_SUB_FRAME => {
                let package = read_string_utf8(&mut self.input)?;
                let name = read_string_utf8(&mut self.input)?;
                let file = read_string_utf8(&mut self.input)?;
                let line = read_varint(&mut self.input)?;
                let first_line = read_varint(&mut self.input)?;
                push_frame(
                    current,
                    Frame::Sub {
                        package,
                        name,
                        file,
                        line,
                        first_line,
                    },
                )?;
                Ok(None)
            }
            TAG_XSUB_FRAME => {
                let package = read_string_utf8(&mut self.input)?;
                let name = read_string_utf8(&mut self.input)?;
                push_frame(current, Frame::XSub { package, name })?;
                Ok(None)
            }
            TAG_EVAL_FRAME => {
                let file = read_string_utf8(&mut self.input)?;
                let line = read_varint(&mut self.input)?;
                push_frame(current, Frame::Eval { file, line })?;
                Ok(None)
            }
            TAG_MAIN_FRAME => {
                let file = read_string_utf8(&mut self.input)?;
                let line = read_varint(&mut self.input)?;
                push_frame(current, Frame::Main { file, line })?;
                Ok(None)
            }
            TAG_SECTION_START => {
                let name = read_string_utf8(&mut self.input)?;
                *self.active_sections.entry(name).or_insert(0) += 1;
                Ok(None)
            }
            TAG_SECTION_END => {
                let name = read_string_utf8(&mut self.input)?;
                match self.active_sections.get_mut(&name) {
                    Some(depth) if *depth > 1 => *depth -= 1,
                    Some(_) => {
                        self.active_sections.remove(&name);
                    }
                    None => {
                        return Err(Error::new(
                            ErrorKind::InvalidData,
                            format!("section end without matching start: {name}"),
                        ));
                    }
                }
                Ok(None)
            }
            TAG_CUSTOM_META => {
                let key = read_string_utf8(&mut self.input)?;
                let value = read_string_utf8(&mut self.input)?;
                self.custom_meta.insert(key, value);
                Ok(None)
            }
            TAG_EVAL_STRING => {
                let file = read_string_utf8(&mut self.input)?;
                let text = read_string_utf8(&mut self.input)?;
                self.source_code.insert(file, text);
                Ok(None)
            }
            TAG_FILE_END => {
                self.input.skip(size)?;
                Ok(Some(TraceItem::End(TraceEnd::Segment)))
            }
            TAG_STREAM_END => {
                self.input.skip(size)?;
                Ok(Some(TraceItem::End(TraceEnd::Stream)))
            }
            unknown => {
                tracing::warn!(tag = unknown, size, "skipping unknown trace record");
                self.input.skip(size)?;
                Ok(None)
            }
        }
    }

    /// Next body tag, or `None` at a clean end of input. Truncation while
    /// refilling the block buffer also counts as an end here.
    fn next_tag(&mut self) -> Result<Option<u8>> {
        match self.input.read_u8_opt() {
            Ok(tag) => Ok(tag),
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn finish(&mut self, end: TraceEnd) -> Result<TraceItem> {
        self.finished = Some(end);
        Ok(TraceItem::End(end))
    }
}

fn read_version(r: &mut impl Read) -> Result<VersionTriple> {
    Ok(VersionTriple {
        major: read_varint(r)?,
        minor: read_varint(r)?,
        patch: read_varint(r)?,
    })
}

fn push_frame(current: &mut Option<Sample>, frame: Frame) -> Result<()> {
    match current {
        Some(sample) => {
            sample.frames.push(frame);
            Ok(())
        }
        None => Err(Error::new(
            ErrorKind::InvalidData,
            "stray frame record outside a sample",
        )),
    }
}

//! Trace stream writer.
//!
//! One writer owns one output stream of segments. Bytes go to a staging
//! file (`<name>_`) that is renamed into place on close, so a crash never
//! leaves a half-written file where a complete one is expected. Template
//! outputs rotate into a fresh segment when they outgrow the configured
//! size; every rotated segment re-emits the header, any metadata written so
//! far, and still-open sections, so each file stands alone.

use std::collections::HashMap;
use std::fs;
use std::io::{Error, ErrorKind, Result};
use std::path::{Path, PathBuf};

use crate::profiler::block::{BlockWriter, Compression};
use crate::profiler::config::OutputSpec;
use crate::profiler::format::{
    string_size, varint_size, write_id_words, write_string, write_varint, TraceEnd,
    FORMAT_VERSION, MAGIC, TAG_CUSTOM_META, TAG_EVAL_FRAME, TAG_EVAL_STRING, TAG_GENEALOGY,
    TAG_HEADER_SEPARATOR, TAG_LIBRARY_VERSION, TAG_MAIN_FRAME, TAG_RUNTIME_VERSION,
    TAG_SAMPLE_END, TAG_SAMPLE_START, TAG_SECTION_END, TAG_SECTION_START, TAG_STACK_DEPTH,
    TAG_SUB_FRAME, TAG_TICK_DURATION, TAG_XSUB_FRAME,
};
use crate::profiler::identity::{Genealogy, VersionTriple};
use crate::profiler::sample::FrameRef;

/// Header contents, re-emitted at the head of every rotated segment.
#[derive(Debug, Clone)]
pub struct HeaderData {
    pub runtime_version: VersionTriple,
    pub interval_us: u32,
    pub stack_depth: u32,
    pub meta: Vec<(String, String)>,
}

pub struct TraceFileWriter {
    out: BlockWriter,
    output: OutputSpec,
    compression: Compression,
    final_path: PathBuf,
    staging_path: PathBuf,
    genealogy: Genealogy,
    header: Option<HeaderData>,
    in_sample: bool,
    /// Live depth per open section name.
    sections: HashMap<String, u32>,
    /// Metadata written after the header, last write wins. Folded into the
    /// header of rotated segments.
    inline_meta: HashMap<String, String>,
    /// Arms the next flush or close to emit a weight-0, frame-less sample,
    /// so section ends and late metadata are never stranded after the last
    /// real sample.
    force_empty_sample: bool,
}

impl TraceFileWriter {
    /// Open the staging file for a new stream. The header still has to be
    /// written before any record.
    pub fn open(
        output: &OutputSpec,
        compression: Compression,
        genealogy: Genealogy,
    ) -> Result<TraceFileWriter> {
        let (final_path, staging_path) = segment_paths(output, &genealogy);
        let out = BlockWriter::create(&staging_path, compression)?;
        Ok(TraceFileWriter {
            out,
            output: output.clone(),
            compression,
            final_path,
            staging_path,
            genealogy,
            header: None,
            in_sample: false,
            sections: HashMap::new(),
            inline_meta: HashMap::new(),
            force_empty_sample: false,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.out.is_valid()
    }

    /// Stream position in bytes, counting pending buffered data.
    pub fn position(&self) -> u64 {
        self.out.position()
    }

    pub fn ordinal(&self) -> u32 {
        self.genealogy.ordinal
    }

    pub fn genealogy(&self) -> &Genealogy {
        &self.genealogy
    }

    /// Path the current segment is renamed to on close.
    pub fn path(&self) -> &Path {
        &self.final_path
    }

    /// Write the file prelude and header records. Must be the first thing
    /// written to the stream.
    pub fn write_header(&mut self, header: &HeaderData) -> Result<()> {
        if self.header.is_some() {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "trace header already written",
            ));
        }
        self.emit_header(header)?;
        self.header = Some(header.clone());
        Ok(())
    }

    /// Open a sample record. Samples cannot nest.
    pub fn start_sample(&mut self, weight: u32, op_name: &str) -> Result<()> {
        self.ensure_open()?;
        if self.in_sample {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "sample start inside an open sample",
            ));
        }
        self.force_empty_sample = false;
        let size = varint_size(weight) + string_size(op_name.len());
        self.out.write_u8(TAG_SAMPLE_START)?;
        write_varint(&mut self.out, size as u32)?;
        write_varint(&mut self.out, weight)?;
        write_string(&mut self.out, op_name.as_bytes(), true)?;
        self.in_sample = true;
        Ok(())
    }

    pub fn end_sample(&mut self) -> Result<()> {
        if !self.in_sample {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "sample end without an open sample",
            ));
        }
        self.out.write_u8(TAG_SAMPLE_END)?;
        write_varint(&mut self.out, 0)?;
        self.in_sample = false;
        self.force_empty_sample = false;
        Ok(())
    }

    /// Append one frame to the open sample.
    pub fn add_frame(&mut self, frame: FrameRef<'_>) -> Result<()> {
        if !self.in_sample {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "frame record outside an open sample",
            ));
        }
        match frame {
            FrameRef::Sub {
                package,
                name,
                file,
                line,
                first_line,
            } => {
                let size = string_size(package.len())
                    + string_size(name.len())
                    + string_size(file.len())
                    + varint_size(line)
                    + varint_size(first_line);
                self.out.write_u8(TAG_SUB_FRAME)?;
                write_varint(&mut self.out, size as u32)?;
                write_string(&mut self.out, package.as_bytes(), true)?;
                write_string(&mut self.out, name.as_bytes(), true)?;
                write_string(&mut self.out, file.as_bytes(), true)?;
                write_varint(&mut self.out, line)?;
                write_varint(&mut self.out, first_line)?;
            }
            FrameRef::XSub { package, name } => {
                let size = string_size(package.len()) + string_size(name.len());
                self.out.write_u8(TAG_XSUB_FRAME)?;
                write_varint(&mut self.out, size as u32)?;
                write_string(&mut self.out, package.as_bytes(), true)?;
                write_string(&mut self.out, name.as_bytes(), true)?;
            }
            FrameRef::Eval { file, line } => {
                let size = string_size(file.len()) + varint_size(line);
                self.out.write_u8(TAG_EVAL_FRAME)?;
                write_varint(&mut self.out, size as u32)?;
                write_string(&mut self.out, file.as_bytes(), true)?;
                write_varint(&mut self.out, line)?;
            }
            FrameRef::Main { file, line } => {
                let size = string_size(file.len()) + varint_size(line);
                self.out.write_u8(TAG_MAIN_FRAME)?;
                write_varint(&mut self.out, size as u32)?;
                write_string(&mut self.out, file.as_bytes(), true)?;
                write_varint(&mut self.out, line)?;
            }
        }
        Ok(())
    }

    /// Open a named section. Sections of the same name nest by depth.
    pub fn start_section(&mut self, name: &str) -> Result<()> {
        self.ensure_open()?;
        if self.in_sample {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "section record inside an open sample",
            ));
        }
        self.force_empty_sample = false;
        self.write_section_record(TAG_SECTION_START, name)?;
        *self.sections.entry(name.to_owned()).or_insert(0) += 1;
        Ok(())
    }

    /// Close one nesting level of a named section and arm the deferred
    /// empty sample so the boundary reaches the stream even if no further
    /// sample fires.
    pub fn end_section(&mut self, name: &str) -> Result<()> {
        self.ensure_open()?;
        if self.in_sample {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "section record inside an open sample",
            ));
        }
        match self.sections.get_mut(name) {
            Some(depth) if *depth > 1 => *depth -= 1,
            Some(_) => {
                self.sections.remove(name);
            }
            None => {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    format!("section end without matching start: {name}"),
                ));
            }
        }
        self.write_section_record(TAG_SECTION_END, name)?;
        self.force_empty_sample = true;
        Ok(())
    }

    /// Write a key/value metadata record. Later writes for the same key win
    /// on the reader side.
    pub fn write_custom_meta(&mut self, key: &str, value: &str) -> Result<()> {
        self.ensure_open()?;
        if self.in_sample {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "metadata record inside an open sample",
            ));
        }
        self.write_meta_record(key, value)?;
        self.inline_meta.insert(key.to_owned(), value.to_owned());
        self.force_empty_sample = true;
        Ok(())
    }

    /// Save eval source text under its pseudo-file name.
    pub fn write_eval_source(&mut self, file: &str, text: &str) -> Result<()> {
        self.ensure_open()?;
        if self.in_sample {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "eval source record inside an open sample",
            ));
        }
        let size = string_size(file.len()) + string_size(text.len());
        self.out.write_u8(TAG_EVAL_STRING)?;
        write_varint(&mut self.out, size as u32)?;
        write_string(&mut self.out, file.as_bytes(), true)?;
        write_string(&mut self.out, text.as_bytes(), true)?;
        Ok(())
    }

    /// Flush buffered records to disk, first emitting the deferred empty
    /// sample if one is armed.
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.flush_deferred()?;
        self.out.flush()
    }

    /// Rotate into the next segment once the stream outgrows `max_size`.
    /// Fixed-path outputs never rotate. Returns whether a rotation happened.
    pub fn rotate_if_needed(&mut self, max_size: u64) -> Result<bool> {
        if !self.output.is_template || self.header.is_none() || self.position() <= max_size {
            return Ok(false);
        }
        self.reopen()?;
        Ok(true)
    }

    /// Close the current segment with a `FILE_END` marker and start the
    /// next ordinal under the same identity.
    pub fn reopen(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.close_current(TraceEnd::Segment)?;
        self.genealogy.ordinal += 1;
        let (final_path, staging_path) = segment_paths(&self.output, &self.genealogy);
        self.out = BlockWriter::create(&staging_path, self.compression)?;
        self.final_path = final_path;
        self.staging_path = staging_path;
        if let Some(header) = self.header.clone() {
            self.emit_header(&header)?;
        }
        // Reopen live sections so this segment reads standalone.
        let open: Vec<(String, u32)> = self
            .sections
            .iter()
            .map(|(name, depth)| (name.clone(), *depth))
            .collect();
        for (name, depth) in open {
            for _ in 0..depth {
                self.write_section_record(TAG_SECTION_START, &name)?;
            }
        }
        tracing::debug!(
            ordinal = self.genealogy.ordinal,
            path = %self.final_path.display(),
            "rotated trace segment"
        );
        Ok(())
    }

    /// Terminate the stream and rename the staging file into place. An open
    /// sample is completed first so the file stays well-formed. Closing an
    /// already-closed writer is a no-op.
    pub fn close(&mut self, end: TraceEnd) -> Result<()> {
        if !self.out.is_valid() {
            return Ok(());
        }
        self.close_current(end)
    }

    /// Drop the file descriptor without flushing or renaming. A forked
    /// child uses this to discard its copy of the parent's open handle.
    pub fn shut(&mut self) {
        self.out.shut();
        self.force_empty_sample = false;
        self.in_sample = false;
    }

    fn close_current(&mut self, end: TraceEnd) -> Result<()> {
        if self.in_sample {
            self.end_sample()?;
        }
        self.flush_deferred()?;
        if end == TraceEnd::Stream && !self.sections.is_empty() {
            let names: Vec<&str> = self.sections.keys().map(String::as_str).collect();
            tracing::warn!(sections = ?names, "closing trace with open sections");
        }
        self.out.write_u8(end.tag())?;
        write_varint(&mut self.out, 0)?;
        self.out.close()?;
        fs::rename(&self.staging_path, &self.final_path)?;
        Ok(())
    }

    fn flush_deferred(&mut self) -> Result<()> {
        if self.force_empty_sample && !self.in_sample {
            self.start_sample(0, "")?;
            self.end_sample()?;
        }
        Ok(())
    }

    fn emit_header(&mut self, header: &HeaderData) -> Result<()> {
        self.out.write_raw(MAGIC)?;
        self.out.write_raw(&[FORMAT_VERSION])?;

        self.out.write_u8(TAG_RUNTIME_VERSION)?;
        write_varint(&mut self.out, header.runtime_version.major)?;
        write_varint(&mut self.out, header.runtime_version.minor)?;
        write_varint(&mut self.out, header.runtime_version.patch)?;

        self.out.write_u8(TAG_TICK_DURATION)?;
        write_varint(&mut self.out, header.interval_us)?;

        self.out.write_u8(TAG_STACK_DEPTH)?;
        write_varint(&mut self.out, header.stack_depth)?;

        let library = VersionTriple::library();
        self.out.write_u8(TAG_LIBRARY_VERSION)?;
        write_varint(&mut self.out, library.major)?;
        write_varint(&mut self.out, library.minor)?;
        write_varint(&mut self.out, library.patch)?;

        self.out.write_u8(TAG_GENEALOGY)?;
        write_varint(&mut self.out, self.genealogy.ordinal)?;
        write_varint(&mut self.out, self.genealogy.parent_ordinal)?;
        let id_words = *self.genealogy.id.words();
        let parent_words = *self.genealogy.parent_id.words();
        write_id_words(&mut self.out, &id_words)?;
        write_id_words(&mut self.out, &parent_words)?;

        for (key, value) in &header.meta {
            self.write_meta_record(key, value)?;
        }
        // Metadata recorded since the first header rides along into rotated
        // segments; emitted last so it wins over stale global entries.
        let inline: Vec<(String, String)> = self
            .inline_meta
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, value) in inline {
            self.write_meta_record(&key, &value)?;
        }

        self.out.write_u8(TAG_HEADER_SEPARATOR)?;
        Ok(())
    }

    fn write_meta_record(&mut self, key: &str, value: &str) -> Result<()> {
        let size = string_size(key.len()) + string_size(value.len());
        self.out.write_u8(TAG_CUSTOM_META)?;
        write_varint(&mut self.out, size as u32)?;
        write_string(&mut self.out, key.as_bytes(), true)?;
        write_string(&mut self.out, value.as_bytes(), true)
    }

    fn write_section_record(&mut self, tag: u8, name: &str) -> Result<()> {
        let size = string_size(name.len());
        self.out.write_u8(tag)?;
        write_varint(&mut self.out, size as u32)?;
        write_string(&mut self.out, name.as_bytes(), true)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.out.is_valid() {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::InvalidInput,
                "write to a closed trace stream",
            ))
        }
    }
}

impl Drop for TraceFileWriter {
    fn drop(&mut self) {
        if self.out.is_valid() {
            let _ = self.close_current(TraceEnd::Stream);
        }
    }
}

fn segment_paths(output: &OutputSpec, genealogy: &Genealogy) -> (PathBuf, PathBuf) {
    let final_path = if output.is_template {
        let mut name = output.path.as_os_str().to_os_string();
        name.push(format!(
            ".{}.{:08x}",
            genealogy.id.file_stamp(),
            genealogy.ordinal
        ));
        PathBuf::from(name)
    } else {
        output.path.clone()
    };
    let mut staging = final_path.as_os_str().to_os_string();
    staging.push("_");
    (final_path, PathBuf::from(staging))
}

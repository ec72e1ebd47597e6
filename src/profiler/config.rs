//! Profiler configuration.

use std::path::{Path, PathBuf};

use crate::profiler::block::Compression;
use crate::profiler::clock::SamplingParams;
use crate::profiler::identity::VersionTriple;

/// Default sampling interval, in microseconds.
pub const DEFAULT_SAMPLING_INTERVAL_US: u32 = 10_000;
/// Default number of stack frames captured per sample.
pub const DEFAULT_STACK_DEPTH: u32 = 20;
/// Default segment size limit before a template output rotates.
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 10 * 1024 * 1024;

/// Where trace output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSpec {
    pub path: PathBuf,
    /// When set, the context identity and segment ordinal are appended to
    /// `path`, so rotated segments and concurrent processes never collide.
    /// Fixed paths never rotate.
    pub is_template: bool,
}

impl OutputSpec {
    pub fn template(path: impl Into<PathBuf>) -> OutputSpec {
        OutputSpec {
            path: path.into(),
            is_template: true,
        }
    }

    pub fn fixed(path: impl Into<PathBuf>) -> OutputSpec {
        OutputSpec {
            path: path.into(),
            is_template: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for OutputSpec {
    fn default() -> OutputSpec {
        OutputSpec::template("tickprof.out")
    }
}

/// Which eval source text gets saved into the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceMode {
    /// Save nothing.
    #[default]
    None,
    /// Save only evals that show up in captured stacks.
    TracedEvals,
    /// Save every eval handed to the profiler.
    AllEvals,
}

/// Construction-time settings for a monitoring context and its clock.
///
/// The sampling fields move into the shared clock via [`sampling_params`];
/// the rest describe the context's own output stream.
///
/// [`sampling_params`]: ProfilerConfig::sampling_params
#[derive(Debug, Clone)]
pub struct ProfilerConfig {
    pub sampling_interval_us: u32,
    pub stack_depth: u32,
    pub max_segment_size: u64,
    pub source_mode: SourceMode,
    pub output: OutputSpec,
    pub compression: Compression,
    /// Version of the monitored runtime, recorded in the trace header.
    pub runtime_version: VersionTriple,
    /// Key/value pairs written into every segment header.
    pub global_meta: Vec<(String, String)>,
}

impl Default for ProfilerConfig {
    fn default() -> ProfilerConfig {
        ProfilerConfig {
            sampling_interval_us: DEFAULT_SAMPLING_INTERVAL_US,
            stack_depth: DEFAULT_STACK_DEPTH,
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            source_mode: SourceMode::default(),
            output: OutputSpec::default(),
            compression: Compression::default(),
            runtime_version: VersionTriple::default(),
            global_meta: Vec::new(),
        }
    }
}

impl ProfilerConfig {
    pub fn with_output(mut self, output: OutputSpec) -> ProfilerConfig {
        self.output = output;
        self
    }

    pub fn with_sampling_interval_us(mut self, interval_us: u32) -> ProfilerConfig {
        self.sampling_interval_us = interval_us;
        self
    }

    pub fn with_stack_depth(mut self, depth: u32) -> ProfilerConfig {
        self.stack_depth = depth;
        self
    }

    pub fn with_max_segment_size(mut self, bytes: u64) -> ProfilerConfig {
        self.max_segment_size = bytes;
        self
    }

    pub fn with_source_mode(mut self, mode: SourceMode) -> ProfilerConfig {
        self.source_mode = mode;
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> ProfilerConfig {
        self.compression = compression;
        self
    }

    pub fn with_runtime_version(mut self, version: VersionTriple) -> ProfilerConfig {
        self.runtime_version = version;
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> ProfilerConfig {
        self.global_meta.push((key.into(), value.into()));
        self
    }

    /// The clock-side slice of this configuration.
    pub fn sampling_params(&self) -> SamplingParams {
        SamplingParams {
            interval_us: self.sampling_interval_us,
            stack_depth: self.stack_depth,
            max_segment_size: self.max_segment_size,
            source_mode: self.source_mode,
        }
    }
}

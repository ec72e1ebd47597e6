pub mod block;
pub mod clock;
pub mod config;
pub mod error;
pub mod format;
pub mod identity;
pub mod monitor;
pub mod reader;
pub mod sample;
pub mod writer;

pub use block::{BlockReader, BlockWriter, Compression};
pub use clock::{ClockState, ManualTime, RealTime, SamplingParams, TimeSource, clock_precision_ns};
pub use config::{
    DEFAULT_MAX_SEGMENT_SIZE, DEFAULT_SAMPLING_INTERVAL_US, DEFAULT_STACK_DEPTH, OutputSpec,
    ProfilerConfig, SourceMode,
};
pub use error::ProfileError;
pub use format::TraceEnd;
pub use identity::{ContextId, Genealogy, Lcg, NO_PARENT_ORDINAL, VersionTriple};
pub use monitor::{Context, MonitorScope, MonitorState, StateChange, SwitchDirective};
pub use reader::{TraceFileReader, TraceHeader, TraceItem};
pub use sample::{
    CallSite, CalleeToken, CodePos, Frame, FrameRef, FrameSink, Sample, StackCaptureProvider,
    StepInfo,
};
pub use writer::{HeaderData, TraceFileWriter};

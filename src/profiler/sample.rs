//! Samples, stack frames, and the host-side capture interface.

use std::io;

use serde::Serialize;
use smallvec::SmallVec;

use crate::profiler::writer::TraceFileWriter;

/// Host-defined code position. The monitor only ever compares positions for
/// equality, so any stable encoding (pointer value, bytecode offset) works.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodePos(pub u64);

/// Opaque handle naming the callee of a call instruction, resolved back by
/// [`StackCaptureProvider::resolve_native_call`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CalleeToken(pub u64);

/// Call information saved from a call instruction, fueling the native-call
/// heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    /// Position execution lands on when the callee runs to completion
    /// without ever entering the inspectable dispatch loop.
    pub continuation: CodePos,
    /// Handle to whatever the call is about to invoke.
    pub callee: CalleeToken,
}

/// Per-step report from the monitored execution path.
///
/// `position` and `op_name` describe the instruction about to execute;
/// `call` is set when that instruction is a call.
#[derive(Debug, Clone, Copy)]
pub struct StepInfo<'a> {
    pub position: CodePos,
    pub op_name: &'a str,
    pub call: Option<CallSite>,
}

impl<'a> StepInfo<'a> {
    pub fn new(position: CodePos, op_name: &'a str) -> StepInfo<'a> {
        StepInfo {
            position,
            op_name,
            call: None,
        }
    }

    pub fn with_call(mut self, call: CallSite) -> StepInfo<'a> {
        self.call = Some(call);
        self
    }
}

/// A single captured stack frame, leaf first within its sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    /// An ordinary sub call.
    Sub {
        package: String,
        name: String,
        file: String,
        line: u32,
        /// First line of the sub's definition.
        first_line: u32,
    },
    /// A native call the stack walker cannot see into, synthesized by the
    /// monitor's call-site heuristic. Carries no file or line.
    XSub { package: String, name: String },
    /// A string-eval pseudo-file.
    Eval { file: String, line: u32 },
    /// Top-level code.
    Main { file: String, line: u32 },
}

impl Frame {
    pub fn file(&self) -> Option<&str> {
        match self {
            Frame::Sub { file, .. } | Frame::Eval { file, .. } | Frame::Main { file, .. } => {
                Some(file)
            }
            Frame::XSub { .. } => None,
        }
    }

    pub fn line(&self) -> Option<u32> {
        match self {
            Frame::Sub { line, .. } | Frame::Eval { line, .. } | Frame::Main { line, .. } => {
                Some(*line)
            }
            Frame::XSub { .. } => None,
        }
    }

    /// `package::name` for frames that name a sub.
    pub fn fq_name(&self) -> Option<String> {
        match self {
            Frame::Sub { package, name, .. } | Frame::XSub { package, name } => {
                Some(format!("{package}::{name}"))
            }
            Frame::Eval { .. } | Frame::Main { .. } => None,
        }
    }

    pub fn as_ref(&self) -> FrameRef<'_> {
        match self {
            Frame::Sub {
                package,
                name,
                file,
                line,
                first_line,
            } => FrameRef::Sub {
                package,
                name,
                file,
                line: *line,
                first_line: *first_line,
            },
            Frame::XSub { package, name } => FrameRef::XSub { package, name },
            Frame::Eval { file, line } => FrameRef::Eval {
                file,
                line: *line,
            },
            Frame::Main { file, line } => FrameRef::Main {
                file,
                line: *line,
            },
        }
    }
}

/// Borrowed form of [`Frame`], used on the capture path so providers can
/// stream frames without allocating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRef<'a> {
    Sub {
        package: &'a str,
        name: &'a str,
        file: &'a str,
        line: u32,
        first_line: u32,
    },
    XSub {
        package: &'a str,
        name: &'a str,
    },
    Eval {
        file: &'a str,
        line: u32,
    },
    Main {
        file: &'a str,
        line: u32,
    },
}

impl FrameRef<'_> {
    pub fn to_owned(&self) -> Frame {
        match *self {
            FrameRef::Sub {
                package,
                name,
                file,
                line,
                first_line,
            } => Frame::Sub {
                package: package.to_owned(),
                name: name.to_owned(),
                file: file.to_owned(),
                line,
                first_line,
            },
            FrameRef::XSub { package, name } => Frame::XSub {
                package: package.to_owned(),
                name: name.to_owned(),
            },
            FrameRef::Eval { file, line } => Frame::Eval {
                file: file.to_owned(),
                line,
            },
            FrameRef::Main { file, line } => Frame::Main {
                file: file.to_owned(),
                line,
            },
        }
    }
}

/// One captured stack snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sample {
    /// Clock ticks elapsed since the previous sample.
    pub weight: u32,
    /// Name of the instruction active when the tick was observed.
    pub op_name: String,
    /// Captured frames, leaf first. Empty for the synthetic samples the
    /// writer injects around section boundaries.
    pub frames: Vec<Frame>,
}

/// Sink handed to the capture provider. Each accepted frame is encoded
/// straight into the open sample record, bounded by the configured depth.
pub struct FrameSink<'a> {
    writer: &'a mut TraceFileWriter,
    remaining: u32,
    track_evals: bool,
    eval_files: SmallVec<[String; 2]>,
}

impl<'a> FrameSink<'a> {
    pub(crate) fn new(writer: &'a mut TraceFileWriter, depth: u32, track_evals: bool) -> FrameSink<'a> {
        FrameSink {
            writer,
            remaining: depth,
            track_evals,
            eval_files: SmallVec::new(),
        }
    }

    /// Append one frame. Returns `Ok(false)` once the depth budget is
    /// exhausted; providers should stop walking at that point.
    pub fn push(&mut self, frame: FrameRef<'_>) -> io::Result<bool> {
        if self.remaining == 0 {
            return Ok(false);
        }
        if self.track_evals {
            if let FrameRef::Eval { file, .. } = frame {
                if !self.eval_files.iter().any(|seen| seen == file) {
                    self.eval_files.push(file.to_owned());
                }
            }
        }
        self.writer.add_frame(frame)?;
        self.remaining -= 1;
        Ok(true)
    }

    /// Frames still accepted before the depth bound cuts the walk off.
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub(crate) fn into_eval_files(self) -> SmallVec<[String; 2]> {
        self.eval_files
    }
}

/// Host-side stack walker.
///
/// `collect` runs once per detected counter change, always on the monitored
/// execution path, never on the clock thread. Implementations push frames
/// leaf first and may stop early when the sink reports its budget spent.
pub trait StackCaptureProvider {
    fn collect(&mut self, max_depth: u32, sink: &mut FrameSink<'_>) -> io::Result<()>;

    /// Resolve a saved callee token to `(package, name)` when it names a
    /// native sub invisible to the stack walk. `None` suppresses the
    /// synthesized frame.
    fn resolve_native_call(&mut self, token: CalleeToken) -> Option<(String, String)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub_frame() -> Frame {
        Frame::Sub {
            package: "Net::Fetch".into(),
            name: "get".into(),
            file: "lib/Net/Fetch.pm".into(),
            line: 42,
            first_line: 30,
        }
    }

    #[test]
    fn test_frame_accessors_cover_each_variant() {
        let sub = sub_frame();
        assert_eq!(sub.file(), Some("lib/Net/Fetch.pm"));
        assert_eq!(sub.line(), Some(42));
        assert_eq!(sub.fq_name().as_deref(), Some("Net::Fetch::get"));

        let xsub = Frame::XSub {
            package: "POSIX".into(),
            name: "floor".into(),
        };
        assert_eq!(xsub.file(), None);
        assert_eq!(xsub.line(), None);
        assert_eq!(xsub.fq_name().as_deref(), Some("POSIX::floor"));

        let main = Frame::Main {
            file: "app.pl".into(),
            line: 3,
        };
        assert_eq!(main.fq_name(), None);
        assert_eq!(main.file(), Some("app.pl"));
    }

    #[test]
    fn test_frame_ref_round_trips_through_to_owned() {
        let frames = vec![
            sub_frame(),
            Frame::XSub {
                package: "List::Util".into(),
                name: "sum".into(),
            },
            Frame::Eval {
                file: "(eval 7)".into(),
                line: 1,
            },
            Frame::Main {
                file: "app.pl".into(),
                line: 10,
            },
        ];
        for frame in frames {
            assert_eq!(frame.as_ref().to_owned(), frame);
        }
    }

    #[test]
    fn test_step_info_builder_attaches_call_sites() {
        let step = StepInfo::new(CodePos(0x10), "entersub").with_call(CallSite {
            continuation: CodePos(0x18),
            callee: CalleeToken(7),
        });
        assert_eq!(step.position, CodePos(0x10));
        assert_eq!(
            step.call,
            Some(CallSite {
                continuation: CodePos(0x18),
                callee: CalleeToken(7),
            })
        );
    }
}

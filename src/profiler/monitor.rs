//! Per-context execution monitor.
//!
//! A [`Context`] belongs to one runtime thread. It polls the shared clock
//! counter from the instrumented dispatch path and, whenever the counter has
//! moved since the last poll, captures a stack sample whose weight is the
//! number of ticks elapsed. Samples stream into a [`TraceFileWriter`] that
//! is opened lazily on first use and rotated when a segment outgrows the
//! configured size.
//!
//! Monitoring is bracketed per run loop with [`Context::monitor`]; only the
//! outermost scope takes a reference on the clock, so nested loops are
//! cheap. Forking is handled by the three-call protocol
//! [`Context::on_fork_begin`] / [`Context::on_fork_parent`] /
//! [`Context::on_fork_child`].

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::Arc;

use crate::profiler::block::Compression;
use crate::profiler::clock::ClockState;
use crate::profiler::config::{OutputSpec, ProfilerConfig, SourceMode};
use crate::profiler::error::ProfileError;
use crate::profiler::format::TraceEnd;
use crate::profiler::identity::{
    current_pid, current_tid, ContextId, Genealogy, Lcg, VersionTriple, NO_PARENT_ORDINAL,
};
use crate::profiler::sample::{CallSite, FrameRef, FrameSink, StackCaptureProvider, StepInfo};
use crate::profiler::writer::{HeaderData, TraceFileWriter};

/// Externally visible monitoring state of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// No monitored run loop is active.
    Disabled,
    /// Inside a monitored run loop, sampling.
    Enabled,
    /// Inside a monitored run loop, but sampling is switched off.
    Suspended,
}

/// What the host run loop has to do after a state change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchDirective {
    /// Nothing; the change either had no effect or takes effect at the
    /// next loop entry.
    Unchanged,
    /// The host manages its own dispatch and can swap the loop body where
    /// it stands.
    SwapInPlace,
    /// Enter a nested, monitored run loop for the remainder of the current
    /// one.
    EnterNested,
    /// Unwind the current monitored run loop.
    ExitMonitored,
}

/// External control requests, typically carried by a host-level signal or
/// command channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    Disable,
    Enable,
    /// Close the current segment and continue into a fresh one.
    Restart,
    /// Disable sampling and end the trace stream for good.
    Stop,
}

/// Monitoring state for one runtime thread.
pub struct Context {
    clock: Arc<ClockState>,
    output: OutputSpec,
    compression: Compression,
    runtime_version: VersionTriple,
    global_meta: Vec<(String, String)>,
    /// Sampling wanted. Distinct from being inside a run loop: a context
    /// can sit suspended inside one.
    enabled: bool,
    /// True while at least one monitored run loop is on the stack.
    outer_runloop: bool,
    loop_depth: u32,
    /// The host can replace its dispatch loop in place instead of nesting
    /// or unwinding.
    managed_loop: bool,
    id: ContextId,
    parent_id: ContextId,
    /// Segments opened so far; the live writer's ordinal when one is open.
    ordinal: u32,
    parent_ordinal: u32,
    rng: Lcg,
    pid: u32,
    tid: u32,
    trace: Option<TraceFileWriter>,
    /// Counter value consumed by the previous poll.
    last_counter: u32,
    /// Call information from the previous step, fueling the native-call
    /// return heuristic.
    pending_call: Option<CallSite>,
    /// Eval source withheld until a sample references it.
    pending_evals: HashMap<String, String>,
}

impl Context {
    /// Build the monitoring context for the current thread.
    pub fn new(clock: Arc<ClockState>, config: &ProfilerConfig) -> Context {
        let mut rng = Lcg::seeded();
        let pid = current_pid();
        let tid = current_tid();
        let id = ContextId::generate(pid, tid, &mut rng);
        Context {
            clock,
            output: config.output.clone(),
            compression: config.compression,
            runtime_version: config.runtime_version,
            global_meta: config.global_meta.clone(),
            enabled: true,
            outer_runloop: false,
            loop_depth: 0,
            managed_loop: false,
            id,
            parent_id: ContextId::ZERO,
            ordinal: 0,
            parent_ordinal: NO_PARENT_ORDINAL,
            rng,
            pid,
            tid,
            trace: None,
            last_counter: 0,
            pending_call: None,
            pending_evals: HashMap::new(),
        }
    }

    /// Derive a context for a newly spawned runtime thread. The new context
    /// shares the clock and settings, gets a fresh identity, and records
    /// this context (at its current segment) as its parent.
    pub fn new_thread_context(&self) -> Context {
        let mut rng = self.rng.clone();
        let tid = current_tid();
        let id = ContextId::generate(self.pid, tid, &mut rng);
        Context {
            clock: Arc::clone(&self.clock),
            output: self.output.clone(),
            compression: self.compression,
            runtime_version: self.runtime_version,
            global_meta: self.global_meta.clone(),
            enabled: self.enabled,
            outer_runloop: false,
            loop_depth: 0,
            managed_loop: false,
            id,
            parent_id: self.id,
            ordinal: 0,
            parent_ordinal: self.ordinal(),
            rng,
            pid: self.pid,
            tid,
            trace: None,
            last_counter: 0,
            pending_call: None,
            pending_evals: HashMap::new(),
        }
    }

    pub fn clock(&self) -> &Arc<ClockState> {
        &self.clock
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Current segment ordinal; zero before the first segment is opened.
    pub fn ordinal(&self) -> u32 {
        match &self.trace {
            Some(trace) => trace.ordinal(),
            None => self.ordinal,
        }
    }

    pub fn genealogy(&self) -> Genealogy {
        Genealogy {
            id: self.id,
            parent_id: self.parent_id,
            ordinal: self.ordinal(),
            parent_ordinal: self.parent_ordinal,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// True while inside a monitored run loop.
    pub fn is_running(&self) -> bool {
        self.outer_runloop
    }

    pub fn state(&self) -> MonitorState {
        if !self.outer_runloop {
            MonitorState::Disabled
        } else if self.enabled {
            MonitorState::Enabled
        } else {
            MonitorState::Suspended
        }
    }

    /// Declare whether the host can swap its dispatch loop in place. This
    /// only affects the directives [`request_state`](Context::request_state)
    /// hands back.
    pub fn set_managed_loop(&mut self, managed: bool) {
        self.managed_loop = managed;
    }

    /// Path of the segment currently being written, if any.
    pub fn trace_path(&self) -> Option<&Path> {
        self.trace.as_ref().map(|trace| trace.path())
    }

    /// Redirect future segments. Refused once a trace stream is open.
    pub fn set_output(&mut self, output: OutputSpec) {
        if self.trace.is_some() || self.outer_runloop {
            tracing::warn!("ignoring output change while a trace stream is open");
            return;
        }
        self.output = output;
    }

    /// Enter the outermost monitored run loop, taking a clock reference.
    pub fn enter_monitoring(&mut self) -> Result<(), ProfileError> {
        if self.outer_runloop {
            return Err(ProfileError::ExcessEnter);
        }
        self.clock.start()?;
        self.outer_runloop = true;
        self.loop_depth = 1;
        self.last_counter = self.clock.counter();
        self.pending_call = None;
        Ok(())
    }

    /// Leave the outermost monitored run loop, releasing the clock and
    /// flushing buffered samples.
    pub fn leave_monitoring(&mut self) -> Result<(), ProfileError> {
        if !self.outer_runloop {
            return Err(ProfileError::ExcessLeave);
        }
        self.clock.stop();
        self.outer_runloop = false;
        self.loop_depth = 0;
        self.pending_call = None;
        if let Some(trace) = &mut self.trace {
            trace.flush()?;
        }
        Ok(())
    }

    /// Bracket one run loop. The outermost scope enters monitoring; nested
    /// scopes only deepen the loop count.
    pub fn monitor(&mut self) -> Result<MonitorScope<'_>, ProfileError> {
        if self.loop_depth == 0 {
            self.enter_monitoring()?;
        } else {
            self.loop_depth += 1;
        }
        Ok(MonitorScope {
            cxt: self,
            done: false,
        })
    }

    fn leave_scope(&mut self) -> Result<(), ProfileError> {
        if self.loop_depth > 1 {
            self.loop_depth -= 1;
            Ok(())
        } else {
            self.leave_monitoring()
        }
    }

    /// Ask for sampling to be switched on or off, and learn what the
    /// current run loop has to do about it.
    pub fn request_state(&mut self, enable: bool) -> SwitchDirective {
        if enable == self.enabled {
            return SwitchDirective::Unchanged;
        }
        if self.loop_depth > 2 {
            tracing::warn!(
                depth = self.loop_depth,
                "refusing a profiling state change under nested run loops"
            );
            return SwitchDirective::Unchanged;
        }
        self.enabled = enable;
        if self.loop_depth == 0 {
            // Takes effect when the next run loop enters monitoring.
            return SwitchDirective::Unchanged;
        }
        if self.managed_loop {
            SwitchDirective::SwapInPlace
        } else if enable {
            SwitchDirective::EnterNested
        } else {
            SwitchDirective::ExitMonitored
        }
    }

    /// Apply an externally requested state change.
    pub fn set_profiler_state(
        &mut self,
        change: StateChange,
    ) -> Result<SwitchDirective, ProfileError> {
        match change {
            StateChange::Disable => Ok(self.request_state(false)),
            StateChange::Enable => Ok(self.request_state(true)),
            StateChange::Restart => {
                if let Some(trace) = &mut self.trace {
                    trace.reopen()?;
                    self.ordinal = trace.ordinal();
                }
                Ok(SwitchDirective::Unchanged)
            }
            StateChange::Stop => {
                let directive = self.request_state(false);
                self.close_trace(TraceEnd::Stream)?;
                Ok(directive)
            }
        }
    }

    /// Poll the clock and capture a sample if at least one tick has passed
    /// since the previous poll. Returns whether a sample was written.
    ///
    /// `step` describes the instruction the runtime is about to execute;
    /// `provider` walks the runtime stack when a sample is due.
    pub fn poll_and_capture(
        &mut self,
        step: &StepInfo<'_>,
        provider: &mut dyn StackCaptureProvider,
    ) -> Result<bool, ProfileError> {
        let counter = self.clock.counter();
        if counter == self.last_counter {
            self.pending_call = step.call;
            return Ok(false);
        }
        if !(self.outer_runloop && self.enabled) {
            // Keep tracking the counter so suspended stretches are never
            // billed to the next sample.
            self.last_counter = counter;
            self.pending_call = step.call;
            return Ok(false);
        }
        let weight = counter.wrapping_sub(self.last_counter);
        self.last_counter = counter;

        // A call in the previous step whose continuation we are already
        // back at means the callee ran to completion without entering the
        // dispatch loop: a native call, invisible to the stack walk.
        let xsub = self
            .pending_call
            .take()
            .filter(|call| call.continuation == step.position)
            .and_then(|call| provider.resolve_native_call(call.callee));

        let params = self.clock.params();
        let track_evals = params.source_mode == SourceMode::TracedEvals;

        self.ensure_trace()?;
        let trace = self.trace.as_mut().expect("trace writer just opened");
        if trace.rotate_if_needed(params.max_segment_size)? {
            self.ordinal = trace.ordinal();
        }

        trace.start_sample(weight, step.op_name)?;
        if let Some((package, name)) = &xsub {
            trace.add_frame(FrameRef::XSub {
                package: package.as_str(),
                name: name.as_str(),
            })?;
        }
        let mut sink = FrameSink::new(trace, params.stack_depth, track_evals);
        provider.collect(params.stack_depth, &mut sink)?;
        let eval_files = sink.into_eval_files();
        trace.end_sample()?;
        for file in eval_files {
            if let Some(text) = self.pending_evals.remove(&file) {
                trace.write_eval_source(&file, &text)?;
            }
        }

        self.pending_call = step.call;
        Ok(true)
    }

    /// Mark the start of a named section. Opens the trace stream if none
    /// is open yet.
    pub fn start_section(&mut self, name: &str) -> Result<(), ProfileError> {
        self.ensure_trace()?.start_section(name)?;
        Ok(())
    }

    pub fn end_section(&mut self, name: &str) -> Result<(), ProfileError> {
        self.ensure_trace()?.end_section(name)?;
        Ok(())
    }

    /// Record a key/value pair in the trace stream.
    pub fn write_custom_meta(&mut self, key: &str, value: &str) -> Result<(), ProfileError> {
        self.ensure_trace()?.write_custom_meta(key, value)?;
        Ok(())
    }

    /// Offer the source text of an eval. Depending on the configured
    /// source mode it is dropped, written immediately, or withheld until a
    /// sample references the eval.
    pub fn save_eval_source(&mut self, file: &str, text: &str) -> Result<(), ProfileError> {
        match self.clock.params().source_mode {
            SourceMode::None => Ok(()),
            SourceMode::AllEvals => {
                self.ensure_trace()?.write_eval_source(file, text)?;
                Ok(())
            }
            SourceMode::TracedEvals => {
                self.pending_evals.insert(file.to_string(), text.to_string());
                Ok(())
            }
        }
    }

    /// Push buffered trace data to the file.
    pub fn flush(&mut self) -> Result<(), ProfileError> {
        if let Some(trace) = &mut self.trace {
            trace.flush()?;
        }
        Ok(())
    }

    /// First fork stage, called in the parent before `fork`. Ends the
    /// current segment and freezes the clock so no thread holds its lock
    /// across the fork.
    pub fn on_fork_begin(&mut self) -> Result<(), ProfileError> {
        self.close_trace(TraceEnd::Segment)?;
        self.clock.fork_lock();
        Ok(())
    }

    /// Second fork stage in the parent: just release the clock. The parent
    /// reopens its trace lazily at the next sample.
    pub fn on_fork_parent(&mut self) {
        self.clock.fork_unlock();
    }

    /// Second fork stage in the child: restart the clock (the thread did
    /// not survive the fork) and adopt a child identity whose lineage
    /// points at the pre-fork context.
    pub fn on_fork_child(&mut self) -> Result<(), ProfileError> {
        if let Some(mut trace) = self.trace.take() {
            // Only reachable when on_fork_begin was skipped; the file is
            // shared with the parent and must not be touched.
            trace.shut();
        }
        self.clock.fork_reset(self.outer_runloop)?;
        self.pid_changed();
        Ok(())
    }

    fn pid_changed(&mut self) {
        let parent_id = self.id;
        let parent_ordinal = self.ordinal;
        self.pid = current_pid();
        self.tid = current_tid();
        self.id = ContextId::generate(self.pid, self.tid, &mut self.rng);
        self.parent_id = parent_id;
        self.parent_ordinal = parent_ordinal;
        self.ordinal = 0;
        self.last_counter = self.clock.counter();
        self.pending_call = None;
    }

    /// End the trace stream and release the context. Closing while a
    /// monitored run loop is still active cleans up as well as it can and
    /// reports the misuse.
    pub fn close(&mut self) -> Result<(), ProfileError> {
        if self.outer_runloop {
            self.clock.stop();
            self.outer_runloop = false;
            self.loop_depth = 0;
            if let Err(err) = self.close_trace(TraceEnd::Stream) {
                tracing::error!(error = %err, "trace close failed during forced teardown");
            }
            return Err(ProfileError::ActiveTeardown);
        }
        self.close_trace(TraceEnd::Stream)
    }

    fn close_trace(&mut self, end: TraceEnd) -> Result<(), ProfileError> {
        if let Some(mut trace) = self.trace.take() {
            self.ordinal = trace.ordinal();
            trace.close(end)?;
        }
        Ok(())
    }

    /// Open the trace stream if it is not open yet, and write its header.
    fn ensure_trace(&mut self) -> Result<&mut TraceFileWriter, ProfileError> {
        if self.trace.is_none() {
            self.ordinal += 1;
            let genealogy = Genealogy {
                id: self.id,
                parent_id: self.parent_id,
                ordinal: self.ordinal,
                parent_ordinal: self.parent_ordinal,
            };
            let mut trace = TraceFileWriter::open(&self.output, self.compression, genealogy)?;
            let params = self.clock.params();
            trace.write_header(&HeaderData {
                runtime_version: self.runtime_version,
                interval_us: params.interval_us,
                stack_depth: params.stack_depth,
                meta: self.global_meta.clone(),
            })?;
            self.trace = Some(trace);
        }
        Ok(self.trace.as_mut().expect("trace writer just opened"))
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if self.outer_runloop {
            tracing::error!("dropping the context of a running monitor");
            self.clock.stop();
            self.outer_runloop = false;
        }
    }
}

/// Scope guard for one monitored run loop, handed out by
/// [`Context::monitor`]. Dereferences to the context so the loop body can
/// poll and record through it.
pub struct MonitorScope<'a> {
    cxt: &'a mut Context,
    done: bool,
}

impl MonitorScope<'_> {
    /// Leave the run loop, surfacing any flush error. Preferred over
    /// dropping the scope, which can only log.
    pub fn finish(mut self) -> Result<(), ProfileError> {
        self.done = true;
        self.cxt.leave_scope()
    }
}

impl Deref for MonitorScope<'_> {
    type Target = Context;

    fn deref(&self) -> &Context {
        self.cxt
    }
}

impl DerefMut for MonitorScope<'_> {
    fn deref_mut(&mut self) -> &mut Context {
        self.cxt
    }
}

impl Drop for MonitorScope<'_> {
    fn drop(&mut self) {
        if !self.done {
            if let Err(err) = self.cxt.leave_scope() {
                tracing::error!(error = %err, "monitor scope teardown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiler::clock::ManualTime;
    use crate::profiler::reader::TraceFileReader;
    use crate::profiler::sample::{CalleeToken, CodePos, Frame, Sample};
    use std::io;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    struct TestProvider {
        frames: Vec<Frame>,
        native: HashMap<u64, (String, String)>,
    }

    impl TestProvider {
        fn new(frames: Vec<Frame>) -> TestProvider {
            TestProvider {
                frames,
                native: HashMap::new(),
            }
        }
    }

    impl StackCaptureProvider for TestProvider {
        fn collect(&mut self, _max_depth: u32, sink: &mut FrameSink<'_>) -> io::Result<()> {
            for frame in &self.frames {
                if !sink.push(frame.as_ref())? {
                    break;
                }
            }
            Ok(())
        }

        fn resolve_native_call(&mut self, token: CalleeToken) -> Option<(String, String)> {
            self.native.get(&token.0).cloned()
        }
    }

    fn test_config(dir: &TempDir) -> ProfilerConfig {
        ProfilerConfig::default()
            .with_output(OutputSpec::template(dir.path().join("trace.out")))
            .with_sampling_interval_us(1_000)
    }

    fn manual_context(config: &ProfilerConfig) -> (Context, Arc<ManualTime>) {
        let time = Arc::new(ManualTime::new());
        let clock = ClockState::with_time_source(config.sampling_params(), time.clone());
        (Context::new(clock, config), time)
    }

    fn main_frame(line: u32) -> Frame {
        Frame::Main {
            file: "app.pl".into(),
            line,
        }
    }

    fn step(position: u64, op_name: &'static str) -> StepInfo<'static> {
        StepInfo::new(CodePos(position), op_name)
    }

    /// Grant `sleeps` clock wakes, wait for them, then wait for the counter
    /// to settle. The first wake of a thread only covers its phase offset,
    /// so after n total wakes the counter reads n - 1.
    fn advance(cxt: &Context, time: &ManualTime, sleeps: u64) -> u32 {
        let target = time.sleeps_completed() + sleeps;
        time.grant(sleeps);
        assert!(
            time.wait_sleeps(target, Duration::from_secs(5)),
            "clock thread did not wake"
        );
        let mut last = cxt.clock().counter();
        for _ in 0..500 {
            thread::sleep(Duration::from_millis(1));
            let now = cxt.clock().counter();
            if now == last {
                return now;
            }
            last = now;
        }
        panic!("clock counter did not settle");
    }

    fn read_samples(path: &Path) -> Vec<Sample> {
        let mut reader = TraceFileReader::open(path, Compression::None).unwrap();
        let (samples, _) = reader.read_all_samples().unwrap();
        samples
    }

    #[test]
    fn test_no_sample_while_the_counter_is_still() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (mut cxt, _time) = manual_context(&config);
        let mut provider = TestProvider::new(vec![main_frame(1)]);

        cxt.enter_monitoring().unwrap();
        for i in 0..50 {
            let wrote = cxt
                .poll_and_capture(&step(i, "nextstate"), &mut provider)
                .unwrap();
            assert!(!wrote);
        }
        // No tick, no file.
        assert!(cxt.trace_path().is_none());
        assert_eq!(cxt.ordinal(), 0);
        cxt.leave_monitoring().unwrap();
        cxt.close().unwrap();
    }

    #[test]
    fn test_sample_weight_counts_elapsed_ticks() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (mut cxt, time) = manual_context(&config);
        let mut provider = TestProvider::new(vec![main_frame(3)]);

        cxt.enter_monitoring().unwrap();
        assert_eq!(advance(&cxt, &time, 2), 1);
        assert!(cxt
            .poll_and_capture(&step(1, "entersub"), &mut provider)
            .unwrap());
        assert_eq!(advance(&cxt, &time, 3), 4);
        assert!(cxt
            .poll_and_capture(&step(2, "leavesub"), &mut provider)
            .unwrap());
        cxt.leave_monitoring().unwrap();

        let path = cxt.trace_path().unwrap().to_path_buf();
        cxt.close().unwrap();

        let samples = read_samples(&path);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].weight, 1);
        assert_eq!(samples[0].op_name, "entersub");
        assert_eq!(samples[0].frames, vec![main_frame(3)]);
        assert_eq!(samples[1].weight, 3);
        assert_eq!(samples[1].op_name, "leavesub");
    }

    #[test]
    fn test_header_carries_context_genealogy() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir).with_runtime_version(VersionTriple::new(5, 40, 0));
        let (mut cxt, time) = manual_context(&config);
        let mut provider = TestProvider::new(vec![main_frame(1)]);

        cxt.enter_monitoring().unwrap();
        advance(&cxt, &time, 2);
        cxt.poll_and_capture(&step(1, "entersub"), &mut provider)
            .unwrap();
        cxt.leave_monitoring().unwrap();
        let path = cxt.trace_path().unwrap().to_path_buf();
        let expected = cxt.genealogy();
        cxt.close().unwrap();

        let reader = TraceFileReader::open(&path, Compression::None).unwrap();
        let header = reader.header();
        assert_eq!(header.runtime_version, VersionTriple::new(5, 40, 0));
        assert_eq!(header.tick_duration_us, 1_000);
        assert_eq!(header.genealogy, expected);
        assert_eq!(header.genealogy.ordinal, 1);
        assert_eq!(header.genealogy.parent_ordinal, NO_PARENT_ORDINAL);
    }

    #[test]
    fn test_monitor_scopes_nest_without_restarting_the_clock() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (mut cxt, _time) = manual_context(&config);

        let mut outer = cxt.monitor().unwrap();
        assert_eq!(outer.state(), MonitorState::Enabled);
        assert_eq!(outer.clock().threads_started(), 1);
        {
            let inner = outer.monitor().unwrap();
            assert_eq!(inner.clock().threads_started(), 1);
            inner.finish().unwrap();
        }
        assert!(outer.is_running());
        outer.finish().unwrap();
        assert!(!cxt.is_running());
        assert_eq!(cxt.state(), MonitorState::Disabled);
        cxt.close().unwrap();
    }

    #[test]
    fn test_unwinding_out_of_a_scope_releases_monitoring() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (mut cxt, _time) = manual_context(&config);

        // A host-level error unwinds through the monitored region; the
        // scope guard must still leave monitoring on the way out.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _scope = cxt.monitor().unwrap();
            panic!("interpreter died mid-dispatch");
        }));
        assert!(result.is_err());

        assert_eq!(cxt.state(), MonitorState::Disabled);
        assert!(!cxt.is_running());
        // The clock reference was released: enter/leave balance again.
        cxt.enter_monitoring().unwrap();
        cxt.leave_monitoring().unwrap();
        assert!(matches!(
            cxt.leave_monitoring(),
            Err(ProfileError::ExcessLeave)
        ));
        cxt.close().unwrap();
    }

    #[test]
    fn test_unbalanced_enter_and_leave_are_rejected() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (mut cxt, _time) = manual_context(&config);

        assert!(matches!(
            cxt.leave_monitoring(),
            Err(ProfileError::ExcessLeave)
        ));
        cxt.enter_monitoring().unwrap();
        assert!(matches!(
            cxt.enter_monitoring(),
            Err(ProfileError::ExcessEnter)
        ));
        cxt.leave_monitoring().unwrap();
        assert!(matches!(
            cxt.leave_monitoring(),
            Err(ProfileError::ExcessLeave)
        ));
        cxt.close().unwrap();
    }

    #[test]
    fn test_state_change_directives_follow_the_loop_shape() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (mut cxt, _time) = manual_context(&config);

        // Outside any loop the flag flips silently.
        assert_eq!(cxt.request_state(true), SwitchDirective::Unchanged);
        assert_eq!(cxt.request_state(false), SwitchDirective::Unchanged);
        assert!(!cxt.is_enabled());
        assert_eq!(cxt.request_state(true), SwitchDirective::Unchanged);

        let mut scope = cxt.monitor().unwrap();
        assert_eq!(scope.request_state(false), SwitchDirective::ExitMonitored);
        assert_eq!(scope.state(), MonitorState::Suspended);
        assert_eq!(scope.request_state(true), SwitchDirective::EnterNested);

        scope.set_managed_loop(true);
        assert_eq!(scope.request_state(false), SwitchDirective::SwapInPlace);
        assert_eq!(scope.request_state(true), SwitchDirective::SwapInPlace);
        scope.set_managed_loop(false);
        scope.finish().unwrap();
        cxt.close().unwrap();
    }

    #[test]
    fn test_state_changes_are_refused_under_deep_nesting() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (mut cxt, _time) = manual_context(&config);

        let mut a = cxt.monitor().unwrap();
        let mut b = a.monitor().unwrap();
        let mut c = b.monitor().unwrap();
        assert_eq!(c.request_state(false), SwitchDirective::Unchanged);
        assert!(c.is_enabled());
        c.finish().unwrap();
        // Two levels deep the change is allowed again.
        assert_eq!(b.request_state(false), SwitchDirective::ExitMonitored);
        assert!(!b.is_enabled());
        b.finish().unwrap();
        a.finish().unwrap();
        cxt.close().unwrap();
    }

    #[test]
    fn test_suspended_stretches_are_not_billed_to_the_next_sample() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (mut cxt, time) = manual_context(&config);
        let mut provider = TestProvider::new(vec![main_frame(1)]);

        cxt.enter_monitoring().unwrap();
        assert_eq!(advance(&cxt, &time, 2), 1);
        cxt.request_state(false);
        // Suspended: the poll tracks the counter but writes nothing.
        assert!(!cxt
            .poll_and_capture(&step(1, "nextstate"), &mut provider)
            .unwrap());
        assert_eq!(advance(&cxt, &time, 1), 2);
        assert!(!cxt
            .poll_and_capture(&step(2, "nextstate"), &mut provider)
            .unwrap());
        cxt.request_state(true);
        assert_eq!(advance(&cxt, &time, 3), 5);
        assert!(cxt
            .poll_and_capture(&step(3, "entersub"), &mut provider)
            .unwrap());
        cxt.leave_monitoring().unwrap();

        let path = cxt.trace_path().unwrap().to_path_buf();
        cxt.close().unwrap();
        let samples = read_samples(&path);
        assert_eq!(samples.len(), 1);
        // Only the three ticks after re-enabling count.
        assert_eq!(samples[0].weight, 3);
    }

    #[test]
    fn test_native_call_return_is_detected() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (mut cxt, time) = manual_context(&config);
        let mut provider = TestProvider::new(vec![main_frame(9)]);
        provider
            .native
            .insert(7, ("POSIX".to_string(), "floor".to_string()));

        cxt.enter_monitoring().unwrap();
        // The call step itself lands on the fast path and is remembered.
        let call_step = StepInfo::new(CodePos(10), "entersub").with_call(CallSite {
            continuation: CodePos(11),
            callee: CalleeToken(7),
        });
        assert!(!cxt.poll_and_capture(&call_step, &mut provider).unwrap());
        advance(&cxt, &time, 2);
        // Next step sits at the continuation: the callee was native.
        assert!(cxt
            .poll_and_capture(&step(11, "nextstate"), &mut provider)
            .unwrap());
        cxt.leave_monitoring().unwrap();

        let path = cxt.trace_path().unwrap().to_path_buf();
        cxt.close().unwrap();
        let samples = read_samples(&path);
        assert_eq!(samples.len(), 1);
        assert_eq!(
            samples[0].frames[0],
            Frame::XSub {
                package: "POSIX".into(),
                name: "floor".into(),
            }
        );
        assert_eq!(samples[0].frames[1], main_frame(9));
    }

    #[test]
    fn test_no_xsub_frame_when_execution_moved_elsewhere() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (mut cxt, time) = manual_context(&config);
        let mut provider = TestProvider::new(vec![main_frame(9)]);
        provider
            .native
            .insert(7, ("POSIX".to_string(), "floor".to_string()));

        cxt.enter_monitoring().unwrap();
        let call_step = StepInfo::new(CodePos(10), "entersub").with_call(CallSite {
            continuation: CodePos(11),
            callee: CalleeToken(7),
        });
        assert!(!cxt.poll_and_capture(&call_step, &mut provider).unwrap());
        advance(&cxt, &time, 2);
        // Not at the continuation: the callee entered the dispatch loop.
        assert!(cxt
            .poll_and_capture(&step(40, "nextstate"), &mut provider)
            .unwrap());
        cxt.leave_monitoring().unwrap();

        let path = cxt.trace_path().unwrap().to_path_buf();
        cxt.close().unwrap();
        let samples = read_samples(&path);
        assert_eq!(samples[0].frames, vec![main_frame(9)]);
    }

    #[test]
    fn test_segments_rotate_when_the_size_limit_is_hit() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir).with_max_segment_size(512);
        let (mut cxt, time) = manual_context(&config);
        let mut provider = TestProvider::new(vec![main_frame(1), main_frame(2)]);

        cxt.enter_monitoring().unwrap();
        for i in 0..60 {
            advance(&cxt, &time, 1);
            cxt.poll_and_capture(&step(i, "entersub"), &mut provider)
                .unwrap();
        }
        cxt.leave_monitoring().unwrap();
        let last_ordinal = cxt.ordinal();
        assert!(last_ordinal > 1, "no rotation happened");
        cxt.close().unwrap();

        let segments: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(segments.len(), last_ordinal as usize);
        // Every closed segment stands alone.
        for path in &segments {
            let mut reader = TraceFileReader::open(path, Compression::None).unwrap();
            let (samples, _) = reader.read_all_samples().unwrap();
            assert!(!samples.is_empty());
        }
    }

    #[test]
    fn test_restart_closes_the_segment_and_opens_the_next() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (mut cxt, time) = manual_context(&config);
        let mut provider = TestProvider::new(vec![main_frame(1)]);

        cxt.enter_monitoring().unwrap();
        advance(&cxt, &time, 2);
        cxt.poll_and_capture(&step(1, "entersub"), &mut provider)
            .unwrap();
        let first_path = cxt.trace_path().unwrap().to_path_buf();

        let directive = cxt.set_profiler_state(StateChange::Restart).unwrap();
        assert_eq!(directive, SwitchDirective::Unchanged);
        assert_eq!(cxt.ordinal(), 2);
        assert_ne!(cxt.trace_path().unwrap(), first_path.as_path());

        let mut reader = TraceFileReader::open(&first_path, Compression::None).unwrap();
        let (samples, end) = reader.read_all_samples().unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(end, TraceEnd::Segment);

        cxt.leave_monitoring().unwrap();
        cxt.close().unwrap();
    }

    #[test]
    fn test_stop_disables_sampling_and_ends_the_stream() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (mut cxt, time) = manual_context(&config);
        let mut provider = TestProvider::new(vec![main_frame(1)]);

        cxt.enter_monitoring().unwrap();
        advance(&cxt, &time, 2);
        cxt.poll_and_capture(&step(1, "entersub"), &mut provider)
            .unwrap();
        let path = cxt.trace_path().unwrap().to_path_buf();

        let directive = cxt.set_profiler_state(StateChange::Stop).unwrap();
        assert_eq!(directive, SwitchDirective::ExitMonitored);
        assert!(!cxt.is_enabled());
        assert!(cxt.trace_path().is_none());

        let mut reader = TraceFileReader::open(&path, Compression::None).unwrap();
        let (_, end) = reader.read_all_samples().unwrap();
        assert_eq!(end, TraceEnd::Stream);

        cxt.leave_monitoring().unwrap();
        cxt.close().unwrap();
    }

    #[test]
    fn test_sections_and_meta_open_the_trace_lazily() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (mut cxt, _time) = manual_context(&config);

        assert!(cxt.trace_path().is_none());
        cxt.start_section("db").unwrap();
        cxt.write_custom_meta("query", "select 1").unwrap();
        cxt.end_section("db").unwrap();
        assert_eq!(cxt.ordinal(), 1);
        let path = cxt.trace_path().unwrap().to_path_buf();
        cxt.close().unwrap();

        let mut reader = TraceFileReader::open(&path, Compression::None).unwrap();
        let (samples, _) = reader.read_all_samples().unwrap();
        // The deferred empty sample keeps the section end from being
        // stranded.
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].weight, 0);
        assert!(reader.active_sections().is_empty());
        assert_eq!(
            reader.custom_meta().get("query").map(String::as_str),
            Some("select 1")
        );
    }

    #[test]
    fn test_traced_evals_source_is_withheld_until_sampled() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir).with_source_mode(SourceMode::TracedEvals);
        let (mut cxt, time) = manual_context(&config);
        let mut provider = TestProvider::new(vec![Frame::Eval {
            file: "(eval 1)".into(),
            line: 3,
        }]);

        cxt.enter_monitoring().unwrap();
        cxt.save_eval_source("(eval 1)", "1 + 1").unwrap();
        cxt.save_eval_source("(eval 2)", "2 + 2").unwrap();
        // Offering source alone does not open a trace.
        assert!(cxt.trace_path().is_none());

        advance(&cxt, &time, 2);
        cxt.poll_and_capture(&step(1, "entersub"), &mut provider)
            .unwrap();
        cxt.leave_monitoring().unwrap();
        let path = cxt.trace_path().unwrap().to_path_buf();
        cxt.close().unwrap();

        let mut reader = TraceFileReader::open(&path, Compression::None).unwrap();
        reader.read_all_samples().unwrap();
        // Only the eval that showed up in a stack made it to the file.
        assert_eq!(
            reader.source_code().get("(eval 1)").map(String::as_str),
            Some("1 + 1")
        );
        assert!(reader.source_code().get("(eval 2)").is_none());
    }

    #[test]
    fn test_all_evals_source_is_written_immediately() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir).with_source_mode(SourceMode::AllEvals);
        let (mut cxt, _time) = manual_context(&config);

        cxt.save_eval_source("(eval 9)", "sleep 1").unwrap();
        let path = cxt.trace_path().unwrap().to_path_buf();
        cxt.close().unwrap();

        let mut reader = TraceFileReader::open(&path, Compression::None).unwrap();
        reader.read_all_samples().unwrap();
        assert_eq!(
            reader.source_code().get("(eval 9)").map(String::as_str),
            Some("sleep 1")
        );
    }

    #[cfg(feature = "compress")]
    #[test]
    fn test_configured_compression_reaches_the_trace_stream() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir).with_compression(Compression::Deflate);
        let (mut cxt, time) = manual_context(&config);
        let mut provider = TestProvider::new(vec![main_frame(1)]);

        cxt.enter_monitoring().unwrap();
        advance(&cxt, &time, 2);
        cxt.poll_and_capture(&step(1, "entersub"), &mut provider)
            .unwrap();
        cxt.leave_monitoring().unwrap();
        let path = cxt.trace_path().unwrap().to_path_buf();
        cxt.close().unwrap();

        // The body only decodes under the configured mode.
        assert!(TraceFileReader::open(&path, Compression::None).is_err());
        let mut reader = TraceFileReader::open(&path, Compression::Deflate).unwrap();
        assert_eq!(reader.header().tick_duration_us, 1_000);
        let (samples, end) = reader.read_all_samples().unwrap();
        assert_eq!(end, TraceEnd::Stream);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].frames, vec![main_frame(1)]);
    }

    #[test]
    fn test_thread_contexts_record_their_parent() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (mut cxt, time) = manual_context(&config);
        let mut provider = TestProvider::new(vec![main_frame(1)]);

        cxt.enter_monitoring().unwrap();
        advance(&cxt, &time, 2);
        cxt.poll_and_capture(&step(1, "entersub"), &mut provider)
            .unwrap();

        let child = cxt.new_thread_context();
        assert_ne!(child.id(), cxt.id());
        assert_eq!(child.genealogy().parent_id, cxt.id());
        assert_eq!(child.genealogy().parent_ordinal, 1);
        assert_eq!(child.ordinal(), 0);
        assert!(!child.is_running());

        cxt.leave_monitoring().unwrap();
        cxt.close().unwrap();
    }

    #[test]
    fn test_fork_child_adopts_a_new_identity() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (mut cxt, time) = manual_context(&config);
        let mut provider = TestProvider::new(vec![main_frame(1)]);

        cxt.enter_monitoring().unwrap();
        advance(&cxt, &time, 2);
        cxt.poll_and_capture(&step(1, "entersub"), &mut provider)
            .unwrap();
        let pre_fork_id = cxt.id();
        let pre_fork_path = cxt.trace_path().unwrap().to_path_buf();

        cxt.on_fork_begin().unwrap();
        // The pre-fork segment is complete on disk.
        assert!(cxt.trace_path().is_none());
        let mut reader = TraceFileReader::open(&pre_fork_path, Compression::None).unwrap();
        let (samples, end) = reader.read_all_samples().unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(end, TraceEnd::Segment);

        // Child side of the fork.
        cxt.on_fork_child().unwrap();
        assert_ne!(cxt.id(), pre_fork_id);
        assert_eq!(cxt.genealogy().parent_id, pre_fork_id);
        assert_eq!(cxt.genealogy().parent_ordinal, 1);
        assert_eq!(cxt.ordinal(), 0);
        assert!(cxt.is_running());
        assert_eq!(cxt.clock().threads_started(), 1, "fresh clock after reset");

        // The restarted clock drives samples into a new trace stream.
        advance(&cxt, &time, 2);
        assert!(cxt
            .poll_and_capture(&step(2, "leavesub"), &mut provider)
            .unwrap());
        let child_path = cxt.trace_path().unwrap().to_path_buf();
        assert_ne!(child_path, pre_fork_path);
        cxt.leave_monitoring().unwrap();
        cxt.close().unwrap();

        let reader = TraceFileReader::open(&child_path, Compression::None).unwrap();
        assert_eq!(reader.header().genealogy.parent_id, pre_fork_id);
        assert_eq!(reader.header().genealogy.ordinal, 1);
    }

    #[test]
    fn test_fork_parent_resumes_into_a_new_segment() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (mut cxt, time) = manual_context(&config);
        let mut provider = TestProvider::new(vec![main_frame(1)]);

        cxt.enter_monitoring().unwrap();
        advance(&cxt, &time, 2);
        cxt.poll_and_capture(&step(1, "entersub"), &mut provider)
            .unwrap();
        let id = cxt.id();

        cxt.on_fork_begin().unwrap();
        cxt.on_fork_parent();

        // Identity is unchanged and the next sample opens segment two.
        assert_eq!(cxt.id(), id);
        advance(&cxt, &time, 2);
        assert!(cxt
            .poll_and_capture(&step(2, "leavesub"), &mut provider)
            .unwrap());
        assert_eq!(cxt.ordinal(), 2);
        cxt.leave_monitoring().unwrap();
        cxt.close().unwrap();
    }

    #[test]
    fn test_close_while_running_reports_the_misuse() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (mut cxt, _time) = manual_context(&config);

        cxt.enter_monitoring().unwrap();
        assert!(matches!(cxt.close(), Err(ProfileError::ActiveTeardown)));
        assert!(!cxt.is_running());
        // The forced teardown left the context consistent.
        cxt.close().unwrap();
    }

    #[test]
    fn test_output_changes_are_refused_once_the_stream_is_open() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (mut cxt, _time) = manual_context(&config);

        cxt.start_section("db").unwrap();
        let path = cxt.trace_path().unwrap().to_path_buf();
        cxt.set_output(OutputSpec::fixed(dir.path().join("elsewhere.out")));
        assert_eq!(cxt.trace_path().unwrap(), path.as_path());
        cxt.end_section("db").unwrap();
        cxt.close().unwrap();
    }
}

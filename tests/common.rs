use std::collections::HashMap;
use std::io;
use std::thread;
use std::time::Duration;

use tickprof::profiler::{
    CalleeToken, ClockState, Frame, FrameSink, ManualTime, StackCaptureProvider,
};

/// A [`StackCaptureProvider`] that replays a scripted stack, standing in for
/// the stack walker a host runtime would provide.
///
/// ```rust,ignore
/// let mut provider = ScriptedStack::new(vec![main_frame]);
/// provider.frames = stack_for_this_step;
/// cxt.poll_and_capture(&step, &mut provider)?;
/// ```
pub struct ScriptedStack {
    /// Frames reported on the next capture, innermost first.
    pub frames: Vec<Frame>,
    /// Native callees by token, for the call-return heuristic.
    pub native: HashMap<u64, (String, String)>,
}

impl ScriptedStack {
    pub fn new(frames: Vec<Frame>) -> ScriptedStack {
        ScriptedStack {
            frames,
            native: HashMap::new(),
        }
    }
}

impl StackCaptureProvider for ScriptedStack {
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

/// Grant `sleeps` clock wakes, wait for them to happen, then wait for the
/// tick counter to settle. The first wake of a clock thread only covers its
/// phase offset, so after n total wakes the counter reads n - 1.
#[allow(dead_code)]
pub fn advance_clock(clock: &ClockState, time: &ManualTime, sleeps: u64) -> u32 {
    let target = time.sleeps_completed() + sleeps;
    time.grant(sleeps);
    assert!(
        time.wait_sleeps(target, Duration::from_secs(5)),
        "clock thread did not wake"
    );
    let mut last = clock.counter();
    for _ in 0..500 {
        thread::sleep(Duration::from_millis(1));
        let now = clock.counter();
        if now == last {
            return now;
        }
        last = now;
    }
    panic!("clock counter did not settle");
}

mod common;

use std::path::Path;
use std::sync::Arc;

use common::{advance_clock, ScriptedStack};
use tickprof::profiler::{
    ClockState, CodePos, Compression, Context, Frame, ManualTime, OutputSpec, ProfilerConfig,
    StateChange, StepInfo, TraceEnd, TraceFileReader,
};

fn collect_segments(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut segments: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    segments.sort();
    segments
}

fn segment_ordinal(path: &Path) -> u32 {
    let name = path.file_name().unwrap().to_str().unwrap();
    let suffix = name.rsplit('.').next().unwrap();
    u32::from_str_radix(suffix, 16).unwrap()
}

/// Fill a template output past its size limit several times over, with one
/// explicit restart thrown in, and verify the segment chain on disk: naming,
/// contiguous ordinals, and that every segment stands alone.
#[test]
fn rotated_segments_form_a_complete_chain() {
    let dir = tempfile::tempdir().unwrap();
    let config = ProfilerConfig::default()
        .with_output(OutputSpec::template(dir.path().join("app.prof")))
        .with_sampling_interval_us(1_000)
        .with_max_segment_size(600)
        .with_meta("app", "rotated");
    let time = Arc::new(ManualTime::new());
    let clock = ClockState::with_time_source(config.sampling_params(), time.clone());
    let mut cxt = Context::new(clock.clone(), &config);
    let mut provider = ScriptedStack::new(vec![
        Frame::Sub {
            package: "Web::Handler".into(),
            name: "dispatch".into(),
            file: "lib/Web/Handler.pm".into(),
            line: 88,
            first_line: 80,
        },
        Frame::Main {
            file: "app.pl".into(),
            line: 12,
        },
    ]);

    cxt.enter_monitoring().unwrap();
    cxt.start_section("request").unwrap();
    for i in 0..80u64 {
        advance_clock(&clock, &time, 1);
        cxt.poll_and_capture(&StepInfo::new(CodePos(i), "entersub"), &mut provider)
            .unwrap();
        if i == 40 {
            cxt.set_profiler_state(StateChange::Restart).unwrap();
        }
    }
    cxt.leave_monitoring().unwrap();
    let stamp = cxt.id().file_stamp();
    cxt.close().unwrap();
    let last_ordinal = cxt.ordinal();
    assert!(last_ordinal >= 3, "expected rotations plus a restart");

    let segments = collect_segments(dir.path());
    assert_eq!(segments.len(), last_ordinal as usize);

    let mut total_weight = 0u32;
    for (index, path) in segments.iter().enumerate() {
        // Template naming: base name, the context stamp, the ordinal.
        let name = path.file_name().unwrap().to_str().unwrap();
        let parts: Vec<_> = name.split('.').collect();
        assert_eq!(parts[0], "app");
        assert_eq!(parts[1], "prof");
        assert_eq!(parts[2], stamp);
        assert_eq!(segment_ordinal(path) as usize, index + 1);

        let mut reader = TraceFileReader::open(path, Compression::None).unwrap();
        assert_eq!(reader.header().genealogy.ordinal, (index + 1) as u32);
        let (samples, end) = reader.read_all_samples().unwrap();
        if index + 1 == last_ordinal as usize {
            assert_eq!(end, TraceEnd::Stream);
        } else {
            assert_eq!(end, TraceEnd::Segment);
        }
        total_weight += samples.iter().map(|sample| sample.weight).sum::<u32>();

        // The header of every rotated segment repeats the global metadata
        // and the still-open section, so each file stands alone.
        assert_eq!(
            reader.custom_meta().get("app").map(String::as_str),
            Some("rotated")
        );
        assert_eq!(reader.active_sections().get("request"), Some(&1));
    }
    // One tick per poll, with the first poll seeing no tick yet.
    assert_eq!(total_weight, 79);
}

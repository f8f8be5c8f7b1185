mod common;

use std::time::Duration;

use common::{init_test_tracing, tagged, wait_until};
use vpipe::blocks::{null_sink, test_pattern_source};
use vpipe::source::VideoSource;
use vpipe::{Block, BlockState, FrameInfo, PipelineError, PixelFormat};

#[test]
fn sink_state_machine() {
    init_test_tracing();
    let sink = null_sink();
    assert_eq!(
        sink.start().unwrap_err(),
        PipelineError::InvalidState {
            operation: "start",
            state: BlockState::Uninitialized
        }
    );
    assert!(sink.stop().is_err());
    assert_eq!(sink.state(), BlockState::Uninitialized);

    sink.configure().unwrap();
    sink.configure().unwrap();
    assert!(sink.stop().is_err());
    assert_eq!(sink.state(), BlockState::Initialized);

    sink.start().unwrap();
    assert!(sink.start().is_err());
    assert!(sink.configure().is_err());
    assert_eq!(sink.state(), BlockState::Running);

    sink.stop().unwrap();
    assert_eq!(sink.state(), BlockState::Stopped);
    assert!(sink.stop().is_err());
    assert!(sink.configure().is_err());

    sink.start().unwrap();
    sink.shutdown();
    sink.shutdown();
    assert_eq!(sink.state(), BlockState::Stopped);
    assert!(sink.core().last_error().is_empty());
}

#[test]
fn restarted_sink_accepts_frames_again() {
    init_test_tracing();
    let sink = null_sink();
    sink.configure().unwrap();
    sink.start().unwrap();
    sink.stop().unwrap();
    let input = sink.as_sink().unwrap();
    assert!(matches!(
        input.submit(tagged(1)),
        Err(PipelineError::Rejected(_))
    ));

    sink.start().unwrap();
    input.submit(tagged(2)).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        sink.core().stats().frames_processed == 1
    }));
    sink.stop().unwrap();
}

#[test]
fn failed_configure_enters_error() {
    init_test_tracing();
    let source = test_pattern_source();
    source.core().params().set("pattern", "plaid");
    assert!(source.configure().is_err());
    assert_eq!(source.state(), BlockState::Error);
    assert!(source.core().last_error().contains("plaid"));
    assert!(source.start().is_err());
    source.shutdown();
    assert_eq!(source.state(), BlockState::Error);
}

#[test]
fn source_without_consumer_runs_idle() {
    init_test_tracing();
    let source = test_pattern_source();
    source.core().params().set("width", "8");
    source.core().params().set("height", "8");
    source.core().params().set("fps", "100");
    source.configure().unwrap();
    assert_eq!(source.output_format(), FrameInfo::new(8, 8, PixelFormat::Rgb24));

    source.start().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    source.stop().unwrap();

    let stats = source.core().stats();
    assert_eq!(stats.frames_processed, 0);
    assert_eq!(stats.frames_dropped, 0);
    assert_eq!(source.state(), BlockState::Stopped);
}

//! Capture and symbolicate this test binary's own stack
//!
//! These walk real frames of code built the default way (no forced frame
//! pointers), resolve them against the binary on disk and check the result
//! names the functions that are actually on the stack.

#![cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]

use std::hint::black_box;

use stackwise_core::types::{Address, StackTraceFrame};
use stackwise_core::{CaptureRequest, CaptureResult, FormatOptions, StackTracer, Trace, TraceFormatter};

/// Capture from a frame that cannot be inlined away, with the line of the call.
#[inline(never)]
fn traced_leaf(tracer: &StackTracer) -> (CaptureResult, u32)
{
    let line = line!() + 1;
    let trace = tracer.capture(&CaptureRequest::new().with_max_frames(32));
    (black_box(trace), line)
}

#[inline(never)]
fn crash_leaf(tracer: &StackTracer, frames: &mut [StackTraceFrame], out: &mut [u8]) -> usize
{
    let report = tracer.capture_and_format_into(&CaptureRequest::new(), &FormatOptions::default(), frames, out);
    black_box(report.written.bytes)
}

fn names(trace: &impl Trace) -> Vec<String>
{
    trace
        .frames()
        .iter()
        .map(|frame| frame.display_name().unwrap_or("??").to_string())
        .collect()
}

#[test]
fn test_first_frame_is_the_caller()
{
    let tracer = StackTracer::for_current_process().unwrap();
    let (trace, _) = traced_leaf(&tracer);
    let names = names(&trace);

    assert!(names.len() >= 2, "{names:?}");
    assert!(names[0].contains("traced_leaf"), "{names:?}");
    // No frame between the leaf and this test may be skipped
    assert!(
        names[1..3.min(names.len())]
            .iter()
            .any(|name| name.contains("test_first_frame_is_the_caller")),
        "{names:?}"
    );

    let text = TraceFormatter::new(FormatOptions::default()).render(&trace);
    assert!(text.lines().next().unwrap().contains("traced_leaf"), "{text}");
}

#[test]
fn test_caller_frame_resolves_to_source_line()
{
    let tracer = StackTracer::for_current_process().unwrap();
    let (trace, line) = traced_leaf(&tracer);
    let frame = &trace.frames()[0];

    let file = frame.source_file().unwrap();
    assert!(file.ends_with("live.rs"), "{file}");
    let resolved = frame.line().unwrap();
    assert!((line..=line + 1).contains(&resolved), "expected line {line}, got {resolved}");
}

#[test]
fn test_function_address_resolves_to_its_symbol_and_file()
{
    let tracer = StackTracer::for_current_process().unwrap();
    let address = Address::from(traced_leaf as usize as u64);
    let mut frames = vec![StackTraceFrame::new(0, address).with_return_address(false)];

    assert_eq!(tracer.resolve_frames(&mut frames, &CaptureRequest::new()), 1);
    let frame = &frames[0];
    assert!(frame.display_name().unwrap().contains("traced_leaf"));
    assert_eq!(frame.symbol_offset(), Some(0));
    assert!(frame.source_file().unwrap().ends_with("live.rs"));
    assert!(frame.line().is_some_and(|line| line > 0));
}

#[test]
fn test_crash_path_first_frame_is_the_caller()
{
    let tracer = StackTracer::for_current_process().unwrap();
    assert!(tracer.prepare() > 0);
    let builds = tracer.resolver().build_count();

    let mut frames = vec![StackTraceFrame::default(); 64];
    let mut out = vec![0u8; 16 * 1024];
    let written = crash_leaf(&tracer, &mut frames, &mut out);

    let text = std::str::from_utf8(&out[..written]).unwrap();
    assert!(text.lines().next().unwrap().contains("crash_leaf"), "{text}");
    assert!(text.contains("test_crash_path_first_frame_is_the_caller"), "{text}");
    assert_eq!(tracer.resolver().build_count(), builds);
}

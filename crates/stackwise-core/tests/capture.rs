//! End-to-end capture tests: walk, resolve and render

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{demo_image, MODULE_BASE, MODULE_PATH, MODULE_SIZE};
use stackwise_core::registry::{ModuleDescriptor, ModuleRegistry};
use stackwise_core::symbols::{MemoryImages, SymbolResolver};
use stackwise_core::thread::{NoopThreadControl, RecordedThread};
use stackwise_core::types::{Address, ResolutionOutcome, StackTraceFrame, ThreadContext};
use stackwise_core::unwind::StackSnapshot;
use stackwise_core::{CaptureRequest, FormatOptions, StackTracer, TraceFormatter};

const STACK: u64 = 0x7ff0_0000;

fn tracer() -> StackTracer
{
    let mut images = MemoryImages::new();
    images.insert(MODULE_PATH, demo_image());

    let registry = ModuleRegistry::from_descriptors(vec![ModuleDescriptor::new(
        MODULE_PATH.into(),
        Address::from(MODULE_BASE),
        MODULE_SIZE,
    )]);
    StackTracer::new(Arc::new(registry), Arc::new(SymbolResolver::with_reader(Arc::new(images))))
}

/// pc in `f`, then a return into `g`, then a return before the first symbol.
fn demo_stack() -> (ThreadContext, StackSnapshot)
{
    let stack = StackSnapshot::from_words(
        Address::from(STACK),
        &[STACK + 0x10, MODULE_BASE + 0x201, 0, MODULE_BASE + 0x50],
    );
    let context = ThreadContext {
        pc: Address::from(MODULE_BASE + 0x150),
        sp: Address::from(STACK),
        fp: Address::from(STACK),
        ..ThreadContext::default()
    };
    (context, stack)
}

#[test]
fn test_capture_from_resolves_each_frame()
{
    let (context, stack) = demo_stack();
    let trace = tracer().capture_from(&context, &stack, &CaptureRequest::new());

    assert!(!trace.is_incomplete());
    let frames = trace.frames();
    assert_eq!(frames.len(), 3);

    assert_eq!(frames[0].symbol(), Some("f"));
    assert_eq!(frames[0].symbol_offset(), Some(0x50));
    assert!(!frames[0].is_return_address());

    // 0x201 is a return address: looked up at 0x200, offset from the real address
    assert_eq!(frames[1].symbol(), Some("g"));
    assert_eq!(frames[1].symbol_offset(), Some(0x1));

    // A failure on one frame leaves the others resolved
    assert_eq!(frames[2].symbol(), None);
    assert_eq!(frames[2].module_offset(), Some(0x50));
    assert_eq!(frames[2].outcome(), ResolutionOutcome::ModuleOnly);
}

#[test]
fn test_rendered_line_format()
{
    let (context, stack) = demo_stack();
    let trace = tracer().capture_from(&context, &stack, &CaptureRequest::new());
    let text = TraceFormatter::new(FormatOptions::default()).render(&trace);

    assert_eq!(
        text,
        "#0 0x0000000000400150 in f+0x50 (libdemo.so)\n\
         #1 0x0000000000400201 in g+0x1 (libdemo.so)\n\
         #2 0x0000000000400050 in ?? (libdemo.so)"
    );
}

#[test]
fn test_frame_limit_is_a_prefix()
{
    let (context, stack) = demo_stack();
    let tracer = tracer();
    let full = tracer.capture_from(&context, &stack, &CaptureRequest::new());

    for max in 0..=4 {
        let trace = tracer.capture_from(&context, &stack, &CaptureRequest::new().with_max_frames(max));
        assert!(trace.len() <= max);
        let addresses: Vec<Address> = trace.frames().iter().map(StackTraceFrame::address).collect();
        let expected: Vec<Address> = full.frames().iter().take(max).map(StackTraceFrame::address).collect();
        assert_eq!(addresses, expected);
        assert_eq!(trace.is_incomplete(), max > 0 && max < full.len());
    }
}

#[test]
fn test_zero_frames_is_empty_and_complete()
{
    let (context, stack) = demo_stack();
    let trace = tracer().capture_from(&context, &stack, &CaptureRequest::new().with_max_frames(0));
    assert!(trace.is_empty());
    assert!(!trace.is_incomplete());
}

#[test]
fn test_skip_frames()
{
    let (context, stack) = demo_stack();
    let trace = tracer().capture_from(&context, &stack, &CaptureRequest::new().with_skip_frames(1));
    assert_eq!(trace.len(), 2);
    assert_eq!(trace.frames()[0].index(), 0);
    assert_eq!(trace.frames()[0].symbol(), Some("g"));
}

#[test]
fn test_symbols_disabled_keeps_module()
{
    let (context, stack) = demo_stack();
    let request = CaptureRequest::new().with_symbols(false).with_lines(false);
    let trace = tracer().capture_from(&context, &stack, &request);

    assert!(trace.frames().iter().all(|frame| frame.symbol().is_none()));
    assert!(trace.frames().iter().all(|frame| frame.module().is_some()));
}

#[test]
fn test_exhausted_budget_drops_unresolved_frames()
{
    let (context, stack) = demo_stack();
    let request = CaptureRequest::new().with_resolve_budget(Duration::ZERO);
    let trace = tracer().capture_from(&context, &stack, &request);

    assert!(trace.is_empty());
    assert!(trace.is_incomplete());
}

#[test]
fn test_capture_thread_from_recording()
{
    let (context, stack) = demo_stack();
    let thread = RecordedThread::new(context, stack);
    let trace = tracer().capture_thread(&thread, &CaptureRequest::new());

    assert_eq!(trace.len(), 3);
    assert_eq!(trace.frames()[1].symbol(), Some("g"));
    assert_eq!(thread.suspend_count(), 1);
    assert_eq!(thread.resume_count(), 1);
}

#[test]
fn test_capture_thread_rejects_inconsistent_context()
{
    let (mut context, stack) = demo_stack();
    context.sp = Address::from(STACK - 0x1000);
    let thread = RecordedThread::new(context, stack);
    let trace = tracer().capture_thread(&thread, &CaptureRequest::new());

    assert!(trace.is_empty());
    assert!(trace.is_incomplete());
    assert_eq!(thread.resume_count(), 1);
}

#[test]
fn test_capture_thread_without_suspension()
{
    let trace = tracer().capture_thread(&NoopThreadControl, &CaptureRequest::new());
    assert!(trace.is_empty());
    assert!(trace.is_incomplete());

    let (context, stack) = demo_stack();
    let thread = RecordedThread::new(context, stack).failing_suspend();
    let trace = tracer().capture_thread(&thread, &CaptureRequest::new());
    assert!(trace.is_empty());
    assert_eq!(thread.resume_count(), 0);
}

#[test]
fn test_capture_own_stack()
{
    let tracer = StackTracer::new(Arc::new(ModuleRegistry::empty()), Arc::new(SymbolResolver::new()));
    let trace = tracer.capture(&CaptureRequest::new().with_max_frames(8));

    assert!(trace.len() <= 8);
    assert!(trace.frames().iter().all(|frame| frame.address() != Address::ZERO));
    assert!(trace.frames().iter().enumerate().all(|(i, frame)| frame.index() == i));
}

#[test]
fn test_capture_into_respects_slice()
{
    let tracer = StackTracer::new(Arc::new(ModuleRegistry::empty()), Arc::new(SymbolResolver::new()));
    let mut frames = vec![StackTraceFrame::default(); 2];
    let trace = tracer.capture_into(&CaptureRequest::new(), &mut frames);

    assert!(trace.len() <= 2);
    assert!(trace.frames().iter().all(|frame| frame.symbol().is_none()));
}

#[test]
fn test_crash_path_fills_caller_buffers()
{
    let tracer = StackTracer::new(Arc::new(ModuleRegistry::empty()), Arc::new(SymbolResolver::new()));
    tracer.prepare();

    let mut frames = vec![StackTraceFrame::default(); 16];
    let mut out = [0u8; 48];
    let report = tracer.capture_and_format_into(&CaptureRequest::new(), &FormatOptions::default(), &mut frames, &mut out);

    assert!(report.frames <= 16);
    assert!(report.written.bytes <= out.len());
    if report.frames > 0 {
        assert!(out.starts_with(b"#0 0x"));
    }
    assert_eq!(tracer.resolver().build_count(), 0);
}

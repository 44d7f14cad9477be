//! # Tracing Allocator
//!
//! A [`GlobalAlloc`] wrapper that walks the allocating stack for every block
//! it hands out and keeps that trace until the block is freed. Whatever is
//! still live when [`TracingAllocator::report`] runs is a leak candidate and
//! is printed with the stack that allocated it.
//!
//! ```rust,no_run
//! use std::alloc::System;
//!
//! use stackwise_core::allocator::TracingAllocator;
//! use stackwise_core::FormatOptions;
//!
//! #[global_allocator]
//! static HEAP: TracingAllocator = TracingAllocator::new(System, "heap");
//!
//! fn main()
//! {
//!     let _kept = Box::leak(Box::new([0u8; 64]));
//!     eprint!("{}", HEAP.render(&FormatOptions::default()));
//! }
//! ```
//!
//! ## Recursion
//!
//! Recording a block allocates too: the frame vector, the map node and, on
//! first use, the tracer itself. A per-thread flag marks the recording
//! section, and anything allocated or freed inside it goes straight to the
//! inner allocator untracked. Frees of blocks that were never tracked pass
//! through the same way.
//!
//! Stacks are walked when a block is allocated but only symbolized when a
//! report is asked for.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use once_cell::sync::OnceCell;

use crate::capture::{CaptureRequest, CaptureResult, StackTracer, Trace};
use crate::render::{FormatOptions, TraceFormatter};
use crate::types::Address;

/// Frames kept per block
pub const DEFAULT_BLOCK_FRAMES: usize = 16;

thread_local! {
    static RECORDING: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as inside the allocator's own bookkeeping.
struct Recording;

impl Recording
{
    /// `None` when the thread is already recording or its thread-locals are
    /// gone.
    fn enter() -> Option<Self>
    {
        RECORDING
            .try_with(|recording| (!recording.replace(true)).then_some(Recording))
            .ok()
            .flatten()
    }
}

impl Drop for Recording
{
    fn drop(&mut self)
    {
        let _ = RECORDING.try_with(|recording| recording.set(false));
    }
}

/// A tracked block that has not been freed
#[derive(Debug, Clone)]
pub struct LiveBlock
{
    pub address: Address,
    pub size: usize,
    /// Stack at the allocation, with the allocator's own frames skipped
    pub trace: CaptureResult,
}

/// Allocator that remembers where each live block came from
pub struct TracingAllocator<A = System>
{
    inner: A,
    name: &'static str,
    tracer: OnceCell<Option<StackTracer>>,
    blocks: Mutex<BTreeMap<usize, LiveBlock>>,
    allocations: AtomicUsize,
}

impl<A> TracingAllocator<A>
{
    pub const fn new(inner: A, name: &'static str) -> Self
    {
        Self {
            inner,
            name,
            tracer: OnceCell::new(),
            blocks: Mutex::new(BTreeMap::new()),
            allocations: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &'static str
    {
        self.name
    }

    /// Blocks allocated and not yet freed.
    pub fn blocks_in_use(&self) -> usize
    {
        self.lock().len()
    }

    pub fn bytes_in_use(&self) -> usize
    {
        self.lock().values().map(|block| block.size).sum()
    }

    /// Blocks tracked since construction, freed or not.
    pub fn allocations(&self) -> usize
    {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Live blocks in address order, with symbolized traces.
    pub fn leaks(&self) -> Vec<LiveBlock>
    {
        match Recording::enter() {
            Some(_recording) => self.resolved_blocks(),
            None => Vec::new(),
        }
    }

    /// Write every live block and its allocation trace to `out`.
    pub fn report<W: Write + ?Sized>(&self, options: &FormatOptions, out: &mut W) -> fmt::Result
    {
        let Some(_recording) = Recording::enter() else {
            return Ok(());
        };
        let blocks = self.resolved_blocks();
        let noun = if blocks.len() == 1 { "block" } else { "blocks" };
        writeln!(out, "{}: {} {noun} in use", self.name, blocks.len())?;

        let formatter = TraceFormatter::new(*options);
        for block in &blocks {
            writeln!(out, "block {} of {} bytes allocated at:", block.address, block.size)?;
            let text = formatter.render(&block.trace);
            if !text.is_empty() {
                writeln!(out, "{}", text.trim_end())?;
            }
        }
        Ok(())
    }

    /// [`Self::report`] into a `String`.
    pub fn render(&self, options: &FormatOptions) -> String
    {
        let mut text = String::new();
        // Writing into a String cannot fail
        let _ = self.report(options, &mut text);
        text
    }

    /// Stop tracking every block currently live. The blocks stay allocated.
    pub fn clear(&self)
    {
        if let Some(_recording) = Recording::enter() {
            let forgotten = std::mem::take(&mut *self.lock());
            drop(forgotten);
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<usize, LiveBlock>>
    {
        self.blocks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Only called while recording.
    fn tracer(&self) -> Option<&StackTracer>
    {
        self.tracer.get_or_init(|| StackTracer::for_current_process().ok()).as_ref()
    }

    /// Only called while recording.
    fn resolved_blocks(&self) -> Vec<LiveBlock>
    {
        let mut blocks: Vec<LiveBlock> = self.lock().values().cloned().collect();
        if let Some(tracer) = self.tracer() {
            let request = CaptureRequest::new();
            for block in &mut blocks {
                let incomplete = block.trace.is_incomplete();
                let mut frames = std::mem::take(&mut block.trace).into_frames();
                let kept = tracer.resolve_frames(&mut frames, &request);
                let cut = kept < frames.len();
                frames.truncate(kept);
                block.trace = CaptureResult::new(frames, incomplete || cut);
            }
        }
        blocks
    }

    #[inline(never)]
    fn record(&self, ptr: *mut u8, size: usize)
    {
        let Some(_recording) = Recording::enter() else {
            return;
        };
        let request = CaptureRequest::new()
            .with_max_frames(DEFAULT_BLOCK_FRAMES)
            .with_skip_frames(1)
            .with_symbols(false)
            .with_lines(false);
        let trace = match self.tracer() {
            Some(tracer) => tracer.capture(&request),
            None => CaptureResult::new(Vec::new(), true),
        };
        let block = LiveBlock {
            address: Address::from(ptr as u64),
            size,
            trace,
        };
        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(ptr as usize, block);
    }

    fn forget(&self, ptr: *mut u8)
    {
        if let Some(_recording) = Recording::enter() {
            // The record is dropped before the flag clears
            let removed = self.lock().remove(&(ptr as usize));
            drop(removed);
        }
    }

    /// Move the record of `old` to `new`, keeping the original trace.
    fn relocate(&self, old: *mut u8, new: *mut u8, size: usize)
    {
        let Some(_recording) = Recording::enter() else {
            return;
        };
        let mut blocks = self.lock();
        if let Some(mut block) = blocks.remove(&(old as usize)) {
            block.address = Address::from(new as u64);
            block.size = size;
            blocks.insert(new as usize, block);
        }
    }
}

impl<A> fmt::Debug for TracingAllocator<A>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("TracingAllocator")
            .field("name", &self.name)
            .field("allocations", &self.allocations())
            .finish_non_exhaustive()
    }
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for TracingAllocator<A>
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8
    {
        let ptr = self.inner.alloc(layout);
        if !ptr.is_null() {
            self.record(ptr, layout.size());
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8
    {
        let ptr = self.inner.alloc_zeroed(layout);
        if !ptr.is_null() {
            self.record(ptr, layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout)
    {
        self.forget(ptr);
        self.inner.dealloc(ptr, layout);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8
    {
        let moved = self.inner.realloc(ptr, layout, new_size);
        if !moved.is_null() {
            self.relocate(ptr, moved, new_size);
        }
        moved
    }
}

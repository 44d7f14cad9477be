//! # Foreign Thread Control
//!
//! Capturing another thread's stack needs that thread to hold still while
//! its registers and stack window are copied. [`ThreadControl`] is the
//! narrow capability the capture pipeline needs for that:
//!
//! 1. `suspend`
//! 2. `context` and `read_stack` (the copy)
//! 3. `resume`, always, even if the copy failed
//!
//! The walk then runs over the copy with the thread already running again.
//!
//! Implementations:
//!
//! - [`NoopThreadControl`]: platforms without suspension; every capture is
//!   empty and incomplete
//! - [`RecordedThread`]: canned registers and stack bytes for tests
//! - `MachThreadControl` (macOS): `thread_suspend` / `thread_get_state` /
//!   `thread_resume`

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{TraceError, TraceResult};
use crate::types::{Address, ThreadContext};
use crate::unwind::{StackMemory, StackSnapshot};

/// Suspend/inspect/resume capability for one thread
pub trait ThreadControl
{
    fn suspend(&self) -> TraceResult<()>;

    /// Registers and stack range of the suspended thread.
    fn context(&self) -> TraceResult<ThreadContext>;

    /// Copy `len` bytes of the suspended thread's stack starting at `from`.
    fn read_stack(&self, from: Address, len: usize) -> TraceResult<StackSnapshot>;

    fn resume(&self) -> TraceResult<()>;
}

/// Thread control for platforms that cannot suspend threads
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopThreadControl;

impl ThreadControl for NoopThreadControl
{
    fn suspend(&self) -> TraceResult<()>
    {
        Err(TraceError::SuspendFailed("thread suspension is not supported on this platform".into()))
    }

    fn context(&self) -> TraceResult<ThreadContext>
    {
        Err(TraceError::SuspendFailed("thread is not suspended".into()))
    }

    fn read_stack(&self, _from: Address, _len: usize) -> TraceResult<StackSnapshot>
    {
        Err(TraceError::SuspendFailed("thread is not suspended".into()))
    }

    fn resume(&self) -> TraceResult<()>
    {
        Ok(())
    }
}

/// A thread replayed from recorded registers and stack bytes
///
/// Counts suspend and resume calls so tests can check they stay balanced.
#[derive(Debug, Default)]
pub struct RecordedThread
{
    context: ThreadContext,
    stack: StackSnapshot,
    fail_suspend: bool,
    suspends: AtomicUsize,
    resumes: AtomicUsize,
}

impl RecordedThread
{
    /// `context.stack` is replaced by the snapshot's range.
    pub fn new(mut context: ThreadContext, stack: StackSnapshot) -> Self
    {
        context.stack = stack.bounds();
        Self {
            context,
            stack,
            ..Self::default()
        }
    }

    /// Make every `suspend` fail.
    pub fn failing_suspend(mut self) -> Self
    {
        self.fail_suspend = true;
        self
    }

    pub fn suspend_count(&self) -> usize
    {
        self.suspends.load(Ordering::SeqCst)
    }

    pub fn resume_count(&self) -> usize
    {
        self.resumes.load(Ordering::SeqCst)
    }
}

impl ThreadControl for RecordedThread
{
    fn suspend(&self) -> TraceResult<()>
    {
        if self.fail_suspend {
            return Err(TraceError::SuspendFailed("recorded thread refuses to suspend".into()));
        }
        self.suspends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn context(&self) -> TraceResult<ThreadContext>
    {
        Ok(self.context)
    }

    fn read_stack(&self, from: Address, len: usize) -> TraceResult<StackSnapshot>
    {
        let start = from
            .offset_from(self.stack.base())
            .and_then(|offset| usize::try_from(offset).ok())
            .filter(|start| *start <= self.stack.len())
            .ok_or_else(|| TraceError::InvalidArgument(format!("{from} is outside the recorded stack")))?;
        let end = start.saturating_add(len).min(self.stack.len());
        Ok(StackSnapshot::new(from, self.stack.bytes()[start..end].to_vec()))
    }

    fn resume(&self) -> TraceResult<()>
    {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_noop_never_suspends()
    {
        assert!(matches!(NoopThreadControl.suspend(), Err(TraceError::SuspendFailed(_))));
        assert!(NoopThreadControl.resume().is_ok());
    }

    #[test]
    fn test_recorded_read_stack_window()
    {
        let stack = StackSnapshot::from_words(Address::from(0x1000), &[1, 2, 3, 4]);
        let thread = RecordedThread::new(ThreadContext::default(), stack);

        let window = thread.read_stack(Address::from(0x1008), 16).unwrap();
        assert_eq!(window.base(), Address::from(0x1008));
        assert_eq!(window.read_u64(Address::from(0x1010)).unwrap(), 3);

        let clamped = thread.read_stack(Address::from(0x1010), 4096).unwrap();
        assert_eq!(clamped.len(), 16);

        assert!(thread.read_stack(Address::from(0x0800), 8).is_err());
    }

    #[test]
    fn test_recorded_counts()
    {
        let thread = RecordedThread::new(ThreadContext::default(), StackSnapshot::default());
        thread.suspend().unwrap();
        thread.resume().unwrap();
        assert_eq!((thread.suspend_count(), thread.resume_count()), (1, 1));

        let failing = RecordedThread::new(ThreadContext::default(), StackSnapshot::default()).failing_suspend();
        assert!(failing.suspend().is_err());
        assert_eq!(failing.suspend_count(), 0);
    }
}

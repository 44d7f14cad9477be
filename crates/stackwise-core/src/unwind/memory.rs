//! Bounds-checked stack memory.
//!
//! The walker never dereferences a pointer it has not checked against the
//! stack range of the thread being walked. Two implementations:
//!
//! - [`LocalStack`]: the calling thread's own, live stack
//! - [`StackSnapshot`]: an owned copy of another thread's stack window

use crate::error::{TraceError, TraceResult};
use crate::types::{Address, StackBounds};

/// Word-sized reads from a thread's stack
pub trait StackMemory
{
    /// Readable range; reads outside it fail.
    fn bounds(&self) -> StackBounds;

    /// Read the native-endian word at `address`.
    fn read_u64(&self, address: Address) -> TraceResult<u64>;
}

fn out_of_bounds(address: Address, bounds: StackBounds) -> TraceError
{
    TraceError::UnwindFailure(format!("read at {address} outside stack {}..{}", bounds.low, bounds.high))
}

/// The calling thread's stack
///
/// Only sound while the stack it describes is the current thread's, which is
/// why it can only be built from the current thread's bounds.
#[derive(Debug, Clone, Copy)]
pub struct LocalStack
{
    bounds: StackBounds,
}

impl LocalStack
{
    /// Stack of the calling thread, or an empty range around `sp` when the
    /// platform cannot report bounds.
    pub fn current(sp: Address) -> Self
    {
        Self {
            bounds: StackBounds::current_thread().unwrap_or_else(|| StackBounds::empty_at(sp)),
        }
    }
}

impl StackMemory for LocalStack
{
    fn bounds(&self) -> StackBounds
    {
        self.bounds
    }

    fn read_u64(&self, address: Address) -> TraceResult<u64>
    {
        if !self.bounds.contains(address, 8) || !address.is_aligned(8) {
            return Err(out_of_bounds(address, self.bounds));
        }
        // SAFETY: the word lies inside the calling thread's mapped stack and
        // is aligned; volatile because the compiler cannot see who wrote it.
        Ok(unsafe { std::ptr::read_volatile(address.value() as usize as *const u64) })
    }
}

/// Owned copy of a stack window starting at `base`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackSnapshot
{
    base: Address,
    bytes: Vec<u8>,
}

impl StackSnapshot
{
    pub fn new(base: Address, bytes: Vec<u8>) -> Self
    {
        Self { base, bytes }
    }

    /// Snapshot built from native-endian words, handy for synthetic stacks.
    ///
    /// ```rust
    /// use stackwise_core::types::Address;
    /// use stackwise_core::unwind::{StackMemory, StackSnapshot};
    ///
    /// let stack = StackSnapshot::from_words(Address::from(0x1000), &[7, 9]);
    /// assert_eq!(stack.read_u64(Address::from(0x1008)).unwrap(), 9);
    /// assert!(stack.read_u64(Address::from(0x1010)).is_err());
    /// ```
    pub fn from_words(base: Address, words: &[u64]) -> Self
    {
        let bytes = words.iter().flat_map(|word| word.to_ne_bytes()).collect();
        Self { base, bytes }
    }

    pub fn base(&self) -> Address
    {
        self.base
    }

    pub fn bytes(&self) -> &[u8]
    {
        &self.bytes
    }

    pub fn len(&self) -> usize
    {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.bytes.is_empty()
    }
}

impl StackMemory for StackSnapshot
{
    fn bounds(&self) -> StackBounds
    {
        StackBounds::new(self.base, Address::from(self.base.value().saturating_add(self.bytes.len() as u64)))
    }

    fn read_u64(&self, address: Address) -> TraceResult<u64>
    {
        let bounds = self.bounds();
        let word = address
            .offset_from(self.base)
            .and_then(|offset| usize::try_from(offset).ok())
            .and_then(|start| self.bytes.get(start..start.checked_add(8)?))
            .ok_or_else(|| out_of_bounds(address, bounds))?;

        let mut raw = [0u8; 8];
        raw.copy_from_slice(word);
        Ok(u64::from_ne_bytes(raw))
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_snapshot_rejects_partial_words()
    {
        let stack = StackSnapshot::new(Address::from(0x2000), vec![0u8; 12]);
        assert!(stack.read_u64(Address::from(0x2000)).is_ok());
        assert!(stack.read_u64(Address::from(0x2004)).is_ok());
        assert!(stack.read_u64(Address::from(0x2005)).is_err());
        assert!(stack.read_u64(Address::from(0x1ff8)).is_err());
    }

    #[test]
    fn test_local_stack_reads_own_local()
    {
        let marker: u64 = 0x5eed_f00d;
        let on_stack = std::hint::black_box(&marker);
        let address = Address::from(on_stack as *const u64 as u64);

        let stack = LocalStack::current(address);
        if stack.bounds().contains(address, 8) {
            assert_eq!(stack.read_u64(address).unwrap(), 0x5eed_f00d);
        }
        assert!(stack.read_u64(Address::ZERO).is_err());
    }
}

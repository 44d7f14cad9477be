//! The tracing allocator installed as this test binary's global allocator

use std::alloc::System;

use stackwise_core::types::Address;
use stackwise_core::{FormatOptions, TracingAllocator};

#[global_allocator]
static HEAP: TracingAllocator = TracingAllocator::new(System, "heap");

#[test]
fn test_leaked_box_is_reported_and_dropped_box_is_not()
{
    let kept: &'static mut [u8; 48] = Box::leak(Box::new([7u8; 48]));
    let kept_at = Address::from(kept.as_ptr() as u64);

    let dropped = Box::new([0u8; 80]);
    let dropped_at = Address::from(dropped.as_ptr() as u64);
    drop(dropped);

    let leaks = HEAP.leaks();
    let block = leaks.iter().find(|block| block.address == kept_at).unwrap();
    assert_eq!(block.size, 48);
    assert!(!block.trace.is_empty());
    assert!(!leaks.iter().any(|block| block.address == dropped_at && block.size == 80));

    let text = HEAP.render(&FormatOptions::default());
    assert!(text.starts_with("heap: "), "{text}");
    assert!(text.contains(&format!("block {kept_at} of 48 bytes allocated at:")), "{text}");
}

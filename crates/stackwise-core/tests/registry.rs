//! Tests for module snapshots and their interaction with the index cache

mod common;

use std::sync::Arc;

use common::{demo_image, MODULE_BASE, MODULE_PATH, MODULE_SIZE};
use stackwise_core::registry::{ModuleDescriptor, ModuleRegistry, ModuleSource, StaticModules};
use stackwise_core::symbols::{BuildMode, MemoryImages, SymbolResolver};
use stackwise_core::types::Address;
use stackwise_core::StackTracer;

fn demo_descriptor(base: u64) -> ModuleDescriptor
{
    ModuleDescriptor::new(MODULE_PATH.into(), Address::from(base), MODULE_SIZE)
}

fn tracer() -> StackTracer
{
    let mut images = MemoryImages::new();
    images.insert(MODULE_PATH, demo_image());

    let registry = ModuleRegistry::from_source(&StaticModules::new(vec![demo_descriptor(MODULE_BASE)])).unwrap();
    StackTracer::new(Arc::new(registry), Arc::new(SymbolResolver::with_reader(Arc::new(images))))
}

#[test]
fn test_refresh_keeps_built_index()
{
    let mut tracer = tracer();
    assert_eq!(tracer.prepare(), 1);
    assert_eq!(tracer.resolver().build_count(), 1);

    let source = StaticModules::new(vec![
        demo_descriptor(MODULE_BASE),
        ModuleDescriptor::new("/virtual/other.so".into(), Address::from(0x50_0000), 0x1000),
    ]);
    tracer.refresh(&source).unwrap();

    let module = tracer.registry().lookup(Address::from(MODULE_BASE + 0x10)).unwrap();
    assert!(module.index().is_some());
    assert!(tracer.resolver().index(module, BuildMode::CachedOnly).ready().is_some());
    assert_eq!(tracer.registry().len(), 2);
}

#[test]
fn test_moved_module_is_rebuilt()
{
    let mut tracer = tracer();
    tracer.prepare();

    tracer.refresh(&StaticModules::new(vec![demo_descriptor(0x60_0000)])).unwrap();
    let module = tracer.registry().lookup(Address::from(0x60_0150)).unwrap();
    assert!(module.index().is_none());

    let found = tracer.resolver().resolve(module, 0x150).unwrap();
    assert_eq!(&*found.entry.name, "f");
    assert_eq!(tracer.resolver().build_count(), 2);
}

#[test]
fn test_unreadable_module_never_rebuilt()
{
    let registry = ModuleRegistry::from_descriptors(vec![ModuleDescriptor::new(
        "/virtual/missing.so".into(),
        Address::from(0x1000),
        0x1000,
    )]);
    let resolver = SymbolResolver::with_reader(Arc::new(MemoryImages::new()));
    let module = &registry.modules()[0];

    for _ in 0..3 {
        assert!(resolver.resolve(module, 0x10).is_none());
    }
    assert_eq!(resolver.build_count(), 1);
}

#[test]
fn test_static_source_round_trips_descriptors()
{
    let descriptors = vec![demo_descriptor(MODULE_BASE)];
    let source = StaticModules::new(descriptors.clone());
    assert_eq!(source.modules().unwrap(), descriptors);
}

#[cfg(target_os = "linux")]
#[test]
fn test_current_process_contains_test_binary()
{
    use stackwise_core::registry::ProcMaps;

    let registry = ModuleRegistry::from_source(&ProcMaps::current()).unwrap();
    let exe = std::env::current_exe().unwrap();
    assert!(registry.modules().iter().any(|module| module.path() == exe));

    let here = Address::from(test_current_process_contains_test_binary as usize as u64);
    assert_eq!(registry.lookup(here).map(|module| module.path().to_path_buf()), Some(exe));
}

// Copyright 2025 the Apollo Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-device caches of expensive GPU objects, plus the commit driver.
//!
//! A [`ResourceRegistry`] de-duplicates compiled programs, compute pipelines
//! and resource-binding sets by content hash so that many prims sharing one
//! kernel build each object exactly once. Registration hands back an
//! [`Instance`]: a lazily-settable slot that tells the first requester to
//! build the value while later requesters reuse it. Registration is
//! serialized per cache; a slot only commits when the build succeeds, so a
//! failed build is retried on the next request instead of being cached.
//!
//! The [`RegistryTable`] maps each logical GPU device to its registry and
//! tears the registry down (deregistering its perf counters) when the last
//! shared reference drops.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::buffer::BufferArrayRange;
use crate::computation::Computation;
use crate::device::{
    CompiledProgram, ComputeDevice, ComputePipelineHandle, DeviceId, ResourceBindingsHandle,
};
use crate::perf::{self, PerfCollector, RegistryCounters};
use crate::source::BufferSource;

/// Commit sub-phase a computation executes in. Computations with
/// dependencies on earlier computations go in later queues.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum ComputeQueue {
    Zero,
    One,
    Two,
    Three,
}

impl ComputeQueue {
    pub const ALL: [Self; 4] = [Self::Zero, Self::One, Self::Two, Self::Three];
}

/// A lazily-settable cache slot for one hash key.
///
/// Holds the cache's critical section for its lifetime, so at most one
/// caller can be deciding whether to build a given hash at a time. The slot
/// is only committed by [`set_value`](Self::set_value); dropping a
/// first-instance guard without setting a value leaves the hash
/// unregistered.
pub struct Instance<'a, T> {
    hash: u64,
    value: Option<Arc<T>>,
    guard: MutexGuard<'a, HashMap<u64, Arc<T>>>,
}

impl<'a, T> Instance<'a, T> {
    fn acquire(hash: u64, guard: MutexGuard<'a, HashMap<u64, Arc<T>>>) -> Self {
        let value = guard.get(&hash).cloned();
        Self { hash, value, guard }
    }

    /// True if no value is registered for this hash yet; the caller is
    /// expected to build one and call [`set_value`](Self::set_value).
    pub fn is_first_instance(&self) -> bool {
        self.value.is_none()
    }

    pub fn set_value(&mut self, value: Arc<T>) {
        self.guard.insert(self.hash, value.clone());
        self.value = Some(value);
    }

    pub fn value(&self) -> Option<&Arc<T>> {
        self.value.as_ref()
    }
}

struct QueuedComputation {
    range: Arc<BufferArrayRange>,
    computation: Arc<dyn Computation>,
    queue: ComputeQueue,
}

/// Per-device cache of compiled programs, pipelines and binding sets, and
/// the driver for the per-frame commit pass.
pub struct ResourceRegistry {
    device: Arc<dyn ComputeDevice>,
    table: Weak<RegistryTable>,
    collector: Arc<PerfCollector>,
    counters: Arc<RegistryCounters>,
    programs: Mutex<HashMap<u64, Arc<CompiledProgram>>>,
    compute_pipelines: Mutex<HashMap<u64, Arc<ComputePipelineHandle>>>,
    resource_bindings: Mutex<HashMap<u64, Arc<ResourceBindingsHandle>>>,
    sources: Mutex<Vec<Arc<dyn BufferSource>>>,
    computations: Mutex<Vec<QueuedComputation>>,
}

impl ResourceRegistry {
    fn new(
        device: Arc<dyn ComputeDevice>,
        table: Weak<RegistryTable>,
        collector: Arc<PerfCollector>,
    ) -> Self {
        let counters = Arc::new(RegistryCounters::default());
        collector.register(device.id(), counters.clone());
        Self {
            device,
            table,
            collector,
            counters,
            programs: Mutex::new(HashMap::new()),
            compute_pipelines: Mutex::new(HashMap::new()),
            resource_bindings: Mutex::new(HashMap::new()),
            sources: Mutex::new(Vec::new()),
            computations: Mutex::new(Vec::new()),
        }
    }

    pub fn device(&self) -> &Arc<dyn ComputeDevice> {
        &self.device
    }

    pub fn counters(&self) -> &Arc<RegistryCounters> {
        &self.counters
    }

    /// Register a compiled program under its shader-source hash.
    pub fn register_program(&self, hash: u64) -> Instance<'_, CompiledProgram> {
        Instance::acquire(hash, self.programs.lock().unwrap())
    }

    /// Register a compute pipeline under its program-identity +
    /// constant-block-size hash.
    pub fn register_compute_pipeline(&self, hash: u64) -> Instance<'_, ComputePipelineHandle> {
        Instance::acquire(hash, self.compute_pipelines.lock().unwrap())
    }

    /// Register a resource-binding set under its combined buffer-handle hash.
    pub fn register_resource_bindings(&self, hash: u64) -> Instance<'_, ResourceBindingsHandle> {
        Instance::acquire(hash, self.resource_bindings.lock().unwrap())
    }

    pub fn cached_program_count(&self) -> usize {
        self.programs.lock().unwrap().len()
    }

    pub fn cached_compute_pipeline_count(&self) -> usize {
        self.compute_pipelines.lock().unwrap().len()
    }

    pub fn cached_resource_bindings_count(&self) -> usize {
        self.resource_bindings.lock().unwrap().len()
    }

    /// Schedule a buffer source for the next commit pass.
    ///
    /// Degenerate sources (nothing to commit) are dropped here so the
    /// commit phase never sees them.
    pub fn add_source(&self, source: Arc<dyn BufferSource>) {
        if !source.is_valid() {
            log::debug!("skipping invalid buffer source '{}'", source.name());
            return;
        }
        self.sources.lock().unwrap().push(source);
    }

    /// Schedule a computation into `queue` for the next commit pass,
    /// writing into `range`.
    pub fn add_computation(
        &self,
        range: Arc<BufferArrayRange>,
        computation: Arc<dyn Computation>,
        queue: ComputeQueue,
    ) {
        self.computations.lock().unwrap().push(QueuedComputation {
            range,
            computation,
            queue,
        });
    }

    /// Run one commit pass: resolve every scheduled buffer source, then
    /// execute every scheduled computation in queue order.
    ///
    /// Sources always resolve before any computation executes, which is what
    /// guarantees a computation's inputs are device-resident when it binds
    /// them.
    pub fn commit(&self) {
        let sources: Vec<_> = {
            let mut queue = self.sources.lock().unwrap();
            queue.drain(..).collect()
        };
        for source in &sources {
            if !source.resolve() {
                log::warn!("buffer source '{}' failed to resolve", source.name());
            }
        }

        let queued: Vec<_> = {
            let mut queue = self.computations.lock().unwrap();
            queue.drain(..).collect()
        };
        for queue in ComputeQueue::ALL {
            for entry in queued.iter().filter(|entry| entry.queue == queue) {
                entry.computation.execute(&entry.range, self);
            }
        }
    }
}

impl Drop for ResourceRegistry {
    fn drop(&mut self) {
        self.collector.deregister(self.device.id());
        if let Some(table) = self.table.upgrade() {
            table.remove_dead(self.device.id());
        }
    }
}

/// Maps each logical GPU device to its resource registry.
///
/// Ownership of a registry is shared; the table keeps only a weak reference
/// so that dropping the last outside reference destroys the registry (and
/// its caches) and removes the table entry. A later
/// [`get_or_create`](Self::get_or_create) for the same device constructs a
/// fresh, empty registry.
pub struct RegistryTable {
    collector: Arc<PerfCollector>,
    inner: Mutex<HashMap<DeviceId, Weak<ResourceRegistry>>>,
}

impl RegistryTable {
    /// A table reporting into `collector`; tests use private tables so
    /// state never leaks between cases.
    pub fn new(collector: Arc<PerfCollector>) -> Arc<Self> {
        Arc::new(Self {
            collector,
            inner: Mutex::new(HashMap::new()),
        })
    }

    /// The process-wide table, reporting into the global perf collector.
    pub fn global() -> Arc<Self> {
        use std::sync::OnceLock;
        static GLOBAL: OnceLock<Arc<RegistryTable>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| RegistryTable::new(perf::global().clone()))
            .clone()
    }

    /// The registry for `device`, constructing it on first use.
    pub fn get_or_create(self: &Arc<Self>, device: Arc<dyn ComputeDevice>) -> Arc<ResourceRegistry> {
        let mut map = self.inner.lock().unwrap();
        if let Some(existing) = map.get(&device.id()).and_then(Weak::upgrade) {
            return existing;
        }
        let registry = Arc::new(ResourceRegistry::new(
            device.clone(),
            Arc::downgrade(self),
            self.collector.clone(),
        ));
        map.insert(device.id(), Arc::downgrade(&registry));
        registry
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    fn remove_dead(&self, device: DeviceId) {
        let mut map = self.inner.lock().unwrap();
        if let Some(weak) = map.get(&device) {
            if weak.strong_count() == 0 {
                map.remove(&device);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{
        ComputeCmds, ComputePipelineDesc, ComputeProgramDesc, ProgramHandle, ResourceBindingsDesc,
    };
    use crate::{Error, Result};

    struct NullCmds;

    impl ComputeCmds for NullCmds {
        fn push_debug_group(&self, _label: &str) {}
        fn bind_resources(&self, _bindings: ResourceBindingsHandle) {}
        fn bind_pipeline(&self, _pipeline: ComputePipelineHandle) {}
        fn set_constant_values(
            &self,
            _pipeline: ComputePipelineHandle,
            _byte_offset: u32,
            _data: &[u8],
        ) {
        }
        fn dispatch(&self, _count_x: u32, _count_y: u32) {}
        fn pop_debug_group(&self) {}
    }

    struct NullDevice {
        id: DeviceId,
        cmds: NullCmds,
    }

    impl NullDevice {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: DeviceId::next(),
                cmds: NullCmds,
            })
        }
    }

    impl ComputeDevice for NullDevice {
        fn id(&self) -> DeviceId {
            self.id
        }

        fn compile_program(&self, desc: &ComputeProgramDesc) -> Result<CompiledProgram> {
            if desc.source.is_empty() {
                return Err(Error::KernelCompilation {
                    label: desc.label.clone(),
                    message: "empty kernel source".into(),
                });
            }
            Ok(CompiledProgram {
                handle: ProgramHandle::new(),
                bindings: Vec::new(),
            })
        }

        fn create_compute_pipeline(&self, _desc: &ComputePipelineDesc) -> ComputePipelineHandle {
            ComputePipelineHandle::new()
        }

        fn create_resource_bindings(&self, _desc: &ResourceBindingsDesc) -> ResourceBindingsHandle {
            ResourceBindingsHandle::new()
        }

        fn compute_cmds(&self) -> &dyn ComputeCmds {
            &self.cmds
        }
    }

    #[test]
    fn first_instance_builds_once() {
        let table = RegistryTable::new(PerfCollector::new());
        let registry = table.get_or_create(NullDevice::new());

        let mut instance = registry.register_compute_pipeline(42);
        assert!(instance.is_first_instance());
        instance.set_value(Arc::new(ComputePipelineHandle::new()));
        let built = **instance.value().unwrap();
        drop(instance);

        let instance = registry.register_compute_pipeline(42);
        assert!(!instance.is_first_instance());
        assert_eq!(**instance.value().unwrap(), built);
    }

    #[test]
    fn unset_first_instance_is_retried() {
        let table = RegistryTable::new(PerfCollector::new());
        let registry = table.get_or_create(NullDevice::new());

        let instance = registry.register_compute_pipeline(7);
        assert!(instance.is_first_instance());
        // Simulates a failed build: the guard drops without committing.
        drop(instance);

        let instance = registry.register_compute_pipeline(7);
        assert!(instance.is_first_instance());
        // Release the cache's critical section before querying the count,
        // which takes the same lock.
        drop(instance);
        assert_eq!(registry.cached_compute_pipeline_count(), 0);
    }

    #[test]
    fn one_registry_per_device() {
        let table = RegistryTable::new(PerfCollector::new());
        let device = NullDevice::new();
        let a = table.get_or_create(device.clone());
        let b = table.get_or_create(device);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn registry_is_torn_down_on_last_release() {
        let collector = PerfCollector::new();
        let table = RegistryTable::new(collector.clone());
        let device = NullDevice::new();
        let device_id = device.id();

        let registry = table.get_or_create(device.clone());
        let mut instance = registry.register_compute_pipeline(1);
        instance.set_value(Arc::new(ComputePipelineHandle::new()));
        drop(instance);
        assert_eq!(registry.cached_compute_pipeline_count(), 1);
        assert!(collector.counters(device_id).is_some());

        drop(registry);
        assert!(table.is_empty());
        assert!(collector.counters(device_id).is_none());

        // A new registry for the same device starts with empty caches.
        let recreated = table.get_or_create(device);
        assert_eq!(recreated.cached_compute_pipeline_count(), 0);
    }
}

// Copyright 2025 the Apollo Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Performance-stats collection.
//!
//! Each resource registry owns a set of [`RegistryCounters`] and registers
//! them with a [`PerfCollector`] at creation; dropping the last reference to
//! a registry deregisters them. The collector is a service object rather
//! than a language-level singleton so tests can use a private instance; the
//! process-wide one is reachable through [`global`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::device::DeviceId;

/// Counters for one device's resource registry.
#[derive(Debug, Default)]
pub struct RegistryCounters {
    programs_compiled: AtomicU64,
    compute_pipelines_created: AtomicU64,
    resource_bindings_created: AtomicU64,
    dispatches_issued: AtomicU64,
}

impl RegistryCounters {
    pub(crate) fn count_program_compiled(&self) {
        self.programs_compiled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_compute_pipeline_created(&self) {
        self.compute_pipelines_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_resource_bindings_created(&self) {
        self.resource_bindings_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_dispatch_issued(&self) {
        self.dispatches_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn programs_compiled(&self) -> u64 {
        self.programs_compiled.load(Ordering::Relaxed)
    }

    pub fn compute_pipelines_created(&self) -> u64 {
        self.compute_pipelines_created.load(Ordering::Relaxed)
    }

    pub fn resource_bindings_created(&self) -> u64 {
        self.resource_bindings_created.load(Ordering::Relaxed)
    }

    pub fn dispatches_issued(&self) -> u64 {
        self.dispatches_issued.load(Ordering::Relaxed)
    }
}

/// Aggregates the counters of every live resource registry.
#[derive(Debug, Default)]
pub struct PerfCollector {
    registries: Mutex<HashMap<DeviceId, Arc<RegistryCounters>>>,
}

impl PerfCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn register(&self, device: DeviceId, counters: Arc<RegistryCounters>) {
        self.registries.lock().unwrap().insert(device, counters);
    }

    pub(crate) fn deregister(&self, device: DeviceId) {
        self.registries.lock().unwrap().remove(&device);
    }

    /// Counters for a live registry, if one is registered for `device`.
    pub fn counters(&self, device: DeviceId) -> Option<Arc<RegistryCounters>> {
        self.registries.lock().unwrap().get(&device).cloned()
    }

    pub fn registered_count(&self) -> usize {
        self.registries.lock().unwrap().len()
    }
}

/// The process-wide collector.
pub fn global() -> &'static Arc<PerfCollector> {
    static GLOBAL: OnceLock<Arc<PerfCollector>> = OnceLock::new();
    GLOBAL.get_or_init(PerfCollector::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_deregister() {
        let collector = PerfCollector::new();
        let id = DeviceId::next();
        let counters = Arc::new(RegistryCounters::default());
        collector.register(id, counters.clone());
        assert_eq!(collector.registered_count(), 1);

        counters.count_dispatch_issued();
        let seen = collector.counters(id).unwrap();
        assert_eq!(seen.dispatches_issued(), 1);

        collector.deregister(id);
        assert!(collector.counters(id).is_none());
        assert_eq!(collector.registered_count(), 0);
    }
}

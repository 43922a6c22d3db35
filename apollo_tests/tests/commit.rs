// Copyright 2025 the Apollo Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Commit-pass ordering: every scheduled source resolves before any
//! computation executes, and computations run in queue order.

use std::sync::{Arc, Mutex};

use apollo::perf::PerfCollector;
use apollo::{
    BufferArrayRange, BufferSource, BufferSpec, Computation, ComputeQueue, RegistryTable,
    ResourceRegistry,
};
use apollo_tests::FakeDevice;

type EventLog = Arc<Mutex<Vec<String>>>;

struct LoggingSource {
    name: String,
    log: EventLog,
    resolved: Mutex<bool>,
}

impl LoggingSource {
    fn new(name: &str, log: &EventLog) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            log: log.clone(),
            resolved: Mutex::new(false),
        })
    }
}

impl BufferSource for LoggingSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolve(&self) -> bool {
        let mut resolved = self.resolved.lock().unwrap();
        if !*resolved {
            self.log.lock().unwrap().push(format!("source:{}", self.name));
            *resolved = true;
        }
        true
    }

    fn is_resolved(&self) -> bool {
        *self.resolved.lock().unwrap()
    }

    fn is_valid(&self) -> bool {
        true
    }
}

struct LoggingComputation {
    name: String,
    log: EventLog,
}

impl LoggingComputation {
    fn new(name: &str, log: &EventLog) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            log: log.clone(),
        })
    }
}

impl Computation for LoggingComputation {
    fn execute(&self, _output_range: &Arc<BufferArrayRange>, _registry: &ResourceRegistry) {
        self.log.lock().unwrap().push(format!("compute:{}", self.name));
    }

    fn get_buffer_specs(&self, _specs: &mut Vec<BufferSpec>) {}

    fn dispatch_count(&self) -> usize {
        0
    }

    fn num_output_elements(&self) -> usize {
        0
    }
}

#[test]
fn sources_resolve_before_computations_execute() {
    let registry = RegistryTable::new(PerfCollector::new()).get_or_create(FakeDevice::new());
    let log: EventLog = Arc::default();
    let range = Arc::new(BufferArrayRange::new(0));

    // Scheduled in the "wrong" order on purpose.
    registry.add_computation(
        range,
        LoggingComputation::new("skin", &log),
        ComputeQueue::Zero,
    );
    registry.add_source(LoggingSource::new("points", &log));
    registry.commit();

    let events = log.lock().unwrap().clone();
    assert_eq!(events, vec!["source:points", "compute:skin"]);
}

#[test]
fn computations_run_in_queue_order() {
    let registry = RegistryTable::new(PerfCollector::new()).get_or_create(FakeDevice::new());
    let log: EventLog = Arc::default();
    let range = Arc::new(BufferArrayRange::new(0));

    registry.add_computation(
        range.clone(),
        LoggingComputation::new("late", &log),
        ComputeQueue::Two,
    );
    registry.add_computation(
        range.clone(),
        LoggingComputation::new("early", &log),
        ComputeQueue::Zero,
    );
    registry.add_computation(range, LoggingComputation::new("mid", &log), ComputeQueue::One);
    registry.commit();

    let events = log.lock().unwrap().clone();
    assert_eq!(events, vec!["compute:early", "compute:mid", "compute:late"]);
}

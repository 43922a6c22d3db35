// Copyright 2025 the Apollo Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end skinning scenario over two frames: one build of everything on
//! the first frame, reuse plus one more dispatch on the second.

use std::sync::Arc;

use apollo::perf::PerfCollector;
use apollo::{
    BufferSpec, ComputationBufferSource, ComputationPrimvarDesc, ComputationResource,
    ComputeDevice, ComputeKernel, ComputeQueue, GpuComputation, RegistryTable, ScenePath,
    TupleType,
};
use apollo_tests::{CountingSource, FakeDevice, make_range};

#[test]
fn skinning_two_frames() {
    let collector = PerfCollector::new();
    let table = RegistryTable::new(collector.clone());
    let device = FakeDevice::new();
    let registry = table.get_or_create(device.clone());

    let input_range = make_range(
        0,
        &[
            ("restPoints", TupleType::POINT3F),
            ("skinningWeights", TupleType::VEC4F),
        ],
    );
    let resource = Arc::new(ComputationResource::new(
        vec![BufferSpec::new("skinnedPoints", TupleType::POINT3F)],
        ComputeKernel::new("skinning", "fn main() {}"),
        vec![input_range],
        registry.clone(),
    ));
    let computation = Arc::new(GpuComputation::new(
        ScenePath::new("/scene/character/mesh"),
        resource.clone(),
        vec![ComputationPrimvarDesc {
            name: "skinnedPoints".to_owned(),
            source_computation_id: ScenePath::new("/scene/character/skinning"),
            source_output_name: "skinnedPoints".to_owned(),
            value_type: TupleType::POINT3F,
        }],
        1000,
        1000,
    ));
    let output_range = make_range(0, &[("skinnedPoints", TupleType::POINT3F)]);

    // Frame 1: dirty primvar, everything built once.
    let upload = CountingSource::new("restPoints");
    registry.add_source(Arc::new(ComputationBufferSource::new(
        vec![upload.clone()],
        resource.clone(),
    )));
    registry.add_computation(output_range.clone(), computation.clone(), ComputeQueue::Zero);
    registry.commit();

    assert_eq!(upload.commits(), 1);
    assert_eq!(device.compile_calls(), 1);
    assert_eq!(device.pipeline_calls(), 1);
    assert_eq!(device.bindings_calls(), 1);
    assert_eq!(device.cmds.dispatches(), vec![(1000, 1)]);

    // Frame 2: still dirty, buffers unchanged. A fresh buffer source is
    // created per pass; everything GPU-side is reused.
    let upload2 = CountingSource::new("restPoints");
    registry.add_source(Arc::new(ComputationBufferSource::new(
        vec![upload2.clone()],
        resource,
    )));
    registry.add_computation(output_range, computation, ComputeQueue::Zero);
    registry.commit();

    assert_eq!(upload2.commits(), 1);
    assert_eq!(device.compile_calls(), 1);
    assert_eq!(device.pipeline_calls(), 1);
    assert_eq!(device.bindings_calls(), 1);
    assert_eq!(device.cmds.dispatches(), vec![(1000, 1), (1000, 1)]);

    let counters = collector
        .counters(device.id())
        .expect("registry should be registered");
    assert_eq!(counters.programs_compiled(), 1);
    assert_eq!(counters.compute_pipelines_created(), 1);
    assert_eq!(counters.resource_bindings_created(), 1);
    assert_eq!(counters.dispatches_issued(), 2);
}

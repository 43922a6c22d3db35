// Copyright 2025 the Apollo Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Cache behavior of the per-device registry: program and pipeline
//! de-duplication, binding-hash sensitivity, and retry after a failed
//! build.

use std::sync::Arc;

use apollo::perf::PerfCollector;
use apollo::{
    BufferSpec, ComputationPrimvarDesc, ComputationResource, ComputeKernel, GpuComputation,
    RegistryTable, ResourceRegistry, ScenePath, TupleType,
};
use apollo_tests::{FakeDevice, make_range};

fn primvar(name: &str) -> ComputationPrimvarDesc {
    ComputationPrimvarDesc {
        name: name.to_owned(),
        source_computation_id: ScenePath::new("/scene/skinning"),
        source_output_name: name.to_owned(),
        value_type: TupleType::POINT3F,
    }
}

fn skinning_resource(registry: &Arc<ResourceRegistry>) -> Arc<ComputationResource> {
    Arc::new(ComputationResource::new(
        vec![BufferSpec::new("skinnedPoints", TupleType::POINT3F)],
        ComputeKernel::new("skinning", "fn main() {}"),
        vec![make_range(
            0,
            &[
                ("restPoints", TupleType::POINT3F),
                ("skinningWeights", TupleType::VEC4F),
            ],
        )],
        registry.clone(),
    ))
}

#[test]
fn identical_kernels_share_one_program() {
    let device = FakeDevice::new();
    let registry = RegistryTable::new(PerfCollector::new()).get_or_create(device.clone());

    let a = skinning_resource(&registry);
    let b = skinning_resource(&registry);
    assert!(a.resolve());
    assert!(b.resolve());

    assert_eq!(device.compile_calls(), 1);
    assert_eq!(registry.cached_program_count(), 1);
    let (Some(pa), Some(pb)) = (a.program(), b.program()) else {
        panic!("both resources should be resolved");
    };
    assert_eq!(pa.handle, pb.handle);
}

#[test]
fn computations_sharing_program_and_block_size_share_one_pipeline() {
    let device = FakeDevice::new();
    let registry = RegistryTable::new(PerfCollector::new()).get_or_create(device.clone());

    let resource = skinning_resource(&registry);
    assert!(resource.resolve());

    let comp_a = GpuComputation::new(
        ScenePath::new("/scene/meshA"),
        resource.clone(),
        vec![primvar("skinnedPoints")],
        100,
        100,
    );
    let comp_b = GpuComputation::new(
        ScenePath::new("/scene/meshB"),
        resource,
        vec![primvar("skinnedPoints")],
        100,
        100,
    );
    let range_a = make_range(0, &[("skinnedPoints", TupleType::POINT3F)]);
    let range_b = make_range(0, &[("skinnedPoints", TupleType::POINT3F)]);

    use apollo::Computation as _;
    comp_a.execute(&range_a, &registry);
    comp_b.execute(&range_b, &registry);

    // Same program identity and constant-block size, so one pipeline; the
    // output buffers differ, so two binding sets.
    assert_eq!(device.pipeline_calls(), 1);
    assert_eq!(registry.cached_compute_pipeline_count(), 1);
    assert_eq!(device.bindings_calls(), 2);
    assert_eq!(device.cmds.dispatches(), vec![(100, 1), (100, 1)]);
}

#[test]
fn binding_hash_follows_buffer_identity() {
    let device = FakeDevice::new();
    let registry = RegistryTable::new(PerfCollector::new()).get_or_create(device.clone());

    let resource = skinning_resource(&registry);
    assert!(resource.resolve());
    let comp = GpuComputation::new(
        ScenePath::new("/scene/mesh"),
        resource,
        vec![primvar("skinnedPoints")],
        10,
        10,
    );
    let range_a = make_range(0, &[("skinnedPoints", TupleType::POINT3F)]);
    let range_b = make_range(0, &[("skinnedPoints", TupleType::POINT3F)]);

    use apollo::Computation as _;
    comp.execute(&range_a, &registry);
    assert_eq!(device.bindings_calls(), 1);

    // A different output buffer identity is a different binding set.
    comp.execute(&range_b, &registry);
    assert_eq!(device.bindings_calls(), 2);

    // Returning to the original buffers reproduces the original hash.
    comp.execute(&range_a, &registry);
    assert_eq!(device.bindings_calls(), 2);
    assert_eq!(device.pipeline_calls(), 1);
}

#[test]
fn failed_compile_is_not_cached() {
    let device = FakeDevice::new();
    let registry = RegistryTable::new(PerfCollector::new()).get_or_create(device.clone());
    let resource = skinning_resource(&registry);

    device.set_fail_compile(true);
    assert!(!resource.resolve());
    assert!(!resource.is_resolved());
    assert_eq!(device.compile_calls(), 1);
    assert_eq!(registry.cached_program_count(), 0);

    // The next pass retries and succeeds.
    device.set_fail_compile(false);
    assert!(resource.resolve());
    assert_eq!(device.compile_calls(), 2);
    assert_eq!(registry.cached_program_count(), 1);
}

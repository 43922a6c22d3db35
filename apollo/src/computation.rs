// Copyright 2025 the Apollo Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The per-frame dispatchable unit of a GPU ext-computation.
//!
//! `execute` re-derives everything that can change between frames (buffer
//! handles, offsets, strides) from the current output range and the
//! resource's input ranges, leans on the registry caches for the pipeline
//! and resource-binding set, and issues exactly one dispatch.

use std::mem::size_of;
use std::sync::Arc;

use crate::buffer::{BufferArrayRange, BufferResource, BufferSpec};
use crate::device::{
    BindingKind, BufferBindDesc, ComputePipelineDesc, ProgramBinding, ResourceBindingsDesc,
};
use crate::hash;
use crate::prepare::{ComputationPrimvarDesc, ScenePath};
use crate::registry::ResourceRegistry;
use crate::resource::ComputationResource;

/// A unit of work executed during the commit pass.
pub trait Computation: Send + Sync {
    /// Bind resources and run, writing into `output_range`.
    fn execute(&self, output_range: &Arc<BufferArrayRange>, registry: &ResourceRegistry);

    /// Append specs for any outputs this computation itself introduces.
    ///
    /// GPU computations contribute nothing here: their outputs are already
    /// described by the primvar descriptors supplied at construction.
    fn get_buffer_specs(&self, specs: &mut Vec<BufferSpec>);

    fn dispatch_count(&self) -> usize;

    fn num_output_elements(&self) -> usize;
}

/// An ext-computation dispatched on the GPU.
///
/// Dispatch count and element count are fixed at construction; `execute`
/// runs once per frame the computation is dirty and is safe to re-enter
/// every frame.
pub struct GpuComputation {
    id: ScenePath,
    resource: Arc<ComputationResource>,
    primvars: Vec<ComputationPrimvarDesc>,
    dispatch_count: usize,
    element_count: usize,
}

impl GpuComputation {
    pub fn new(
        id: ScenePath,
        resource: Arc<ComputationResource>,
        primvars: Vec<ComputationPrimvarDesc>,
        dispatch_count: usize,
        element_count: usize,
    ) -> Self {
        Self {
            id,
            resource,
            primvars,
            dispatch_count,
            element_count,
        }
    }

    pub fn id(&self) -> &ScenePath {
        &self.id
    }

    pub fn resource(&self) -> &Arc<ComputationResource> {
        &self.resource
    }

    pub fn primvars(&self) -> &[ComputationPrimvarDesc] {
        &self.primvars
    }
}

/// Validates a reflected binding and appends the bind entry for `resource`
/// at the binding's declared slot. Returns `false` if the binding was
/// dropped, so callers keep the constant block and hash in sync with the
/// bound set.
fn append_buffer_binding(
    desc: &mut ResourceBindingsDesc,
    binding: &ProgramBinding,
    resource: &BufferResource,
) -> bool {
    if binding.kind != BindingKind::StorageBuffer {
        log::error!(
            "binding '{}' has unsupported kind {:?}; dropping it",
            binding.name,
            binding.kind
        );
        return false;
    }
    desc.buffers.push(BufferBindDesc {
        buffer: resource.handle(),
        binding_index: binding.slot,
        kind: binding.kind,
        offset: 0,
    });
    true
}

impl Computation for GpuComputation {
    fn execute(&self, output_range: &Arc<BufferArrayRange>, registry: &ResourceRegistry) {
        let Some(program) = self.resource.program().cloned() else {
            // A failed or skipped resolve means the primvars keep their
            // previous contents this frame.
            log::debug!("computation '{}' has no resolved program", self.id);
            return;
        };
        let Some(binder) = self.resource.binder() else {
            return;
        };

        // Flat i32 constant block: element offset first, then layout info
        // for every bound output and input, in binding traversal order.
        let mut uniforms: Vec<i32> = Vec::new();
        uniforms.push(output_range.element_offset() as i32);

        let mut bind_descs = ResourceBindingsDesc::new("ext computation");
        let mut bindings_hash = 0_u64;

        for primvar in &self.primvars {
            // The output buffer lives under the primvar's name; the kernel
            // knows the slot by the computation's output name.
            let Some(resource) = output_range.get_resource(&primvar.name) else {
                continue;
            };
            // A name absent from the compiled layout is an unused kernel
            // parameter, not an error.
            let Some(binding) = binder.get_binding(&primvar.source_output_name) else {
                continue;
            };
            if !append_buffer_binding(&mut bind_descs, binding, resource) {
                continue;
            }
            let component_size = resource.tuple_type().component_size();
            uniforms.push((resource.offset() / component_size) as i32);
            uniforms.push((resource.stride() / component_size) as i32);
            bindings_hash = hash::combine(bindings_hash, &resource.handle());
        }

        for input_range in self.resource.inputs() {
            for entry in input_range.entries() {
                let Some(binding) = binder.get_binding(&entry.name) else {
                    continue;
                };
                if !append_buffer_binding(&mut bind_descs, binding, &entry.resource) {
                    continue;
                }
                let tuple_type = entry.resource.tuple_type();
                let component_size = tuple_type.component_size();
                uniforms
                    .push(((entry.byte_offset + entry.resource.offset()) / component_size) as i32);
                uniforms.push(tuple_type.count as i32);
                bindings_hash = hash::combine(bindings_hash, &entry.resource.handle());
            }
        }

        let constants_byte_size = uniforms.len() * size_of::<i32>();

        let pipeline_hash = hash::combine(hash::of(&program.handle), &constants_byte_size);
        let mut pipeline_instance = registry.register_compute_pipeline(pipeline_hash);
        if pipeline_instance.is_first_instance() {
            let handle = registry.device().create_compute_pipeline(&ComputePipelineDesc {
                label: "ext computation",
                program: program.handle,
                constants_byte_size,
            });
            registry.counters().count_compute_pipeline_created();
            pipeline_instance.set_value(Arc::new(handle));
        }
        let Some(pipeline) = pipeline_instance.value().map(|p| **p) else {
            return;
        };
        drop(pipeline_instance);

        let mut bindings_instance = registry.register_resource_bindings(bindings_hash);
        if bindings_instance.is_first_instance() {
            let handle = registry.device().create_resource_bindings(&bind_descs);
            registry.counters().count_resource_bindings_created();
            bindings_instance.set_value(Arc::new(handle));
        }
        let Some(bindings) = bindings_instance.value().map(|b| **b) else {
            return;
        };
        drop(bindings_instance);

        let cmds = registry.device().compute_cmds();
        cmds.push_debug_group(&self.resource.kernel().label);
        cmds.bind_resources(bindings);
        cmds.bind_pipeline(pipeline);
        cmds.set_constant_values(pipeline, 0, bytemuck::cast_slice(&uniforms));
        cmds.dispatch(self.dispatch_count as u32, 1);
        cmds.pop_debug_group();
        registry.counters().count_dispatch_issued();
    }

    fn get_buffer_specs(&self, _specs: &mut Vec<BufferSpec>) {}

    fn dispatch_count(&self) -> usize {
        self.dispatch_count
    }

    fn num_output_elements(&self) -> usize {
        self.element_count
    }
}

// Copyright 2025 the Apollo Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Render-delegate orchestration: turn dirty ext-computation primvars into
//! scheduled computations and buffer sources.
//!
//! The scene delegate reports which primvars are dirty and which source
//! computation produces each one. [`prepare_computations`] groups the dirty
//! primvars by source computation, builds one [`GpuComputation`] and one
//! [`ComputationBufferSource`] per group with a device kernel, and routes
//! kernel-less groups to the host's CPU path untouched.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::buffer::{BufferArrayRange, BufferSpec, TupleType};
use crate::computation::GpuComputation;
use crate::registry::{ComputeQueue, ResourceRegistry};
use crate::resource::{ComputationResource, ComputeKernel};
use crate::source::{BufferSource, ComputationBufferSource};

/// Path of a prim or computation in the scene index.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ScenePath(pub String);

impl ScenePath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }
}

impl fmt::Display for ScenePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A primvar produced by an ext-computation, as declared by the scene.
#[derive(Clone, Debug)]
pub struct ComputationPrimvarDesc {
    /// Name of the primvar (and of the output buffer it lands in).
    pub name: String,
    pub source_computation_id: ScenePath,
    /// Name of the computation output feeding this primvar.
    pub source_output_name: String,
    pub value_type: TupleType,
}

/// An ext-computation as declared by the scene.
///
/// An empty kernel source means the computation runs on the CPU; its
/// primvars are handed back to the host instead of being scheduled here.
pub struct ExtComputation {
    pub id: ScenePath,
    pub kernel: ComputeKernel,
    pub element_count: usize,
    pub dispatch_count: usize,
    /// The computation's own GPU-resident input range, if it has one.
    pub input_range: Option<Arc<BufferArrayRange>>,
    /// Upstream computations whose inputs this one also reads.
    pub computation_inputs: Vec<ScenePath>,
    /// Scene-provided sources that upload this computation's input data.
    pub input_sources: Vec<Arc<dyn BufferSource>>,
}

/// The ext-computations visible to one prepare pass, by path.
#[derive(Default)]
pub struct SceneIndex {
    computations: BTreeMap<ScenePath, Arc<ExtComputation>>,
}

impl SceneIndex {
    pub fn insert(&mut self, computation: Arc<ExtComputation>) {
        self.computations.insert(computation.id.clone(), computation);
    }

    pub fn get(&self, id: &ScenePath) -> Option<&Arc<ExtComputation>> {
        self.computations.get(id)
    }
}

/// A primvar whose space must be reserved in the prim's output range before
/// the commit pass runs; the computation fills it in.
#[derive(Clone, Debug)]
pub struct PrimvarReservation {
    pub name: String,
    pub value_type: TupleType,
    pub element_count: usize,
}

/// Everything one prepare pass schedules for a prim.
#[derive(Default)]
pub struct PreparedComputations {
    /// Buffer sources to hand to the registry for the commit phase.
    pub sources: Vec<Arc<dyn BufferSource>>,
    /// Output-range reservations, one per dirty GPU-computed primvar.
    pub reservations: Vec<PrimvarReservation>,
    /// Computations to schedule, with their commit sub-phase.
    pub computations: Vec<(Arc<GpuComputation>, ComputeQueue)>,
    /// Dirty primvars whose computation has no device kernel; the host's
    /// CPU path handles these.
    pub cpu_primvars: Vec<ComputationPrimvarDesc>,
}

/// Group `primvars` that `is_dirty` reports dirty by source computation and
/// build the GPU computations and buffer sources for this pass.
///
/// Groups whose computation has zero output elements are skipped entirely.
/// Grouping iterates computations in path order, so two passes over the
/// same scene schedule identical work in identical order.
pub fn prepare_computations<F>(
    prim_id: &ScenePath,
    scene: &SceneIndex,
    registry: &Arc<ResourceRegistry>,
    primvars: &[ComputationPrimvarDesc],
    is_dirty: F,
) -> PreparedComputations
where
    F: Fn(&ComputationPrimvarDesc) -> bool,
{
    let mut groups: BTreeMap<&ScenePath, Vec<&ComputationPrimvarDesc>> = BTreeMap::new();
    for primvar in primvars.iter().filter(|p| is_dirty(p)) {
        groups
            .entry(&primvar.source_computation_id)
            .or_default()
            .push(primvar);
    }

    let mut prepared = PreparedComputations::default();
    for (comp_id, group) in groups {
        let Some(computation) = scene.get(comp_id) else {
            log::warn!("prim '{prim_id}' references unknown computation '{comp_id}'");
            continue;
        };
        if computation.element_count == 0 {
            continue;
        }
        if computation.kernel.source.is_empty() {
            prepared.cpu_primvars.extend(group.iter().copied().cloned());
            continue;
        }

        // The kernel declares its outputs by computation output name, which
        // may differ from the primvar name the result is published under.
        let output_specs: Vec<BufferSpec> = group
            .iter()
            .map(|p| BufferSpec::new(p.source_output_name.clone(), p.value_type))
            .collect();

        let mut inputs: Vec<Arc<BufferArrayRange>> = Vec::new();
        let mut add_input = |range: &Arc<BufferArrayRange>, inputs: &mut Vec<_>| {
            if !inputs.iter().any(|r| Arc::ptr_eq(r, range)) {
                inputs.push(range.clone());
            }
        };
        if let Some(range) = &computation.input_range {
            add_input(range, &mut inputs);
        }
        for upstream_id in &computation.computation_inputs {
            let Some(upstream) = scene.get(upstream_id) else {
                log::warn!("computation '{comp_id}' references unknown input '{upstream_id}'");
                continue;
            };
            if let Some(range) = &upstream.input_range {
                add_input(range, &mut inputs);
            }
        }

        let resource = Arc::new(ComputationResource::new(
            output_specs,
            computation.kernel.clone(),
            inputs,
            registry.clone(),
        ));

        for primvar in &group {
            prepared.reservations.push(PrimvarReservation {
                name: primvar.name.clone(),
                value_type: primvar.value_type,
                element_count: computation.element_count,
            });
        }

        let gpu = Arc::new(GpuComputation::new(
            computation.id.clone(),
            resource.clone(),
            group.iter().copied().cloned().collect(),
            computation.dispatch_count,
            computation.element_count,
        ));
        let source = Arc::new(ComputationBufferSource::new(
            computation.input_sources.clone(),
            resource,
        ));

        prepared.sources.push(source);
        prepared.computations.push((gpu, ComputeQueue::Zero));
    }
    prepared
}

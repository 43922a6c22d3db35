// Copyright 2025 the Apollo Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The shared, resolve-once resource behind a GPU ext-computation: the
//! compiled program for its kernel and the binder mapping named buffers to
//! the program's binding slots.

use std::sync::{Arc, OnceLock};

use crate::buffer::{BufferArrayRange, BufferSpec};
use crate::device::{BindingKind, CompiledProgram, ComputeProgramDesc, ProgramBinding};
use crate::hash;
use crate::registry::ResourceRegistry;

/// A compute kernel as declared by the scene: a label for diagnostics and
/// the shader source text.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ComputeKernel {
    pub label: String,
    pub source: String,
}

impl ComputeKernel {
    pub fn new(label: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            source: source.into(),
        }
    }

    pub fn hash_value(&self) -> u64 {
        hash::of(&self.source)
    }
}

/// Maps buffer names to the binding slots a compiled program actually uses.
///
/// A name absent from the program's reflected layout yields `None`; callers
/// treat that as an unused kernel parameter and skip the buffer rather than
/// erroring.
#[derive(Clone, Debug)]
pub struct ResourceBinder {
    program: Arc<CompiledProgram>,
}

impl ResourceBinder {
    pub fn new(program: Arc<CompiledProgram>) -> Self {
        Self { program }
    }

    pub fn get_binding(&self, name: &str) -> Option<&ProgramBinding> {
        self.program.binding(name)
    }
}

struct ResolvedKernel {
    program: Arc<CompiledProgram>,
    binder: ResourceBinder,
}

/// The GPU-side state shared by every computation using one kernel: output
/// specs, input ranges, and (after [`resolve`](Self::resolve)) the compiled
/// program and its binder.
///
/// Inputs and output specs are fixed at construction. Resolution happens at
/// most once per resource; many computations whose primvars come from the
/// same source computation share one resource through an `Arc`.
pub struct ComputationResource {
    output_specs: Vec<BufferSpec>,
    kernel: ComputeKernel,
    inputs: Vec<Arc<BufferArrayRange>>,
    registry: Arc<ResourceRegistry>,
    resolved: OnceLock<ResolvedKernel>,
}

impl ComputationResource {
    pub fn new(
        output_specs: Vec<BufferSpec>,
        kernel: ComputeKernel,
        inputs: Vec<Arc<BufferArrayRange>>,
        registry: Arc<ResourceRegistry>,
    ) -> Self {
        Self {
            output_specs,
            kernel,
            inputs,
            registry,
            resolved: OnceLock::new(),
        }
    }

    /// Compile (or fetch from the program cache) the kernel's program and
    /// build the resource binder.
    ///
    /// Returns `false` on compilation failure, leaving the resource
    /// unresolved so the next commit pass retries. The program cache key is
    /// folded over the kernel source and every output and input spec, so two
    /// kernels only share a program when their generated accessors agree.
    pub fn resolve(&self) -> bool {
        if self.resolved.get().is_some() {
            return true;
        }

        let mut input_specs = Vec::new();
        for range in &self.inputs {
            range.get_buffer_specs(&mut input_specs);
        }

        let mut source_hash = self.kernel.hash_value();
        for spec in self.output_specs.iter().chain(&input_specs) {
            source_hash = hash::combine(source_hash, &spec.hash_value());
        }

        let mut instance = self.registry.register_program(source_hash);
        if instance.is_first_instance() {
            let mut bindings = Vec::with_capacity(self.output_specs.len() + input_specs.len());
            for spec in self.output_specs.iter().chain(&input_specs) {
                bindings.push((spec.clone(), BindingKind::StorageBuffer));
            }
            let desc = ComputeProgramDesc {
                label: self.kernel.label.clone(),
                source: self.kernel.source.clone(),
                bindings,
            };
            match self.registry.device().compile_program(&desc) {
                Ok(program) => {
                    self.registry.counters().count_program_compiled();
                    instance.set_value(Arc::new(program));
                }
                Err(err) => {
                    log::warn!("failed to compile kernel '{}': {err}", self.kernel.label);
                    return false;
                }
            }
        }
        let Some(program) = instance.value().cloned() else {
            return false;
        };
        drop(instance);

        let binder = ResourceBinder::new(program.clone());
        let _ = self.resolved.set(ResolvedKernel { program, binder });
        true
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.get().is_some()
    }

    /// The compiled program; `None` until a successful
    /// [`resolve`](Self::resolve).
    pub fn program(&self) -> Option<&Arc<CompiledProgram>> {
        self.resolved.get().map(|r| &r.program)
    }

    /// The resource binder; `None` until a successful
    /// [`resolve`](Self::resolve).
    pub fn binder(&self) -> Option<&ResourceBinder> {
        self.resolved.get().map(|r| &r.binder)
    }

    pub fn kernel(&self) -> &ComputeKernel {
        &self.kernel
    }

    pub fn output_specs(&self) -> &[BufferSpec] {
        &self.output_specs
    }

    pub fn inputs(&self) -> &[Arc<BufferArrayRange>] {
        &self.inputs
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }
}

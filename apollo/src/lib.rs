// Copyright 2025 the Apollo Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Apollo's GPU ext-computation engine.
//!
//! Scene-declared computations (skinning, deformation, procedural primvar
//! generation) are turned into compiled compute pipelines, GPU-resident
//! input buffers, and dispatched compute work, with per-device caches
//! de-duplicating pipelines and resource-binding sets across the scene.
//!
//! ## Shape of a frame
//!
//! The host render delegate drives a per-frame commit pass:
//!
//! 1. [`prepare_computations`] groups the frame's dirty primvars by source
//!    computation and builds a [`GpuComputation`] plus a
//!    [`ComputationBufferSource`] per group with a device kernel.
//! 2. The host schedules those on the device's [`ResourceRegistry`]
//!    (obtained from the [`RegistryTable`]) and calls
//!    [`ResourceRegistry::commit`], which resolves every buffer source and
//!    then executes every computation in queue order.
//! 3. Each execution hashes its buffer bindings, fetches or lazily builds
//!    the pipeline and resource-binding set through the registry caches,
//!    uploads a small constant block of offsets and strides, and issues one
//!    dispatch.
//!
//! The engine talks to the GPU only through the [`ComputeDevice`] trait;
//! the `wgpu` feature (on by default) provides the
//! [`wgpu_device::WgpuDevice`] backend.

// LINEBENDER LINT SET - lib.rs - v1
// See https://linebender.org/wiki/canonical-lints/
// These lints aren't included in Cargo.toml because they
// shouldn't apply to examples and tests
#![warn(unused_crate_dependencies)]
#![warn(clippy::print_stdout, clippy::print_stderr)]
// END LINEBENDER LINT SET
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod buffer;
pub mod computation;
pub mod device;
pub mod hash;
pub mod perf;
pub mod prepare;
pub mod registry;
pub mod resource;
pub mod source;
#[cfg(feature = "wgpu")]
pub mod wgpu_device;

pub use buffer::{BufferArrayRange, BufferResource, BufferSpec, ComponentType, TupleType};
pub use computation::{Computation, GpuComputation};
pub use device::{
    BindingKind, BufferHandle, CompiledProgram, ComputeCmds, ComputeDevice, ComputePipelineHandle,
    DeviceId, ProgramHandle, ResourceBindingsHandle, ResourceId,
};
pub use prepare::{
    ComputationPrimvarDesc, ExtComputation, PreparedComputations, PrimvarReservation, SceneIndex,
    ScenePath, prepare_computations,
};
pub use registry::{ComputeQueue, Instance, RegistryTable, ResourceRegistry};
pub use resource::{ComputationResource, ComputeKernel, ResourceBinder};
pub use source::{BufferSource, ComputationBufferSource};

/// Errors that can occur in the device layer.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Kernel compilation failed; the computation's primvars are not
    /// updated this frame.
    #[error("failed to compile kernel '{label}': {message}")]
    KernelCompilation { label: String, message: String },

    /// A bind or copy referenced a buffer the device does not own.
    #[error("unknown buffer handle {0:?}")]
    UnknownBuffer(BufferHandle),

    /// Reading a buffer back to the host failed.
    #[error("failed to read back buffer: {0}")]
    BufferReadback(String),
}

/// Specialization of `Result` for the engine's errors.
pub type Result<T, E = Error> = std::result::Result<T, E>;

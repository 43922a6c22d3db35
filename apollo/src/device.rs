// Copyright 2025 the Apollo Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The GPU device abstraction consumed by the ext-computation engine.
//!
//! The engine never talks to a graphics API directly; it compiles kernels,
//! builds pipelines and resource-binding sets, and records compute commands
//! through the [`ComputeDevice`] and [`ComputeCmds`] traits. The `wgpu`
//! backend lives in [`crate::wgpu_device`]; tests substitute call-counting
//! fakes.

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::Result;
use crate::buffer::BufferSpec;

/// Process-unique identity for a GPU-resident object.
///
/// Identities are stable for the lifetime of the object and usable as hash
/// input, which is what the binding/pipeline caches key on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ResourceId(pub NonZeroU64);

impl ResourceId {
    pub fn next() -> Self {
        // We initialize with 1 so that the conversion below succeeds
        static ID_COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(NonZeroU64::new(ID_COUNTER.fetch_add(1, Ordering::Relaxed)).unwrap())
    }
}

/// Identity of a logical GPU device; one resource registry exists per device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct DeviceId(pub NonZeroU64);

impl DeviceId {
    pub fn next() -> Self {
        static ID_COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(NonZeroU64::new(ID_COUNTER.fetch_add(1, Ordering::Relaxed)).unwrap())
    }
}

/// Opaque handle to a GPU buffer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BufferHandle(pub ResourceId);

impl BufferHandle {
    pub fn new() -> Self {
        Self(ResourceId::next())
    }
}

impl Default for BufferHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque handle to a compiled compute program (shader instance).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ProgramHandle(pub ResourceId);

impl ProgramHandle {
    pub fn new() -> Self {
        Self(ResourceId::next())
    }
}

impl Default for ProgramHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque handle to a compiled compute pipeline.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ComputePipelineHandle(pub ResourceId);

impl ComputePipelineHandle {
    pub fn new() -> Self {
        Self(ResourceId::next())
    }
}

impl Default for ComputePipelineHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque handle to a resource-binding set.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ResourceBindingsHandle(pub ResourceId);

impl ResourceBindingsHandle {
    pub fn new() -> Self {
        Self(ResourceId::next())
    }
}

impl Default for ResourceBindingsHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// The kind of resource a kernel expects at a binding slot.
///
/// Every ext-computation input and output is a storage buffer; anything else
/// reported by a compiled layout is a runtime error at bind time.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum BindingKind {
    /// A storage buffer with read/write access.
    StorageBuffer,
    /// A small buffer of uniform values.
    UniformBuffer,
}

/// Describes a compute kernel to compile, together with the buffer layout
/// (outputs first, then inputs) the generated accessors are expected to use.
#[derive(Clone, Debug)]
pub struct ComputeProgramDesc {
    pub label: String,
    pub source: String,
    /// Declared binding slots in slot order.
    pub bindings: Vec<(BufferSpec, BindingKind)>,
}

/// One named slot of a compiled program's reflected layout.
#[derive(Clone, Debug)]
pub struct ProgramBinding {
    pub name: String,
    pub slot: u32,
    pub kind: BindingKind,
}

/// A compiled compute program and the layout it reported.
///
/// Slots absent from `bindings` are parameters the kernel does not use;
/// the resource binder skips them rather than erroring.
#[derive(Clone, Debug)]
pub struct CompiledProgram {
    pub handle: ProgramHandle,
    pub bindings: Vec<ProgramBinding>,
}

impl CompiledProgram {
    pub fn binding(&self, name: &str) -> Option<&ProgramBinding> {
        self.bindings.iter().find(|b| b.name == name)
    }
}

/// Describes a compute pipeline: a compiled program plus the byte size of the
/// constant block uploaded at dispatch time.
#[derive(Clone, Copy, Debug)]
pub struct ComputePipelineDesc {
    pub label: &'static str,
    pub program: ProgramHandle,
    pub constants_byte_size: usize,
}

/// One buffer attached to a binding slot of a resource-binding set.
#[derive(Clone, Copy, Debug)]
pub struct BufferBindDesc {
    pub buffer: BufferHandle,
    pub binding_index: u32,
    pub kind: BindingKind,
    pub offset: u64,
}

/// Describes a full resource-binding set for one dispatch.
#[derive(Clone, Debug)]
pub struct ResourceBindingsDesc {
    pub label: &'static str,
    pub buffers: Vec<BufferBindDesc>,
}

impl ResourceBindingsDesc {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            buffers: Vec::new(),
        }
    }
}

/// Recorded compute-command surface.
///
/// Recording is interior-mutable so that a single global command stream can
/// be shared by every computation executed in a commit pass; submission
/// (and any waiting) is the device owner's concern.
pub trait ComputeCmds {
    fn push_debug_group(&self, label: &str);
    fn bind_resources(&self, bindings: ResourceBindingsHandle);
    fn bind_pipeline(&self, pipeline: ComputePipelineHandle);
    /// Upload `data` into the pipeline's constant block at `byte_offset`.
    fn set_constant_values(&self, pipeline: ComputePipelineHandle, byte_offset: u32, data: &[u8]);
    /// Queue a dispatch of `count_x` x `count_y` invocations.
    fn dispatch(&self, count_x: u32, count_y: u32);
    fn pop_debug_group(&self);
}

/// A logical GPU device.
///
/// Object construction is expensive; callers are expected to de-duplicate
/// through the per-device [`ResourceRegistry`](crate::ResourceRegistry)
/// rather than calling `create_*` directly per prim.
pub trait ComputeDevice: Send + Sync {
    fn id(&self) -> DeviceId;

    /// Compile a compute kernel, returning its reflected binding layout.
    ///
    /// Compilation failure is recoverable for the calling computation (the
    /// primvar is not updated that frame) and must not poison the device.
    fn compile_program(&self, desc: &ComputeProgramDesc) -> Result<CompiledProgram>;

    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc) -> ComputePipelineHandle;

    fn create_resource_bindings(&self, desc: &ResourceBindingsDesc) -> ResourceBindingsHandle;

    /// The global command stream shared by all computations on this device.
    fn compute_cmds(&self) -> &dyn ComputeCmds;
}

// Copyright 2025 the Apollo Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Test infrastructure for the ext-computation engine: a call-counting fake
//! device with a scriptable compiler, a counting buffer source, and range
//! builders shared by the integration tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use apollo::device::{
    BindingKind, CompiledProgram, ComputeCmds, ComputeDevice, ComputePipelineDesc,
    ComputePipelineHandle, ComputeProgramDesc, DeviceId, ProgramBinding, ProgramHandle,
    ResourceBindingsDesc, ResourceBindingsHandle,
};
use apollo::{
    BufferArrayRange, BufferHandle, BufferResource, BufferSource, Error, TupleType,
};

/// One recorded compute command.
#[derive(Clone, PartialEq, Debug)]
pub enum CmdEvent {
    PushDebugGroup(String),
    BindResources(ResourceBindingsHandle),
    BindPipeline(ComputePipelineHandle),
    SetConstants { byte_offset: u32, data: Vec<u8> },
    Dispatch(u32, u32),
    PopDebugGroup,
}

#[derive(Default)]
pub struct FakeCmds {
    events: Mutex<Vec<CmdEvent>>,
}

impl FakeCmds {
    pub fn events(&self) -> Vec<CmdEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn take_events(&self) -> Vec<CmdEvent> {
        std::mem::take(&mut self.events.lock().unwrap())
    }

    pub fn dispatches(&self) -> Vec<(u32, u32)> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                CmdEvent::Dispatch(x, y) => Some((*x, *y)),
                _ => None,
            })
            .collect()
    }
}

impl ComputeCmds for FakeCmds {
    fn push_debug_group(&self, label: &str) {
        self.events
            .lock()
            .unwrap()
            .push(CmdEvent::PushDebugGroup(label.to_owned()));
    }

    fn bind_resources(&self, bindings: ResourceBindingsHandle) {
        self.events
            .lock()
            .unwrap()
            .push(CmdEvent::BindResources(bindings));
    }

    fn bind_pipeline(&self, pipeline: ComputePipelineHandle) {
        self.events
            .lock()
            .unwrap()
            .push(CmdEvent::BindPipeline(pipeline));
    }

    fn set_constant_values(&self, _pipeline: ComputePipelineHandle, byte_offset: u32, data: &[u8]) {
        self.events.lock().unwrap().push(CmdEvent::SetConstants {
            byte_offset,
            data: data.to_vec(),
        });
    }

    fn dispatch(&self, count_x: u32, count_y: u32) {
        self.events
            .lock()
            .unwrap()
            .push(CmdEvent::Dispatch(count_x, count_y));
    }

    fn pop_debug_group(&self) {
        self.events.lock().unwrap().push(CmdEvent::PopDebugGroup);
    }
}

/// A `ComputeDevice` that counts every create call and records every
/// command, with a scriptable compiler.
///
/// By default compilation reflects every declared binding as a storage
/// buffer at its declared slot. Tests can omit names from the reflected
/// layout, force names to reflect as uniform buffers, or make compilation
/// fail entirely.
pub struct FakeDevice {
    id: DeviceId,
    compile_calls: AtomicUsize,
    pipeline_calls: AtomicUsize,
    bindings_calls: AtomicUsize,
    missing_bindings: Mutex<HashSet<String>>,
    uniform_bindings: Mutex<HashSet<String>>,
    fail_compile: AtomicBool,
    pub cmds: FakeCmds,
}

impl FakeDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: DeviceId::next(),
            compile_calls: AtomicUsize::new(0),
            pipeline_calls: AtomicUsize::new(0),
            bindings_calls: AtomicUsize::new(0),
            missing_bindings: Mutex::new(HashSet::new()),
            uniform_bindings: Mutex::new(HashSet::new()),
            fail_compile: AtomicBool::new(false),
            cmds: FakeCmds::default(),
        })
    }

    /// Leave `name` out of every reflected layout, as a kernel that does
    /// not reference that parameter would.
    pub fn omit_binding(&self, name: &str) {
        self.missing_bindings.lock().unwrap().insert(name.to_owned());
    }

    /// Reflect `name` as a uniform buffer instead of a storage buffer.
    pub fn reflect_as_uniform(&self, name: &str) {
        self.uniform_bindings.lock().unwrap().insert(name.to_owned());
    }

    pub fn set_fail_compile(&self, fail: bool) {
        self.fail_compile.store(fail, Ordering::Relaxed);
    }

    pub fn compile_calls(&self) -> usize {
        self.compile_calls.load(Ordering::Relaxed)
    }

    pub fn pipeline_calls(&self) -> usize {
        self.pipeline_calls.load(Ordering::Relaxed)
    }

    pub fn bindings_calls(&self) -> usize {
        self.bindings_calls.load(Ordering::Relaxed)
    }
}

impl ComputeDevice for FakeDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn compile_program(&self, desc: &ComputeProgramDesc) -> apollo::Result<CompiledProgram> {
        self.compile_calls.fetch_add(1, Ordering::Relaxed);
        if self.fail_compile.load(Ordering::Relaxed) {
            return Err(Error::KernelCompilation {
                label: desc.label.clone(),
                message: "forced failure".to_owned(),
            });
        }
        let missing = self.missing_bindings.lock().unwrap();
        let uniforms = self.uniform_bindings.lock().unwrap();
        let mut bindings = Vec::new();
        for (slot, (spec, kind)) in desc.bindings.iter().enumerate() {
            if missing.contains(&spec.name) {
                continue;
            }
            let kind = if uniforms.contains(&spec.name) {
                BindingKind::UniformBuffer
            } else {
                *kind
            };
            bindings.push(ProgramBinding {
                name: spec.name.clone(),
                slot: slot as u32,
                kind,
            });
        }
        Ok(CompiledProgram {
            handle: ProgramHandle::new(),
            bindings,
        })
    }

    fn create_compute_pipeline(&self, _desc: &ComputePipelineDesc) -> ComputePipelineHandle {
        self.pipeline_calls.fetch_add(1, Ordering::Relaxed);
        ComputePipelineHandle::new()
    }

    fn create_resource_bindings(&self, _desc: &ResourceBindingsDesc) -> ResourceBindingsHandle {
        self.bindings_calls.fetch_add(1, Ordering::Relaxed);
        ResourceBindingsHandle::new()
    }

    fn compute_cmds(&self) -> &dyn ComputeCmds {
        &self.cmds
    }
}

/// A buffer source that counts how often its commit side effect runs.
pub struct CountingSource {
    name: String,
    valid: bool,
    result: bool,
    commits: AtomicUsize,
    resolved: Mutex<Option<bool>>,
}

impl CountingSource {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            valid: true,
            result: true,
            commits: AtomicUsize::new(0),
            resolved: Mutex::new(None),
        })
    }

    pub fn failing(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            valid: true,
            result: false,
            commits: AtomicUsize::new(0),
            resolved: Mutex::new(None),
        })
    }

    pub fn invalid(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            valid: false,
            result: true,
            commits: AtomicUsize::new(0),
            resolved: Mutex::new(None),
        })
    }

    /// How many times the commit side effect actually ran.
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::Relaxed)
    }
}

impl BufferSource for CountingSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolve(&self) -> bool {
        let mut state = self.resolved.lock().unwrap();
        if let Some(result) = *state {
            return result;
        }
        self.commits.fetch_add(1, Ordering::Relaxed);
        *state = Some(self.result);
        self.result
    }

    fn is_resolved(&self) -> bool {
        self.resolved.lock().unwrap().is_some()
    }

    fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Build a range whose named resources all live in fresh buffers with the
/// given element types, densely packed from offset zero.
pub fn make_range(element_offset: usize, resources: &[(&str, TupleType)]) -> Arc<BufferArrayRange> {
    let mut range = BufferArrayRange::new(element_offset);
    for (name, tuple_type) in resources {
        let resource = Arc::new(BufferResource::new(
            BufferHandle::new(),
            *tuple_type,
            0,
            tuple_type.byte_size(),
        ));
        range.add_resource(*name, 0, resource);
    }
    Arc::new(range)
}

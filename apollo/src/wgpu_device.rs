// Copyright 2025 the Apollo Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The `wgpu` backend of the device abstraction.
//!
//! Kernels are WGSL. Compilation parses the source with naga and reflects
//! which of the declared binding slots the kernel actually uses; the bind
//! group layout is built from those slots only, in slot order. Constant
//! blocks are uploaded as push constants, so devices must be requested with
//! [`WgpuDevice::required_features`]. Compute commands are recorded into a
//! CPU-side list and replayed into a single compute pass on
//! [`submit`](WgpuDevice::submit).

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::device::{
    BindingKind, BufferHandle, CompiledProgram, ComputeCmds, ComputeDevice, ComputePipelineDesc,
    ComputePipelineHandle, ComputeProgramDesc, DeviceId, ProgramBinding, ProgramHandle,
    ResourceBindingsDesc, ResourceBindingsHandle,
};
use crate::{Error, Result};

struct ProgramEntry {
    module: wgpu::ShaderModule,
    layout: wgpu::BindGroupLayout,
}

enum Command {
    PushDebugGroup(String),
    BindResources(ResourceBindingsHandle),
    BindPipeline(ComputePipelineHandle),
    SetConstants { byte_offset: u32, data: Vec<u8> },
    Dispatch(u32, u32),
    PopDebugGroup,
}

#[derive(Default)]
struct RecordedCmds {
    commands: Mutex<Vec<Command>>,
}

impl ComputeCmds for RecordedCmds {
    fn push_debug_group(&self, label: &str) {
        self.commands
            .lock()
            .unwrap()
            .push(Command::PushDebugGroup(label.to_owned()));
    }

    fn bind_resources(&self, bindings: ResourceBindingsHandle) {
        self.commands
            .lock()
            .unwrap()
            .push(Command::BindResources(bindings));
    }

    fn bind_pipeline(&self, pipeline: ComputePipelineHandle) {
        self.commands
            .lock()
            .unwrap()
            .push(Command::BindPipeline(pipeline));
    }

    fn set_constant_values(&self, _pipeline: ComputePipelineHandle, byte_offset: u32, data: &[u8]) {
        self.commands.lock().unwrap().push(Command::SetConstants {
            byte_offset,
            data: data.to_vec(),
        });
    }

    fn dispatch(&self, count_x: u32, count_y: u32) {
        self.commands
            .lock()
            .unwrap()
            .push(Command::Dispatch(count_x, count_y));
    }

    fn pop_debug_group(&self) {
        self.commands.lock().unwrap().push(Command::PopDebugGroup);
    }
}

/// [`ComputeDevice`] implementation over a `wgpu::Device` and `Queue`.
pub struct WgpuDevice {
    id: DeviceId,
    device: wgpu::Device,
    queue: wgpu::Queue,
    buffers: Mutex<HashMap<BufferHandle, wgpu::Buffer>>,
    programs: Mutex<HashMap<ProgramHandle, ProgramEntry>>,
    pipelines: Mutex<HashMap<ComputePipelineHandle, wgpu::ComputePipeline>>,
    bind_groups: Mutex<HashMap<ResourceBindingsHandle, wgpu::BindGroup>>,
    cmds: RecordedCmds,
}

impl WgpuDevice {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self {
            id: DeviceId::next(),
            device,
            queue,
            buffers: Mutex::new(HashMap::new()),
            programs: Mutex::new(HashMap::new()),
            pipelines: Mutex::new(HashMap::new()),
            bind_groups: Mutex::new(HashMap::new()),
            cmds: RecordedCmds::default(),
        }
    }

    /// Features the `wgpu::Device` must be requested with.
    pub fn required_features() -> wgpu::Features {
        wgpu::Features::PUSH_CONSTANTS
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Allocate a storage buffer of `size` bytes.
    pub fn create_buffer(&self, label: &str, size: u64) -> BufferHandle {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let handle = BufferHandle::new();
        self.buffers.lock().unwrap().insert(handle, buffer);
        handle
    }

    pub fn write_buffer(&self, handle: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        let buffers = self.buffers.lock().unwrap();
        let buffer = buffers.get(&handle).ok_or(Error::UnknownBuffer(handle))?;
        self.queue.write_buffer(buffer, offset, data);
        Ok(())
    }

    /// Copy a buffer back to the host. Waits for the GPU.
    pub async fn read_buffer(&self, handle: BufferHandle) -> Result<Vec<u8>> {
        let size = {
            let buffers = self.buffers.lock().unwrap();
            let buffer = buffers.get(&handle).ok_or(Error::UnknownBuffer(handle))?;
            buffer.size()
        };
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        {
            let buffers = self.buffers.lock().unwrap();
            let buffer = buffers.get(&handle).ok_or(Error::UnknownBuffer(handle))?;
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("readback"),
                });
            encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
            self.queue.submit(Some(encoder.finish()));
        }

        let slice = staging.slice(..);
        let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        receiver
            .receive()
            .await
            .ok_or_else(|| Error::BufferReadback("channel closed".to_owned()))?
            .map_err(|e| Error::BufferReadback(e.to_string()))?;
        let data = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(data)
    }

    /// Replay the recorded compute commands into one compute pass and
    /// submit it.
    pub fn submit(&self) -> Result<()> {
        let commands: Vec<Command> = {
            let mut recorded = self.cmds.commands.lock().unwrap();
            recorded.drain(..).collect()
        };
        if commands.is_empty() {
            return Ok(());
        }

        let pipelines = self.pipelines.lock().unwrap();
        let bind_groups = self.bind_groups.lock().unwrap();

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("ext computation"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("ext computation"),
                timestamp_writes: None,
            });
            for command in &commands {
                match command {
                    Command::PushDebugGroup(label) => pass.push_debug_group(label),
                    Command::BindResources(handle) => {
                        let Some(bind_group) = bind_groups.get(handle) else {
                            continue;
                        };
                        pass.set_bind_group(0, bind_group, &[]);
                    }
                    Command::BindPipeline(handle) => {
                        let Some(pipeline) = pipelines.get(handle) else {
                            continue;
                        };
                        pass.set_pipeline(pipeline);
                    }
                    Command::SetConstants { byte_offset, data } => {
                        pass.set_push_constants(*byte_offset, data);
                    }
                    Command::Dispatch(x, y) => pass.dispatch_workgroups(*x, *y, 1),
                    Command::PopDebugGroup => pass.pop_debug_group(),
                }
            }
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn layout_entry(slot: u32, kind: BindingKind) -> wgpu::BindGroupLayoutEntry {
        let ty = match kind {
            BindingKind::StorageBuffer => wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: false },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            BindingKind::UniformBuffer => wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
        };
        wgpu::BindGroupLayoutEntry {
            binding: slot,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty,
            count: None,
        }
    }
}

impl ComputeDevice for WgpuDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn compile_program(&self, desc: &ComputeProgramDesc) -> Result<CompiledProgram> {
        // Parse up front so a bad kernel fails here, not at pipeline build.
        let module = naga::front::wgsl::parse_str(&desc.source).map_err(|err| {
            Error::KernelCompilation {
                label: desc.label.clone(),
                message: err.emit_to_string(&desc.source),
            }
        })?;
        let globals: HashSet<&str> = module
            .global_variables
            .iter()
            .filter_map(|(_, var)| var.name.as_deref())
            .collect();

        // Declared slots the kernel never references are unused parameters;
        // they are left out of the layout and the binder skips them.
        let mut bindings = Vec::new();
        for (slot, (spec, kind)) in desc.bindings.iter().enumerate() {
            if globals.contains(spec.name.as_str()) {
                bindings.push(ProgramBinding {
                    name: spec.name.clone(),
                    slot: slot as u32,
                    kind: *kind,
                });
            }
        }

        let shader = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&desc.label),
                source: wgpu::ShaderSource::Wgsl(desc.source.clone().into()),
            });
        let entries: Vec<_> = bindings
            .iter()
            .map(|b| Self::layout_entry(b.slot, b.kind))
            .collect();
        let layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(&desc.label),
                entries: &entries,
            });

        let handle = ProgramHandle::new();
        self.programs.lock().unwrap().insert(
            handle,
            ProgramEntry {
                module: shader,
                layout,
            },
        );
        Ok(CompiledProgram { handle, bindings })
    }

    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc) -> ComputePipelineHandle {
        let handle = ComputePipelineHandle::new();
        let programs = self.programs.lock().unwrap();
        let Some(program) = programs.get(&desc.program) else {
            log::error!("pipeline '{}' references an unknown program", desc.label);
            return handle;
        };

        let mut push_constant_ranges = Vec::new();
        if desc.constants_byte_size > 0 {
            push_constant_ranges.push(wgpu::PushConstantRange {
                stages: wgpu::ShaderStages::COMPUTE,
                range: 0..desc.constants_byte_size as u32,
            });
        }
        let layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(desc.label),
                bind_group_layouts: &[&program.layout],
                push_constant_ranges: &push_constant_ranges,
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(desc.label),
                layout: Some(&layout),
                module: &program.module,
                entry_point: "main",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });
        self.pipelines.lock().unwrap().insert(handle, pipeline);
        handle
    }

    fn create_resource_bindings(&self, desc: &ResourceBindingsDesc) -> ResourceBindingsHandle {
        let handle = ResourceBindingsHandle::new();
        let buffers = self.buffers.lock().unwrap();

        // wgpu de-duplicates structurally identical bind group layouts, so a
        // layout rebuilt from the bind list is compatible with the one the
        // pipeline was created against.
        let mut entries = Vec::new();
        let mut resources = Vec::new();
        for bind in &desc.buffers {
            let Some(buffer) = buffers.get(&bind.buffer) else {
                log::error!("bindings '{}' reference an unknown buffer", desc.label);
                continue;
            };
            entries.push(Self::layout_entry(bind.binding_index, bind.kind));
            resources.push(wgpu::BindGroupEntry {
                binding: bind.binding_index,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer,
                    offset: bind.offset,
                    size: None,
                }),
            });
        }
        let layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(desc.label),
                entries: &entries,
            });
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(desc.label),
            layout: &layout,
            entries: &resources,
        });
        self.bind_groups.lock().unwrap().insert(handle, bind_group);
        handle
    }

    fn compute_cmds(&self) -> &dyn ComputeCmds {
        &self.cmds
    }
}

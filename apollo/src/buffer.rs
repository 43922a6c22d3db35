// Copyright 2025 the Apollo Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Buffer and value-type model shared between the scene-facing layer and the
//! GPU computations.
//!
//! Upstream allocators own the actual GPU memory; this module only describes
//! it: a [`BufferResource`] is a handle plus the offset/stride/type metadata
//! needed to build the constant block, and a [`BufferArrayRange`] is the
//! named slice of an aggregate buffer a prim (or computation) reads and
//! writes.

use std::sync::Arc;

use crate::device::BufferHandle;
use crate::hash;

/// Scalar component of a buffer element.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ComponentType {
    I32,
    U32,
    F32,
}

impl ComponentType {
    pub fn size_of(self) -> usize {
        match self {
            Self::I32 | Self::U32 | Self::F32 => 4,
        }
    }
}

/// Element type of a buffer: a component type and an arity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TupleType {
    pub component: ComponentType,
    pub count: usize,
}

impl TupleType {
    pub const INT32: Self = Self::new(ComponentType::I32, 1);
    pub const UINT32: Self = Self::new(ComponentType::U32, 1);
    pub const FLOAT: Self = Self::new(ComponentType::F32, 1);
    pub const VEC2F: Self = Self::new(ComponentType::F32, 2);
    pub const VEC3F: Self = Self::new(ComponentType::F32, 3);
    pub const VEC4F: Self = Self::new(ComponentType::F32, 4);
    /// A position primvar element.
    pub const POINT3F: Self = Self::VEC3F;

    pub const fn new(component: ComponentType, count: usize) -> Self {
        Self { component, count }
    }

    pub fn component_size(&self) -> usize {
        self.component.size_of()
    }

    pub fn byte_size(&self) -> usize {
        self.component_size() * self.count
    }
}

/// A named output (or input) a kernel produces or consumes.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct BufferSpec {
    pub name: String,
    pub value_type: TupleType,
}

impl BufferSpec {
    pub fn new(name: impl Into<String>, value_type: TupleType) -> Self {
        Self {
            name: name.into(),
            value_type,
        }
    }

    pub fn hash_value(&self) -> u64 {
        hash::of(self)
    }
}

/// A GPU-resident array: an opaque handle plus the layout metadata needed to
/// address elements within it.
#[derive(Clone, Debug)]
pub struct BufferResource {
    handle: BufferHandle,
    tuple_type: TupleType,
    /// Byte offset of the first element within the buffer object.
    offset: usize,
    /// Byte stride between consecutive elements.
    stride: usize,
}

impl BufferResource {
    pub fn new(handle: BufferHandle, tuple_type: TupleType, offset: usize, stride: usize) -> Self {
        Self {
            handle,
            tuple_type,
            offset,
            stride,
        }
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn tuple_type(&self) -> TupleType {
        self.tuple_type
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn stride(&self) -> usize {
        self.stride
    }
}

/// One named resource within a [`BufferArrayRange`].
#[derive(Clone, Debug)]
pub struct RangeEntry {
    pub name: String,
    /// Byte offset of this resource within the aggregate allocation.
    pub byte_offset: usize,
    pub resource: Arc<BufferResource>,
}

/// A range of an aggregated buffer array, addressed by resource name.
///
/// Output ranges additionally carry the element offset at which a
/// computation's results land; it is the first value of every constant block.
#[derive(Clone, Debug, Default)]
pub struct BufferArrayRange {
    entries: Vec<RangeEntry>,
    element_offset: usize,
}

impl BufferArrayRange {
    pub fn new(element_offset: usize) -> Self {
        Self {
            entries: Vec::new(),
            element_offset,
        }
    }

    pub fn add_resource(
        &mut self,
        name: impl Into<String>,
        byte_offset: usize,
        resource: Arc<BufferResource>,
    ) {
        self.entries.push(RangeEntry {
            name: name.into(),
            byte_offset,
            resource,
        });
    }

    pub fn element_offset(&self) -> usize {
        self.element_offset
    }

    pub fn entries(&self) -> &[RangeEntry] {
        &self.entries
    }

    pub fn get_resource(&self, name: &str) -> Option<&Arc<BufferResource>> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| &e.resource)
    }

    pub fn byte_offset(&self, name: &str) -> usize {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.byte_offset)
            .unwrap_or(0)
    }

    /// Append a spec for every resource in this range.
    pub fn get_buffer_specs(&self, specs: &mut Vec<BufferSpec>) {
        for entry in &self.entries {
            specs.push(BufferSpec::new(
                entry.name.clone(),
                entry.resource.tuple_type(),
            ));
        }
    }
}

// Copyright 2025 the Apollo Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Buffer sources: the commit-phase objects that make input data
//! device-resident before any computation reads it.

use std::sync::{Arc, Mutex};

use crate::resource::ComputationResource;

/// One unit of data the commit pass must make GPU-resident.
///
/// Scene-side CPU uploads and the GPU computation's own input adapter both
/// implement this. `resolve` is called by the commit driver exactly once per
/// pass and never concurrently with itself on one instance.
pub trait BufferSource: Send + Sync {
    /// Name for diagnostics and dependency tracking.
    fn name(&self) -> &str;

    /// Perform the upload/commit step; `true` on success. Idempotent: a
    /// second call reports the first call's result without re-committing.
    fn resolve(&self) -> bool;

    fn is_resolved(&self) -> bool;

    /// Whether there is anything to commit. Invalid sources are dropped at
    /// scheduling time, before the commit phase sees them.
    fn is_valid(&self) -> bool;
}

/// The input adapter for one GPU computation: resolves the computation's
/// scene-provided inputs, then resolves the shared
/// [`ComputationResource`] so the program and binder exist before the
/// computation executes.
///
/// Created fresh for every commit pass that has dirty primvars for its
/// computation and discarded after that pass.
pub struct ComputationBufferSource {
    inputs: Vec<Arc<dyn BufferSource>>,
    resource: Arc<ComputationResource>,
    resolved: Mutex<Option<bool>>,
}

impl ComputationBufferSource {
    pub fn new(inputs: Vec<Arc<dyn BufferSource>>, resource: Arc<ComputationResource>) -> Self {
        Self {
            inputs,
            resource,
            resolved: Mutex::new(None),
        }
    }

    pub fn inputs(&self) -> &[Arc<dyn BufferSource>] {
        &self.inputs
    }

    pub fn resource(&self) -> &Arc<ComputationResource> {
        &self.resource
    }
}

impl BufferSource for ComputationBufferSource {
    fn name(&self) -> &str {
        &self.resource.kernel().label
    }

    fn resolve(&self) -> bool {
        let mut state = self.resolved.lock().unwrap();
        if let Some(result) = *state {
            return result;
        }

        let mut ok = true;
        for input in &self.inputs {
            if !input.resolve() {
                log::warn!("input source '{}' failed to resolve", input.name());
                ok = false;
            }
        }
        if ok {
            ok = self.resource.resolve();
        }
        *state = Some(ok);
        ok
    }

    fn is_resolved(&self) -> bool {
        self.resolved.lock().unwrap().is_some()
    }

    fn is_valid(&self) -> bool {
        !self.inputs.is_empty()
    }
}

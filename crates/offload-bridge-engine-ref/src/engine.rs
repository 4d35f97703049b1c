//! In-memory modules, parameters, and the reference offload engine.
//!
//! Parameter storage never actually moves; residency is a flag the engine's
//! hooks flip, which is all the bridge contract requires. Stable parameter
//! ids are derived from the parameter name so checkpoints and registries can
//! key on them across processes.

use std::sync::{Arc, Mutex};

use anyhow::{ensure, Result};

use offload_bridge::engine::{DType, OffloadEngine, ParamHandle, Residency};

use crate::tensor::RefTensor;

/// Parameter handle with engine-owned residency state.
#[derive(Debug, Clone)]
pub struct RefParam {
    inner: Arc<ParamInner>,
}

#[derive(Debug)]
struct ParamInner {
    name: String,
    stable_id: u128,
    shape: Vec<usize>,
    dtype: DType,
    requires_grad: bool,
    /// Whether the offload engine manages this parameter's placement.
    offloadable: bool,
    state: Mutex<ParamState>,
}

#[derive(Debug)]
struct ParamState {
    resident: bool,
    data: Vec<f32>,
}

fn stable_param_id(name: &str) -> u128 {
    let hash = blake3::hash(name.as_bytes());
    let raw: [u8; 16] = hash.as_bytes()[0..16]
        .try_into()
        .expect("blake3 hash prefix length mismatch");
    u128::from_le_bytes(raw)
}

impl RefParam {
    /// Resident parameter outside the offload engine's management.
    pub fn resident(name: impl Into<String>, shape: impl Into<Vec<usize>>, data: Vec<f32>) -> Result<Self> {
        Self::build(name.into(), shape.into(), data, true, false)
    }

    /// Offload-managed parameter whose storage starts released.
    pub fn offloaded(name: impl Into<String>, shape: impl Into<Vec<usize>>, data: Vec<f32>) -> Result<Self> {
        Self::build(name.into(), shape.into(), data, false, true)
    }

    fn build(
        name: String,
        shape: Vec<usize>,
        data: Vec<f32>,
        resident: bool,
        offloadable: bool,
    ) -> Result<Self> {
        let expected: usize = shape.iter().product();
        ensure!(
            data.len() == expected,
            "parameter `{name}` data length ({}) does not match shape {:?}",
            data.len(),
            shape
        );
        let stable_id = stable_param_id(&name);
        Ok(Self {
            inner: Arc::new(ParamInner {
                name,
                stable_id,
                shape,
                dtype: DType::F32,
                requires_grad: true,
                offloadable,
                state: Mutex::new(ParamState { resident, data }),
            }),
        })
    }

    pub fn stable_id(&self) -> u128 {
        self.inner.stable_id
    }

    pub fn is_offloadable(&self) -> bool {
        self.inner.offloadable
    }

    /// Materializes the backing storage.
    pub fn fetch(&self) {
        self.inner
            .state
            .lock()
            .expect("parameter state poisoned")
            .resident = true;
    }

    /// Releases the backing storage of an offload-managed parameter.
    /// Unmanaged parameters stay resident.
    pub fn release(&self) {
        if self.inner.offloadable {
            self.inner
                .state
                .lock()
                .expect("parameter state poisoned")
                .resident = false;
        }
    }
}

impl ParamHandle for RefParam {
    type Tensor = RefTensor;

    fn name(&self) -> String {
        self.inner.name.clone()
    }

    fn residency(&self) -> Residency {
        let state = self.inner.state.lock().expect("parameter state poisoned");
        if state.resident {
            Residency::Resident
        } else {
            Residency::NotAvailable
        }
    }

    fn shape(&self) -> Vec<usize> {
        self.inner.shape.clone()
    }

    fn dtype(&self) -> DType {
        self.inner.dtype
    }

    fn requires_grad(&self) -> bool {
        self.inner.requires_grad
    }

    fn tensor(&self) -> RefTensor {
        let state = self.inner.state.lock().expect("parameter state poisoned");
        if state.resident {
            RefTensor::build(
                self.inner.shape.clone(),
                self.inner.dtype,
                state.data.clone(),
                self.inner.requires_grad,
            )
        } else {
            RefTensor::placeholder(self.inner.dtype)
        }
    }
}

/// Module owning a flat list of parameters. Submodules hold their own
/// parameters and subscribe separately, matching the engine's definition of
/// per-module iteration.
#[derive(Debug, Clone)]
pub struct RefModule {
    inner: Arc<ModuleInner>,
}

#[derive(Debug)]
struct ModuleInner {
    name: String,
    params: Vec<RefParam>,
}

impl RefModule {
    pub fn new(name: impl Into<String>, params: Vec<RefParam>) -> Self {
        Self {
            inner: Arc::new(ModuleInner {
                name: name.into(),
                params,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn params(&self) -> &[RefParam] {
        &self.inner.params
    }
}

/// Reference offload engine.
#[derive(Debug, Default)]
pub struct RefEngine;

impl RefEngine {
    pub fn new() -> Self {
        Self
    }
}

impl OffloadEngine for RefEngine {
    type Tensor = RefTensor;
    type Param = RefParam;
    type Module = RefModule;

    fn iterate_parameters(&self, module: &RefModule) -> Vec<RefParam> {
        module.params().to_vec()
    }

    fn module_name(&self, module: &RefModule) -> String {
        module.name().to_string()
    }

    fn module_key(&self, module: &RefModule) -> u64 {
        Arc::as_ptr(&module.inner) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offload_bridge::engine::TensorValue;

    #[test]
    fn offloaded_param_serves_placeholder_until_fetched() {
        let param = RefParam::offloaded("w", vec![5], vec![1.0; 5]).unwrap();
        assert_eq!(param.residency(), Residency::NotAvailable);
        assert!(param.tensor().is_placeholder());

        param.fetch();
        assert_eq!(param.residency(), Residency::Resident);
        let tensor = param.tensor();
        assert_eq!(tensor.shape(), &[5]);
        assert_eq!(tensor.values(), &[1.0; 5]);
        assert!(tensor.requires_grad());

        param.release();
        assert_eq!(param.residency(), Residency::NotAvailable);
    }

    #[test]
    fn release_keeps_unmanaged_params_resident() {
        let param = RefParam::resident("b", vec![2], vec![0.5, 0.5]).unwrap();
        param.release();
        assert_eq!(param.residency(), Residency::Resident);
    }

    #[test]
    fn stable_ids_depend_only_on_the_name() {
        let first = RefParam::resident("layer.weight", vec![1], vec![0.0]).unwrap();
        let second = RefParam::offloaded("layer.weight", vec![1], vec![1.0]).unwrap();
        let other = RefParam::resident("layer.bias", vec![1], vec![0.0]).unwrap();
        assert_eq!(first.stable_id(), second.stable_id());
        assert_ne!(first.stable_id(), other.stable_id());
    }

    #[test]
    fn engine_iterates_module_scope_params() {
        let engine = RefEngine::new();
        let module = RefModule::new(
            "block",
            vec![
                RefParam::resident("w", vec![1], vec![0.0]).unwrap(),
                RefParam::offloaded("v", vec![1], vec![0.0]).unwrap(),
            ],
        );
        let params = engine.iterate_parameters(&module);
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].name(), "w");
        assert_eq!(params[1].name(), "v");
    }
}

//! Named module graph owned by the workload.
//!
//! The workload calls modules through the graph by path; the instrumentation
//! layer swaps entries for observing wrappers on attach and puts the originals
//! back on detach.

use super::ops::{CpuDevice, CpuOps, Device, TensorOps};
use super::tensor::Tensor;
use crate::errors::InstrumentError;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

pub trait Module: Send + Sync + Debug {
    fn forward(&self, inputs: &[&Tensor], ops: &dyn TensorOps) -> Result<Tensor, InstrumentError>;

    fn parameter_count(&self) -> usize {
        0
    }
}

#[derive(Debug)]
pub struct ModuleGraph {
    order: Vec<String>,
    modules: HashMap<String, Arc<dyn Module>>,
    ops: Arc<dyn TensorOps>,
    device: Arc<dyn Device>,
}

impl Default for ModuleGraph {
    fn default() -> Self {
        Self::new(Arc::new(CpuOps), Arc::new(CpuDevice))
    }
}

impl ModuleGraph {
    pub fn new(ops: Arc<dyn TensorOps>, device: Arc<dyn Device>) -> Self {
        Self {
            order: Vec::new(),
            modules: HashMap::new(),
            ops,
            device,
        }
    }

    /// Register a module. Re-inserting a path replaces it in place.
    pub fn insert(&mut self, path: impl Into<String>, module: Arc<dyn Module>) {
        let path = path.into();
        if self.modules.insert(path.clone(), module).is_none() {
            self.order.push(path);
        }
    }

    pub fn get(&self, path: &str) -> Result<&Arc<dyn Module>, InstrumentError> {
        self.modules
            .get(path)
            .ok_or_else(|| InstrumentError::ComponentNotFound(path.to_string()))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.modules.contains_key(path)
    }

    /// Swap the module at an existing path, returning the previous one.
    pub fn replace(
        &mut self,
        path: &str,
        module: Arc<dyn Module>,
    ) -> Result<Arc<dyn Module>, InstrumentError> {
        match self.modules.get_mut(path) {
            Some(slot) => Ok(std::mem::replace(slot, module)),
            None => Err(InstrumentError::ComponentNotFound(path.to_string())),
        }
    }

    /// Run the module at `path` with the graph's current tensor ops.
    pub fn call(&self, path: &str, inputs: &[&Tensor]) -> Result<Tensor, InstrumentError> {
        let module = self.get(path)?;
        module.forward(inputs, self.ops.as_ref())
    }

    /// Paths in insertion order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn ops(&self) -> &Arc<dyn TensorOps> {
        &self.ops
    }

    /// Install new tensor ops for every module call, returning the previous ones.
    pub fn set_ops(&mut self, ops: Arc<dyn TensorOps>) -> Arc<dyn TensorOps> {
        std::mem::replace(&mut self.ops, ops)
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn parameter_count(&self) -> usize {
        self.modules.values().map(|m| m.parameter_count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Double;

    impl Module for Double {
        fn forward(&self, inputs: &[&Tensor], ops: &dyn TensorOps) -> Result<Tensor, InstrumentError> {
            let x = inputs
                .first()
                .ok_or_else(|| InstrumentError::InvalidInput("no input".into()))?;
            Ok(ops.scale(x, 2.0))
        }

        fn parameter_count(&self) -> usize {
            3
        }
    }

    #[test]
    fn call_and_replace() {
        let mut g = ModuleGraph::default();
        g.insert("layers.0.mlp.up_proj", Arc::new(Double));
        let x = Tensor::new(1, 2, vec![1.0, 2.0]).unwrap();
        assert_eq!(g.call("layers.0.mlp.up_proj", &[&x]).unwrap().data(), &[2.0, 4.0]);
        assert!(matches!(
            g.call("missing", &[&x]),
            Err(InstrumentError::ComponentNotFound(_))
        ));
        let old = g.replace("layers.0.mlp.up_proj", Arc::new(Double)).unwrap();
        assert_eq!(old.parameter_count(), 3);
        assert!(g.replace("nope", old).is_err());
        assert_eq!(g.len(), 1);
        assert_eq!(g.parameter_count(), 3);
    }
}

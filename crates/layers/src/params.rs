//! Hierarchical parameter collection.
//!
//! Leaves are [`Var`]s addressed by dotted paths such as
//! `layers.0.attention.q_proj.kernel`. Modules keep clones of the vars they
//! read, so an in-place [`ParamStore::assign`] is visible to every forward pass
//! that follows. The store is only written by initialisation and checkpoint
//! import; callers enforce exclusive access through `&mut`.

use std::collections::BTreeMap;

use candle_core::{Tensor, Var};

use crate::LayerError;

/// Ordered map from dotted parameter path to differentiable leaf.
#[derive(Debug, Default, Clone)]
pub struct ParamStore {
    leaves: BTreeMap<String, Var>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new leaf initialised with `value` and returns a handle to it.
    pub fn register(&mut self, path: impl Into<String>, value: Tensor) -> Result<Var, LayerError> {
        let path = path.into();
        if self.leaves.contains_key(&path) {
            return Err(LayerError::DuplicateParameter(path));
        }
        let var = Var::from_tensor(&value.contiguous()?)?;
        log::trace!("registered parameter {path} {:?}", var.dims());
        self.leaves.insert(path, var.clone());
        Ok(var)
    }

    pub fn get(&self, path: &str) -> Option<&Var> {
        self.leaves.get(path)
    }

    /// Returns a detached copy of the leaf value.
    pub fn value(&self, path: &str) -> Result<Tensor, LayerError> {
        self.leaves
            .get(path)
            .map(|var| var.as_tensor().copy())
            .transpose()?
            .ok_or_else(|| LayerError::UnknownParameter(path.to_string()))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.leaves.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.leaves.keys().map(String::as_str)
    }

    /// Overwrites a leaf in place.
    ///
    /// The incoming tensor must match the leaf shape exactly; its dtype is cast to
    /// the leaf dtype. Non-contiguous inputs (e.g. transposed views) are accepted.
    pub fn assign(&self, path: &str, value: &Tensor) -> Result<(), LayerError> {
        let var = self
            .leaves
            .get(path)
            .ok_or_else(|| LayerError::UnknownParameter(path.to_string()))?;
        if var.dims() != value.dims() {
            return Err(LayerError::ShapeMismatch {
                path: path.to_string(),
                expected: var.dims().to_vec(),
                actual: value.dims().to_vec(),
            });
        }
        let cast = if value.dtype() == var.dtype() {
            value.contiguous()?
        } else {
            value.to_dtype(var.dtype())?.contiguous()?
        };
        // `Var::set` refuses sources sharing its storage; a detached copy sidesteps that
        // when a caller feeds a value read back from this very leaf.
        let cast = cast.copy()?;
        var.set(&cast)?;
        Ok(())
    }

    /// All leaves, in path order, for optimisers and gradient consumers.
    pub fn all_vars(&self) -> Vec<(String, Var)> {
        self.leaves
            .iter()
            .map(|(path, var)| (path.clone(), var.clone()))
            .collect()
    }

    /// Detached copies of every leaf, in path order.
    pub fn snapshot(&self) -> Result<BTreeMap<String, Tensor>, LayerError> {
        self.leaves
            .iter()
            .map(|(path, var)| Ok((path.clone(), var.as_tensor().copy()?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn assign_updates_registered_handles() -> Result<(), LayerError> {
        let device = Device::Cpu;
        let mut store = ParamStore::new();
        let handle = store.register("norm.weight", Tensor::ones(4, DType::F32, &device)?)?;
        store.assign("norm.weight", &Tensor::full(0.5f32, 4, &device)?)?;
        assert_eq!(handle.as_tensor().to_vec1::<f32>()?, vec![0.5; 4]);
        Ok(())
    }

    #[test]
    fn assign_accepts_transposed_views() -> Result<(), LayerError> {
        let device = Device::Cpu;
        let mut store = ParamStore::new();
        store.register("proj.kernel", Tensor::zeros((2, 3), DType::F32, &device)?)?;
        let source = Tensor::arange(0f32, 6.0, &device)?.reshape((3, 2))?;
        store.assign("proj.kernel", &source.t()?)?;
        let stored = store.value("proj.kernel")?.to_vec2::<f32>()?;
        assert_eq!(stored, vec![vec![0.0, 2.0, 4.0], vec![1.0, 3.0, 5.0]]);
        Ok(())
    }

    #[test]
    fn shape_mismatch_is_reported_with_path() -> Result<(), LayerError> {
        let device = Device::Cpu;
        let mut store = ParamStore::new();
        store.register("norm.weight", Tensor::ones(4, DType::F32, &device)?)?;
        let err = store
            .assign("norm.weight", &Tensor::ones(5, DType::F32, &device)?)
            .unwrap_err();
        match err {
            LayerError::ShapeMismatch {
                path,
                expected,
                actual,
            } => {
                assert_eq!(path, "norm.weight");
                assert_eq!(expected, vec![4]);
                assert_eq!(actual, vec![5]);
            }
            other => panic!("unexpected error {other}"),
        }
        Ok(())
    }

    #[test]
    fn duplicate_and_unknown_paths_error() -> Result<(), LayerError> {
        let device = Device::Cpu;
        let mut store = ParamStore::new();
        store.register("a", Tensor::ones(1, DType::F32, &device)?)?;
        assert!(matches!(
            store.register("a", Tensor::ones(1, DType::F32, &device)?),
            Err(LayerError::DuplicateParameter(_))
        ));
        assert!(matches!(
            store.assign("b", &Tensor::ones(1, DType::F32, &device)?),
            Err(LayerError::UnknownParameter(_))
        ));
        Ok(())
    }

    #[test]
    fn assign_casts_to_leaf_dtype() -> Result<(), LayerError> {
        let device = Device::Cpu;
        let mut store = ParamStore::new();
        store.register("w", Tensor::zeros(3, DType::F32, &device)?)?;
        store.assign("w", &Tensor::ones(3, DType::F16, &device)?)?;
        let value = store.value("w")?;
        assert_eq!(value.dtype(), DType::F32);
        assert_eq!(value.to_vec1::<f32>()?, vec![1.0; 3]);
        Ok(())
    }
}

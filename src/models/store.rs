//! Parameter stores and weight bundles
//!
//! A [`ParameterStore`] owns the named `Var`s of one network. A
//! [`WeightBundle`] is a named set of plain tensors, the unit the hypernetwork
//! produces and the client model consumes.

use crate::{FairHnError, Result};
use candle_core::{Tensor, Var};
use std::collections::BTreeMap;
use tracing::debug;

// =============================================================================
// Weight bundle
// =============================================================================

/// Named tensors keyed by parameter name, ordered by key
#[derive(Debug, Clone, Default)]
pub struct WeightBundle {
    tensors: BTreeMap<String, Tensor>,
}

impl WeightBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Value copy with no autograd history
    pub fn detached(&self) -> Result<Self> {
        let mut out = Self::new();
        for (name, tensor) in &self.tensors {
            let copy = tensor
                .detach()
                .copy()
                .map_err(|e| FairHnError::Tensor(format!("copy of '{}' failed: {}", name, e)))?;
            out.insert(name.clone(), copy);
        }
        Ok(out)
    }
}

impl FromIterator<(String, Tensor)> for WeightBundle {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

// =============================================================================
// Parameter store
// =============================================================================

/// Ordered, named trainable variables of one network
#[derive(Debug, Clone, Default)]
pub struct ParameterStore {
    entries: Vec<(String, Var)>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a variable; names must be unique
    pub fn insert(&mut self, name: impl Into<String>, var: Var) -> Result<()> {
        let name = name.into();
        if self.get(&name).is_some() {
            return Err(FairHnError::Config(format!("duplicate parameter '{}'", name)));
        }
        self.entries.push((name, var));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Var> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Variable by name, or an error naming the missing parameter
    pub fn require(&self, name: &str) -> Result<&Var> {
        self.get(name)
            .ok_or_else(|| FairHnError::Tensor(format!("missing parameter '{}'", name)))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Var)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// All variables in registration order
    pub fn vars(&self) -> Vec<Var> {
        self.entries.iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of scalar parameters
    pub fn num_parameters(&self) -> usize {
        self.entries.iter().map(|(_, v)| v.elem_count()).sum()
    }

    /// Overwrite the variables named in `bundle` with its values
    ///
    /// Keys with no matching variable are skipped; variables the bundle does
    /// not name keep their current value. A shape mismatch on a matching key
    /// is an error. Returns the number of variables written.
    pub fn overwrite(&self, bundle: &WeightBundle) -> Result<usize> {
        let mut written = 0;
        for (name, tensor) in bundle.iter() {
            let Some(var) = self.get(name) else {
                debug!("bundle key '{}' has no matching parameter, skipped", name);
                continue;
            };
            if var.dims() != tensor.dims() {
                return Err(FairHnError::Tensor(format!(
                    "shape mismatch for '{}': parameter {:?}, bundle {:?}",
                    name,
                    var.dims(),
                    tensor.dims()
                )));
            }
            var.set(tensor)
                .map_err(|e| FairHnError::Tensor(format!("load of '{}' failed: {}", name, e)))?;
            written += 1;
        }
        Ok(written)
    }

    /// Value copies of the named variables
    ///
    /// The copies own their storage, so later `overwrite` calls or optimizer
    /// steps do not change them.
    pub fn snapshot<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Result<WeightBundle> {
        let mut out = WeightBundle::new();
        for name in names {
            let var = self.require(name)?;
            let copy = var
                .as_tensor()
                .detach()
                .copy()
                .map_err(|e| FairHnError::Tensor(format!("snapshot of '{}' failed: {}", name, e)))?;
            out.insert(name, copy);
        }
        Ok(out)
    }

    /// Value copies of every variable
    pub fn snapshot_all(&self) -> Result<WeightBundle> {
        let names: Vec<String> = self.names().map(str::to_string).collect();
        self.snapshot(names.iter().map(String::as_str))
    }
}

//! Name-keyed registry of parameters with prefixing, sharing, and persistence.
//!
//! A store may be constructed over a shared backing store: lookups that miss
//! locally but hit the shared map promote the same handle into the local map,
//! so both stores observe one tensor and one gradient. The backing map is
//! aliased live (not snapshotted), matching the semantics callers rely on for
//! weight tying.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::{bail, Context as _, Result};
use tracing::{debug, info};

use crate::error::{PersistenceError, StoreError};
use crate::init::{param_seed, Initializer};
use crate::io::tensor_archive::TensorArchive;
use crate::params::parameter::{DtypeSource, ParamRef, ParamSpec, Parameter};
use crate::tensor::{Context, Tensor};

type ParamMap = BTreeMap<String, ParamRef>;

/// Knobs for [`ParameterStore::load`].
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Permit registered parameters with no counterpart in the file.
    pub allow_missing: bool,
    /// Permit file entries with no counterpart in the store.
    pub ignore_extra: bool,
    /// Prefix prepended to every file key before matching; every registered
    /// name must start with it.
    pub restore_prefix: String,
    pub cast_dtype: bool,
    pub dtype_source: DtypeSource,
}

impl Default for LoadOptions {
    fn default() -> Self {
        LoadOptions {
            allow_missing: false,
            ignore_extra: false,
            restore_prefix: String::new(),
            cast_dtype: false,
            dtype_source: DtypeSource::Current,
        }
    }
}

/// Registry of [`Parameter`]s keyed by qualified name.
#[derive(Debug, Clone)]
pub struct ParameterStore {
    prefix: String,
    seed: u64,
    params: Arc<RwLock<ParamMap>>,
    shared: Option<Arc<RwLock<ParamMap>>>,
}

impl ParameterStore {
    /// Default seed for deterministic initialization when none is chosen.
    pub const DEFAULT_SEED: u64 = 0x6e65_7473;

    pub fn new(prefix: impl Into<String>) -> Self {
        ParameterStore {
            prefix: prefix.into(),
            seed: Self::DEFAULT_SEED,
            params: Arc::new(RwLock::new(BTreeMap::new())),
            shared: None,
        }
    }

    /// Replaces the initialization seed. Two structurally identical stores with
    /// the same seed initialize to bit-identical values.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// A store that falls back to `parent`'s live map on lookup misses,
    /// aliasing (never copying) any promoted parameter.
    pub fn with_shared(prefix: impl Into<String>, parent: &ParameterStore) -> Self {
        ParameterStore {
            prefix: prefix.into(),
            seed: parent.seed,
            params: Arc::new(RwLock::new(BTreeMap::new())),
            shared: Some(Arc::clone(&parent.params)),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn len(&self) -> usize {
        self.read_map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_map().is_empty()
    }

    pub fn contains(&self, qualified_name: &str) -> bool {
        self.read_map().contains_key(qualified_name)
    }

    /// Qualified names in sorted order.
    pub fn keys(&self) -> Vec<String> {
        self.read_map().keys().cloned().collect()
    }

    /// Sorted `(qualified name, handle)` snapshot of the local map.
    pub fn params(&self) -> Vec<(String, ParamRef)> {
        self.read_map()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn read_map(&self) -> std::sync::RwLockReadGuard<'_, ParamMap> {
        self.params.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_map(&self) -> std::sync::RwLockWriteGuard<'_, ParamMap> {
        self.params.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Local lookup with shared-map fallback; a shared hit promotes the handle
    /// into the local map so later mutations stay aliased.
    fn get_impl(&self, qualified_name: &str) -> Option<ParamRef> {
        if let Some(param) = self.read_map().get(qualified_name) {
            return Some(param.clone());
        }
        let shared = self.shared.as_ref()?;
        let promoted = shared
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(qualified_name)
            .cloned()?;
        self.write_map()
            .insert(qualified_name.to_string(), promoted.clone());
        Some(promoted)
    }

    /// Fetches or registers a parameter under `prefix + name`.
    ///
    /// Repeated calls with the same name are idempotent: the existing handle is
    /// returned, with shape and initializer merged in only where still unset
    /// (first writer wins). A shape conflicting with an already-resolved one is
    /// an error.
    pub fn get(&self, name: &str, spec: ParamSpec) -> Result<ParamRef> {
        let qualified = format!("{}{}", self.prefix, name);
        match self.get_impl(&qualified) {
            Some(param) => {
                param.write().merge_spec(&spec)?;
                Ok(param)
            }
            None => {
                let param = ParamRef::new(Parameter::new(qualified.clone(), spec));
                self.write_map().insert(qualified, param.clone());
                Ok(param)
            }
        }
    }

    /// Fetches or registers a non-trainable constant under `prefix + name`.
    ///
    /// Creating a constant requires a value; fetching one requires the existing
    /// entry to actually be a constant.
    pub fn get_constant(&self, name: &str, value: Option<Tensor>) -> Result<ParamRef> {
        let qualified = format!("{}{}", self.prefix, name);
        match self.get_impl(&qualified) {
            Some(param) => {
                if !param.read().is_constant() {
                    bail!(StoreError::NotAConstant { name: qualified });
                }
                Ok(param)
            }
            None => {
                let Some(value) = value else {
                    bail!(StoreError::MissingConstantValue { name: qualified });
                };
                let param = ParamRef::new(Parameter::constant(qualified.clone(), value));
                self.write_map().insert(qualified, param.clone());
                Ok(param)
            }
        }
    }

    /// Merges another store's entries into this one. A name collision between a
    /// constant and a non-constant is an error; otherwise the other store's
    /// handle replaces the local one.
    pub fn update(&self, other: &ParameterStore) -> Result<()> {
        for (name, theirs) in other.params() {
            let ours = self.read_map().get(&name).cloned();
            match ours {
                None => {
                    self.write_map().insert(name, theirs);
                }
                Some(ours) => {
                    if ours.read().is_constant() != theirs.read().is_constant() {
                        bail!(StoreError::NamingCollision { name });
                    }
                    self.write_map().insert(name, theirs);
                }
            }
        }
        Ok(())
    }

    /// Materializes every parameter lacking a value (all of them under
    /// `force_reinit`; constants are never touched).
    ///
    /// The per-parameter RNG stream is seeded from the store seed and the
    /// qualified name, so results do not depend on registration order.
    pub fn initialize(
        &self,
        init: Option<&Initializer>,
        ctx: Option<Context>,
        verbose: bool,
        force_reinit: bool,
    ) -> Result<()> {
        let default_init = init.cloned().unwrap_or_default();
        let ctx = ctx.unwrap_or_else(Context::cpu);
        for (name, param) in self.params() {
            let seed = param_seed(self.seed, &name);
            let initialized = param
                .write()
                .materialize(&default_init, ctx, seed, force_reinit)
                .with_context(|| format!("initializing parameter '{name}'"))?;
            if verbose && initialized {
                info!(param = %name, %ctx, "initialized parameter");
            }
        }
        Ok(())
    }

    /// Zeroes every gradient accumulator in place.
    pub fn zero_grad(&self) {
        for (_, param) in self.params() {
            param.write().zero_grad();
        }
    }

    /// Migrates every materialized parameter to a new device context.
    ///
    /// Gradients are zeroed as a side effect; see DESIGN.md for why the two
    /// operations stay coupled.
    pub fn reset_context(&self, ctx: Context) {
        for (_, param) in self.params() {
            param.write().reset_context(ctx);
        }
    }

    /// Writes a sorted name-to-tensor archive of every parameter.
    ///
    /// A non-empty `strip_prefix` must prefix every key and is removed from the
    /// saved names; a key outside the prefix aborts the save, since it means
    /// the store holds parameters scoped to some other component.
    pub fn save(&self, path: impl AsRef<Path>, strip_prefix: &str) -> Result<()> {
        let path = path.as_ref();
        let mut tensors: BTreeMap<String, Tensor> = BTreeMap::new();
        for (name, param) in self.params() {
            if !strip_prefix.is_empty() && !name.starts_with(strip_prefix) {
                bail!(PersistenceError::StripPrefixMismatch {
                    prefix: strip_prefix.to_string(),
                    name,
                });
            }
            let value = param
                .read()
                .value()
                .with_context(|| format!("saving parameter '{name}'"))?
                .clone();
            tensors.insert(name[strip_prefix.len()..].to_string(), value);
        }
        TensorArchive::save(path, &tensors)?;
        debug!(path = %path.display(), count = tensors.len(), "saved parameter archive");
        Ok(())
    }

    /// Restores parameter values from an archive written by [`save`].
    ///
    /// File keys may carry a conventional `arg:`/`aux:` tag, which is stripped
    /// before `restore_prefix` is applied. The full name set is validated
    /// (missing and extra entries) before any parameter is mutated, so a failed
    /// load never leaves the store partially restored.
    ///
    /// [`save`]: ParameterStore::save
    pub fn load(&self, path: impl AsRef<Path>, ctx: Option<Context>, opts: LoadOptions) -> Result<()> {
        let path = path.as_ref();
        let keys = self.keys();

        if !opts.restore_prefix.is_empty() {
            for name in &keys {
                if !name.starts_with(&opts.restore_prefix) {
                    bail!(PersistenceError::RestorePrefixMismatch {
                        prefix: opts.restore_prefix.clone(),
                        name: name.clone(),
                    });
                }
            }
        }

        let loaded = TensorArchive::load(path)?;
        let mut file_tensors: BTreeMap<String, Tensor> = BTreeMap::new();
        for (key, tensor) in loaded {
            let stripped = key
                .strip_prefix("arg:")
                .or_else(|| key.strip_prefix("aux:"))
                .unwrap_or(&key);
            file_tensors.insert(format!("{}{}", opts.restore_prefix, stripped), tensor);
        }

        if !opts.allow_missing {
            for name in &keys {
                if !file_tensors.contains_key(name) {
                    bail!(PersistenceError::MissingParameter {
                        path: path.to_path_buf(),
                        name: name.clone(),
                    });
                }
            }
        }
        if !opts.ignore_extra {
            for name in file_tensors.keys() {
                if !self.contains(name) {
                    bail!(PersistenceError::UnexpectedParameter {
                        path: path.to_path_buf(),
                        name: name.clone(),
                    });
                }
            }
        }

        let mut restored = 0usize;
        for (name, tensor) in file_tensors {
            let Some(param) = self.read_map().get(&name).cloned() else {
                continue; // extra entry, permitted by ignore_extra
            };
            param
                .write()
                .load_value(tensor, ctx, opts.cast_dtype, opts.dtype_source)
                .with_context(|| format!("loading parameter '{name}' from '{}'", path.display()))?;
            restored += 1;
        }
        debug!(path = %path.display(), count = restored, "loaded parameter archive");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::parameter::GradReq;
    use crate::tensor::Shape;

    #[test]
    fn get_is_idempotent_and_preserves_identity() {
        let store = ParameterStore::new("net_");
        let spec = ParamSpec {
            shape: Some(Shape::new([2, 2])),
            ..Default::default()
        };
        let a = store.get("w", spec.clone()).unwrap();
        let b = store.get("w", spec).unwrap();
        assert!(a.ptr_eq(&b));
        assert_eq!(store.len(), 1);
        assert_eq!(store.keys(), vec!["net_w".to_string()]);
    }

    #[test]
    fn get_constant_rejects_non_constant_entry() {
        let store = ParameterStore::new("");
        store.get("w", ParamSpec::default()).unwrap();
        let err = store.get_constant("w", None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::NotAConstant { .. })
        ));
    }

    #[test]
    fn update_rejects_kind_collision() {
        let a = ParameterStore::new("");
        a.get("w", ParamSpec::default()).unwrap();
        let b = ParameterStore::new("");
        b.get_constant("w", Some(Tensor::ones(Shape::new([1]))))
            .unwrap();
        let err = a.update(&b).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::NamingCollision { .. })
        ));
    }

    #[test]
    fn shared_fallback_promotes_alias() {
        let parent = ParameterStore::new("");
        parent
            .get(
                "w",
                ParamSpec {
                    shape: Some(Shape::new([2])),
                    ..Default::default()
                },
            )
            .unwrap();
        let child = ParameterStore::with_shared("", &parent);
        let through_child = child.get("w", ParamSpec::default()).unwrap();
        let through_parent = parent.get("w", ParamSpec::default()).unwrap();
        assert!(through_child.ptr_eq(&through_parent));
        assert!(child.contains("w"));
    }

    #[test]
    fn non_trainable_parameters_get_no_grad_buffer() {
        let store = ParameterStore::new("");
        let frozen = store
            .get(
                "stat",
                ParamSpec {
                    grad_req: GradReq::Null,
                    shape: Some(Shape::new([2])),
                    ..Default::default()
                },
            )
            .unwrap();
        store.initialize(None, None, false, false).unwrap();
        assert!(frozen.read().grad().is_none());
    }
}

//! Modifier registry — named adapter factories that instrument a model
//!
//! The registry is a plain value built once (`ModifierRegistry::default()`
//! carries the four built-in modifiers) and passed to whatever needs to
//! resolve a modifier name.

use crate::adapters::{Adapter, AdapterConfig, AdapterKind};
use crate::error::{ExpertError, Result};
use crate::model::{BaseModel, Layer};
use log::{debug, info};
use rand::RngCore;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Builds a fresh adapter for the layer at a path
pub type ModifierFactory = fn(&str, Arc<Layer>, &AdapterConfig, &mut dyn RngCore) -> Result<Adapter>;

fn attach_adapter(path: &str, layer: Arc<Layer>, config: &AdapterConfig, rng: &mut dyn RngCore) -> Result<Adapter> {
    Adapter::attach(path, layer, config, rng)
}

#[derive(Clone, Copy)]
struct Registration {
    kind: AdapterKind,
    factory: ModifierFactory,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration").field("kind", &self.kind).finish()
    }
}

#[derive(Debug, Clone)]
pub struct ModifierRegistry {
    modifiers: BTreeMap<String, Registration>,
    /// Adapter kind → modifier name used when none is given explicitly
    by_kind: BTreeMap<AdapterKind, String>,
}

impl Default for ModifierRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        for kind in [
            AdapterKind::Lora,
            AdapterKind::SkilledLora,
            AdapterKind::Ia3,
            AdapterKind::LayerNorm,
        ] {
            registry.insert(kind.name(), kind, attach_adapter);
        }
        registry
    }
}

impl ModifierRegistry {
    pub fn empty() -> Self {
        Self {
            modifiers: BTreeMap::new(),
            by_kind: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, kind: AdapterKind, factory: ModifierFactory) -> Result<()> {
        if self.modifiers.contains_key(name) {
            return Err(ExpertError::config(format!(
                "cannot register duplicate model modifier '{}'",
                name
            )));
        }
        self.insert(name, kind, factory);
        debug!("Registered modifier '{}' for {} adapters", name, kind.name());
        Ok(())
    }

    fn insert(&mut self, name: &str, kind: AdapterKind, factory: ModifierFactory) {
        self.modifiers.insert(name.to_string(), Registration { kind, factory });
        self.by_kind.entry(kind).or_insert_with(|| name.to_string());
    }

    pub fn names(&self) -> Vec<String> {
        self.modifiers.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modifiers.contains_key(name)
    }

    /// Modifier name for `config`, from `explicit` or else its adapter kind
    pub fn resolve(&self, config: &AdapterConfig, explicit: Option<&str>) -> Result<String> {
        let name = match explicit {
            Some(name) => name.to_string(),
            None => self.by_kind.get(&config.kind).cloned().ok_or_else(|| {
                ExpertError::config(format!("no modifier registered for {} configs", config.kind.name()))
            })?,
        };
        let reg = self
            .modifiers
            .get(&name)
            .ok_or_else(|| ExpertError::config(format!("unknown modifier '{}'", name)))?;
        if reg.kind != config.kind {
            return Err(ExpertError::config(format!(
                "modifier '{}' builds {} adapters, config is {}",
                name,
                reg.kind.name(),
                config.kind.name()
            )));
        }
        Ok(name)
    }

    /// Attach a fresh `expert_name` adapter at every layer `config` targets.
    ///
    /// Matched layers become containers (or gain an expert if already
    /// wrapped). Their base parameters are frozen, unless the config is a
    /// full fine-tune, in which case every base layer is made trainable.
    /// Nothing is modified if any layer fails to accept the adapter.
    pub fn apply(
        &self,
        model: &mut BaseModel,
        config: &AdapterConfig,
        expert_name: &str,
        modifier: Option<&str>,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<String>> {
        config.validate()?;
        let name = self.resolve(config, modifier)?;
        let reg = self.modifiers[&name];
        let paths = model.matching_paths(config)?;
        if paths.is_empty() {
            return Err(ExpertError::config(format!(
                "pattern '{}' matches no layer of model '{}'",
                config.modify_layers, model.name
            )));
        }

        let mut pending = Vec::with_capacity(paths.len());
        for path in &paths {
            if let Some(container) = model.container(path) {
                if container.kind() != config.kind {
                    return Err(ExpertError::incompatible(
                        format!("adapter kind at '{}'", path),
                        container.kind().name(),
                        config.kind.name(),
                    ));
                }
                if container.adapter(expert_name).is_some() {
                    return Err(ExpertError::state(format!(
                        "expert '{}' already exists at '{}'",
                        expert_name, path
                    )));
                }
            }
            let layer = model.layer(path)?.clone();
            pending.push((path.clone(), (reg.factory)(path, layer, config, rng)?));
        }

        for (path, adapter) in pending {
            model
                .ensure_container(&path, &name, config.kind)?
                .add_expert(expert_name, adapter)?;
            model.record_injection(&path, &name, expert_name);
            if !config.full_finetune {
                model.set_trainable(&path, false)?;
            }
        }
        if config.full_finetune {
            model.set_all_trainable(true);
        }
        info!(
            "Modifier '{}' attached expert '{}' to {} layers of '{}'",
            name,
            expert_name,
            paths.len(),
            model.name
        );
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RoutingInfo;
    use crate::containers::ForwardContext;
    use crate::selectors::SelectorSet;
    use nalgebra::DMatrix;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn model() -> BaseModel {
        let mut rng = StdRng::seed_from_u64(3);
        BaseModel::toy("toy", 4, 2, &mut rng)
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = ModifierRegistry::default();
        let err = registry.register("lora", AdapterKind::Lora, attach_adapter).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
        registry.register("my_lora", AdapterKind::Lora, attach_adapter).unwrap();
        assert_eq!(registry.resolve(&AdapterConfig::lora("q"), None).unwrap(), "lora");
        assert_eq!(registry.resolve(&AdapterConfig::lora("q"), Some("my_lora")).unwrap(), "my_lora");
    }

    #[test]
    fn test_default_registry_has_builtins() {
        let registry = ModifierRegistry::default();
        assert_eq!(registry.names(), vec!["ia3", "ln", "lora", "skilled_lora"]);
        for (config, name) in [
            (AdapterConfig::lora("q"), "lora"),
            (AdapterConfig::skilled_lora("q", 2, 1), "skilled_lora"),
            (AdapterConfig::ia3("q"), "ia3"),
            (AdapterConfig::layer_norm("q"), "ln"),
        ] {
            assert_eq!(registry.resolve(&config, None).unwrap(), name);
        }
    }

    #[test]
    fn test_resolution_failures() {
        let registry = ModifierRegistry::empty();
        assert!(matches!(
            registry.resolve(&AdapterConfig::lora("q"), None),
            Err(ExpertError::Configuration(_))
        ));
        let registry = ModifierRegistry::default();
        assert!(registry.resolve(&AdapterConfig::lora("q"), Some("nope")).is_err());
        assert!(registry.resolve(&AdapterConfig::lora("q"), Some("ia3")).is_err());
    }

    #[test]
    fn test_apply_wraps_matches_and_freezes_them() {
        let registry = ModifierRegistry::default();
        let mut m = model();
        let mut rng = StdRng::seed_from_u64(0);
        let paths = registry
            .apply(&mut m, &AdapterConfig::lora("q_proj"), "e", None, &mut rng)
            .unwrap();
        assert_eq!(paths, vec!["blocks.0.attn.q_proj", "blocks.1.attn.q_proj"]);
        assert_eq!(m.containers().count(), 2);
        assert!(!m.is_trainable("blocks.0.attn.q_proj").unwrap());
        assert!(m.is_trainable("blocks.0.mlp.up_proj").unwrap());
        assert_eq!(m.injections().len(), 2);

        // Still a no-op at init
        let x = DMatrix::from_fn(2, 4, |r, c| (r + c) as f32 * 0.3);
        let mut reference = model();
        let info = RoutingInfo::new();
        let mut s = SelectorSet::new();
        let y = m.forward(&x, &mut ForwardContext::new(&info, &mut s, false)).unwrap();
        let y_ref = reference.forward(&x, &mut ForwardContext::new(&info, &mut s, false)).unwrap();
        assert_eq!(y, y_ref);
    }

    #[test]
    fn test_full_finetune_unfreezes_everything() {
        let registry = ModifierRegistry::default();
        let mut m = model();
        m.set_all_trainable(false);
        let mut rng = StdRng::seed_from_u64(0);
        let cfg = AdapterConfig::lora("down_proj").with_full_finetune(true);
        registry.apply(&mut m, &cfg, "e", None, &mut rng).unwrap();
        assert!(m.entries().iter().all(|e| e.trainable));
    }

    #[test]
    fn test_apply_rejects_unmatched_and_unsupported() {
        let registry = ModifierRegistry::default();
        let mut m = model();
        let mut rng = StdRng::seed_from_u64(0);
        let err = registry
            .apply(&mut m, &AdapterConfig::lora("nothing_here"), "e", None, &mut rng)
            .unwrap_err();
        assert!(matches!(err, ExpertError::Configuration(_)));

        let err = registry
            .apply(&mut m, &AdapterConfig::lora("norm|q_proj"), "e", None, &mut rng)
            .unwrap_err();
        assert!(matches!(err, ExpertError::UnsupportedLayerKind { .. }));
        assert_eq!(m.containers().count(), 0);

        registry
            .apply(&mut m, &AdapterConfig::layer_norm("norm"), "ln", None, &mut rng)
            .unwrap();
        assert_eq!(m.containers().count(), 2);
    }

    #[test]
    fn test_second_expert_joins_existing_container() {
        let registry = ModifierRegistry::default();
        let mut m = model();
        let mut rng = StdRng::seed_from_u64(0);
        let cfg = AdapterConfig::lora("q_proj");
        registry.apply(&mut m, &cfg, "a", None, &mut rng).unwrap();
        registry.apply(&mut m, &cfg, "b", None, &mut rng).unwrap();
        let c = m.container("blocks.1.attn.q_proj").unwrap();
        assert_eq!(c.expert_names(), vec!["a", "b"]);
        assert!(matches!(
            registry.apply(&mut m, &cfg, "a", None, &mut rng),
            Err(ExpertError::State(_))
        ));
        assert!(matches!(
            registry.apply(&mut m, &AdapterConfig::ia3("q_proj"), "c", None, &mut rng),
            Err(ExpertError::Incompatible { .. })
        ));
    }
}

//! Adapter configuration — the structural parameters persisted with every expert

use crate::error::{ExpertError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Closed set of adapter variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// Low-rank additive correction on a linear layer
    Lora,
    /// Multi-skill LoRA with per-split routing inside a single adapter
    SkilledLora,
    /// Channel-wise output rescaling (IA3)
    Ia3,
    /// Trainable gain of an RMS normalization layer
    LayerNorm,
}

impl AdapterKind {
    pub fn name(&self) -> &'static str {
        match self {
            AdapterKind::Lora => "lora",
            AdapterKind::SkilledLora => "skilled_lora",
            AdapterKind::Ia3 => "ia3",
            AdapterKind::LayerNorm => "ln",
        }
    }
}

/// Configuration for one adapter variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub kind: AdapterKind,
    /// Rank of the low-rank decomposition
    #[serde(default = "default_rank")]
    pub rank: usize,
    /// Scaling numerator; the correction is scaled by `alpha / rank`
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Dropout probability recorded for the training loop
    #[serde(default)]
    pub dropout: f64,
    /// Regex full-matched against a layer's parent path
    #[serde(default = "default_modules")]
    pub modify_modules: String,
    /// Regex full-matched against a layer's own name (last path segment)
    pub modify_layers: String,
    #[serde(default = "one")]
    pub n_splits: usize,
    #[serde(default = "one")]
    pub n_skills: usize,
    /// Ramp the correction in over the first 10k training steps
    #[serde(default)]
    pub warmup: bool,
    /// Draw the up-projection from the same uniform as the down-projection
    #[serde(default)]
    pub init_b_random: bool,
    /// Name of the base model the expert was trained on
    #[serde(default)]
    pub model: Option<String>,
    /// Train all base parameters instead of freezing the wrapped ones
    #[serde(default)]
    pub full_finetune: bool,
}

fn default_rank() -> usize {
    4
}

fn default_alpha() -> f64 {
    16.0
}

fn default_modules() -> String {
    ".*".to_string()
}

fn one() -> usize {
    1
}

impl AdapterConfig {
    pub fn new(kind: AdapterKind, modify_layers: impl Into<String>) -> Self {
        Self {
            kind,
            rank: default_rank(),
            alpha: default_alpha(),
            dropout: 0.0,
            modify_modules: default_modules(),
            modify_layers: modify_layers.into(),
            n_splits: 1,
            n_skills: 1,
            warmup: false,
            init_b_random: false,
            model: None,
            full_finetune: false,
        }
    }

    pub fn lora(modify_layers: impl Into<String>) -> Self {
        Self::new(AdapterKind::Lora, modify_layers)
    }

    pub fn skilled_lora(modify_layers: impl Into<String>, n_skills: usize, n_splits: usize) -> Self {
        Self {
            n_skills,
            n_splits,
            ..Self::new(AdapterKind::SkilledLora, modify_layers)
        }
    }

    pub fn ia3(modify_layers: impl Into<String>) -> Self {
        Self::new(AdapterKind::Ia3, modify_layers)
    }

    pub fn layer_norm(modify_layers: impl Into<String>) -> Self {
        Self::new(AdapterKind::LayerNorm, modify_layers)
    }

    pub fn with_rank(mut self, rank: usize) -> Self {
        self.rank = rank;
        self
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_warmup(mut self, warmup: bool) -> Self {
        self.warmup = warmup;
        self
    }

    pub fn with_random_b(mut self, init_b_random: bool) -> Self {
        self.init_b_random = init_b_random;
        self
    }

    pub fn with_modules(mut self, modify_modules: impl Into<String>) -> Self {
        self.modify_modules = modify_modules.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_full_finetune(mut self, full_finetune: bool) -> Self {
        self.full_finetune = full_finetune;
        self
    }

    /// `alpha / rank`
    pub fn scaling(&self) -> f64 {
        self.alpha / self.rank.max(1) as f64
    }

    pub fn validate(&self) -> Result<()> {
        if self.rank == 0 {
            return Err(ExpertError::config("rank must be > 0"));
        }
        if !(self.alpha.is_finite() && self.alpha > 0.0) {
            return Err(ExpertError::config(format!("alpha must be > 0, got {}", self.alpha)));
        }
        if !(0.0..=1.0).contains(&self.dropout) {
            return Err(ExpertError::config("dropout must be between 0 and 1"));
        }
        if self.n_splits == 0 || self.n_skills == 0 {
            return Err(ExpertError::config("n_splits and n_skills must be >= 1"));
        }
        self.layer_pattern()?;
        self.module_pattern()?;
        Ok(())
    }

    pub fn layer_pattern(&self) -> Result<Regex> {
        anchored(&self.modify_layers)
    }

    pub fn module_pattern(&self) -> Result<Regex> {
        anchored(&self.modify_modules)
    }

    /// Compiled layer/module patterns, for matching many paths
    pub fn matcher(&self) -> Result<LayerMatcher> {
        Ok(LayerMatcher {
            layers: self.layer_pattern()?,
            modules: self.module_pattern()?,
        })
    }

    /// Whether the fully-qualified `path` is targeted by this config
    pub fn matches(&self, path: &str) -> Result<bool> {
        Ok(self.matcher()?.is_match(path))
    }
}

/// `modify_modules` / `modify_layers` compiled once
#[derive(Debug, Clone)]
pub struct LayerMatcher {
    layers: Regex,
    modules: Regex,
}

impl LayerMatcher {
    /// The parent path must match the module pattern and the last segment
    /// the layer pattern
    pub fn is_match(&self, path: &str) -> bool {
        let (parent, name) = match path.rsplit_once('.') {
            Some((parent, name)) => (parent, name),
            None => ("", path),
        };
        self.modules.is_match(parent) && self.layers.is_match(name)
    }
}

fn anchored(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{})$", pattern))
        .map_err(|e| ExpertError::config(format!("invalid layer pattern '{}': {}", pattern, e)))
}

//! Polylora — composable LoRA experts
//!
//! Parameter-efficient adapters (LoRA, skilled LoRA, IA³, layer-norm) are
//! injected into a frozen base model, routed per example or per token by
//! pluggable selectors, folded into base weights on demand, and persisted in
//! an expert library that supports merging, clustering and prototype
//! extraction.

pub mod adapters;
pub mod config;
pub mod containers;
pub mod distributed;
pub mod error;
pub mod evolution;
pub mod library;
pub mod model;
pub mod modifiers;
pub mod selectors;
pub mod tensor;
pub mod transforms;

pub use adapters::{Adapter, AdapterConfig, AdapterKind};
pub use config::RuntimeConfig;
pub use containers::{ContainerState, ExpertContainer, ForwardContext};
pub use distributed::{replica_group, ReplicaHandle};
pub use error::{ExpertError, Result};
pub use evolution::{EvolutionConfig, EvolutionOutcome, Evolver};
pub use library::{BlobStore, Expert, ExpertInfo, ExpertLibrary, LibraryOptions, LocalBlobStore, RetryPolicy};
pub use model::{BaseModel, ExpertAction, MultiExpertModel, RoutingInfo};
pub use modifiers::ModifierRegistry;
pub use selectors::{Selector, SelectorConfig, SelectorRegistry};
pub use tensor::{Tensor, WideTensor};
pub use transforms::{ArrowTransform, LibraryTransform, MbcWithCosSim, SvdEmbedding, TiesMerge, WeightedLinearMerge};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{LayerTensors, LORA_A, LORA_B};
    use crate::library::ExpertWeights;
    use crate::model::Linear;
    use crate::tensor::widen;
    use crate::transforms::testing::lora_expert;
    use nalgebra::DMatrix;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    fn single_layer(linear: Linear) -> BaseModel {
        BaseModel::new("e2e").linear("proj", linear)
    }

    fn input() -> Tensor {
        DMatrix::from_fn(3, 8, |r, c| ((r * 8 + c) as f32 * 0.29).cos())
    }

    #[test]
    fn test_scaled_correction_through_model() {
        let mut rng = StdRng::seed_from_u64(11);
        let linear = Linear::random(8, 8, &mut rng);
        let config = AdapterConfig::lora("proj").with_rank(2).with_alpha(16.0).with_model("e2e");
        assert!((config.scaling() - 8.0).abs() < 1e-12);
        let x = input();
        let base_out = linear.forward(&x);

        let mut empty = MultiExpertModel::new(single_layer(linear.clone()), 0);
        empty.add_empty_expert("fresh", &config, true).unwrap();
        assert_eq!(empty.forward(&x, &RoutingInfo::new()).unwrap(), base_out);

        let a = DMatrix::from_fn(8, 2, |r, c| 0.1 * (r as f64 - 2.0 * c as f64));
        let b = DMatrix::from_fn(2, 8, |r, c| 0.02 * (r as f64 + 1.0) * (c as f64 - 3.5));
        let mut tensors = LayerTensors::new();
        tensors.insert(LORA_A.into(), a.clone());
        tensors.insert(LORA_B.into(), b.clone());
        let mut weights = ExpertWeights::new();
        weights.insert("proj".into(), tensors);
        let expert = Expert::new(config, weights, ExpertInfo::new("known"));

        let mut m = MultiExpertModel::new(single_layer(linear), 0);
        m.add_expert(&expert, ExpertAction::Route, true).unwrap();
        let y = m.forward(&x, &RoutingInfo::new()).unwrap();
        let expected = widen(&base_out) + (widen(&x) * &a * &b) * 8.0;
        for (got, want) in y.iter().zip(expected.iter()) {
            assert!((*got as f64 - want).abs() < 1e-5, "{} vs {}", got, want);
        }
    }

    #[test]
    fn test_library_to_arrow_routing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalBlobStore::new(dir.path()).unwrap());
        let library = Arc::new(ExpertLibrary::open(store, "pipeline-arrow", LibraryOptions::create()).unwrap());
        for (name, scale) in [("a", 1.0), ("b", -0.5), ("c", 2.0)] {
            let e = lora_expert(name, move |l, r, c| scale * ((l + 2 * r + c) as f64 * 0.3).sin());
            library.add_expert(&e, None, false).unwrap();
        }

        let arrow = ArrowTransform::new();
        let protos = arrow.transform(&library, false).unwrap();
        assert_eq!(protos.len(), 3);

        let mut rng = StdRng::seed_from_u64(2);
        let base = BaseModel::toy("toy", 4, 2, &mut rng);
        let mut m = MultiExpertModel::new(base, 0).with_library(library.clone());
        m.load_from_library(&library, None, ExpertAction::Route).unwrap();
        m.set_selector(SelectorConfig::arrow(arrow.data_id(), Some(2))).unwrap();

        let x = DMatrix::from_fn(2, 4, |r, c| (r as f32 - c as f32) * 0.25);
        let y = m.forward(&x, &RoutingInfo::new()).unwrap();
        assert_eq!(y.shape(), (2, 4));
        assert!(y.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_cluster_then_merge_each_group() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalBlobStore::new(dir.path()).unwrap());
        let library = ExpertLibrary::open(store, "pipeline-mbc", LibraryOptions::create()).unwrap();
        for (name, f) in [
            ("p1", 1.0),
            ("p2", 2.0),
            ("n1", -1.0),
            ("n2", -3.0),
        ] {
            let e = if name.starts_with('p') {
                lora_expert(name, move |l, r, c| f * (l + r + c + 1) as f64)
            } else {
                lora_expert(name, move |l, r, c| f * if (r + c + l) % 2 == 0 { 1.0 } else { -1.0 })
            };
            library.add_expert(&e, None, false).unwrap();
        }

        let mbc = MbcWithCosSim::new(2).with_embedding(SvdEmbedding::new(3, 0.0));
        let clusters = mbc.transform(&library, false).unwrap();
        assert_eq!(clusters.values().map(|v| v.len()).sum::<usize>(), 4);

        for (id, members) in &clusters {
            let merged = TiesMerge::new(format!("cluster_{}", id))
                .with_experts(members.clone())
                .transform(&library, false)
                .unwrap();
            library.add_expert(&merged, None, false).unwrap();
        }
        assert_eq!(library.len(), 4 + clusters.len());
    }
}

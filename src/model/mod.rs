//! Model layer — the base model adapters are injected into, and the
//! multi-expert orchestration on top of it

pub mod base;
pub mod expert_model;
mod layers;
mod routing;

pub use base::{BaseModel, Injection, InjectionLog, Module, ModelEntry};
pub use expert_model::{ExpertAction, MultiExpertModel};
pub use layers::{Activation, Layer, LayerNorm, Linear};
pub use routing::RoutingInfo;

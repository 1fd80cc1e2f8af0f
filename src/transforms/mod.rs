//! Library transforms — batch algorithms over the experts of a library
//!
//! Transforms never mutate stored experts. Merges return a new [`Expert`];
//! embeddings, clusters and prototypes return derived data, and the cached
//! ones are written back as library auxiliary data.

pub mod arrow;
pub mod cluster;
pub mod merge;
pub mod svd;

pub use arrow::{ArrowTransform, PrototypeTable, TieOp, TiePolicy, ARROW_KIND};
pub use cluster::MbcWithCosSim;
pub use merge::{TiesMerge, WeightedLinearMerge};
pub use svd::{SvdEmbedding, EMBEDDINGS_KIND};

use crate::error::{ExpertError, Result};
use crate::library::{Expert, ExpertLibrary};
use log::debug;

/// A batch computation over (a subset of) a library
pub trait LibraryTransform {
    type Output;

    fn name(&self) -> &'static str;

    /// Run over `library`; `force` recomputes cached results
    fn transform(&self, library: &ExpertLibrary, force: bool) -> Result<Self::Output>;
}

/// Fetch `names`, or every visible expert when `None`
pub(crate) fn load_experts(library: &ExpertLibrary, names: Option<&[String]>) -> Result<Vec<Expert>> {
    let names = match names {
        Some(names) => names.to_vec(),
        None => library.list(),
    };
    if names.is_empty() {
        return Err(ExpertError::not_found(format!("experts to transform in library '{}'", library.id())));
    }
    debug!("Loading {} experts from '{}'", names.len(), library.id());
    names.iter().map(|n| library.get(n)).collect()
}

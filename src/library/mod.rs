//! Expert library — named experts plus auxiliary data over a blob store
//!
//! Layout of one library container:
//! - `{name}.meta`: JSON with config, info, the checkpoint file name and
//!   the sha256 of the weights
//! - `{name}.{digest}.ckpt`: bincode-encoded weights, named by the first
//!   16 hex digits of their sha256
//! - `{name}.{kind}.aux`: JSON auxiliary payloads keyed by data id
//! - `README.md`: human-readable index, rewritten on a best-effort basis
//!
//! The meta object is the commit point of an expert: it is written after its
//! checkpoint and deleted before it, so a failed call never leaves a meta
//! pointing at missing or foreign weights. Superseded checkpoints are
//! removed once the new meta is in place.
//!
//! Metadata is held in memory behind a `RwLock`; weights are fetched on
//! demand. Every mutation is persisted before it returns.

pub mod expert;
pub mod retry;
pub mod store;

pub use expert::{Expert, ExpertInfo, ExpertWeights};
pub use retry::RetryPolicy;
pub use store::{BlobStore, FileInfo, LocalBlobStore};

use crate::adapters::AdapterConfig;
use crate::error::{ExpertError, Result};
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

const META_EXT: &str = ".meta";
const CKPT_EXT: &str = ".ckpt";
const AUX_EXT: &str = ".aux";
const README: &str = "README.md";

/// How a library is opened and which entries it exposes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LibraryOptions {
    /// Only expose experts trained on this base model
    #[serde(default)]
    pub model_name: Option<String>,
    /// Experts hidden from listing and selection
    #[serde(default)]
    pub exclude_selection: Vec<String>,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Create the container if it does not exist yet
    #[serde(default)]
    pub create: bool,
}

impl LibraryOptions {
    pub fn create() -> Self {
        Self {
            create: true,
            ..Self::default()
        }
    }
}

/// Persisted per-expert metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExpertMeta {
    config: AdapterConfig,
    info: ExpertInfo,
    weights_sha256: String,
    /// Checkpoint object; absent in metas written before checkpoints were
    /// content-addressed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    weights_file: Option<String>,
}

impl ExpertMeta {
    fn model(&self) -> Option<&str> {
        self.info.model.as_deref().or(self.config.model.as_deref())
    }

    fn ckpt_file(&self, name: &str) -> String {
        self.weights_file
            .clone()
            .unwrap_or_else(|| format!("{}{}", name, CKPT_EXT))
    }
}

/// (data kind, expert name) → data id → payload
type AuxTable = BTreeMap<(String, String), BTreeMap<String, serde_json::Value>>;

#[derive(Default)]
struct LibraryState {
    meta: BTreeMap<String, ExpertMeta>,
    aux: AuxTable,
}

pub struct ExpertLibrary {
    repo_id: String,
    /// Store location plus container; unique per stored library
    uri: String,
    store: Arc<dyn BlobStore>,
    options: LibraryOptions,
    state: RwLock<LibraryState>,
}

impl std::fmt::Debug for ExpertLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpertLibrary")
            .field("uri", &self.uri)
            .field("options", &self.options)
            .field("experts", &self.state.read().meta.len())
            .finish()
    }
}

fn aux_file(kind: &str, expert: &str) -> String {
    format!("{}.{}{}", expert, kind, AUX_EXT)
}

fn meta_file(expert: &str) -> String {
    format!("{}{}", expert, META_EXT)
}

fn ckpt_file(expert: &str, digest: &str) -> String {
    format!("{}.{}{}", expert, digest.get(..16).unwrap_or(digest), CKPT_EXT)
}

impl ExpertLibrary {
    /// Open (or with `options.create`, create) the library in `repo_id`
    pub fn open(store: Arc<dyn BlobStore>, repo_id: impl Into<String>, options: LibraryOptions) -> Result<Self> {
        let repo_id = repo_id.into();
        let exists = {
            let (store, repo) = (store.clone(), repo_id.clone());
            options
                .retry
                .run_bounded("container_exists", move || store.container_exists(&repo))?
        };
        let library = Self {
            uri: format!("{}/{}", store.location(), repo_id),
            repo_id,
            store,
            options,
            state: RwLock::new(LibraryState::default()),
        };
        if !exists {
            if !library.options.create {
                return Err(ExpertError::not_found(format!("expert library '{}'", library.repo_id)));
            }
            library.store_call("create_container", |store, repo| store.create_container(repo))?;
            library.refresh_readme(&library.state.read());
            info!("Created expert library '{}'", library.repo_id);
        } else {
            library.load()?;
        }
        Ok(library)
    }

    fn load(&self) -> Result<()> {
        let files = self.store_call("list_files", |store, repo| store.list_files(repo))?;
        let mut state = LibraryState::default();
        for file in &files {
            if let Some(name) = file.name.strip_suffix(META_EXT) {
                let bytes = self.read_object(&file.name)?;
                let meta: ExpertMeta = serde_json::from_slice(&bytes)?;
                state.meta.insert(name.to_string(), meta);
            } else if let Some(stem) = file.name.strip_suffix(AUX_EXT) {
                match stem.rsplit_once('.') {
                    Some((expert, kind)) => {
                        let bytes = self.read_object(&file.name)?;
                        let payloads: BTreeMap<String, serde_json::Value> = serde_json::from_slice(&bytes)?;
                        state.aux.insert((kind.to_string(), expert.to_string()), payloads);
                    }
                    None => warn!("Skipping malformed auxiliary file '{}'", file.name),
                }
            }
        }
        info!(
            "Loaded expert library '{}': {} experts, {} auxiliary entries",
            self.repo_id,
            state.meta.len(),
            state.aux.len()
        );
        *self.state.write() = state;
        Ok(())
    }

    /// Run one store call under the retry policy and its per-call limit
    fn store_call<T, F>(&self, op: &str, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&dyn BlobStore, &str) -> Result<T> + Send + Sync + 'static,
    {
        let store = self.store.clone();
        let repo = self.repo_id.clone();
        self.options
            .retry
            .run_bounded(op, move || call(store.as_ref(), &repo))
    }

    fn read_object(&self, name: &str) -> Result<Vec<u8>> {
        let name = name.to_string();
        self.store_call("download", move |store, repo| {
            let path = store.download(repo, &name)?;
            Ok(std::fs::read(path)?)
        })
    }

    fn upload(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let name = name.to_string();
        let bytes = bytes.to_vec();
        self.store_call("upload", move |store, repo| store.upload(repo, &name, &bytes))
    }

    fn delete_object(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        match self.store_call("delete", move |store, repo| store.delete(repo, &name)) {
            Err(ExpertError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    /// Delete an object nothing refers to any more; failures only leak it
    fn discard(&self, name: &str) {
        if let Err(e) = self.delete_object(name) {
            warn!("Could not remove unreferenced '{}' from '{}': {}", name, self.repo_id, e);
        }
    }

    pub fn id(&self) -> &str {
        &self.repo_id
    }

    /// Store location and container, e.g. `file:///data/libs/my-repo`
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn options(&self) -> &LibraryOptions {
        &self.options
    }

    /// Whether filters hide part of the stored entries
    pub fn is_sliced(&self) -> bool {
        self.options.model_name.is_some() || !self.options.exclude_selection.is_empty()
    }

    /// Whether the slice this library was opened with covers the entry
    fn passes_filters(&self, name: &str, meta: &ExpertMeta) -> bool {
        if self.options.exclude_selection.iter().any(|e| e == name) {
            return false;
        }
        match &self.options.model_name {
            Some(model) => meta.model() == Some(model.as_str()),
            None => true,
        }
    }

    fn is_visible(&self, name: &str, meta: &ExpertMeta) -> bool {
        !meta.info.deleted && self.passes_filters(name, meta)
    }

    /// Visible expert names, sorted
    pub fn list(&self) -> Vec<String> {
        let state = self.state.read();
        state
            .meta
            .iter()
            .filter(|(name, meta)| self.is_visible(name, meta))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.list().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, name: &str) -> bool {
        let state = self.state.read();
        state.meta.get(name).map(|m| self.is_visible(name, m)).unwrap_or(false)
    }

    /// Soft-deleted experts, which `unremove` can restore
    pub fn deleted(&self) -> Vec<String> {
        let state = self.state.read();
        state
            .meta
            .iter()
            .filter(|(_, m)| m.info.deleted)
            .map(|(n, _)| n.clone())
            .collect()
    }

    pub fn get_metadata(&self, name: &str) -> Result<ExpertInfo> {
        let state = self.state.read();
        match state.meta.get(name) {
            Some(meta) if self.is_visible(name, meta) => Ok(meta.info.clone()),
            _ => Err(ExpertError::not_found(format!("expert '{}' in library '{}'", name, self.repo_id))),
        }
    }

    /// Fetch an expert's weights and verify their digest
    pub fn get(&self, name: &str) -> Result<Expert> {
        let meta = {
            let state = self.state.read();
            match state.meta.get(name) {
                Some(meta) if self.is_visible(name, meta) => meta.clone(),
                _ => {
                    return Err(ExpertError::not_found(format!(
                        "expert '{}' in library '{}'",
                        name, self.repo_id
                    )))
                }
            }
        };
        let bytes = self.read_object(&meta.ckpt_file(name))?;
        let digest = Expert::digest(&bytes);
        if digest != meta.weights_sha256 {
            return Err(ExpertError::incompatible(
                format!("weights digest of '{}'", name),
                &meta.weights_sha256,
                digest,
            ));
        }
        let weights = Expert::decode_weights(&bytes)?;
        debug!("Fetched expert '{}' ({} layers)", name, weights.len());
        Ok(Expert::new(meta.config, weights, meta.info))
    }

    /// Persist `expert` under `name` (default: its own name).
    ///
    /// An existing entry is only overwritten with `force`; otherwise the call
    /// fails and the library is left untouched. A failed overwrite leaves the
    /// previous version readable.
    pub fn add_expert(&self, expert: &Expert, name: Option<&str>, force: bool) -> Result<()> {
        let name = name.unwrap_or_else(|| expert.name()).to_string();
        if name.is_empty() || name.contains('/') {
            return Err(ExpertError::config(format!("invalid expert name '{}'", name)));
        }
        expert.validate()?;
        if let Some(model) = &self.options.model_name {
            if expert.model_name() != Some(model.as_str()) {
                return Err(ExpertError::incompatible(
                    format!("base model of expert '{}'", name),
                    model,
                    expert.model_name().unwrap_or("<none>"),
                ));
            }
        }

        let mut state = self.state.write();
        let previous = state.meta.get(&name).map(|m| m.ckpt_file(&name));
        if let Some(existing) = state.meta.get(&name) {
            if !force {
                return Err(ExpertError::state(format!(
                    "expert '{}' already exists in library '{}'{}",
                    name,
                    self.repo_id,
                    if existing.info.deleted { " (soft-deleted)" } else { "" }
                )));
            }
        }

        let mut info = expert.info.clone();
        info.expert_name = name.clone();
        info.deleted = false;
        let bytes = expert.encode_weights()?;
        let digest = Expert::digest(&bytes);
        let ckpt = ckpt_file(&name, &digest);
        let meta = ExpertMeta {
            config: expert.config.clone(),
            info,
            weights_sha256: digest,
            weights_file: Some(ckpt.clone()),
        };
        let meta_bytes = serde_json::to_vec_pretty(&meta)?;

        let fresh_ckpt = previous.as_deref() != Some(ckpt.as_str());
        if fresh_ckpt {
            self.upload(&ckpt, &bytes)?;
        }
        if let Err(e) = self.upload(&meta_file(&name), &meta_bytes) {
            if fresh_ckpt {
                self.discard(&ckpt);
            }
            return Err(e);
        }
        state.meta.insert(name.clone(), meta);
        if let Some(old) = previous.filter(|old| *old != ckpt) {
            self.discard(&old);
        }
        self.refresh_readme(&state);
        info!("Added expert '{}' to library '{}'", name, self.repo_id);
        Ok(())
    }

    /// Soft removal hides the entry; hard removal deletes it and its data.
    ///
    /// Only entries inside this library's slice can be removed; soft removal
    /// also needs the entry to be live.
    pub fn remove(&self, name: &str, soft: bool) -> Result<()> {
        let mut state = self.state.write();
        let meta = match state.meta.get(name) {
            Some(meta) if self.passes_filters(name, meta) && !(soft && meta.info.deleted) => meta.clone(),
            _ => {
                return Err(ExpertError::not_found(format!(
                    "expert '{}' in library '{}'",
                    name, self.repo_id
                )))
            }
        };
        if soft {
            let mut hidden = meta;
            hidden.info.deleted = true;
            self.upload(&meta_file(name), &serde_json::to_vec_pretty(&hidden)?)?;
            state.meta.insert(name.to_string(), hidden);
            info!("Soft-deleted expert '{}'", name);
        } else {
            let aux_keys: Vec<(String, String)> = state.aux.keys().filter(|(_, e)| e == name).cloned().collect();
            for key in aux_keys {
                self.delete_object(&aux_file(&key.0, &key.1))?;
                state.aux.remove(&key);
            }
            self.delete_object(&meta_file(name))?;
            state.meta.remove(name);
            self.discard(&meta.ckpt_file(name));
            info!("Deleted expert '{}'", name);
        }
        self.refresh_readme(&state);
        Ok(())
    }

    /// Restore a soft-deleted expert
    pub fn unremove(&self, name: &str) -> Result<()> {
        let mut state = self.state.write();
        let bytes = match state.meta.get(name) {
            Some(meta) if !self.passes_filters(name, meta) => {
                return Err(ExpertError::not_found(format!("deleted expert '{}'", name)))
            }
            Some(meta) if meta.info.deleted => {
                let mut meta = meta.clone();
                meta.info.deleted = false;
                serde_json::to_vec_pretty(&meta)?
            }
            Some(_) => return Err(ExpertError::state(format!("expert '{}' is not deleted", name))),
            None => return Err(ExpertError::not_found(format!("deleted expert '{}'", name))),
        };
        self.upload(&meta_file(name), &bytes)?;
        if let Some(meta) = state.meta.get_mut(name) {
            meta.info.deleted = false;
        }
        self.refresh_readme(&state);
        info!("Restored expert '{}'", name);
        Ok(())
    }

    /// Auxiliary payloads of `kind` under `data_id`, per expert.
    ///
    /// With `name = None` every visible expert is considered, plus entries
    /// for names that are not library experts (such as `base_model`).
    pub fn get_auxiliary(
        &self,
        kind: &str,
        name: Option<&str>,
        data_id: &str,
    ) -> Result<BTreeMap<String, serde_json::Value>> {
        let state = self.state.read();
        let mut out = BTreeMap::new();
        for ((k, expert), payloads) in &state.aux {
            if k != kind || name.map(|n| n != expert).unwrap_or(false) {
                continue;
            }
            let visible = match state.meta.get(expert) {
                Some(meta) => self.is_visible(expert, meta),
                None => true,
            };
            if let (true, Some(payload)) = (visible, payloads.get(data_id)) {
                out.insert(expert.clone(), payload.clone());
            }
        }
        Ok(out)
    }

    pub fn add_auxiliary(
        &self,
        kind: &str,
        name: &str,
        data_id: &str,
        payload: serde_json::Value,
        force: bool,
    ) -> Result<()> {
        if kind.contains('.') || kind.is_empty() {
            return Err(ExpertError::config(format!("invalid auxiliary kind '{}'", kind)));
        }
        let mut state = self.state.write();
        if let Some(meta) = state.meta.get(name) {
            if meta.info.deleted {
                return Err(ExpertError::not_found(format!("expert '{}' is deleted", name)));
            }
        }
        let key = (kind.to_string(), name.to_string());
        let mut payloads = state.aux.get(&key).cloned().unwrap_or_default();
        if payloads.contains_key(data_id) && !force {
            return Err(ExpertError::state(format!(
                "auxiliary '{}' data '{}' for '{}' already exists",
                kind, data_id, name
            )));
        }
        payloads.insert(data_id.to_string(), payload);
        self.upload(&aux_file(kind, name), &serde_json::to_vec(&payloads)?)?;
        state.aux.insert(key, payloads);
        debug!("Stored auxiliary '{}' data '{}' for '{}'", kind, data_id, name);
        Ok(())
    }

    /// Mirror every visible expert and its auxiliary data into a new library
    pub fn create_from_remote(
        remote: &ExpertLibrary,
        destination: Arc<dyn BlobStore>,
        repo_id: impl Into<String>,
        options: LibraryOptions,
    ) -> Result<ExpertLibrary> {
        let local = ExpertLibrary::open(destination, repo_id, LibraryOptions { create: true, ..options })?;
        for name in remote.list() {
            let expert = remote.get(&name)?;
            local.add_expert(&expert, Some(&name), true)?;
        }
        let aux: Vec<((String, String), BTreeMap<String, serde_json::Value>)> = {
            let state = remote.state.read();
            state
                .aux
                .iter()
                .filter(|((_, e), _)| match state.meta.get(e) {
                    Some(meta) => remote.is_visible(e, meta),
                    None => true,
                })
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        for ((kind, expert), payloads) in aux {
            for (data_id, payload) in payloads {
                local.add_auxiliary(&kind, &expert, &data_id, payload, true)?;
            }
        }
        info!(
            "Mirrored {} experts from '{}' into '{}'",
            local.len(),
            remote.id(),
            local.id()
        );
        Ok(local)
    }

    /// The README is derived data; a failed rewrite is logged, not returned
    fn refresh_readme(&self, state: &LibraryState) {
        if let Err(e) = self.write_readme(state) {
            warn!("Could not update README of '{}': {}", self.repo_id, e);
        }
    }

    fn write_readme(&self, state: &LibraryState) -> Result<()> {
        let mut md = format!("# Expert library `{}`\n\n", self.repo_id);
        md.push_str("| name | task | model | kind | rank | parent | created | deleted |\n");
        md.push_str("|---|---|---|---|---|---|---|---|\n");
        for (name, meta) in &state.meta {
            md.push_str(&format!(
                "| {} | {} | {} | {} | {} | {} | {} | {} |\n",
                name,
                meta.info.expert_task_name.as_deref().unwrap_or("-"),
                meta.model().unwrap_or("-"),
                meta.config.kind.name(),
                meta.config.rank,
                meta.info.parent_node.as_deref().unwrap_or("-"),
                meta.info.created_at.format("%Y-%m-%d %H:%M:%S"),
                meta.info.deleted
            ));
        }
        self.upload(README, md.as_bytes())
    }

    pub fn summary(&self) -> String {
        let state = self.state.read();
        format!(
            "Library '{}': {} visible / {} stored experts, {} auxiliary entries{}",
            self.repo_id,
            state.meta.iter().filter(|(n, m)| self.is_visible(n, m)).count(),
            state.meta.len(),
            state.aux.len(),
            if self.is_sliced() { " (sliced)" } else { "" }
        )
    }
}

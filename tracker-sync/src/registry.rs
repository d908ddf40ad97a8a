//! Resource registry
//!
//! Maps each record kind to its remote client and composite rules. Built
//! once at startup and shared by both pipelines.

use crate::error::{SyncError, SyncResult};
use crate::record::RecordKind;
use crate::remote::{RemoteResource, ServerClock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Wiring of one record kind
#[derive(Clone)]
pub struct ResourceBinding {
    pub kind: RecordKind,
    pub remote: Arc<dyn RemoteResource>,
    /// Kind of the required parent, pushed before this one
    pub parent_kind: Option<RecordKind>,
    /// Kinds making up the child subtree owned by a record of this kind
    pub cascade: Vec<RecordKind>,
}

impl ResourceBinding {
    pub fn new(kind: impl Into<RecordKind>, remote: Arc<dyn RemoteResource>) -> Self {
        Self {
            kind: kind.into(),
            remote,
            parent_kind: None,
            cascade: Vec::new(),
        }
    }

    pub fn with_parent(mut self, parent_kind: impl Into<RecordKind>) -> Self {
        self.parent_kind = Some(parent_kind.into());
        self
    }

    pub fn with_cascade<K: Into<RecordKind>>(mut self, kinds: impl IntoIterator<Item = K>) -> Self {
        self.cascade = kinds.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_composite(&self) -> bool {
        !self.cascade.is_empty()
    }
}

impl fmt::Debug for ResourceBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceBinding")
            .field("kind", &self.kind)
            .field("parent_kind", &self.parent_kind)
            .field("cascade", &self.cascade)
            .finish_non_exhaustive()
    }
}

/// Registered resources in push order, plus the server clock
pub struct ResourceRegistry {
    clock: Arc<dyn ServerClock>,
    bindings: Vec<ResourceBinding>,
    index: HashMap<RecordKind, usize>,
}

impl ResourceRegistry {
    pub fn builder(clock: Arc<dyn ServerClock>) -> RegistryBuilder {
        RegistryBuilder {
            clock,
            bindings: Vec::new(),
        }
    }

    pub fn get(&self, kind: &RecordKind) -> SyncResult<&ResourceBinding> {
        self.index
            .get(kind)
            .map(|&i| &self.bindings[i])
            .ok_or_else(|| {
                SyncError::NotFound(format!("No resource registered for kind: {}", kind))
            })
    }

    /// Bindings in registration order, parents before children
    pub fn bindings(&self) -> &[ResourceBinding] {
        &self.bindings
    }

    pub fn kinds(&self) -> Vec<RecordKind> {
        self.bindings.iter().map(|b| b.kind.clone()).collect()
    }

    pub fn clock(&self) -> &Arc<dyn ServerClock> {
        &self.clock
    }
}

pub struct RegistryBuilder {
    clock: Arc<dyn ServerClock>,
    bindings: Vec<ResourceBinding>,
}

impl RegistryBuilder {
    pub fn register(mut self, binding: ResourceBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Validate and freeze the registry.
    ///
    /// Fails on an empty or duplicate kind, and on a binding whose parent
    /// kind was not registered before it.
    pub fn build(self) -> SyncResult<ResourceRegistry> {
        let mut index = HashMap::with_capacity(self.bindings.len());

        for (position, binding) in self.bindings.iter().enumerate() {
            if binding.kind.is_empty() {
                return Err(SyncError::InvalidOperation(
                    "Resource kind must not be empty".to_string(),
                ));
            }
            if let Some(parent) = &binding.parent_kind {
                if !index.contains_key(parent) {
                    return Err(SyncError::InvalidOperation(format!(
                        "{} must be registered after its parent kind {}",
                        binding.kind, parent
                    )));
                }
            }
            if index.insert(binding.kind.clone(), position).is_some() {
                return Err(SyncError::InvalidOperation(format!(
                    "Resource kind registered twice: {}",
                    binding.kind
                )));
            }
        }

        tracing::debug!(resources = self.bindings.len(), "Built resource registry");

        Ok(ResourceRegistry {
            clock: self.clock,
            bindings: self.bindings,
            index,
        })
    }
}

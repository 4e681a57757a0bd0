//! Shared controller helpers.
//!
//! Object keys in the `namespace/name` format used by the caches and the queue.

use std::fmt;

use kube::ResourceExt;

use crate::controller::error::{Error, Result};

/// Identity of a namespaced (or cluster-scoped) object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string),
            name: name.to_string(),
        }
    }

    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self::new(Some(namespace), name)
    }

    /// Key of a resource, or `None` when the object carries no name.
    pub fn from_resource<K: ResourceExt>(obj: &K) -> Option<Self> {
        let name = obj.meta().name.as_deref().filter(|n| !n.is_empty())?;
        Some(Self::new(obj.meta().namespace.as_deref(), name))
    }

    /// Split a `namespace/name` (or bare `name`) key.
    pub fn parse(key: &str) -> Result<Self> {
        let mut parts = key.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) if !name.is_empty() => Ok(Self::new(None, name)),
            (Some(ns), Some(name), None) if !name.is_empty() => Ok(Self::new(Some(ns), name)),
            _ => Err(Error::InvalidKey(key.to_string())),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

//! Meridian core types: cluster-wide keys, policy and binding views over
//! dynamic objects, selector matching, event filtering and errors.

#![forbid(unsafe_code)]

pub mod binding;
pub mod error;
pub mod eventfilter;
pub mod keys;
pub mod labels;
pub mod policy;
pub mod selector;

use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};

pub use error::{DetectorError, StoreError};
pub use keys::{ClusterWideKey, NamespacedKey, ResourceKey};
pub use policy::{Policy, PolicyScope, PropagationSpec, ResourceSelector};

pub mod prelude {
    pub use super::{
        ClusterWideKey, DetectorError, NamespacedKey, ObjectEvent, Policy, PolicyScope, PropagationSpec,
        ResourceKey, ResourceSelector, StoreError,
    };
}

/// A store notification, decoded once at the ingestion boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ObjectEvent {
    Added(DynamicObject),
    Updated { old: DynamicObject, new: DynamicObject },
    Deleted(DynamicObject),
}

impl ObjectEvent {
    /// The most recent state carried by the event.
    pub fn object(&self) -> &DynamicObject {
        match self {
            ObjectEvent::Added(o) | ObjectEvent::Deleted(o) => o,
            ObjectEvent::Updated { new, .. } => new,
        }
    }
}

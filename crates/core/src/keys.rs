//! Keying: identities used as queue payloads and set members.

use std::fmt;

use kube::core::{DynamicObject, GroupVersionKind};
use serde::{Deserialize, Serialize};

use crate::binding::ObjectReference;
use crate::error::DetectorError;

/// Globally unique identity of a resource template.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterWideKey {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ClusterWideKey {
    pub fn from_object(obj: &DynamicObject) -> Result<Self, DetectorError> {
        let types = obj
            .types
            .as_ref()
            .ok_or_else(|| DetectorError::Selector("object missing apiVersion/kind".into()))?;
        let (group, version) = split_api_version(&types.api_version);
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| DetectorError::Selector("object missing metadata.name".into()))?;
        Ok(Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: types.kind.clone(),
            namespace: obj.metadata.namespace.clone().unwrap_or_default(),
            name,
        })
    }

    pub fn from_reference(r: &ObjectReference) -> Result<Self, DetectorError> {
        if r.api_version.is_empty() || r.kind.is_empty() || r.name.is_empty() {
            return Err(DetectorError::Selector(format!(
                "incomplete object reference: apiVersion={:?} kind={:?} name={:?}",
                r.api_version, r.kind, r.name
            )));
        }
        let (group, version) = split_api_version(&r.api_version);
        Ok(Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: r.kind.clone(),
            namespace: r.namespace.clone().unwrap_or_default(),
            name: r.name.clone(),
        })
    }

    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn namespace(&self) -> Option<&str> {
        if self.namespace.is_empty() { None } else { Some(self.namespace.as_str()) }
    }

    /// `namespace/name`, or just `name` for cluster-scoped objects.
    pub fn namespace_key(&self) -> String {
        if self.namespace.is_empty() { self.name.clone() } else { format!("{}/{}", self.namespace, self.name) }
    }
}

impl fmt::Display for ClusterWideKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, kind={}, {}", self.api_version(), self.kind, self.namespace_key())
    }
}

/// Identity of a policy object within its scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespacedKey {
    pub namespace: String,
    pub name: String,
}

impl NamespacedKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.unwrap_or_default().to_string(), name: name.to_string() }
    }

    pub fn namespace(&self) -> Option<&str> {
        if self.namespace.is_empty() { None } else { Some(self.namespace.as_str()) }
    }
}

impl fmt::Display for NamespacedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() { write!(f, "{}", self.name) } else { write!(f, "{}/{}", self.namespace, self.name) }
    }
}

/// Queue payload for the resource-template worker.
///
/// `change_by_system` records whether the triggering change was made by this
/// system itself; lazily activated policies ignore such changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub key: ClusterWideKey,
    pub change_by_system: bool,
}

impl ResourceKey {
    pub fn user(key: ClusterWideKey) -> Self { Self { key, change_by_system: false } }
    pub fn system(key: ClusterWideKey) -> Self { Self { key, change_by_system: true } }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (by-system={})", self.key, self.change_by_system)
    }
}

/// Split `group/version` (or a bare core `version`) into its parts.
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((g, v)) => (g, v),
        None => ("", api_version),
    }
}

/// Render a GVK as `v1/Kind` or `group/v1/Kind`.
pub fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

/// Parse `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind, DetectorError> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind::gvk(group, version, kind))
        }
        _ => Err(DetectorError::Selector(format!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key))),
    }
}

/// GVK addressed by an `apiVersion` + `kind` pair.
pub fn gvk_from_api_version(api_version: &str, kind: &str) -> Result<GroupVersionKind, DetectorError> {
    let (group, version) = split_api_version(api_version);
    if version.is_empty() || kind.is_empty() {
        return Err(DetectorError::Selector(format!("invalid apiVersion/kind: {:?}/{:?}", api_version, kind)));
    }
    Ok(GroupVersionKind::gvk(group, version, kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::{ApiResource, DynamicObject};

    #[test]
    fn key_from_object_and_display() {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("apps", "v1", "Deployment"));
        let obj = DynamicObject::new("web", &ar).within("default");
        let key = ClusterWideKey::from_object(&obj).expect("key");
        assert_eq!(key.group, "apps");
        assert_eq!(key.version, "v1");
        assert_eq!(key.namespace_key(), "default/web");
        assert_eq!(key.to_string(), "apps/v1, kind=Deployment, default/web");
    }

    #[test]
    fn core_group_key_has_bare_version() {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "Namespace"));
        let obj = DynamicObject::new("prod", &ar);
        let key = ClusterWideKey::from_object(&obj).expect("key");
        assert_eq!(key.api_version(), "v1");
        assert_eq!(key.namespace(), None);
        assert_eq!(key.to_string(), "v1, kind=Namespace, prod");
    }

    #[test]
    fn parse_gvk_key_accepts_core_and_grouped() {
        let core = parse_gvk_key("v1/ConfigMap").expect("core");
        assert_eq!((core.group.as_str(), core.version.as_str(), core.kind.as_str()), ("", "v1", "ConfigMap"));
        let apps = parse_gvk_key("apps/v1/Deployment").expect("apps");
        assert_eq!(gvk_key(&apps), "apps/v1/Deployment");
        assert!(parse_gvk_key("invalid").is_err());
        assert!(parse_gvk_key("a/b/c/d").is_err());
    }

    #[test]
    fn reference_without_kind_is_rejected() {
        let r = ObjectReference { api_version: "v1".into(), name: "x".into(), ..Default::default() };
        assert!(ClusterWideKey::from_reference(&r).is_err());
    }
}

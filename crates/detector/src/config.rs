//! Detector configuration: defaults, `MERIDIAN_*` environment overrides and
//! the skipped-resource list.

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use kube::core::GroupVersionKind;
use meridian_core::{labels, DetectorError};
use meridian_queue::RateLimiterConfig;

pub const DEFAULT_FIELD_MANAGER: &str = "meridian-controller-manager";

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub concurrent_policy_syncs: usize,
    pub concurrent_cluster_policy_syncs: usize,
    pub concurrent_resource_template_syncs: usize,
    /// Namespace patterns, anchored at both ends, whose templates are ignored.
    pub skipped_namespaces: Vec<String>,
    /// Comma-separated `group`, `group/version`, `group/version/Kind` or `version/Kind`.
    pub skipped_resources: String,
    pub rate_limiter: RateLimiterConfig,
    pub priority_based_scheduling: bool,
    pub policy_preemption: bool,
    pub discovery_period: Duration,
    pub field_manager: String,
    pub event_channel_capacity: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            concurrent_policy_syncs: 1,
            concurrent_cluster_policy_syncs: 1,
            concurrent_resource_template_syncs: 5,
            skipped_namespaces: vec!["kube-.*".to_string()],
            skipped_resources: String::new(),
            rate_limiter: RateLimiterConfig::default(),
            priority_based_scheduling: false,
            policy_preemption: true,
            discovery_period: Duration::from_secs(30),
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            event_channel_capacity: 1024,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key).and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

impl DetectorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from defaults overridden by `lookup(MERIDIAN_*)`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let skipped_namespaces = match lookup("MERIDIAN_SKIPPED_NAMESPACES") {
            Some(s) => s.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect(),
            None => d.skipped_namespaces,
        };
        Self {
            concurrent_policy_syncs: parsed(&lookup, "MERIDIAN_CONCURRENT_POLICY_SYNCS", d.concurrent_policy_syncs),
            concurrent_cluster_policy_syncs: parsed(
                &lookup,
                "MERIDIAN_CONCURRENT_CLUSTER_POLICY_SYNCS",
                d.concurrent_cluster_policy_syncs,
            ),
            concurrent_resource_template_syncs: parsed(
                &lookup,
                "MERIDIAN_CONCURRENT_RESOURCE_TEMPLATE_SYNCS",
                d.concurrent_resource_template_syncs,
            ),
            skipped_namespaces,
            skipped_resources: lookup("MERIDIAN_SKIPPED_RESOURCES").unwrap_or(d.skipped_resources),
            rate_limiter: RateLimiterConfig {
                base_delay: Duration::from_millis(parsed(
                    &lookup,
                    "MERIDIAN_RATE_LIMITER_BASE_DELAY_MS",
                    d.rate_limiter.base_delay.as_millis() as u64,
                )),
                max_delay: Duration::from_secs(parsed(
                    &lookup,
                    "MERIDIAN_RATE_LIMITER_MAX_DELAY_SECS",
                    d.rate_limiter.max_delay.as_secs(),
                )),
                qps: parsed(&lookup, "MERIDIAN_RATE_LIMITER_QPS", d.rate_limiter.qps),
                burst: parsed(&lookup, "MERIDIAN_RATE_LIMITER_BURST", d.rate_limiter.burst),
            },
            priority_based_scheduling: parsed(&lookup, "MERIDIAN_PRIORITY_BASED_SCHEDULING", d.priority_based_scheduling),
            policy_preemption: parsed(&lookup, "MERIDIAN_POLICY_PREEMPTION", d.policy_preemption),
            discovery_period: Duration::from_secs(parsed(
                &lookup,
                "MERIDIAN_DISCOVERY_PERIOD_SECS",
                d.discovery_period.as_secs(),
            )),
            field_manager: lookup("MERIDIAN_FIELD_MANAGER").unwrap_or(d.field_manager),
            event_channel_capacity: parsed(&lookup, "MERIDIAN_EVENT_CHANNEL_CAP", d.event_channel_capacity),
        }
    }
}

/// Kinds whose objects are never treated as resource templates.
#[derive(Debug, Clone, Default)]
pub struct SkippedResourceConfig {
    groups: HashSet<String>,
    group_versions: HashSet<(String, String)>,
    kinds: HashSet<(String, String, String)>,
}

fn looks_like_version(s: &str) -> bool {
    let Some(rest) = s.strip_prefix('v') else { return false };
    let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return false;
    }
    let tail = &rest[digits..];
    tail.is_empty()
        || ["alpha", "beta"].iter().any(|p| {
            tail.strip_prefix(p).map(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit())).unwrap_or(false)
        })
}

impl SkippedResourceConfig {
    /// Parse the skipped-resource list. The policy and work groups are always skipped.
    pub fn parse(spec: &str) -> Result<Self, DetectorError> {
        let mut cfg = Self::default();
        cfg.groups.insert(labels::POLICY_GROUP.to_string());
        cfg.groups.insert(labels::WORK_GROUP.to_string());
        for entry in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let parts: Vec<_> = entry.split('/').collect();
            match parts.as_slice() {
                [group] => {
                    cfg.groups.insert((*group).to_string());
                }
                [version, kind] if looks_like_version(version) && kind.starts_with(char::is_uppercase) => {
                    cfg.kinds.insert((String::new(), (*version).to_string(), (*kind).to_string()));
                }
                [group, version] if !group.is_empty() && !version.is_empty() => {
                    cfg.group_versions.insert(((*group).to_string(), (*version).to_string()));
                }
                [group, version, kind] if !version.is_empty() && !kind.is_empty() => {
                    cfg.kinds.insert(((*group).to_string(), (*version).to_string(), (*kind).to_string()));
                }
                _ => return Err(DetectorError::Selector(format!("invalid skipped resource entry {:?}", entry))),
            }
        }
        Ok(cfg)
    }

    pub fn is_skipped(&self, gvk: &GroupVersionKind) -> bool {
        self.groups.contains(&gvk.group)
            || self.group_versions.contains(&(gvk.group.clone(), gvk.version.clone()))
            || self.kinds.contains(&(gvk.group.clone(), gvk.version.clone(), gvk.kind.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn env_overrides_defaults() {
        let env: HashMap<&str, &str> = [
            ("MERIDIAN_CONCURRENT_RESOURCE_TEMPLATE_SYNCS", "8"),
            ("MERIDIAN_SKIPPED_NAMESPACES", "kube-.*, istio-system"),
            ("MERIDIAN_POLICY_PREEMPTION", "false"),
            ("MERIDIAN_RATE_LIMITER_QPS", "not-a-number"),
        ]
        .into();
        let cfg = DetectorConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.concurrent_resource_template_syncs, 8);
        assert_eq!(cfg.concurrent_policy_syncs, 1);
        assert_eq!(cfg.skipped_namespaces, vec!["kube-.*".to_string(), "istio-system".to_string()]);
        assert!(!cfg.policy_preemption);
        assert_eq!(cfg.rate_limiter.qps, 10.0);
        assert_eq!(cfg.field_manager, DEFAULT_FIELD_MANAGER);
    }

    #[test]
    fn skipped_resources_forms() {
        let cfg = SkippedResourceConfig::parse("example.io, apps/v1beta1, batch/v1/CronJob, v1/Secret").expect("parse");
        assert!(cfg.is_skipped(&GroupVersionKind::gvk("example.io", "v1", "Widget")));
        assert!(cfg.is_skipped(&GroupVersionKind::gvk("apps", "v1beta1", "Deployment")));
        assert!(!cfg.is_skipped(&GroupVersionKind::gvk("apps", "v1", "Deployment")));
        assert!(cfg.is_skipped(&GroupVersionKind::gvk("batch", "v1", "CronJob")));
        assert!(!cfg.is_skipped(&GroupVersionKind::gvk("batch", "v1", "Job")));
        assert!(cfg.is_skipped(&GroupVersionKind::gvk("", "v1", "Secret")));
        assert!(cfg.is_skipped(&GroupVersionKind::gvk(labels::WORK_GROUP, "v1alpha2", "ResourceBinding")));
        assert!(SkippedResourceConfig::parse("a/b/c/d").is_err());
    }
}

//! Replica interpretation: how many replicas a template asks for and what
//! each replica needs from a cluster.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::core::{DynamicObject, GroupVersionKind};
use meridian_core::binding::{NodeClaim, ReplicaRequirements};
use meridian_core::DetectorError;
use serde::de::DeserializeOwned;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpreterOperation {
    InterpretReplica,
}

/// Hook point for kind-specific interpretation of templates.
pub trait ReplicaInterpreter: Send + Sync {
    fn hook_enabled(&self, gvk: &GroupVersionKind, op: InterpreterOperation) -> bool;

    /// Desired replica count and per-replica requirements of `obj`.
    fn get_replicas(&self, obj: &DynamicObject) -> Result<(i32, Option<ReplicaRequirements>), DetectorError>;
}

/// Built-in interpretation for workload kinds of the core API groups.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultInterpreter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Workload {
    Deployment,
    StatefulSet,
    ReplicaSet,
    Job,
    Pod,
}

fn workload(gvk: &GroupVersionKind) -> Option<Workload> {
    match (gvk.group.as_str(), gvk.version.as_str(), gvk.kind.as_str()) {
        ("apps", "v1", "Deployment") => Some(Workload::Deployment),
        ("apps", "v1", "StatefulSet") => Some(Workload::StatefulSet),
        ("apps", "v1", "ReplicaSet") => Some(Workload::ReplicaSet),
        ("batch", "v1", "Job") => Some(Workload::Job),
        ("", "v1", "Pod") => Some(Workload::Pod),
        _ => None,
    }
}

fn decode<T: DeserializeOwned>(obj: &DynamicObject) -> Result<T, DetectorError> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

impl ReplicaInterpreter for DefaultInterpreter {
    fn hook_enabled(&self, gvk: &GroupVersionKind, op: InterpreterOperation) -> bool {
        op == InterpreterOperation::InterpretReplica && workload(gvk).is_some()
    }

    fn get_replicas(&self, obj: &DynamicObject) -> Result<(i32, Option<ReplicaRequirements>), DetectorError> {
        let types = obj.types.as_ref().ok_or_else(|| DetectorError::Selector("object missing apiVersion/kind".into()))?;
        let gvk = meridian_core::keys::gvk_from_api_version(&types.api_version, &types.kind)?;
        let kind = workload(&gvk).ok_or_else(|| DetectorError::Unsupported(format!("no replica interpreter for {}", types.kind)))?;
        let namespace = obj.metadata.namespace.clone();
        let (replicas, pod) = match kind {
            Workload::Deployment => {
                let spec = decode::<Deployment>(obj)?.spec.unwrap_or_default();
                (spec.replicas.unwrap_or(1), spec.template.spec)
            }
            Workload::StatefulSet => {
                let spec = decode::<StatefulSet>(obj)?.spec.unwrap_or_default();
                (spec.replicas.unwrap_or(1), spec.template.spec)
            }
            Workload::ReplicaSet => {
                let spec = decode::<ReplicaSet>(obj)?.spec.unwrap_or_default();
                (spec.replicas.unwrap_or(1), spec.template.and_then(|t| t.spec))
            }
            Workload::Job => {
                let spec = decode::<Job>(obj)?.spec.unwrap_or_default();
                (spec.parallelism.unwrap_or(1), spec.template.spec)
            }
            Workload::Pod => (1, decode::<Pod>(obj)?.spec),
        };
        let requirements = match pod {
            Some(spec) => replica_requirements(&spec, namespace)?,
            None => None,
        };
        Ok((replicas, requirements))
    }
}

/// Requirements of one replica running `spec`; `None` when it constrains nothing.
pub fn replica_requirements(spec: &PodSpec, namespace: Option<String>) -> Result<Option<ReplicaRequirements>, DetectorError> {
    let node_claim = node_claim(spec)?;
    let resource_request = pod_requests(spec)?;
    if node_claim.is_none() && resource_request.is_none() {
        return Ok(None);
    }
    Ok(Some(ReplicaRequirements {
        node_claim,
        resource_request,
        namespace,
        priority_class_name: spec.priority_class_name.clone(),
    }))
}

fn node_claim(spec: &PodSpec) -> Result<Option<NodeClaim>, DetectorError> {
    let hard_node_affinity = spec
        .affinity
        .as_ref()
        .and_then(|a| a.node_affinity.as_ref())
        .and_then(|n| n.required_during_scheduling_ignored_during_execution.as_ref())
        .map(serde_json::to_value)
        .transpose()?;
    let node_selector = spec.node_selector.clone().filter(|m| !m.is_empty());
    let tolerations = match spec.tolerations.as_ref().filter(|t| !t.is_empty()) {
        Some(ts) => Some(ts.iter().map(serde_json::to_value).collect::<Result<Vec<_>, _>>()?),
        None => None,
    };
    if hard_node_affinity.is_none() && node_selector.is_none() && tolerations.is_none() {
        return Ok(None);
    }
    Ok(Some(NodeClaim { hard_node_affinity, node_selector, tolerations }))
}

/// Effective pod requests: the sum over containers, raised to the largest
/// init container request per resource, plus pod overhead.
fn pod_requests(spec: &PodSpec) -> Result<Option<BTreeMap<String, Quantity>>, DetectorError> {
    let mut total: BTreeMap<String, i128> = BTreeMap::new();
    for c in &spec.containers {
        for (name, q) in c.resources.as_ref().and_then(|r| r.requests.as_ref()).into_iter().flatten() {
            *total.entry(name.clone()).or_default() += milli_value(q)?;
        }
    }
    for c in spec.init_containers.iter().flatten() {
        for (name, q) in c.resources.as_ref().and_then(|r| r.requests.as_ref()).into_iter().flatten() {
            let v = milli_value(q)?;
            let cur = total.entry(name.clone()).or_default();
            *cur = (*cur).max(v);
        }
    }
    for (name, q) in spec.overhead.iter().flatten() {
        *total.entry(name.clone()).or_default() += milli_value(q)?;
    }
    if total.is_empty() {
        return Ok(None);
    }
    Ok(Some(total.into_iter().map(|(k, v)| (k, format_millis(v))).collect()))
}

fn milli_value(q: &Quantity) -> Result<i128, DetectorError> {
    parse_quantity_millis(&q.0).ok_or_else(|| DetectorError::Selector(format!("invalid quantity {:?}", q.0)))
}

/// Parse a resource quantity into thousandths of its base unit, rounding up.
pub fn parse_quantity_millis(s: &str) -> Option<i128> {
    let s = s.trim();
    let split = s
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || *c == '.' || *c == '+' || *c == '-'))
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    let (negative, number) = match number.strip_prefix('-') {
        Some(n) => (true, n),
        None => (false, number.strip_prefix('+').unwrap_or(number)),
    };
    let (int_part, frac_part) = number.split_once('.').unwrap_or((number, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.chars().chain(frac_part.chars()).all(|c| c.is_ascii_digit()) || frac_part.len() > 18 {
        return None;
    }
    let mantissa: i128 = format!("{}{}", int_part, frac_part).parse().ok()?;
    let scale = 10i128.pow(frac_part.len() as u32);

    // (numerator, denominator) of the suffix expressed in millis
    let (num, den): (i128, i128) = match suffix {
        "" => (1_000, 1),
        "n" => (1, 1_000_000),
        "u" => (1, 1_000),
        "m" => (1, 1),
        "k" => (1_000_000, 1),
        "M" => (1_000_000_000, 1),
        "G" => (1_000_000_000_000, 1),
        "T" => (1_000_000_000_000_000, 1),
        "P" => (1_000_000_000_000_000_000, 1),
        "E" => (1_000_000_000_000_000_000_000, 1),
        "Ki" => (1_000 << 10, 1),
        "Mi" => (1_000 << 20, 1),
        "Gi" => (1_000 << 30, 1),
        "Ti" => (1_000 << 40, 1),
        "Pi" => (1_000 << 50, 1),
        "Ei" => (1_000 << 60, 1),
        exp if exp.starts_with(['e', 'E']) => {
            let e: u32 = exp[1..].parse().ok()?;
            (1_000i128.checked_mul(10i128.checked_pow(e)?)?, 1)
        }
        _ => return None,
    };
    let numerator = mantissa.checked_mul(num)?;
    let denominator = scale.checked_mul(den)?;
    let mut v = numerator / denominator;
    if numerator % denominator != 0 {
        v += 1;
    }
    Some(if negative { -v } else { v })
}

fn format_millis(v: i128) -> Quantity {
    if v % 1000 == 0 {
        Quantity((v / 1000).to_string())
    } else {
        Quantity(format!("{}m", v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: serde_json::Value) -> DynamicObject {
        serde_json::from_value(v).expect("object")
    }

    #[test]
    fn quantities() {
        assert_eq!(parse_quantity_millis("100m"), Some(100));
        assert_eq!(parse_quantity_millis("2"), Some(2000));
        assert_eq!(parse_quantity_millis("0.5"), Some(500));
        assert_eq!(parse_quantity_millis("1Ki"), Some(1_024_000));
        assert_eq!(parse_quantity_millis("1e3"), Some(1_000_000));
        assert_eq!(parse_quantity_millis("1.5Gi"), Some(1_610_612_736_000));
        assert_eq!(parse_quantity_millis("abc"), None);
        assert_eq!(parse_quantity_millis("1Q"), None);
    }

    #[test]
    fn deployment_replicas_and_requests() {
        let d = obj(json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": { "name": "web", "namespace": "default" },
            "spec": {
                "replicas": 3,
                "selector": { "matchLabels": { "app": "web" } },
                "template": {
                    "metadata": { "labels": { "app": "web" } },
                    "spec": {
                        "nodeSelector": { "disk": "ssd" },
                        "priorityClassName": "high",
                        "containers": [
                            { "name": "a", "image": "nginx", "resources": { "requests": { "cpu": "100m", "memory": "1Ki" } } },
                            { "name": "b", "image": "nginx", "resources": { "requests": { "cpu": "250m" } } }
                        ],
                        "initContainers": [
                            { "name": "init", "image": "busybox", "resources": { "requests": { "cpu": "1" } } }
                        ]
                    }
                }
            }
        }));
        let interp = DefaultInterpreter;
        assert!(interp.hook_enabled(&GroupVersionKind::gvk("apps", "v1", "Deployment"), InterpreterOperation::InterpretReplica));
        let (replicas, req) = interp.get_replicas(&d).expect("interpret");
        assert_eq!(replicas, 3);
        let req = req.expect("requirements");
        let rr = req.resource_request.expect("requests");
        assert_eq!(rr["cpu"], Quantity("1".into()));
        assert_eq!(rr["memory"], Quantity("1024".into()));
        assert_eq!(req.namespace.as_deref(), Some("default"));
        assert_eq!(req.priority_class_name.as_deref(), Some("high"));
        let claim = req.node_claim.expect("node claim");
        assert_eq!(claim.node_selector.expect("selector")["disk"], "ssd");
    }

    #[test]
    fn job_uses_parallelism_and_unconstrained_pods_have_no_requirements() {
        let job = obj(json!({
            "apiVersion": "batch/v1", "kind": "Job",
            "metadata": { "name": "j", "namespace": "default" },
            "spec": { "parallelism": 4, "template": { "spec": { "containers": [{ "name": "c", "image": "x" }] } } }
        }));
        let (replicas, req) = DefaultInterpreter.get_replicas(&job).expect("interpret");
        assert_eq!(replicas, 4);
        assert!(req.is_none());
    }

    #[test]
    fn config_maps_are_not_interpreted() {
        let gvk = GroupVersionKind::gvk("", "v1", "ConfigMap");
        assert!(!DefaultInterpreter.hook_enabled(&gvk, InterpreterOperation::InterpretReplica));
    }
}

//! Resource selector and label selector evaluation.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::DynamicObject;

use crate::error::DetectorError;
use crate::policy::ResourceSelector;

/// How specifically a selector matched. Higher wins among policies that
/// share an explicit priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ImplicitPriority {
    Mismatch = 0,
    MatchAll = 1,
    MatchLabelSelector = 2,
    MatchName = 3,
}

fn non_empty(s: &Option<String>) -> Option<&str> {
    s.as_deref().filter(|v| !v.is_empty())
}

/// Evaluate one selector against a template.
///
/// apiVersion and kind must match exactly, then namespace when set. A set
/// name is matched alone and the label selector is ignored; otherwise the
/// label selector decides; with neither, every object of the kind matches.
pub fn selector_priority(obj: &DynamicObject, rs: &ResourceSelector) -> Result<ImplicitPriority, DetectorError> {
    let Some(types) = obj.types.as_ref() else { return Ok(ImplicitPriority::Mismatch) };
    if types.api_version != rs.api_version || types.kind != rs.kind {
        return Ok(ImplicitPriority::Mismatch);
    }
    if let Some(ns) = non_empty(&rs.namespace) {
        if obj.metadata.namespace.as_deref().unwrap_or_default() != ns {
            return Ok(ImplicitPriority::Mismatch);
        }
    }
    if let Some(name) = non_empty(&rs.name) {
        return Ok(if obj.metadata.name.as_deref() == Some(name) {
            ImplicitPriority::MatchName
        } else {
            ImplicitPriority::Mismatch
        });
    }
    if let Some(sel) = rs.label_selector.as_ref() {
        let empty = BTreeMap::new();
        let labels = obj.metadata.labels.as_ref().unwrap_or(&empty);
        return Ok(if label_selector_matches(sel, labels)? {
            ImplicitPriority::MatchLabelSelector
        } else {
            ImplicitPriority::Mismatch
        });
    }
    Ok(ImplicitPriority::MatchAll)
}

pub fn resource_matches(obj: &DynamicObject, rs: &ResourceSelector) -> Result<bool, DetectorError> {
    Ok(selector_priority(obj, rs)? != ImplicitPriority::Mismatch)
}

/// Evaluate a structured label selector. An empty selector matches everything.
pub fn label_selector_matches(sel: &LabelSelector, labels: &BTreeMap<String, String>) -> Result<bool, DetectorError> {
    for (k, v) in sel.match_labels.iter().flatten() {
        if labels.get(k) != Some(v) {
            return Ok(false);
        }
    }
    for req in sel.match_expressions.iter().flatten() {
        let values = req.values.as_deref().unwrap_or_default();
        let current = labels.get(&req.key);
        let ok = match req.operator.as_str() {
            "In" | "NotIn" if values.is_empty() => {
                return Err(DetectorError::Selector(format!(
                    "operator {} on key {:?} requires at least one value",
                    req.operator, req.key
                )))
            }
            "Exists" | "DoesNotExist" if !values.is_empty() => {
                return Err(DetectorError::Selector(format!(
                    "operator {} on key {:?} takes no values",
                    req.operator, req.key
                )))
            }
            "In" => current.map(|c| values.contains(c)).unwrap_or(false),
            "NotIn" => current.map(|c| !values.contains(c)).unwrap_or(true),
            "Exists" => current.is_some(),
            "DoesNotExist" => current.is_none(),
            other => return Err(DetectorError::Selector(format!("unknown label selector operator {:?}", other))),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

/// One term of a textual label query such as `app=web,tier!=db,release`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelRequirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
    NotExists(String),
}

impl LabelRequirement {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            LabelRequirement::Equals(k, v) => labels.get(k) == Some(v),
            LabelRequirement::NotEquals(k, v) => labels.get(k) != Some(v),
            LabelRequirement::Exists(k) => labels.contains_key(k),
            LabelRequirement::NotExists(k) => !labels.contains_key(k),
        }
    }
}

/// Parse the equality-based label query syntax accepted by list calls.
pub fn parse_label_query(query: &str) -> Result<Vec<LabelRequirement>, DetectorError> {
    let mut out = Vec::new();
    for term in query.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let req = if let Some((k, v)) = term.split_once("!=") {
            LabelRequirement::NotEquals(k.trim().to_string(), v.trim().to_string())
        } else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
            LabelRequirement::Equals(k.trim().to_string(), v.trim().to_string())
        } else if let Some(k) = term.strip_prefix('!') {
            LabelRequirement::NotExists(k.trim().to_string())
        } else {
            LabelRequirement::Exists(term.to_string())
        };
        let key = match &req {
            LabelRequirement::Equals(k, _)
            | LabelRequirement::NotEquals(k, _)
            | LabelRequirement::Exists(k)
            | LabelRequirement::NotExists(k) => k,
        };
        if key.is_empty() {
            return Err(DetectorError::Selector(format!("empty key in label query {:?}", query)));
        }
        out.push(req);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;
    use serde_json::json;

    fn deploy(name: &str, ns: &str, labels: serde_json::Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": name, "namespace": ns, "labels": labels },
        }))
        .expect("object")
    }

    fn rs(name: Option<&str>, sel: Option<LabelSelector>) -> ResourceSelector {
        ResourceSelector {
            api_version: "apps/v1".into(),
            kind: "Deployment".into(),
            namespace: Some("default".into()),
            name: name.map(String::from),
            label_selector: sel,
        }
    }

    #[test]
    fn name_beats_label_selector_beats_all() {
        let obj = deploy("web", "default", json!({ "app": "web" }));
        let by_label = LabelSelector { match_labels: Some([("app".to_string(), "web".to_string())].into()), ..Default::default() };
        assert_eq!(selector_priority(&obj, &rs(Some("web"), None)).unwrap(), ImplicitPriority::MatchName);
        assert_eq!(selector_priority(&obj, &rs(None, Some(by_label))).unwrap(), ImplicitPriority::MatchLabelSelector);
        assert_eq!(selector_priority(&obj, &rs(None, None)).unwrap(), ImplicitPriority::MatchAll);
        assert_eq!(selector_priority(&obj, &rs(Some("api"), None)).unwrap(), ImplicitPriority::Mismatch);
    }

    #[test]
    fn name_set_ignores_label_selector() {
        let obj = deploy("web", "default", json!({}));
        let never = LabelSelector { match_labels: Some([("x".to_string(), "y".to_string())].into()), ..Default::default() };
        assert!(resource_matches(&obj, &rs(Some("web"), Some(never))).unwrap());
    }

    #[test]
    fn namespace_and_kind_must_match() {
        let obj = deploy("web", "prod", json!({}));
        assert!(!resource_matches(&obj, &rs(None, None)).unwrap());
        let mut other_kind = rs(None, None);
        other_kind.kind = "StatefulSet".into();
        other_kind.namespace = None;
        assert!(!resource_matches(&obj, &other_kind).unwrap());
    }

    #[test]
    fn match_expressions() {
        let labels: BTreeMap<String, String> = [("tier".to_string(), "web".to_string())].into();
        let expr = |op: &str, values: Option<Vec<&str>>| LabelSelector {
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "tier".into(),
                operator: op.into(),
                values: values.map(|v| v.into_iter().map(String::from).collect()),
            }]),
            ..Default::default()
        };
        assert!(label_selector_matches(&expr("In", Some(vec!["web", "api"])), &labels).unwrap());
        assert!(!label_selector_matches(&expr("NotIn", Some(vec!["web"])), &labels).unwrap());
        assert!(label_selector_matches(&expr("Exists", None), &labels).unwrap());
        assert!(!label_selector_matches(&expr("DoesNotExist", None), &labels).unwrap());
        assert!(label_selector_matches(&expr("In", None), &labels).is_err());
        assert!(label_selector_matches(&expr("Matches", Some(vec!["web"])), &labels).is_err());
        assert!(label_selector_matches(&LabelSelector::default(), &labels).unwrap());
    }

    #[test]
    fn label_query_parsing() {
        let reqs = parse_label_query("a=1, b!=2,c,!d").expect("parse");
        assert_eq!(reqs.len(), 4);
        let labels: BTreeMap<String, String> =
            [("a".to_string(), "1".to_string()), ("c".to_string(), "x".to_string())].into();
        assert!(reqs.iter().all(|r| r.matches(&labels)));
        assert!(parse_label_query("=v").is_err());
    }
}

//! Choosing the policy that governs a template.

use std::cmp::Ordering;

use kube::core::DynamicObject;
use meridian_core::selector::{selector_priority, ImplicitPriority};
use meridian_core::Policy;
use tracing::warn;

/// Best implicit priority any of the policy's selectors achieves for `obj`.
/// Malformed selectors count as mismatches.
pub fn implicit_priority(obj: &DynamicObject, policy: &Policy) -> ImplicitPriority {
    policy
        .spec
        .resource_selectors
        .iter()
        .map(|rs| match selector_priority(obj, rs) {
            Ok(p) => p,
            Err(e) => {
                warn!(policy = %policy.describe(), error = %e, "ignoring malformed resource selector");
                ImplicitPriority::Mismatch
            }
        })
        .max()
        .unwrap_or(ImplicitPriority::Mismatch)
}

/// Pick the winning policy among `candidates` for `obj`.
///
/// Deleting policies are skipped. Order: explicit priority, then implicit
/// priority, both descending; ties go to the lexically smaller name and then
/// the smaller permanent ID.
pub fn select_policy(obj: &DynamicObject, candidates: Vec<Policy>) -> Option<Policy> {
    let mut matched: Vec<(ImplicitPriority, Policy)> = candidates
        .into_iter()
        .filter(|p| !p.is_deleting())
        .map(|p| (implicit_priority(obj, &p), p))
        .filter(|(ip, _)| *ip != ImplicitPriority::Mismatch)
        .collect();
    matched.sort_by(|(ia, a), (ib, b)| compare(*ia, a, *ib, b));
    matched.into_iter().next().map(|(_, p)| p)
}

fn compare(ia: ImplicitPriority, a: &Policy, ib: ImplicitPriority, b: &Policy) -> Ordering {
    b.explicit_priority()
        .cmp(&a.explicit_priority())
        .then(ib.cmp(&ia))
        .then_with(|| a.name().cmp(b.name()))
        .then_with(|| a.permanent_id().unwrap_or_default().cmp(b.permanent_id().unwrap_or_default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::labels;
    use serde_json::json;

    fn deploy() -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": { "name": "web", "namespace": "default", "labels": { "app": "web" } }
        }))
        .expect("deploy")
    }

    fn pp(name: &str, priority: i32, selector: serde_json::Value) -> Policy {
        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "policy.meridian.io/v1alpha1", "kind": "PropagationPolicy",
            "metadata": { "name": name, "namespace": "default", "labels": { (labels::PP_PERMANENT_ID_LABEL): format!("id-{}", name) } },
            "spec": { "priority": priority, "resourceSelectors": [selector] }
        }))
        .expect("pp");
        Policy::from_dynamic(&obj).expect("decode")
    }

    fn all() -> serde_json::Value {
        json!({ "apiVersion": "apps/v1", "kind": "Deployment" })
    }

    #[test]
    fn explicit_priority_wins_over_specificity() {
        let by_name = pp("a", 0, json!({ "apiVersion": "apps/v1", "kind": "Deployment", "name": "web" }));
        let broad = pp("b", 5, all());
        let got = select_policy(&deploy(), vec![by_name, broad]).expect("match");
        assert_eq!(got.name(), "b");
    }

    #[test]
    fn implicit_priority_breaks_explicit_ties() {
        let broad = pp("a", 1, all());
        let labelled = pp("b", 1, json!({ "apiVersion": "apps/v1", "kind": "Deployment", "labelSelector": { "matchLabels": { "app": "web" } } }));
        let got = select_policy(&deploy(), vec![broad, labelled]).expect("match");
        assert_eq!(got.name(), "b");
    }

    #[test]
    fn name_breaks_full_ties_and_deleting_is_skipped() {
        let mut zeta = pp("alpha", 0, all());
        zeta.meta.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(k8s_openapi::chrono::Utc::now()));
        let got = select_policy(&deploy(), vec![pp("gamma", 0, all()), pp("beta", 0, all()), zeta]).expect("match");
        assert_eq!(got.name(), "beta");
    }

    #[test]
    fn malformed_selector_is_a_mismatch() {
        let bad = pp("a", 9, json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "labelSelector": { "matchExpressions": [{ "key": "app", "operator": "Bogus" }] }
        }));
        assert!(select_policy(&deploy(), vec![bad]).is_none());
    }
}

//! Error types shared by the store seam and the detector.

use thiserror::Error;

/// Errors surfaced by an object store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unknown kind: {0}")]
    UnknownKind(String),
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors surfaced by detector operations. The work queue consults
/// [`DetectorError::retryable`] to decide whether to requeue a key.
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("selector: {0}")]
    Selector(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("{resource} is claimed by another policy: {claimed_by}")]
    ClaimedElsewhere { resource: String, claimed_by: String },
    #[error("binding {binding} is owned by {owner_uid}, not by template uid {template_uid}")]
    StaleOwner { binding: String, owner_uid: String, template_uid: String },
    #[error("dependent override policies missing for {policy}: {missing:?}")]
    DependentOverridesMissing { policy: String, missing: Vec<String> },
    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("{} errors: [{}]", .0.len(), join(.0))]
    Aggregate(Vec<DetectorError>),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn join(errs: &[DetectorError]) -> String {
    errs.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(", ")
}

impl DetectorError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DetectorError::Store(StoreError::NotFound(_)))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, DetectorError::Store(StoreError::Conflict(_)))
    }

    /// Whether the queue should redeliver the key that produced this error.
    ///
    /// Selector, schema and unsupported-configuration errors are terminal
    /// until the offending object changes again.
    pub fn retryable(&self) -> bool {
        match self {
            DetectorError::Store(StoreError::UnknownKind(_)) | DetectorError::Store(StoreError::Invalid(_)) => false,
            DetectorError::Store(_) => true,
            DetectorError::Selector(_) | DetectorError::Unsupported(_) | DetectorError::Decode(_) => false,
            DetectorError::ClaimedElsewhere { .. } => false,
            DetectorError::StaleOwner { .. } | DetectorError::DependentOverridesMissing { .. } => true,
            DetectorError::Aggregate(errs) => errs.iter().any(DetectorError::retryable),
            DetectorError::Other(_) => true,
        }
    }
}

/// Collapse a batch of errors: empty is success, one is returned as-is.
pub fn aggregate(mut errs: Vec<DetectorError>) -> Result<(), DetectorError> {
    match errs.len() {
        0 => Ok(()),
        1 => Err(errs.remove(0)),
        _ => Err(DetectorError::Aggregate(errs)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_collapses() {
        assert!(aggregate(vec![]).is_ok());
        let one = aggregate(vec![DetectorError::Selector("x".into())]).unwrap_err();
        assert!(matches!(one, DetectorError::Selector(_)));
        let many = aggregate(vec![
            DetectorError::Selector("a".into()),
            StoreError::Conflict("b".into()).into(),
        ])
        .unwrap_err();
        assert!(many.to_string().starts_with("2 errors"));
        assert!(many.retryable());
    }

    #[test]
    fn retry_classification() {
        assert!(DetectorError::from(StoreError::Conflict("c".into())).retryable());
        assert!(!DetectorError::from(StoreError::UnknownKind("k".into())).retryable());
        assert!(!DetectorError::Unsupported("pod priority".into()).retryable());
        assert!(DetectorError::from(StoreError::NotFound("n".into())).is_not_found());
    }
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    #[error("Malformed entity: {0}")]
    Malformed(String),

    #[error("Reconcile error: {0}")]
    Reconcile(String),
}

/// Short alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn reconcile(msg: impl Into<String>) -> Self {
        Self::Reconcile(msg.into())
    }
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Label used for the reconcile-error counter.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Kube(kube::Error::Api(e)) if e.code == 404 => "not_found",
            Self::Kube(kube::Error::Api(e)) if e.code == 409 => "conflict",
            Self::Kube(_) => "kubernetes",
            Self::Postgres(_) => "database",
            Self::Serde(_) => "serialization",
            Self::Config(_) => "config",
            Self::NotFound(_) => "not_found",
            Self::AlreadyExists(_) => "conflict",
            Self::Malformed(_) => "malformed",
            Self::Reconcile(_) => "reconcile",
        }
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_the_failure_taxonomy() {
        assert_eq!(Error::malformed("vdc without namespace").category(), "malformed");
        assert_eq!(Error::already_exists("vm ns/a").category(), "conflict");
        assert_eq!(Error::not_found("vm ns/a").category(), "not_found");
        assert_eq!(Error::reconcile("boom").category(), "reconcile");
        assert_eq!(Error::config("missing url").category(), "config");
    }

    #[test]
    fn already_exists_is_distinguished() {
        assert!(Error::already_exists("x").is_already_exists());
        assert!(!Error::not_found("x").is_already_exists());
    }

    #[test]
    fn display_includes_context() {
        let err = Error::malformed("vdc 42 is enabled but has no namespace");
        assert_eq!(
            err.to_string(),
            "Malformed entity: vdc 42 is enabled but has no namespace"
        );
    }
}

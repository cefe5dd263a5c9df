use std::io;

/// Errors from sandbox-provider operations.
///
/// Backends map their internal failures into these variants so the manager
/// and build worker stay substrate-agnostic.
#[derive(thiserror::Error, Debug)]
pub enum SandboxError {
    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("provision failed: {0}")]
    Provision(String),

    #[error("exec failed: {0}")]
    Exec(String),

    #[error("snapshot failed: {0}")]
    Snapshot(String),

    #[error("timeout")]
    Timeout,

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("serialization: {0}")]
    Serde(String),

    #[error("backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_displays_id() {
        let err = SandboxError::NotFound("sbx-123".into());
        assert_eq!(err.to_string(), "sandbox not found: sbx-123");
    }

    #[test]
    fn io_error_converts_via_from() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file missing");
        let err: SandboxError = io_err.into();
        assert!(err.to_string().contains("file missing"));
        assert!(matches!(err, SandboxError::Io(_)));
    }

    #[test]
    fn provision_snapshot_backend_display() {
        assert_eq!(
            SandboxError::Provision("no capacity".into()).to_string(),
            "provision failed: no capacity"
        );
        assert_eq!(
            SandboxError::Snapshot("disk detached".into()).to_string(),
            "snapshot failed: disk detached"
        );
        assert_eq!(
            SandboxError::Backend("connection refused".into()).to_string(),
            "backend error: connection refused"
        );
    }

    #[test]
    fn error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SandboxError>();
    }
}

use std::collections::BTreeMap;

use async_trait::async_trait;

use super::error::SandboxError;

/// Image to boot a sandbox from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    /// The provider's base image with the supervisor entrypoint baked in.
    Base,
    /// A filesystem snapshot produced by a previous build or session.
    Snapshot(String),
}

/// Everything the provider needs to create one sandbox.
#[derive(Debug, Clone)]
pub struct CreateSandboxRequest {
    pub image: ImageRef,
    pub env: BTreeMap<String, String>,
    pub timeout_seconds: u64,
    /// Named provider-side secret groups to attach (e.g. LLM credentials).
    /// Build sandboxes attach none.
    pub secret_groups: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub returncode: i32,
}

/// Factory seam over the process-orchestration substrate.
///
/// One implementation talks to the real provider API; tests substitute an
/// in-memory fake.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    async fn create_sandbox(
        &self,
        req: CreateSandboxRequest,
    ) -> Result<Box<dyn BackendSandbox>, SandboxError>;
}

/// A live sandbox as the provider sees it.
#[async_trait]
pub trait BackendSandbox: Send + Sync {
    /// Provider-assigned object id (distinct from our logical sandbox id).
    fn object_id(&self) -> &str;

    /// Block until the sandbox's main process exits; returns its exit code.
    async fn wait(&self) -> Result<i32, SandboxError>;

    /// Run an ad-hoc command inside the sandbox.
    async fn exec(&self, argv: &[String]) -> Result<ExecOutput, SandboxError>;

    /// Snapshot the filesystem into a new image; returns the image id.
    async fn snapshot_filesystem(&self) -> Result<String, SandboxError>;

    async fn terminate(&self) -> Result<(), SandboxError>;
}

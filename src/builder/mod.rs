pub mod reconciler;
pub mod worker;

pub use reconciler::Reconciler;
pub use worker::{BuildRequest, BuildWorker};

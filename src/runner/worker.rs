use async_trait::async_trait;

use crate::advancer::Advancer;
use crate::engine::JobWorker;

/// One polling unit of work hosted by a [`Runner`](super::Runner).
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// Label used in logs.
    fn label(&self) -> String;

    /// Attempt one unit of work. `Ok(false)` means nothing was available.
    async fn work_once(&self) -> anyhow::Result<bool>;
}

#[async_trait]
impl Worker for JobWorker {
    fn label(&self) -> String {
        format!("jobs:{}", self.kind())
    }

    async fn work_once(&self) -> anyhow::Result<bool> {
        Ok(JobWorker::work_once(self).await?)
    }
}

#[async_trait]
impl Worker for Advancer {
    fn label(&self) -> String {
        "advancer".to_string()
    }

    async fn work_once(&self) -> anyhow::Result<bool> {
        Ok(self.advance_next().await?)
    }
}

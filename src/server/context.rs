use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::Settings;
use crate::pipeline::{Stage, StageKind};
use crate::queue::{Queue, QueueInfo};
use crate::stages::{build_stage, IngressService};
use crate::storage::RequestRepository;

/// Everything a task worker needs, built once at startup
pub struct StageContext {
    pub kind: StageKind,
    /// Service name reported by the liveness endpoint
    pub service: String,
    pub stage: Arc<dyn Stage>,
    pub repository: Arc<dyn RequestRepository>,
    pub queue: Arc<dyn Queue>,
    /// Where successful records go; `None` for the terminal stage
    pub next: Option<QueueInfo>,
    /// Reject records without identity instead of passing them through
    pub deployed: bool,
}

impl StageContext {
    pub fn from_settings(
        settings: &Settings,
        kind: StageKind,
        repository: Arc<dyn RequestRepository>,
        queue: Arc<dyn Queue>,
    ) -> Result<Self> {
        let route = settings.route(kind)?;
        Ok(Self {
            kind,
            service: route.svc.clone(),
            stage: build_stage(kind, settings)
                .with_context(|| format!("Failed to build stage '{}'", kind))?,
            repository,
            queue,
            next: QueueInfo::for_stage(settings, kind)?,
            deployed: settings.general.deployed,
        })
    }

    /// Create and verify the outgoing queue
    pub async fn prepare(&self) -> Result<()> {
        if let Some(next) = &self.next {
            prepare_queue(self.queue.as_ref(), next).await?;
        }
        Ok(())
    }
}

/// State of the client-facing ingress service
pub struct IngressContext {
    pub service: String,
    pub ingress: IngressService,
}

impl IngressContext {
    pub fn from_settings(
        settings: &Settings,
        repository: Arc<dyn RequestRepository>,
        queue: Arc<dyn Queue>,
    ) -> Result<(Self, QueueInfo)> {
        let route = settings.route(StageKind::Ingress)?;
        let first = QueueInfo::for_stage(settings, StageKind::Ingress)?
            .context("The ingress stage needs write_to_q and next_svc configured")?;

        Ok((
            Self {
                service: route.svc.clone(),
                ingress: IngressService::new(repository, queue, first.clone()),
            },
            first,
        ))
    }
}

pub async fn prepare_queue(queue: &dyn Queue, info: &QueueInfo) -> Result<()> {
    queue
        .create(info)
        .await
        .with_context(|| format!("Failed to create queue '{}'", info.name))?;
    queue
        .connect(info)
        .await
        .with_context(|| format!("Failed to connect to queue '{}'", info.name))?;
    tracing::info!(
        queue = %info.name,
        target = %info.target_service,
        backend = queue.backend_name(),
        "Queue ready"
    );
    Ok(())
}

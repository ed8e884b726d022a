use anyhow::{Context, Result};
use std::sync::Arc;

use crate::api::{HttpBackend, MessageTransport, TrainingJobService};
use crate::chat::MessagePipeline;
use crate::config::{self, AppConfig};
use crate::flow_store::FlowStore;
use crate::storage::{SqliteStateStore, StateStore};
use crate::training::TrainingOrchestrator;

/// Everything the command layer needs, passed explicitly instead of living
/// in globals. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub chat: Arc<MessagePipeline>,
    pub flow: Arc<FlowStore>,
    pub training: Arc<TrainingOrchestrator>,
    pub config: AppConfig,
}

impl AppState {
    /// Wires the state from injected ports and restores the persisted flow.
    pub async fn new(
        config: AppConfig,
        transport: Arc<dyn MessageTransport>,
        training_service: Arc<dyn TrainingJobService>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self> {
        let flow = Arc::new(
            FlowStore::open(store, config.store_name.clone())
                .await
                .context("Failed to open flow store")?,
        );
        let training = Arc::new(TrainingOrchestrator::new(
            training_service,
            flow.clone(),
            config.poll_interval,
            config.max_poll_backoff,
        ));

        let state = Self {
            chat: Arc::new(MessagePipeline::new(transport)),
            flow,
            training,
            config,
        };
        state.resume_training_watch().await;
        Ok(state)
    }

    /// Production wiring: SQLite for the flow, REST for both services.
    pub async fn bootstrap(config: AppConfig) -> Result<Self> {
        log::info!("Bootstrapping dashboard core against {}", config.api_base_url);
        let api_key = config::get_api_key(config.api_key_ref.as_deref())?;
        let backend = Arc::new(HttpBackend::from_config(&config, api_key)?);
        let store = SqliteStateStore::open(&config.database_path).await?;

        Self::new(config, backend.clone(), backend, Arc::new(store)).await
    }

    // A job that was still running when the flow was persisted keeps being polled
    async fn resume_training_watch(&self) {
        let snapshot = self.flow.snapshot().await;
        if let Some(job) = snapshot.current_training_job {
            if job.status.is_active() {
                log::info!("Resuming poll of training job {}", job.id);
                self.training.spawn_watch(job.id);
            }
        }
    }
}

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

use crate::flow::FlowState;
use crate::storage::StateStore;

pub const DEFAULT_FLOW_SLOT: &str = "chatbot-flow-storage";

/// Bumped whenever the persisted `FlowState` layout changes incompatibly.
pub const FLOW_SCHEMA_VERSION: u32 = 1;

#[derive(Serialize)]
struct PersistedFlowRef<'a> {
    version: u32,
    state: &'a FlowState,
}

#[derive(Deserialize)]
struct PersistedFlow {
    version: u32,
    state: FlowState,
}

/// Owner of the flow state for one application session.
///
/// Reads the persisted document once at open, then writes the whole state
/// back after every mutation that changed it. All writes go through
/// [`FlowStore::mutate`], which holds the lock across the save so the stored
/// document always matches the latest in-memory state.
pub struct FlowStore {
    store: Arc<dyn StateStore>,
    slot: String,
    state: Mutex<FlowState>,
    changes: watch::Sender<FlowState>,
}

impl FlowStore {
    pub async fn open(store: Arc<dyn StateStore>, slot: impl Into<String>) -> Result<Self> {
        let slot = slot.into();
        let initial = match store
            .load(&slot)
            .await
            .context("Failed to read persisted flow state")?
        {
            Some(raw) => decode(&slot, &raw),
            None => {
                log::info!("No persisted flow state in slot '{}', starting fresh", slot);
                FlowState::default()
            }
        };

        let (changes, _) = watch::channel(initial.clone());
        Ok(Self {
            store,
            slot,
            state: Mutex::new(initial),
            changes,
        })
    }

    pub async fn snapshot(&self) -> FlowState {
        self.state.lock().await.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<FlowState> {
        self.changes.subscribe()
    }

    /// Applies a synchronous transition and persists the result. If the save
    /// fails the transition is rolled back and nothing is published.
    pub async fn mutate<R>(&self, f: impl FnOnce(&mut FlowState) -> R) -> Result<R> {
        let mut state = self.state.lock().await;
        let before = state.clone();
        let out = f(&mut *state);

        if *state != before {
            if let Err(e) = self.persist(&state).await {
                log::error!("Rolling back flow transition in slot '{}': {:#}", self.slot, e);
                *state = before;
                return Err(e);
            }
            self.changes.send_replace(state.clone());
        }
        Ok(out)
    }

    pub async fn reset(&self) -> Result<()> {
        log::warn!("Resetting chatbot flow state in slot '{}'", self.slot);
        self.mutate(FlowState::reset_flow).await
    }

    async fn persist(&self, state: &FlowState) -> Result<()> {
        let doc = serde_json::to_string(&PersistedFlowRef {
            version: FLOW_SCHEMA_VERSION,
            state,
        })
        .context("Failed to serialize flow state")?;
        self.store
            .save(&self.slot, &doc)
            .await
            .context("Failed to persist flow state")
    }
}

fn decode(slot: &str, raw: &str) -> FlowState {
    match serde_json::from_str::<PersistedFlow>(raw) {
        Ok(doc) if doc.version == FLOW_SCHEMA_VERSION => doc.state,
        Ok(doc) => {
            log::warn!(
                "Discarding flow state in slot '{}' with schema version {} (expected {})",
                slot,
                doc.version,
                FLOW_SCHEMA_VERSION
            );
            FlowState::default()
        }
        Err(e) => {
            log::warn!("Discarding unreadable flow state in slot '{}': {}", slot, e);
            FlowState::default()
        }
    }
}

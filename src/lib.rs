//! Client-side core of the coaching dashboard.
//!
//! Two pieces of state live here: the optimistic chat pipeline ([`chat`]) and
//! the chatbot configuration flow ([`flow`], persisted by [`flow_store`] and
//! driven by [`training`]). The UI talks to them through [`commands`] with an
//! [`state::AppState`] it owns.

pub mod api;
pub mod chat;
pub mod commands;
pub mod config;
pub mod error;
pub mod flow;
pub mod flow_store;
pub mod models;
pub mod state;
pub mod storage;
pub mod training;

pub use chat::{ChatView, IgnoreReason, MessagePipeline, SendOutcome};
pub use config::AppConfig;
pub use error::{ChatError, FlowError, ModelError, TrainingError};
pub use flow::{FlowOverview, FlowState, FlowStep, FlowStepStatus};
pub use flow_store::FlowStore;
pub use state::AppState;
pub use training::TrainingOrchestrator;

/// Installs the `env_logger` backend, filtered by `RUST_LOG`. Safe to call
/// more than once.
pub fn init_logging() {
    if env_logger::try_init().is_err() {
        log::debug!("Logger already initialized");
    }
}

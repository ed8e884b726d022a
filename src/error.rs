use thiserror::Error;

use crate::flow::FlowStep;
use crate::models::EntityId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("Field '{0}' cannot be empty")]
    EmptyField(&'static str),

    #[error("Training progress {0} is outside 0..=100")]
    ProgressOutOfRange(u8),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    #[error("Step '{step}' is locked until {missing:?} are completed")]
    StepLocked {
        step: FlowStep,
        missing: Vec<FlowStep>,
    },

    #[error("Step '{0}' is derived from other state and cannot be completed manually")]
    DerivedStep(FlowStep),

    #[error("Unknown flow step: {0}")]
    UnknownStep(String),
}

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("No chatbot selected")]
    NoChatbot,

    #[error("Upload at least one document before training")]
    NoDocuments,

    #[error("Knowledge base step is not completed")]
    KnowledgeBaseIncomplete,

    #[error("Training job {0} is still in progress")]
    JobInProgress(EntityId),

    #[error("No training job is being tracked")]
    NoActiveJob,

    #[error("Training job {0} has already finished")]
    JobFinished(EntityId),

    #[error("Training service error: {0:#}")]
    Service(anyhow::Error),

    #[error("Failed to persist flow state: {0:#}")]
    Persist(anyhow::Error),
}

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("A message is still being delivered")]
    SendInFlight,

    #[error("No chat is open")]
    NoActiveChat,

    #[error("Message service error: {0:#}")]
    Transport(anyhow::Error),
}

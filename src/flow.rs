//! Chatbot configuration flow.
//!
//! `FlowState` is a plain value: every operation is a synchronous transition
//! on `&mut self`. Persistence and sharing live in [`crate::flow_store`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::FlowError;
use crate::models::{
    Chatbot, Document, EntityId, HumanMimicryStyle, KnowledgeBase, Program, Prompt, Session,
    TrainingJob, TrainingStatus,
};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum FlowStep {
    Chatbot,
    Program,
    Sessions,
    KnowledgeBase,
    Documents,
    HumanMimicry,
    Prompts,
    Training,
}

impl FlowStep {
    /// Canonical order, which is also the suggested linear path.
    pub const ALL: [FlowStep; 8] = [
        FlowStep::Chatbot,
        FlowStep::Program,
        FlowStep::Sessions,
        FlowStep::KnowledgeBase,
        FlowStep::Documents,
        FlowStep::HumanMimicry,
        FlowStep::Prompts,
        FlowStep::Training,
    ];

    /// Steps that must be completed before this one can be accessed.
    pub fn dependencies(self) -> &'static [FlowStep] {
        match self {
            FlowStep::Chatbot => &[],
            FlowStep::Program => &[FlowStep::Chatbot],
            FlowStep::Sessions => &[FlowStep::Program],
            FlowStep::KnowledgeBase => &[FlowStep::Sessions],
            FlowStep::Documents => &[FlowStep::KnowledgeBase],
            FlowStep::HumanMimicry => &[FlowStep::KnowledgeBase],
            FlowStep::Prompts => &[FlowStep::Chatbot],
            FlowStep::Training => &[FlowStep::Documents],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FlowStep::Chatbot => "chatbot",
            FlowStep::Program => "program",
            FlowStep::Sessions => "sessions",
            FlowStep::KnowledgeBase => "knowledge-base",
            FlowStep::Documents => "documents",
            FlowStep::HumanMimicry => "human-mimicry",
            FlowStep::Prompts => "prompts",
            FlowStep::Training => "training",
        }
    }
}

impl fmt::Display for FlowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlowStep {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FlowStep::ALL
            .iter()
            .copied()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| FlowError::UnknownStep(s.to_string()))
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FlowStepStatus {
    pub completed: bool,
    pub has_data: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

/// The one place where `completed`/`has_data` are derived from an entity.
pub fn derive_step_status(has_data: bool, now: DateTime<Utc>) -> FlowStepStatus {
    FlowStepStatus {
        completed: has_data,
        has_data,
        last_updated: Some(now),
    }
}

fn initial_steps() -> BTreeMap<FlowStep, FlowStepStatus> {
    FlowStep::ALL
        .iter()
        .map(|step| (*step, FlowStepStatus::default()))
        .collect()
}

// Appends `item` unless an entry with the same id already exists.
fn push_unique<T>(items: &mut Vec<T>, item: T, id: impl Fn(&T) -> &EntityId) {
    if !items.iter().any(|existing| id(existing) == id(&item)) {
        items.push(item);
    }
}

fn dedup_by_id<T>(items: Vec<T>, id: impl Fn(&T) -> &EntityId) -> Vec<T> {
    let mut unique = Vec::with_capacity(items.len());
    for item in items {
        push_unique(&mut unique, item, &id);
    }
    unique
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct FlowState {
    pub selected_chatbot: Option<Chatbot>,
    pub selected_program: Option<Program>,
    pub sessions: Vec<Session>,
    pub selected_knowledge_base: Option<KnowledgeBase>,
    pub documents: Vec<Document>,
    pub human_mimicry_styles: Vec<HumanMimicryStyle>,
    pub prompts: Vec<Prompt>,
    pub current_training_job: Option<TrainingJob>,
    pub flow_steps: BTreeMap<FlowStep, FlowStepStatus>,
    pub suggest_retraining: bool,
    pub last_document_change: Option<DateTime<Utc>>,
    pub last_trained_at: Option<DateTime<Utc>>,
}

impl Default for FlowState {
    fn default() -> Self {
        Self {
            selected_chatbot: None,
            selected_program: None,
            sessions: Vec::new(),
            selected_knowledge_base: None,
            documents: Vec::new(),
            human_mimicry_styles: Vec::new(),
            prompts: Vec::new(),
            current_training_job: None,
            flow_steps: initial_steps(),
            suggest_retraining: false,
            last_document_change: None,
            last_trained_at: None,
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepOverview {
    pub step: FlowStep,
    pub status: FlowStepStatus,
    pub accessible: bool,
}

/// Read model handed to the UI.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowOverview {
    pub progress: u8,
    pub next_step: Option<FlowStep>,
    pub completed_steps: Vec<FlowStep>,
    pub steps: Vec<StepOverview>,
    pub suggest_retraining: bool,
}

impl FlowState {
    pub fn step_status(&self, step: FlowStep) -> FlowStepStatus {
        self.flow_steps.get(&step).copied().unwrap_or_default()
    }

    fn set_step(&mut self, step: FlowStep, status: FlowStepStatus) {
        self.flow_steps.insert(step, status);
    }

    fn on_document_change(&mut self, now: DateTime<Utc>) {
        self.last_document_change = Some(now);
        self.suggest_retraining = true;
    }

    // --- Selection mutators ---

    /// Selecting a different chatbot discards all downstream configuration.
    pub fn set_selected_chatbot(&mut self, chatbot: Option<Chatbot>) {
        let now = Utc::now();
        let same = match (&self.selected_chatbot, &chatbot) {
            (Some(current), Some(next)) => current.id == next.id,
            (None, None) => true,
            _ => false,
        };

        if same {
            self.selected_chatbot = chatbot;
        } else {
            log::info!(
                "Switching chatbot from {:?} to {:?}, resetting downstream flow state",
                self.selected_chatbot.as_ref().map(|c| c.id.as_str()),
                chatbot.as_ref().map(|c| c.id.as_str())
            );
            *self = FlowState {
                selected_chatbot: chatbot,
                ..FlowState::default()
            };
        }

        let has_data = self.selected_chatbot.is_some();
        self.set_step(FlowStep::Chatbot, derive_step_status(has_data, now));
    }

    /// This and the other derived setters below are not gated by step
    /// dependencies: they record data and derive the step status from it, so
    /// a step can read completed while a prerequisite is not. Only
    /// [`complete_step`](Self::complete_step) enforces the dependency table.
    pub fn set_selected_program(&mut self, program: Option<Program>) {
        let has_data = program.is_some();
        self.selected_program = program;
        self.set_step(FlowStep::Program, derive_step_status(has_data, Utc::now()));
    }

    pub fn set_sessions(&mut self, sessions: Vec<Session>) {
        self.sessions = dedup_by_id(sessions, |s| &s.id);
        self.refresh_sessions();
    }

    pub fn add_session(&mut self, session: Session) {
        push_unique(&mut self.sessions, session, |s| &s.id);
        self.refresh_sessions();
    }

    pub fn remove_session(&mut self, session_id: &EntityId) {
        self.sessions.retain(|s| &s.id != session_id);
        self.refresh_sessions();
    }

    fn refresh_sessions(&mut self) {
        let has_data = !self.sessions.is_empty();
        self.set_step(FlowStep::Sessions, derive_step_status(has_data, Utc::now()));
    }

    pub fn set_selected_knowledge_base(&mut self, knowledge_base: Option<KnowledgeBase>) {
        let has_data = knowledge_base.is_some();
        self.selected_knowledge_base = knowledge_base;
        self.set_step(
            FlowStep::KnowledgeBase,
            derive_step_status(has_data, Utc::now()),
        );
    }

    // --- Documents ---

    pub fn set_documents(&mut self, documents: Vec<Document>) {
        self.documents = dedup_by_id(documents, |d| &d.id);
        self.refresh_documents();
    }

    pub fn add_document(&mut self, document: Document) {
        push_unique(&mut self.documents, document, |d| &d.id);
        self.refresh_documents();
    }

    pub fn remove_document(&mut self, document_id: &EntityId) {
        self.documents.retain(|d| &d.id != document_id);
        self.refresh_documents();
    }

    fn refresh_documents(&mut self) {
        let now = Utc::now();
        let has_data = !self.documents.is_empty();
        self.set_step(FlowStep::Documents, derive_step_status(has_data, now));
        self.on_document_change(now);
    }

    // --- Human mimicry (optional step) ---

    pub fn set_human_mimicry_styles(&mut self, styles: Vec<HumanMimicryStyle>) {
        self.human_mimicry_styles = dedup_by_id(styles, |s| &s.id);
        self.refresh_human_mimicry();
    }

    pub fn add_human_mimicry_style(&mut self, style: HumanMimicryStyle) {
        push_unique(&mut self.human_mimicry_styles, style, |s| &s.id);
        self.refresh_human_mimicry();
    }

    pub fn remove_human_mimicry_style(&mut self, style_id: &EntityId) {
        self.human_mimicry_styles.retain(|s| &s.id != style_id);
        self.refresh_human_mimicry();
    }

    fn refresh_human_mimicry(&mut self) {
        let has_data = !self.human_mimicry_styles.is_empty();
        self.set_step(
            FlowStep::HumanMimicry,
            derive_step_status(has_data, Utc::now()),
        );
    }

    // --- Prompts ---

    pub fn set_prompts(&mut self, prompts: Vec<Prompt>) {
        self.prompts = dedup_by_id(prompts, |p| &p.id);
        self.refresh_prompts();
    }

    pub fn add_prompt(&mut self, prompt: Prompt) {
        push_unique(&mut self.prompts, prompt, |p| &p.id);
        self.refresh_prompts();
    }

    pub fn remove_prompt(&mut self, prompt_id: &EntityId) {
        self.prompts.retain(|p| &p.id != prompt_id);
        self.refresh_prompts();
    }

    fn refresh_prompts(&mut self) {
        let has_data = !self.prompts.is_empty();
        self.set_step(FlowStep::Prompts, derive_step_status(has_data, Utc::now()));
    }

    // --- Training ---

    /// Applies a job snapshot. Re-applying the same snapshot only touches
    /// `last_updated` of the training step.
    pub fn set_current_training_job(&mut self, job: Option<TrainingJob>) {
        let now = Utc::now();
        let was_completed = |candidate: &TrainingJob| {
            self.current_training_job.as_ref().is_some_and(|current| {
                current.id == candidate.id && current.status == TrainingStatus::Completed
            })
        };

        let completed = job
            .as_ref()
            .is_some_and(|j| j.status == TrainingStatus::Completed);
        let newly_completed = completed && job.as_ref().is_some_and(|j| !was_completed(j));

        if newly_completed {
            log::info!("Training job reached completed, clearing retraining suggestion");
            self.suggest_retraining = false;
            self.last_trained_at = job.as_ref().and_then(|j| j.completed_at).or(Some(now));
        }

        self.set_step(
            FlowStep::Training,
            FlowStepStatus {
                completed,
                has_data: job.is_some(),
                last_updated: Some(now),
            },
        );
        self.current_training_job = job;
    }

    // --- Gated completion ---

    /// Marks a step completed by explicit user confirmation. Training can
    /// only complete through a job snapshot.
    pub fn complete_step(&mut self, step: FlowStep) -> Result<(), FlowError> {
        if step == FlowStep::Training {
            return Err(FlowError::DerivedStep(step));
        }
        let missing = self.missing_dependencies(step);
        if !missing.is_empty() {
            return Err(FlowError::StepLocked { step, missing });
        }
        let current = self.step_status(step);
        self.set_step(
            step,
            FlowStepStatus {
                completed: true,
                has_data: current.has_data,
                last_updated: Some(Utc::now()),
            },
        );
        Ok(())
    }

    // --- Queries ---

    pub fn get_completed_steps(&self) -> Vec<FlowStep> {
        FlowStep::ALL
            .iter()
            .copied()
            .filter(|step| self.step_status(*step).completed)
            .collect()
    }

    pub fn get_next_step(&self) -> Option<FlowStep> {
        FlowStep::ALL
            .iter()
            .copied()
            .find(|step| !self.step_status(*step).completed)
    }

    pub fn missing_dependencies(&self, step: FlowStep) -> Vec<FlowStep> {
        step.dependencies()
            .iter()
            .copied()
            .filter(|dep| !self.step_status(*dep).completed)
            .collect()
    }

    pub fn can_access_step(&self, step: FlowStep) -> bool {
        step.dependencies()
            .iter()
            .all(|dep| self.step_status(*dep).completed)
    }

    pub fn accessible_steps(&self) -> Vec<FlowStep> {
        FlowStep::ALL
            .iter()
            .copied()
            .filter(|step| self.can_access_step(*step))
            .collect()
    }

    /// Rounded integer percentage of completed steps.
    pub fn get_flow_progress(&self) -> u8 {
        let total = FlowStep::ALL.len();
        let completed = self.get_completed_steps().len();
        // round-half-up of 100 * completed / total
        ((200 * completed + total) / (2 * total)) as u8
    }

    pub fn overview(&self) -> FlowOverview {
        FlowOverview {
            progress: self.get_flow_progress(),
            next_step: self.get_next_step(),
            completed_steps: self.get_completed_steps(),
            steps: FlowStep::ALL
                .iter()
                .map(|step| StepOverview {
                    step: *step,
                    status: self.step_status(*step),
                    accessible: self.can_access_step(*step),
                })
                .collect(),
            suggest_retraining: self.suggest_retraining,
        }
    }

    pub fn reset_flow(&mut self) {
        *self = FlowState::default();
    }
}

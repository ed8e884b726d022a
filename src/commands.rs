// Command layer called by the dashboard UI. Every command logs its entry and
// turns failures into a message the UI can show as a toast.

use crate::chat::{ChatView, SendOutcome};
use crate::flow::{FlowOverview, FlowState, FlowStep};
use crate::models::{
    Chatbot, Document, EntityId, HumanMimicryStyle, KnowledgeBase, Pagination, Program, Prompt,
    Session, TrainingJob,
};
use crate::state::AppState;

fn parse_id(kind: &str, raw: &str) -> Result<EntityId, String> {
    EntityId::new(raw).map_err(|_| {
        let err_msg = format!("Invalid {} ID: '{}'", kind, raw);
        log::error!("{}", err_msg);
        err_msg
    })
}

// --- Chat ---

pub async fn open_chat(state: &AppState, chat_id: String) -> Result<ChatView, String> {
    log::info!("Frontend requested to open chat {}", chat_id);
    let chat_id = parse_id("chat", &chat_id)?;

    match state.chat.open_chat(chat_id).await {
        Ok(()) => Ok(state.chat.view().await),
        Err(e) => {
            log::error!("Failed to open chat: {:?}", e);
            Err(format!("Failed to load messages: {}", e))
        }
    }
}

/// Always answers with the current view: a failed delivery is reported
/// through `is_error`, an ignored send leaves the view unchanged.
pub async fn send_chat_message(state: &AppState, content: String) -> Result<ChatView, String> {
    log::info!("Frontend requested to send a message ({} chars)", content.len());
    log_outcome(&state.chat.send_message(&content).await);
    Ok(state.chat.view().await)
}

pub async fn retry_chat_message(state: &AppState) -> Result<ChatView, String> {
    log::info!("Frontend requested to retry the failed message");
    log_outcome(&state.chat.retry_pending_message().await);
    Ok(state.chat.view().await)
}

pub async fn clear_pending_message(state: &AppState) -> Result<ChatView, String> {
    log::info!("Frontend requested to discard the failed message");
    if !state.chat.clear_pending_message().await {
        log::debug!("No failed message to discard");
    }
    Ok(state.chat.view().await)
}

pub async fn load_older_messages(
    state: &AppState,
    page: u32,
    limit: u32,
) -> Result<ChatView, String> {
    log::info!("Frontend requested message page {} (limit {})", page, limit);
    if page == 0 || limit == 0 {
        return Err("Page and limit must be positive.".to_string());
    }
    match state.chat.load_more(Pagination { page, limit }).await {
        Ok(added) => {
            log::debug!("Merged {} new messages", added);
            Ok(state.chat.view().await)
        }
        Err(e) => {
            log::error!("Failed to load message page {}: {:?}", page, e);
            Err(format!("Failed to load messages: {}", e))
        }
    }
}

pub async fn get_chat_view(state: &AppState) -> Result<ChatView, String> {
    Ok(state.chat.view().await)
}

fn log_outcome(outcome: &SendOutcome) {
    match outcome {
        SendOutcome::Confirmed(message) => log::info!("Message confirmed as {}", message.id),
        SendOutcome::Failed { error } => log::error!("Message delivery failed: {}", error),
        SendOutcome::Ignored(reason) => log::debug!("Send ignored: {:?}", reason),
    }
}

// --- Flow ---

pub async fn get_flow_overview(state: &AppState) -> Result<FlowOverview, String> {
    Ok(state.flow.snapshot().await.overview())
}

pub async fn select_chatbot(
    state: &AppState,
    chatbot: Option<Chatbot>,
) -> Result<FlowOverview, String> {
    log::info!(
        "Frontend selected chatbot {:?}",
        chatbot.as_ref().map(|c| c.id.as_str())
    );
    let previous_job = state.flow.snapshot().await.current_training_job;

    let overview = state
        .flow
        .mutate(|flow| {
            flow.set_selected_chatbot(chatbot);
            flow.overview()
        })
        .await
        .map_err(|e| {
            log::error!("Failed to select chatbot: {:?}", e);
            format!("Failed to save chatbot selection: {}", e)
        })?;

    // a job of the previous chatbot is no longer tracked, stop polling it
    if let Some(job) = previous_job {
        let current = state.flow.snapshot().await.current_training_job;
        if current.map(|j| j.id) != Some(job.id.clone()) {
            state.training.stop_watch(&job.id);
        }
    }
    Ok(overview)
}

// Applies a derived-setter transition and answers with the new overview
async fn update_flow(
    state: &AppState,
    what: &str,
    apply: impl FnOnce(&mut FlowState),
) -> Result<FlowOverview, String> {
    state
        .flow
        .mutate(|flow| {
            apply(&mut *flow);
            flow.overview()
        })
        .await
        .map_err(|e| {
            log::error!("Failed to save {}: {:?}", what, e);
            format!("Failed to save {}: {}", what, e)
        })
}

pub async fn select_program(
    state: &AppState,
    program: Option<Program>,
) -> Result<FlowOverview, String> {
    log::info!(
        "Frontend selected program {:?}",
        program.as_ref().map(|p| p.id.as_str())
    );
    update_flow(state, "program selection", |flow| flow.set_selected_program(program)).await
}

pub async fn add_session(state: &AppState, session: Session) -> Result<FlowOverview, String> {
    log::info!("Frontend added session {}", session.id);
    update_flow(state, "session", |flow| flow.add_session(session)).await
}

pub async fn remove_session(state: &AppState, session_id: String) -> Result<FlowOverview, String> {
    log::warn!("Frontend removed session {}", session_id);
    let session_id = parse_id("session", &session_id)?;
    update_flow(state, "session removal", |flow| flow.remove_session(&session_id)).await
}

pub async fn select_knowledge_base(
    state: &AppState,
    knowledge_base: Option<KnowledgeBase>,
) -> Result<FlowOverview, String> {
    log::info!(
        "Frontend selected knowledge base {:?}",
        knowledge_base.as_ref().map(|k| k.id.as_str())
    );
    update_flow(state, "knowledge base selection", |flow| {
        flow.set_selected_knowledge_base(knowledge_base)
    })
    .await
}

pub async fn add_document(state: &AppState, document: Document) -> Result<FlowOverview, String> {
    log::info!("Frontend added document {}", document.id);
    update_flow(state, "document", |flow| flow.add_document(document)).await
}

pub async fn remove_document(state: &AppState, document_id: String) -> Result<FlowOverview, String> {
    log::warn!("Frontend removed document {}", document_id);
    let document_id = parse_id("document", &document_id)?;
    update_flow(state, "document removal", |flow| flow.remove_document(&document_id)).await
}

pub async fn add_human_mimicry_style(
    state: &AppState,
    style: HumanMimicryStyle,
) -> Result<FlowOverview, String> {
    log::info!("Frontend added human mimicry style {}", style.id);
    update_flow(state, "human mimicry style", |flow| {
        flow.add_human_mimicry_style(style)
    })
    .await
}

pub async fn remove_human_mimicry_style(
    state: &AppState,
    style_id: String,
) -> Result<FlowOverview, String> {
    log::warn!("Frontend removed human mimicry style {}", style_id);
    let style_id = parse_id("style", &style_id)?;
    update_flow(state, "human mimicry style removal", |flow| {
        flow.remove_human_mimicry_style(&style_id)
    })
    .await
}

pub async fn add_prompt(state: &AppState, prompt: Prompt) -> Result<FlowOverview, String> {
    log::info!("Frontend added prompt {}", prompt.id);
    update_flow(state, "prompt", |flow| flow.add_prompt(prompt)).await
}

pub async fn remove_prompt(state: &AppState, prompt_id: String) -> Result<FlowOverview, String> {
    log::warn!("Frontend removed prompt {}", prompt_id);
    let prompt_id = parse_id("prompt", &prompt_id)?;
    update_flow(state, "prompt removal", |flow| flow.remove_prompt(&prompt_id)).await
}

pub async fn complete_flow_step(state: &AppState, step: String) -> Result<FlowOverview, String> {
    log::info!("Frontend confirmed flow step {}", step);
    let step: FlowStep = step.parse().map_err(|e| format!("{}", e))?;

    let result = state
        .flow
        .mutate(|flow| flow.complete_step(step).map(|()| flow.overview()))
        .await
        .map_err(|e| {
            log::error!("Failed to complete step {}: {:?}", step, e);
            format!("Failed to save flow step: {}", e)
        })?;

    result.map_err(|e| {
        log::warn!("Refused to complete step {}: {}", step, e);
        e.to_string()
    })
}

pub async fn reset_flow(state: &AppState) -> Result<FlowOverview, String> {
    log::warn!("Frontend requested to reset the chatbot flow");
    if let Some(job) = state.flow.snapshot().await.current_training_job {
        state.training.stop_watch(&job.id);
    }
    state.flow.reset().await.map_err(|e| {
        log::error!("Failed to reset flow: {:?}", e);
        format!("Failed to reset flow: {}", e)
    })?;
    Ok(state.flow.snapshot().await.overview())
}

// --- Training ---

/// Starts training and keeps polling the job in the background.
pub async fn start_training(state: &AppState) -> Result<TrainingJob, String> {
    log::info!("Frontend requested to start training");
    match state.training.start_training().await {
        Ok(job) => {
            // not tracked when the chatbot changed while the start was in flight
            let tracked = state
                .flow
                .snapshot()
                .await
                .current_training_job
                .is_some_and(|current| current.id == job.id);
            if tracked && job.status.is_active() {
                state.training.spawn_watch(job.id.clone());
            }
            Ok(job)
        }
        Err(e) => {
            log::error!("Failed to start training: {}", e);
            Err(e.to_string())
        }
    }
}

pub async fn cancel_training(state: &AppState) -> Result<(), String> {
    log::warn!("Frontend requested to cancel training");
    state.training.cancel_training().await.map_err(|e| {
        log::error!("Failed to cancel training: {}", e);
        e.to_string()
    })
}

pub async fn refresh_training_job(state: &AppState) -> Result<TrainingJob, String> {
    log::debug!("Frontend requested a training status refresh");
    state.training.poll_once().await.map_err(|e| {
        log::error!("Failed to refresh training job: {}", e);
        e.to_string()
    })
}

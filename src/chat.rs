//! Optimistic chat delivery.
//!
//! The confirmed log mirrors the remote chat history. At most one provisional
//! message (pending or failed) is overlaid at its tail; while it is occupied
//! further sends are refused, so messages from this client reach the backend
//! in the order they were typed. Nothing is retried automatically.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

use crate::api::MessageTransport;
use crate::error::ChatError;
use crate::models::{
    ChatId, ChatMessage, ConfirmedMessage, Pagination, ProvisionalMessage, ProvisionalStatus,
    TempId,
};

/// Snapshot rendered by the chat view.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatView {
    pub chat_id: Option<ChatId>,
    pub messages: Vec<ChatMessage>,
    pub is_waiting: bool,
    pub is_error: bool,
    /// Content of the pending or failed message, kept for retry.
    pub pending_message: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    EmptyContent,
    NoActiveChat,
    SendInFlight,
    /// A failed message must be retried or cleared first.
    FailedMessageUnresolved,
    NothingToRetry,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Confirmed(ConfirmedMessage),
    Failed { error: String },
    Ignored(IgnoreReason),
}

#[derive(Default)]
struct PipelineState {
    chat_id: Option<ChatId>,
    log: Vec<ConfirmedMessage>,
    slot: Option<ProvisionalMessage>,
}

impl PipelineState {
    fn view(&self) -> ChatView {
        let mut messages: Vec<ChatMessage> =
            self.log.iter().cloned().map(ChatMessage::Confirmed).collect();
        if let Some(provisional) = &self.slot {
            messages.push(ChatMessage::Provisional(provisional.clone()));
        }

        let error = self.slot.as_ref().and_then(|p| match &p.status {
            ProvisionalStatus::Failed { error } => Some(error.clone()),
            ProvisionalStatus::Pending => None,
        });

        ChatView {
            chat_id: self.chat_id.clone(),
            messages,
            is_waiting: self.slot.as_ref().is_some_and(|p| !p.is_failed()),
            is_error: error.is_some(),
            pending_message: self.slot.as_ref().map(|p| p.content.clone()),
            error,
        }
    }

    /// Adds a confirmed message unless the log already has it.
    fn append_confirmed(&mut self, message: ConfirmedMessage) -> bool {
        if self.log.iter().any(|m| m.id == message.id) {
            return false;
        }
        self.log.push(message);
        true
    }

    fn slot_matches(&self, temp_id: TempId) -> bool {
        self.slot.as_ref().is_some_and(|p| p.temp_id == temp_id)
    }
}

pub struct MessagePipeline {
    transport: Arc<dyn MessageTransport>,
    state: Mutex<PipelineState>,
    views: watch::Sender<ChatView>,
}

impl MessagePipeline {
    pub fn new(transport: Arc<dyn MessageTransport>) -> Self {
        let (views, _) = watch::channel(ChatView::default());
        Self {
            transport,
            state: Mutex::new(PipelineState::default()),
            views,
        }
    }

    pub async fn view(&self) -> ChatView {
        self.state.lock().await.view()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatView> {
        self.views.subscribe()
    }

    fn publish(&self, state: &PipelineState) {
        self.views.send_replace(state.view());
    }

    /// Switches to `chat_id` and loads its first history page.
    ///
    /// Refused while a send is in flight. A failed message of the previous
    /// chat is discarded.
    pub async fn open_chat(&self, chat_id: ChatId) -> Result<(), ChatError> {
        if self.is_in_flight().await {
            return Err(ChatError::SendInFlight);
        }

        log::info!("Opening chat {}", chat_id);
        let page = self
            .transport
            .list_messages(&chat_id, Pagination::default())
            .await
            .map_err(ChatError::Transport)?;

        let mut state = self.state.lock().await;
        if state.slot.as_ref().is_some_and(|p| !p.is_failed()) {
            // a send started while the history was loading
            return Err(ChatError::SendInFlight);
        }
        *state = PipelineState {
            chat_id: Some(chat_id),
            log: Vec::with_capacity(page.items.len()),
            slot: None,
        };
        for message in page.items {
            state.append_confirmed(message);
        }
        state.log.sort_by_key(|m| m.created_at);
        log::info!("Loaded {} messages", state.log.len());
        self.publish(&state);
        Ok(())
    }

    /// Fetches another history page of the open chat and merges it into the
    /// log. Returns how many messages were new.
    pub async fn load_more(&self, pagination: Pagination) -> Result<usize, ChatError> {
        let chat_id = self
            .state
            .lock()
            .await
            .chat_id
            .clone()
            .ok_or(ChatError::NoActiveChat)?;

        let page = self
            .transport
            .list_messages(&chat_id, pagination)
            .await
            .map_err(ChatError::Transport)?;

        let mut state = self.state.lock().await;
        if state.chat_id.as_ref() != Some(&chat_id) {
            log::debug!("Chat changed while loading history of {}, dropping page", chat_id);
            return Ok(0);
        }
        let added = page
            .items
            .into_iter()
            .filter(|m| m.chat_id == chat_id)
            .fold(0, |n, m| n + usize::from(state.append_confirmed(m)));
        state.log.sort_by_key(|m| m.created_at);
        self.publish(&state);
        Ok(added)
    }

    /// Appends a message pushed by another participant.
    pub async fn receive(&self, message: ConfirmedMessage) -> bool {
        let mut state = self.state.lock().await;
        if state.chat_id.as_ref() != Some(&message.chat_id) {
            return false;
        }
        let added = state.append_confirmed(message);
        if added {
            self.publish(&state);
        }
        added
    }

    /// Shows `content` immediately and delivers it.
    pub async fn send_message(&self, content: &str) -> SendOutcome {
        if content.trim().is_empty() {
            return SendOutcome::Ignored(IgnoreReason::EmptyContent);
        }

        let (temp_id, chat_id) = {
            let mut state = self.state.lock().await;
            let Some(chat_id) = state.chat_id.clone() else {
                return SendOutcome::Ignored(IgnoreReason::NoActiveChat);
            };
            if let Some(current) = &state.slot {
                log::debug!("Ignoring send, slot occupied by {}", current.temp_id);
                return SendOutcome::Ignored(if current.is_failed() {
                    IgnoreReason::FailedMessageUnresolved
                } else {
                    IgnoreReason::SendInFlight
                });
            }

            let provisional = ProvisionalMessage::pending(chat_id.clone(), content.to_string());
            let temp_id = provisional.temp_id;
            state.slot = Some(provisional);
            self.publish(&state);
            (temp_id, chat_id)
        };

        self.deliver(temp_id, chat_id, content.to_string()).await
    }

    /// Re-sends the failed message with its original content.
    pub async fn retry_pending_message(&self) -> SendOutcome {
        let (temp_id, chat_id, content) = {
            let mut state = self.state.lock().await;
            let Some(provisional) = state.slot.as_mut().filter(|p| p.is_failed()) else {
                return SendOutcome::Ignored(IgnoreReason::NothingToRetry);
            };
            provisional.status = ProvisionalStatus::Pending;
            let attempt = (
                provisional.temp_id,
                provisional.chat_id.clone(),
                provisional.content.clone(),
            );
            log::info!("Retrying message {}", attempt.0);
            self.publish(&state);
            attempt
        };

        self.deliver(temp_id, chat_id, content).await
    }

    /// Discards a failed message. A pending one cannot be discarded.
    pub async fn clear_pending_message(&self) -> bool {
        let mut state = self.state.lock().await;
        if !state.slot.as_ref().is_some_and(|p| p.is_failed()) {
            return false;
        }
        state.slot = None;
        self.publish(&state);
        true
    }

    async fn is_in_flight(&self) -> bool {
        self.state
            .lock()
            .await
            .slot
            .as_ref()
            .is_some_and(|p| !p.is_failed())
    }

    async fn deliver(&self, temp_id: TempId, chat_id: ChatId, content: String) -> SendOutcome {
        let result = self.transport.send_message(&chat_id, &content).await;

        let mut state = self.state.lock().await;
        let current = state.slot_matches(temp_id);
        if !current {
            log::warn!("Discarding delivery result for {}, no longer tracked", temp_id);
        }

        match result {
            Ok(confirmed) => {
                log::debug!("Message {} confirmed as {}", temp_id, confirmed.id);
                if current {
                    state.slot = None;
                    if state.chat_id.as_ref() == Some(&confirmed.chat_id) {
                        state.append_confirmed(confirmed.clone());
                    }
                    self.publish(&state);
                }
                SendOutcome::Confirmed(confirmed)
            }
            Err(e) => {
                let error = format!("{:#}", e);
                log::error!("Failed to deliver message {}: {}", temp_id, error);
                if current {
                    if let Some(provisional) = state.slot.as_mut() {
                        provisional.status = ProvisionalStatus::Failed {
                            error: error.clone(),
                        };
                    }
                    self.publish(&state);
                }
                SendOutcome::Failed { error }
            }
        }
    }
}

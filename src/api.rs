use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::AppConfig;
use crate::models::{ChatId, ConfirmedMessage, EntityId, Page, Pagination, TrainingJob};

/// Remote chat log.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Persists a message. Not idempotent: every call may create a message.
    async fn send_message(&self, chat_id: &ChatId, content: &str) -> Result<ConfirmedMessage>;

    async fn list_messages(
        &self,
        chat_id: &ChatId,
        pagination: Pagination,
    ) -> Result<Page<ConfirmedMessage>>;
}

/// Remote owner of chatbot training jobs.
#[async_trait]
pub trait TrainingJobService: Send + Sync {
    async fn start_training(&self, chatbot_id: &EntityId) -> Result<TrainingJob>;
    async fn get_training_job(&self, job_id: &EntityId) -> Result<TrainingJob>;
    async fn cancel_training(&self, job_id: &EntityId) -> Result<()>;
}

// --- REST backend implementation ---

#[derive(Serialize, Debug)]
struct SendMessageBody<'a> {
    content: &'a str,
}

pub struct HttpBackend {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpBackend {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    pub fn from_config(config: &AppConfig, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// Appends `segments` to the base URL, percent-encoding each one so an
    /// id can never leave its path segment.
    fn url(&self, segments: &[&str]) -> Result<Url> {
        if let Some(bad) = segments.iter().find(|s| matches!(**s, "." | "..")) {
            anyhow::bail!("Invalid path segment '{}'", bad);
        }
        let mut url = Url::parse(&self.base_url)
            .with_context(|| format!("Invalid API base URL '{}'", self.base_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("API base URL '{}' cannot hold a path", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn execute(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let response = self
            .authorize(request)
            .send()
            .await
            .with_context(|| format!("Failed to send {} request", what))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "<Failed to read error body>".to_string());
            log::error!("{} request failed with status {}: {}", what, status, error_body);
            return Err(anyhow::anyhow!(
                "{} request failed with status {}: {}",
                what,
                status,
                error_body
            ));
        }
        Ok(response)
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T> {
        self.execute(request, what)
            .await?
            .json::<T>()
            .await
            .with_context(|| format!("Failed to parse {} response", what))
    }
}

#[async_trait]
impl MessageTransport for HttpBackend {
    async fn send_message(&self, chat_id: &ChatId, content: &str) -> Result<ConfirmedMessage> {
        log::info!("Sending message to chat {}", chat_id);
        let request = self
            .client
            .post(self.url(&["chats", chat_id.as_str(), "messages"])?)
            .json(&SendMessageBody { content });
        self.json(request, "send message").await
    }

    async fn list_messages(
        &self,
        chat_id: &ChatId,
        pagination: Pagination,
    ) -> Result<Page<ConfirmedMessage>> {
        log::debug!(
            "Listing messages for chat {} (page {}, limit {})",
            chat_id,
            pagination.page,
            pagination.limit
        );
        let request = self
            .client
            .get(self.url(&["chats", chat_id.as_str(), "messages"])?)
            .query(&[("page", pagination.page), ("limit", pagination.limit)]);
        self.json(request, "list messages").await
    }
}

#[async_trait]
impl TrainingJobService for HttpBackend {
    async fn start_training(&self, chatbot_id: &EntityId) -> Result<TrainingJob> {
        log::info!("Starting training for chatbot {}", chatbot_id);
        let request = self
            .client
            .post(self.url(&["chatbots", chatbot_id.as_str(), "training"])?);
        let job: TrainingJob = self.json(request, "start training").await?;
        job.validate().context("Backend returned an invalid training job")?;
        Ok(job)
    }

    async fn get_training_job(&self, job_id: &EntityId) -> Result<TrainingJob> {
        log::debug!("Fetching training job {}", job_id);
        let request = self.client.get(self.url(&["training-jobs", job_id.as_str()])?);
        let job: TrainingJob = self.json(request, "get training job").await?;
        job.validate().context("Backend returned an invalid training job")?;
        Ok(job)
    }

    async fn cancel_training(&self, job_id: &EntityId) -> Result<()> {
        log::warn!("Cancelling training job {}", job_id);
        let request = self
            .client
            .post(self.url(&["training-jobs", job_id.as_str(), "cancel"])?);
        self.execute(request, "cancel training").await?;
        Ok(())
    }
}

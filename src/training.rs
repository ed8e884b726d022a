//! Training job orchestration.
//!
//! The backend owns training jobs; this module starts, cancels and polls
//! them and feeds every snapshot into the flow through
//! `FlowState::set_current_training_job`. A job is only tracked once the
//! backend has confirmed it.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::api::TrainingJobService;
use crate::error::TrainingError;
use crate::flow::{FlowState, FlowStep};
use crate::flow_store::FlowStore;
use crate::models::{EntityId, TrainingJob};

/// Checks whether a new training job may be started, returning the chatbot
/// to train.
pub fn check_can_start(state: &FlowState) -> Result<EntityId, TrainingError> {
    let chatbot = state
        .selected_chatbot
        .as_ref()
        .ok_or(TrainingError::NoChatbot)?;
    if state.documents.is_empty() {
        return Err(TrainingError::NoDocuments);
    }
    if !state.step_status(FlowStep::KnowledgeBase).completed {
        return Err(TrainingError::KnowledgeBaseIncomplete);
    }
    if let Some(job) = &state.current_training_job {
        if job.status.is_active() {
            return Err(TrainingError::JobInProgress(job.id.clone()));
        }
    }
    Ok(chatbot.id.clone())
}

/// Poll delay that doubles on every failed poll, up to `max`.
#[derive(Debug, Clone)]
struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: base,
        }
    }

    fn on_success(&mut self) -> Duration {
        self.current = self.base;
        self.current
    }

    fn on_failure(&mut self) -> Duration {
        self.current = (self.current * 2).min(self.max);
        self.current
    }
}

/// Handle of a background poll loop.
pub struct JobWatch {
    pub job_id: EntityId,
    pub task: JoinHandle<Result<Option<TrainingJob>, TrainingError>>,
}

pub struct TrainingOrchestrator {
    service: Arc<dyn TrainingJobService>,
    flow: Arc<FlowStore>,
    poll_interval: Duration,
    max_poll_backoff: Duration,
    start_lock: Mutex<()>,
    watches: DashMap<EntityId, watch::Sender<bool>>,
}

impl TrainingOrchestrator {
    pub fn new(
        service: Arc<dyn TrainingJobService>,
        flow: Arc<FlowStore>,
        poll_interval: Duration,
        max_poll_backoff: Duration,
    ) -> Self {
        Self {
            service,
            flow,
            poll_interval,
            max_poll_backoff,
            start_lock: Mutex::new(()),
            watches: DashMap::new(),
        }
    }

    /// Starts a job for the selected chatbot once the flow allows it.
    pub async fn start_training(&self) -> Result<TrainingJob, TrainingError> {
        // two concurrent starts must not both pass the gate
        let _guard = self.start_lock.lock().await;

        let chatbot_id = check_can_start(&self.flow.snapshot().await)?;
        log::info!("Requesting training for chatbot {}", chatbot_id);

        let job = self
            .service
            .start_training(&chatbot_id)
            .await
            .map_err(|e| {
                log::error!("Failed to start training for {}: {:#}", chatbot_id, e);
                TrainingError::Service(e)
            })?;

        let tracked = self
            .flow
            .mutate(|state| {
                let still_selected = state
                    .selected_chatbot
                    .as_ref()
                    .is_some_and(|c| c.id == chatbot_id);
                if still_selected {
                    state.set_current_training_job(Some(job.clone()));
                }
                still_selected
            })
            .await
            .map_err(TrainingError::Persist)?;

        if tracked {
            log::info!("Tracking training job {} ({:?})", job.id, job.status);
        } else {
            log::warn!(
                "Chatbot changed while starting training, not tracking job {}",
                job.id
            );
        }
        Ok(job)
    }

    /// Cancels the tracked job and drops the local reference. Only a pending
    /// or running job can be cancelled; on failure the reference is left as
    /// it was.
    pub async fn cancel_training(&self) -> Result<(), TrainingError> {
        let job = self
            .flow
            .snapshot()
            .await
            .current_training_job
            .ok_or(TrainingError::NoActiveJob)?;
        if job.status.is_terminal() {
            log::warn!("Refusing to cancel job {} which is already {:?}", job.id, job.status);
            return Err(TrainingError::JobFinished(job.id));
        }

        self.service
            .cancel_training(&job.id)
            .await
            .map_err(TrainingError::Service)?;
        self.stop_watch(&job.id);

        self.flow
            .mutate(|state| {
                let same = state
                    .current_training_job
                    .as_ref()
                    .is_some_and(|current| current.id == job.id);
                if same {
                    state.set_current_training_job(None);
                }
            })
            .await
            .map_err(TrainingError::Persist)?;
        log::info!("Cancelled training job {}", job.id);
        Ok(())
    }

    /// Fetches the tracked job once and applies the snapshot.
    pub async fn poll_once(&self) -> Result<TrainingJob, TrainingError> {
        let job_id = self
            .flow
            .snapshot()
            .await
            .current_training_job
            .map(|job| job.id)
            .ok_or(TrainingError::NoActiveJob)?;

        self.refresh(&job_id)
            .await?
            .ok_or(TrainingError::NoActiveJob)
    }

    /// Fetches `job_id` and applies it if it is still the tracked job.
    /// Returns `None` when the reference has moved on.
    async fn refresh(&self, job_id: &EntityId) -> Result<Option<TrainingJob>, TrainingError> {
        let job = self
            .service
            .get_training_job(job_id)
            .await
            .map_err(TrainingError::Service)?;

        self.flow
            .mutate(|state| {
                let tracked = state
                    .current_training_job
                    .as_ref()
                    .is_some_and(|current| &current.id == job_id);
                if tracked {
                    state.set_current_training_job(Some(job.clone()));
                    Some(job)
                } else {
                    None
                }
            })
            .await
            .map_err(TrainingError::Persist)
    }

    /// Polls `job_id` until it is terminal, the flow stops tracking it, or
    /// `cancel` fires. Returns the terminal snapshot if one was reached.
    pub async fn watch_job(
        &self,
        job_id: &EntityId,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<Option<TrainingJob>, TrainingError> {
        let mut backoff = Backoff::new(self.poll_interval, self.max_poll_backoff);
        let mut delay = self.poll_interval;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.changed() => {
                    log::debug!("Stopped watching training job {}", job_id);
                    return Ok(None);
                }
            }

            match self.refresh(job_id).await {
                Ok(Some(job)) => {
                    log::debug!(
                        "Training job {} is {:?} ({}%)",
                        job.id,
                        job.status,
                        job.progress
                    );
                    if job.status.is_terminal() {
                        log::info!("Training job {} finished as {:?}", job.id, job.status);
                        return Ok(Some(job));
                    }
                    delay = backoff.on_success();
                }
                Ok(None) => {
                    log::info!("Training job {} is no longer tracked", job_id);
                    return Ok(None);
                }
                Err(TrainingError::Service(e)) => {
                    delay = backoff.on_failure();
                    log::warn!(
                        "Polling training job {} failed, retrying in {:?}: {:#}",
                        job_id,
                        delay,
                        e
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Runs [`watch_job`](Self::watch_job) in the background. A previous
    /// watch of the same job is stopped first.
    pub fn spawn_watch(self: &Arc<Self>, job_id: EntityId) -> JobWatch {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        if let Some(previous) = self.watches.insert(job_id.clone(), cancel_tx) {
            previous.send_replace(true);
        }

        let orchestrator = Arc::clone(self);
        let id = job_id.clone();
        let task = tokio::spawn(async move {
            let result = orchestrator.watch_job(&id, cancel_rx).await;
            // our receiver is gone now; a newer watch of the same job keeps its entry
            orchestrator.watches.remove_if(&id, |_, cancel| cancel.is_closed());
            result
        });
        JobWatch { job_id, task }
    }

    pub fn stop_watch(&self, job_id: &EntityId) -> bool {
        match self.watches.remove(job_id) {
            Some((_, cancel)) => {
                cancel.send_replace(true);
                true
            }
            None => false,
        }
    }

    pub fn is_watching(&self, job_id: &EntityId) -> bool {
        self.watches.contains_key(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chatbot, Document, KnowledgeBase, Program, Session, TrainingStatus};
    use crate::storage::{MemoryStateStore, StateStore};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Memory store whose saves can be switched off.
    #[derive(Default)]
    struct ToggleStore {
        inner: MemoryStateStore,
        fail_saves: AtomicBool,
    }

    #[async_trait]
    impl StateStore for ToggleStore {
        async fn load(&self, slot: &str) -> Result<Option<String>> {
            self.inner.load(slot).await
        }

        async fn save(&self, slot: &str, value: &str) -> Result<()> {
            if self.fail_saves.load(Ordering::SeqCst) {
                anyhow::bail!("database is locked");
            }
            self.inner.save(slot, value).await
        }

        async fn remove(&self, slot: &str) -> Result<()> {
            self.inner.remove(slot).await
        }
    }

    /// Returns polled snapshots from a script, repeating the last one.
    #[derive(Default)]
    struct FakeTrainingService {
        start_fails: bool,
        cancel_fails: bool,
        polls: std::sync::Mutex<VecDeque<Result<TrainingStatus, String>>>,
        last: std::sync::Mutex<Option<TrainingStatus>>,
        started: AtomicUsize,
        cancelled: AtomicUsize,
    }

    impl FakeTrainingService {
        fn polling(script: Vec<Result<TrainingStatus, String>>) -> Self {
            Self {
                polls: std::sync::Mutex::new(script.into()),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl TrainingJobService for FakeTrainingService {
        async fn start_training(&self, chatbot_id: &EntityId) -> Result<TrainingJob> {
            if self.start_fails {
                anyhow::bail!("503 service unavailable");
            }
            let n = self.started.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(TrainingJob::new(&format!("job-{n}"), chatbot_id.as_str(), TrainingStatus::Pending, 0).unwrap())
        }

        async fn get_training_job(&self, job_id: &EntityId) -> Result<TrainingJob> {
            let next = self.polls.lock().unwrap().pop_front();
            let status = match next {
                Some(Ok(status)) => {
                    *self.last.lock().unwrap() = Some(status);
                    status
                }
                Some(Err(e)) => anyhow::bail!(e),
                None => self.last.lock().unwrap().unwrap_or(TrainingStatus::Running),
            };
            let progress = if status == TrainingStatus::Completed { 100 } else { 50 };
            Ok(TrainingJob::new(job_id.as_str(), "c1", status, progress).unwrap())
        }

        async fn cancel_training(&self, _job_id: &EntityId) -> Result<()> {
            if self.cancel_fails {
                anyhow::bail!("cannot cancel");
            }
            self.cancelled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn ready_state(state: &mut FlowState) {
        state.set_selected_chatbot(Some(Chatbot::new("c1", "Bot").unwrap()));
        state.set_selected_program(Some(Program::new("p1", "Program").unwrap()));
        state.add_session(Session::new("s1", "Kickoff").unwrap());
        state.set_selected_knowledge_base(Some(KnowledgeBase::new("k1", "KB").unwrap()));
        state.add_document(Document::new("d1", "guide.pdf").unwrap());
    }

    async fn orchestrator(
        service: FakeTrainingService,
        ready: bool,
    ) -> (Arc<TrainingOrchestrator>, Arc<FlowStore>, Arc<FakeTrainingService>) {
        let flow = Arc::new(
            FlowStore::open(Arc::new(MemoryStateStore::new()), "flow")
                .await
                .unwrap(),
        );
        if ready {
            flow.mutate(ready_state).await.unwrap();
        }
        let service = Arc::new(service);
        let orchestrator = Arc::new(TrainingOrchestrator::new(
            service.clone(),
            flow.clone(),
            Duration::from_millis(5),
            Duration::from_millis(20),
        ));
        (orchestrator, flow, service)
    }

    #[test]
    fn start_gate_reports_first_missing_requirement() {
        let mut state = FlowState::default();
        assert!(matches!(check_can_start(&state), Err(TrainingError::NoChatbot)));

        state.set_selected_chatbot(Some(Chatbot::new("c1", "Bot").unwrap()));
        assert!(matches!(check_can_start(&state), Err(TrainingError::NoDocuments)));

        state.add_document(Document::new("d1", "a.pdf").unwrap());
        assert!(matches!(
            check_can_start(&state),
            Err(TrainingError::KnowledgeBaseIncomplete)
        ));

        state.set_selected_knowledge_base(Some(KnowledgeBase::new("k1", "KB").unwrap()));
        assert_eq!(check_can_start(&state).unwrap().as_str(), "c1");

        state.set_current_training_job(Some(
            TrainingJob::new("j1", "c1", TrainingStatus::Running, 10).unwrap(),
        ));
        assert!(matches!(
            check_can_start(&state),
            Err(TrainingError::JobInProgress(_))
        ));

        for status in [TrainingStatus::Completed, TrainingStatus::Failed] {
            state.set_current_training_job(Some(TrainingJob::new("j1", "c1", status, 0).unwrap()));
            assert!(check_can_start(&state).is_ok());
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(35));
        assert_eq!(backoff.on_failure(), Duration::from_millis(20));
        assert_eq!(backoff.on_failure(), Duration::from_millis(35));
        assert_eq!(backoff.on_failure(), Duration::from_millis(35));
        assert_eq!(backoff.on_success(), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn failed_start_leaves_reference_unchanged() {
        let (orchestrator, flow, _service) = orchestrator(
            FakeTrainingService {
                start_fails: true,
                ..FakeTrainingService::default()
            },
            true,
        )
        .await;

        let err = orchestrator.start_training().await.unwrap_err();

        assert!(matches!(err, TrainingError::Service(_)));
        assert!(flow.snapshot().await.current_training_job.is_none());
    }

    #[tokio::test]
    async fn unsaved_start_leaves_reference_unchanged() {
        let store = Arc::new(ToggleStore::default());
        let flow = Arc::new(FlowStore::open(store.clone(), "flow").await.unwrap());
        flow.mutate(ready_state).await.unwrap();
        let orchestrator = TrainingOrchestrator::new(
            Arc::new(FakeTrainingService::default()),
            flow.clone(),
            Duration::from_millis(5),
            Duration::from_millis(20),
        );

        store.fail_saves.store(true, Ordering::SeqCst);
        assert!(matches!(
            orchestrator.start_training().await,
            Err(TrainingError::Persist(_))
        ));
        let state = flow.snapshot().await;
        assert!(state.current_training_job.is_none());
        assert!(!state.step_status(FlowStep::Training).has_data);

        // the failed start must not lock out the next one
        store.fail_saves.store(false, Ordering::SeqCst);
        let job = orchestrator.start_training().await.unwrap();
        assert_eq!(flow.snapshot().await.current_training_job.unwrap().id, job.id);
    }

    #[tokio::test]
    async fn finished_job_cannot_be_cancelled() {
        let (orchestrator, flow, service) = orchestrator(
            FakeTrainingService::polling(vec![Ok(TrainingStatus::Completed)]),
            true,
        )
        .await;
        orchestrator.start_training().await.unwrap();
        orchestrator.poll_once().await.unwrap();
        let before = flow.snapshot().await;
        assert!(before.step_status(FlowStep::Training).completed);

        assert!(matches!(
            orchestrator.cancel_training().await,
            Err(TrainingError::JobFinished(_))
        ));

        assert_eq!(service.cancelled.load(Ordering::SeqCst), 0);
        let after = flow.snapshot().await;
        assert!(after.step_status(FlowStep::Training).completed);
        assert_eq!(after.get_flow_progress(), before.get_flow_progress());
        assert_eq!(after.current_training_job, before.current_training_job);
    }

    #[tokio::test]
    async fn gate_failure_makes_no_remote_call() {
        let (orchestrator, _flow, service) =
            orchestrator(FakeTrainingService::default(), false).await;

        assert!(matches!(
            orchestrator.start_training().await,
            Err(TrainingError::NoChatbot)
        ));
        assert_eq!(service.started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn second_start_is_refused_while_job_active() {
        let (orchestrator, flow, service) =
            orchestrator(FakeTrainingService::default(), true).await;

        let job = orchestrator.start_training().await.unwrap();
        assert_eq!(job.status, TrainingStatus::Pending);
        let state = flow.snapshot().await;
        assert_eq!(state.current_training_job.as_ref().unwrap().id, job.id);
        assert!(state.step_status(FlowStep::Training).has_data);

        assert!(matches!(
            orchestrator.start_training().await,
            Err(TrainingError::JobInProgress(_))
        ));
        assert_eq!(service.started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn watch_polls_until_completed() {
        let (orchestrator, flow, _service) = orchestrator(
            FakeTrainingService::polling(vec![
                Ok(TrainingStatus::Running),
                Err("timeout".into()),
                Ok(TrainingStatus::Running),
                Ok(TrainingStatus::Completed),
            ]),
            true,
        )
        .await;
        assert!(flow.snapshot().await.suggest_retraining);

        let job = orchestrator.start_training().await.unwrap();
        let watch = orchestrator.spawn_watch(job.id.clone());
        assert!(orchestrator.is_watching(&job.id));

        let finished = watch.task.await.unwrap().unwrap().unwrap();

        assert_eq!(finished.status, TrainingStatus::Completed);
        let state = flow.snapshot().await;
        assert!(state.step_status(FlowStep::Training).completed);
        assert!(!state.suggest_retraining);
        assert_eq!(state.get_flow_progress(), 75);
        assert!(!orchestrator.is_watching(&job.id));
    }

    #[tokio::test]
    async fn stopping_a_watch_ends_the_loop() {
        let (orchestrator, _flow, _service) =
            orchestrator(FakeTrainingService::default(), true).await;
        let job = orchestrator.start_training().await.unwrap();

        let watch = orchestrator.spawn_watch(job.id.clone());
        assert!(orchestrator.stop_watch(&job.id));

        assert!(watch.task.await.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn watch_ends_when_reference_is_dropped() {
        let (orchestrator, flow, _service) =
            orchestrator(FakeTrainingService::default(), true).await;
        let job = orchestrator.start_training().await.unwrap();

        // switching chatbots discards the tracked job
        flow.mutate(|s| s.set_selected_chatbot(Some(Chatbot::new("c2", "Other").unwrap())))
            .await
            .unwrap();

        let (_tx, rx) = watch::channel(false);
        let result = orchestrator.watch_job(&job.id, rx).await.unwrap();
        assert!(result.is_none());
        assert!(flow.snapshot().await.current_training_job.is_none());
    }

    #[tokio::test]
    async fn cancel_clears_reference_only_on_success() {
        let (orchestrator, flow, _service) = orchestrator(
            FakeTrainingService {
                cancel_fails: true,
                ..FakeTrainingService::default()
            },
            true,
        )
        .await;
        orchestrator.start_training().await.unwrap();

        assert!(matches!(
            orchestrator.cancel_training().await,
            Err(TrainingError::Service(_))
        ));
        assert!(flow.snapshot().await.current_training_job.is_some());

        let (orchestrator, flow, service) =
            self::orchestrator(FakeTrainingService::default(), true).await;
        orchestrator.start_training().await.unwrap();
        orchestrator.cancel_training().await.unwrap();

        assert_eq!(service.cancelled.load(Ordering::SeqCst), 1);
        let state = flow.snapshot().await;
        assert!(state.current_training_job.is_none());
        assert!(!state.step_status(FlowStep::Training).has_data);
        assert!(matches!(
            orchestrator.cancel_training().await,
            Err(TrainingError::NoActiveJob)
        ));
    }

    #[tokio::test]
    async fn repeated_poll_is_idempotent() {
        let (orchestrator, flow, _service) = orchestrator(
            FakeTrainingService::polling(vec![Ok(TrainingStatus::Running)]),
            true,
        )
        .await;
        orchestrator.start_training().await.unwrap();

        orchestrator.poll_once().await.unwrap();
        let first = flow.snapshot().await;
        orchestrator.poll_once().await.unwrap();
        let second = flow.snapshot().await;

        assert_eq!(first.current_training_job, second.current_training_job);
        assert_eq!(first.documents, second.documents);
        assert_eq!(first.suggest_retraining, second.suggest_retraining);
        assert_eq!(
            first.step_status(FlowStep::Training).completed,
            second.step_status(FlowStep::Training).completed
        );
    }
}

// src/video/mod.rs — Video generation jobs: submit, poll, cancel

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::auth::AuthTokenProvider;
use crate::infra::errors::DropchatError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Submitted,
    InProgress,
    Completed,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Error | JobStatus::Cancelled
        )
    }
}

/// Client-observed snapshot of a remote video-generation job. The backend is
/// authoritative; this is the last state the poller saw.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoJob {
    pub operation_name: String,
    pub status: JobStatus,
    pub video_uri: Option<String>,
    /// HTTPS-fetchable translation of `video_uri`.
    pub video_url: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Remote video endpoints. Trait seam so tests can substitute a scripted
/// backend and count status calls.
#[async_trait]
pub trait VideoApi: Send + Sync {
    async fn submit(
        &self,
        prompt: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<VideoJob, DropchatError>;

    async fn status(&self, operation_name: &str) -> Result<VideoJob, DropchatError>;

    async fn cancel(&self, operation_name: &str) -> Result<(), DropchatError>;
}

/// Translate a raw storage-scheme URI (`gs://bucket/path`) to a fetchable
/// HTTPS form. URIs already fetchable pass through unchanged.
pub fn translate_storage_uri(uri: &str) -> String {
    match uri.strip_prefix("gs://") {
        Some(rest) => {
            let (bucket, path) = rest.split_once('/').unwrap_or((rest, ""));
            format!("https://storage.cloud.google.com/{bucket}/{path}")
        }
        None => uri.to_string(),
    }
}

fn finalize(mut job: VideoJob) -> VideoJob {
    job.video_url = job.video_uri.as_deref().map(translate_storage_uri);
    job
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    Idle,
    Submitting,
    Polling { operation_name: String },
    Terminal(JobStatus),
}

struct Inner {
    state: Mutex<JobState>,
    last_job: Mutex<Option<VideoJob>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    /// Bumped by `cancel` so an in-flight submit cannot resurrect polling.
    epoch: AtomicU64,
    on_update: Mutex<Option<Arc<dyn Fn(VideoJob) + Send + Sync>>>,
}

// State mutexes guard plain data; a poisoned lock still holds usable state.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Drives one video-generation job at a time: submit, then a fixed-interval
/// poll of the status endpoint until a terminal state, with cancellation.
///
/// At most one poll task is live per controller; starting a new poll aborts
/// the previous task first.
pub struct VideoJobController {
    api: Arc<dyn VideoApi>,
    poll_interval: Duration,
    inner: Arc<Inner>,
}

impl VideoJobController {
    pub fn new(api: Arc<dyn VideoApi>, poll_interval: Duration) -> Self {
        Self {
            api,
            poll_interval,
            inner: Arc::new(Inner {
                state: Mutex::new(JobState::Idle),
                last_job: Mutex::new(None),
                poll_task: Mutex::new(None),
                epoch: AtomicU64::new(0),
                on_update: Mutex::new(None),
            }),
        }
    }

    /// Register a callback receiving every observed job snapshot.
    pub fn with_on_update(self, cb: impl Fn(VideoJob) + Send + Sync + 'static) -> Self {
        *lock(&self.inner.on_update) = Some(Arc::new(cb));
        self
    }

    pub fn state(&self) -> JobState {
        lock(&self.inner.state).clone()
    }

    /// The most recent snapshot observed for the current or previous job.
    pub fn last_job(&self) -> Option<VideoJob> {
        lock(&self.inner.last_job).clone()
    }

    /// Submit a generation request. A synchronous terminal response settles
    /// the job immediately; an `in_progress` acknowledgement starts polling.
    pub async fn submit(
        &self,
        prompt: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<VideoJob, DropchatError> {
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        *lock(&self.inner.state) = JobState::Submitting;

        let job = match self.api.submit(prompt, user_id, session_id).await {
            Ok(job) => finalize(job),
            Err(e) => {
                *lock(&self.inner.state) = JobState::Terminal(JobStatus::Error);
                return Err(e);
            }
        };

        // Cancelled while the submit was in flight: do not start polling.
        if self.inner.epoch.load(Ordering::SeqCst) != epoch {
            let mut job = job;
            job.status = JobStatus::Cancelled;
            return Ok(job);
        }

        Inner::record(&self.inner, &job);
        if job.status.is_terminal() {
            *lock(&self.inner.state) = JobState::Terminal(job.status);
        } else {
            *lock(&self.inner.state) = JobState::Polling {
                operation_name: job.operation_name.clone(),
            };
            self.start_polling(job.operation_name.clone());
        }
        Ok(job)
    }

    /// Stop the job. Safe to call in any state; the local timer is cleared
    /// synchronously (no further poll can fire), the remote side is notified
    /// best-effort, and local state returns to `Idle` regardless.
    pub fn cancel(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = lock(&self.inner.poll_task).take() {
            handle.abort();
        }
        let operation = {
            let mut state = lock(&self.inner.state);
            let op = match &*state {
                JobState::Polling { operation_name } => Some(operation_name.clone()),
                _ => None,
            };
            *state = JobState::Idle;
            op
        };
        if let Some(op) = operation {
            let api = self.api.clone();
            tokio::spawn(async move {
                if let Err(e) = api.cancel(&op).await {
                    warn!(operation = %op, error = %e, "remote cancel failed");
                }
            });
        }
    }

    fn start_polling(&self, operation_name: String) {
        let mut task = lock(&self.inner.poll_task);
        // Idempotent restart: never two timers at once.
        if let Some(previous) = task.take() {
            previous.abort();
        }

        let api = self.api.clone();
        let inner = self.inner.clone();
        let interval = self.poll_interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately; the first real poll happens
            // one interval after submission.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let job = match api.status(&operation_name).await {
                    Ok(job) => finalize(job),
                    // An unreachable job (e.g. unknown operation) must not
                    // poll forever: transport failure is terminal.
                    Err(e) => VideoJob {
                        operation_name: operation_name.clone(),
                        status: JobStatus::Error,
                        video_uri: None,
                        video_url: None,
                        error: Some(e.to_string()),
                        created_at: Utc::now(),
                    },
                };
                Inner::record(&inner, &job);

                let settled = match job.status {
                    JobStatus::Completed => job.video_uri.is_some(),
                    JobStatus::Error | JobStatus::Cancelled => true,
                    _ => false,
                };
                if settled {
                    *lock(&inner.state) = JobState::Terminal(job.status);
                    break;
                }
            }
        }));
    }
}

impl Inner {
    fn record(inner: &Arc<Inner>, job: &VideoJob) {
        *lock(&inner.last_job) = Some(job.clone());
        let cb = lock(&inner.on_update).clone();
        if let Some(cb) = cb {
            cb(job.clone());
        }
    }
}

/// HTTP implementation of the video endpoints.
pub struct HttpVideoApi {
    base_url: String,
    auth: Arc<dyn AuthTokenProvider>,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    status: JobStatus,
    operation_name: String,
    #[serde(default)]
    video_uri: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: JobStatus,
    #[serde(default)]
    video_uri: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl HttpVideoApi {
    pub fn new(base_url: &str, auth: Arc<dyn AuthTokenProvider>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            client: reqwest::Client::new(),
        }
    }

    fn transport(err: reqwest::Error) -> DropchatError {
        DropchatError::JobFailed(err.to_string())
    }
}

#[async_trait]
impl VideoApi for HttpVideoApi {
    async fn submit(
        &self,
        prompt: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<VideoJob, DropchatError> {
        let token = self.auth.bearer_token().await?;
        let resp: SubmitResponse = self
            .client
            .post(format!("{}/generate-video", self.base_url))
            .bearer_auth(token)
            .json(&serde_json::json!({
                "prompt": prompt,
                "user_id": user_id,
                "session_id": session_id,
            }))
            .send()
            .await
            .map_err(Self::transport)?
            .error_for_status()
            .map_err(Self::transport)?
            .json()
            .await
            .map_err(Self::transport)?;
        Ok(VideoJob {
            operation_name: resp.operation_name,
            status: resp.status,
            video_uri: resp.video_uri,
            video_url: None,
            error: resp.error,
            created_at: Utc::now(),
        })
    }

    async fn status(&self, operation_name: &str) -> Result<VideoJob, DropchatError> {
        let token = self.auth.bearer_token().await?;
        let resp: StatusResponse = self
            .client
            .get(format!("{}/video-status/{}", self.base_url, operation_name))
            .bearer_auth(token)
            .send()
            .await
            .map_err(Self::transport)?
            .error_for_status()
            .map_err(Self::transport)?
            .json()
            .await
            .map_err(Self::transport)?;
        Ok(VideoJob {
            operation_name: operation_name.to_string(),
            status: resp.status,
            video_uri: resp.video_uri,
            video_url: None,
            error: resp.error,
            created_at: Utc::now(),
        })
    }

    async fn cancel(&self, operation_name: &str) -> Result<(), DropchatError> {
        let token = self.auth.bearer_token().await?;
        self.client
            .post(format!("{}/cancel-video/{}", self.base_url, operation_name))
            .bearer_auth(token)
            .send()
            .await
            .map_err(Self::transport)?
            .error_for_status()
            .map_err(Self::transport)?;
        Ok(())
    }
}

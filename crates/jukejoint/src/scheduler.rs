//! Endpoint queue scheduler.
//!
//! One bounded-concurrency queue sits in front of each external model
//! endpoint (LLM, image, audio). Jobs carry a priority (lower runs sooner),
//! a cancellation token, and a result channel; ties between equal
//! priorities break FIFO by enqueue sequence. The pending and active sets
//! are owned by a single dispatch loop per endpoint, so a saturated image
//! queue never blocks LLM progress.
//!
//! The scheduler never retries; retry decisions belong to the pipeline.

use chrono::{DateTime, Utc};
use jukeproto::SongId;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How many finished jobs each queue remembers for telemetry.
const RECENT_COMPLETIONS: usize = 32;

/// The three capability-typed endpoints the pipeline schedules against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    Llm,
    Image,
    Audio,
}

impl EndpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointKind::Llm => "llm",
            EndpointKind::Image => "image",
            EndpointKind::Audio => "audio",
        }
    }
}

impl std::fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of one scheduled job.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    #[error("{0}")]
    Failed(String),

    #[error("job cancelled")]
    Cancelled,
}

/// Work signature: the job receives its cancellation token and must observe
/// it at suspension points.
pub type WorkFn = Box<
    dyn FnOnce(
            CancellationToken,
        )
            -> Pin<Box<dyn Future<Output = anyhow::Result<serde_json::Value>> + Send>>
        + Send,
>;

/// Outcome of a completed job, for the rolling telemetry window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOutcome {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionRecord {
    pub song_id: SongId,
    pub outcome: JobOutcome,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingJobInfo {
    pub song_id: SongId,
    pub priority: i64,
    pub waiting_since: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveJobInfo {
    pub song_id: SongId,
    pub started_at: DateTime<Utc>,
}

/// Snapshot of one endpoint queue for `/api/worker/status`.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub endpoint: EndpointKind,
    pub max_concurrency: usize,
    pub pending: Vec<PendingJobInfo>,
    pub active: Vec<ActiveJobInfo>,
    pub errors: u64,
    pub last_error: Option<String>,
    pub recent: Vec<CompletionRecord>,
}

struct PendingJob {
    song_id: SongId,
    priority: i64,
    seq: u64,
    enqueued_at: DateTime<Utc>,
    token: CancellationToken,
    work: WorkFn,
    done_tx: oneshot::Sender<Result<serde_json::Value, JobError>>,
}

struct ActiveJob {
    token: CancellationToken,
    started_at: DateTime<Utc>,
}

struct QueueState {
    /// Sorted by (priority, seq): head runs next.
    pending: Vec<PendingJob>,
    active: HashMap<SongId, ActiveJob>,
    next_seq: u64,
    recent: VecDeque<CompletionRecord>,
}

struct QueueInner {
    endpoint: EndpointKind,
    max_concurrency: usize,
    state: Mutex<QueueState>,
    wake: Notify,
    errors: AtomicU64,
    last_error: Mutex<Option<String>>,
    shutdown: CancellationToken,
}

/// Handle to one submitted job.
pub struct JobHandle {
    song_id: SongId,
    token: CancellationToken,
    done: oneshot::Receiver<Result<serde_json::Value, JobError>>,
}

impl JobHandle {
    pub fn song_id(&self) -> &SongId {
        &self.song_id
    }

    /// Fire the job's cancellation token. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait for the job's terminal result.
    pub async fn wait(self) -> Result<serde_json::Value, JobError> {
        match self.done.await {
            Ok(result) => result,
            // Dispatch dropped the sender: the queue shut down underneath us.
            Err(_) => Err(JobError::Cancelled),
        }
    }
}

/// Bounded-concurrency priority queue in front of one model endpoint.
#[derive(Clone)]
pub struct EndpointQueue {
    inner: Arc<QueueInner>,
}

impl EndpointQueue {
    /// Create the queue and start its dispatch loop.
    ///
    /// `shutdown` cancels every pending and active job and stops the loop.
    pub fn new(endpoint: EndpointKind, max_concurrency: usize, shutdown: CancellationToken) -> Self {
        let inner = Arc::new(QueueInner {
            endpoint,
            max_concurrency: max_concurrency.max(1),
            state: Mutex::new(QueueState {
                pending: Vec::new(),
                active: HashMap::new(),
                next_seq: 1,
                recent: VecDeque::with_capacity(RECENT_COMPLETIONS),
            }),
            wake: Notify::new(),
            errors: AtomicU64::new(0),
            last_error: Mutex::new(None),
            shutdown,
        });

        let queue = Self { inner };
        tokio::spawn(dispatch_loop(queue.inner.clone()));
        queue
    }

    /// Enqueue one job. Lower `priority` runs sooner; equal priorities run
    /// in submission order.
    pub fn submit(&self, song_id: SongId, priority: i64, work: WorkFn) -> JobHandle {
        let token = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();

        {
            let mut state = self.inner.state.lock().unwrap();
            let seq = state.next_seq;
            state.next_seq += 1;

            let job = PendingJob {
                song_id: song_id.clone(),
                priority,
                seq,
                enqueued_at: Utc::now(),
                token: token.clone(),
                work,
                done_tx,
            };
            let pos = state
                .pending
                .binary_search_by_key(&(priority, seq), |j| (j.priority, j.seq))
                .unwrap_err();
            state.pending.insert(pos, job);
        }

        debug!(
            endpoint = %self.inner.endpoint,
            job.song = %song_id,
            job.priority = priority,
            "job enqueued"
        );
        self.inner.wake.notify_one();

        JobHandle {
            song_id,
            token,
            done: done_rx,
        }
    }

    /// Cancel every job (pending or active) for `song_id`. Idempotent; a
    /// pending job is dropped without ever being invoked.
    pub fn cancel(&self, song_id: &SongId) {
        let mut dropped = Vec::new();
        {
            let mut state = self.inner.state.lock().unwrap();

            let mut i = 0;
            while i < state.pending.len() {
                if &state.pending[i].song_id == song_id {
                    dropped.push(state.pending.remove(i));
                } else {
                    i += 1;
                }
            }

            if let Some(active) = state.active.get(song_id) {
                active.token.cancel();
            }

            for job in &dropped {
                state.recent.push_back(CompletionRecord {
                    song_id: job.song_id.clone(),
                    outcome: JobOutcome::Cancelled,
                    enqueued_at: job.enqueued_at,
                    started_at: None,
                    finished_at: Utc::now(),
                });
                while state.recent.len() > RECENT_COMPLETIONS {
                    state.recent.pop_front();
                }
            }
        }

        for job in dropped {
            job.token.cancel();
            let _ = job.done_tx.send(Err(JobError::Cancelled));
            info!(
                endpoint = %self.inner.endpoint,
                job.song = %job.song_id,
                "pending job cancelled"
            );
        }
    }

    /// Telemetry snapshot.
    pub fn status(&self) -> QueueStatus {
        let state = self.inner.state.lock().unwrap();
        QueueStatus {
            endpoint: self.inner.endpoint,
            max_concurrency: self.inner.max_concurrency,
            pending: state
                .pending
                .iter()
                .map(|j| PendingJobInfo {
                    song_id: j.song_id.clone(),
                    priority: j.priority,
                    waiting_since: j.enqueued_at,
                })
                .collect(),
            active: state
                .active
                .iter()
                .map(|(song_id, j)| ActiveJobInfo {
                    song_id: song_id.clone(),
                    started_at: j.started_at,
                })
                .collect(),
            errors: self.inner.errors.load(Ordering::Relaxed),
            last_error: self.inner.last_error.lock().unwrap().clone(),
            recent: state.recent.iter().cloned().collect(),
        }
    }
}

async fn dispatch_loop(inner: Arc<QueueInner>) {
    loop {
        // Start everything startable, then sleep until woken.
        loop {
            let job = {
                let mut state = inner.state.lock().unwrap();
                if state.active.len() >= inner.max_concurrency || state.pending.is_empty() {
                    None
                } else {
                    Some(state.pending.remove(0))
                }
            };

            let Some(job) = job else { break };

            if job.token.is_cancelled() {
                // Cancelled while pending but after the cancel() sweep; it
                // never occupies a slot.
                finish(&inner, job.song_id, job.enqueued_at, None, Err(JobError::Cancelled));
                let _ = job.done_tx.send(Err(JobError::Cancelled));
                continue;
            }

            start_job(&inner, job);
        }

        tokio::select! {
            _ = inner.wake.notified() => {}
            _ = inner.shutdown.cancelled() => {
                shutdown_all(&inner);
                return;
            }
        }
    }
}

fn start_job(inner: &Arc<QueueInner>, job: PendingJob) {
    let started_at = Utc::now();
    {
        let mut state = inner.state.lock().unwrap();
        state.active.insert(
            job.song_id.clone(),
            ActiveJob {
                token: job.token.clone(),
                started_at,
            },
        );
    }

    debug!(endpoint = %inner.endpoint, job.song = %job.song_id, "job started");

    let inner = inner.clone();
    let token = job.token;
    let song_id = job.song_id;
    let enqueued_at = job.enqueued_at;
    let done_tx = job.done_tx;
    let work = job.work;

    tokio::spawn(async move {
        let result = tokio::select! {
            result = (work)(token.clone()) => {
                if token.is_cancelled() {
                    // Work ignored cancellation and ran to completion: the
                    // result is discarded, terminal state stays cancelled.
                    Err(JobError::Cancelled)
                } else {
                    result.map_err(|e| JobError::Failed(format!("{e:#}")))
                }
            }
            _ = token.cancelled() => Err(JobError::Cancelled),
        };

        {
            let mut state = inner.state.lock().unwrap();
            state.active.remove(&song_id);
        }

        let summary = result.as_ref().map(|_| ()).map_err(Clone::clone);
        finish(&inner, song_id, enqueued_at, Some(started_at), summary);
        let _ = done_tx.send(result);
        inner.wake.notify_one();
    });
}

fn finish(
    inner: &Arc<QueueInner>,
    song_id: SongId,
    enqueued_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    result: Result<(), JobError>,
) {
    let outcome = match &result {
        Ok(()) => JobOutcome::Completed,
        Err(JobError::Cancelled) => JobOutcome::Cancelled,
        Err(JobError::Failed(message)) => {
            inner.errors.fetch_add(1, Ordering::Relaxed);
            *inner.last_error.lock().unwrap() = Some(message.clone());
            warn!(
                endpoint = %inner.endpoint,
                job.song = %song_id,
                job.error = %message,
                "job failed"
            );
            JobOutcome::Failed
        }
    };

    if outcome != JobOutcome::Failed {
        debug!(endpoint = %inner.endpoint, job.song = %song_id, job.outcome = ?outcome, "job finished");
    }

    let mut state = inner.state.lock().unwrap();
    state.recent.push_back(CompletionRecord {
        song_id,
        outcome,
        enqueued_at,
        started_at,
        finished_at: Utc::now(),
    });
    while state.recent.len() > RECENT_COMPLETIONS {
        state.recent.pop_front();
    }
}

fn shutdown_all(inner: &Arc<QueueInner>) {
    let (pending, active_tokens) = {
        let mut state = inner.state.lock().unwrap();
        let pending: Vec<PendingJob> = state.pending.drain(..).collect();
        let tokens: Vec<CancellationToken> =
            state.active.values().map(|j| j.token.clone()).collect();
        (pending, tokens)
    };

    for job in pending {
        job.token.cancel();
        let _ = job.done_tx.send(Err(JobError::Cancelled));
    }
    for token in active_tokens {
        token.cancel();
    }

    info!(endpoint = %inner.endpoint, "endpoint queue stopped");
}

/// The scheduler trio, one queue per endpoint.
#[derive(Clone)]
pub struct Schedulers {
    pub llm: EndpointQueue,
    pub image: EndpointQueue,
    pub audio: EndpointQueue,
}

impl Schedulers {
    pub fn new(models: &jukeconf::ModelsConfig, shutdown: CancellationToken) -> Self {
        Self {
            llm: EndpointQueue::new(EndpointKind::Llm, models.llm_concurrency, shutdown.clone()),
            image: EndpointQueue::new(
                EndpointKind::Image,
                models.image_concurrency,
                shutdown.clone(),
            ),
            audio: EndpointQueue::new(EndpointKind::Audio, models.audio_concurrency, shutdown),
        }
    }

    pub fn for_endpoint(&self, endpoint: EndpointKind) -> &EndpointQueue {
        match endpoint {
            EndpointKind::Llm => &self.llm,
            EndpointKind::Image => &self.image,
            EndpointKind::Audio => &self.audio,
        }
    }

    /// Cancel every job for `song_id` across all three endpoints.
    pub fn cancel_song(&self, song_id: &SongId) {
        self.llm.cancel(song_id);
        self.image.cancel(song_id);
        self.audio.cancel(song_id);
    }

    pub fn status(&self) -> Vec<QueueStatus> {
        vec![self.llm.status(), self.image.status(), self.audio.status()]
    }
}

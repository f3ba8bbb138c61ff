//! Generation pipeline.
//!
//! Per-song state machine: `pending -> generating_metadata ->
//! metadata_ready -> submitting_to_ace -> generating_audio -> saving ->
//! ready` (or `error` / `cancelled`). Each step is a job on one of the
//! endpoint queues; the audio poll is a chain of short-lived probes so a
//! slow render never pins an audio slot and cancellation lands at the next
//! probe boundary.

use crate::bus::{BusSubscription, EventBus};
use crate::endpoints::ModelEndpoints;
use crate::media::MediaStore;
use crate::scheduler::{EndpointKind, EndpointQueue, JobError, Schedulers};
use crate::store::Store;
use jukeproto::{Event, EventKind, PlaylistId, Song, SongId, SongStatus};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interrupts must beat every regular song at the same endpoint, whatever
/// their order index.
const INTERRUPT_PRIORITY_BOOST: i64 = 1_000_000_000;

/// Scheduler priority for a song: lower runs sooner.
pub fn job_priority(order_index: f64, is_interrupt: bool) -> i64 {
    let base = (order_index * 1000.0).round() as i64;
    if is_interrupt {
        base - INTERRUPT_PRIORITY_BOOST
    } else {
        base
    }
}

enum StepFailure {
    Failed(String),
    Cancelled,
}

impl From<JobError> for StepFailure {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Cancelled => StepFailure::Cancelled,
            JobError::Failed(message) => StepFailure::Failed(message),
        }
    }
}

struct PipelineInner {
    store: Arc<dyn Store>,
    endpoints: Arc<dyn ModelEndpoints>,
    schedulers: Schedulers,
    media: Arc<MediaStore>,
    bus: EventBus,
    poll_interval: Duration,
    poll_max_attempts: u32,
    /// One pipeline per song: song id -> that run's cancellation token.
    in_flight: Mutex<HashMap<SongId, CancellationToken>>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct GenerationPipeline {
    inner: Arc<PipelineInner>,
}

impl GenerationPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        endpoints: Arc<dyn ModelEndpoints>,
        schedulers: Schedulers,
        media: Arc<MediaStore>,
        bus: EventBus,
        config: &jukeconf::PipelineConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                store,
                endpoints,
                schedulers,
                media,
                bus,
                poll_interval: Duration::from_millis(config.poll_interval_ms),
                poll_max_attempts: config.poll_max_attempts,
                in_flight: Mutex::new(HashMap::new()),
                shutdown,
            }),
        }
    }

    /// Attach the bus handlers that feed the pipeline. The returned
    /// subscriptions must be kept alive.
    pub fn attach(&self) -> Vec<BusSubscription> {
        let created = {
            let pipeline = self.clone();
            self.inner.bus.subscribe(
                "pipeline.song-created",
                &[EventKind::SongCreated],
                move |event| {
                    let pipeline = pipeline.clone();
                    async move {
                        if let Event::SongCreated { song_id, .. } = event {
                            pipeline.resume(song_id);
                        }
                        Ok(())
                    }
                },
            )
        };

        let steered = {
            let pipeline = self.clone();
            self.inner.bus.subscribe(
                "pipeline.steering",
                &[EventKind::PlaylistSteered],
                move |event| {
                    let pipeline = pipeline.clone();
                    async move {
                        if let Event::PlaylistSteered {
                            playlist_id,
                            prompt_epoch,
                        } = event
                        {
                            pipeline.cancel_stale_epoch(&playlist_id, prompt_epoch).await;
                        }
                        Ok(())
                    }
                },
            )
        };

        vec![created, steered]
    }

    /// Start (or restart) the pipeline for one song. At most one run per
    /// song exists at a time; duplicates are no-ops.
    pub fn resume(&self, song_id: SongId) {
        let token = self.inner.shutdown.child_token();
        {
            let mut in_flight = self.inner.in_flight.lock().unwrap();
            if in_flight.contains_key(&song_id) {
                debug!(song.id = %song_id, "pipeline already running, resume ignored");
                return;
            }
            in_flight.insert(song_id.clone(), token.clone());
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            drive(inner.clone(), song_id.clone(), token).await;
            inner.in_flight.lock().unwrap().remove(&song_id);
        });
    }

    /// Cancel a song's run: fires its drive token and sweeps its jobs off
    /// every endpoint queue. Idempotent.
    pub fn cancel_song(&self, song_id: &SongId) {
        if let Some(token) = self.inner.in_flight.lock().unwrap().get(song_id) {
            token.cancel();
        }
        self.inner.schedulers.cancel_song(song_id);
    }

    /// Song ids with a live pipeline run.
    pub fn in_flight(&self) -> Vec<SongId> {
        self.inner.in_flight.lock().unwrap().keys().cloned().collect()
    }

    /// Steering bumped the playlist epoch: cancel in-flight work for every
    /// stale-epoch song that has not finished. Songs generated from here on
    /// use the new epoch.
    async fn cancel_stale_epoch(&self, playlist_id: &PlaylistId, new_epoch: i64) {
        let songs = match self.inner.store.list_songs_by_playlist(playlist_id).await {
            Ok(songs) => songs,
            Err(error) => {
                warn!(playlist.id = %playlist_id, error = %error, "steering sweep failed to list songs");
                return;
            }
        };

        for song in songs {
            if song.prompt_epoch >= new_epoch || song.status.is_terminal() {
                continue;
            }
            info!(
                song.id = %song.id,
                song.epoch = song.prompt_epoch,
                playlist.epoch = new_epoch,
                "cancelling stale-epoch song"
            );
            self.cancel_song(&song.id);

            let driven = self.inner.in_flight.lock().unwrap().contains_key(&song.id);
            if !driven {
                // No run to observe the cancellation; mark it directly.
                mark_cancelled(&self.inner, &song.id, song.status).await;
            }
        }
    }
}

/// One full run of the state machine for `song_id`.
async fn drive(inner: Arc<PipelineInner>, song_id: SongId, token: CancellationToken) {
    let song = match inner.store.get_song(&song_id).await {
        Ok(Some(song)) => song,
        Ok(None) => {
            warn!(song.id = %song_id, "pipeline started for unknown song");
            return;
        }
        Err(error) => {
            warn!(song.id = %song_id, error = %error, "pipeline failed to load song");
            return;
        }
    };

    // Resume entry point: terminal ready/played songs have nothing left to
    // do; errored, cancelled, or stale in-flight songs re-enter at the
    // latest safe step.
    let song = match song.status {
        SongStatus::Ready | SongStatus::Played => return,
        SongStatus::Pending | SongStatus::MetadataReady => song,
        _ => {
            let target = if song.title.is_some() {
                SongStatus::MetadataReady
            } else {
                SongStatus::Pending
            };
            if let Err(error) = inner.store.update_song_status(&song.id, target).await {
                warn!(song.id = %song_id, error = %error, "resume reset failed");
                return;
            }
            Song {
                status: target,
                ..song
            }
        }
    };

    info!(song.id = %song.id, song.status = %song.status, "pipeline run started");

    let result = run_steps(&inner, &song, &token).await;

    match result {
        Ok(()) => {}
        Err((step, StepFailure::Cancelled)) => {
            info!(song.id = %song.id, step = %step, "pipeline cancelled");
            mark_cancelled(&inner, &song.id, step).await;
        }
        Err((step, StepFailure::Failed(message))) => {
            warn!(song.id = %song.id, step = %step, error = %message, "pipeline failed");
            if let Err(error) = inner.store.mark_song_error(&song.id, &message, step).await {
                warn!(song.id = %song.id, error = %error, "failed to record song error");
            }
            emit_status(&inner, &song, SongStatus::Error);
        }
    }
}

async fn run_steps(
    inner: &Arc<PipelineInner>,
    song: &Song,
    token: &CancellationToken,
) -> Result<(), (SongStatus, StepFailure)> {
    let priority = job_priority(song.order_index, song.is_interrupt);

    // --- Metadata (LLM) ---
    if matches!(song.status, SongStatus::Pending) {
        set_status(inner, song, SongStatus::GeneratingMetadata)
            .await
            .map_err(|e| (SongStatus::GeneratingMetadata, e))?;

        let metadata = generate_metadata(inner, song, priority, token)
            .await
            .map_err(|e| (SongStatus::GeneratingMetadata, e))?;

        let title = metadata["title"].as_str().unwrap_or("Untitled").to_string();
        let style = metadata["style"].as_str().unwrap_or_default().to_string();
        inner
            .store
            .update_song_metadata(&song.id, &title, &style)
            .await
            .map_err(|e| (SongStatus::GeneratingMetadata, StepFailure::Failed(e.to_string())))?;
        inner.bus.emit(Event::SongMetadataUpdated {
            song_id: song.id.clone(),
            playlist_id: song.playlist_id.clone(),
        });

        set_status(inner, song, SongStatus::MetadataReady)
            .await
            .map_err(|e| (SongStatus::MetadataReady, e))?;
    }

    // --- Audio submit, cover art fanned out best-effort ---
    set_status(inner, song, SongStatus::SubmittingToAce)
        .await
        .map_err(|e| (SongStatus::SubmittingToAce, e))?;

    spawn_cover_job(inner.clone(), song.clone(), priority);

    let task_id = submit_audio(inner, song, priority, token)
        .await
        .map_err(|e| (SongStatus::SubmittingToAce, e))?;
    inner
        .store
        .update_song_ace_task(&song.id, &task_id)
        .await
        .map_err(|e| (SongStatus::SubmittingToAce, StepFailure::Failed(e.to_string())))?;

    set_status(inner, song, SongStatus::GeneratingAudio)
        .await
        .map_err(|e| (SongStatus::GeneratingAudio, e))?;

    // --- Audio poll ---
    let (endpoint_url, duration) = poll_audio(inner, song, &task_id, priority, token)
        .await
        .map_err(|e| (SongStatus::GeneratingAudio, e))?;

    // --- Save (best-effort) ---
    set_status(inner, song, SongStatus::Saving)
        .await
        .map_err(|e| (SongStatus::Saving, e))?;

    let audio_url = match inner.media.save_audio(&song.id, &endpoint_url).await {
        Ok(local) => local,
        Err(error) => {
            warn!(
                song.id = %song.id,
                error = %format!("{error:#}"),
                "audio save failed, keeping endpoint url"
            );
            endpoint_url
        }
    };

    // --- Finalize ---
    inner
        .store
        .mark_song_ready(&song.id, &audio_url, duration)
        .await
        .map_err(|e| (SongStatus::Saving, StepFailure::Failed(e.to_string())))?;
    emit_status(inner, song, SongStatus::Ready);
    info!(song.id = %song.id, audio.url = %audio_url, "song ready");
    Ok(())
}

async fn generate_metadata(
    inner: &Arc<PipelineInner>,
    song: &Song,
    priority: i64,
    token: &CancellationToken,
) -> Result<Value, StepFailure> {
    let playlist = inner
        .store
        .get_playlist_by_id(&song.playlist_id)
        .await
        .map_err(|e| StepFailure::Failed(e.to_string()))?
        .ok_or_else(|| StepFailure::Failed(format!("playlist {} missing", song.playlist_id)))?;

    let request = json!({
        "op": "song_metadata",
        "playlist_prompt": playlist.prompt,
        "prompt_epoch": song.prompt_epoch,
        "interrupt_prompt": song.interrupt_prompt,
    });

    run_on_queue(inner, &inner.schedulers.llm, EndpointKind::Llm, song, priority, request, token)
        .await
}

async fn submit_audio(
    inner: &Arc<PipelineInner>,
    song: &Song,
    priority: i64,
    token: &CancellationToken,
) -> Result<String, StepFailure> {
    let song_row = inner
        .store
        .get_song(&song.id)
        .await
        .map_err(|e| StepFailure::Failed(e.to_string()))?
        .ok_or_else(|| StepFailure::Failed(format!("song {} vanished", song.id)))?;

    let request = json!({
        "op": "submit",
        "title": song_row.title,
        "style": song_row.style,
        "interrupt_prompt": song_row.interrupt_prompt,
    });

    let response = run_on_queue(
        inner,
        &inner.schedulers.audio,
        EndpointKind::Audio,
        song,
        priority,
        request,
        token,
    )
    .await?;
    response["task_id"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| StepFailure::Failed("audio submit response missing task_id".to_string()))
}

/// Poll loop: each probe is its own short job on the audio queue so probe
/// pressure is bounded by the audio concurrency and a cancel sweep catches
/// the song between probes.
async fn poll_audio(
    inner: &Arc<PipelineInner>,
    song: &Song,
    task_id: &str,
    priority: i64,
    token: &CancellationToken,
) -> Result<(String, Option<f64>), StepFailure> {
    for attempt in 1..=inner.poll_max_attempts {
        tokio::select! {
            _ = tokio::time::sleep(inner.poll_interval) => {}
            _ = token.cancelled() => return Err(StepFailure::Cancelled),
        }

        let request = json!({ "op": "status", "task_id": task_id });
        let response = run_on_queue(
            inner,
            &inner.schedulers.audio,
            EndpointKind::Audio,
            song,
            priority,
            request,
            token,
        )
        .await?;

        match response["status"].as_str().unwrap_or("") {
            "succeeded" => {
                let url = response["audio_url"].as_str().ok_or_else(|| {
                    StepFailure::Failed("audio status response missing audio_url".to_string())
                })?;
                return Ok((url.to_string(), response["duration"].as_f64()));
            }
            "failed" => {
                let message = response["error"].as_str().unwrap_or("audio generation failed");
                return Err(StepFailure::Failed(message.to_string()));
            }
            _ => {
                debug!(
                    song.id = %song.id,
                    poll.attempt = attempt,
                    poll.max = inner.poll_max_attempts,
                    "audio still rendering"
                );
            }
        }
    }

    Err(StepFailure::Failed(format!(
        "audio generation timed out after {} probes",
        inner.poll_max_attempts
    )))
}

/// Best-effort cover branch; never touches the song's status.
fn spawn_cover_job(inner: Arc<PipelineInner>, song: Song, priority: i64) {
    tokio::spawn(async move {
        // Re-read the row: metadata landed after the snapshot was taken.
        let song_row = match inner.store.get_song(&song.id).await {
            Ok(Some(row)) => row,
            _ => return,
        };
        let request = json!({
            "op": "cover",
            "title": song_row.title,
            "style": song_row.style,
        });

        let shutdown = inner.shutdown.clone();
        let result = run_on_queue(
            &inner,
            &inner.schedulers.image,
            EndpointKind::Image,
            &song,
            priority,
            request,
            &shutdown,
        )
        .await;

        let image_url = match result {
            Ok(response) => match response["image_url"].as_str().map(str::to_string) {
                Some(url) => url,
                None => {
                    warn!(song.id = %song.id, "cover response missing image_url");
                    return;
                }
            },
            Err(StepFailure::Cancelled) => return,
            Err(StepFailure::Failed(message)) => {
                warn!(song.id = %song.id, error = %message, "cover generation failed");
                return;
            }
        };

        let cover_url = match inner.media.save_cover(&song.id, &image_url).await {
            Ok(local) => local,
            Err(_) => image_url,
        };

        if let Err(error) = inner.store.update_song_cover(&song.id, &cover_url).await {
            warn!(song.id = %song.id, error = %error, "failed to record cover url");
        }
    });
}

async fn run_on_queue(
    inner: &Arc<PipelineInner>,
    queue: &EndpointQueue,
    endpoint: EndpointKind,
    song: &Song,
    priority: i64,
    request: Value,
    run_token: &CancellationToken,
) -> Result<Value, StepFailure> {
    let endpoints = inner.endpoints.clone();
    let handle = queue.submit(
        song.id.clone(),
        priority,
        Box::new(move |token| Box::pin(async move { endpoints.run(endpoint, request, token).await })),
    );

    tokio::select! {
        result = handle.wait() => result.map_err(StepFailure::from),
        _ = run_token.cancelled() => {
            queue.cancel(&song.id);
            Err(StepFailure::Cancelled)
        }
    }
}

async fn set_status(
    inner: &Arc<PipelineInner>,
    song: &Song,
    status: SongStatus,
) -> Result<(), StepFailure> {
    inner
        .store
        .update_song_status(&song.id, status)
        .await
        .map_err(|e| StepFailure::Failed(e.to_string()))?;
    emit_status(inner, song, status);
    Ok(())
}

fn emit_status(inner: &Arc<PipelineInner>, song: &Song, status: SongStatus) {
    inner.bus.emit(Event::SongStatusChanged {
        song_id: song.id.clone(),
        playlist_id: song.playlist_id.clone(),
        status,
    });
}

async fn mark_cancelled(inner: &Arc<PipelineInner>, song_id: &SongId, step: SongStatus) {
    match inner.store.mark_song_cancelled(song_id, step).await {
        Ok(()) => {
            if let Ok(Some(song)) = inner.store.get_song(song_id).await {
                emit_status(inner, &song, SongStatus::Cancelled);
            }
        }
        Err(error) => {
            warn!(song.id = %song_id, error = %error, "failed to record cancellation");
        }
    }
}

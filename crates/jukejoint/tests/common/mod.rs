//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use async_trait::async_trait;
use jukejoint::endpoints::ModelEndpoints;
use jukejoint::room::DeviceSink;
use jukejoint::scheduler::EndpointKind;
use jukejoint::store::{SqliteStore, Store};
use jukeproto::{Playlist, PlaylistId, PlaylistStatus, ServerMessage, SongId, SongStatus};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Device sink that records every decoded frame.
pub struct FakeSink {
    pub frames: Mutex<Vec<ServerMessage>>,
    pub open: AtomicBool,
}

impl FakeSink {
    pub fn new() -> Self {
        Self {
            frames: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
        }
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Relaxed);
    }

    pub fn frames(&self) -> Vec<ServerMessage> {
        self.frames.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.frames.lock().unwrap().clear();
    }

    pub fn count_states(&self) -> usize {
        self.frames()
            .iter()
            .filter(|f| matches!(f, ServerMessage::State { .. }))
            .count()
    }

    pub fn executes(&self) -> Vec<ServerMessage> {
        self.frames()
            .into_iter()
            .filter(|f| matches!(f, ServerMessage::Execute { .. }))
            .collect()
    }
}

impl DeviceSink for FakeSink {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    fn send(&self, text: String) -> bool {
        if !self.is_open() {
            return false;
        }
        let frame: ServerMessage = serde_json::from_str(&text).expect("valid server frame");
        self.frames.lock().unwrap().push(frame);
        true
    }
}

/// Scripted model endpoints.
///
/// The audio status probe answers "running" `running_probes` times, then
/// `final_status`. The audio URL points at a closed local port so the save
/// step exercises its endpoint-URL fallback without real network.
pub struct MockEndpoints {
    pub llm_calls: AtomicU64,
    pub audio_submits: AtomicU64,
    pub status_probes: AtomicU64,
    pub image_calls: AtomicU64,
    pub running_probes: u64,
    pub final_status: &'static str,
    pub fail_llm: bool,
}

impl MockEndpoints {
    pub fn happy() -> Self {
        Self {
            llm_calls: AtomicU64::new(0),
            audio_submits: AtomicU64::new(0),
            status_probes: AtomicU64::new(0),
            image_calls: AtomicU64::new(0),
            running_probes: 1,
            final_status: "succeeded",
            fail_llm: false,
        }
    }

    pub fn never_finishes() -> Self {
        Self {
            running_probes: u64::MAX,
            ..Self::happy()
        }
    }

    pub fn failing_audio() -> Self {
        Self {
            final_status: "failed",
            ..Self::happy()
        }
    }

    pub fn failing_llm() -> Self {
        Self {
            fail_llm: true,
            ..Self::happy()
        }
    }
}

#[async_trait]
impl ModelEndpoints for MockEndpoints {
    async fn run(
        &self,
        endpoint: EndpointKind,
        request: Value,
        _token: CancellationToken,
    ) -> anyhow::Result<Value> {
        match endpoint {
            EndpointKind::Llm => {
                self.llm_calls.fetch_add(1, Ordering::SeqCst);
                if self.fail_llm {
                    anyhow::bail!("llm endpoint unavailable");
                }
                Ok(json!({ "title": "Neon Nights", "style": "synthwave" }))
            }
            EndpointKind::Image => {
                self.image_calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({ "image_url": "http://127.0.0.1:1/cover.png" }))
            }
            EndpointKind::Audio => match request["op"].as_str() {
                Some("submit") => {
                    self.audio_submits.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({ "task_id": "task-1" }))
                }
                Some("status") => {
                    let probe = self.status_probes.fetch_add(1, Ordering::SeqCst);
                    if probe < self.running_probes {
                        Ok(json!({ "status": "running" }))
                    } else {
                        match self.final_status {
                            "succeeded" => Ok(json!({
                                "status": "succeeded",
                                "audio_url": "http://127.0.0.1:1/render.mp3",
                                "duration": 183.5,
                            })),
                            _ => Ok(json!({
                                "status": "failed",
                                "error": "render exploded",
                            })),
                        }
                    }
                }
                other => anyhow::bail!("unexpected audio op: {other:?}"),
            },
        }
    }
}

pub fn playlist(id: &str, key: &str, owner: &str) -> Playlist {
    Playlist {
        id: PlaylistId::new(id),
        playlist_key: key.to_string(),
        name: format!("Playlist {id}"),
        prompt: "late-night synthwave with heavy bass".to_string(),
        prompt_epoch: 0,
        current_order_index: 0.0,
        status: PlaylistStatus::Active,
        owner_user_id: owner.to_string(),
        is_temporary: false,
    }
}

/// Poll the store until the song reaches `status` or the deadline hits.
pub async fn wait_for_song_status(store: &SqliteStore, song_id: &SongId, status: SongStatus) {
    for _ in 0..400 {
        let current = store.get_song(song_id).await.unwrap().unwrap().status;
        if current == status {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let current = store.get_song(song_id).await.unwrap().unwrap().status;
    panic!("timed out waiting for song {song_id} to reach {status}, still {current}");
}

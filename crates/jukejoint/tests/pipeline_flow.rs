//! Generation pipeline end-to-end against a real (in-memory) store and
//! scripted model endpoints.

mod common;

use common::{playlist, wait_for_song_status, MockEndpoints};
use jukejoint::bus::EventBus;
use jukejoint::media::MediaStore;
use jukejoint::pipeline::GenerationPipeline;
use jukejoint::scheduler::Schedulers;
use jukejoint::store::{NewSongOptions, SqliteStore, Store};
use jukeproto::{Event, EventKind, PlaylistId, Song, SongStatus};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

struct Fixture {
    pipeline: GenerationPipeline,
    store: Arc<SqliteStore>,
    bus: EventBus,
    endpoints: Arc<MockEndpoints>,
    _media_dir: tempfile::TempDir,
}

fn fixture(endpoints: MockEndpoints, poll_max_attempts: u32) -> Fixture {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let bus = EventBus::new(200, false);
    let media_dir = tempfile::tempdir().unwrap();
    let media = Arc::new(MediaStore::new(media_dir.path()).unwrap());
    let models = jukeconf::ModelsConfig::default();
    let schedulers = Schedulers::new(&models, CancellationToken::new());
    let endpoints = Arc::new(endpoints);
    let pipeline_config = jukeconf::PipelineConfig {
        poll_interval_ms: 10,
        poll_max_attempts,
    };

    let pipeline = GenerationPipeline::new(
        store.clone(),
        endpoints.clone(),
        schedulers,
        media,
        bus.clone(),
        &pipeline_config,
        CancellationToken::new(),
    );

    Fixture {
        pipeline,
        store,
        bus,
        endpoints,
        _media_dir: media_dir,
    }
}

async fn seed_song(store: &Arc<SqliteStore>) -> Song {
    store.insert_playlist(&playlist("pl-1", "room-1", "user-1")).unwrap();
    store
        .create_pending_song(&PlaylistId::new("pl-1"), 1.0, NewSongOptions::default())
        .await
        .unwrap()
}


#[tokio::test]
async fn test_happy_path_reaches_ready() {
    let fx = fixture(MockEndpoints::happy(), 120);
    let song = seed_song(&fx.store).await;

    // Watch the bus while the pipeline runs.
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let _sub = fx.bus.subscribe(
        "test-observer",
        &[EventKind::SongStatusChanged, EventKind::SongMetadataUpdated],
        move |event| {
            let seen = seen_clone.clone();
            async move {
                seen.lock().unwrap().push(event);
                Ok(())
            }
        },
    );

    fx.pipeline.resume(song.id.clone());
    wait_for_song_status(&fx.store, &song.id, SongStatus::Ready).await;

    let row = fx.store.get_song(&song.id).await.unwrap().unwrap();
    assert_eq!(row.title.as_deref(), Some("Neon Nights"));
    assert_eq!(row.style.as_deref(), Some("synthwave"));
    assert_eq!(row.ace_task_id.as_deref(), Some("task-1"));
    // The save step cannot reach the fake endpoint host, so the endpoint
    // URL survives as the fallback.
    assert_eq!(row.audio_url.as_deref(), Some("http://127.0.0.1:1/render.mp3"));
    assert_eq!(row.audio_duration, Some(183.5));

    assert_eq!(fx.endpoints.llm_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(fx.endpoints.audio_submits.load(std::sync::atomic::Ordering::SeqCst), 1);

    // Metadata event then a ready status event, in that order.
    let seen = seen.lock().unwrap();
    let metadata_pos = seen
        .iter()
        .position(|e| matches!(e, Event::SongMetadataUpdated { .. }))
        .expect("metadata event");
    let ready_pos = seen
        .iter()
        .position(|e| {
            matches!(
                e,
                Event::SongStatusChanged {
                    status: SongStatus::Ready,
                    ..
                }
            )
        })
        .expect("ready event");
    assert!(metadata_pos < ready_pos);
}

#[tokio::test]
async fn test_llm_failure_marks_error() {
    let fx = fixture(MockEndpoints::failing_llm(), 120);
    let song = seed_song(&fx.store).await;

    fx.pipeline.resume(song.id.clone());
    wait_for_song_status(&fx.store, &song.id, SongStatus::Error).await;

    let row = fx.store.get_song(&song.id).await.unwrap().unwrap();
    assert!(row.error_message.unwrap().contains("llm endpoint unavailable"));
}

#[tokio::test]
async fn test_audio_failure_marks_error() {
    let fx = fixture(MockEndpoints::failing_audio(), 120);
    let song = seed_song(&fx.store).await;

    fx.pipeline.resume(song.id.clone());
    wait_for_song_status(&fx.store, &song.id, SongStatus::Error).await;

    let row = fx.store.get_song(&song.id).await.unwrap().unwrap();
    assert!(row.error_message.unwrap().contains("render exploded"));
}

#[tokio::test]
async fn test_poll_timeout_marks_error() {
    let fx = fixture(MockEndpoints::never_finishes(), 3);
    let song = seed_song(&fx.store).await;

    fx.pipeline.resume(song.id.clone());
    wait_for_song_status(&fx.store, &song.id, SongStatus::Error).await;

    let row = fx.store.get_song(&song.id).await.unwrap().unwrap();
    assert!(row.error_message.unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_steering_cancels_stale_epoch_song() {
    let fx = fixture(MockEndpoints::never_finishes(), 1000);
    let _subs = fx.pipeline.attach();
    let song = seed_song(&fx.store).await;

    fx.pipeline.resume(song.id.clone());
    wait_for_song_status(&fx.store, &song.id, SongStatus::GeneratingAudio).await;

    // Steering bumps the playlist epoch past the song's.
    fx.bus.emit(Event::PlaylistSteered {
        playlist_id: PlaylistId::new("pl-1"),
        prompt_epoch: 1,
    });

    wait_for_song_status(&fx.store, &song.id, SongStatus::Cancelled).await;
}

#[tokio::test]
async fn test_duplicate_resume_is_noop() {
    let fx = fixture(MockEndpoints::happy(), 120);
    let song = seed_song(&fx.store).await;

    fx.pipeline.resume(song.id.clone());
    fx.pipeline.resume(song.id.clone());
    fx.pipeline.resume(song.id.clone());

    wait_for_song_status(&fx.store, &song.id, SongStatus::Ready).await;

    assert_eq!(fx.endpoints.llm_calls.load(std::sync::atomic::Ordering::SeqCst), 1);

    // Resuming a finished song does nothing either.
    fx.pipeline.resume(song.id.clone());
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(fx.endpoints.llm_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_song_created_event_drives_pipeline() {
    let fx = fixture(MockEndpoints::happy(), 120);
    let _subs = fx.pipeline.attach();

    fx.store.insert_playlist(&playlist("pl-1", "room-1", "user-1")).unwrap();
    let song = fx
        .store
        .create_pending_song(&PlaylistId::new("pl-1"), 1.0, NewSongOptions::default())
        .await
        .unwrap();
    fx.bus.emit(Event::SongCreated {
        song_id: song.id.clone(),
        playlist_id: PlaylistId::new("pl-1"),
    });

    wait_for_song_status(&fx.store, &song.id, SongStatus::Ready).await;
}

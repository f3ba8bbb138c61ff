//! Local media storage for finished artifacts.
//!
//! The pipeline's save step is best-effort: a song whose download fails
//! keeps its endpoint URL and still becomes ready.

use anyhow::{Context, Result};
use jukeproto::SongId;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub struct MediaStore {
    dir: PathBuf,
    client: reqwest::Client,
}

impl MediaStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create media dir {}", dir.display()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .expect("reqwest client construction is infallible with static options");
        Ok(Self { dir, client })
    }

    /// Download the finished audio for `song_id` and return its local URL
    /// path (`/media/<file>`).
    pub async fn save_audio(&self, song_id: &SongId, source_url: &str) -> Result<String> {
        let file_name = format!("{}.mp3", song_id.as_str());
        let local = self.save(&file_name, source_url).await?;
        debug!(song.id = %song_id, path = %local.display(), "audio saved");
        Ok(format!("/media/{file_name}"))
    }

    /// Download a cover image for `song_id`; returns the local URL path.
    pub async fn save_cover(&self, song_id: &SongId, source_url: &str) -> Result<String> {
        let file_name = format!("{}-cover.png", song_id.as_str());
        self.save(&file_name, source_url).await?;
        Ok(format!("/media/{file_name}"))
    }

    async fn save(&self, file_name: &str, source_url: &str) -> Result<PathBuf> {
        let response = self
            .client
            .get(source_url)
            .send()
            .await
            .with_context(|| format!("fetching {source_url}"))?
            .error_for_status()?;
        let bytes = response.bytes().await?;

        let path = self.dir.join(file_name);
        tokio::fs::write(&path, &bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    /// Resolve a requested media file name to a path inside the media dir.
    /// Rejects anything that could escape it.
    pub fn resolve(&self, file_name: &str) -> Option<PathBuf> {
        if file_name.is_empty()
            || file_name.contains('/')
            || file_name.contains('\\')
            || file_name.contains("..")
        {
            return None;
        }
        let path = self.dir.join(file_name);
        path.is_file().then_some(path)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

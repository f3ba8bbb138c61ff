//! Model endpoint clients.
//!
//! The three external endpoints (text LLM, cover image, audio) are
//! abstracted behind one capability: post a JSON request, get a JSON
//! response. The core never interprets responses beyond the handful of
//! fields the pipeline names (task id, audio path, status, error string).

use crate::scheduler::EndpointKind;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[async_trait]
pub trait ModelEndpoints: Send + Sync {
    /// Run one request against the given endpoint. Must observe `token`
    /// while waiting on the network.
    async fn run(
        &self,
        endpoint: EndpointKind,
        request: Value,
        token: CancellationToken,
    ) -> anyhow::Result<Value>;
}

/// HTTP-backed endpoints; each base URL exposes `POST /run`.
pub struct HttpEndpoints {
    client: reqwest::Client,
    llm_base: String,
    image_base: String,
    audio_base: String,
}

impl HttpEndpoints {
    pub fn new(models: &jukeconf::ModelsConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("reqwest client construction is infallible with static options");
        Self {
            client,
            llm_base: models.llm.trim_end_matches('/').to_string(),
            image_base: models.image.trim_end_matches('/').to_string(),
            audio_base: models.audio.trim_end_matches('/').to_string(),
        }
    }

    fn base(&self, endpoint: EndpointKind) -> &str {
        match endpoint {
            EndpointKind::Llm => &self.llm_base,
            EndpointKind::Image => &self.image_base,
            EndpointKind::Audio => &self.audio_base,
        }
    }
}

#[async_trait]
impl ModelEndpoints for HttpEndpoints {
    async fn run(
        &self,
        endpoint: EndpointKind,
        request: Value,
        token: CancellationToken,
    ) -> anyhow::Result<Value> {
        let url = format!("{}/run", self.base(endpoint));
        debug!(endpoint = %endpoint, url = %url, "model request");

        let send = self.client.post(&url).json(&request).send();
        let response = tokio::select! {
            response = send => response?,
            _ = token.cancelled() => anyhow::bail!("cancelled while contacting {endpoint}"),
        };

        let response = response.error_for_status()?;
        let body = tokio::select! {
            body = response.json::<Value>() => body?,
            _ = token.cancelled() => anyhow::bail!("cancelled while reading {endpoint} response"),
        };
        Ok(body)
    }
}

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::header::ACCEPT;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use crate::account::Balance;
use crate::config::ClientConfig;
use crate::error::{GenerationError, Result};
use crate::events::StreamEvent;
use crate::logging::loggable_body;
use crate::models::{
    GenerateMoreRequest, GenerateMoreResponse, GenerationMode, GenerationPayload, PollStatus,
    StartGenerationResponse, StatusResponse,
};
use crate::sse::{SseDecoder, SseFrame};

pub type EventStream = BoxStream<'static, Result<StreamEvent>>;

/// The remote generation service as seen by the session core.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn start_generation(
        &self,
        mode: GenerationMode,
        payload: &GenerationPayload,
    ) -> Result<StartGenerationResponse>;

    /// Long-lived push channel for one request id.
    async fn open_event_stream(&self, request_id: &str) -> Result<EventStream>;

    async fn generation_status(&self, request_id: &str, mode: GenerationMode) -> Result<StatusResponse>;

    async fn generate_more(&self, request: &GenerateMoreRequest) -> Result<GenerateMoreResponse>;

    async fn fetch_balance(&self) -> Result<Balance>;
}

pub struct HttpBackend {
    client: Client,
    stream_client: Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpBackend {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = Client::builder().build()?;
        // no overall timeout: the stream stays open for the whole generation
        let stream_client = Client::builder().build()?;
        Ok(Self {
            client,
            stream_client,
            base_url: config.api_base.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn read_json<T: DeserializeOwned>(&self, what: &str, response: Response) -> Result<T> {
        let status = response.status();
        let body = response.text().await?;
        debug!(what, %status, body = %loggable_body(&body), "📥 response");
        if !status.is_success() {
            error!(what, %status, "❌ request failed");
            return Err(server_error(status, &body));
        }
        serde_json::from_str(&body)
            .map_err(|e| GenerationError::Decode(format!("{what}: {e}")))
    }
}

fn server_error(status: StatusCode, body: &str) -> GenerationError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("error"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_default();
    GenerationError::Server {
        status: Some(status.as_u16()),
        message,
    }
}

fn decode_frame(frame: SseFrame) -> Option<Result<StreamEvent>> {
    match StreamEvent::from_frame(&frame) {
        Ok(Some(event)) => Some(Ok(event)),
        Ok(None) => {
            debug!(event = %frame.event, "ignoring stream frame");
            None
        }
        Err(e) => {
            warn!(event = %frame.event, error = %e, "skipping malformed stream frame");
            None
        }
    }
}

/// Turns a `text/event-stream` response body into typed events.
pub fn event_stream_from_response(response: Response) -> EventStream {
    let bytes = response.bytes_stream().boxed();
    let state = (bytes, SseDecoder::new(), VecDeque::new(), false);
    stream::unfold(state, |(mut bytes, mut decoder, mut pending, mut done)| async move {
        loop {
            if let Some(item) = pending.pop_front() {
                return Some((item, (bytes, decoder, pending, done)));
            }
            if done {
                return None;
            }
            match bytes.next().await {
                Some(Ok(chunk)) => {
                    pending.extend(decoder.push(&chunk).into_iter().filter_map(decode_frame));
                }
                Some(Err(e)) => {
                    pending.push_back(Err(GenerationError::Transport(format!(
                        "stream read failed: {e}"
                    ))));
                    done = true;
                }
                None => {
                    pending.extend(decoder.finish().and_then(decode_frame));
                    done = true;
                }
            }
        }
    })
    .boxed()
}

#[async_trait]
impl GenerationBackend for HttpBackend {
    async fn start_generation(
        &self,
        mode: GenerationMode,
        payload: &GenerationPayload,
    ) -> Result<StartGenerationResponse> {
        let url = self.url(&format!("/api/generate/{mode}"));
        info!(%mode, "🔗 starting generation via {}", url);
        let response = self
            .authorize(self.client.post(&url).json(payload))
            .send()
            .await?;
        let started: StartGenerationResponse = self.read_json("start-generation", response).await?;
        if started.request_id.trim().is_empty() {
            return Err(GenerationError::Decode("start-generation returned no request id".into()));
        }
        info!(request_id = %started.request_id, services = started.enabled_services.len(), "✅ generation accepted");
        Ok(started)
    }

    async fn open_event_stream(&self, request_id: &str) -> Result<EventStream> {
        let url = self.url(&format!("/api/generate/stream/{request_id}"));
        info!(request_id, "📡 opening event stream");
        let response = self
            .authorize(self.stream_client.get(&url).header(ACCEPT, "text/event-stream"))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(request_id, %status, "❌ event stream refused");
            return Err(server_error(status, &body));
        }
        Ok(event_stream_from_response(response))
    }

    async fn generation_status(&self, request_id: &str, mode: GenerationMode) -> Result<StatusResponse> {
        let url = self.url(&format!("/api/generate/status/{request_id}"));
        let response = self
            .authorize(self.client.get(&url).query(&[("mode", mode.as_str())]))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(StatusResponse {
                status: PollStatus::NotFound,
                data: None,
            });
        }
        self.read_json("status", response).await
    }

    async fn generate_more(&self, request: &GenerateMoreRequest) -> Result<GenerateMoreResponse> {
        let url = self.url("/api/generate-more");
        info!(request_id = %request.request_id, service = %request.service_id, "🔗 generating more icons");
        let response = self
            .authorize(self.client.post(&url).json(request))
            .send()
            .await?;
        self.read_json("generate-more", response).await
    }

    async fn fetch_balance(&self) -> Result<Balance> {
        let response = self
            .authorize(self.client.get(self.url("/api/account/balance")))
            .send()
            .await?;
        self.read_json("balance", response).await
    }
}

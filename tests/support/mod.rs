#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use iconflow::account::Balance;
use iconflow::backend::{EventStream, GenerationBackend};
use iconflow::config::ClientConfig;
use iconflow::error::{GenerationError, Result};
use iconflow::events::{GenerationFailure, ServiceUpdate, StreamEvent};
use iconflow::models::{
    GenerateMoreRequest, GenerateMoreResponse, GenerationMode, GenerationPayload,
    GenerationRequestDescriptor, GenerationResponse, Icon, PollStatus, ServiceStatus,
    StartGenerationResponse, StatusResponse,
};
use iconflow::store::{Clock, MemorySessionStore, SessionStore, StoredDescriptor};
use iconflow::{ServiceRegistry, SessionController};

type StreamSender = mpsc::UnboundedSender<Result<StreamEvent>>;

/// Backend double. Streams are fed by the test through [`FakeBackend::push`];
/// status polls and generate-more answers are queued up front.
#[derive(Default)]
pub struct FakeBackend {
    enabled: Mutex<BTreeMap<String, bool>>,
    started: Mutex<u32>,
    streams: Mutex<Vec<Option<StreamSender>>>,
    statuses: Mutex<VecDeque<std::result::Result<StatusResponse, String>>>,
    more: Mutex<VecDeque<GenerateMoreResponse>>,
    balance: Mutex<Balance>,
    calls: Mutex<Vec<String>>,
    fail_stream_open: Mutex<bool>,
}

impl FakeBackend {
    pub fn new(services: &[&str]) -> Arc<Self> {
        let backend = Self::default();
        *backend.enabled.lock() = services.iter().map(|s| (s.to_string(), true)).collect();
        Arc::new(backend)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.as_str() == call).count()
    }

    pub fn streams_opened(&self) -> usize {
        self.streams.lock().len()
    }

    /// Sends into the most recently opened stream.
    pub fn push(&self, event: StreamEvent) {
        self.push_to(self.streams_opened() - 1, event);
    }

    pub fn push_to(&self, stream: usize, event: StreamEvent) {
        if let Some(Some(tx)) = self.streams.lock().get(stream) {
            let _ = tx.send(Ok(event));
        }
    }

    /// Fails the latest stream with a transport error and closes it.
    pub fn break_stream(&self) {
        let mut streams = self.streams.lock();
        if let Some(slot) = streams.last_mut() {
            if let Some(tx) = slot.take() {
                let _ = tx.send(Err(GenerationError::Transport("connection reset".into())));
            }
        }
    }

    /// Closes the latest stream cleanly without a terminal event.
    pub fn end_stream(&self) {
        if let Some(slot) = self.streams.lock().last_mut() {
            slot.take();
        }
    }

    pub fn refuse_streams(&self) {
        *self.fail_stream_open.lock() = true;
    }

    pub fn queue_status(&self, status: PollStatus, data: Option<GenerationResponse>) {
        self.statuses
            .lock()
            .push_back(Ok(StatusResponse { status, data }));
    }

    pub fn queue_status_failure(&self, reason: &str) {
        self.statuses.lock().push_back(Err(reason.to_string()));
    }

    pub fn queue_more(&self, response: GenerateMoreResponse) {
        self.more.lock().push_back(response);
    }

    pub fn set_balance(&self, balance: Balance) {
        *self.balance.lock() = balance;
    }

    fn record(&self, call: &str) {
        self.calls.lock().push(call.to_string());
    }
}

#[async_trait]
impl GenerationBackend for FakeBackend {
    async fn start_generation(
        &self,
        _mode: GenerationMode,
        _payload: &GenerationPayload,
    ) -> Result<StartGenerationResponse> {
        self.record("start");
        let mut started = self.started.lock();
        *started += 1;
        Ok(StartGenerationResponse {
            request_id: format!("req-{}", *started),
            enabled_services: self.enabled.lock().clone(),
        })
    }

    async fn open_event_stream(&self, _request_id: &str) -> Result<EventStream> {
        self.record("stream");
        if *self.fail_stream_open.lock() {
            return Err(GenerationError::Transport("connection refused".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().push(Some(tx));
        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn generation_status(&self, _request_id: &str, _mode: GenerationMode) -> Result<StatusResponse> {
        self.record("status");
        match self.statuses.lock().pop_front() {
            Some(Ok(status)) => Ok(status),
            Some(Err(reason)) => Err(GenerationError::Transport(reason)),
            None => Ok(StatusResponse {
                status: PollStatus::NotFound,
                data: None,
            }),
        }
    }

    async fn generate_more(&self, _request: &GenerateMoreRequest) -> Result<GenerateMoreResponse> {
        self.record("more");
        self.more
            .lock()
            .pop_front()
            .ok_or_else(|| GenerationError::server("nothing queued"))
    }

    async fn fetch_balance(&self) -> Result<Balance> {
        self.record("balance");
        Ok(*self.balance.lock())
    }
}

pub struct FixedClock(Mutex<DateTime<Utc>>);

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self(Mutex::new(now)))
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.0.lock();
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock()
    }
}

pub fn test_config() -> ClientConfig {
    ClientConfig {
        balance_refresh_delay: Duration::from_millis(50),
        progress_tick: Duration::from_millis(100),
        reveal_interval: Duration::from_millis(10),
        ..ClientConfig::default()
    }
}

pub struct Harness {
    pub backend: Arc<FakeBackend>,
    pub store: Arc<MemorySessionStore>,
    pub clock: Arc<FixedClock>,
    pub controller: SessionController,
}

pub fn harness(services: &[&str]) -> Harness {
    harness_with(services, test_config())
}

pub fn harness_with(services: &[&str], config: ClientConfig) -> Harness {
    let backend = FakeBackend::new(services);
    let store = Arc::new(MemorySessionStore::new());
    let clock = FixedClock::new(Utc::now());
    let controller = SessionController::with_parts(
        backend.clone(),
        store.clone(),
        clock.clone(),
        ServiceRegistry::default(),
        config,
    )
    .unwrap();
    controller.balance().set(Balance {
        coins: 10,
        trial_credits: 0,
    });
    Harness {
        backend,
        store,
        clock,
        controller,
    }
}

pub fn text_payload(description: &str) -> GenerationPayload {
    GenerationPayload {
        general_description: description.into(),
        ..Default::default()
    }
}

pub fn descriptor(request_id: &str, created_at: DateTime<Utc>) -> GenerationRequestDescriptor {
    GenerationRequestDescriptor {
        request_id: request_id.into(),
        mode: GenerationMode::Icons,
        payload: text_payload("cat logos"),
        created_at,
    }
}

pub fn persist(store: &dyn SessionStore, request_id: &str, written_at: DateTime<Utc>) {
    store
        .save(&StoredDescriptor::new(descriptor(request_id, written_at), written_at))
        .unwrap();
}

pub fn icons(source: &str, count: usize) -> Vec<Icon> {
    (0..count)
        .map(|n| Icon {
            id: Some(format!("{source}-{n}")),
            base64_data: format!("iVBORw0KGgo{n}"),
            service_source: Some(source.into()),
            ..Default::default()
        })
        .collect()
}

pub fn started(key: &str) -> StreamEvent {
    StreamEvent::ServiceUpdate(ServiceUpdate {
        key: key.parse().unwrap(),
        status: ServiceStatus::Started,
        message: Some("Generating...".into()),
        generation_time_ms: None,
        icons: None,
        original_grid_image_base64: None,
        seed: None,
    })
}

pub fn success(key: &str, source: &str, count: usize) -> StreamEvent {
    StreamEvent::ServiceUpdate(ServiceUpdate {
        key: key.parse().unwrap(),
        status: ServiceStatus::Success,
        message: Some("Done".into()),
        generation_time_ms: Some(12_000),
        icons: Some(icons(source, count)),
        original_grid_image_base64: Some("R1JJRA==".into()),
        seed: Some("42".into()),
    })
}

pub fn complete(request_id: &str, icons: Vec<Icon>, trial_mode: bool) -> StreamEvent {
    StreamEvent::GenerationComplete(GenerationResponse {
        icons,
        request_id: request_id.into(),
        trial_mode,
        ..Default::default()
    })
}

pub fn failure(message: &str) -> StreamEvent {
    StreamEvent::GenerationError(GenerationFailure {
        message: Some(message.into()),
    })
}

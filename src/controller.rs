//! Generation Session Controller: owns one generation from submission through
//! streamed updates to results, and recovers it after the stream drops.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::account::{Balance, BalanceCell};
use crate::aggregator::ResultLedger;
use crate::animation::{RevealSequencer, RevealView};
use crate::backend::{EventStream, GenerationBackend};
use crate::config::ClientConfig;
use crate::error::{GenerationError, Result};
use crate::events::StreamEvent;
use crate::models::{
    GenerateMoreRequest, GenerateMoreStatus, GenerationMode, GenerationPayload,
    GenerationRequestDescriptor,
};
use crate::progress::{estimated_duration, ProgressTicker};
use crate::recovery::{RecoveryOrchestrator, RecoveryOutcome, RecoveryTrigger};
use crate::services::{ServiceKey, ServiceRegistry};
use crate::session::{Effect, Resolution, SessionPhase, SessionState};
use crate::store::{Clock, SessionStore, StoredDescriptor, SystemClock};
use crate::validation::validate_submission;

#[derive(Debug)]
enum StreamMessage {
    Event(StreamEvent),
    Failed(String),
    Closed,
}

#[derive(Debug)]
struct Envelope {
    epoch: u64,
    message: StreamMessage,
}

struct LiveStream {
    epoch: u64,
    task: JoinHandle<()>,
}

/// What a call to [`SessionController::next_update`] changed.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    ServiceUpdated(ServiceKey),
    Completed,
    Failed(String),
    /// The stream dropped but polling found the generation finished.
    Recovered,
    /// The stream dropped while the server was still working; re-subscribed.
    Reattached,
    /// Message arrived for a session that had already settled.
    Ignored,
}

pub struct SessionController {
    backend: Arc<dyn GenerationBackend>,
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    registry: ServiceRegistry,
    config: ClientConfig,
    recovery: RecoveryOrchestrator,
    balance: BalanceCell,
    state: SessionState,
    progress: ProgressTicker,
    reveal: RevealSequencer,
    tx: mpsc::UnboundedSender<Envelope>,
    rx: mpsc::UnboundedReceiver<Envelope>,
    stream: Option<LiveStream>,
    next_epoch: u64,
    reattach_attempts: u32,
    balance_refresh: Option<JoinHandle<()>>,
}

impl SessionController {
    pub fn new(
        backend: Arc<dyn GenerationBackend>,
        store: Arc<dyn SessionStore>,
        config: ClientConfig,
    ) -> Result<Self> {
        Self::with_parts(
            backend,
            store,
            Arc::new(SystemClock),
            ServiceRegistry::default(),
            config,
        )
    }

    pub fn with_parts(
        backend: Arc<dyn GenerationBackend>,
        store: Arc<dyn SessionStore>,
        clock: Arc<dyn Clock>,
        registry: ServiceRegistry,
        config: ClientConfig,
    ) -> Result<Self> {
        registry.validate()?;
        debug!(services = ?registry.canonical_ids().collect::<Vec<_>>(), "service registry ready");
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            recovery: RecoveryOrchestrator::new(store.clone(), clock.clone(), config.stale_after),
            progress: ProgressTicker::new(config.progress_tick),
            reveal: RevealSequencer::new(config.reveal_interval),
            backend,
            store,
            clock,
            registry,
            config,
            balance: BalanceCell::default(),
            state: SessionState::new(),
            tx,
            rx,
            stream: None,
            next_epoch: 0,
            reattach_attempts: 0,
            balance_refresh: None,
        })
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn progress(&self) -> watch::Receiver<f64> {
        self.progress.subscribe()
    }

    pub fn progress_value(&self) -> f64 {
        self.progress.value()
    }

    pub fn reveal_view(&self) -> RevealView {
        self.reveal.view()
    }

    pub fn balance(&self) -> BalanceCell {
        self.balance.clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.is_some()
    }

    pub async fn refresh_balance(&self) -> Result<Balance> {
        let balance = self.backend.fetch_balance().await?;
        self.balance.set(balance);
        Ok(balance)
    }

    /// Validates locally, then starts a new generation. Any session in flight
    /// is abandoned without server-side cancellation.
    pub async fn submit(&mut self, mode: GenerationMode, payload: GenerationPayload) -> Result<()> {
        self.teardown();
        self.reveal.clear();

        if let Err(e) = validate_submission(mode, &payload, &self.balance.get()) {
            info!(%mode, error = %e, "submission rejected");
            self.state.reset_for_submission(mode, payload);
            self.state.fail(&e);
            self.progress.reset();
            return Err(e);
        }

        self.state.reset_for_submission(mode, payload.clone());
        self.progress.reset();

        let started = match self.backend.start_generation(mode, &payload).await {
            Ok(started) => started,
            Err(e) => {
                warn!(%mode, error = %e, "start-generation failed");
                self.state.fail(&e);
                return Err(e);
            }
        };
        let request_id = started.request_id.clone();

        let descriptor = GenerationRequestDescriptor {
            request_id: request_id.clone(),
            mode,
            payload: payload.clone(),
            created_at: self.clock.now(),
        };
        if let Err(e) = self
            .store
            .save(&StoredDescriptor::new(descriptor, self.clock.now()))
        {
            warn!(request_id = %request_id, error = %e, "could not persist pending generation");
        }

        let ledger = ResultLedger::seeded(&started.enabled_services, payload.generate_variations);
        info!(request_id = %request_id, %mode, keys = ledger.keys().count(), "🚀 generation started");
        self.state.begin_streaming(request_id.clone(), ledger);
        self.reattach_attempts = 0;
        self.progress.start(estimated_duration(mode, &payload));

        if let Err(e) = self.open_stream(&request_id).await {
            warn!(request_id = %request_id, error = %e, "could not open event stream");
            self.handle_stream_lost(e.to_string()).await;
        }
        Ok(())
    }

    async fn open_stream(&mut self, request_id: &str) -> Result<()> {
        self.close_stream();
        let events = self.backend.open_event_stream(request_id).await?;
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        let task = tokio::spawn(forward_events(events, epoch, self.tx.clone()));
        self.stream = Some(LiveStream { epoch, task });
        debug!(request_id, epoch, "event stream attached");
        Ok(())
    }

    /// Drops the connection. Anything it already queued is discarded on receipt.
    fn close_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.task.abort();
            debug!(epoch = stream.epoch, "event stream closed");
        }
    }

    /// Closes the stream and halts the progress timer.
    pub fn teardown(&mut self) {
        self.close_stream();
        self.progress.stop();
    }

    /// Waits for the next stream message and applies it. `None` once no stream
    /// is attached and nothing is queued.
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        loop {
            let envelope = if self.stream.is_some() {
                self.rx.recv().await?
            } else {
                self.rx.try_recv().ok()?
            };
            let live = self.stream.as_ref().map(|s| s.epoch);
            if live != Some(envelope.epoch) {
                debug!(epoch = envelope.epoch, "dropping message from closed stream");
                continue;
            }

            return Some(match envelope.message {
                StreamMessage::Event(event) => self.handle_stream_event(event),
                StreamMessage::Failed(reason) => {
                    self.stream = None;
                    self.handle_stream_lost(reason).await
                }
                StreamMessage::Closed => {
                    self.stream = None;
                    self.handle_stream_lost("stream ended before a terminal event".into())
                        .await
                }
            });
        }
    }

    /// Pumps updates until the stream is gone; returns the settled phase.
    pub async fn run_until_settled(&mut self) -> SessionPhase {
        while self.next_update().await.is_some() {}
        self.state.phase()
    }

    pub fn handle_stream_event(&mut self, event: StreamEvent) -> SessionUpdate {
        let key = match &event {
            StreamEvent::ServiceUpdate(update) => Some(update.key.clone()),
            _ => None,
        };
        let before = self.state.phase();
        let effects = self.state.apply_event(event, &self.registry);
        let after = self.state.phase();
        self.run_effects(effects);

        match (before, after) {
            (SessionPhase::Streaming, SessionPhase::Results) => SessionUpdate::Completed,
            (SessionPhase::Streaming, SessionPhase::Error) => {
                SessionUpdate::Failed(self.state.error().unwrap_or_default().to_string())
            }
            (SessionPhase::Streaming, SessionPhase::Streaming) => match key {
                Some(key) => SessionUpdate::ServiceUpdated(key),
                None => SessionUpdate::Ignored,
            },
            _ => SessionUpdate::Ignored,
        }
    }

    /// Silent recovery first; the user only sees an error if that fails too.
    async fn handle_stream_lost(&mut self, reason: String) -> SessionUpdate {
        if self.state.phase() != SessionPhase::Streaming
            || self.state.resolution() != Resolution::Pending
        {
            debug!(%reason, "stream loss after settlement ignored");
            return SessionUpdate::Ignored;
        }
        warn!(request_id = ?self.state.request_id(), %reason, "event stream lost, polling status");

        let outcome = match self.recovery.check(&*self.backend, RecoveryTrigger::StreamLost).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "recovery check failed");
                return self.surface_connection_lost();
            }
        };
        if !outcome.resolves_stream_loss() {
            debug!(?outcome, "status poll did not resolve the lost stream");
            return self.surface_connection_lost();
        }
        match outcome {
            RecoveryOutcome::Completed {
                descriptor,
                response,
            } => {
                let effects = self.state.apply_recovered(&descriptor, &response, &self.registry);
                self.run_effects(effects);
                SessionUpdate::Recovered
            }
            RecoveryOutcome::InProgress { descriptor } => {
                if self.reattach_attempts >= self.config.max_stream_reattach {
                    warn!(request_id = %descriptor.request_id, "re-attach budget exhausted");
                    return self.surface_connection_lost();
                }
                self.reattach_attempts += 1;
                match self.open_stream(&descriptor.request_id).await {
                    Ok(()) => {
                        info!(request_id = %descriptor.request_id, attempt = self.reattach_attempts, "re-attached to event stream");
                        SessionUpdate::Reattached
                    }
                    Err(e) => {
                        warn!(error = %e, "re-attach failed");
                        self.surface_connection_lost()
                    }
                }
            }
            _ => self.surface_connection_lost(),
        }
    }

    fn surface_connection_lost(&mut self) -> SessionUpdate {
        let effects = self.state.connection_lost();
        self.run_effects(effects);
        match self.state.error() {
            Some(message) => SessionUpdate::Failed(message.to_string()),
            None => SessionUpdate::Ignored,
        }
    }

    /// Mount / visibility / focus hook.
    pub async fn recover(&mut self, trigger: RecoveryTrigger) -> Result<RecoveryOutcome> {
        let outcome = self.recovery.check(&*self.backend, trigger).await?;
        match &outcome {
            RecoveryOutcome::Completed {
                descriptor,
                response,
            } => {
                let effects = self.state.apply_recovered(descriptor, response, &self.registry);
                self.run_effects(effects);
            }
            RecoveryOutcome::InProgress { descriptor } => {
                if self.state.resume_waiting(descriptor) {
                    info!(request_id = %descriptor.request_id, "generation still running");
                    if self.progress.value() == 0.0 {
                        self.progress
                            .start(estimated_duration(descriptor.mode, &descriptor.payload));
                    }
                    if self.stream.is_none() {
                        self.reattach_attempts = 0;
                        if let Err(e) = self.open_stream(&descriptor.request_id).await {
                            warn!(error = %e, "could not re-attach; waiting for next trigger");
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(outcome)
    }

    /// Asks the backend for `count` more icons based on `key`'s grid image and
    /// appends them. Returns how many arrived.
    pub async fn generate_more(&mut self, key: &ServiceKey, count: u32) -> Result<usize> {
        if self.state.phase() != SessionPhase::Results {
            return Err(GenerationError::Validation(
                "Results are not ready yet.".into(),
            ));
        }
        let (Some(request_id), Some(mode), Some(payload)) = (
            self.state.request_id().map(str::to_string),
            self.state.mode(),
            self.state.payload().cloned(),
        ) else {
            return Err(GenerationError::Validation(
                "The original request is no longer available.".into(),
            ));
        };
        let Some(grid) = self
            .state
            .ledger()
            .get(key)
            .and_then(|r| r.original_grid_image_base64.clone())
        else {
            return Err(GenerationError::Validation(
                "This result cannot be extended.".into(),
            ));
        };

        let request = GenerateMoreRequest {
            request_id,
            mode,
            service_id: key.service_id().to_string(),
            generation_index: key.generation_index(),
            original_grid_image_base64: grid,
            payload,
            count,
        };
        let response = self.backend.generate_more(&request).await?;
        if response.status == GenerateMoreStatus::Error {
            return Err(GenerationError::server(response.message.unwrap_or_default()));
        }

        let before = self.state.ledger().icon_count(key);
        let added = response.new_icons.len();
        self.state.append_icons(key, response.new_icons, &self.registry);
        self.reveal.start_from(key.clone(), before, before + added);
        info!(service_key = %key, added, "generate-more appended icons");
        self.schedule_balance_refresh();
        Ok(added)
    }

    fn run_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::CloseStream => self.close_stream(),
                Effect::ClearPersisted => {
                    if let Err(e) = self.store.clear() {
                        warn!(error = %e, "could not clear pending generation");
                    }
                }
                Effect::FinishProgress => self.progress.finish(),
                Effect::StopProgress => self.progress.stop(),
                Effect::RefreshBalance => self.schedule_balance_refresh(),
                Effect::Reveal(counts) => {
                    for (key, count) in counts {
                        self.reveal.start(key, count);
                    }
                }
            }
        }
    }

    /// Backend balances lag behind completion, so refresh after a delay.
    fn schedule_balance_refresh(&mut self) {
        if let Some(handle) = self.balance_refresh.take() {
            handle.abort();
        }
        let backend = Arc::clone(&self.backend);
        let cell = self.balance.clone();
        let delay = self.config.balance_refresh_delay;
        self.balance_refresh = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match backend.fetch_balance().await {
                Ok(balance) => cell.set(balance),
                Err(e) => warn!(error = %e, "balance refresh failed"),
            }
        }));
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.close_stream();
        if let Some(handle) = self.balance_refresh.take() {
            handle.abort();
        }
    }
}

async fn forward_events(mut events: EventStream, epoch: u64, tx: mpsc::UnboundedSender<Envelope>) {
    while let Some(item) = events.next().await {
        let (message, stop) = match item {
            Ok(event) => {
                let terminal = event.is_terminal();
                (StreamMessage::Event(event), terminal)
            }
            Err(e) => (StreamMessage::Failed(e.to_string()), true),
        };
        if tx.send(Envelope { epoch, message }).is_err() || stop {
            return;
        }
    }
    let _ = tx.send(Envelope {
        epoch,
        message: StreamMessage::Closed,
    });
}

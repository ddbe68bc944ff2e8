//! Session state and the reducer that moves it. Everything here is synchronous
//! and transport-free; side effects are returned as [`Effect`]s for the
//! controller to carry out.

use tracing::{debug, info};

use crate::aggregator::{ResultLedger, UpdateOutcome};
use crate::error::{GenerationError, CONNECTION_LOST_MESSAGE, GENERIC_FAILURE_MESSAGE};
use crate::events::StreamEvent;
use crate::models::{GenerationMode, GenerationPayload, GenerationRequestDescriptor, GenerationResponse};
use crate::services::{ServiceKey, ServiceRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Initial,
    Streaming,
    Results,
    Error,
}

/// Which path finalised the session. Only the first one to commit wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Pending,
    ResolvedByStream,
    ResolvedByRecovery,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    CloseStream,
    ClearPersisted,
    FinishProgress,
    StopProgress,
    RefreshBalance,
    Reveal(Vec<(ServiceKey, usize)>),
}

#[derive(Debug, Clone)]
pub struct SessionState {
    phase: SessionPhase,
    resolution: Resolution,
    request_id: Option<String>,
    mode: Option<GenerationMode>,
    payload: Option<GenerationPayload>,
    error: Option<String>,
    ledger: ResultLedger,
    response: Option<GenerationResponse>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            phase: SessionPhase::Initial,
            resolution: Resolution::Pending,
            request_id: None,
            mode: None,
            payload: None,
            error: None,
            ledger: ResultLedger::new(),
            response: None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn mode(&self) -> Option<GenerationMode> {
        self.mode
    }

    pub fn payload(&self) -> Option<&GenerationPayload> {
        self.payload.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn ledger(&self) -> &ResultLedger {
        &self.ledger
    }

    pub fn response(&self) -> Option<&GenerationResponse> {
        self.response.as_ref()
    }

    /// Validation or start failure before any stream exists.
    pub fn fail(&mut self, err: &GenerationError) {
        self.phase = SessionPhase::Error;
        self.error = Some(err.user_message());
    }

    /// Drops everything from the previous session ahead of a new request.
    pub fn reset_for_submission(&mut self, mode: GenerationMode, payload: GenerationPayload) {
        *self = Self {
            mode: Some(mode),
            payload: Some(payload),
            ..Self::new()
        };
    }

    /// Server accepted the request: placeholders are in, the stream is next.
    pub fn begin_streaming(&mut self, request_id: String, ledger: ResultLedger) {
        self.phase = SessionPhase::Streaming;
        self.resolution = Resolution::Pending;
        self.request_id = Some(request_id);
        self.error = None;
        self.ledger = ledger;
        self.response = None;
    }

    fn try_resolve(&mut self, by: Resolution) -> bool {
        if self.resolution != Resolution::Pending {
            debug!(already = ?self.resolution, attempted = ?by, "session already resolved");
            return false;
        }
        self.resolution = by;
        true
    }

    fn is_accepting_stream(&self) -> bool {
        self.phase == SessionPhase::Streaming && self.resolution == Resolution::Pending
    }

    pub fn apply_event(&mut self, event: StreamEvent, registry: &ServiceRegistry) -> Vec<Effect> {
        if !self.is_accepting_stream() {
            debug!(event = event.name(), phase = ?self.phase, "dropping event for finished session");
            return Vec::new();
        }
        match event {
            StreamEvent::ServiceUpdate(update) => {
                let key = update.key.clone();
                if self.ledger.apply_update(update) == UpdateOutcome::Applied {
                    debug!(service_key = %key, "service update applied");
                }
                Vec::new()
            }
            StreamEvent::GenerationComplete(completion) => {
                if !self.try_resolve(Resolution::ResolvedByStream) {
                    return Vec::new();
                }
                self.ledger.reconcile_completion(&completion, registry);
                let request_id = self
                    .request_id
                    .clone()
                    .unwrap_or_else(|| completion.request_id.clone());
                self.response = Some(self.ledger.response(&request_id, registry));
                self.phase = SessionPhase::Results;
                self.error = None;
                info!(request_id = %request_id, icons = self.response.as_ref().map_or(0, |r| r.icons.len()), "generation complete");
                vec![
                    Effect::CloseStream,
                    Effect::FinishProgress,
                    Effect::ClearPersisted,
                    Effect::RefreshBalance,
                    Effect::Reveal(self.ledger.icon_counts()),
                ]
            }
            StreamEvent::GenerationError(failure) => {
                let message = failure
                    .message
                    .unwrap_or_else(|| GENERIC_FAILURE_MESSAGE.to_string());
                info!(request_id = ?self.request_id, %message, "generation failed");
                self.phase = SessionPhase::Error;
                self.error = Some(message);
                vec![Effect::CloseStream, Effect::StopProgress, Effect::ClearPersisted]
            }
        }
    }

    /// The stream is gone and recovery could not resolve the session.
    pub fn connection_lost(&mut self) -> Vec<Effect> {
        if !self.is_accepting_stream() {
            return Vec::new();
        }
        self.phase = SessionPhase::Error;
        self.error = Some(CONNECTION_LOST_MESSAGE.to_string());
        vec![Effect::CloseStream, Effect::StopProgress]
    }

    /// Applies a completed generation found by polling.
    pub fn apply_recovered(
        &mut self,
        descriptor: &GenerationRequestDescriptor,
        completed: &GenerationResponse,
        registry: &ServiceRegistry,
    ) -> Vec<Effect> {
        let same_request = self.request_id.as_deref() == Some(descriptor.request_id.as_str());
        if same_request && !self.try_resolve(Resolution::ResolvedByRecovery) {
            return vec![Effect::ClearPersisted];
        }
        if !same_request {
            self.resolution = Resolution::ResolvedByRecovery;
        }

        self.request_id = Some(descriptor.request_id.clone());
        self.mode = Some(descriptor.mode);
        self.payload = Some(descriptor.payload.clone());
        self.ledger = ResultLedger::from_completed(completed, registry);
        self.response = Some(self.ledger.response(&descriptor.request_id, registry));
        self.phase = SessionPhase::Results;
        self.error = None;
        info!(request_id = %descriptor.request_id, "generation recovered");
        vec![
            Effect::CloseStream,
            Effect::FinishProgress,
            Effect::ClearPersisted,
            Effect::RefreshBalance,
            Effect::Reveal(self.ledger.icon_counts()),
        ]
    }

    /// Server says the request is still running. Returns whether the UI moved
    /// back into `streaming`.
    pub fn resume_waiting(&mut self, descriptor: &GenerationRequestDescriptor) -> bool {
        if !matches!(self.phase, SessionPhase::Initial | SessionPhase::Error) {
            return false;
        }
        if self.request_id.as_deref() != Some(descriptor.request_id.as_str()) {
            self.request_id = Some(descriptor.request_id.clone());
            self.mode = Some(descriptor.mode);
            self.payload = Some(descriptor.payload.clone());
            self.ledger = ResultLedger::new();
            self.response = None;
        }
        self.phase = SessionPhase::Streaming;
        self.resolution = Resolution::Pending;
        self.error = None;
        true
    }

    /// Icons from "generate more" land in the ledger and the response view.
    pub fn append_icons(
        &mut self,
        key: &ServiceKey,
        icons: Vec<crate::models::Icon>,
        registry: &ServiceRegistry,
    ) -> bool {
        if !self.ledger.append_icons(key, icons) {
            return false;
        }
        if let Some(request_id) = self.request_id.clone() {
            self.response = Some(self.ledger.response(&request_id, registry));
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{GenerationFailure, ServiceUpdate};
    use crate::models::{Icon, ServiceStatus};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn registry() -> ServiceRegistry {
        ServiceRegistry::default()
    }

    fn icons(source: &str, count: usize) -> Vec<Icon> {
        (0..count)
            .map(|n| Icon {
                id: Some(format!("{source}-{n}")),
                base64_data: "AAAA".into(),
                service_source: Some(source.into()),
                ..Default::default()
            })
            .collect()
    }

    fn descriptor(request_id: &str) -> GenerationRequestDescriptor {
        GenerationRequestDescriptor {
            request_id: request_id.into(),
            mode: GenerationMode::Icons,
            payload: GenerationPayload {
                general_description: "cat logos".into(),
                ..Default::default()
            },
            created_at: Utc::now(),
        }
    }

    fn streaming(request_id: &str) -> SessionState {
        let mut state = SessionState::new();
        state.reset_for_submission(GenerationMode::Icons, descriptor(request_id).payload);
        let services: BTreeMap<String, bool> =
            [("flux".to_string(), true), ("recraft".to_string(), true)].into();
        state.begin_streaming(request_id.into(), ResultLedger::seeded(&services, false));
        state
    }

    fn flux_success(count: usize) -> StreamEvent {
        StreamEvent::ServiceUpdate(ServiceUpdate {
            key: "flux-gen1".parse().unwrap(),
            status: ServiceStatus::Success,
            message: Some("Done".into()),
            generation_time_ms: Some(1000),
            icons: Some(icons("flux", count)),
            original_grid_image_base64: Some("GRID".into()),
            seed: None,
        })
    }

    fn completion(icons: Vec<Icon>) -> StreamEvent {
        StreamEvent::GenerationComplete(GenerationResponse {
            icons,
            request_id: "req-1".into(),
            ..Default::default()
        })
    }

    #[test]
    fn completion_moves_to_results_with_side_effects() {
        let mut state = streaming("req-1");
        assert!(state.apply_event(flux_success(3), &registry()).is_empty());
        let effects = state.apply_event(completion(Vec::new()), &registry());

        assert_eq!(state.phase(), SessionPhase::Results);
        assert_eq!(state.resolution(), Resolution::ResolvedByStream);
        assert_eq!(state.response().unwrap().icons.len(), 3);
        assert!(effects.contains(&Effect::ClearPersisted));
        assert!(effects.contains(&Effect::RefreshBalance));
        assert!(effects.contains(&Effect::Reveal(vec![("flux-gen1".parse().unwrap(), 3)])));
    }

    #[test]
    fn events_after_terminal_are_ignored() {
        let mut state = streaming("req-1");
        state.apply_event(flux_success(3), &registry());
        state.apply_event(completion(Vec::new()), &registry());
        let before = state.response().cloned();

        assert!(state.apply_event(flux_success(9), &registry()).is_empty());
        assert!(state
            .apply_event(StreamEvent::GenerationError(GenerationFailure::default()), &registry())
            .is_empty());
        assert!(state.connection_lost().is_empty());
        assert_eq!(state.phase(), SessionPhase::Results);
        assert_eq!(state.response().cloned(), before);
    }

    #[test]
    fn recovery_after_stream_completion_is_a_no_op() {
        let mut state = streaming("req-1");
        state.apply_event(flux_success(3), &registry());
        state.apply_event(completion(Vec::new()), &registry());

        let polled = GenerationResponse {
            icons: icons("recraft", 7),
            ..Default::default()
        };
        let effects = state.apply_recovered(&descriptor("req-1"), &polled, &registry());
        assert_eq!(effects, vec![Effect::ClearPersisted]);
        assert_eq!(state.resolution(), Resolution::ResolvedByStream);
        assert_eq!(state.response().unwrap().icons.len(), 3);
    }

    #[test]
    fn stream_completion_after_recovery_is_a_no_op() {
        let mut state = streaming("req-1");
        let polled = GenerationResponse {
            icons: icons("recraft", 2),
            ..Default::default()
        };
        let effects = state.apply_recovered(&descriptor("req-1"), &polled, &registry());
        assert!(effects.contains(&Effect::CloseStream));
        assert_eq!(state.resolution(), Resolution::ResolvedByRecovery);

        assert!(state.apply_event(completion(icons("flux", 5)), &registry()).is_empty());
        assert!(state.connection_lost().is_empty());
        assert_eq!(state.phase(), SessionPhase::Results);
        assert_eq!(state.response().unwrap().icons.len(), 2);
        assert!(state.error().is_none());
    }

    #[test]
    fn error_event_surfaces_server_message() {
        let mut state = streaming("req-1");
        let effects = state.apply_event(
            StreamEvent::GenerationError(GenerationFailure {
                message: Some("Content policy violation".into()),
            }),
            &registry(),
        );
        assert_eq!(state.phase(), SessionPhase::Error);
        assert_eq!(state.error(), Some("Content policy violation"));
        assert!(effects.contains(&Effect::ClearPersisted));

        let mut state = streaming("req-2");
        state.apply_event(StreamEvent::GenerationError(GenerationFailure::default()), &registry());
        assert_eq!(state.error(), Some(GENERIC_FAILURE_MESSAGE));
    }

    #[test]
    fn recovery_restores_payload_into_fresh_state() {
        let mut state = SessionState::new();
        let effects = state.apply_recovered(
            &descriptor("req-7"),
            &GenerationResponse::default(),
            &registry(),
        );
        assert_eq!(state.phase(), SessionPhase::Results);
        assert_eq!(state.request_id(), Some("req-7"));
        assert_eq!(state.payload().unwrap().general_description, "cat logos");
        assert!(state.response().unwrap().icons.is_empty());
        assert!(effects.contains(&Effect::Reveal(Vec::new())));
    }

    #[test]
    fn resume_waiting_only_from_idle_or_error() {
        let mut state = SessionState::new();
        state.fail(&GenerationError::Transport("reset".into()));
        assert!(state.resume_waiting(&descriptor("req-3")));
        assert_eq!(state.phase(), SessionPhase::Streaming);
        assert!(state.error().is_none());
        assert_eq!(state.request_id(), Some("req-3"));

        assert!(!state.resume_waiting(&descriptor("req-3")));
    }
}

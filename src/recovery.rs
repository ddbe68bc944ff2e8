//! Recovery Orchestrator: decides what to do with a persisted pending
//! generation when the host regains focus, remounts, or loses the stream.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backend::GenerationBackend;
use crate::error::{GenerationError, Result};
use crate::models::{GenerationRequestDescriptor, GenerationResponse, PollStatus};
use crate::store::{Clock, SessionStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryTrigger {
    Mount,
    VisibilityVisible,
    WindowFocus,
    /// The live stream errored or closed before a terminal event.
    StreamLost,
}

#[derive(Debug, Clone)]
pub enum RecoveryOutcome {
    NothingPending,
    /// Descriptor was past the staleness window and has been deleted.
    DiscardedStale,
    Completed {
        descriptor: GenerationRequestDescriptor,
        response: GenerationResponse,
    },
    InProgress {
        descriptor: GenerationRequestDescriptor,
    },
    /// Server no longer knows the request (or reports it failed); deleted.
    Discarded {
        descriptor: GenerationRequestDescriptor,
        status: PollStatus,
    },
    /// Status poll itself failed; the descriptor is kept for the next attempt.
    PollFailed {
        descriptor: GenerationRequestDescriptor,
        error: String,
    },
}

impl RecoveryOutcome {
    /// Whether a lost stream counts as handled by this outcome.
    pub fn resolves_stream_loss(&self) -> bool {
        matches!(
            self,
            RecoveryOutcome::Completed { .. } | RecoveryOutcome::InProgress { .. }
        )
    }
}

pub struct RecoveryOrchestrator {
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    stale_after: Duration,
}

impl RecoveryOrchestrator {
    pub fn new(store: Arc<dyn SessionStore>, clock: Arc<dyn Clock>, stale_after: Duration) -> Self {
        Self {
            store,
            clock,
            stale_after,
        }
    }

    pub async fn check(
        &self,
        backend: &dyn GenerationBackend,
        trigger: RecoveryTrigger,
    ) -> Result<RecoveryOutcome> {
        let Some(record) = self.store.load()? else {
            debug!(?trigger, "nothing to recover");
            return Ok(RecoveryOutcome::NothingPending);
        };
        if record.is_stale(self.clock.now(), self.stale_after) {
            info!(request_id = %record.descriptor.request_id, "discarding stale pending generation");
            self.store.clear()?;
            return Ok(RecoveryOutcome::DiscardedStale);
        }

        let descriptor = record.descriptor;
        info!(request_id = %descriptor.request_id, mode = %descriptor.mode, ?trigger, "🔄 checking generation status");
        let status = match backend
            .generation_status(&descriptor.request_id, descriptor.mode)
            .await
        {
            Ok(status) => status,
            Err(e) => {
                warn!(request_id = %descriptor.request_id, error = %e, "status poll failed");
                return Ok(RecoveryOutcome::PollFailed {
                    descriptor,
                    error: e.to_string(),
                });
            }
        };

        match status.status {
            PollStatus::Completed => Ok(RecoveryOutcome::Completed {
                descriptor,
                response: status.data.unwrap_or_default(),
            }),
            PollStatus::InProgress => Ok(RecoveryOutcome::InProgress { descriptor }),
            other => {
                let reason = GenerationError::RecoveryExhausted(format!(
                    "status {other:?} for {}",
                    descriptor.request_id
                ));
                info!(error = %reason, "discarding pending generation");
                self.store.clear()?;
                Ok(RecoveryOutcome::Discarded {
                    descriptor,
                    status: other,
                })
            }
        }
    }
}

//! Client-side session controller for streamed icon, illustration, label,
//! mockup and UI-element generation.

pub mod account;
pub mod aggregator;
pub mod animation;
pub mod backend;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod progress;
pub mod recovery;
pub mod services;
pub mod session;
pub mod sse;
pub mod store;
pub mod validation;

pub use account::{Balance, BalanceCell};
pub use backend::{GenerationBackend, HttpBackend};
pub use config::ClientConfig;
pub use controller::{SessionController, SessionUpdate};
pub use error::{GenerationError, Result};
pub use models::{GenerationMode, GenerationPayload, GenerationResponse, Icon};
pub use recovery::{RecoveryOutcome, RecoveryTrigger};
pub use services::{ServiceKey, ServiceRegistry};
pub use session::{SessionPhase, SessionState};
pub use store::{FileSessionStore, MemorySessionStore, SessionStore};

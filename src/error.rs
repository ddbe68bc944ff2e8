use thiserror::Error;

/// Fallback shown when the server fails without a usable message.
pub const GENERIC_FAILURE_MESSAGE: &str = "Generation failed. Please try again.";

/// Shown when the stream dropped and recovery could not resolve the session.
pub const CONNECTION_LOST_MESSAGE: &str =
    "Connection to the generation service was lost. Please try again.";

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Insufficient coins: generation costs {cost}, balance is {coins}")]
    InsufficientBalance { cost: u32, coins: u32 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Server error (status={status:?}): {message}")]
    Server { status: Option<u16>, message: String },

    #[error("Recovery exhausted: {0}")]
    RecoveryExhausted(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Decode error: {0}")]
    Decode(String),
}

impl GenerationError {
    pub fn server(message: impl Into<String>) -> Self {
        GenerationError::Server {
            status: None,
            message: message.into(),
        }
    }

    /// Text for the error UI state.
    pub fn user_message(&self) -> String {
        match self {
            GenerationError::Validation(msg) => msg.clone(),
            GenerationError::InsufficientBalance { cost, .. } => format!(
                "Insufficient coins. This generation costs {} coin{}.",
                cost,
                if *cost == 1 { "" } else { "s" }
            ),
            GenerationError::Transport(_) | GenerationError::RecoveryExhausted(_) => {
                CONNECTION_LOST_MESSAGE.to_string()
            }
            GenerationError::Server { message, .. } if !message.trim().is_empty() => {
                message.clone()
            }
            _ => GENERIC_FAILURE_MESSAGE.to_string(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            GenerationError::Validation(_) | GenerationError::InsufficientBalance { .. }
        )
    }
}

impl From<reqwest::Error> for GenerationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            GenerationError::Decode(err.to_string())
        } else {
            GenerationError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for GenerationError {
    fn from(err: serde_json::Error) -> Self {
        GenerationError::Decode(err.to_string())
    }
}

impl From<std::io::Error> for GenerationError {
    fn from(err: std::io::Error) -> Self {
        GenerationError::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GenerationError>;

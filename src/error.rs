use thiserror::Error;

/// Every failure a collaboration call can report to its caller.
///
/// The first six variants are orchestration outcomes; the rest come from
/// configuration, persistence and transport plumbing. A reach that times out
/// is not an error: it is reported as [`crate::ActionResult::TimedOut`].
#[derive(Debug, Error)]
pub enum CollaborationError {
    #[error("`{0}` is not an entity of the world model")]
    NotFound(String),

    #[error("entity `{name}` is not {expected}")]
    TypeMismatch { name: String, expected: &'static str },

    #[error("target {position} is outside the {arm} arm workspace")]
    Unreachable { position: String, arm: String },

    #[error("reaching drives the {controlled} arm, not the {requested} arm")]
    UncontrolledArm { requested: String, controlled: String },

    #[error("no reply from {peer}: {reason}")]
    CommunicationFailure { peer: String, reason: String },

    #[error("{peer} rejected `{command}`")]
    Rejected { peer: String, command: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("world model storage failed: {0}")]
    WorldModel(#[from] sled::Error),

    #[error("malformed message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CollaborationError {
    pub fn communication(peer: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::CommunicationFailure {
            peer: peer.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CollaborationError>;

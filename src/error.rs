use crate::lifecycle::Phase;
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EnsembleError>;

/// Recognized domain-error kinds.
///
/// Errors carrying one of these kinds are caught by the route error boundary
/// and turned into a structured HTTP response instead of escalating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BizKind {
    #[serde(rename = "BizError")]
    Biz,
    #[serde(rename = "InvalidInputError")]
    InvalidInput,
}

impl BizKind {
    pub fn code(&self) -> &'static str {
        match self {
            BizKind::Biz => "BIZ_ERROR",
            BizKind::InvalidInput => "INVALID_INPUT",
        }
    }
}

/// A structured business error, raised intentionally by validation or
/// application logic.
///
/// Serializes to `{message, type, code, status}` — the shape written onto the
/// response by the route error boundary.
#[derive(Debug, Clone, Error, Serialize)]
#[error("{message}")]
pub struct BizError {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: BizKind,
    pub code: &'static str,
    pub status: u16,
}

impl BizError {
    pub fn biz(message: impl Into<String>) -> Self {
        Self::with_kind(message, BizKind::Biz, 400)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::with_kind(message, BizKind::InvalidInput, 400)
    }

    pub fn with_kind(message: impl Into<String>, kind: BizKind, status: u16) -> Self {
        // Statuses outside the transmittable HTTP range collapse to 400, so
        // the error boundary always writes the carried status.
        let status = if (100..=999).contains(&status) {
            status
        } else {
            400
        };
        Self {
            message: message.into(),
            kind,
            code: kind.code(),
            status,
        }
    }
}

#[derive(Debug, Error)]
pub enum EnsembleError {
    /// A recognized domain error; recovered by the route error boundary.
    #[error(transparent)]
    Biz(#[from] BizError),

    /// Assembling the application object graph failed. Fatal: no route is
    /// ever exposed.
    #[error("Assembly failed: {0}")]
    Assembly(String),

    /// A lifecycle hook rejected during a startup phase.
    #[error("Hook failed during {phase}: {name}: {source}")]
    Hook {
        phase: Phase,
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// A lifecycle transition was requested out of order (e.g. a second
    /// `run()` on the same application).
    #[error("Invalid lifecycle state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EnsembleError {
    pub fn assembly(msg: impl Into<String>) -> Self {
        Self::Assembly(msg.into())
    }

    /// The domain error carried by this error, if it is one.
    pub fn as_biz(&self) -> Option<&BizError> {
        match self {
            EnsembleError::Biz(biz) => Some(biz),
            _ => None,
        }
    }
}

//! Error taxonomy shared across every component.
//!
//! Each component defines its own `thiserror` enum for the errors it can
//! produce, and implements [`Classify`] so the supervisor can decide
//! whether to retry, degrade, or shut down without matching on the
//! concrete error type.

use thiserror::Error;

/// The three error kinds from the system's error-handling design: a
/// transient error is retried locally, a degraded condition is recorded
/// on the affected event and the pipeline continues, a fatal error is
/// raised to the supervisor which shuts the process down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Degraded,
    Fatal,
}

/// Implemented by every component error enum so the supervisor can
/// dispatch on kind without downcasting.
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

/// Top-level error surfaced to `main`'s supervisor loop. Component
/// errors are wrapped here once their kind has been decided to be
/// `Fatal`; transient and degraded errors are handled at the point of
/// origin and never reach this type.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("startup failure: {0}")]
    Startup(String),
    #[error("{component} reported a fatal error: {source}")]
    Component {
        component: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl PipelineError {
    /// Exit code mapping from §6: 1 configuration error, 2 unrecoverable
    /// startup failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Config(_) => 1,
            PipelineError::Startup(_) | PipelineError::Component { .. } => 2,
        }
    }
}

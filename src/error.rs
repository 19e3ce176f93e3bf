use thiserror::Error;

/// Errors surfaced by the metrics pipeline to its callers.
#[derive(Error, Debug)]
pub enum Error {
    /// The report or registration is malformed and was rejected without
    /// touching any state.
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// A store call failed. Only produced where the caller asked for the
    /// store result; background flushes log and swallow these.
    #[error("persistence failed: {0}")]
    Persistence(#[from] anyhow::Error),

    /// The component was shut down.
    #[error("{component} is closed")]
    Closed { component: &'static str },
}

impl Error {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn closed(component: &'static str) -> Self {
        Self::Closed { component }
    }

    /// Returns true for [`Error::Validation`].
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }

    /// Returns true for [`Error::Closed`].
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

//! Error types
//!
//! `EngineError` covers failures raised by the engine itself. `Rejection` is the
//! reason an asynchronous value settled to failure. It is clonable so that every
//! consumer of the same deferred value observes the very same reason.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Failures originating in the engine rather than in consumer code
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// A write targeted an atom without a write capability
    #[error("{0} is not writable")]
    ReadOnly(String),

    /// `Registry::fulfilled_value` was called on a pending or rejected value
    #[error("value is not fulfilled")]
    NotFulfilled,

    /// The `Settler` of a deferred value was dropped before settling it
    #[error("deferred value was abandoned before settling")]
    Abandoned,

    /// Inert placeholder for an eager evaluation whose caller went away
    #[error("evaluation cancelled")]
    Cancelled,

    /// A pending value needs driving but no tokio runtime is running
    #[error("no tokio runtime available to drive a pending value")]
    NoRuntime,

    /// A store entry was read back as a different type than it was written
    #[error("stored value of {0} has an unexpected type")]
    TypeMismatch(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Why an asynchronous value settled to failure
#[derive(Clone)]
pub struct Rejection {
    error: Arc<anyhow::Error>,
}

impl Rejection {
    /// Wrap an error as a rejection reason.
    ///
    /// An `anyhow::Error` that already carries a `Rejection` is unwrapped back to
    /// it, so a reason survives a round trip through consumer code that uses `?`.
    pub fn new(error: impl Into<anyhow::Error>) -> Self {
        match error.into().downcast::<Rejection>() {
            Ok(rejection) => rejection,
            Err(error) => Self {
                error: Arc::new(error),
            },
        }
    }

    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self::new(anyhow::Error::msg(message))
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<E>()
    }

    /// True for the placeholder a cancelled eager evaluation settles with
    pub fn is_cancelled(&self) -> bool {
        matches!(self.downcast_ref::<EngineError>(), Some(EngineError::Cancelled))
    }

    /// True if both rejections share the same underlying reason
    pub fn same_reason(&self, other: &Rejection) -> bool {
        Arc::ptr_eq(&self.error, &other.error)
    }
}

impl fmt::Debug for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.error, f)
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.error, f)
    }
}

impl std::error::Error for Rejection {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

impl From<anyhow::Error> for Rejection {
    fn from(error: anyhow::Error) -> Self {
        Self::new(error)
    }
}

impl From<EngineError> for Rejection {
    fn from(error: EngineError) -> Self {
        Self::new(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_survives_anyhow_round_trip() {
        let original = Rejection::msg("boom");
        let through: anyhow::Error = original.clone().into();
        let back = Rejection::from(through);

        assert!(back.same_reason(&original));
        assert_eq!(back.to_string(), "boom");
    }

    #[test]
    fn test_cancelled_placeholder_is_detectable() {
        assert!(Rejection::from(EngineError::Cancelled).is_cancelled());
        assert!(!Rejection::msg("E").is_cancelled());
    }

    #[test]
    fn test_engine_error_is_downcastable() {
        let rejection = Rejection::from(EngineError::ReadOnly("atom#3".to_string()));
        assert_eq!(
            rejection.downcast_ref::<EngineError>(),
            Some(&EngineError::ReadOnly("atom#3".to_string()))
        );
        assert_eq!(rejection.to_string(), "atom#3 is not writable");
    }
}

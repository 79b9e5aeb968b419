//! Explicit result type for repair phases.

use super::error::PatcherError;

/// Outcome of one phase, consumed by the state machine's transition function.
#[derive(Debug)]
pub enum PhaseOutcome<T> {
    Success(T),
    /// The phase may be re-run at the next transition boundary.
    Retryable(PatcherError),
    /// The session must move to the error's terminal state.
    Fatal(PatcherError),
}

impl<T> PhaseOutcome<T> {
    /// Classify an error by its transience.
    pub fn from_error(err: PatcherError) -> Self {
        if err.is_transient() || matches!(err, PatcherError::CircuitOpen) {
            Self::Retryable(err)
        } else {
            Self::Fatal(err)
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> PhaseOutcome<U> {
        match self {
            Self::Success(value) => PhaseOutcome::Success(f(value)),
            Self::Retryable(err) => PhaseOutcome::Retryable(err),
            Self::Fatal(err) => PhaseOutcome::Fatal(err),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl<T> From<Result<T, PatcherError>> for PhaseOutcome<T> {
    fn from(result: Result<T, PatcherError>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(err) => Self::from_error(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_result_classifies_errors() {
        let ok: PhaseOutcome<u8> = Ok(3).into();
        assert!(ok.is_success());

        let transient: PhaseOutcome<u8> =
            Err(PatcherError::TransientBackend("503".into())).into();
        assert!(matches!(transient, PhaseOutcome::Retryable(_)));

        let open: PhaseOutcome<u8> = Err(PatcherError::CircuitOpen).into();
        assert!(matches!(open, PhaseOutcome::Retryable(_)));

        let fatal: PhaseOutcome<u8> = Err(PatcherError::Auth("401".into())).into();
        assert!(matches!(fatal, PhaseOutcome::Fatal(_)));
    }

    #[test]
    fn test_map_preserves_errors() {
        let out: PhaseOutcome<u8> = PhaseOutcome::Success(2);
        assert!(matches!(out.map(|v| v * 2), PhaseOutcome::Success(4)));

        let err: PhaseOutcome<u8> = PhaseOutcome::Fatal(PatcherError::CircuitOpen);
        assert!(matches!(err.map(|v| v * 2), PhaseOutcome::Fatal(_)));
    }
}

use super::types::{RuntimeError, RuntimeResult};

/// Runtime failures that mean the target state already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Benign {
    AlreadyStarted,
    AlreadyStopped,
    NoSuchContainer,
    NotRunning,
}

impl Benign {
    pub fn matches(&self, err: &RuntimeError) -> bool {
        let message = err.message().to_ascii_lowercase();
        match self {
            Benign::AlreadyStarted => {
                matches!(err, RuntimeError::NotModified(_))
                    || message.contains("already started")
                    || message.contains("already running")
            }
            Benign::AlreadyStopped => {
                matches!(err, RuntimeError::NotModified(_))
                    || message.contains("already stopped")
                    || message.contains("is not running")
            }
            Benign::NoSuchContainer => {
                matches!(err, RuntimeError::NotFound(_)) || message.contains("no such container")
            }
            Benign::NotRunning => {
                !matches!(err, RuntimeError::Unavailable(_)) && message.contains("is not running")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Tolerated(Benign),
}

/// Turn a runtime failure into success when it is one of the `benign` cases.
pub fn tolerate(result: RuntimeResult<()>, benign: &[Benign]) -> RuntimeResult<Outcome> {
    match result {
        Ok(()) => Ok(Outcome::Applied),
        Err(err) => match benign.iter().find(|b| b.matches(&err)) {
            Some(b) => Ok(Outcome::Tolerated(*b)),
            None => Err(err),
        },
    }
}

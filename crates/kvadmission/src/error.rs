use derive_more::Display;

/// Error type shared by the controller, the pacer and the queues it consults.
#[derive(Debug, Display)]
pub enum AdmissionError {
    /// A queue refused to admit the work (closed, deadline exceeded...).
    #[display("admission rejected: {reason}")]
    Rejected { reason: String },
    /// The caller gave up while waiting for admission.
    #[display("admission cancelled while waiting for capacity")]
    Cancelled,
    /// A setting was given a value outside of its allowed bounds.
    #[display("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },
    /// Accounting state that should never be observed in correct operation.
    #[display("invariant violation: {reason}")]
    InvariantViolation { reason: String },
}

impl core::error::Error for AdmissionError {}

impl AdmissionError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
        }
    }

    pub fn invariant_violation(reason: impl Into<String>) -> Self {
        Self::InvariantViolation {
            reason: reason.into(),
        }
    }
}

use core::time::Duration;

use crate::store::StoreError;

/// A result type defaulting to the crate's [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// All errors an allocation, release or initialize call can produce.
///
/// Every variant belongs to exactly one [`ErrorKind`]. Callers that only care
/// about how to react (retry with a larger budget, expand the range, back off
/// until the store returns) should match on [`Error::kind`] instead of the
/// variant itself.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid bounds, a non-positive chunk size or retry budget, or an
    /// attempt to redefine an existing pool with different settings.
    #[error("invalid pool configuration: {reason}")]
    Configuration { reason: String },

    /// The named pool was never initialized, or has been deleted.
    #[error("pool `{pool}` does not exist")]
    PoolNotFound { pool: String },

    /// Every value of the pool is currently allocated (or, for a bounded
    /// counter, the counter moved past its upper bound).
    #[error("pool `{pool}` is exhausted")]
    PoolExhausted { pool: String },

    /// The probe-based search did not find a free value within its budget.
    ///
    /// The pool may still have free values.
    #[error("no free value found in pool `{pool}` after {attempts} attempts")]
    RetriesExhausted { pool: String, attempts: u32 },

    /// The backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The call did not complete before the caller's deadline.
    #[error("operation did not complete within {timeout:?}")]
    DeadlineExceeded { timeout: Duration },

    /// Malformed caller input, such as an unparsable address.
    #[error("invalid input: {reason}")]
    Validation { reason: String },
}

/// The coarse classification of an [`Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConfigurationError,
    PoolExhausted,
    AllocationRetriesExhausted,
    StoreUnavailable,
    ValidationError,
}

impl Error {
    /// Returns how the caller should interpret this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } | Self::PoolNotFound { .. } => ErrorKind::ConfigurationError,
            Self::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Self::RetriesExhausted { .. } => ErrorKind::AllocationRetriesExhausted,
            Self::Store(_) | Self::DeadlineExceeded { .. } => ErrorKind::StoreUnavailable,
            Self::Validation { .. } => ErrorKind::ValidationError,
        }
    }

    /// Returns `true` when the caller's deadline expired.
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::DeadlineExceeded { .. })
    }

    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub(crate) fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub(crate) fn not_found(pool: &str) -> Self {
        Self::PoolNotFound {
            pool: pool.to_owned(),
        }
    }

    pub(crate) fn exhausted(pool: &str) -> Self {
        Self::PoolExhausted {
            pool: pool.to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_distinguishable() {
        let timeout = Error::DeadlineExceeded {
            timeout: Duration::from_millis(5),
        };
        assert_eq!(timeout.kind(), ErrorKind::StoreUnavailable);
        assert!(timeout.is_timeout());

        let retries = Error::RetriesExhausted {
            pool: "p".into(),
            attempts: 3,
        };
        assert_eq!(retries.kind(), ErrorKind::AllocationRetriesExhausted);
        assert_ne!(retries.kind(), Error::exhausted("p").kind());
        assert!(!retries.is_timeout());

        let store: Error = StoreError::Unavailable {
            context: "down".into(),
        }
        .into();
        assert_eq!(store.kind(), ErrorKind::StoreUnavailable);
        assert!(!store.is_timeout());

        assert_eq!(Error::not_found("p").kind(), ErrorKind::ConfigurationError);
        assert_eq!(Error::validation("x").kind(), ErrorKind::ValidationError);
    }

    #[test]
    fn messages_name_the_pool() {
        assert_eq!(
            Error::exhausted("pool1").to_string(),
            "pool `pool1` is exhausted"
        );
        assert_eq!(
            Error::RetriesExhausted {
                pool: "ins".into(),
                attempts: 5
            }
            .to_string(),
            "no free value found in pool `ins` after 5 attempts"
        );
    }
}

/// A result type for [`DocumentStore`](crate::store::DocumentStore) calls.
pub type StoreResult<T> = core::result::Result<T, StoreError>;

/// Failures reported by a document store.
///
/// None of these are allocation outcomes: a duplicate key on a unique insert,
/// an empty free set or a missing document are all reported through the
/// operation's own return type.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached, or refused the call.
    #[error("store unavailable: {context}")]
    Unavailable { context: String },

    /// An update required an existing document and none matched the filter.
    #[error("no document in `{collection}` matches the filter")]
    NotFound { collection: String },

    /// A stored document did not have the expected shape.
    #[error("malformed document: {context}")]
    Serialization { context: String },

    /// A JSON patch did not apply: a `test` failed or a path did not
    /// resolve. The document was left untouched.
    #[error("patch rejected: {context}")]
    Rejected { context: String },

    /// Any other backend failure.
    #[error("store backend error: {context}")]
    Backend { context: String },
}

impl StoreError {
    pub(crate) fn malformed(context: impl Into<String>) -> Self {
        Self::Serialization {
            context: context.into(),
        }
    }
}

impl StoreError {
    pub(crate) fn rejected(context: impl Into<String>) -> Self {
        Self::Rejected {
            context: context.into(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::malformed(err.to_string())
    }
}

use std::fmt;
use task_queue_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Timed out acquiring lock {key}")]
    AcquisitionTimeout { key: String },

    /// The lock record holds another owner's token at release time.
    #[error("Lock {key} is held by another owner")]
    CorruptedLock { key: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Failed to decode task in {entry}: {source}")]
    DecodeFailure {
        entry: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode task {id}: {source}")]
    EncodeFailure {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0}")]
    Handlers(HandlerFailures),

    #[error("Store error while {context}: {source}")]
    Store {
        context: String,
        #[source]
        source: StoreError,
    },
}

impl QueueError {
    pub fn decode(entry: impl Into<String>, source: serde_json::Error) -> Self {
        QueueError::DecodeFailure {
            entry: entry.into(),
            source,
        }
    }

    /// Lock contention that the caller may simply retry later
    pub fn is_acquisition_timeout(&self) -> bool {
        matches!(self, QueueError::AcquisitionTimeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Attaches operation context to store failures
pub trait StoreContext<T> {
    fn context(self, context: impl FnOnce() -> String) -> Result<T>;
}

impl<T> StoreContext<T> for std::result::Result<T, StoreError> {
    fn context(self, context: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|source| QueueError::Store {
            context: context(),
            source,
        })
    }
}

/// Failure of one handler invocation within a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    /// Log entry id
    pub entry: String,
    pub task_id: String,
    pub message: String,
}

/// Every handler failure of one batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerFailures(pub Vec<HandlerFailure>);

impl HandlerFailures {
    pub fn push(&mut self, failure: HandlerFailure) {
        self.0.push(failure);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HandlerFailure> {
        self.0.iter()
    }
}

impl fmt::Display for HandlerFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} task handler(s) failed", self.0.len())?;
        for (i, failure) in self.0.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(
                f,
                "{}task {} (entry {}): {}",
                sep, failure.task_id, failure.entry, failure.message
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_failures_display() {
        let mut failures = HandlerFailures::default();
        failures.push(HandlerFailure {
            entry: "1-0".to_string(),
            task_id: "a".to_string(),
            message: "boom".to_string(),
        });
        failures.push(HandlerFailure {
            entry: "1-1".to_string(),
            task_id: "b".to_string(),
            message: "panicked".to_string(),
        });

        assert_eq!(
            QueueError::Handlers(failures).to_string(),
            "2 task handler(s) failed: task a (entry 1-0): boom; task b (entry 1-1): panicked"
        );
    }

    #[test]
    fn test_store_context() {
        let failed: std::result::Result<(), StoreError> = Err(StoreError::Backend("down".into()));
        let err = failed.context(|| "reading the ready set".to_string()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Store error while reading the ready set: Backend error: down"
        );
    }
}

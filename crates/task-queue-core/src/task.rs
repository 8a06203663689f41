use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::fmt;

/// Opaque task payload, kept as the raw JSON text the producer supplied.
///
/// The queue never looks inside it; it is carried from producer to handler
/// byte for byte.
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Box<RawValue>);

impl Payload {
    /// Serializes `value` into a payload
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Self> {
        serde_json::value::to_raw_value(value).map(Payload)
    }

    /// Wraps already-encoded JSON after checking it is well formed
    pub fn from_json(json: impl Into<String>) -> serde_json::Result<Self> {
        RawValue::from_string(json.into()).map(Payload)
    }

    /// Deserializes the payload into the type the consumer expects
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(self.0.get())
    }

    pub fn as_json(&self) -> &str {
        self.0.get()
    }
}

impl Default for Payload {
    fn default() -> Self {
        Payload(RawValue::NULL.to_owned())
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.as_json() == other.as_json()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_json())
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_json())
    }
}

/// Unit of work travelling through the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,

    /// When the task was created
    pub scheduled: DateTime<Utc>,

    /// Ordering key; the lowest value is dispatched first
    pub priority: f64,

    /// The task is not dispatched before this instant
    #[serde(rename = "executeAfter")]
    pub execute_after: DateTime<Utc>,

    pub data: Payload,
}

impl Task {
    /// Creates a task that is due immediately
    pub fn new(id: impl Into<String>, priority: f64, data: Payload) -> Self {
        let now = Utc::now();
        Task {
            id: id.into(),
            scheduled: now,
            priority,
            execute_after: now,
            data,
        }
    }

    /// Delays dispatch until `execute_after`
    pub fn execute_after(mut self, execute_after: DateTime<Utc>) -> Self {
        self.execute_after = execute_after;
        self
    }

    /// True once `execute_after` is no longer in the future relative to `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.execute_after <= now
    }

    /// Score of the task in the delayed set: `execute_after` in
    /// milliseconds, rounded up. A sweep bound rounded down to the
    /// millisecond then never reaches a task before it is due.
    pub fn delay_score(&self) -> f64 {
        let millis = self.execute_after.timestamp_millis();
        if self.execute_after.timestamp_subsec_nanos() % 1_000_000 == 0 {
            millis as f64
        } else {
            (millis + 1) as f64
        }
    }

    /// Wire form stored in the sets and the distribution log
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn decode(blob: &str) -> serde_json::Result<Self> {
        serde_json::from_str(blob)
    }
}

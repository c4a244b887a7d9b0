//! Progress stream payloads.
//!
//! Every event on the progress stream carries a JSON object. All fields
//! are optional: intermediate events usually carry only counts, the
//! terminal event carries `done: true` plus totals.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use bulkload_core::outcome::{FailedSample, ImportOutcome};

/// One decoded progress event.
///
/// Fields are read leniently: fractional and quoted counts are rounded,
/// `null` or any other unexpected shape reads as absent. A sloppy field
/// never costs the whole frame, and with it a terminal event.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressMessage {
    #[serde(default, deserialize_with = "lenient_count")]
    pub processed_count: Option<u64>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub total_count: Option<u64>,
    #[serde(default, deserialize_with = "lenient_flag")]
    pub done: bool,
    #[serde(default, deserialize_with = "lenient_count")]
    pub total_inserted: Option<u64>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub total_failed: Option<u64>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub failed_samples: Vec<Value>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub processing_time_ms: Option<u64>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub error: Option<String>,
}

fn lenient_count<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let number = match &value {
        Value::Number(n) => n.as_u64().map(|n| n as f64).or_else(|| n.as_f64()),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    Ok(number
        .filter(|n| n.is_finite() && *n >= 0.0)
        .map(|n| n.round() as u64))
}

fn lenient_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(b) => b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => s.trim().eq_ignore_ascii_case("true"),
        _ => false,
    })
}

fn lenient_list<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    })
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    })
}

/// What a message means for the job.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressUpdate {
    Progress {
        processed: Option<u64>,
        total: Option<u64>,
    },
    Finished(ImportOutcome),
    Failed(String),
}

impl ProgressMessage {
    pub fn decode(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }

    /// Interpret the message. `last_processed` is the most recent
    /// processed count seen on the channel, used when a terminal event
    /// reports neither `totalInserted` nor `processedCount`.
    pub fn interpret(self, last_processed: u64) -> ProgressUpdate {
        if !self.done {
            return ProgressUpdate::Progress {
                processed: self.processed_count,
                total: self.total_count,
            };
        }

        if let Some(error) = self.error.filter(|e| !e.trim().is_empty()) {
            return ProgressUpdate::Failed(error);
        }

        let success = self
            .total_inserted
            .or(self.processed_count)
            .unwrap_or(last_processed);
        let samples = self.failed_samples.into_iter().map(failed_sample).collect();

        ProgressUpdate::Finished(ImportOutcome::new(
            success,
            self.total_failed.unwrap_or(0),
            self.processing_time_ms.unwrap_or(0),
            samples,
        ))
    }
}

/// Services report failed records in a few shapes; accept any of them.
fn failed_sample(value: Value) -> FailedSample {
    let Value::Object(map) = &value else {
        return FailedSample {
            index: None,
            error: String::new(),
            record: value,
        };
    };

    let index = ["index", "row", "line"]
        .iter()
        .find_map(|k| map.get(*k).and_then(Value::as_u64));
    let error = ["error", "message", "reason"]
        .iter()
        .find_map(|k| map.get(*k).and_then(Value::as_str))
        .unwrap_or_default()
        .to_string();
    let record = ["record", "data", "item"]
        .iter()
        .find_map(|k| map.get(*k).cloned())
        .unwrap_or_else(|| value.clone());

    FailedSample {
        index,
        error,
        record,
    }
}

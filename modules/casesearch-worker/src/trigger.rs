//! What woke the controller up.
//!
//! Events arrive as JSON from the scheduler, the queue-depth alarm, or a
//! previous link of the worker chain:
//!
//! ```json
//! {"SCRAPE": true}
//! {"detail-type": "Scheduled Event"}
//! {"Records": [{"Sns": {"Message": "{\"AlarmName\": \"scraper-queue-alarm\"}"}}]}
//! ```

use serde_json::Value;

use casesearch_common::CaseSearchError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Periodic schedule tick.
    Scheduled,
    /// Queue-depth alarm notification.
    Alarm { name: String },
    /// Next link of the self-invoking worker chain.
    Worker,
}

impl Trigger {
    pub fn from_event(event: &Value) -> Result<Self, CaseSearchError> {
        if event.get("SCRAPE").and_then(Value::as_bool) == Some(true) {
            return Ok(Self::Worker);
        }

        if let Some(message) = event
            .pointer("/Records/0/Sns/Message")
            .and_then(Value::as_str)
        {
            let alarm: Value = serde_json::from_str(message)
                .map_err(|e| CaseSearchError::UnknownTrigger(format!("bad alarm message: {e}")))?;
            return match alarm.get("AlarmName").and_then(Value::as_str) {
                Some(name) => Ok(Self::Alarm {
                    name: name.to_string(),
                }),
                None => Err(CaseSearchError::UnknownTrigger(message.to_string())),
            };
        }

        if event.get("detail-type").and_then(Value::as_str) == Some("Scheduled Event") {
            return Ok(Self::Scheduled);
        }

        Err(CaseSearchError::UnknownTrigger(event.to_string()))
    }

    /// Parse a raw JSON event.
    pub fn parse(raw: &str) -> Result<Self, CaseSearchError> {
        let event: Value = serde_json::from_str(raw)
            .map_err(|e| CaseSearchError::UnknownTrigger(format!("invalid JSON: {e}")))?;
        Self::from_event(&event)
    }
}

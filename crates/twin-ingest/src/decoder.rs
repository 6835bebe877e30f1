//! Event decoding: raw frames to samples
//!
//! Everything here is pure. The caller supplies the processing time used for
//! properties without a `timestamp`.
//!
//! Accepted payload shapes, tried in order:
//!
//! - direct: `{"thingId": "...", "features": {...}}`
//! - wrapped: `{"value": {"thingId": "...", "features": {...}}}`
//!
//! Either may arrive inside a protocol envelope `{"topic": "...", "value": ...}`,
//! in which case the envelope's `value` is the payload.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;
use twin_core::{Frame, PropertyValue, Sample, SUBSCRIPTION_ACK_PREFIX};

/// Topic suffix of an ordinary twin merge event
pub const MERGED_TOPIC_SUFFIX: &str = "/things/twin/events/merged";

/// What a frame turned into
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// Not a text frame
    Ignored,
    /// Subscription acknowledgment echoed by the backend
    Acknowledged,
    /// Text that matches none of the payload shapes
    Malformed(String),
    /// A decoded entity event
    Event(DecodedEvent),
}

impl FrameOutcome {
    /// Samples carried by the frame, empty unless it was an event
    pub fn into_samples(self) -> Vec<Sample> {
        match self {
            FrameOutcome::Event(event) => event.samples,
            _ => Vec::new(),
        }
    }
}

/// One entity's worth of samples
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub entity_id: String,
    /// Protocol topic, when the frame came in a topic envelope
    pub topic: Option<String>,
    pub samples: Vec<Sample>,
}

impl DecodedEvent {
    /// Whether this is an ordinary merge event (or carried no topic at all)
    pub fn is_merge(&self) -> bool {
        self.topic
            .as_deref()
            .map_or(true, |t| t.ends_with(MERGED_TOPIC_SUFFIX))
    }
}

#[derive(Debug, Deserialize)]
struct DirectEnvelope {
    #[serde(rename = "thingId")]
    thing_id: String,
    #[serde(default)]
    features: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct WrappedEnvelope {
    value: DirectEnvelope,
}

/// Decode one inbound frame.
pub fn decode_frame(frame: &Frame, now: DateTime<Utc>) -> FrameOutcome {
    match frame {
        Frame::Text(text) => decode_text(text, now),
        _ => FrameOutcome::Ignored,
    }
}

/// Decode a text frame.
///
/// ```
/// # use twin_ingest::decoder::decode_text;
/// let now = chrono::Utc::now();
/// let samples = decode_text(
///     r#"{"thingId":"t1","features":{"temp":{"properties":{"value":42}}}}"#,
///     now,
/// )
/// .into_samples();
/// assert_eq!(samples.len(), 1);
/// assert_eq!(samples[0].value, 42.0);
/// assert_eq!(samples[0].timestamp, now);
/// ```
pub fn decode_text(text: &str, now: DateTime<Utc>) -> FrameOutcome {
    if text.starts_with(SUBSCRIPTION_ACK_PREFIX) {
        return FrameOutcome::Acknowledged;
    }

    let json: Value = match serde_json::from_str(text) {
        Ok(json) => json,
        Err(e) => return FrameOutcome::Malformed(format!("not JSON: {}", e)),
    };

    let (topic, payload) = split_topic_envelope(json);

    let envelope = match serde_json::from_value::<DirectEnvelope>(payload.clone()) {
        Ok(direct) => direct,
        Err(direct_err) => match serde_json::from_value::<WrappedEnvelope>(payload) {
            Ok(wrapped) => wrapped.value,
            Err(_) => {
                return FrameOutcome::Malformed(format!("no entity envelope: {}", direct_err))
            }
        },
    };

    let samples = envelope
        .features
        .unwrap_or_default()
        .iter()
        .filter_map(|(name, feature)| feature_sample(&envelope.thing_id, name, feature, now))
        .collect();

    FrameOutcome::Event(DecodedEvent {
        entity_id: envelope.thing_id,
        topic,
        samples,
    })
}

/// Unwrap `{"topic": string, "value": any}`; anything else is its own payload.
fn split_topic_envelope(json: Value) -> (Option<String>, Value) {
    if let Value::Object(mut obj) = json {
        let is_envelope = obj.get("topic").is_some_and(Value::is_string) && obj.contains_key("value");
        if is_envelope {
            let topic = obj.remove("topic").and_then(|t| t.as_str().map(str::to_string));
            let value = obj.remove("value").unwrap_or(Value::Null);
            return (topic, value);
        }
        return (None, Value::Object(obj));
    }
    (None, json)
}

fn feature_sample(
    entity_id: &str,
    name: &str,
    feature: &Value,
    now: DateTime<Utc>,
) -> Option<Sample> {
    let properties = feature.get("properties")?.as_object()?;
    let raw = properties.get("value")?;

    let value = match PropertyValue::from(raw).to_f64() {
        Ok(v) => v,
        Err(e) => {
            debug!(entity = entity_id, feature = name, error = %e, "Skipping feature");
            return None;
        }
    };

    let timestamp = properties
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(now);

    Some(Sample::new(entity_id, name, value, timestamp))
}

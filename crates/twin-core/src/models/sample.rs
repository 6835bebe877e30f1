//! Time-series sample model

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One numeric reading of one feature of one entity.
///
/// Built by the event decoder, consumed once by a sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub entity_id: String,
    pub feature: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    pub fn new(
        entity_id: impl Into<String>,
        feature: impl Into<String>,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            feature: feature.into(),
            value,
            timestamp,
        }
    }
}

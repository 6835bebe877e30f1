//! TimeSeriesSink trait - the write contract for decoded samples

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SinkResult;
use crate::models::Sample;

/// Persists samples as time-series points.
///
/// One call writes one point tagged `device_id` and `feature_name` with a
/// single numeric `value` field. No batching, no retry: failures are returned
/// to the caller, which logs them and carries on.
#[async_trait]
pub trait TimeSeriesSink: Send + Sync {
    async fn write(&self, sample: &Sample) -> SinkResult<()>;
}

#[async_trait]
impl<T: TimeSeriesSink + ?Sized> TimeSeriesSink for Arc<T> {
    async fn write(&self, sample: &Sample) -> SinkResult<()> {
        (**self).write(sample).await
    }
}

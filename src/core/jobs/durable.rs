use crate::core::error::AppError;
use serde_json::{Map, Value};
use std::future::Future;

/// Progress flags kept in a durable job's payload. A retried firing skips the
/// sub-steps whose flag is already set.
pub struct DurableProgress<'a> {
    payload: &'a mut Value,
}

impl<'a> DurableProgress<'a> {
    pub fn new(payload: &'a mut Value) -> Self {
        if !payload.is_object() {
            *payload = Value::Object(Map::new());
        }
        Self { payload }
    }

    pub fn is_done(&self, flag: &str) -> bool {
        self.payload
            .get(flag)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn mark(&mut self, flag: &str) {
        if let Some(map) = self.payload.as_object_mut() {
            map.insert(flag.to_string(), Value::Bool(true));
        }
    }

    /// Run `work` unless `flag` is set, then set it. Returns whether `work` ran.
    pub async fn step<F, Fut>(&mut self, flag: &str, work: F) -> Result<bool, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), AppError>>,
    {
        if self.is_done(flag) {
            tracing::debug!(flag, "durable sub-step already done, skipping");
            return Ok(false);
        }
        work().await?;
        self.mark(flag);
        Ok(true)
    }
}

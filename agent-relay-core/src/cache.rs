//! Memoization of dispatch results
//!
//! Identical `(agent_type, operation_name, input_data)` tuples dispatched
//! within the cache window share one execution. The key is a SHA-256 digest
//! of the canonical JSON encoding of the tuple, so key order inside
//! `input_data` does not matter. Only successful results are stored, and
//! concurrent callers with the same key wait on a single in-flight dispatch.

use crate::task::{InputData, TaskResult};
use crate::{Error, Result};
use moka::future::Cache;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Why a dispatch result was not cached
#[derive(Debug)]
enum Uncached {
    Failed(TaskResult),
    Error(Error),
}

/// TTL-bounded result cache
#[derive(Clone)]
pub struct ResultCache {
    inner: Cache<String, TaskResult>,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(ttl: Duration, max_capacity: u64) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();
        Self { inner, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Content hash of a dispatch tuple
    pub fn key(agent_type: &str, operation_name: &str, input_data: &InputData) -> String {
        let mut canonical = String::new();
        write_canonical(&Value::String(agent_type.to_string()), &mut canonical);
        canonical.push('\n');
        write_canonical(&Value::String(operation_name.to_string()), &mut canonical);
        canonical.push('\n');
        write_canonical(&Value::Object(input_data.clone()), &mut canonical);

        let digest = Sha256::digest(canonical.as_bytes());
        let mut key = String::with_capacity(64);
        for byte in digest.iter() {
            let _ = write!(key, "{:02x}", byte);
        }
        key
    }

    pub async fn get(&self, key: &str) -> Option<TaskResult> {
        self.inner.get(key).await
    }

    /// Return the cached result for `key`, or run `dispatch` and cache its
    /// result if it succeeded
    pub async fn get_or_dispatch<F>(&self, key: String, dispatch: F) -> Result<TaskResult>
    where
        F: Future<Output = Result<TaskResult>>,
    {
        let outcome = self
            .inner
            .try_get_with(key.clone(), async move {
                match dispatch.await {
                    Ok(result) if result.success => Ok(result),
                    Ok(result) => Err(Uncached::Failed(result)),
                    Err(e) => Err(Uncached::Error(e)),
                }
            })
            .await;

        match outcome {
            Ok(result) => {
                debug!(cache_key = %key, task_id = %result.task_id, "Cached dispatch result");
                Ok(result)
            }
            Err(uncached) => match uncached.as_ref() {
                Uncached::Failed(result) => Ok(result.clone()),
                Uncached::Error(e) => Err(e.clone()),
            },
        }
    }

    pub async fn invalidate(&self, key: &str) {
        self.inner.invalidate(key).await;
    }

    pub fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }

    pub async fn entry_count(&self) -> u64 {
        self.inner.run_pending_tasks().await;
        self.inner.entry_count()
    }
}

/// JSON with object keys sorted at every level
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ErrorKind;
    use serde_json::{json, Map};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use uuid::Uuid;

    fn input(value: Value) -> InputData {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_key_ignores_field_order() {
        let mut first = Map::new();
        first.insert("ticker".into(), json!("AAPL"));
        first.insert("period".into(), json!({"from": 2020, "to": 2024}));

        let mut second = Map::new();
        second.insert("period".into(), json!({"to": 2024, "from": 2020}));
        second.insert("ticker".into(), json!("AAPL"));

        assert_eq!(
            ResultCache::key("dd", "business_overview", &first),
            ResultCache::key("dd", "business_overview", &second)
        );
    }

    #[test]
    fn test_key_distinguishes_tuple_members() {
        let data = input(json!({"ticker": "AAPL"}));
        let base = ResultCache::key("dd", "business_overview", &data);
        assert_eq!(base.len(), 64);
        assert_ne!(base, ResultCache::key("risk", "business_overview", &data));
        assert_ne!(base, ResultCache::key("dd", "risk_assessment", &data));
        assert_ne!(
            base,
            ResultCache::key("dd", "business_overview", &input(json!({"ticker": "MSFT"})))
        );
    }

    #[tokio::test]
    async fn test_only_successful_results_are_cached() {
        let cache = ResultCache::new(Duration::from_secs(60), 100);
        let calls = Arc::new(AtomicUsize::new(0));
        let id = Uuid::new_v4();

        for _ in 0..2 {
            let calls = calls.clone();
            let result = cache
                .get_or_dispatch("failing".to_string(), async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(TaskResult::failure(id, "dd", ErrorKind::Handler, "boom", Duration::ZERO))
                })
                .await
                .unwrap();
            assert!(!result.success);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        for _ in 0..2 {
            let calls = calls.clone();
            cache
                .get_or_dispatch("ok".to_string(), async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(TaskResult::success(id, "dd", json!({}), Duration::ZERO))
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.entry_count().await, 1);
    }

    #[tokio::test]
    async fn test_errors_propagate_uncached() {
        let cache = ResultCache::new(Duration::from_secs(60), 100);
        let err = cache
            .get_or_dispatch("down".to_string(), async { Err(Error::broker("unreachable")) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Broker { .. }));
        assert!(cache.get("down").await.is_none());
    }
}

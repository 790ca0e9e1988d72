//! Batch driver shared by the fetch pipelines.

use std::collections::HashMap;
use std::future::Future;

use futures::{StreamExt, stream};

/// Run `run` over every key with at most `concurrency` fetches in flight,
/// collecting results into a map. The map always holds one entry per
/// distinct input key; a failed fetch maps to `None`. Duplicate keys
/// collapse into one map entry but are each fetched.
pub(crate) async fn collect_keyed<T, F, Fut>(
    keys: &[String],
    concurrency: usize,
    run: F,
) -> HashMap<String, Option<T>>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Option<T>>,
{
    stream::iter(keys.iter().cloned())
        .map(|key| {
            let result = run(key.clone());
            async move { (key, result.await) }
        })
        .buffered(concurrency.max(1))
        .collect()
        .await
}

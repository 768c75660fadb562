//! Single-flight coordination.
//!
//! Collapses concurrent calls for the same string key onto one producer.
//! The producer is spawned as a detached task, so it runs to completion even
//! if every waiter abandons the wait; waiters share the producer's result
//! through a watch channel. A key is released (removed from the table)
//! before its result is published, so the next call for the key starts a
//! fresh producer generation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::debug;

use crate::error::Error;

type Outcome<T> = Option<Result<T, Error>>;

/// A table of in-flight calls keyed by string.
pub struct Group<T> {
    calls: Arc<Mutex<HashMap<String, watch::Receiver<Outcome<T>>>>>,
}

impl<T> Default for Group<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Group<T> {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T> Group<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Run `producer` for `key`, or join the producer already running for it.
    ///
    /// All callers observe the same result. Dropping the returned future
    /// abandons the wait only; the producer keeps running and its result is
    /// still delivered to the remaining waiters.
    pub async fn run<F>(&self, key: &str, producer: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>> + Send + 'static,
    {
        let mut rx = {
            let mut calls = self.calls.lock().expect("flight table poisoned");

            if let Some(rx) = calls.get(key) {
                debug!(key, "joining in-flight call");
                rx.clone()
            } else {
                let (tx, rx) = watch::channel(None);
                calls.insert(key.to_string(), rx.clone());

                let calls = Arc::clone(&self.calls);
                let key = key.to_string();

                tokio::spawn(async move {
                    // The inner spawn isolates producer panics: they surface
                    // as a join error here instead of unwinding the caller.
                    let result = match tokio::spawn(producer).await {
                        Ok(result) => result,
                        Err(err) if err.is_panic() => {
                            Err(Error::internal(format!("producer for {key:?} panicked")))
                        }
                        Err(_) => Err(Error::internal(format!("producer for {key:?} aborted"))),
                    };

                    calls.lock().expect("flight table poisoned").remove(&key);
                    let _ = tx.send(Some(result));
                });

                rx
            }
        };

        loop {
            if let Some(result) = rx.borrow_and_update().clone() {
                return result;
            }

            if rx.changed().await.is_err() {
                return Err(Error::internal(
                    "single-flight producer dropped without publishing",
                ));
            }
        }
    }
}

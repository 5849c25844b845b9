use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use futures::future::{self, Either};

use super::ProviderError;

type InFlight = Arc<StdMutex<HashMap<String, usize>>>;

/// Per-key in-flight counter with optional single-flight rejection.
///
/// Keys in the single-flight set admit one call at a time; a second call
/// while the first is outstanding fails with
/// [`ProviderError::PendingRequestExists`]. Other keys are only counted.
#[derive(Debug, Clone, Default)]
pub struct DedupeLimiter {
    single_flight: Arc<HashSet<String>>,
    in_flight: InFlight,
}

impl DedupeLimiter {
    pub fn new<I, S>(single_flight: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            single_flight: Arc::new(single_flight.into_iter().map(Into::into).collect()),
            in_flight: Arc::default(),
        }
    }

    /// Admits one call for `key`. The returned guard holds the slot until it
    /// is dropped.
    pub fn acquire(&self, key: &str) -> Result<InFlightGuard, ProviderError> {
        let mut counters = self.in_flight.lock().expect("dedupe mutex poisoned");
        if self.single_flight.contains(key) && counters.contains_key(key) {
            tracing::debug!(method = key, "rejecting duplicate single-flight request");
            return Err(ProviderError::PendingRequestExists {
                method: key.to_string(),
            });
        }
        *counters.entry(key.to_string()).or_insert(0) += 1;
        Ok(InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            key: key.to_string(),
        })
    }

    /// Runs `deferred` under an admission slot for `key`.
    ///
    /// Admission and the call to `deferred` both happen before this returns;
    /// the slot is released when the returned future completes or is dropped.
    pub fn call<T, F, Fut>(
        &self,
        key: &str,
        deferred: F,
    ) -> impl Future<Output = Result<T, ProviderError>> + use<T, F, Fut>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        match self.acquire(key) {
            Err(err) => Either::Left(future::ready(Err(err))),
            Ok(guard) => {
                let pending = deferred();
                Either::Right(async move {
                    let _guard = guard;
                    pending.await
                })
            }
        }
    }

    #[must_use]
    pub fn in_flight(&self, key: &str) -> usize {
        self.in_flight
            .lock()
            .expect("dedupe mutex poisoned")
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.in_flight
            .lock()
            .expect("dedupe mutex poisoned")
            .is_empty()
    }

    #[must_use]
    pub fn is_single_flight(&self, key: &str) -> bool {
        self.single_flight.contains(key)
    }
}

/// Admission slot; dropping it decrements the key's counter and removes the
/// key once it reaches zero.
#[derive(Debug)]
#[must_use = "dropping the guard releases the in-flight slot immediately"]
pub struct InFlightGuard {
    in_flight: InFlight,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let Ok(mut counters) = self.in_flight.lock() else {
            return;
        };
        if let Some(count) = counters.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                counters.remove(&self.key);
            }
        }
    }
}

//! Keyed duplicate suppression for in-flight work.
//!
//! A [`Group`] collapses concurrent calls that share a key into a single
//! execution: the first caller runs the work, every caller that arrives while
//! it is in flight waits for and receives the same result. Once the work
//! completes the key is forgotten, so later calls execute again.
//!
//! The work itself runs on a detached task. A caller that goes away mid-wait
//! abandons the result without interrupting the flight, which other callers
//! may still be waiting on.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

/// Marker error substituted when a flight terminates without producing a
/// result. This only happens when the executing task dies unexpectedly.
#[derive(Debug, Clone, Copy, Default)]
pub struct Interrupted;

type Flights<T, E> = Mutex<HashMap<String, watch::Receiver<Option<Result<T, E>>>>>;

/// A namespace of keyed in-flight calls.
#[derive(Clone)]
pub struct Group<T, E> {
    flights: Arc<Flights<T, E>>,
}

impl<T, E> Default for Group<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Group<T, E> {
    pub fn new() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T, E> Group<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + From<Interrupted> + 'static,
{
    /// Run `work` under the given key, suppressing duplicates.
    ///
    /// If a call with the same key is already in flight, this waits for it
    /// and returns its result instead of executing `work`.
    pub async fn work<F>(&self, key: &str, work: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let mut rx = {
            let mut flights = self
                .flights
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match flights.get(key) {
                Some(rx) => rx.clone(),
                None => {
                    let (tx, rx) = watch::channel(None);
                    flights.insert(key.to_string(), rx.clone());
                    let map = Arc::clone(&self.flights);
                    let key = key.to_string();
                    tokio::spawn(async move {
                        let result = work.await;
                        // Forget the key before broadcasting so that calls
                        // arriving after completion start a fresh flight.
                        map.lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(&key);
                        let _ = tx.send(Some(result));
                    });
                    rx
                }
            }
        };
        loop {
            if let Some(result) = rx.borrow_and_update().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                return Err(E::from(Interrupted));
            }
        }
    }
}

// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Result distribution between query executors (producers) and service
//! nodes (consumers). Each query gets its own durable channel; delivery is
//! at-least-once with manual per-result acknowledgement, so a result is
//! never silently lost and a stopped consumer cleanly returns in-flight
//! messages to the channel.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod local;

pub use local::LocalQueryResultsManager;

/// Consumer's verdict on one received result. `Nack` requeues the message
/// for redelivery; `Ack` retires it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Acknowledgement {
    Ack,
    Nack,
}

struct AckSlot {
    decision: Option<Acknowledgement>,
    on_decide: Option<Box<dyn FnOnce(Acknowledgement) + Send>>,
}

struct AckState {
    mu: Mutex<AckSlot>,
    cv: Condvar,
}

/// One-shot acknowledgement contract for exactly one received result.
///
/// The first `signal` wins; later signals are no-ops. The broker side
/// either blocks in [`AcknowledgementCallback::wait`] or registers an
/// `on_decide` hook that fires once, outside the internal lock.
#[derive(Clone)]
pub struct AcknowledgementCallback {
    state: Arc<AckState>,
}

impl AcknowledgementCallback {
    pub fn new<F>(on_decide: F) -> Self
    where
        F: FnOnce(Acknowledgement) + Send + 'static,
    {
        Self {
            state: Arc::new(AckState {
                mu: Mutex::new(AckSlot {
                    decision: None,
                    on_decide: Some(Box::new(on_decide)),
                }),
                cv: Condvar::new(),
            }),
        }
    }

    /// A callback with no broker-side hook; `wait` is the only observer.
    pub fn detached() -> Self {
        Self {
            state: Arc::new(AckState {
                mu: Mutex::new(AckSlot {
                    decision: None,
                    on_decide: None,
                }),
                cv: Condvar::new(),
            }),
        }
    }

    /// Record the decision. Returns false when a decision already exists.
    pub fn signal(&self, ack: Acknowledgement) -> bool {
        let hook = {
            let mut slot = self.state.mu.lock().expect("ack slot");
            if slot.decision.is_some() {
                return false;
            }
            slot.decision = Some(ack);
            self.state.cv.notify_all();
            slot.on_decide.take()
        };
        if let Some(hook) = hook {
            hook(ack);
        }
        true
    }

    pub fn decision(&self) -> Option<Acknowledgement> {
        self.state.mu.lock().expect("ack slot").decision
    }

    /// Block up to `timeout` for the consumer's decision.
    pub fn wait(&self, timeout: Duration) -> Option<Acknowledgement> {
        let deadline = std::time::Instant::now() + timeout;
        let mut slot = self.state.mu.lock().expect("ack slot");
        loop {
            if let Some(decision) = slot.decision {
                return Some(decision);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .state
                .cv
                .wait_timeout(slot, deadline - now)
                .expect("ack wait");
            slot = guard;
        }
    }
}

/// Wire form of one result page: opaque payload plus its identifier. This
/// is what publishers hand to the channel and what the channel stores.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub id: String,
    pub payload: serde_json::Value,
}

impl ResultMessage {
    pub fn new(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

/// A received result with its attached acknowledgement, consumed once.
/// After the acknowledgement is signaled the envelope is retired. Dropping
/// an envelope that was never acknowledged nacks it, so a consumer that
/// crashes or forgets cannot silently lose a delivered result.
pub struct QueryResult {
    message: ResultMessage,
    callback: Option<AcknowledgementCallback>,
}

impl QueryResult {
    pub fn new(message: ResultMessage, callback: AcknowledgementCallback) -> Self {
        Self {
            message,
            callback: Some(callback),
        }
    }

    pub fn id(&self) -> &str {
        &self.message.id
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.message.payload
    }

    pub fn message(&self) -> &ResultMessage {
        &self.message
    }

    /// Signal the acknowledgement decision. Returns false when the envelope
    /// was already retired.
    pub fn acknowledge(&mut self, ack: Acknowledgement) -> bool {
        match self.callback.take() {
            Some(callback) => callback.signal(ack),
            None => false,
        }
    }
}

impl Drop for QueryResult {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback.signal(Acknowledgement::Nack);
        }
    }
}

/// Per-query producer handle. One publish attempt per call: serialize, send
/// tagged with a fresh correlation id, block until the broker confirms that
/// message or the timeout elapses. True only on positive confirmation;
/// retry policy belongs to the caller.
pub trait QueryResultsPublisher: Send + Sync {
    fn publish(&self, message: ResultMessage, timeout: Duration) -> bool;
}

/// Per-query consumer handle with manual flow control. Buffers received
/// messages locally; backpressure is the caller's job via `receive`.
pub trait QueryResultsListener: Send + Sync {
    fn listener_id(&self) -> &str;

    fn query_id(&self) -> &str;

    /// Non-blocking check for buffered results.
    fn has_results(&self) -> bool;

    /// Block up to `timeout` for the next buffered result. `None` on
    /// timeout or interruption, never a partial value.
    fn receive(&self, timeout: Duration) -> Option<QueryResult>;

    /// Stop receiving and nack (requeue) everything still buffered so it
    /// becomes available to another listener. Idempotent; safe to call
    /// concurrently with `receive` and in-flight acknowledgements.
    fn close(&self);
}

/// Factory for per-query publishers and listeners, and owner of the
/// underlying channels (create-if-absent, purge, delete, depth query).
pub trait QueryResultsManager: Send + Sync {
    /// Create a listener bound to a query's channel, creating the channel
    /// if absent. The listener id is distinct from the query id so a
    /// channel can outlive a replaced listener.
    fn create_listener(&self, listener_id: &str, query_id: &str) -> Box<dyn QueryResultsListener>;

    /// Create a publisher for a query, creating the channel if absent.
    fn create_publisher(&self, query_id: &str) -> Box<dyn QueryResultsPublisher>;

    /// Remove the channel. Best-effort: failures are logged, not fatal. A
    /// missing channel only means no more results can flow.
    fn delete_query(&self, query_id: &str);

    /// Purge buffered, undelivered messages without deleting the channel.
    fn empty_query(&self, query_id: &str);

    /// Approximate channel depth; -1 when unknown. Never exact.
    fn num_results_remaining(&self, query_id: &str) -> i64;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    #[test]
    fn first_signal_wins_and_hook_fires_once() {
        let fired = Arc::new(AtomicU32::new(0));
        let fired_in_hook = Arc::clone(&fired);
        let callback = AcknowledgementCallback::new(move |ack| {
            assert_eq!(ack, Acknowledgement::Nack);
            fired_in_hook.fetch_add(1, Ordering::SeqCst);
        });

        assert!(callback.signal(Acknowledgement::Nack));
        assert!(!callback.signal(Acknowledgement::Ack));
        assert_eq!(callback.decision(), Some(Acknowledgement::Nack));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wait_blocks_until_signaled() {
        let callback = AcknowledgementCallback::detached();
        let waiter = callback.clone();
        let handle = thread::spawn(move || waiter.wait(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(30));
        assert!(callback.signal(Acknowledgement::Ack));
        assert_eq!(handle.join().expect("join"), Some(Acknowledgement::Ack));
    }

    #[test]
    fn wait_times_out_without_decision() {
        let callback = AcknowledgementCallback::detached();
        assert_eq!(callback.wait(Duration::from_millis(50)), None);
    }

    #[test]
    fn dropping_an_unacked_envelope_nacks_it() {
        let callback = AcknowledgementCallback::detached();
        let result = QueryResult::new(
            ResultMessage::new("r1", serde_json::json!({"page": 1})),
            callback.clone(),
        );
        assert_eq!(callback.decision(), None);
        drop(result);
        assert_eq!(callback.decision(), Some(Acknowledgement::Nack));
    }

    #[test]
    fn dropping_an_acked_envelope_keeps_the_decision() {
        let callback = AcknowledgementCallback::detached();
        let mut result = QueryResult::new(
            ResultMessage::new("r1", serde_json::json!({"page": 1})),
            callback.clone(),
        );
        assert!(result.acknowledge(Acknowledgement::Ack));
        drop(result);
        assert_eq!(callback.decision(), Some(Acknowledgement::Ack));
    }

    #[test]
    fn retired_envelope_ignores_further_acks() {
        let message = ResultMessage::new("r1", serde_json::json!({"page": 1}));
        let mut result = QueryResult::new(message, AcknowledgementCallback::detached());
        assert_eq!(result.id(), "r1");
        assert!(result.acknowledge(Acknowledgement::Ack));
        assert!(!result.acknowledge(Acknowledgement::Nack));
    }
}

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

//! In-process result channels. One durable (process-lifetime) channel per
//! query id; publishers get per-message confirmation, listeners get
//! buffered receive with manual ack and requeue-on-nack. A broker-backed
//! manager implements the same traits for multi-node deployments.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::common::logging::{debug, info, warn};
use crate::messaging::{
    Acknowledgement, AcknowledgementCallback, QueryResult, QueryResultsListener,
    QueryResultsManager, QueryResultsPublisher, ResultMessage,
};

/// When a channel confirms stored messages back to the publisher. The
/// in-process channel stores synchronously, so `Immediate` is the only
/// production value; the others exercise confirmation-timeout behavior.
#[derive(Clone, Copy, Debug)]
enum ConfirmPolicy {
    Immediate,
    #[allow(dead_code)]
    Delayed(Duration),
    #[allow(dead_code)]
    Never,
}

/// Single-shot publish confirmation: completed at most once, waited on by
/// exactly one publisher call.
#[derive(Clone)]
struct ConfirmCell {
    shared: Arc<(Mutex<Option<bool>>, Condvar)>,
}

impl ConfirmCell {
    fn new() -> Self {
        Self {
            shared: Arc::new((Mutex::new(None), Condvar::new())),
        }
    }

    fn complete(&self, ok: bool) {
        let (mu, cv) = &*self.shared;
        let mut slot = mu.lock().expect("confirm cell");
        if slot.is_none() {
            *slot = Some(ok);
            cv.notify_all();
        }
    }

    fn wait(&self, timeout: Duration) -> Option<bool> {
        let deadline = Instant::now() + timeout;
        let (mu, cv) = &*self.shared;
        let mut slot = mu.lock().expect("confirm cell");
        loop {
            if let Some(ok) = *slot {
                return Some(ok);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = cv
                .wait_timeout(slot, deadline - now)
                .expect("confirm wait");
            slot = guard;
        }
    }
}

struct ChannelState {
    queue: VecDeque<ResultMessage>,
    deleted: bool,
}

/// One per-query channel: the undelivered backlog plus a deleted marker.
/// Multi-writer/multi-reader by design; safety comes from per-message
/// acknowledgement, not mutual exclusion.
struct Channel {
    query_id: String,
    mu: Mutex<ChannelState>,
    cv: Condvar,
    confirm_policy: ConfirmPolicy,
}

impl Channel {
    fn new(query_id: &str) -> Arc<Self> {
        Self::with_policy(query_id, ConfirmPolicy::Immediate)
    }

    fn with_policy(query_id: &str, confirm_policy: ConfirmPolicy) -> Arc<Self> {
        Arc::new(Self {
            query_id: query_id.to_string(),
            mu: Mutex::new(ChannelState {
                queue: VecDeque::new(),
                deleted: false,
            }),
            cv: Condvar::new(),
            confirm_policy,
        })
    }

    /// Store a message and schedule its confirmation. A deleted channel
    /// confirms negatively right away.
    fn send(&self, message: ResultMessage, confirm: ConfirmCell) {
        {
            let mut state = self.mu.lock().expect("channel");
            if state.deleted {
                drop(state);
                confirm.complete(false);
                return;
            }
            state.queue.push_back(message);
            self.cv.notify_all();
        }
        match self.confirm_policy {
            ConfirmPolicy::Immediate => confirm.complete(true),
            ConfirmPolicy::Delayed(delay) => {
                thread::spawn(move || {
                    thread::sleep(delay);
                    confirm.complete(true);
                });
            }
            ConfirmPolicy::Never => {}
        }
    }

    /// Return a nacked message to the head of the backlog so it is the
    /// next one redelivered.
    fn requeue_front(&self, message: ResultMessage) {
        let mut state = self.mu.lock().expect("channel");
        if state.deleted {
            debug!(
                "dropping nacked result {} for deleted channel {}",
                message.id, self.query_id
            );
            return;
        }
        state.queue.push_front(message);
        self.cv.notify_all();
    }

    /// Next undelivered message; blocks until one arrives, the listener is
    /// stopped, or the channel is deleted.
    fn receive_next(&self, stop: &AtomicBool) -> Option<ResultMessage> {
        let mut state = self.mu.lock().expect("channel");
        loop {
            if stop.load(Ordering::Acquire) || state.deleted {
                return None;
            }
            if let Some(message) = state.queue.pop_front() {
                return Some(message);
            }
            state = self.cv.wait(state).expect("channel wait");
        }
    }

    fn purge(&self) -> usize {
        let mut state = self.mu.lock().expect("channel");
        let purged = state.queue.len();
        state.queue.clear();
        purged
    }

    fn mark_deleted(&self) {
        let mut state = self.mu.lock().expect("channel");
        state.deleted = true;
        state.queue.clear();
        self.cv.notify_all();
    }

    fn wake_all(&self) {
        let _state = self.mu.lock().expect("channel");
        self.cv.notify_all();
    }

    fn depth(&self) -> usize {
        self.mu.lock().expect("channel").queue.len()
    }
}

struct Buffer {
    mu: Mutex<VecDeque<QueryResult>>,
    cv: Condvar,
}

impl Buffer {
    fn new() -> Self {
        Self {
            mu: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
        }
    }
}

/// Consumer handle over one channel. A delivery thread moves messages from
/// the channel into an unbounded local buffer, each wrapped with a one-shot
/// callback that requeues on nack.
pub struct LocalQueryResultsListener {
    listener_id: String,
    query_id: String,
    channel: Arc<Channel>,
    buffer: Arc<Buffer>,
    stop: Arc<AtomicBool>,
    closed: AtomicBool,
    delivery: Mutex<Option<thread::JoinHandle<()>>>,
}

impl LocalQueryResultsListener {
    fn start(listener_id: &str, query_id: &str, channel: Arc<Channel>) -> Self {
        let buffer = Arc::new(Buffer::new());
        let stop = Arc::new(AtomicBool::new(false));

        let delivery_channel = Arc::clone(&channel);
        let delivery_buffer = Arc::clone(&buffer);
        let delivery_stop = Arc::clone(&stop);
        let id = listener_id.to_string();
        let handle = thread::spawn(move || {
            while let Some(message) = delivery_channel.receive_next(&delivery_stop) {
                debug!("listener {} got result {}", id, message.id);
                let requeue_channel = Arc::clone(&delivery_channel);
                let requeue_message = message.clone();
                let callback = AcknowledgementCallback::new(move |ack| {
                    if ack == Acknowledgement::Nack {
                        requeue_channel.requeue_front(requeue_message);
                    }
                });
                let mut queue = delivery_buffer.mu.lock().expect("listener buffer");
                queue.push_back(QueryResult::new(message, callback));
                delivery_buffer.cv.notify_all();
            }
        });

        Self {
            listener_id: listener_id.to_string(),
            query_id: query_id.to_string(),
            channel,
            buffer,
            stop,
            closed: AtomicBool::new(false),
            delivery: Mutex::new(Some(handle)),
        }
    }
}

impl QueryResultsListener for LocalQueryResultsListener {
    fn listener_id(&self) -> &str {
        &self.listener_id
    }

    fn query_id(&self) -> &str {
        &self.query_id
    }

    fn has_results(&self) -> bool {
        !self.buffer.mu.lock().expect("listener buffer").is_empty()
    }

    fn receive(&self, timeout: Duration) -> Option<QueryResult> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.buffer.mu.lock().expect("listener buffer");
        loop {
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            if let Some(result) = queue.pop_front() {
                return Some(result);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .buffer
                .cv
                .wait_timeout(queue, deadline - now)
                .expect("listener wait");
            queue = guard;
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop.store(true, Ordering::Release);
        self.channel.wake_all();
        let handle = self.delivery.lock().expect("delivery handle").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }

        // Everything buffered but unconsumed goes back to the channel for
        // another listener.
        let drained: Vec<QueryResult> = {
            let mut queue = self.buffer.mu.lock().expect("listener buffer");
            let drained = queue.drain(..).collect();
            self.buffer.cv.notify_all();
            drained
        };
        let requeued = drained.len();
        // Nack back-to-front: each nack lands at the head of the channel, so
        // reverse iteration reconstructs the original delivery order.
        for mut result in drained.into_iter().rev() {
            result.acknowledge(Acknowledgement::Nack);
        }
        if requeued > 0 {
            info!(
                "listener {} closed with {} unconsumed results requeued for query {}",
                self.listener_id, requeued, self.query_id
            );
        }
    }
}

impl Drop for LocalQueryResultsListener {
    fn drop(&mut self) {
        self.close();
    }
}

/// Producer handle over one channel. Keeps a bounded map of outstanding
/// correlation-id entries, removed on completion either way.
pub struct LocalQueryResultsPublisher {
    query_id: String,
    channel: Arc<Channel>,
    outstanding: Mutex<HashMap<u64, ConfirmCell>>,
    next_correlation: AtomicU64,
}

impl LocalQueryResultsPublisher {
    fn new(query_id: &str, channel: Arc<Channel>) -> Self {
        Self {
            query_id: query_id.to_string(),
            channel,
            outstanding: Mutex::new(HashMap::new()),
            next_correlation: AtomicU64::new(0),
        }
    }

    #[cfg(test)]
    fn num_outstanding(&self) -> usize {
        self.outstanding.lock().expect("outstanding confirms").len()
    }
}

impl QueryResultsPublisher for LocalQueryResultsPublisher {
    fn publish(&self, message: ResultMessage, timeout: Duration) -> bool {
        let correlation_id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let confirm = ConfirmCell::new();
        self.outstanding
            .lock()
            .expect("outstanding confirms")
            .insert(correlation_id, confirm.clone());

        debug!(
            "publishing result {} (correlation {}) to query {}",
            message.id, correlation_id, self.query_id
        );
        self.channel.send(message, confirm.clone());
        let confirmed = confirm.wait(timeout).unwrap_or(false);

        self.outstanding
            .lock()
            .expect("outstanding confirms")
            .remove(&correlation_id);
        if !confirmed {
            warn!(
                "publish of correlation {} to query {} was not confirmed within {:?}",
                correlation_id, self.query_id, timeout
            );
        }
        confirmed
    }
}

/// In-process implementation of the per-query result channel factory.
#[derive(Default)]
pub struct LocalQueryResultsManager {
    channels: Mutex<HashMap<String, Arc<Channel>>>,
}

impl LocalQueryResultsManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_channel(&self, query_id: &str) -> Arc<Channel> {
        let mut channels = self.channels.lock().expect("channel registry");
        channels
            .entry(query_id.to_string())
            .or_insert_with(|| {
                debug!("creating result channel for query {}", query_id);
                Channel::new(query_id)
            })
            .clone()
    }

    fn channel(&self, query_id: &str) -> Option<Arc<Channel>> {
        self.channels
            .lock()
            .expect("channel registry")
            .get(query_id)
            .cloned()
    }
}

impl QueryResultsManager for LocalQueryResultsManager {
    fn create_listener(&self, listener_id: &str, query_id: &str) -> Box<dyn QueryResultsListener> {
        let channel = self.ensure_channel(query_id);
        Box::new(LocalQueryResultsListener::start(
            listener_id,
            query_id,
            channel,
        ))
    }

    fn create_publisher(&self, query_id: &str) -> Box<dyn QueryResultsPublisher> {
        let channel = self.ensure_channel(query_id);
        Box::new(LocalQueryResultsPublisher::new(query_id, channel))
    }

    fn delete_query(&self, query_id: &str) {
        let removed = self
            .channels
            .lock()
            .expect("channel registry")
            .remove(query_id);
        match removed {
            Some(channel) => {
                channel.mark_deleted();
                info!("deleted result channel for query {}", query_id);
            }
            None => debug!("no result channel to delete for query {}", query_id),
        }
    }

    fn empty_query(&self, query_id: &str) {
        match self.channel(query_id) {
            Some(channel) => {
                let purged = channel.purge();
                info!(
                    "purged {} buffered results from channel for query {}",
                    purged, query_id
                );
            }
            None => debug!("no result channel to purge for query {}", query_id),
        }
    }

    fn num_results_remaining(&self, query_id: &str) -> i64 {
        match self.channel(query_id) {
            Some(channel) => channel.depth() as i64,
            None => -1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(id: &str) -> ResultMessage {
        ResultMessage::new(id, json!({"page": id}))
    }

    #[test]
    fn immediate_channel_confirms_within_timeout() {
        let channel = Channel::new("q1");
        let publisher = LocalQueryResultsPublisher::new("q1", channel);
        assert!(publisher.publish(message("r1"), Duration::from_millis(100)));
        assert_eq!(publisher.num_outstanding(), 0);
    }

    #[test]
    fn delayed_confirm_inside_timeout_is_positive() {
        let channel = Channel::with_policy("q1", ConfirmPolicy::Delayed(Duration::from_millis(50)));
        let publisher = LocalQueryResultsPublisher::new("q1", channel);
        assert!(publisher.publish(message("r1"), Duration::from_millis(100)));
        assert_eq!(publisher.num_outstanding(), 0);
    }

    #[test]
    fn missing_confirm_times_out_and_clears_outstanding() {
        let channel = Channel::with_policy("q1", ConfirmPolicy::Never);
        let publisher = LocalQueryResultsPublisher::new("q1", channel);
        let start = Instant::now();
        assert!(!publisher.publish(message("r1"), Duration::from_millis(100)));
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(publisher.num_outstanding(), 0);
    }

    #[test]
    fn publish_to_deleted_channel_is_a_negative_confirm() {
        let manager = LocalQueryResultsManager::new();
        let publisher = manager.create_publisher("q1");
        manager.delete_query("q1");
        assert!(!publisher.publish(message("r1"), Duration::from_millis(100)));
    }

    #[test]
    fn nack_redelivers_the_same_message() {
        let manager = LocalQueryResultsManager::new();
        let listener = manager.create_listener("l1", "q1");
        let publisher = manager.create_publisher("q1");
        assert!(publisher.publish(message("r1"), Duration::from_secs(1)));

        let mut first = listener.receive(Duration::from_secs(5)).expect("first");
        assert_eq!(first.id(), "r1");
        first.acknowledge(Acknowledgement::Nack);

        let mut again = listener.receive(Duration::from_secs(5)).expect("redelivery");
        assert_eq!(again.id(), "r1");
        again.acknowledge(Acknowledgement::Ack);

        assert!(listener.receive(Duration::from_millis(50)).is_none());
        listener.close();
    }

    #[test]
    fn empty_query_purges_without_deleting() {
        let manager = LocalQueryResultsManager::new();
        let publisher = manager.create_publisher("q1");
        for i in 0..3 {
            assert!(publisher.publish(message(&format!("r{}", i)), Duration::from_secs(1)));
        }
        assert_eq!(manager.num_results_remaining("q1"), 3);

        manager.empty_query("q1");
        assert_eq!(manager.num_results_remaining("q1"), 0);
        // channel survives the purge
        assert!(publisher.publish(message("r3"), Duration::from_secs(1)));
        assert_eq!(manager.num_results_remaining("q1"), 1);
    }

    #[test]
    fn depth_of_unknown_channel_is_sentinel() {
        let manager = LocalQueryResultsManager::new();
        assert_eq!(manager.num_results_remaining("nope"), -1);
    }
}

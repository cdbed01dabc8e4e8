/*
 *  Copyright 2025-2026 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Reply routing for the synchronous RPC.
//!
//! All sync callers of one function share a single reply queue, and a
//! single consumer subscription per queue: one dispatcher task owns the
//! delivery stream and routes each result body to the waiter registered
//! under its `correlation_id`, parking bodies with no waiter in the
//! bounded result cache. Waiters block only on their own oneshot channel,
//! so any number of sync calls can be outstanding at once and results
//! resolve in whatever order workers finish.
//!
//! A second subscription on the same queue would let the server
//! round-robin a caller's result to the other caller's consumer; the
//! single shared dispatcher is what makes the correlation-id match
//! reliable.
//!
//! The register-or-claim step in [`await_reply`] and the dispatch step in
//! [`ReplyRoute::dispatch`] take the same lock, so a result is always
//! either handed to its waiter or parked where that waiter's probe will
//! find it; arrival order relative to registration does not matter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use amqprs::channel::ConsumerMessage;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use super::cache::ResultCache;
use crate::error::BrokerError;

/// Why a reply stream stopped producing results.
#[derive(Debug, Clone)]
pub(crate) enum ReplyFailure {
    /// A message on the reply queue violated the wire contract.
    Protocol(String),
    /// The server closed the consumer.
    ConnectionLost(String),
}

impl From<ReplyFailure> for BrokerError {
    fn from(failure: ReplyFailure) -> Self {
        match failure {
            ReplyFailure::Protocol(message) => BrokerError::Protocol { message },
            ReplyFailure::ConnectionLost(message) => BrokerError::ConnectionLost { message },
        }
    }
}

/// Shared routing state for one reply queue: registered waiters, parked
/// results, and the terminal failure once the stream has died.
#[derive(Debug, Default)]
pub(crate) struct ReplyRoute {
    waiters: HashMap<String, oneshot::Sender<Vec<u8>>>,
    cache: ResultCache,
    failure: Option<ReplyFailure>,
}

impl ReplyRoute {
    /// Routes one result body: hands it to the waiter registered under
    /// `correlation_id`, or parks it for a waiter that has not arrived
    /// (or has given up and gone away).
    pub(crate) fn dispatch(&mut self, correlation_id: String, body: Vec<u8>) {
        match self.waiters.remove(&correlation_id) {
            Some(waiter) => {
                if let Err(body) = waiter.send(body) {
                    debug!(
                        correlation_id = %correlation_id,
                        "waiter gone; parking its result"
                    );
                    self.cache.insert(correlation_id, body);
                }
            }
            None => {
                debug!(
                    correlation_id = %correlation_id,
                    "no waiter registered; parking result"
                );
                self.cache.insert(correlation_id, body);
            }
        }
    }

    /// Marks the route dead and wakes every registered waiter.
    ///
    /// Dropping the senders resolves the waiters' receivers; they read
    /// the stored failure afterwards.
    pub(crate) fn fail_all(&mut self, failure: ReplyFailure) {
        self.failure = Some(failure);
        self.waiters.clear();
    }
}

/// Blocks until the result body for `job_id` is available on `route`.
///
/// Claims a result parked before this waiter arrived, otherwise registers
/// a oneshot the dispatcher resolves on delivery. The wait is indefinite;
/// callers wanting a timeout wrap the future externally.
pub(crate) async fn await_reply(
    route: &Arc<Mutex<ReplyRoute>>,
    job_id: &str,
) -> Result<Vec<u8>, BrokerError> {
    let receiver = {
        let mut route = route.lock().unwrap();
        if let Some(body) = route.cache.take(job_id) {
            debug!(job_id, "result was already parked in the cache");
            return Ok(body);
        }
        if let Some(failure) = route.failure.clone() {
            return Err(failure.into());
        }
        let (sender, receiver) = oneshot::channel();
        route.waiters.insert(job_id.to_string(), sender);
        receiver
    };

    match receiver.await {
        Ok(body) => Ok(body),
        Err(_) => {
            let failure = route.lock().unwrap().failure.clone();
            Err(failure
                .unwrap_or_else(|| {
                    ReplyFailure::ConnectionLost(
                        "reply dispatcher terminated before delivering a result".to_string(),
                    )
                })
                .into())
        }
    }
}

/// Spawns the dispatcher task owning the single consumer subscription of
/// one reply queue.
///
/// Runs until the stream closes or a message violates the wire contract;
/// either way the route is marked dead and every waiter is woken. The
/// route is replaced together with its link, so a reconnect starts a
/// fresh dispatcher.
pub(crate) fn spawn_reply_dispatcher(
    queue: String,
    route: Arc<Mutex<ReplyRoute>>,
    mut deliveries: UnboundedReceiver<ConsumerMessage>,
) {
    tokio::spawn(async move {
        loop {
            let Some(message) = deliveries.recv().await else {
                fail_route(
                    &route,
                    ReplyFailure::ConnectionLost(format!(
                        "reply queue '{}' consumer closed by server",
                        queue
                    )),
                );
                return;
            };
            let Some(properties) = message.basic_properties else {
                fail_route(
                    &route,
                    ReplyFailure::Protocol("result message has no properties".to_string()),
                );
                return;
            };
            let correlation_id = match properties.correlation_id() {
                Some(id) if !id.is_empty() => id.clone(),
                _ => {
                    fail_route(
                        &route,
                        ReplyFailure::Protocol(
                            "result message has empty correlation_id".to_string(),
                        ),
                    );
                    return;
                }
            };
            let Some(body) = message.content else {
                fail_route(
                    &route,
                    ReplyFailure::Protocol("result message has no body".to_string()),
                );
                return;
            };

            debug!(queue = %queue, correlation_id = %correlation_id, "routing reply");
            route.lock().unwrap().dispatch(correlation_id, body);
        }
    });
}

fn fail_route(route: &Arc<Mutex<ReplyRoute>>, failure: ReplyFailure) {
    match &failure {
        ReplyFailure::Protocol(message) => error!(error = %message, "reply dispatcher stopped"),
        ReplyFailure::ConnectionLost(message) => {
            warn!(error = %message, "reply dispatcher stopped")
        }
    }
    route.lock().unwrap().fail_all(failure);
}

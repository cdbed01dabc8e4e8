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

//! RabbitMQ broker speaking the Celery wire protocol.
//!
//! ## Queue topology
//!
//! Each function owns a durable *task queue* named after it, bound to a
//! durable direct exchange of the same name with the function name as
//! routing key, declared with `x-max-priority = 3`. Each (connection,
//! function) pair additionally owns a transient *reply queue* whose name
//! is a UUID minted on first need. Both declarations are idempotent and
//! repeated before every publish and on worker start.
//!
//! ## Synchronous RPC
//!
//! [`run_job_sync`](AmqpBroker::run_job_sync) publishes the task envelope
//! with `correlation_id` set to the job id and `reply_to` set to the
//! reply queue, then blocks until the result with the matching
//! correlation id arrives. The reply queue has exactly one consumer: a
//! shared dispatcher task that routes each delivered body to the waiter
//! registered under its correlation id and parks
//! bodies with no waiter in a bounded per-function cache. The pool lock
//! covers only declaration, publish, and consumer startup; the wait
//! itself happens off-lock, so any number of sync calls can be
//! outstanding at once and results for other jobs arriving interleaved
//! on the shared queue reach their own waiters. The wait is indefinite;
//! callers wanting a timeout wrap the future externally.
//!
//! ## Worker loop
//!
//! [`start_worker`](AmqpBroker::start_worker) consumes the task queue
//! with manual acknowledgement and prefetch 1. Job failures become
//! failure envelopes for the submitting client; transport, protocol, and
//! decode failures propagate out and terminate the worker rather than
//! being retried silently.

use std::sync::Arc;

use amqprs::channel::{
    BasicAckArguments, BasicConsumeArguments, BasicPublishArguments, Channel, ConsumerMessage,
    ExchangeDeclareArguments, QueueBindArguments, QueueDeclareArguments, QueueDeleteArguments,
};
use amqprs::{BasicProperties, FieldTable, FieldValue};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, JobStatus};
use crate::error::BrokerError;
use crate::function::{JobArgs, JobFunction};
use crate::registry::FunctionRegistry;
use crate::{identity, runner};

mod cache;
mod connection;
pub mod protocol;
mod rpc;

pub use connection::{AmqpSettings, AmqpSettingsBuilder};

use connection::{ChannelPool, Link, PoolState};
use protocol::{ResultEnvelope, TaskEnvelope};

/// Job manager broker over RabbitMQ.
///
/// One value owns one connection (and its single channel) at a time; a
/// fork or a dead connection is detected on the next operation and a
/// fresh link is opened transparently. Declarations and publishes on a
/// value are serialized, matching the one-channel-per-process execution
/// model; sync calls wait for their results concurrently.
pub struct AmqpBroker {
    pool: ChannelPool,
}

impl AmqpBroker {
    /// Creates a broker with explicit connection settings.
    pub fn new(settings: AmqpSettings) -> Self {
        Self {
            pool: ChannelPool::new(settings),
        }
    }

    /// Creates a broker from `MILLRACE_AMQP_*` environment settings.
    pub fn from_env() -> Self {
        Self::new(AmqpSettings::from_env())
    }

    /// The connection settings this broker was built with.
    pub fn settings(&self) -> &AmqpSettings {
        self.pool.settings()
    }

    /// Closes the live link, deleting the transient reply queues this
    /// connection declared.
    ///
    /// Deletion failures are logged and tolerated; a reconnect never
    /// assumes a reply queue survived and redeclares it before use.
    pub async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.pool.lock().await;
        let reply_queues = state.reply_queue_names();
        let Some(link) = state.reset() else {
            return Ok(());
        };

        for queue in reply_queues {
            if let Err(err) = link
                .channel
                .queue_delete(QueueDeleteArguments::new(&queue))
                .await
            {
                warn!(queue = %queue, error = %err, "failed to delete reply queue during shutdown");
            }
        }
        if let Err(err) = link.channel.close().await {
            warn!(error = %err, "failed to close AMQP channel cleanly");
        }
        link.connection.close().await?;
        info!("AMQP connection closed");
        Ok(())
    }

    /// Queue arguments shared by task and reply queues.
    fn queue_arguments(lazy_queue: bool) -> FieldTable {
        let mut arguments = FieldTable::new();
        arguments.insert(
            "x-max-priority".try_into().unwrap(),
            FieldValue::s(protocol::QUEUE_MAX_PRIORITY),
        );
        if lazy_queue {
            arguments.insert("x-queue-mode".try_into().unwrap(), "lazy".into());
        }
        arguments
    }

    /// Idempotently declares a function's durable task queue, its
    /// same-named durable exchange, and the binding between them.
    async fn declare_task_topology(
        channel: &Channel,
        function: &dyn JobFunction,
    ) -> Result<(), BrokerError> {
        let name = function.name();
        channel
            .exchange_declare(
                ExchangeDeclareArguments::new(name, "direct")
                    .durable(true)
                    .finish(),
            )
            .await?;
        channel
            .queue_declare(
                QueueDeclareArguments::new(name)
                    .durable(true)
                    .arguments(Self::queue_arguments(function.lazy_queue()))
                    .finish(),
            )
            .await?;
        channel
            .queue_bind(QueueBindArguments::new(name, name, name))
            .await?;
        Ok(())
    }

    /// Idempotently declares a transient reply queue.
    async fn declare_reply_queue(channel: &Channel, queue: &str) -> Result<(), BrokerError> {
        channel
            .queue_declare(
                QueueDeclareArguments::new(queue)
                    .durable(false)
                    .arguments(Self::queue_arguments(false))
                    .finish(),
            )
            .await?;
        Ok(())
    }

    /// Declares topology and publishes one task envelope.
    ///
    /// Returns the minted job id, the reply queue name, and the link the
    /// message went out on.
    async fn publish_job(
        &self,
        state: &mut PoolState,
        function: &dyn JobFunction,
        args: &JobArgs,
    ) -> Result<(String, String, Link), BrokerError> {
        let link = self.pool.ensure_link(state).await?;
        let name = function.name();
        let reply_queue = state.reply_queue_for(name);

        Self::declare_task_topology(&link.channel, function).await?;
        Self::declare_reply_queue(&link.channel, &reply_queue).await?;

        let job_id = Uuid::new_v4().to_string();
        let envelope = TaskEnvelope::new(name, &job_id, args.clone(), function.retries());
        let body = serde_json::to_vec(&envelope)?;

        let properties = BasicProperties::default()
            .with_content_type(protocol::CONTENT_TYPE)
            .with_content_encoding(protocol::CONTENT_ENCODING)
            .with_delivery_mode(protocol::DELIVERY_MODE_PERSISTENT)
            .with_priority(function.priority().amqp_value())
            .with_correlation_id(&job_id)
            .with_reply_to(&reply_queue)
            .finish();

        link.channel
            .basic_publish(properties, body, BasicPublishArguments::new(name, name))
            .await?;

        debug!(
            job_id = %job_id,
            function = name,
            priority = function.priority().amqp_value(),
            reply_to = %reply_queue,
            "published task envelope"
        );
        Ok((job_id, reply_queue, link))
    }

    /// Validates and executes one task delivery, publishes its result
    /// envelope, and acks.
    async fn handle_delivery(
        channel: &Channel,
        registry: &FunctionRegistry,
        bound_function: &str,
        message: ConsumerMessage,
    ) -> Result<(), BrokerError> {
        let deliver = message
            .deliver
            .ok_or_else(|| BrokerError::protocol("task message has no delivery frame"))?;
        let delivery_tag = deliver.delivery_tag();
        let properties = message
            .basic_properties
            .ok_or_else(|| BrokerError::protocol("task message has no properties"))?;
        let correlation_id = match properties.correlation_id() {
            Some(id) if !id.is_empty() => id.clone(),
            _ => return Err(BrokerError::protocol("task message has empty correlation_id")),
        };
        let reply_to = match properties.reply_to() {
            Some(queue) if !queue.is_empty() => queue.clone(),
            _ => return Err(BrokerError::protocol("task message has empty reply_to")),
        };
        let body = message
            .content
            .ok_or_else(|| BrokerError::protocol("task message has no body"))?;

        let envelope: TaskEnvelope = serde_json::from_slice(&body)?;
        let function = registry.get(&envelope.task).ok_or_else(|| {
            BrokerError::protocol(format!(
                "task queue for '{}' delivered a job for '{}'; queues are cross-wired",
                bound_function, envelope.task
            ))
        })?;
        let request_priority = properties.priority().unwrap_or(0);

        info!(
            job_id = %envelope.id,
            correlation_id = %correlation_id,
            function = %envelope.task,
            delivery_tag,
            "executing delivered job"
        );
        let outcome = runner::run_job(function.as_ref(), &envelope.kwargs, &envelope.id).await;

        if function.publish_results() {
            let result = match &outcome {
                Ok(value) => ResultEnvelope::success(&envelope.id, value.clone()),
                Err(err) => ResultEnvelope::failure(&envelope.id, err),
            };
            Self::declare_reply_queue(channel, &reply_to).await?;
            let properties = BasicProperties::default()
                .with_content_type(protocol::CONTENT_TYPE)
                .with_content_encoding(protocol::CONTENT_ENCODING)
                .with_delivery_mode(protocol::DELIVERY_MODE_TRANSIENT)
                .with_priority(request_priority)
                .with_correlation_id(&envelope.id)
                .finish();
            channel
                .basic_publish(
                    properties,
                    serde_json::to_vec(&result)?,
                    BasicPublishArguments::default()
                        .routing_key(reply_to.clone())
                        .finish(),
                )
                .await?;
            debug!(
                job_id = %envelope.id,
                status = %result.status,
                queue = %reply_to,
                "published result envelope"
            );
        } else {
            debug!(
                job_id = %envelope.id,
                "function does not publish results; skipping envelope"
            );
        }

        channel
            .basic_ack(BasicAckArguments::new(delivery_tag, false))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn start_worker(&self, function: Arc<dyn JobFunction>) -> Result<(), BrokerError> {
        let registry = FunctionRegistry::single(Arc::clone(&function));
        let queue = function.name().to_string();

        let channel = {
            let mut state = self.pool.lock().await;
            let link = self.pool.ensure_link(&mut state).await?;
            Self::declare_task_topology(&link.channel, function.as_ref()).await?;
            link.channel
        };

        let consume_args = BasicConsumeArguments::default()
            .queue(queue.clone())
            .auto_ack(false)
            .finish();
        let (consumer_tag, mut deliveries) = channel.basic_consume_rx(consume_args).await?;
        info!(
            function = %queue,
            consumer_tag = %consumer_tag,
            "worker consuming task queue"
        );

        while let Some(message) = deliveries.recv().await {
            Self::handle_delivery(&channel, &registry, &queue, message).await?;
        }
        Err(BrokerError::ConnectionLost {
            message: format!("task queue '{}' consumer closed by server", queue),
        })
    }

    async fn run_job_sync(
        &self,
        function: &dyn JobFunction,
        args: &JobArgs,
    ) -> Result<Value, BrokerError> {
        // The pool lock covers publish and consumer startup only; the
        // indefinite wait below must not block other submissions.
        let (job_id, route) = {
            let mut state = self.pool.lock().await;
            let (job_id, reply_queue, link) = self.publish_job(&mut state, function, args).await?;

            let handle = state.route_for(function.name());
            if !handle.consuming {
                let consume_args = BasicConsumeArguments::default()
                    .queue(reply_queue.clone())
                    .auto_ack(true)
                    .finish();
                let (consumer_tag, deliveries) =
                    link.channel.basic_consume_rx(consume_args).await?;
                handle.consuming = true;
                rpc::spawn_reply_dispatcher(
                    reply_queue.clone(),
                    Arc::clone(&handle.route),
                    deliveries,
                );
                debug!(
                    queue = %reply_queue,
                    consumer_tag = %consumer_tag,
                    "started shared reply consumer"
                );
            }
            (job_id, Arc::clone(&handle.route))
        };

        debug!(job_id = %job_id, "awaiting result on reply queue");
        let body = rpc::await_reply(&route, &job_id).await?;
        protocol::decode_result(&body, &job_id)
    }

    async fn run_job_async(
        &self,
        function: &dyn JobFunction,
        args: &JobArgs,
    ) -> Result<String, BrokerError> {
        let mut state = self.pool.lock().await;
        let (job_id, _, _) = self.publish_job(&mut state, function, args).await?;
        Ok(job_id)
    }

    fn job_id_from_handle(&self, handle: &str) -> Result<String, BrokerError> {
        identity::job_id_from_handle(handle)
    }

    async fn set_job_progress(
        &self,
        _job_id: &str,
        _numerator: u64,
        _denominator: u64,
    ) -> Result<(), BrokerError> {
        Err(BrokerError::NotImplemented {
            operation: "set_job_progress",
        })
    }

    async fn job_status(&self, _job_id: &str) -> Result<JobStatus, BrokerError> {
        Err(BrokerError::NotImplemented {
            operation: "job_status",
        })
    }

    async fn show_jobs(&self) -> Result<Vec<JobStatus>, BrokerError> {
        Err(BrokerError::NotImplemented {
            operation: "show_jobs",
        })
    }

    async fn cancel_job(&self, _job_id: &str) -> Result<(), BrokerError> {
        Err(BrokerError::NotImplemented {
            operation: "cancel_job",
        })
    }

    async fn server_status(&self) -> Result<Value, BrokerError> {
        Err(BrokerError::NotImplemented {
            operation: "server_status",
        })
    }

    async fn workers(&self) -> Result<Value, BrokerError> {
        Err(BrokerError::NotImplemented {
            operation: "workers",
        })
    }
}

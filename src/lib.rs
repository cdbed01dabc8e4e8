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

//! Millrace is a job-manager library.
//!
//! Clients submit named work units ("functions") to a message broker and
//! worker processes execute them. Three execution modes are supported:
//! in-process blocking execution, remote execution that blocks the
//! submitting caller until the result is delivered, and fire-and-forget
//! enqueueing. The production broker targets RabbitMQ with a wire payload
//! compatible with Celery's task/result protocol, so standard Celery
//! tooling can read the queues.
//!
//! ## Architecture Modules
//!
//! - **`function`**: the [`JobFunction`] descriptor: name, priority,
//!   retry count, queue hints, the `run` routine, and the submission
//!   helpers `run_locally` / `run_remotely` / `add_to_queue`.
//! - **`broker`**: the [`Broker`] capability contract and the RabbitMQ
//!   implementation ([`AmqpBroker`]) with its two-queue model: a durable
//!   per-function task queue plus a transient per-client reply queue,
//!   matched by correlation id.
//! - **`runner`**: in-process execution with retry accounting and timing,
//!   shared by local submission and the worker consume loop.
//! - **`registry`**: string-keyed dispatch for workers, built at startup
//!   from the single function a worker serves.
//! - **`identity`**: deterministic `(function, args)` fingerprints and
//!   path-safe job identifiers.
//! - **`config`**: the explicit [`Configuration`] value that ties
//!   descriptors to a broker handle.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use millrace::{AmqpBroker, AmqpSettings, Configuration, JobFunction};
//!
//! let broker = Arc::new(AmqpBroker::new(AmqpSettings::from_env()));
//! let configuration = Configuration::new(broker);
//!
//! // Client side: block until a worker answers.
//! let addition = Addition { configuration };
//! let sum = addition.run_remotely(&args).await?;
//!
//! // Worker side: consume the task queue forever.
//! configuration.broker().start_worker(Arc::new(addition)).await?;
//! ```
//!
//! Parallelism comes from running multiple worker processes; a broker
//! value is a single-threaded cooperative actor with one AMQP channel,
//! never shared across forks. Logging uses [`tracing`]; installing a
//! subscriber is the embedding application's job.

pub mod broker;
pub mod config;
pub mod error;
pub mod function;
pub mod identity;
pub mod registry;
pub mod runner;

pub use broker::amqp::{AmqpBroker, AmqpSettings, AmqpSettingsBuilder};
pub use broker::{Broker, JobState, JobStatus};
pub use config::{install, installed, Configuration};
pub use error::{BrokerError, ConfigError, JobError};
pub use function::{JobArgs, JobFunction, Priority};
pub use registry::FunctionRegistry;

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

//! Broker abstraction.
//!
//! A broker is the message transport between clients and workers. This
//! module defines the capability contract every broker implementation must
//! satisfy; the production implementation over RabbitMQ lives in
//! [`amqp`].
//!
//! The contract has three tiers:
//!
//! - **Execution**: [`Broker::start_worker`] runs the consume loop,
//!   [`Broker::run_job_sync`] submits and blocks for the result,
//!   [`Broker::run_job_async`] submits fire-and-forget.
//! - **Identity**: [`Broker::job_id_from_handle`] normalizes a
//!   broker-specific handle to a stable job id.
//! - **Admin**: status, listing, cancellation, and progress. A broker may
//!   leave these unimplemented, in which case every call raises
//!   [`BrokerError::NotImplemented`](crate::error::BrokerError::NotImplemented)
//!   rather than fabricating an answer.
//!
//! Errors are surfaced as raised failures with a descriptive message; a
//! broker never silently drops a message or a result.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::BrokerError;
use crate::function::{JobArgs, JobFunction};

pub mod amqp;

/// Lifecycle state of a job, as reported by a broker's admin surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Accepted by the broker, not yet claimed by a worker.
    Queued,
    /// Claimed and executing.
    Running,
    /// Finished; a success envelope was produced.
    Completed,
    /// Finished; a failure envelope was produced.
    Failed,
}

/// A snapshot of one job's state from a broker that tracks it.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatus {
    /// The stable job identifier.
    pub job_id: String,
    /// Current lifecycle state.
    pub state: JobState,
    /// Progress as `(numerator, denominator)`, when the broker tracks it.
    pub progress: Option<(u64, u64)>,
}

/// Capability contract for a message broker.
///
/// Submission methods take the [`JobFunction`] descriptor rather than a
/// bare name so a broker can read the name, priority, retry count, and
/// queue hints off the same value the worker side registers.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Consumes the task queue for `function` and executes deliveries
    /// until a fatal transport, protocol, or decode failure occurs.
    ///
    /// Never returns under normal operation.
    async fn start_worker(&self, function: Arc<dyn JobFunction>) -> Result<(), BrokerError>;

    /// Submits a job and blocks until its result envelope is delivered.
    ///
    /// Returns the job's result value, or raises the remote failure as
    /// [`BrokerError::Job`](crate::error::BrokerError::Job).
    async fn run_job_sync(
        &self,
        function: &dyn JobFunction,
        args: &JobArgs,
    ) -> Result<Value, BrokerError>;

    /// Submits a job and returns its id as soon as the broker has
    /// accepted the message.
    async fn run_job_async(
        &self,
        function: &dyn JobFunction,
        args: &JobArgs,
    ) -> Result<String, BrokerError>;

    /// Normalizes a broker-specific handle to a stable job id.
    fn job_id_from_handle(&self, handle: &str) -> Result<String, BrokerError>;

    /// Records job progress as `numerator` of `denominator` units.
    ///
    /// Brokers without a progress channel fail consistently with
    /// `NotImplemented`.
    async fn set_job_progress(
        &self,
        job_id: &str,
        numerator: u64,
        denominator: u64,
    ) -> Result<(), BrokerError>;

    /// Fetches the state of a single job.
    async fn job_status(&self, job_id: &str) -> Result<JobStatus, BrokerError>;

    /// Lists jobs known to the broker.
    async fn show_jobs(&self) -> Result<Vec<JobStatus>, BrokerError>;

    /// Cancels a pending job.
    async fn cancel_job(&self, job_id: &str) -> Result<(), BrokerError>;

    /// Broker server health and statistics, shape defined per broker.
    async fn server_status(&self) -> Result<Value, BrokerError>;

    /// Connected workers, shape defined per broker.
    async fn workers(&self) -> Result<Value, BrokerError>;
}

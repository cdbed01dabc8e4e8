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

//! Error types for the millrace job system.
//!
//! The taxonomy mirrors the failure surfaces of the system:
//!
//! - [`BrokerError`]: everything that can go wrong between a client or
//!   worker and the message broker, including remote job failures that are
//!   surfaced to the submitting caller.
//! - [`JobError`]: a failure raised by user job code. Workers convert these
//!   into failure envelopes; clients see them re-raised as
//!   [`BrokerError::Job`].
//! - [`ConfigError`]: misuse of process-level configuration or the function
//!   registry.
//!
//! Propagation policy: worker loops convert job failures into result
//! envelopes so the submitting client observes them, but transport,
//! protocol, and decode failures propagate out and terminate the worker.
//! Clients convert nothing; every non-success outcome is raised.

use thiserror::Error;

/// Errors produced by broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The AMQP transport failed: connect, declare, publish, consume, or
    /// ack. Fatal to the current call; a worker loop dies rather than
    /// retry silently.
    #[error("AMQP transport failure: {0}")]
    Transport(#[from] amqprs::error::Error),

    /// Connecting to the broker exceeded the configured timeout.
    #[error("connection to {endpoint} timed out after {seconds}s")]
    ConnectTimeout { endpoint: String, seconds: u64 },

    /// The server closed a delivery stream the broker was still reading.
    #[error("AMQP connection lost: {message}")]
    ConnectionLost { message: String },

    /// A message violated the wire contract: missing or empty
    /// `correlation_id` or `reply_to`, an unknown result status, a task
    /// name that does not match the queue, or a `task_id` that does not
    /// match the awaited job. Indicates a configuration bug or a misrouted
    /// message.
    #[error("protocol violation: {message}")]
    Protocol { message: String },

    /// A message body was not valid JSON of the expected shape.
    #[error("failed to decode message body: {0}")]
    Decode(#[from] serde_json::Error),

    /// The remote job failed. Carries the traceback string from the
    /// failure envelope.
    #[error("remote job failed: {traceback}")]
    Job { traceback: String },

    /// The operation is not supported by this broker implementation.
    #[error("{operation} is not implemented by this broker")]
    NotImplemented { operation: &'static str },

    /// The broker was asked to do something its configuration cannot
    /// support.
    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl BrokerError {
    /// Shorthand for a [`BrokerError::Protocol`] with a formatted message.
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        BrokerError::Protocol {
            message: message.into(),
        }
    }
}

/// A failure raised by user job code.
///
/// Job functions return this from [`run`](crate::JobFunction::run); the
/// local runner logs and retries around it, and the worker loop folds the
/// final error into a failure envelope for the submitting client.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct JobError {
    message: String,
}

impl JobError {
    /// Creates a job error from anything displayable.
    pub fn new(message: impl std::fmt::Display) -> Self {
        Self {
            message: message.to_string(),
        }
    }

    /// The captured failure message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for JobError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for JobError {
    fn from(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

/// Errors from process-level configuration and function registration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The process-wide configuration may only be installed once, during
    /// startup.
    #[error("a process-wide configuration is already installed")]
    AlreadyInstalled,

    /// Two functions with the same name cannot share a registry.
    #[error("function '{name}' is already registered")]
    DuplicateFunction { name: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_error_display() {
        let err = JobError::new("division by zero");
        assert_eq!(err.to_string(), "division by zero");
        assert_eq!(err.message(), "division by zero");

        let err: JobError = "boom".into();
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_broker_error_messages() {
        let err = BrokerError::protocol("correlation_id is empty");
        assert_eq!(
            err.to_string(),
            "protocol violation: correlation_id is empty"
        );

        let err = BrokerError::NotImplemented {
            operation: "job_status",
        };
        assert_eq!(
            err.to_string(),
            "job_status is not implemented by this broker"
        );

        let err = BrokerError::Job {
            traceback: "Job died: oops".to_string(),
        };
        assert!(err.to_string().contains("Job died: oops"));
    }
}

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

//! Job function descriptors.
//!
//! A [`JobFunction`] is a named, executable unit registered with the
//! system. The name is globally unique within a deployment and doubles as
//! the task queue name on the broker. The descriptor carries the
//! per-function metadata (priority, retry count, queue hints) and the
//! `run` routine, plus the three submission helpers a client uses:
//!
//! - [`run_locally`](JobFunction::run_locally): execute in-process with
//!   retry accounting and timing.
//! - [`run_remotely`](JobFunction::run_remotely): publish to the broker
//!   and block for the result.
//! - [`add_to_queue`](JobFunction::add_to_queue): publish and return the
//!   job id immediately.
//!
//! # Example
//!
//! ```rust,ignore
//! struct Addition {
//!     configuration: Configuration,
//! }
//!
//! #[async_trait]
//! impl JobFunction for Addition {
//!     fn name(&self) -> &str {
//!         "Addition"
//!     }
//!
//!     fn configuration(&self) -> Configuration {
//!         self.configuration.clone()
//!     }
//!
//!     async fn run(&self, args: &JobArgs) -> Result<Value, JobError> {
//!         let a = args["a"].as_i64().ok_or_else(|| JobError::new("a must be a number"))?;
//!         let b = args["b"].as_i64().ok_or_else(|| JobError::new("b must be a number"))?;
//!         Ok(Value::from(a + b))
//!     }
//! }
//! ```

use async_trait::async_trait;
use serde_json::Value;

use crate::config::Configuration;
use crate::error::{BrokerError, JobError};
use crate::{identity, runner};

/// Arguments to a job invocation: a mapping from string keys to
/// JSON-serializable values.
pub type JobArgs = serde_json::Map<String, Value>;

/// Scheduling priority of a function's jobs.
///
/// Maps onto the AMQP message priority range declared on task queues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Priority {
    /// Drained after everything else.
    Low,
    /// The default.
    #[default]
    Normal,
    /// Jumps the queue.
    High,
}

impl Priority {
    /// The AMQP priority value carried in message properties.
    pub fn amqp_value(self) -> u8 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
        }
    }
}

/// A named, executable unit of work.
///
/// Implementations provide the immutable metadata and the `run` routine;
/// the submission helpers are provided. Descriptors are cheap to share as
/// `Arc<dyn JobFunction>` between client code and worker registries.
#[async_trait]
pub trait JobFunction: Send + Sync {
    /// The function's globally unique name. Also the task queue name.
    fn name(&self) -> &str;

    /// The configuration (and therefore broker) this function submits
    /// through.
    fn configuration(&self) -> Configuration;

    /// Scheduling priority for this function's jobs.
    fn priority(&self) -> Priority {
        Priority::Normal
    }

    /// Number of re-attempts after a failure; total attempts are
    /// `retries() + 1`.
    fn retries(&self) -> u32 {
        0
    }

    /// Hint that this function's task queue should favor paging messages
    /// to disk over keeping them resident.
    fn lazy_queue(&self) -> bool {
        false
    }

    /// Whether workers publish result envelopes for this function.
    fn publish_results(&self) -> bool {
        true
    }

    /// Executes one invocation. Args are a string-keyed map of JSON
    /// values; the result is any JSON value, possibly null.
    async fn run(&self, args: &JobArgs) -> Result<Value, JobError>;

    /// Executes in the calling process under the local runner's retry
    /// loop, with a freshly minted path-safe job id.
    async fn run_locally(&self, args: &JobArgs) -> Result<Value, JobError>
    where
        Self: Sized,
    {
        let job_id = identity::path_safe_job_id(self.name(), args);
        runner::run_job(self, args, &job_id).await
    }

    /// Submits to the broker and blocks until the result arrives.
    async fn run_remotely(&self, args: &JobArgs) -> Result<Value, BrokerError>
    where
        Self: Sized,
    {
        self.configuration().broker().run_job_sync(self, args).await
    }

    /// Submits to the broker and returns the job id without waiting.
    async fn add_to_queue(&self, args: &JobArgs) -> Result<String, BrokerError>
    where
        Self: Sized,
    {
        self.configuration()
            .broker()
            .run_job_async(self, args)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_amqp_mapping() {
        assert_eq!(Priority::Low.amqp_value(), 0);
        assert_eq!(Priority::Normal.amqp_value(), 1);
        assert_eq!(Priority::High.amqp_value(), 2);
    }

    #[test]
    fn test_priority_default_is_normal() {
        assert_eq!(Priority::default(), Priority::Normal);
    }
}

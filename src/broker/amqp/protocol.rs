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

//! Celery-compatible wire protocol.
//!
//! Messages are UTF-8 JSON over AMQP. A task envelope travels from a
//! producer to a durable task queue; a result envelope travels from a
//! worker to the transient reply queue named in the task's `reply_to`
//! property. The `task_id` on a result envelope always equals the
//! `correlation_id` of the AMQP message carrying it, which is the sole
//! matching key for the RPC.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{BrokerError, JobError};
use crate::function::JobArgs;

/// Content type of every message body.
pub const CONTENT_TYPE: &str = "application/json";
/// Content encoding of every message body.
pub const CONTENT_ENCODING: &str = "utf-8";
/// Delivery mode for task messages: persistent.
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;
/// Delivery mode for result messages: transient.
pub const DELIVERY_MODE_TRANSIENT: u8 = 1;
/// `x-max-priority` declared on task and reply queues.
pub const QUEUE_MAX_PRIORITY: i16 = 3;

/// Result status of a completed job.
pub const STATUS_SUCCESS: &str = "SUCCESS";
/// Result status of a failed job.
pub const STATUS_FAILURE: &str = "FAILURE";

/// Prefix applied to the error message when a worker builds a failure
/// traceback.
pub const TRACEBACK_PREFIX: &str = "Job died: ";

/// The task envelope published to a function's task queue.
///
/// Field set and constant fillers follow Celery's task protocol so that
/// standard Celery workers and tooling can read the queue. Positional
/// `args` are always empty; arguments travel in `kwargs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    /// The job id, equal to the message's `correlation_id`.
    pub id: String,
    /// The function name, equal to the queue and exchange name.
    pub task: String,
    /// Positional arguments. Always empty.
    pub args: Vec<Value>,
    /// Keyword arguments: the job's args map.
    pub kwargs: JobArgs,
    /// The function's configured retry count, informational for the
    /// executing side.
    pub retries: u32,
    /// Always null.
    pub expires: Option<String>,
    /// Always true.
    pub utc: bool,
    /// Always null.
    pub chord: Option<Value>,
    /// Always null.
    pub callbacks: Option<Value>,
    /// Always null.
    pub errbacks: Option<Value>,
    /// Always null.
    pub taskset: Option<Value>,
    /// Always `[null, null]`.
    pub timelimit: (Option<f64>, Option<f64>),
    /// Always null.
    pub eta: Option<String>,
}

impl TaskEnvelope {
    /// Builds the envelope for one job submission.
    pub fn new(task: &str, job_id: &str, kwargs: JobArgs, retries: u32) -> Self {
        Self {
            id: job_id.to_string(),
            task: task.to_string(),
            args: Vec::new(),
            kwargs,
            retries,
            expires: None,
            utc: true,
            chord: None,
            callbacks: None,
            errbacks: None,
            taskset: None,
            timelimit: (None, None),
            eta: None,
        }
    }
}

/// The result envelope published to a reply queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEnvelope {
    /// `"SUCCESS"` or `"FAILURE"`.
    pub status: String,
    /// The failure traceback; null on success.
    pub traceback: Option<String>,
    /// The job's result value on success; a fixed exception descriptor
    /// on failure.
    pub result: Value,
    /// The job id this result answers.
    pub task_id: String,
    /// Always empty.
    pub children: Vec<Value>,
}

impl ResultEnvelope {
    /// Builds the success form carrying the job's return value.
    pub fn success(task_id: &str, result: Value) -> Self {
        Self {
            status: STATUS_SUCCESS.to_string(),
            traceback: None,
            result,
            task_id: task_id.to_string(),
            children: Vec::new(),
        }
    }

    /// Builds the failure form from the error the job surfaced.
    pub fn failure(task_id: &str, error: &JobError) -> Self {
        Self {
            status: STATUS_FAILURE.to_string(),
            traceback: Some(format!("{}{}", TRACEBACK_PREFIX, error)),
            result: json!({
                "exc_message": "Task has failed",
                "exc_type": "Exception",
            }),
            task_id: task_id.to_string(),
            children: Vec::new(),
        }
    }
}

/// Decodes a result message body and resolves it for the caller awaiting
/// `expected_job_id`.
///
/// Success returns the result value; failure raises the traceback as
/// [`BrokerError::Job`]. A `task_id` mismatch or an unknown status is a
/// protocol violation.
pub(crate) fn decode_result(body: &[u8], expected_job_id: &str) -> Result<Value, BrokerError> {
    let envelope: ResultEnvelope = serde_json::from_slice(body)?;
    if envelope.task_id != expected_job_id {
        return Err(BrokerError::protocol(format!(
            "result task_id '{}' does not match awaited job '{}'",
            envelope.task_id, expected_job_id
        )));
    }
    match envelope.status.as_str() {
        STATUS_SUCCESS => Ok(envelope.result),
        STATUS_FAILURE => {
            let traceback = envelope.traceback.ok_or_else(|| {
                BrokerError::protocol("FAILURE result envelope carries no traceback")
            })?;
            Err(BrokerError::Job { traceback })
        }
        other => Err(BrokerError::protocol(format!(
            "unknown result status '{}'",
            other
        ))),
    }
}

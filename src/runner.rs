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

//! Local job runner.
//!
//! Executes a function's `run` routine in-process under a retry loop with
//! timing and structured log lines. Called from two sites: a client's own
//! process via [`run_locally`](crate::JobFunction::run_locally), and the
//! worker consume loop after a task message is decoded, which passes the
//! broker-assigned job id so worker-side logs carry it.
//!
//! Retries live here, on the executing side, not as broker-level
//! requeue/redelivery: a job that exhausts its retries surfaces exactly
//! one failure.

use std::time::Instant;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::JobError;
use crate::function::{JobArgs, JobFunction};

/// Runs `function` with up to `retries() + 1` attempts.
///
/// Each failed attempt is logged with the captured error; the first
/// success returns immediately. When every attempt fails, the last error
/// is returned after logging the total elapsed wall-clock time.
pub async fn run_job(
    function: &dyn JobFunction,
    args: &JobArgs,
    job_id: &str,
) -> Result<Value, JobError> {
    let attempts = function.retries() + 1;
    let started = Instant::now();
    let mut last_error: Option<JobError> = None;

    for attempt in 1..=attempts {
        debug!(
            job_id,
            function = function.name(),
            attempt,
            attempts,
            "starting job attempt"
        );
        match function.run(args).await {
            Ok(value) => {
                info!(
                    job_id,
                    function = function.name(),
                    attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "job completed"
                );
                return Ok(value);
            }
            Err(err) => {
                warn!(
                    job_id,
                    function = function.name(),
                    attempt,
                    attempts,
                    error = %err,
                    "job attempt failed"
                );
                last_error = Some(err);
            }
        }
    }

    let err = last_error.unwrap_or_else(|| JobError::new("job was never attempted"));
    error!(
        job_id,
        function = function.name(),
        attempts,
        elapsed_ms = started.elapsed().as_millis() as u64,
        error = %err,
        "job failed after exhausting retries"
    );
    Err(err)
}

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

//! Shared test support: job function descriptors and an in-memory broker
//! that satisfies the [`Broker`] contract without a RabbitMQ server.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use millrace::broker::amqp::protocol::{ResultEnvelope, TaskEnvelope, STATUS_SUCCESS};
use millrace::{
    identity, runner, Broker, BrokerError, Configuration, FunctionRegistry, JobArgs, JobError,
    JobFunction, JobState, JobStatus,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn args(value: Value) -> JobArgs {
    value.as_object().cloned().expect("args must be an object")
}

/// Broker that queues task envelopes in memory and executes them with the
/// same runner a real worker uses. `run_job_sync` performs a worker pass
/// inline, so results are produced by the worker-side envelope path and
/// consumed by the client-side decode path.
pub struct InMemoryBroker {
    registry: Mutex<FunctionRegistry>,
    queue: Mutex<VecDeque<TaskEnvelope>>,
    replies: Mutex<HashMap<String, ResultEnvelope>>,
}

impl InMemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(FunctionRegistry::new()),
            queue: Mutex::new(VecDeque::new()),
            replies: Mutex::new(HashMap::new()),
        })
    }

    /// Registers a function so the worker pass can dispatch to it.
    pub fn register(&self, function: Arc<dyn JobFunction>) {
        self.registry
            .lock()
            .unwrap()
            .register(function)
            .expect("test functions have unique names");
    }

    /// Worker pass: drains the task queue, executing each envelope and
    /// parking a result envelope under its job id.
    pub async fn run_pending(&self) -> usize {
        let mut executed = 0;
        loop {
            let Some(envelope) = self.queue.lock().unwrap().pop_front() else {
                break;
            };
            let function = self
                .registry
                .lock()
                .unwrap()
                .get(&envelope.task)
                .cloned()
                .expect("queued task is registered");
            let outcome = runner::run_job(function.as_ref(), &envelope.kwargs, &envelope.id).await;
            let reply = match outcome {
                Ok(value) => ResultEnvelope::success(&envelope.id, value),
                Err(err) => ResultEnvelope::failure(&envelope.id, &err),
            };
            self.replies.lock().unwrap().insert(envelope.id, reply);
            executed += 1;
        }
        executed
    }

    /// The parked result envelope for a job, if the worker pass has
    /// produced one.
    pub fn reply_for(&self, job_id: &str) -> Option<ResultEnvelope> {
        self.replies.lock().unwrap().get(job_id).cloned()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn start_worker(&self, function: Arc<dyn JobFunction>) -> Result<(), BrokerError> {
        self.register(function);
        self.run_pending().await;
        Ok(())
    }

    async fn run_job_sync(
        &self,
        function: &dyn JobFunction,
        args: &JobArgs,
    ) -> Result<Value, BrokerError> {
        let job_id = self.run_job_async(function, args).await?;
        self.run_pending().await;

        let reply = self
            .replies
            .lock()
            .unwrap()
            .remove(&job_id)
            .ok_or_else(|| BrokerError::Protocol {
                message: format!("no result produced for job '{}'", job_id),
            })?;
        assert_eq!(reply.task_id, job_id, "result must answer the awaited job");

        if reply.status == STATUS_SUCCESS {
            Ok(reply.result)
        } else {
            let traceback = reply.traceback.unwrap_or_default();
            Err(BrokerError::Job { traceback })
        }
    }

    async fn run_job_async(
        &self,
        function: &dyn JobFunction,
        args: &JobArgs,
    ) -> Result<String, BrokerError> {
        let job_id = Uuid::new_v4().to_string();
        let envelope = TaskEnvelope::new(function.name(), &job_id, args.clone(), function.retries());
        self.queue.lock().unwrap().push_back(envelope);
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
        // Consistently a silent no-op; this broker has no progress store.
        Ok(())
    }

    async fn job_status(&self, job_id: &str) -> Result<JobStatus, BrokerError> {
        if let Some(reply) = self.replies.lock().unwrap().get(job_id) {
            let state = if reply.status == STATUS_SUCCESS {
                JobState::Completed
            } else {
                JobState::Failed
            };
            return Ok(JobStatus {
                job_id: job_id.to_string(),
                state,
                progress: None,
            });
        }
        if self
            .queue
            .lock()
            .unwrap()
            .iter()
            .any(|envelope| envelope.id == job_id)
        {
            return Ok(JobStatus {
                job_id: job_id.to_string(),
                state: JobState::Queued,
                progress: None,
            });
        }
        Err(BrokerError::Protocol {
            message: format!("unknown job '{}'", job_id),
        })
    }

    async fn show_jobs(&self) -> Result<Vec<JobStatus>, BrokerError> {
        Ok(self
            .queue
            .lock()
            .unwrap()
            .iter()
            .map(|envelope| JobStatus {
                job_id: envelope.id.clone(),
                state: JobState::Queued,
                progress: None,
            })
            .collect())
    }

    async fn cancel_job(&self, job_id: &str) -> Result<(), BrokerError> {
        let mut queue = self.queue.lock().unwrap();
        let before = queue.len();
        queue.retain(|envelope| envelope.id != job_id);
        if queue.len() == before {
            return Err(BrokerError::Protocol {
                message: format!("job '{}' is not queued", job_id),
            });
        }
        Ok(())
    }

    async fn server_status(&self) -> Result<Value, BrokerError> {
        Ok(json!({
            "queued": self.queue.lock().unwrap().len(),
            "replies": self.replies.lock().unwrap().len(),
        }))
    }

    async fn workers(&self) -> Result<Value, BrokerError> {
        Ok(json!([]))
    }
}

/// Adds `a` and `b`.
pub struct Addition {
    configuration: Configuration,
}

impl Addition {
    pub fn new(configuration: Configuration) -> Self {
        Self { configuration }
    }
}

#[async_trait]
impl JobFunction for Addition {
    fn name(&self) -> &str {
        "Addition"
    }

    fn configuration(&self) -> Configuration {
        self.configuration.clone()
    }

    async fn run(&self, args: &JobArgs) -> Result<Value, JobError> {
        let a = args
            .get("a")
            .and_then(Value::as_i64)
            .ok_or_else(|| JobError::new("argument 'a' must be a number"))?;
        let b = args
            .get("b")
            .and_then(Value::as_i64)
            .ok_or_else(|| JobError::new("argument 'b' must be a number"))?;
        Ok(json!(a + b))
    }
}

/// Reverses the string in `input`.
pub struct ReverseString {
    configuration: Configuration,
}

impl ReverseString {
    pub fn new(configuration: Configuration) -> Self {
        Self { configuration }
    }
}

#[async_trait]
impl JobFunction for ReverseString {
    fn name(&self) -> &str {
        "ReverseString"
    }

    fn configuration(&self) -> Configuration {
        self.configuration.clone()
    }

    async fn run(&self, args: &JobArgs) -> Result<Value, JobError> {
        let input = args
            .get("input")
            .and_then(Value::as_str)
            .ok_or_else(|| JobError::new("argument 'input' must be a string"))?;
        Ok(json!(input.chars().rev().collect::<String>()))
    }
}

/// Fails every attempt.
pub struct FailsAlways {
    configuration: Configuration,
}

impl FailsAlways {
    pub fn new(configuration: Configuration) -> Self {
        Self { configuration }
    }
}

#[async_trait]
impl JobFunction for FailsAlways {
    fn name(&self) -> &str {
        "FailsAlways"
    }

    fn configuration(&self) -> Configuration {
        self.configuration.clone()
    }

    async fn run(&self, _args: &JobArgs) -> Result<Value, JobError> {
        Err(JobError::new("this function always fails"))
    }
}

/// Fails its first call, then returns 42. The name and retry count are
/// configurable so the same shape covers both the no-retry and the
/// retry-absorbed scenarios.
pub struct FailsOnce {
    name: &'static str,
    retries: u32,
    calls: AtomicU32,
    configuration: Configuration,
}

impl FailsOnce {
    pub fn new(name: &'static str, retries: u32, configuration: Configuration) -> Self {
        Self {
            name,
            retries,
            calls: AtomicU32::new(0),
            configuration,
        }
    }
}

#[async_trait]
impl JobFunction for FailsOnce {
    fn name(&self) -> &str {
        self.name
    }

    fn configuration(&self) -> Configuration {
        self.configuration.clone()
    }

    fn retries(&self) -> u32 {
        self.retries
    }

    async fn run(&self, _args: &JobArgs) -> Result<Value, JobError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(JobError::new("first call fails"))
        } else {
            Ok(json!(42))
        }
    }
}

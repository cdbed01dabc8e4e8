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

//! AMQP connection management.
//!
//! A broker value owns one [`ChannelPool`], which keeps at most one live
//! link: an AMQP connection plus channel 1, with prefetch 1. The link is
//! keyed by `(process id, host, port, user, password, vhost, timeout)`;
//! channels are not safe to share across forks, so every operation
//! revalidates the key and a fork transparently observes a fresh
//! connection on first use. Replacing the link also resets the
//! per-function reply-queue names and result caches, which belong to the
//! old channel's consumers.

use std::collections::HashMap;
use std::env;
use std::sync::{Arc, Mutex as SyncMutex};
use std::time::Duration;

use amqprs::channel::{BasicQosArguments, Channel};
use amqprs::connection::{Connection, OpenConnectionArguments};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::rpc::ReplyRoute;
use crate::error::BrokerError;

/// Default connect timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection settings for the RabbitMQ broker.
///
/// # Construction
///
/// Use [`AmqpSettings::builder()`] for explicit values, or
/// [`AmqpSettings::from_env()`] to apply `MILLRACE_AMQP_*` environment
/// overrides on top of the defaults:
///
/// ```rust
/// use millrace::broker::amqp::AmqpSettings;
///
/// let settings = AmqpSettings::builder()
///     .host("rabbit.internal")
///     .port(5671)
///     .build();
/// assert_eq!(settings.host(), "rabbit.internal");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpSettings {
    host: String,
    port: u16,
    user: String,
    password: String,
    vhost: String,
    timeout: Duration,
}

impl Default for AmqpSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            user: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl AmqpSettings {
    /// Creates a settings builder with default values.
    pub fn builder() -> AmqpSettingsBuilder {
        AmqpSettingsBuilder::default()
    }

    /// Builds settings from the environment, falling back to defaults.
    ///
    /// Recognized variables: `MILLRACE_AMQP_HOST`, `MILLRACE_AMQP_PORT`,
    /// `MILLRACE_AMQP_USER`, `MILLRACE_AMQP_PASSWORD`,
    /// `MILLRACE_AMQP_VHOST`, `MILLRACE_AMQP_TIMEOUT_SECS`. Unparseable
    /// numeric values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Ok(host) = env::var("MILLRACE_AMQP_HOST") {
            settings.host = host;
        }
        if let Ok(port) = env::var("MILLRACE_AMQP_PORT") {
            match port.parse() {
                Ok(port) => settings.port = port,
                Err(_) => warn!(value = %port, "ignoring unparseable MILLRACE_AMQP_PORT"),
            }
        }
        if let Ok(user) = env::var("MILLRACE_AMQP_USER") {
            settings.user = user;
        }
        if let Ok(password) = env::var("MILLRACE_AMQP_PASSWORD") {
            settings.password = password;
        }
        if let Ok(vhost) = env::var("MILLRACE_AMQP_VHOST") {
            settings.vhost = vhost;
        }
        if let Ok(secs) = env::var("MILLRACE_AMQP_TIMEOUT_SECS") {
            match secs.parse() {
                Ok(secs) => settings.timeout = Duration::from_secs(secs),
                Err(_) => {
                    warn!(value = %secs, "ignoring unparseable MILLRACE_AMQP_TIMEOUT_SECS")
                }
            }
        }
        settings
    }

    /// Broker hostname.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Broker port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Username.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Password.
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Virtual host.
    pub fn vhost(&self) -> &str {
        &self.vhost
    }

    /// Connect timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// `host:port/vhost`, for log and error messages.
    pub fn endpoint(&self) -> String {
        format!("{}:{}{}", self.host, self.port, self.vhost)
    }
}

/// Builder for [`AmqpSettings`].
#[derive(Debug, Clone, Default)]
pub struct AmqpSettingsBuilder {
    settings: AmqpSettings,
}

impl AmqpSettingsBuilder {
    /// Sets the broker hostname.
    pub fn host(mut self, value: impl Into<String>) -> Self {
        self.settings.host = value.into();
        self
    }

    /// Sets the broker port.
    pub fn port(mut self, value: u16) -> Self {
        self.settings.port = value;
        self
    }

    /// Sets the username.
    pub fn user(mut self, value: impl Into<String>) -> Self {
        self.settings.user = value.into();
        self
    }

    /// Sets the password.
    pub fn password(mut self, value: impl Into<String>) -> Self {
        self.settings.password = value.into();
        self
    }

    /// Sets the virtual host.
    pub fn vhost(mut self, value: impl Into<String>) -> Self {
        self.settings.vhost = value.into();
        self
    }

    /// Sets the connect timeout.
    pub fn timeout(mut self, value: Duration) -> Self {
        self.settings.timeout = value;
        self
    }

    /// Builds the settings.
    pub fn build(self) -> AmqpSettings {
        self.settings
    }
}

/// The identity a live link was opened under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PoolKey {
    pid: u32,
    settings: AmqpSettings,
}

impl PoolKey {
    fn current(settings: &AmqpSettings) -> Self {
        Self {
            pid: std::process::id(),
            settings: settings.clone(),
        }
    }
}

/// A live connection plus its single channel. Both handles are cheap
/// clones over the underlying I/O task.
#[derive(Clone)]
pub(crate) struct Link {
    pub(crate) connection: Connection,
    pub(crate) channel: Channel,
}

/// One function's reply-queue bookkeeping under the current link: the
/// queue name, the routing state shared with the dispatcher task, and
/// whether that dispatcher's consumer has been started.
pub(crate) struct ReplyRouteHandle {
    pub(crate) queue: String,
    pub(crate) route: Arc<SyncMutex<ReplyRoute>>,
    pub(crate) consuming: bool,
}

/// Mutable pool state: the link and the per-function RPC bookkeeping
/// that lives and dies with it.
#[derive(Default)]
pub(crate) struct PoolState {
    key: Option<PoolKey>,
    link: Option<Link>,
    /// Function name → reply routing, minted on first need.
    routes: HashMap<String, ReplyRouteHandle>,
}

impl PoolState {
    /// The reply routing for `function`, minting a fresh UUID queue name
    /// and an empty route on first use.
    pub(crate) fn route_for(&mut self, function: &str) -> &mut ReplyRouteHandle {
        self.routes
            .entry(function.to_string())
            .or_insert_with(|| ReplyRouteHandle {
                queue: Uuid::new_v4().to_string(),
                route: Arc::new(SyncMutex::new(ReplyRoute::default())),
                consuming: false,
            })
    }

    /// The reply queue name for `function`.
    pub(crate) fn reply_queue_for(&mut self, function: &str) -> String {
        self.route_for(function).queue.clone()
    }

    /// Reply queue names declared under the current link.
    pub(crate) fn reply_queue_names(&self) -> Vec<String> {
        self.routes.values().map(|handle| handle.queue.clone()).collect()
    }

    /// Drops the link and every piece of state tied to it.
    ///
    /// Orphaned dispatcher tasks notice when their delivery stream
    /// closes and fail any waiters still registered with them.
    pub(crate) fn reset(&mut self) -> Option<Link> {
        self.key = None;
        self.routes.clear();
        self.link.take()
    }
}

/// Owner of the single live link. Declarations, publishes, and consumer
/// startup are serialized behind its lock; reply consumption belongs to
/// the per-queue dispatcher tasks.
pub(crate) struct ChannelPool {
    settings: AmqpSettings,
    state: Mutex<PoolState>,
}

impl ChannelPool {
    pub(crate) fn new(settings: AmqpSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub(crate) fn settings(&self) -> &AmqpSettings {
        &self.settings
    }

    /// Locks the pool. Never held across an indefinite wait.
    pub(crate) async fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().await
    }

    /// Returns the live link, opening one if there is none, the process
    /// has forked, or the connection has died.
    ///
    /// A replaced link's reply queues and result caches are discarded: a
    /// fork must not touch the parent's channel, and a dead connection's
    /// consumers are gone with it.
    pub(crate) async fn ensure_link(
        &self,
        state: &mut PoolState,
    ) -> Result<Link, BrokerError> {
        let key = PoolKey::current(&self.settings);
        let healthy = state.key.as_ref() == Some(&key)
            && state
                .link
                .as_ref()
                .is_some_and(|link| link.connection.is_open() && link.channel.is_open());
        if healthy {
            if let Some(link) = state.link.clone() {
                return Ok(link);
            }
        }

        if state.link.is_some() {
            debug!("dropping stale AMQP link (fork or dead connection)");
            // Never close a link that may belong to the parent process;
            // dropping the handles is sufficient on this side.
            let _ = state.reset();
        }

        let link = self.open_link().await?;
        state.key = Some(key);
        state.link = Some(link.clone());
        Ok(link)
    }

    async fn open_link(&self) -> Result<Link, BrokerError> {
        let settings = &self.settings;
        info!(endpoint = %settings.endpoint(), "opening AMQP connection");

        let mut open_args = OpenConnectionArguments::new(
            settings.host(),
            settings.port(),
            settings.user(),
            settings.password(),
        );
        open_args.virtual_host(settings.vhost());

        let connection = tokio::time::timeout(settings.timeout(), Connection::open(&open_args))
            .await
            .map_err(|_| BrokerError::ConnectTimeout {
                endpoint: settings.endpoint(),
                seconds: settings.timeout().as_secs(),
            })??;

        let channel = connection.open_channel(Some(1)).await?;
        channel.basic_qos(BasicQosArguments::new(0, 1, false)).await?;

        debug!(endpoint = %settings.endpoint(), "AMQP channel 1 open, prefetch 1");
        Ok(Link {
            connection,
            channel,
        })
    }
}

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

//! Process configuration.
//!
//! A [`Configuration`] is an explicit value holding the active
//! [`Broker`] handle. Every [`JobFunction`](crate::JobFunction) returns
//! one from its `configuration()` method, which is how submissions find
//! their transport; tests construct descriptors by supplying a broker
//! directly.
//!
//! For applications that want a single shared broker, [`install`] places a
//! configuration in a process-wide slot exactly once during startup, and
//! [`installed`] retrieves it. The slot is never consulted implicitly by
//! broker code; descriptors opt in by calling [`installed`] from their own
//! `configuration()` implementation.

use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::broker::Broker;
use crate::error::ConfigError;

static PROCESS_CONFIGURATION: OnceCell<Configuration> = OnceCell::new();

/// A value holding the active broker handle for a set of job functions.
#[derive(Clone)]
pub struct Configuration {
    broker: Arc<dyn Broker>,
}

impl Configuration {
    /// Creates a configuration around a broker handle.
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// The broker this configuration routes jobs through.
    pub fn broker(&self) -> Arc<dyn Broker> {
        Arc::clone(&self.broker)
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration").finish_non_exhaustive()
    }
}

/// Installs the process-wide default configuration.
///
/// May be called at most once, during startup; a second call returns
/// [`ConfigError::AlreadyInstalled`] and leaves the original in place.
pub fn install(configuration: Configuration) -> Result<(), ConfigError> {
    PROCESS_CONFIGURATION
        .set(configuration)
        .map_err(|_| ConfigError::AlreadyInstalled)
}

/// The process-wide default configuration, if one has been installed.
pub fn installed() -> Option<&'static Configuration> {
    PROCESS_CONFIGURATION.get()
}

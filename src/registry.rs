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

//! String-keyed function registry.
//!
//! The function name is a string at the wire boundary, so worker dispatch
//! consults a registry keyed by name. A worker process serves exactly one
//! function, and its registry is built at startup via
//! [`FunctionRegistry::single`]; a delivery naming any other task is a
//! queue cross-wiring bug, not a dispatch miss.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ConfigError;
use crate::function::JobFunction;

/// Maps function names to their descriptors.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn JobFunction>>,
}

impl FunctionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding exactly one function, as built at
    /// worker startup.
    pub fn single(function: Arc<dyn JobFunction>) -> Self {
        let mut registry = Self::new();
        registry
            .register(function)
            .expect("an empty registry has no duplicates");
        registry
    }

    /// Registers a function under its name. Names must be unique.
    pub fn register(&mut self, function: Arc<dyn JobFunction>) -> Result<(), ConfigError> {
        let name = function.name().to_string();
        if self.functions.contains_key(&name) {
            return Err(ConfigError::DuplicateFunction { name });
        }
        self.functions.insert(name, function);
        Ok(())
    }

    /// Looks up a function by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn JobFunction>> {
        self.functions.get(name)
    }

    /// Registered function names, in arbitrary order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::Value;

    use super::*;
    use crate::config::Configuration;
    use crate::error::JobError;
    use crate::function::JobArgs;

    struct Named(&'static str);

    #[async_trait]
    impl JobFunction for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn configuration(&self) -> Configuration {
            unreachable!("registry tests never submit")
        }

        async fn run(&self, _args: &JobArgs) -> Result<Value, JobError> {
            Ok(Value::Null)
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = FunctionRegistry::new();
        registry.register(Arc::new(Named("Addition"))).unwrap();
        registry.register(Arc::new(Named("ReverseString"))).unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.get("Addition").is_some());
        assert!(registry.get("Missing").is_none());
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let mut registry = FunctionRegistry::new();
        registry.register(Arc::new(Named("Addition"))).unwrap();
        let err = registry.register(Arc::new(Named("Addition"))).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::DuplicateFunction { name } if name == "Addition"
        ));
    }

    #[test]
    fn test_single_builds_one_entry() {
        let registry = FunctionRegistry::single(Arc::new(Named("Addition")));
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_empty());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["Addition"]);
    }
}

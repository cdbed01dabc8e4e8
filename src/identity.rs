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

//! Job identity and fingerprinting.
//!
//! Three flavors of identifier live here:
//!
//! - [`unique_job_id`]: a deterministic SHA-256 fingerprint of a
//!   `(function, args)` pair. Hashing keeps the identifier under the
//!   64-byte cap some downstream consumers impose, while staying stable
//!   across processes and arg insertion orders.
//! - [`path_safe_job_id`]: a per-invocation identifier safe to embed in
//!   file names, built from a fresh UUID plus the fingerprint.
//! - [`job_id_from_handle`]: normalization of broker-assigned handles to
//!   a stable job id.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::BrokerError;
use crate::function::JobArgs;

/// Path-safe identifiers are truncated to this many characters.
const PATH_SAFE_MAX_LEN: usize = 256;

/// Legacy Gearman-style handle tail, e.g. `H:worker.host:17`.
static GEARMAN_HANDLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^H:.+?:\d+$").expect("gearman handle pattern is valid")
});

/// Renders one argument value for the signature string.
///
/// JSON null renders as the literal `undef`; strings render unquoted;
/// everything else renders as compact JSON.
fn render_value(value: &Value) -> String {
    match value {
        Value::Null => "undef".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Renders the canonical call signature `name(k1 = v1, k2 = v2)`.
///
/// Keys are sorted ascending so the rendering is independent of the args
/// map's insertion order.
pub fn args_signature(name: &str, args: &JobArgs) -> String {
    let mut keys: Vec<&String> = args.keys().collect();
    keys.sort();
    let joined = keys
        .iter()
        .map(|key| format!("{} = {}", key, render_value(&args[key.as_str()])))
        .collect::<Vec<_>>()
        .join(", ");
    format!("{}({})", name, joined)
}

/// Deterministic fingerprint of a `(function, args)` pair: the lowercase
/// SHA-256 hex of [`args_signature`]. Always 64 characters.
pub fn unique_job_id(name: &str, args: &JobArgs) -> String {
    let mut hasher = Sha256::new();
    hasher.update(args_signature(name, args).as_bytes());
    hex::encode(hasher.finalize())
}

/// A per-invocation identifier safe for use in file paths.
///
/// A fresh UUIDv4 (hyphens stripped) concatenated with
/// [`unique_job_id`], truncated to 256 characters, with every character
/// outside `[A-Za-z0-9.\-_(),=]` replaced by `_`.
pub fn path_safe_job_id(name: &str, args: &JobArgs) -> String {
    let mut id = format!(
        "{}{}",
        Uuid::new_v4().simple(),
        unique_job_id(name, args)
    );
    id.truncate(PATH_SAFE_MAX_LEN);
    id.chars()
        .map(|c| match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '.' | '-' | '_' | '(' | ')' | ',' | '=' => c,
            _ => '_',
        })
        .collect()
}

/// Normalizes a broker handle to a stable job id.
///
/// When the handle contains `"//"` the substring after it is taken,
/// otherwise the whole string. The tail is accepted if it matches the
/// legacy Gearman handle form `H:<host>:<n>` or is a non-empty raw id
/// with no slashes or whitespace (the AMQP broker hands back the job id
/// itself).
pub fn job_id_from_handle(handle: &str) -> Result<String, BrokerError> {
    let id = match handle.split_once("//") {
        Some((_, tail)) => tail,
        None => handle,
    };
    if GEARMAN_HANDLE.is_match(id) {
        return Ok(id.to_string());
    }
    if !id.is_empty() && !id.contains('/') && !id.chars().any(char::is_whitespace) {
        return Ok(id.to_string());
    }
    Err(BrokerError::protocol(format!(
        "invalid job handle: {:?}",
        handle
    )))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn args(value: serde_json::Value) -> JobArgs {
        value.as_object().cloned().expect("args must be an object")
    }

    #[test]
    fn test_signature_sorts_keys_and_renders_undef() {
        let a = args(json!({"b": 5, "a": 3}));
        assert_eq!(args_signature("Addition", &a), "Addition(a = 3, b = 5)");

        let a = args(json!({"z": null, "name": "ferris"}));
        assert_eq!(
            args_signature("Greet", &a),
            "Greet(name = ferris, z = undef)"
        );
    }

    #[test]
    fn test_signature_empty_args() {
        assert_eq!(args_signature("Tick", &JobArgs::new()), "Tick()");
    }

    #[test]
    fn test_unique_job_id_is_deterministic_hex() {
        let a = args(json!({"a": 3, "b": 5}));
        let first = unique_job_id("Addition", &a);
        let second = unique_job_id("Addition", &a);
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(first, first.to_lowercase());
    }

    #[test]
    fn test_unique_job_id_ignores_insertion_order() {
        let forward = args(json!({"a": 3, "b": 5}));
        let mut reversed = JobArgs::new();
        reversed.insert("b".to_string(), json!(5));
        reversed.insert("a".to_string(), json!(3));
        assert_eq!(
            unique_job_id("Addition", &forward),
            unique_job_id("Addition", &reversed)
        );
    }

    #[test]
    fn test_unique_job_id_differs_across_names_and_args() {
        let a = args(json!({"a": 3}));
        let b = args(json!({"a": 4}));
        assert_ne!(unique_job_id("F", &a), unique_job_id("F", &b));
        assert_ne!(unique_job_id("F", &a), unique_job_id("G", &a));
    }

    #[test]
    fn test_path_safe_job_id_charset_and_length() {
        let a = args(json!({"path": "/tmp/some file!", "n": 1}));
        let id = path_safe_job_id("Ingest", &a);
        assert!(id.len() <= 256);
        assert!(id
            .chars()
            .all(|c| c.is_ascii_alphanumeric()
                || matches!(c, '.' | '-' | '_' | '(' | ')' | ',' | '=')));
    }

    #[test]
    fn test_path_safe_job_id_is_unique_per_call() {
        let a = args(json!({"a": 1}));
        assert_ne!(path_safe_job_id("F", &a), path_safe_job_id("F", &a));
    }

    #[test]
    fn test_handle_gearman_form() {
        let id = job_id_from_handle("gearman://H:worker.example.com:42").unwrap();
        assert_eq!(id, "H:worker.example.com:42");
        assert_eq!(
            job_id_from_handle("H:w:1").unwrap(),
            "H:w:1"
        );
    }

    #[test]
    fn test_handle_raw_amqp_id() {
        let raw = "5e6f90c2f0a24bbfae2e4d0c1f1c2b3a";
        assert_eq!(job_id_from_handle(raw).unwrap(), raw);
        assert_eq!(
            job_id_from_handle(&format!("amqp://{}", raw)).unwrap(),
            raw
        );
    }

    #[test]
    fn test_handle_invalid_inputs() {
        assert!(job_id_from_handle("").is_err());
        assert!(job_id_from_handle("amqp://").is_err());
        assert!(job_id_from_handle("queue://a/b").is_err());
        assert!(job_id_from_handle("has space").is_err());
    }
}

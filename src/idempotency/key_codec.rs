use crate::error::{IdempotencyError, Result};
use crate::observability::mask_sensitive;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};

/// Configuration for idempotency key resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyCodecConfig {
    /// Header / query parameter name the key is read from
    pub key_name: String,
    /// Whether a request without any usable key is an error
    pub require_key: bool,
    pub allow_query_key: bool,
    pub allow_body_key: bool,
}

impl Default for KeyCodecConfig {
    fn default() -> Self {
        Self {
            key_name: "Idempotency-Key".to_string(),
            require_key: true,
            allow_query_key: true,
            allow_body_key: true,
        }
    }
}

/// A readable body that can be rewound.
pub trait ReadSeek: Read + Seek {}

impl<T: Read + Seek> ReadSeek for T {}

/// The parts of an incoming request a key may be taken from.
#[derive(Default)]
pub struct KeySource<'a> {
    headers: Option<&'a HeaderMap>,
    query: Option<&'a HashMap<String, String>>,
    body: Option<&'a mut dyn ReadSeek>,
}

impl<'a> KeySource<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_headers(mut self, headers: &'a HeaderMap) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn with_query(mut self, query: &'a HashMap<String, String>) -> Self {
        self.query = Some(query);
        self
    }

    pub fn with_body(mut self, body: &'a mut dyn ReadSeek) -> Self {
        self.body = Some(body);
        self
    }

    fn header(&self, name: &str) -> Option<String> {
        self.headers?
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }

    fn query_param(&self, name: &str) -> Option<String> {
        self.query?
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }

    /// Reads the whole body and puts the read position back where it was.
    fn read_body(&mut self) -> Option<Vec<u8>> {
        let body = self.body.as_deref_mut()?;
        let position = match body.stream_position() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("Request body is not seekable: {}", e);
                return None;
            }
        };

        let mut buf = Vec::new();
        let read = body
            .seek(SeekFrom::Start(0))
            .and_then(|_| body.read_to_end(&mut buf));
        let restored = body.seek(SeekFrom::Start(position));

        if let Err(e) = read.and(restored) {
            tracing::warn!("Failed to read request body for key derivation: {}", e);
            return None;
        }

        Some(buf)
    }
}

/// Derives and extracts idempotency keys.
#[derive(Debug, Clone, Default)]
pub struct KeyCodec {
    config: KeyCodecConfig,
}

impl KeyCodec {
    pub fn new(config: KeyCodecConfig) -> Self {
        Self { config }
    }

    pub fn with_default_config() -> Self {
        Self::new(KeyCodecConfig::default())
    }

    pub fn config(&self) -> &KeyCodecConfig {
        &self.config
    }

    /// Derives a key from structured data: canonical JSON, SHA-256, base64url without padding.
    pub fn derive_key<T: Serialize + ?Sized>(&self, data: &T) -> Result<String> {
        let value = serde_json::to_value(data)?;
        if value.is_null() {
            return Err(IdempotencyError::invalid_argument(
                "Cannot derive an idempotency key from null data",
            ));
        }

        let canonical = serde_json::to_vec(&canonicalize(value))?;
        Ok(self.derive_key_from_bytes(&canonical))
    }

    /// Derives a key from raw bytes.
    pub fn derive_key_from_bytes(&self, bytes: &[u8]) -> String {
        let digest = Sha256::digest(bytes);
        URL_SAFE_NO_PAD.encode(digest)
    }

    /// Scalars are their own key; anything composite is hashed.
    pub fn derive_key_from_scalar<T: Serialize + ?Sized>(&self, value: &T) -> Result<String> {
        match serde_json::to_value(value)? {
            Value::Null => Err(IdempotencyError::invalid_argument(
                "Cannot derive an idempotency key from a null value",
            )),
            Value::String(s) if s.trim().is_empty() => Err(IdempotencyError::invalid_argument(
                "Cannot derive an idempotency key from a blank string",
            )),
            Value::String(s) => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            composite => self.derive_key(&composite),
        }
    }

    /// Resolves a key from header, then query parameter, then body content.
    ///
    /// The body's read position is left where it was found.
    pub fn extract_key(&self, source: &mut KeySource<'_>, preferred_name: &str) -> Result<String> {
        if let Some(key) = source.header(preferred_name) {
            tracing::debug!(key = %mask_sensitive(&key, 4), "Idempotency key taken from header");
            return Ok(key);
        }

        if self.config.allow_query_key {
            if let Some(key) = source.query_param(preferred_name) {
                tracing::debug!(key = %mask_sensitive(&key, 4), "Idempotency key taken from query");
                return Ok(key);
            }
        }

        if self.config.allow_body_key {
            if let Some(body) = source.read_body().filter(|b| !b.is_empty()) {
                let key = match serde_json::from_slice::<Value>(&body) {
                    Ok(json) if !json.is_null() => self.derive_key(&json)?,
                    _ => self.derive_key_from_bytes(&body),
                };
                tracing::debug!(key = %mask_sensitive(&key, 4), "Idempotency key derived from body");
                return Ok(key);
            }
        }

        Err(IdempotencyError::MissingKey {
            name: preferred_name.to_string(),
        })
    }

    /// Like [`extract_key`](Self::extract_key) with the configured name; a missing key is
    /// `Ok(None)` unless keys are required.
    pub fn resolve_key(&self, source: &mut KeySource<'_>) -> Result<Option<String>> {
        match self.extract_key(source, &self.config.key_name) {
            Ok(key) => Ok(Some(key)),
            Err(IdempotencyError::MissingKey { .. }) if !self.config.require_key => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Rebuilds objects with keys in sorted order, recursively.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k, canonicalize(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

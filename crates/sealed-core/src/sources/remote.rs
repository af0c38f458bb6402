//! HTTP entropy proxies (hardware RNG, quantum RNG).
//!
//! Wire format:
//!
//! ```text
//! GET {endpoint}?length=N&source=<label>
//! → { "success": true, "bytes": [17, 201, ...], "source": "...", "server_time": "..." }
//! ```
//!
//! Any fallback or degraded flag in the payload is a hard failure. A proxy
//! that silently switched to a PRNG would corrupt the audit trail.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EntropyError;
use crate::source::{EntropySource, RawByteBatch, SourceKind};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// JSON body returned by an entropy proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntropyPayload {
    pub success: bool,
    #[serde(default)]
    pub bytes: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_time: Option<String>,
    #[serde(default, alias = "is_fallback", skip_serializing_if = "Option::is_none")]
    pub fallback: Option<bool>,
    #[serde(default, alias = "low_quality", skip_serializing_if = "Option::is_none")]
    pub degraded: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EntropyPayload {
    /// Successful payload carrying `bytes`.
    pub fn ok(bytes: &[u8], source: impl Into<String>, server_time: Option<String>) -> Self {
        Self {
            success: true,
            bytes: bytes.iter().map(|&b| i64::from(b)).collect(),
            source: Some(source.into()),
            server_time,
            fallback: None,
            degraded: None,
            error: None,
        }
    }

    /// Failure payload with a message.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            bytes: Vec::new(),
            source: None,
            server_time: None,
            fallback: None,
            degraded: None,
            error: Some(message.into()),
        }
    }
}

/// Check a decoded payload and turn it into a batch of exactly `expected` bytes.
pub fn validate_payload(
    payload: EntropyPayload,
    expected: usize,
    kind: SourceKind,
    label: &str,
) -> Result<RawByteBatch, EntropyError> {
    if !payload.success {
        return Err(EntropyError::Rejected {
            source_label: label.to_string(),
            message: payload.error.unwrap_or_else(|| "success=false".to_string()),
        });
    }
    if payload.fallback.unwrap_or(false) || payload.degraded.unwrap_or(false) {
        return Err(EntropyError::Fallback {
            source_label: label.to_string(),
        });
    }
    if payload.bytes.len() != expected {
        return Err(EntropyError::ShortBatch {
            source_label: label.to_string(),
            expected,
            got: payload.bytes.len(),
        });
    }
    let mut bytes = Vec::with_capacity(expected);
    for (i, &value) in payload.bytes.iter().enumerate() {
        let byte = u8::try_from(value).map_err(|_| EntropyError::Malformed {
            source_label: label.to_string(),
            message: format!("value {value} at position {i} is outside 0..=255"),
        })?;
        bytes.push(byte);
    }

    let mut batch = RawByteBatch::new(kind, payload.source.unwrap_or_else(|| label.to_string()), bytes);
    batch.server_time = payload.server_time;
    Ok(batch)
}

/// Entropy proxy reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpEntropySource {
    kind: SourceKind,
    endpoint: String,
    label: String,
    client: reqwest::Client,
}

impl HttpEntropySource {
    /// Create a source for `endpoint` with the default request timeout.
    pub fn new(kind: SourceKind, endpoint: impl Into<String>) -> Result<Self, EntropyError> {
        Self::with_timeout(kind, endpoint, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        kind: SourceKind,
        endpoint: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, EntropyError> {
        let endpoint = endpoint.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EntropyError::Transport {
                source_label: kind.label().to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            kind,
            label: format!("{}@{}", kind.label(), endpoint),
            endpoint,
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl EntropySource for HttpEntropySource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn label(&self) -> &str {
        &self.label
    }

    async fn fetch(&self, n: usize) -> Result<RawByteBatch, EntropyError> {
        if n == 0 {
            return Err(EntropyError::InvalidRequest("zero bytes requested".into()));
        }
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("length", n.to_string()), ("source", self.kind.label().to_string())])
            .send()
            .await
            .map_err(|e| EntropyError::Transport {
                source_label: self.label.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(EntropyError::Status {
                source_label: self.label.clone(),
                status: status.as_u16(),
            });
        }

        let payload: EntropyPayload =
            response.json().await.map_err(|e| EntropyError::Malformed {
                source_label: self.label.clone(),
                message: e.to_string(),
            })?;
        validate_payload(payload, n, self.kind, &self.label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> EntropyPayload {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_valid_payload() {
        let payload = parse(
            r#"{"success": true, "bytes": [0, 17, 255], "source": "anu", "server_time": "2026-01-01T00:00:00Z"}"#,
        );
        let batch = validate_payload(payload, 3, SourceKind::QuantumProxy, "q").unwrap();
        assert_eq!(batch.bytes, vec![0, 17, 255]);
        assert_eq!(batch.source, "anu");
        assert_eq!(batch.server_time.as_deref(), Some("2026-01-01T00:00:00Z"));
    }

    #[test]
    fn test_success_false_is_rejected() {
        let payload = parse(r#"{"success": false, "error": "quota exceeded"}"#);
        let err = validate_payload(payload, 4, SourceKind::QuantumProxy, "q").unwrap_err();
        assert!(matches!(err, EntropyError::Rejected { ref message, .. } if message == "quota exceeded"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_fallback_flag_is_hard_failure() {
        for json in [
            r#"{"success": true, "bytes": [1, 2], "fallback": true}"#,
            r#"{"success": true, "bytes": [1, 2], "is_fallback": true}"#,
            r#"{"success": true, "bytes": [1, 2], "degraded": true}"#,
        ] {
            let err = validate_payload(parse(json), 2, SourceKind::HardwareProxy, "hw").unwrap_err();
            assert!(matches!(err, EntropyError::Fallback { .. }), "{json}");
        }
    }

    #[test]
    fn test_fallback_false_is_accepted() {
        let payload = parse(r#"{"success": true, "bytes": [9, 8], "fallback": false}"#);
        let batch = validate_payload(payload, 2, SourceKind::HardwareProxy, "hw").unwrap();
        assert_eq!(batch.source, "hw");
    }

    #[test]
    fn test_out_of_range_value_is_malformed() {
        let payload = parse(r#"{"success": true, "bytes": [1, 256]}"#);
        let err = validate_payload(payload, 2, SourceKind::HardwareProxy, "hw").unwrap_err();
        assert!(matches!(err, EntropyError::Malformed { .. }));

        let payload = parse(r#"{"success": true, "bytes": [-1, 3]}"#);
        assert!(validate_payload(payload, 2, SourceKind::HardwareProxy, "hw").is_err());
    }

    #[test]
    fn test_short_batch() {
        let payload = parse(r#"{"success": true, "bytes": [1, 2, 3]}"#);
        let err = validate_payload(payload, 4, SourceKind::HardwareProxy, "hw").unwrap_err();
        assert!(matches!(err, EntropyError::ShortBatch { expected: 4, got: 3, .. }));
    }

    #[test]
    fn test_payload_ok_roundtrips_through_validation() {
        let payload = EntropyPayload::ok(&[3, 250], "local", None);
        let json = serde_json::to_string(&payload).unwrap();
        assert!(!json.contains("fallback"));
        let batch = validate_payload(parse(&json), 2, SourceKind::LocalSecure, "l").unwrap();
        assert_eq!(batch.bytes, vec![3, 250]);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transport_error() {
        let source = HttpEntropySource::with_timeout(
            SourceKind::HardwareProxy,
            "http://127.0.0.1:9/api/v1/bytes",
            Duration::from_millis(500),
        )
        .unwrap();
        let err = source.fetch(8).await.unwrap_err();
        assert!(matches!(err, EntropyError::Transport { .. }));
        assert!(err.is_retryable());
    }
}

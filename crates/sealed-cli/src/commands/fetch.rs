use std::sync::Arc;

use sealed_core::{EngineConfig, EntropyAdapter, EntropySource, HttpEntropySource, LocalSecureSource, SourceKind};

/// Build an adapter holding exactly the requested source.
pub fn build_adapter(
    config: &EngineConfig,
    kind: SourceKind,
    endpoint: Option<&str>,
) -> Result<EntropyAdapter, String> {
    let source: Arc<dyn EntropySource> = match (kind, endpoint) {
        (SourceKind::LocalSecure, _) => Arc::new(LocalSecureSource::new()),
        (_, Some(url)) => Arc::new(HttpEntropySource::new(kind, url).map_err(|e| e.to_string())?),
        (_, None) => return Err(format!("--endpoint is required for {kind}")),
    };
    Ok(EntropyAdapter::from_config(config).with_source(source))
}

pub fn run(config: &EngineConfig, source: &str, endpoint: Option<&str>, n: usize, format: &str) {
    let kind: SourceKind = match source.parse() {
        Ok(k) => k,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };
    let adapter = match build_adapter(config, kind, endpoint) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    let rt = super::runtime();
    let batch = match rt.block_on(adapter.fetch_bytes(n, kind)) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("Entropy unavailable: {e}");
            std::process::exit(1);
        }
    };

    match format {
        "json" => match serde_json::to_string_pretty(&batch) {
            Ok(s) => println!("{s}"),
            Err(e) => {
                eprintln!("Failed to encode batch: {e}");
                std::process::exit(1);
            }
        },
        _ => {
            let hex: String = batch.bytes.iter().map(|b| format!("{b:02x}")).collect();
            println!("{hex}");
            eprintln!("{} bytes from {} (batch {})", batch.len(), batch.source, batch.batch_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_requires_endpoint() {
        let err = build_adapter(&EngineConfig::default(), SourceKind::QuantumProxy, None)
            .err()
            .unwrap();
        assert!(err.contains("--endpoint"));
    }

    #[test]
    fn test_local_adapter() {
        let adapter = build_adapter(&EngineConfig::default(), SourceKind::LocalSecure, None).unwrap();
        assert!(adapter.has(SourceKind::LocalSecure));
        assert!(!adapter.has(SourceKind::HardwareProxy));
    }

    #[tokio::test]
    async fn test_local_fetch_through_adapter() {
        let adapter = build_adapter(&EngineConfig::default(), SourceKind::LocalSecure, None).unwrap();
        let batch = adapter.fetch_bytes(40, SourceKind::LocalSecure).await.unwrap();
        assert_eq!(batch.len(), 40);
    }
}

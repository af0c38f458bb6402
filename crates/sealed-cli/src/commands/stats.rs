use std::path::Path;

use sealed_core::EngineConfig;
use sealed_stats::{AggregationMode, AuditConfig, AuditReport, IngestError, audit, ingest, render_text};

/// Audit parameters shared with the engine configuration.
pub fn audit_config(config: &EngineConfig) -> AuditConfig {
    AuditConfig {
        symbol_count: config.symbol_count,
        round_size: config.round_size,
        round_win_hits: config.round_win_hits,
        significance_alpha: config.significance_alpha,
        ..Default::default()
    }
}

pub fn audit_document(
    doc: &serde_json::Value,
    mode: AggregationMode,
    config: &EngineConfig,
) -> Result<AuditReport, IngestError> {
    let audit_config = audit_config(config);
    let sessions = ingest(doc, &audit_config)?;
    Ok(audit(&sessions, mode, &audit_config))
}

pub fn run(config: &EngineConfig, path: &Path, mode: &str, json: bool) {
    let mode: AggregationMode = match mode.parse() {
        Ok(m) => m,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };
    let doc: serde_json::Value = super::read_json(path);
    let report = match audit_document(&doc, mode, config) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Failed to ingest {}: {e}", path.display());
            std::process::exit(1);
        }
    };

    if json {
        match serde_json::to_string_pretty(&report) {
            Ok(s) => println!("{s}"),
            Err(e) => {
                eprintln!("Failed to encode report: {e}");
                std::process::exit(1);
            }
        }
    } else {
        print!("{}", render_text(&report));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_config_follows_engine() {
        let engine = EngineConfig {
            significance_alpha: 0.01,
            ..Default::default()
        };
        let cfg = audit_config(&engine);
        assert_eq!(cfg.symbol_count, 5);
        assert_eq!(cfg.significance_alpha, 0.01);
    }

    #[tokio::test]
    async fn test_simulated_bundle_audits() {
        let opts = super::super::simulate::SimulateOptions {
            trials: 10,
            blocks: 1,
            participants: 3,
            hit_rate: 1.0,
            seed: Some(4),
            remap: None,
            store_dir: None,
        };
        let bundle = super::super::simulate::simulate(EngineConfig::default(), &opts)
            .await
            .unwrap();
        let doc = serde_json::to_value(&bundle).unwrap();

        let report = audit_document(&doc, AggregationMode::Pooled, &EngineConfig::default()).unwrap();
        assert_eq!(report.sessions.len(), 3);
        assert_eq!(report.pooled.trials, 30);
        assert_eq!(report.pooled.hits, 30);
        assert!(report.pooled.exact.significant);
        assert!(report.sessions.iter().all(|r| r.rounds_total == 2 && r.rounds_won == 2));

        let first = audit_document(&doc, AggregationMode::FirstSession, &EngineConfig::default()).unwrap();
        assert_eq!(first.pooled.sessions, 3);
        assert!(first.pooled.participant_t.is_some());
    }
}

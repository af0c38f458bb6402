use std::path::Path;

use sealed_core::{BlockVerdict, ExportBundle, VerifyReport, verify_bundle};

pub fn render(report: &VerifyReport) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{:<38} {:<38} {:>6}  {}\n",
        "Session", "Block", "Trials", "Verdict"
    ));
    out.push_str(&format!("{}\n", "-".repeat(100)));
    for b in &report.blocks {
        let verdict = match &b.verdict {
            BlockVerdict::Verified => "verified".to_string(),
            BlockVerdict::Unverifiable { reason } => format!("unverifiable ({reason})"),
            BlockVerdict::Failed { problems } => format!("FAILED ({} problems)", problems.len()),
        };
        out.push_str(&format!(
            "{:<38} {:<38} {:>6}  {verdict}\n",
            b.session_id, b.block_id, b.trials
        ));
        if let BlockVerdict::Failed { problems } = &b.verdict {
            for p in problems {
                out.push_str(&format!("    - {p}\n"));
            }
        }
    }
    out.push_str(&format!(
        "\n{} verified, {} unverifiable, {} failed\n",
        report.verified, report.unverifiable, report.failed
    ));
    out
}

pub fn run(path: &Path, json: bool) {
    let bundle: ExportBundle = super::read_json(path);
    let report = verify_bundle(&bundle);

    if json {
        match serde_json::to_string_pretty(&report) {
            Ok(s) => println!("{s}"),
            Err(e) => {
                eprintln!("Failed to encode report: {e}");
                std::process::exit(1);
            }
        }
    } else {
        print!("{}", render(&report));
    }

    if !report.is_ok() {
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sealed_core::BlockReport;

    #[test]
    fn test_render_lists_problems() {
        let report = VerifyReport {
            blocks: vec![
                BlockReport {
                    session_id: "s1".into(),
                    block_id: "b1".into(),
                    trials: 10,
                    verdict: BlockVerdict::Verified,
                },
                BlockReport {
                    session_id: "s1".into(),
                    block_id: "b2".into(),
                    trials: 4,
                    verdict: BlockVerdict::Failed {
                        problems: vec!["trial 3: bytes differ from tape position 3".into()],
                    },
                },
            ],
            verified: 1,
            unverifiable: 0,
            failed: 1,
        };
        let text = render(&report);
        assert!(text.contains("verified"));
        assert!(text.contains("FAILED (1 problems)"));
        assert!(text.contains("- trial 3"));
        assert!(text.contains("1 verified, 0 unverifiable, 1 failed"));
    }

    #[tokio::test]
    async fn test_bundle_round_trips_through_file() {
        let opts = super::super::simulate::SimulateOptions {
            trials: 5,
            blocks: 1,
            participants: 1,
            hit_rate: 0.2,
            seed: Some(1),
            remap: None,
            store_dir: None,
        };
        let bundle = super::super::simulate::simulate(sealed_core::EngineConfig::default(), &opts)
            .await
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.json");
        std::fs::write(&path, serde_json::to_string(&bundle).unwrap()).unwrap();

        let parsed: ExportBundle = super::super::read_json(&path);
        let report = verify_bundle(&parsed);
        assert_eq!(report.verified, 1);
    }
}

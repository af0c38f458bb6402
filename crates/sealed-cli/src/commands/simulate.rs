//! Synthetic participants driven through real commit-reveal sessions.
//!
//! Entropy, commitments and reveals are genuine; only the participant's
//! choice is simulated. A participant "sees" the target with probability
//! `hit_rate` and otherwise picks uniformly among the other positions.
//! Under HMAC rotation the target is only fixed at click time, so the
//! simulated edge disappears and hits fall back to chance.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sealed_core::{
    DocumentStore, EngineConfig, EngineError, EntropyAdapter, ExportBundle, FileStore, LocalSecureSource,
    MemoryStore, RemapMode, SYMBOL_COUNT, Session, SourceKind, export_all, now_ms,
};

pub struct SimulateOptions {
    pub trials: usize,
    pub blocks: usize,
    pub participants: usize,
    pub hit_rate: f64,
    pub seed: Option<u64>,
    pub remap: Option<RemapMode>,
    pub store_dir: Option<PathBuf>,
}

fn choose(rng: &mut StdRng, target: u8, hit_rate: f64) -> u8 {
    if rng.random_bool(hit_rate.clamp(0.0, 1.0)) {
        return target;
    }
    let other = rng.random_range(0..SYMBOL_COUNT as u8 - 1);
    if other >= target { other + 1 } else { other }
}

/// Run every simulated session and export the store as one bundle.
pub async fn simulate(mut config: EngineConfig, opts: &SimulateOptions) -> Result<ExportBundle, EngineError> {
    // No one is watching the flashes.
    config.flash_duration_ms = 0;
    config.inter_stimulus_interval_ms = 0;
    if let Some(remap) = opts.remap {
        config.remap = remap;
    }

    let store: Arc<dyn DocumentStore> = match &opts.store_dir {
        Some(dir) => Arc::new(FileStore::new(dir)),
        None => Arc::new(MemoryStore::new()),
    };
    let adapter = Arc::new(EntropyAdapter::from_config(&config).with_source(Arc::new(LocalSecureSource::new())));
    let mut rng = match opts.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };

    for p in 0..opts.participants {
        let participant = format!("sim-{:03}", p + 1);
        let mut session = Session::start(
            config.clone(),
            adapter.clone(),
            store.clone(),
            SourceKind::LocalSecure,
            &participant,
            opts.trials * opts.blocks,
        )
        .await?;
        session.set_consent("simulated");

        for _ in 0..opts.blocks {
            let block = session.start_block(opts.trials).await?;
            while !block.is_complete().await {
                let Some(trial) = session.prepare_trial().await?.ready() else {
                    continue;
                };
                let Some(shown) = block.present(&trial).await?.ready() else {
                    continue;
                };
                let pick = choose(&mut rng, trial.assignment.target_index, opts.hit_rate);
                let latency = rng.random_range(350..1800u64);
                session
                    .record_response(&trial, shown, Some(pick), Some(latency), now_ms())
                    .await?;
            }
            if !session.finish_block().await? {
                log::warn!("{participant}: reveal pending for block {}", block.block_id());
            }
        }
        let aggregate = session.finalize().await?;
        log::info!(
            "{participant}: {} trials, {} hits, {} decoy hits",
            aggregate.total_trials,
            aggregate.total_hits,
            aggregate.total_decoy_hits
        );
    }

    Ok(export_all(store).await?)
}

pub fn run(config: EngineConfig, opts: SimulateOptions, out: &Path) {
    if opts.trials == 0 || opts.blocks == 0 || opts.participants == 0 {
        eprintln!("--trials, --blocks and --participants must all be positive");
        std::process::exit(2);
    }
    if !(0.0..=1.0).contains(&opts.hit_rate) {
        eprintln!("--hit-rate must be within 0..=1");
        std::process::exit(2);
    }

    let rt = super::runtime();
    let bundle = match rt.block_on(simulate(config, &opts)) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("Simulation failed: {e}");
            std::process::exit(1);
        }
    };

    let json = match serde_json::to_string_pretty(&bundle) {
        Ok(j) => j,
        Err(e) => {
            eprintln!("Failed to encode bundle: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = std::fs::write(out, json) {
        eprintln!("Failed to write {}: {e}", out.display());
        std::process::exit(1);
    }

    let trials: usize = bundle
        .sessions
        .iter()
        .flat_map(|s| &s.blocks)
        .map(|b| b.trials.len())
        .sum();
    println!(
        "Simulated {} sessions, {trials} trials -> {}",
        bundle.sessions.len(),
        out.display()
    );
}

pub mod fetch;
pub mod serve;
pub mod simulate;
pub mod stats;
pub mod verify;

use std::path::Path;

use sealed_core::{EngineConfig, RemapMode};

/// Load and validate the engine configuration, or defaults when no file is given.
/// Exits on an unreadable or inconsistent file.
pub fn load_config(path: Option<&Path>) -> EngineConfig {
    let config = match path {
        Some(p) => match EngineConfig::load(p) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config {}: {e}", p.display());
                std::process::exit(1);
            }
        },
        None => EngineConfig::default(),
    };
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {e}");
        std::process::exit(1);
    }
    config
}

pub fn parse_remap(s: &str) -> RemapMode {
    match s {
        "hmac-rotation" | "hmac_rotation" => RemapMode::HmacRotation,
        _ => RemapMode::None,
    }
}

/// Multi-threaded tokio runtime for one command.
pub fn runtime() -> tokio::runtime::Runtime {
    match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start async runtime: {e}");
            std::process::exit(1);
        }
    }
}

/// Read a JSON file into `T`, exiting with a message on failure.
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> T {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Failed to read {}: {e}", path.display());
            std::process::exit(1);
        }
    };
    match serde_json::from_str(&text) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("Failed to parse {}: {e}", path.display());
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_remap() {
        assert_eq!(parse_remap("hmac-rotation"), RemapMode::HmacRotation);
        assert_eq!(parse_remap("none"), RemapMode::None);
    }

    #[test]
    fn test_load_config_defaults() {
        assert_eq!(load_config(None), EngineConfig::default());
    }

    #[test]
    fn test_load_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"flash_repeats": 3, "remap": "hmac_rotation"}"#).unwrap();
        let config = load_config(Some(&path));
        assert_eq!(config.flash_repeats, 3);
        assert_eq!(config.remap, RemapMode::HmacRotation);
    }
}

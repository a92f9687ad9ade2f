//! Layered settings for the simulation binary.
//!
//! Precedence, lowest first: built-in defaults, an optional TOML file, then
//! `CONSENSUS_SIM_*` environment variables. CLI flags are applied on top by
//! the binary.

use std::collections::HashMap;
use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use consensus_simulation::SimulationConfig;
use tracing::debug;

use crate::error::HarnessResult;

/// Prefix of environment variables overriding settings
pub const ENV_PREFIX: &str = "CONSENSUS_SIM";

/// Load settings from an optional TOML file and the process environment
pub fn load_settings(file: Option<&Path>) -> HarnessResult<SimulationConfig> {
    load_settings_with_env(file, None)
}

/// Load settings reading environment overrides from `env` instead of the
/// process environment when given
pub fn load_settings_with_env(
    file: Option<&Path>,
    env: Option<HashMap<String, String>>,
) -> HarnessResult<SimulationConfig> {
    let mut builder = Config::builder();

    if let Some(path) = file {
        debug!(path = %path.display(), "loading settings file");
        builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .try_parsing(true)
            .source(env),
    );

    let settings: SimulationConfig = builder.build()?.try_deserialize()?;
    Ok(settings)
}

/// Render settings as TOML
pub fn render_toml(config: &SimulationConfig) -> HarnessResult<String> {
    Ok(toml::to_string_pretty(config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn env(pairs: &[(&str, &str)]) -> Option<HashMap<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_defaults_without_sources() {
        let settings = load_settings_with_env(None, env(&[])).unwrap();
        assert_eq!(settings, SimulationConfig::default());
    }

    #[test]
    fn test_file_then_env_precedence() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("simulation.toml");
        std::fs::write(
            &path,
            "base_layer_node_url = \"http://l1:8545\"\nnum_validators = 6\nduration_secs = 120\n",
        )
        .unwrap();

        let from_file = load_settings_with_env(Some(&path), env(&[])).unwrap();
        assert_eq!(from_file.base_layer_node_url, "http://l1:8545");
        assert_eq!(from_file.num_validators, 6);
        assert_eq!(from_file.duration_secs, Some(120));
        assert_eq!(from_file.stagnation_timeout_secs, 60);

        let overridden = load_settings_with_env(
            Some(&path),
            env(&[
                ("CONSENSUS_SIM_NUM_VALIDATORS", "8"),
                ("CONSENSUS_SIM_METRIC_NAME", "papyrus_state_marker"),
            ]),
        )
        .unwrap();
        assert_eq!(overridden.num_validators, 8);
        assert_eq!(overridden.metric_name, "papyrus_state_marker");
        assert_eq!(overridden.base_layer_node_url, "http://l1:8545");
    }

    #[test]
    fn test_missing_file_is_error() {
        let result = load_settings_with_env(Some(Path::new("/nonexistent/simulation.toml")), env(&[]));
        assert_eq!(result.unwrap_err().exit_code(), 2);
    }

    #[test]
    fn test_render_round_trips_through_loader() {
        let config = SimulationConfig::new("http://localhost:8545")
            .with_validators(5)
            .with_data_root(PathBuf::from("/var/sim/data"));
        let rendered = render_toml(&config).unwrap();
        assert!(rendered.contains("num_validators = 5"));
        assert!(!rendered.contains("duration_secs"));

        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("dumped.toml");
        std::fs::write(&path, rendered).unwrap();
        assert_eq!(load_settings_with_env(Some(&path), env(&[])).unwrap(), config);
    }
}

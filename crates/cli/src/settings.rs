//! Configuration loading and exit-code mapping.

use std::path::Path;

use trigger::{Config, TriggerError};

/// Reads and validates the configuration file, applying the command-line
/// broker URL override before validation.
pub fn load(path: &Path, broker_url: Option<&str>) -> Result<Config, TriggerError> {
    let source = std::fs::read_to_string(path).map_err(|e| {
        TriggerError::config(format!("cannot read {}: {e}", path.display()))
    })?;
    let mut config = Config::from_toml_str(&source)?;
    if let Some(url) = broker_url {
        config.broker.broker_url = url.to_string();
        config.validate()?;
    }
    Ok(config)
}

/// `0` for success, the fatal error's own code for [`TriggerError`]s, `1`
/// for anything else.
pub fn exit_code(result: &anyhow::Result<()>) -> u8 {
    match result {
        Ok(()) => 0,
        Err(e) => e
            .downcast_ref::<TriggerError>()
            .map_or(1, TriggerError::exit_code),
    }
}

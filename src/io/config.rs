//! Scaling options from a JSON file.
//!
//! Missing keys take their defaults, so a file only needs the options it
//! changes.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::domain::ScalingConfig;
use crate::error::{ScaleError, ScaleResult};

pub fn read_scaling_config(path: &Path) -> ScaleResult<ScalingConfig> {
    let file = File::open(path)
        .map_err(|e| ScaleError::Io(format!("failed to open config '{}': {e}", path.display())))?;
    let config: ScalingConfig = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| ScaleError::Json(format!("invalid config '{}': {e}", path.display())))?;
    config.validate().map_err(ScaleError::InvalidInput)?;
    Ok(config)
}

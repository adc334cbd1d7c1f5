//! The conversion driver: build, load, smoke-test, serialize.

use log::{debug, info, warn};
use std::path::PathBuf;

use crate::darknet::load_darknet_weights;
use crate::error::{ConvertError, Result};
use crate::io::{diff_state_dict, load_state_dict, save_state_dict};
use crate::tensor::RawTensor;
use crate::yolo::YoloV3;

/// Everything one conversion run needs. Built once by the CLI and passed
/// down; there is no ambient configuration state.
#[derive(Debug, Clone)]
pub struct Config {
    /// Darknet weight file to read.
    pub input: PathBuf,
    /// Checkpoint file to write.
    pub output: PathBuf,
    /// Class count the weights were trained with.
    pub classes: usize,
    /// Square input resolution for the inference smoke test.
    pub size: usize,
}

/// Run a full conversion.
///
/// Builds the model, injects the Darknet weights, runs one random input
/// through the network to surface any shape mismatch early, then writes
/// the checkpoint and verifies it reads back identically.
pub fn run(config: &Config) -> Result<()> {
    if config.classes == 0 {
        return Err(ConvertError::InvalidParameter(
            "classes must be at least 1".to_string(),
        ));
    }
    if config.size == 0 || config.size % 32 != 0 {
        return Err(ConvertError::InvalidParameter(format!(
            "size must be a positive multiple of 32, got {}",
            config.size
        )));
    }

    let model = YoloV3::new(config.classes);
    info!("model created");

    load_darknet_weights(&model, &config.input)?;
    info!("weights loaded");

    let input = RawTensor::rand(&[1, config.size, config.size, 3]);
    let outputs = model.forward(&input);
    for (i, out) in outputs.iter().enumerate() {
        debug!("output {i} shape {:?}", out.borrow().shape);
    }
    info!("inference check done");

    let state = model.state_dict();
    save_state_dict(&state, &config.output)?;

    // Read the checkpoint back and make sure nothing was lost in transit.
    let written = load_state_dict(&config.output)?;
    let diff = diff_state_dict(&state, &written);
    if !diff.is_empty() {
        warn!(
            "checkpoint verification: {} missing, {} unexpected, {} mismatched",
            diff.missing_keys.len(),
            diff.unexpected_keys.len(),
            diff.shape_mismatches.len()
        );
        return Err(ConvertError::Serialization(
            "checkpoint did not read back identically".to_string(),
        ));
    }
    info!("weights saved to {}", config.output.display());
    Ok(())
}

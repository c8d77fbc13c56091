use std::path::{Path, PathBuf};

use candle_core::Device;
use serde::Deserialize;

use crate::error::{Result, Wav2LetterError};

/// Characters of the english corpus, in output-channel order.
pub const FREQUENT_CHARACTERS_IN_ENGLISH: &str = " abcdefghijklmnopqrstuvwxyz'";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Tanh,
    Sigmoid,
    /// Normalizes over the channel axis of every time step.
    Softmax,
    Linear,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OptimizerConfig {
    Adam { learning_rate: f64 },
    AdamW { learning_rate: f64, weight_decay: f64 },
    Sgd { learning_rate: f64 },
}

impl OptimizerConfig {
    pub const DEFAULT_LEARNING_RATE: f64 = 1e-4;

    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::Adam { learning_rate }
            | Self::AdamW { learning_rate, .. }
            | Self::Sgd { learning_rate } => *learning_rate,
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::Adam {
            learning_rate: Self::DEFAULT_LEARNING_RATE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Wav2LetterConfig {
    pub input_size_per_time_step: usize,
    pub allowed_characters: String,
    pub use_raw_wave_input: bool,
    pub activation: Activation,
    pub output_activation: Activation,
    pub optimizer: OptimizerConfig,
    pub dropout: Option<f32>,
    pub load_from_directory: Option<PathBuf>,
    pub load_epoch: Option<u64>,
    pub frozen_layer_count: usize,
    pub use_asg: bool,
    /// Indexed `[next][previous]`, `(G + 1) x (G + 1)` with row/column 0 as sentinel.
    pub asg_transition_probabilities: Option<Vec<Vec<f32>>>,
    pub asg_initial_probabilities: Option<Vec<f32>>,
    pub main_filter_count: usize,
    pub output_filter_count: usize,
    pub device: String,
    pub seed: Option<u64>,
}

impl Wav2LetterConfig {
    pub const DEFAULT_MAIN_FILTER_COUNT: usize = 250;
    pub const DEFAULT_OUTPUT_FILTER_COUNT: usize = 2000;

    pub fn new(input_size_per_time_step: usize) -> Self {
        Self {
            input_size_per_time_step,
            ..Default::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| Wav2LetterError::io("read model config", e))?;
        serde_json::from_str(&data).map_err(|e| Wav2LetterError::json("parse model config", e))
    }

    /// Checks everything that does not depend on the built network.
    pub fn validate(&self) -> Result<()> {
        if self.input_size_per_time_step == 0 {
            return Err(Wav2LetterError::configuration(
                "input_size_per_time_step must be positive",
            ));
        }
        if self.main_filter_count == 0 || self.output_filter_count == 0 {
            return Err(Wav2LetterError::configuration(
                "filter counts must be positive",
            ));
        }
        if let Some(rate) = self.dropout {
            if !(0.0..1.0).contains(&rate) {
                return Err(Wav2LetterError::configuration(format!(
                    "dropout rate {rate} is outside [0, 1)"
                )));
            }
        }
        let learning_rate = self.optimizer.learning_rate();
        if !(learning_rate.is_finite() && learning_rate > 0.0) {
            return Err(Wav2LetterError::configuration(format!(
                "learning rate {learning_rate} must be positive"
            )));
        }
        if self.load_from_directory.is_some() && self.load_epoch.is_none() {
            return Err(Wav2LetterError::configuration(
                "load_epoch is required when load_from_directory is set",
            ));
        }
        Ok(())
    }

    pub fn device(&self) -> Result<Device> {
        match self.device.as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Device::new_cuda(0).map_err(|e| Wav2LetterError::runtime("CUDA init", e)),
            "metal" => Device::new_metal(0).map_err(|e| Wav2LetterError::runtime("Metal init", e)),
            other => Err(Wav2LetterError::configuration(format!(
                "unknown device {other:?}"
            ))),
        }
    }
}

impl Default for Wav2LetterConfig {
    fn default() -> Self {
        Self {
            input_size_per_time_step: 0,
            allowed_characters: FREQUENT_CHARACTERS_IN_ENGLISH.to_string(),
            use_raw_wave_input: false,
            activation: Activation::Relu,
            output_activation: Activation::Softmax,
            optimizer: OptimizerConfig::default(),
            dropout: None,
            load_from_directory: None,
            load_epoch: None,
            frozen_layer_count: 0,
            use_asg: false,
            asg_transition_probabilities: None,
            asg_initial_probabilities: None,
            main_filter_count: Self::DEFAULT_MAIN_FILTER_COUNT,
            output_filter_count: Self::DEFAULT_OUTPUT_FILTER_COUNT,
            device: "cpu".to_string(),
            seed: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub samples_per_epoch: usize,
    /// Epoch cadence of the expected-vs-predicted report.
    pub report_every: u64,
    /// Epoch cadence of weight checkpoints.
    pub save_every: u64,
    pub net_directory: PathBuf,
    /// `None` trains until the batch stream ends or the process is stopped.
    pub max_epochs: Option<u64>,
}

impl TrainingConfig {
    pub fn new(net_directory: impl Into<PathBuf>, samples_per_epoch: usize) -> Self {
        Self {
            samples_per_epoch,
            report_every: 1,
            save_every: 1,
            net_directory: net_directory.into(),
            max_epochs: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.samples_per_epoch == 0 {
            return Err(Wav2LetterError::configuration(
                "samples_per_epoch must be positive",
            ));
        }
        if self.report_every == 0 || self.save_every == 0 {
            return Err(Wav2LetterError::configuration(
                "report and save cadences must be positive",
            ));
        }
        Ok(())
    }
}

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    /// Full self-attention, one phoneme prediction per input position.
    Forward,
    /// Causally masked self-attention.
    Autoregressive,
}

#[derive(Debug, Clone, Serialize, Parser)]
#[command(
    name = "jp-g2p-trainer",
    about = "Train a Japanese grapheme-to-phoneme model from a phoneme dictionary using Candle"
)]
pub struct TrainConfig {
    #[arg(
        long,
        default_value = "data/ja_phonemes.json",
        help = "Path to the word -> phoneme JSON dictionary"
    )]
    pub dictionary: String,

    #[arg(
        long,
        help = "Optional additional lexicon, overrides dictionary entries on collision"
    )]
    pub lexicon: Option<String>,

    #[arg(long, default_value = "./training-output")]
    pub output_dir: String,

    #[arg(long, value_enum, default_value_t = ModelType::Forward)]
    pub model_type: ModelType,

    #[arg(long, default_value_t = 50)]
    pub epochs: usize,

    #[arg(long, default_value_t = 32)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 1e-3)]
    pub learning_rate: f64,

    #[arg(long, default_value_t = 1e-4)]
    pub weight_decay: f64,

    #[arg(long, default_value_t = 0.8)]
    pub train_ratio: f32,

    #[arg(long, default_value_t = 0.1)]
    pub val_ratio: f32,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    #[arg(
        long,
        default_value_t = false,
        help = "Augment training data with synthetic variants"
    )]
    pub augment: bool,

    #[arg(
        long,
        default_value_t = false,
        help = "Export trained weights to an interchange artifact after training"
    )]
    pub export: bool,

    #[arg(long, default_value = "auto", help = "auto|cpu|cuda")]
    pub device: String,

    #[arg(long)]
    pub run_name: Option<String>,

    #[arg(
        long,
        default_value_t = 0,
        help = "Truncate the dictionary to this many entries (0 = all)"
    )]
    pub max_samples: usize,

    #[arg(long, default_value_t = 256)]
    pub d_model: usize,

    #[arg(long, default_value_t = 4)]
    pub layers: usize,

    #[arg(long, default_value_t = 4)]
    pub heads: usize,

    #[arg(long, default_value_t = 0.1)]
    pub dropout: f32,

    #[arg(long, default_value_t = 10)]
    pub log_every_batches: usize,
}

impl TrainConfig {
    /// Defaults without touching the process arguments, used by the dashboard.
    pub fn defaults() -> Self {
        Self::parse_from(["jp-g2p-trainer"])
    }

    /// Checked before any data is loaded.
    pub fn validate(&self) -> crate::Result<()> {
        if self.train_ratio < 0.0 || self.val_ratio < 0.0 {
            return Err(PipelineError::Config(format!(
                "split ratios must be >= 0, got train={} val={}",
                self.train_ratio, self.val_ratio
            )));
        }
        if self.train_ratio + self.val_ratio > 1.0 {
            return Err(PipelineError::Config(format!(
                "train-ratio + val-ratio must be <= 1, got {}",
                self.train_ratio + self.val_ratio
            )));
        }
        if self.epochs == 0 {
            return Err(PipelineError::Config("--epochs must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(PipelineError::Config("--batch-size must be > 0".into()));
        }
        if self.learning_rate <= 0.0 {
            return Err(PipelineError::Config(format!(
                "--learning-rate must be > 0, got {}",
                self.learning_rate
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(PipelineError::Config(format!(
                "--dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if self.heads == 0 || self.d_model % self.heads != 0 {
            return Err(PipelineError::Config(format!(
                "--d-model ({}) must be divisible by --heads ({})",
                self.d_model, self.heads
            )));
        }
        if self.layers == 0 {
            return Err(PipelineError::Config("--layers must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PipelineError;

    fn cfg() -> TrainConfig {
        TrainConfig::defaults()
    }

    #[test]
    fn default_config_is_valid() {
        assert!(cfg().validate().is_ok());
    }

    #[test]
    fn rejects_negative_ratio() {
        let mut c = cfg();
        c.val_ratio = -0.1;
        assert!(matches!(c.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn rejects_ratios_above_one() {
        let mut c = cfg();
        c.train_ratio = 0.8;
        c.val_ratio = 0.3;
        assert!(matches!(c.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn rejects_indivisible_heads() {
        let mut c = cfg();
        c.d_model = 250;
        c.heads = 4;
        assert!(matches!(c.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn rejects_zero_batch_size() {
        let mut c = cfg();
        c.batch_size = 0;
        assert!(c.validate().is_err());
    }
}

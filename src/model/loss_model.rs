use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap, SGD};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::batch::{SequenceBatchAssembler, TrainingBatch};
use crate::config::{Activation, OptimizerConfig, Wav2LetterConfig};
use crate::encoding::asg::{default_initial_probabilities, default_transition_probabilities};
use crate::encoding::{
    AsgGraphemeEncoding, AsgTransitions, CtcGraphemeEncoding, GraphemeEncoding,
};
use crate::error::{Result, Wav2LetterError};
use crate::model::ctc::ctc_loss;
use crate::model::network::{AcousticNetwork, AcousticNetworkBuilder};
use crate::training::checkpoint::CheckpointStore;
use crate::types::{FeatureSequence, LabeledExample};

/// Floor applied to non-softmax outputs before taking the log.
const PROBABILITY_EPSILON: f32 = 1e-7;

#[derive(Debug, Clone)]
pub enum AlignmentLoss {
    Ctc { blank: usize },
    /// Transition/initial tables are kept so they can be fed to an ASG
    /// criterion; computing that criterion is not supported.
    Asg(AsgTransitions),
}

enum ModelOptimizer {
    AdamW(AdamW),
    Sgd(SGD),
}

impl ModelOptimizer {
    fn new(config: &OptimizerConfig, vars: Vec<Var>) -> candle_core::Result<Self> {
        Ok(match *config {
            OptimizerConfig::Adam { learning_rate } => Self::AdamW(AdamW::new(
                vars,
                ParamsAdamW {
                    lr: learning_rate,
                    weight_decay: 0.0,
                    ..Default::default()
                },
            )?),
            OptimizerConfig::AdamW {
                learning_rate,
                weight_decay,
            } => Self::AdamW(AdamW::new(
                vars,
                ParamsAdamW {
                    lr: learning_rate,
                    weight_decay,
                    ..Default::default()
                },
            )?),
            OptimizerConfig::Sgd { learning_rate } => Self::Sgd(SGD::new(vars, learning_rate)?),
        })
    }

    fn backward_step(&mut self, loss: &Tensor) -> candle_core::Result<()> {
        match self {
            Self::AdamW(optimizer) => optimizer.backward_step(loss),
            Self::Sgd(optimizer) => optimizer.backward_step(loss),
        }
    }
}

/// The acoustic network plus the alignment loss stage used to train it.
///
/// Inference (`predict`) runs with dropout disabled; training (`train_step`)
/// runs with dropout enabled and updates every trainable parameter once.
pub struct AlignmentLossModel {
    encoding: Box<dyn GraphemeEncoding>,
    loss: AlignmentLoss,
    network: AcousticNetwork,
    varmap: VarMap,
    optimizer: ModelOptimizer,
    assembler: SequenceBatchAssembler,
    device: Device,
    load_epoch: Option<u64>,
}

impl AlignmentLossModel {
    pub fn new(config: Wav2LetterConfig) -> Result<Self> {
        config.validate()?;
        let device = config.device()?;
        let (encoding, loss) = grapheme_encoding_and_loss(&config)?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let network =
            AcousticNetworkBuilder::from_config(&config, encoding.grapheme_set_size()).build(vb)?;
        let optimizer = ModelOptimizer::new(&config.optimizer, network.trainable_vars(&varmap)?)
            .map_err(|e| Wav2LetterError::runtime("build optimizer", e))?;

        tracing::info!(
            layers = network.spec().layers().len(),
            graphemes = encoding.grapheme_set_size(),
            total_stride = network.total_stride(),
            asg = config.use_asg,
            ?device,
            "wav2letter network built"
        );

        let mut model = Self {
            encoding,
            loss,
            assembler: SequenceBatchAssembler::new(network.total_stride()),
            network,
            varmap,
            optimizer,
            device,
            load_epoch: None,
        };

        if let Some(directory) = &config.load_from_directory {
            let epoch = config.load_epoch.ok_or_else(|| {
                Wav2LetterError::configuration(
                    "load_epoch is required when load_from_directory is set",
                )
            })?;
            CheckpointStore::new(directory).load(&model.varmap, epoch)?;
            model.load_epoch = Some(epoch);
        }
        Ok(model)
    }

    pub fn grapheme_encoding(&self) -> &dyn GraphemeEncoding {
        self.encoding.as_ref()
    }

    pub fn alignment_loss(&self) -> &AlignmentLoss {
        &self.loss
    }

    pub fn network(&self) -> &AcousticNetwork {
        &self.network
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn assembler(&self) -> &SequenceBatchAssembler {
        &self.assembler
    }

    /// Epoch of the checkpoint the weights were restored from, if any.
    pub fn load_epoch(&self) -> Option<u64> {
        self.load_epoch
    }

    pub fn input_to_prediction_length_ratio(&self) -> usize {
        self.network.total_stride()
    }

    /// Per-frame grapheme probabilities `(batch, time, graphemes)` with
    /// dropout disabled, plus each example's true output length.
    pub fn prediction_batch(&self, features: &[&FeatureSequence]) -> Result<(Tensor, Vec<usize>)> {
        let padded = self.assembler.assemble(features)?;
        self.check_input_width(padded.width())?;
        let xs = padded
            .to_tensor(&self.device)
            .map_err(|e| Wav2LetterError::runtime("tensor creation", e))?;
        let probabilities = self
            .network
            .forward(&xs, false)
            .map_err(|e| Wav2LetterError::runtime("forward pass", e))?;
        Ok((probabilities, self.assembler.expected_output_lengths(padded.lengths())))
    }

    pub fn predict(&self, features: &[&FeatureSequence]) -> Result<Vec<String>> {
        let (probabilities, output_lengths) = self.prediction_batch(features)?;
        let probabilities: Vec<Vec<Vec<f32>>> = probabilities
            .to_vec3()
            .map_err(|e| Wav2LetterError::runtime("to_vec3", e))?;
        Ok(self
            .encoding
            .decode_prediction_batch(&probabilities, &output_lengths))
    }

    pub fn predict_single(&self, features: &FeatureSequence) -> Result<String> {
        Ok(self.predict(&[features])?.pop().unwrap_or_default())
    }

    pub fn training_batch<E: LabeledExample>(&self, examples: &[E]) -> Result<TrainingBatch> {
        self.assembler.labeled_batch(examples, self.encoding.as_ref())
    }

    /// Per-example loss with dropout disabled.
    pub fn example_losses(&self, batch: &TrainingBatch) -> Result<Vec<f32>> {
        self.loss_tensor(batch, false)?
            .to_vec1()
            .map_err(|e| Wav2LetterError::runtime("to_vec1", e))
    }

    /// Mean loss over the batch with dropout disabled.
    pub fn loss(&self, batch: &TrainingBatch) -> Result<f32> {
        mean_scalar(&self.loss_tensor(batch, false)?)
    }

    /// One optimizer update; returns the loss computed before the update.
    pub fn train_step(&mut self, batch: &TrainingBatch) -> Result<f32> {
        let losses = self.loss_tensor(batch, true)?;
        let loss = losses
            .mean_all()
            .map_err(|e| Wav2LetterError::runtime("mean loss", e))?;
        let value = loss
            .to_scalar::<f32>()
            .map_err(|e| Wav2LetterError::runtime("loss to scalar", e))?;
        if !value.is_finite() {
            return Err(Wav2LetterError::runtime(
                "train step",
                format!("loss became {value}"),
            ));
        }
        self.optimizer
            .backward_step(&loss)
            .map_err(|e| Wav2LetterError::runtime("optimizer step", e))?;
        Ok(value)
    }

    pub fn save_weights(&self, path: &std::path::Path) -> Result<()> {
        self.varmap
            .save(path)
            .map_err(|e| Wav2LetterError::runtime("save weights", e))
    }

    fn loss_tensor(&self, batch: &TrainingBatch, training: bool) -> Result<Tensor> {
        let blank = match &self.loss {
            AlignmentLoss::Ctc { blank } => *blank,
            AlignmentLoss::Asg(_) => return Err(Wav2LetterError::unsupported("ASG loss")),
        };

        self.check_input_width(batch.features.width())?;
        let xs = batch
            .features
            .to_tensor(&self.device)
            .map_err(|e| Wav2LetterError::runtime("tensor creation", e))?;
        let logits = self
            .network
            .forward_logits(&xs, training)
            .map_err(|e| Wav2LetterError::runtime("forward pass", e))?;
        let (_, frames, _) = logits
            .dims3()
            .map_err(|e| Wav2LetterError::runtime("prediction dims3", e))?;
        self.check_alignable(batch, frames)?;
        tracing::debug!(?batch.output_lengths, frames, "computing CTC loss");

        let log_probs = self
            .log_probabilities(&logits)
            .map_err(|e| Wav2LetterError::runtime("log probabilities", e))?;
        ctc_loss(&log_probs, &batch.targets, &batch.output_lengths, blank)
            .map_err(|e| Wav2LetterError::runtime("ctc loss", e))
    }

    fn log_probabilities(&self, logits: &Tensor) -> candle_core::Result<Tensor> {
        match self.network.output_activation() {
            Activation::Softmax => candle_nn::ops::log_softmax(logits, D::Minus1),
            _ => {
                let probabilities = self.network.apply_output_activation(logits)?;
                probabilities.clamp(PROBABILITY_EPSILON, 1f32)?.log()
            }
        }
    }

    fn check_input_width(&self, width: usize) -> Result<()> {
        let expected = self.network.spec().input_size();
        if width != expected {
            return Err(Wav2LetterError::configuration(format!(
                "network takes {expected} features per time step, batch has {width}"
            )));
        }
        Ok(())
    }

    fn check_alignable(&self, batch: &TrainingBatch, frames: usize) -> Result<()> {
        let lengths = batch.targets.iter().zip(&batch.output_lengths);
        for (index, (target, &length)) in lengths.enumerate() {
            if length > frames {
                return Err(Wav2LetterError::shape_mismatch(format!(
                    "example {index} expects {length} output frames but the network produced {frames}"
                )));
            }
            if target.min_ctc_frames() > length {
                return Err(Wav2LetterError::shape_mismatch(format!(
                    "example {index} needs at least {} output frames for its label, has {length}",
                    target.min_ctc_frames()
                )));
            }
        }
        Ok(())
    }
}

fn mean_scalar(losses: &Tensor) -> Result<f32> {
    losses
        .mean_all()
        .and_then(|t| t.to_scalar::<f32>())
        .map_err(|e| Wav2LetterError::runtime("mean loss", e))
}

fn grapheme_encoding_and_loss(
    config: &Wav2LetterConfig,
) -> Result<(Box<dyn GraphemeEncoding>, AlignmentLoss)> {
    if !config.use_asg {
        let encoding = CtcGraphemeEncoding::new(&config.allowed_characters)?;
        let blank = encoding.blank_index();
        return Ok((Box::new(encoding), AlignmentLoss::Ctc { blank }));
    }

    let size = config.allowed_characters.chars().count();
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let transition = match &config.asg_transition_probabilities {
        Some(table) => table.clone(),
        None => default_transition_probabilities(size, &mut rng),
    };
    let initial = match &config.asg_initial_probabilities {
        Some(initial) => initial.clone(),
        None => default_initial_probabilities(size, &mut rng),
    };
    let transitions = AsgTransitions::new(transition, initial, size)?;
    let encoding = AsgGraphemeEncoding::new(&config.allowed_characters, transitions.clone())?;
    Ok((Box::new(encoding), AlignmentLoss::Asg(transitions)))
}

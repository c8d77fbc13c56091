use candle_core::{Device, Tensor};

use crate::encoding::GraphemeEncoding;
use crate::error::{Result, Wav2LetterError};
use crate::types::{FeatureSequence, LabeledExample, TargetSequence};

/// Zero-padded `(batch, max_length, width)` features plus the true lengths.
#[derive(Debug, Clone, PartialEq)]
pub struct PaddedFeatures {
    values: Vec<f32>,
    max_length: usize,
    width: usize,
    lengths: Vec<usize>,
}

impl PaddedFeatures {
    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn to_tensor(&self, device: &Device) -> candle_core::Result<Tensor> {
        Tensor::from_slice(
            &self.values,
            (self.batch_size(), self.max_length, self.width),
            device,
        )
    }
}

/// Zero-padded `(batch, max_label_length)` grapheme indices plus true lengths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddedLabels {
    values: Vec<u32>,
    max_length: usize,
    lengths: Vec<usize>,
}

impl PaddedLabels {
    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    pub fn row(&self, index: usize) -> Option<&[u32]> {
        let start = index * self.max_length;
        let length = *self.lengths.get(index)?;
        self.values.get(start..start + length)
    }

    pub fn values(&self) -> &[u32] {
        &self.values
    }
}

/// One training step's worth of examples, padded and validated.
#[derive(Debug, Clone)]
pub struct TrainingBatch {
    pub features: PaddedFeatures,
    pub labels: PaddedLabels,
    pub targets: Vec<TargetSequence>,
    pub output_lengths: Vec<usize>,
}

impl TrainingBatch {
    pub fn batch_size(&self) -> usize {
        self.features.batch_size()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SequenceBatchAssembler {
    total_stride: usize,
}

impl SequenceBatchAssembler {
    /// `total_stride` comes from a validated `NetworkSpec` and is never zero.
    pub fn new(total_stride: usize) -> Self {
        debug_assert!(total_stride > 0, "total stride must be positive");
        Self { total_stride }
    }

    pub fn total_stride(&self) -> usize {
        self.total_stride
    }

    pub fn assemble(&self, features: &[&FeatureSequence]) -> Result<PaddedFeatures> {
        let first = features
            .first()
            .ok_or_else(|| Wav2LetterError::shape_mismatch("cannot assemble an empty batch"))?;
        let width = first.width();
        if let Some((index, odd)) = features.iter().enumerate().find(|(_, f)| f.width() != width) {
            return Err(Wav2LetterError::shape_mismatch(format!(
                "example {index} has feature width {}, batch width is {width}",
                odd.width()
            )));
        }

        let lengths: Vec<usize> = features.iter().map(|f| f.len()).collect();
        let max_length = lengths.iter().copied().max().unwrap_or(0);
        let mut values = vec![0f32; features.len() * max_length * width];
        for (index, sequence) in features.iter().enumerate() {
            let start = index * max_length * width;
            values[start..start + sequence.values().len()].copy_from_slice(sequence.values());
        }

        Ok(PaddedFeatures {
            values,
            max_length,
            width,
            lengths,
        })
    }

    pub fn expected_output_lengths(&self, feature_lengths: &[usize]) -> Vec<usize> {
        expected_output_lengths(feature_lengths, self.total_stride)
    }

    pub fn assemble_labels(&self, targets: &[TargetSequence]) -> PaddedLabels {
        let lengths: Vec<usize> = targets.iter().map(TargetSequence::len).collect();
        let max_length = lengths.iter().copied().max().unwrap_or(0);
        let mut values = vec![0u32; targets.len() * max_length];
        for (index, target) in targets.iter().enumerate() {
            let start = index * max_length;
            values[start..start + target.len()].copy_from_slice(&target.indices);
        }
        PaddedLabels {
            values,
            max_length,
            lengths,
        }
    }

    /// Pads features and labels given as parallel lists.
    pub fn training_batch(
        &self,
        features: &[&FeatureSequence],
        labels: &[&str],
        encoding: &dyn GraphemeEncoding,
    ) -> Result<TrainingBatch> {
        if features.len() != labels.len() {
            return Err(Wav2LetterError::shape_mismatch(format!(
                "batch has {} feature sequences but {} labels",
                features.len(),
                labels.len()
            )));
        }
        let features = self.assemble(features)?;
        let targets = encoding.encode_label_batch(labels)?;
        let output_lengths = self.expected_output_lengths(features.lengths());

        for (index, (target, &output_length)) in targets.iter().zip(&output_lengths).enumerate() {
            if target.len() > output_length {
                return Err(Wav2LetterError::shape_mismatch(format!(
                    "label {index} has {} graphemes but only {output_length} output frames",
                    target.len()
                )));
            }
        }

        let labels = self.assemble_labels(&targets);
        Ok(TrainingBatch {
            features,
            labels,
            targets,
            output_lengths,
        })
    }

    pub fn labeled_batch<E: LabeledExample>(
        &self,
        examples: &[E],
        encoding: &dyn GraphemeEncoding,
    ) -> Result<TrainingBatch> {
        let features: Vec<&FeatureSequence> =
            examples.iter().map(LabeledExample::feature_sequence).collect();
        let labels: Vec<&str> = examples.iter().map(LabeledExample::label).collect();
        self.training_batch(&features, &labels, encoding)
    }
}

/// Output frames each example maps to after striding by `total_stride`.
pub fn expected_output_lengths(feature_lengths: &[usize], total_stride: usize) -> Vec<usize> {
    debug_assert!(total_stride > 0, "total stride must be positive");
    feature_lengths.iter().map(|&len| len / total_stride).collect()
}

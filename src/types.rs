use serde::Deserialize;

use crate::error::{Result, Wav2LetterError};

/// Per-time-step feature vectors of one example, stored row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSequence {
    values: Vec<f32>,
    width: usize,
}

impl FeatureSequence {
    pub fn new(values: Vec<f32>, width: usize) -> Result<Self> {
        if width == 0 || values.len() % width != 0 {
            return Err(Wav2LetterError::shape_mismatch(format!(
                "{} values cannot be split into frames of width {width}",
                values.len()
            )));
        }
        Ok(Self { values, width })
    }

    pub fn from_frames(frames: Vec<Vec<f32>>) -> Result<Self> {
        let width = frames.first().map(Vec::len).unwrap_or(0);
        let mut values = Vec::with_capacity(frames.len() * width);
        for (index, frame) in frames.into_iter().enumerate() {
            if frame.len() != width {
                return Err(Wav2LetterError::shape_mismatch(format!(
                    "frame {index} has width {}, expected {width}",
                    frame.len()
                )));
            }
            values.extend(frame);
        }
        Self::new(values, width)
    }

    /// Raw waveform samples, one value per time step.
    pub fn from_samples(samples: Vec<f32>) -> Self {
        Self {
            values: samples,
            width: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len() / self.width
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn frame(&self, index: usize) -> Option<&[f32]> {
        self.values.get(index * self.width..(index + 1) * self.width)
    }
}

/// Grapheme indices of one label; blanks are never stored here.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TargetSequence {
    pub indices: Vec<u32>,
}

impl TargetSequence {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Minimum number of output frames a CTC alignment of this target needs:
    /// one per symbol plus a separating blank between equal neighbours.
    pub fn min_ctc_frames(&self) -> usize {
        let repeats = self
            .indices
            .windows(2)
            .filter(|pair| pair[0] == pair[1])
            .count();
        self.indices.len() + repeats
    }
}

/// What the corpus collaborator hands over for each example.
pub trait LabeledExample {
    fn feature_sequence(&self) -> &FeatureSequence;
    fn label(&self) -> &str;
}

#[derive(Debug, Clone)]
pub struct LabeledFeatures {
    pub features: FeatureSequence,
    pub label: String,
}

impl LabeledExample for LabeledFeatures {
    fn feature_sequence(&self) -> &FeatureSequence {
        &self.features
    }

    fn label(&self) -> &str {
        &self.label
    }
}

/// Line format of a JSON-lines example manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    pub label: String,
    pub features: Vec<Vec<f32>>,
}

impl TryFrom<ManifestEntry> for LabeledFeatures {
    type Error = Wav2LetterError;

    fn try_from(entry: ManifestEntry) -> Result<Self> {
        Ok(Self {
            features: FeatureSequence::from_frames(entry.features)?,
            label: entry.label,
        })
    }
}

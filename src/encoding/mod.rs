//! Conversion between text labels and the network's grapheme space.

pub mod alphabet;
pub mod asg;
pub mod ctc;

pub use alphabet::Alphabet;
pub use asg::{AsgGraphemeEncoding, AsgTransitions};
pub use ctc::CtcGraphemeEncoding;

use crate::error::Result;
use crate::types::TargetSequence;

pub trait GraphemeEncoding: Send + Sync {
    fn alphabet(&self) -> &Alphabet;

    /// Number of output channels the network must produce.
    fn grapheme_set_size(&self) -> usize;

    fn encode(&self, label: &str) -> Result<TargetSequence> {
        self.alphabet().encode(label)
    }

    /// Decodes one example from per-frame probabilities `[time][grapheme]`,
    /// looking only at the first `output_length` frames.
    fn decode(&self, probabilities: &[Vec<f32>], output_length: usize) -> String;

    fn encode_label_batch(&self, labels: &[&str]) -> Result<Vec<TargetSequence>> {
        labels.iter().map(|label| self.encode(label)).collect()
    }

    fn decode_prediction_batch(
        &self,
        probabilities: &[Vec<Vec<f32>>],
        output_lengths: &[usize],
    ) -> Vec<String> {
        probabilities
            .iter()
            .zip(output_lengths)
            .map(|(example, &length)| self.decode(example, length))
            .collect()
    }
}

pub(crate) fn argmax(row: &[f32]) -> Option<usize> {
    row.iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (index, &p)| match best {
            Some((_, best_p)) if best_p >= p => best,
            _ => Some((index, p)),
        })
        .map(|(index, _)| index)
}

/// Collapses runs of equal symbols to one.
pub(crate) fn collapse_repeats(path: impl IntoIterator<Item = usize>) -> Vec<usize> {
    let mut collapsed: Vec<usize> = Vec::new();
    for symbol in path {
        if collapsed.last() != Some(&symbol) {
            collapsed.push(symbol);
        }
    }
    collapsed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argmax_prefers_first_maximum() {
        assert_eq!(argmax(&[0.1, 0.7, 0.7, 0.2]), Some(1));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn collapse_repeats_keeps_separated_runs() {
        assert_eq!(collapse_repeats([1, 1, 2, 2, 1, 3, 3]), vec![1, 2, 1, 3]);
        assert!(collapse_repeats(std::iter::empty()).is_empty());
    }
}

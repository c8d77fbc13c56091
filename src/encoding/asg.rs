use rand::Rng;

use crate::encoding::{collapse_repeats, Alphabet, GraphemeEncoding};
use crate::error::{Result, Wav2LetterError};

/// Exclusive upper bound of the integer weights drawn for default tables.
const DEFAULT_WEIGHT_RANGE: std::ops::Range<u32> = 1..15;

/// Floor applied to probabilities before taking the log.
const PROBABILITY_EPSILON: f32 = 1e-7;

fn floored_ln(p: f32) -> f32 {
    p.max(PROBABILITY_EPSILON).ln()
}

/// Transition and initial probabilities over `G + 1` states, where state 0 is
/// a sentinel that is never entered or left and grapheme `g` is state `g + 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct AsgTransitions {
    /// `[next][previous]`; every non-sentinel column sums to one.
    transition: Vec<Vec<f32>>,
    initial: Vec<f32>,
}

impl AsgTransitions {
    pub fn new(
        transition: Vec<Vec<f32>>,
        initial: Vec<f32>,
        grapheme_set_size: usize,
    ) -> Result<Self> {
        let states = grapheme_set_size + 1;
        if transition.len() != states || transition.iter().any(|row| row.len() != states) {
            return Err(Wav2LetterError::configuration(format!(
                "ASG transition table must be {states}x{states}"
            )));
        }
        if initial.len() != states {
            return Err(Wav2LetterError::configuration(format!(
                "ASG initial probabilities must have {states} entries, got {}",
                initial.len()
            )));
        }
        Ok(Self {
            transition,
            initial,
        })
    }

    pub fn synthesize(grapheme_set_size: usize, rng: &mut impl Rng) -> Self {
        Self {
            transition: default_transition_probabilities(grapheme_set_size, rng),
            initial: default_initial_probabilities(grapheme_set_size, rng),
        }
    }

    pub fn transition(&self) -> &[Vec<f32>] {
        &self.transition
    }

    pub fn initial(&self) -> &[f32] {
        &self.initial
    }

    pub fn state_count(&self) -> usize {
        self.initial.len()
    }
}

/// Random weights in `[1, 15)`, sentinel row and column zeroed, then each
/// column divided by its sum. Column 0 is divided by 1 so it stays zero.
pub fn default_transition_probabilities(
    grapheme_set_size: usize,
    rng: &mut impl Rng,
) -> Vec<Vec<f32>> {
    let states = grapheme_set_size + 1;
    let mut weights: Vec<Vec<f32>> = (0..states)
        .map(|next| {
            (0..states)
                .map(|previous| {
                    let w = rng.gen_range(DEFAULT_WEIGHT_RANGE) as f32;
                    if next == 0 || previous == 0 {
                        0.0
                    } else {
                        w
                    }
                })
                .collect()
        })
        .collect();

    let norms: Vec<f32> = (0..states)
        .map(|previous| {
            if previous == 0 {
                1.0
            } else {
                weights.iter().map(|row| row[previous]).sum()
            }
        })
        .collect();
    for row in &mut weights {
        for (value, norm) in row.iter_mut().zip(&norms) {
            *value /= norm;
        }
    }
    weights
}

/// Random weights in `[1, 15)` normalized over the non-sentinel states.
pub fn default_initial_probabilities(grapheme_set_size: usize, rng: &mut impl Rng) -> Vec<f32> {
    let mut weights: Vec<f32> = (0..=grapheme_set_size)
        .map(|_| rng.gen_range(DEFAULT_WEIGHT_RANGE) as f32)
        .collect();
    weights[0] = 0.0;
    let total: f32 = weights.iter().sum();
    weights.iter_mut().for_each(|w| *w /= total);
    weights
}

/// ASG grapheme space: the alphabet only, no blank.
#[derive(Debug, Clone)]
pub struct AsgGraphemeEncoding {
    alphabet: Alphabet,
    transitions: AsgTransitions,
}

impl AsgGraphemeEncoding {
    pub fn new(allowed_characters: &str, transitions: AsgTransitions) -> Result<Self> {
        let alphabet = Alphabet::new(allowed_characters)?;
        if transitions.state_count() != alphabet.len() + 1 {
            return Err(Wav2LetterError::configuration(format!(
                "ASG tables cover {} states but the alphabet needs {}",
                transitions.state_count(),
                alphabet.len() + 1
            )));
        }
        Ok(Self {
            alphabet,
            transitions,
        })
    }

    pub fn with_default_transitions(allowed_characters: &str, rng: &mut impl Rng) -> Result<Self> {
        let size = Alphabet::new(allowed_characters)?.len();
        Self::new(allowed_characters, AsgTransitions::synthesize(size, rng))
    }

    pub fn transitions(&self) -> &AsgTransitions {
        &self.transitions
    }

    /// Most likely grapheme path under the frame scores, transitions and
    /// initial distribution. The sentinel state is never visited. Frames
    /// without any positive score carry no evidence and are skipped.
    fn viterbi_path(&self, probabilities: &[Vec<f32>]) -> Vec<usize> {
        let graphemes = self.grapheme_set_size();
        let frames: Vec<&Vec<f32>> = probabilities
            .iter()
            .filter(|row| row.len() >= graphemes && row[..graphemes].iter().any(|&p| p > 0.0))
            .collect();
        if frames.is_empty() {
            return Vec::new();
        }

        let transition = self.transitions.transition();
        let initial = self.transitions.initial();
        let mut score: Vec<f32> = (0..graphemes)
            .map(|g| floored_ln(initial[g + 1]) + floored_ln(frames[0][g]))
            .collect();
        let mut back = vec![0usize; frames.len() * graphemes];

        for (t, row) in frames.iter().enumerate().skip(1) {
            let mut next_score = vec![f32::NEG_INFINITY; graphemes];
            for (next, slot) in next_score.iter_mut().enumerate() {
                let mut best = f32::NEG_INFINITY;
                let mut best_previous = 0;
                for (previous, &prev_score) in score.iter().enumerate() {
                    let candidate = prev_score + floored_ln(transition[next + 1][previous + 1]);
                    if candidate > best {
                        best = candidate;
                        best_previous = previous;
                    }
                }
                *slot = best + floored_ln(row[next]);
                back[t * graphemes + next] = best_previous;
            }
            score = next_score;
        }

        let mut state = score
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (g, &s)| if s > best.1 { (g, s) } else { best })
            .0;
        let mut path = vec![state; frames.len()];
        for t in (1..frames.len()).rev() {
            state = back[t * graphemes + state];
            path[t - 1] = state;
        }
        path
    }
}

impl GraphemeEncoding for AsgGraphemeEncoding {
    fn alphabet(&self) -> &Alphabet {
        &self.alphabet
    }

    fn grapheme_set_size(&self) -> usize {
        self.alphabet.len()
    }

    fn decode(&self, probabilities: &[Vec<f32>], output_length: usize) -> String {
        let frames = &probabilities[..output_length.min(probabilities.len())];
        collapse_repeats(self.viterbi_path(frames))
            .into_iter()
            .filter_map(|g| self.alphabet.char_at(g))
            .collect()
    }
}

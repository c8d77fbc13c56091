//! Batched CTC negative log-likelihood built from differentiable candle ops.
//!
//! Works on the blank-extended label `l'` of length `2 * max_label + 1` and
//! runs the forward (alpha) recursion over time in log space. Padded frames
//! and padded label positions are masked out, so they never reach the loss.
//! A large finite negative stands in for `log(0)` to keep gradients NaN-free.

use candle_core::{Device, Tensor};

use crate::types::TargetSequence;

const LOG_ZERO: f32 = -1e30;

/// Per-example CTC loss of shape `(batch,)`.
///
/// `log_probs` is `(batch, time, graphemes)`; only the first `input_lengths[i]`
/// frames and `targets[i].len()` labels of example `i` contribute.
pub(crate) fn ctc_loss(
    log_probs: &Tensor,
    targets: &[TargetSequence],
    input_lengths: &[usize],
    blank: usize,
) -> candle_core::Result<Tensor> {
    let (batch, max_time, graphemes) = log_probs.dims3()?;
    if targets.len() != batch || input_lengths.len() != batch {
        candle_core::bail!(
            "ctc batch of {batch} got {} targets and {} input lengths",
            targets.len(),
            input_lengths.len()
        )
    }
    if blank >= graphemes {
        candle_core::bail!("blank index {blank} must be below grapheme count {graphemes}")
    }
    if let Some(&len) = input_lengths.iter().find(|&&len| len > max_time) {
        candle_core::bail!("input length {len} exceeds the {max_time} frames predicted")
    }

    let device = log_probs.device();
    let layout = ExtendedLabels::new(targets, input_lengths, blank);
    let states = layout.states;
    if max_time == 0 {
        return Tensor::from_vec(layout.frameless_losses(), batch, device);
    }

    let index = Tensor::from_vec(layout.symbols.clone(), (batch, 1, states), device)?
        .broadcast_as((batch, max_time, states))?
        .contiguous()?;
    let emissions = log_probs.contiguous()?.gather(&index, 2)?;

    let log_zero = Tensor::full(LOG_ZERO, (batch, states), device)?;
    let first_states = layout.mask(&layout.initial, device)?;
    let skip_allowed = layout.mask(&layout.skip_allowed, device)?;
    let state_valid = layout.mask(&layout.state_valid, device)?;
    // Frameless examples start (and stay) at state 0 with probability one.
    let start = Tensor::from_vec(layout.frameless_start(), (batch, states), device)?;

    let mut alpha = first_states.where_cond(&emissions.narrow(1, 0, 1)?.squeeze(1)?, &start)?;
    for t in 1..max_time {
        let stay = alpha.clone();
        let step = shift_right(&alpha, 1, device)?;
        let skip = skip_allowed.where_cond(&shift_right(&alpha, 2, device)?, &log_zero)?;
        let next = (log_sum_exp3(&stay, &step, &skip)? + emissions.narrow(1, t, 1)?.squeeze(1)?)?;
        let next = state_valid.where_cond(&next, &log_zero)?;
        let active = layout.active_at(t, device)?;
        alpha = active.where_cond(&next, &alpha)?;
    }

    // A path ends on the final label or on the trailing blank.
    let ends = Tensor::from_vec(layout.end_states(), (batch, 2), device)?;
    let finals = alpha.gather(&ends, 1)?;
    let end_valid = Tensor::from_vec(layout.end_valid(), (batch, 2), device)?;
    let finals = end_valid.where_cond(&finals, &Tensor::full(LOG_ZERO, (batch, 2), device)?)?;
    let max = finals.max_keepdim(1)?;
    let log_likelihood = (finals.broadcast_sub(&max)?.exp()?.sum_keepdim(1)?.log()? + max)?;
    log_likelihood.squeeze(1)?.neg()
}

fn shift_right(alpha: &Tensor, by: usize, device: &Device) -> candle_core::Result<Tensor> {
    let (batch, states) = alpha.dims2()?;
    let fill = Tensor::full(LOG_ZERO, (batch, by.min(states)), device)?;
    if by >= states {
        return Ok(fill);
    }
    Tensor::cat(&[&fill, &alpha.narrow(1, 0, states - by)?], 1)
}

fn log_sum_exp3(a: &Tensor, b: &Tensor, c: &Tensor) -> candle_core::Result<Tensor> {
    let max = a.maximum(b)?.maximum(c)?;
    let sum = ((a - &max)?.exp()? + (b - &max)?.exp()?)?;
    let sum = (sum + (c - &max)?.exp()?)?;
    sum.log()? + max
}

/// Host-side bookkeeping for the blank-extended labels of a batch.
struct ExtendedLabels {
    states: usize,
    symbols: Vec<u32>,
    initial: Vec<u8>,
    skip_allowed: Vec<u8>,
    state_valid: Vec<u8>,
    label_lengths: Vec<usize>,
    input_lengths: Vec<usize>,
}

impl ExtendedLabels {
    fn new(targets: &[TargetSequence], input_lengths: &[usize], blank: usize) -> Self {
        let max_label = targets.iter().map(TargetSequence::len).max().unwrap_or(0);
        let states = 2 * max_label + 1;
        let batch = targets.len();
        let mut symbols = vec![blank as u32; batch * states];
        let mut initial = vec![0u8; batch * states];
        let mut skip_allowed = vec![0u8; batch * states];
        let mut state_valid = vec![0u8; batch * states];

        for (i, target) in targets.iter().enumerate() {
            let row = i * states;
            for (j, &g) in target.indices.iter().enumerate() {
                symbols[row + 2 * j + 1] = g;
            }
            let used = 2 * target.len() + 1;
            for s in 0..used {
                state_valid[row + s] = 1;
                if s < 2 && input_lengths[i] > 0 {
                    initial[row + s] = 1;
                }
                if s >= 2 && s % 2 == 1 && symbols[row + s] != symbols[row + s - 2] {
                    skip_allowed[row + s] = 1;
                }
            }
        }

        Self {
            states,
            symbols,
            initial,
            skip_allowed,
            state_valid,
            label_lengths: targets.iter().map(TargetSequence::len).collect(),
            input_lengths: input_lengths.to_vec(),
        }
    }

    fn mask(&self, values: &[u8], device: &Device) -> candle_core::Result<Tensor> {
        Tensor::from_slice(values, (self.input_lengths.len(), self.states), device)
    }

    /// Examples still inside their true length at frame `t`.
    fn active_at(&self, t: usize, device: &Device) -> candle_core::Result<Tensor> {
        let values: Vec<u8> = self
            .input_lengths
            .iter()
            .flat_map(|&len| std::iter::repeat(u8::from(t < len)).take(self.states))
            .collect();
        self.mask(&values, device)
    }

    fn frameless_start(&self) -> Vec<f32> {
        let mut start = vec![LOG_ZERO; self.input_lengths.len() * self.states];
        for (i, &len) in self.input_lengths.iter().enumerate() {
            if len == 0 {
                start[i * self.states] = 0.0;
            }
        }
        start
    }

    /// Loss of every example when no frame was predicted at all: only the
    /// empty label has an alignment.
    fn frameless_losses(&self) -> Vec<f32> {
        self.label_lengths
            .iter()
            .map(|&len| if len == 0 { 0.0 } else { -LOG_ZERO })
            .collect()
    }

    fn end_states(&self) -> Vec<u32> {
        self.label_lengths
            .iter()
            .flat_map(|&len| [2 * len as u32, (2 * len).saturating_sub(1) as u32])
            .collect()
    }

    fn end_valid(&self) -> Vec<u8> {
        self.label_lengths
            .iter()
            .flat_map(|&len| [1u8, u8::from(len > 0)])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Var, D};

    use super::*;

    fn target(indices: &[u32]) -> TargetSequence {
        TargetSequence {
            indices: indices.to_vec(),
        }
    }

    /// Sums the probability of every frame path that collapses to `label`.
    fn brute_force_nll(probs: &[Vec<f32>], label: &[u32], blank: usize) -> f64 {
        let classes = probs[0].len();
        let frames = probs.len();
        let mut total = 0f64;
        for code in 0..classes.pow(frames as u32) {
            let mut rest = code;
            let mut path = Vec::with_capacity(frames);
            let mut p = 1f64;
            for row in probs {
                let symbol = rest % classes;
                rest /= classes;
                p *= row[symbol] as f64;
                path.push(symbol);
            }
            path.dedup();
            let decoded: Vec<u32> = path
                .into_iter()
                .filter(|&s| s != blank)
                .map(|s| s as u32)
                .collect();
            if decoded == label {
                total += p;
            }
        }
        -total.ln()
    }

    fn log_probs_of(probs: &[Vec<Vec<f32>>]) -> Tensor {
        let (b, t, c) = (probs.len(), probs[0].len(), probs[0][0].len());
        let flat: Vec<f32> = probs.iter().flatten().flatten().map(|p| p.ln()).collect();
        Tensor::from_vec(flat, (b, t, c), &Device::Cpu).unwrap()
    }

    #[test]
    fn single_frame_single_label() {
        let log_probs = log_probs_of(&[vec![vec![0.7, 0.3]]]);
        let loss: Vec<f32> = ctc_loss(&log_probs, &[target(&[0])], &[1], 1)
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!((loss[0] - -(0.7f32.ln())).abs() < 1e-5);
    }

    #[test]
    fn uniform_two_frames_counts_three_paths() {
        let log_probs = log_probs_of(&[vec![vec![0.5, 0.5], vec![0.5, 0.5]]]);
        let loss: Vec<f32> = ctc_loss(&log_probs, &[target(&[0])], &[2], 1)
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!((loss[0] - -(0.75f32.ln())).abs() < 1e-5);
    }

    #[test]
    fn matches_brute_force_with_padding_and_repeats() {
        let raw = Tensor::randn(0f32, 1.0, (4, 5, 3), &Device::Cpu).unwrap();
        let probs_t = candle_nn::ops::softmax(&raw, D::Minus1).unwrap();
        let probs: Vec<Vec<Vec<f32>>> = probs_t.to_vec3().unwrap();
        let targets = vec![target(&[0, 1]), target(&[1, 1]), target(&[]), target(&[0])];
        let lengths = [5, 4, 3, 2];
        let log_probs = probs_t.log().unwrap();

        let losses: Vec<f32> = ctc_loss(&log_probs, &targets, &lengths, 2)
            .unwrap()
            .to_vec1()
            .unwrap();
        for (i, loss) in losses.iter().enumerate() {
            let expected = brute_force_nll(&probs[i][..lengths[i]], &targets[i].indices, 2);
            assert!(
                (*loss as f64 - expected).abs() < 1e-3,
                "example {i}: {loss} vs {expected}"
            );
        }
    }

    #[test]
    fn padded_frames_do_not_change_the_loss() {
        let probs = vec![vec![0.6, 0.4], vec![0.2, 0.8], vec![0.9, 0.1]];
        let short = log_probs_of(&[probs[..2].to_vec()]);
        let padded = log_probs_of(&[probs]);
        let a: Vec<f32> = ctc_loss(&short, &[target(&[0])], &[2], 1).unwrap().to_vec1().unwrap();
        let b: Vec<f32> = ctc_loss(&padded, &[target(&[0])], &[2], 1).unwrap().to_vec1().unwrap();
        assert!((a[0] - b[0]).abs() < 1e-6);
    }

    #[test]
    fn empty_label_without_frames_costs_nothing() {
        let probs = vec![vec![0.6, 0.4], vec![0.2, 0.8]];
        let log_probs = log_probs_of(&[probs.clone(), probs]);
        let losses: Vec<f32> = ctc_loss(&log_probs, &[target(&[]), target(&[0])], &[0, 2], 1)
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(losses[0], 0.0);
        let second = log_probs.narrow(0, 1, 1).unwrap();
        let alone: Vec<f32> = ctc_loss(&second, &[target(&[0])], &[2], 1)
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!((losses[1] - alone[0]).abs() < 1e-6);

        let no_frames = Tensor::zeros((2, 0, 2), DType::F32, &Device::Cpu).unwrap();
        let losses: Vec<f32> = ctc_loss(&no_frames, &[target(&[]), target(&[0])], &[0, 0], 1)
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(losses[0], 0.0);
        assert!(losses[1] > 1e29);
    }

    #[test]
    fn gradients_are_finite() {
        let raw = Var::randn(0f32, 1.0, (2, 6, 4), &Device::Cpu).unwrap();
        let log_probs = candle_nn::ops::log_softmax(raw.as_tensor(), D::Minus1).unwrap();
        let loss = ctc_loss(&log_probs, &[target(&[0, 2, 2]), target(&[1])], &[6, 3], 3)
            .unwrap()
            .mean_all()
            .unwrap();
        let grads = loss.backward().unwrap();
        let grad: Vec<f32> = grads
            .get(raw.as_tensor())
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(grad.iter().all(|g| g.is_finite()));
        assert!(grad.iter().any(|&g| g != 0.0));
        assert_eq!(loss.dtype(), DType::F32);
    }

    #[test]
    fn rejects_lengths_beyond_prediction() {
        let log_probs = log_probs_of(&[vec![vec![0.5, 0.5]]]);
        assert!(ctc_loss(&log_probs, &[target(&[0])], &[2], 1).is_err());
        assert!(ctc_loss(&log_probs, &[target(&[0])], &[1], 2).is_err());
    }
}

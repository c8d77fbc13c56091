/// Running mean of per-batch losses.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningLoss {
    total: f64,
    count: usize,
}

impl RunningLoss {
    pub fn push(&mut self, loss: f32) -> f32 {
        self.total += f64::from(loss);
        self.count += 1;
        self.mean().unwrap_or(loss)
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn mean(&self) -> Option<f32> {
        (self.count > 0).then(|| (self.total / self.count as f64) as f32)
    }
}

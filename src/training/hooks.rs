use std::fmt;

/// Expected and predicted text for one held-out example.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictionComparison {
    pub expected: String,
    pub predicted: String,
}

impl fmt::Display for PredictionComparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Expected:  \"{}\"", self.expected)?;
        write!(f, "Predicted: \"{}\"", self.predicted)
    }
}

/// Receives the training telemetry stream.
pub trait TrainingReporter: Send + Sync {
    fn batch_trained(&self, epoch: u64, batch_index: usize, loss: f32, running_average: f32);

    fn batch_evaluated(&self, batch_index: usize, loss: f32, running_average: f32);

    fn predictions(&self, epoch: u64, comparisons: &[PredictionComparison]);
}

/// Emits everything through `tracing`.
pub struct TracingReporter;

impl TrainingReporter for TracingReporter {
    fn batch_trained(&self, epoch: u64, batch_index: usize, loss: f32, running_average: f32) {
        tracing::info!(epoch, batch = batch_index, loss, running_average, "trained batch");
    }

    fn batch_evaluated(&self, batch_index: usize, loss: f32, running_average: f32) {
        tracing::info!(batch = batch_index, loss, running_average, "evaluated batch");
    }

    fn predictions(&self, epoch: u64, comparisons: &[PredictionComparison]) {
        let block = comparisons
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n\n");
        tracing::info!(
            epoch,
            examples = comparisons.len(),
            "expectations vs. predictions\n{block}"
        );
    }
}

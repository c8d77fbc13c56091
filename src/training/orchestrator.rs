use std::path::PathBuf;

use crate::config::TrainingConfig;
use crate::error::{Result, Wav2LetterError};
use crate::model::loss_model::AlignmentLossModel;
use crate::training::checkpoint::CheckpointStore;
use crate::training::hooks::{PredictionComparison, TracingReporter, TrainingReporter};
use crate::training::telemetry::RunningLoss;
use crate::types::{LabeledExample, LabeledFeatures};

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    /// Epoch the run resumed from, 0 for a fresh network.
    pub first_epoch: u64,
    pub last_completed_epoch: u64,
    pub batches_trained: usize,
    pub last_epoch_loss: Option<f32>,
    pub checkpoints: Vec<PathBuf>,
    /// Set when the batch stream ended before the epoch limit was reached.
    pub stream_exhausted: bool,
}

/// Runs epochs of `train_step` over a pull-based batch stream, with the
/// held-out report and the checkpoint write scheduled between epochs.
///
/// Epoch `n` is the `n`-th completed pass; checkpoint `n` holds the weights
/// after it. A model restored from checkpoint `n` continues with epoch `n + 1`.
pub struct TrainingOrchestrator {
    model: AlignmentLossModel,
    config: TrainingConfig,
    checkpoints: CheckpointStore,
    held_out: Vec<LabeledFeatures>,
    reporter: Box<dyn TrainingReporter>,
}

impl TrainingOrchestrator {
    pub fn new(model: AlignmentLossModel, config: TrainingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            model,
            checkpoints: CheckpointStore::new(config.net_directory.clone()),
            config,
            held_out: Vec::new(),
            reporter: Box::new(TracingReporter),
        })
    }

    /// Fixed examples used for the expected-vs-predicted report.
    pub fn with_held_out<E: LabeledExample>(mut self, examples: &[E]) -> Self {
        self.held_out = examples
            .iter()
            .map(|e| LabeledFeatures {
                features: e.feature_sequence().clone(),
                label: e.label().to_string(),
            })
            .collect();
        self
    }

    pub fn with_reporter(mut self, reporter: Box<dyn TrainingReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn model(&self) -> &AlignmentLossModel {
        &self.model
    }

    pub fn into_model(self) -> AlignmentLossModel {
        self.model
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Trains until `max_epochs` is reached or `batches` runs out.
    ///
    /// Any batch or model error aborts the run. A stream that ends mid-epoch
    /// leaves that epoch uncounted and unsaved. Checkpoints of epochs after
    /// the starting one must not exist yet in the net directory.
    pub fn train<I, E>(&mut self, batches: I) -> Result<TrainingSummary>
    where
        I: IntoIterator<Item = Vec<E>>,
        E: LabeledExample,
    {
        let first_epoch = self.model.load_epoch().unwrap_or(0);
        if let Some(later) = self
            .checkpoints
            .epochs()?
            .into_iter()
            .find(|&epoch| epoch > first_epoch)
        {
            return Err(Wav2LetterError::configuration(format!(
                "{} already holds a checkpoint for epoch {later}, past starting epoch {first_epoch}",
                self.checkpoints.directory().display()
            )));
        }
        let mut summary = TrainingSummary {
            first_epoch,
            last_completed_epoch: first_epoch,
            batches_trained: 0,
            last_epoch_loss: None,
            checkpoints: Vec::new(),
            stream_exhausted: false,
        };
        tracing::info!(
            first_epoch,
            samples_per_epoch = self.config.samples_per_epoch,
            max_epochs = ?self.config.max_epochs,
            "training started"
        );
        self.report_predictions(first_epoch)?;

        let mut batches = batches.into_iter();
        let mut epoch = first_epoch;
        while self.config.max_epochs.map_or(true, |max| epoch < max) {
            let current = epoch + 1;
            let mut running = RunningLoss::default();
            let mut samples = 0;
            while samples < self.config.samples_per_epoch {
                let Some(examples) = batches.next() else {
                    tracing::warn!(epoch = current, samples, "batch stream ended mid-epoch");
                    summary.stream_exhausted = true;
                    return Ok(summary);
                };
                let batch = self.model.training_batch(&examples)?;
                let loss = self.model.train_step(&batch)?;
                let average = running.push(loss);
                self.reporter
                    .batch_trained(current, running.count() - 1, loss, average);
                samples += batch.batch_size();
                summary.batches_trained += 1;
            }

            epoch = current;
            summary.last_completed_epoch = epoch;
            summary.last_epoch_loss = running.mean();
            self.on_epoch_boundary(epoch)?;
            if let Some(path) = self.on_checkpoint_boundary(epoch)? {
                summary.checkpoints.push(path);
            }
        }
        Ok(summary)
    }

    /// Reports predictions for the held-out examples when `epoch` is on the
    /// report cadence.
    pub fn on_epoch_boundary(&self, epoch: u64) -> Result<()> {
        if epoch % self.config.report_every == 0 {
            self.report_predictions(epoch)?;
        }
        Ok(())
    }

    /// Saves a checkpoint when `epoch` is on the save cadence. Returns the
    /// written path, `None` off cadence.
    pub fn on_checkpoint_boundary(&self, epoch: u64) -> Result<Option<PathBuf>> {
        if epoch % self.config.save_every != 0 {
            return Ok(None);
        }
        self.checkpoints.save(self.model.varmap(), epoch).map(Some)
    }

    /// Loss over a finite set of batches without updating any parameter.
    /// Returns the mean of the per-batch losses, `None` for no batches.
    pub fn evaluate<I, E>(&self, batches: I) -> Result<Option<f32>>
    where
        I: IntoIterator<Item = Vec<E>>,
        E: LabeledExample,
    {
        let mut running = RunningLoss::default();
        for examples in batches {
            let batch = self.model.training_batch(&examples)?;
            let loss = self.model.loss(&batch)?;
            let average = running.push(loss);
            self.reporter
                .batch_evaluated(running.count() - 1, loss, average);
        }
        Ok(running.mean())
    }

    pub fn held_out_comparisons(&self) -> Result<Vec<PredictionComparison>> {
        if self.held_out.is_empty() {
            return Ok(Vec::new());
        }
        let features: Vec<_> = self.held_out.iter().map(|e| &e.features).collect();
        let predictions = self.model.predict(&features)?;
        Ok(self
            .held_out
            .iter()
            .zip(predictions)
            .map(|(example, predicted)| PredictionComparison {
                expected: example.label.clone(),
                predicted,
            })
            .collect())
    }

    fn report_predictions(&self, epoch: u64) -> Result<()> {
        let comparisons = self.held_out_comparisons()?;
        if !comparisons.is_empty() {
            self.reporter.predictions(epoch, &comparisons);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::config::Wav2LetterConfig;
    use crate::types::FeatureSequence;

    #[derive(Default)]
    struct Recorded {
        trained: Vec<(u64, usize)>,
        evaluated: usize,
        reports: Vec<u64>,
    }

    struct RecordingReporter(Arc<Mutex<Recorded>>);

    impl TrainingReporter for RecordingReporter {
        fn batch_trained(&self, epoch: u64, batch_index: usize, _loss: f32, _average: f32) {
            self.0.lock().unwrap().trained.push((epoch, batch_index));
        }

        fn batch_evaluated(&self, _batch_index: usize, _loss: f32, _average: f32) {
            self.0.lock().unwrap().evaluated += 1;
        }

        fn predictions(&self, epoch: u64, comparisons: &[PredictionComparison]) {
            assert_eq!(comparisons[0].expected, "ab");
            self.0.lock().unwrap().reports.push(epoch);
        }
    }

    fn model() -> AlignmentLossModel {
        let config = Wav2LetterConfig {
            allowed_characters: "ab".to_string(),
            main_filter_count: 6,
            output_filter_count: 8,
            seed: Some(1),
            ..Wav2LetterConfig::new(2)
        };
        AlignmentLossModel::new(config).unwrap()
    }

    fn example(label: &str) -> LabeledFeatures {
        let values = (0..32).map(|i| (i % 5) as f32 / 5.0).collect();
        LabeledFeatures {
            features: FeatureSequence::new(values, 2).unwrap(),
            label: label.to_string(),
        }
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "wav2letter_rs_orchestrator_{name}_{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn epochs_follow_sample_accounting_and_cadences() {
        let dir = temp_dir("cadence");
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let mut config = TrainingConfig::new(&dir, 4);
        config.report_every = 2;
        config.save_every = 3;
        config.max_epochs = Some(3);
        let mut orchestrator = TrainingOrchestrator::new(model(), config)
            .unwrap()
            .with_held_out(&[example("ab")])
            .with_reporter(Box::new(RecordingReporter(recorded.clone())));

        let batches = std::iter::repeat_with(|| vec![example("ab"), example("b")]);
        let summary = orchestrator.train(batches).unwrap();

        assert_eq!(summary.first_epoch, 0);
        assert_eq!(summary.last_completed_epoch, 3);
        assert_eq!(summary.batches_trained, 6);
        assert!(!summary.stream_exhausted);
        assert_eq!(summary.checkpoints, vec![dir.join("weights-epoch3.safetensors")]);
        assert!(!dir.join("weights-epoch1.safetensors").exists());

        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded.reports, vec![0, 2]);
        assert_eq!(recorded.trained[..3], [(1, 0), (1, 1), (2, 0)]);
        drop(recorded);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn exhausted_stream_ends_training_without_saving_partial_epoch() {
        let dir = temp_dir("exhausted");
        let config = TrainingConfig::new(&dir, 4);
        let mut orchestrator = TrainingOrchestrator::new(model(), config).unwrap();
        let batches = vec![vec![example("a"), example("b")]; 3];
        let summary = orchestrator.train(batches).unwrap();
        assert!(summary.stream_exhausted);
        assert_eq!(summary.last_completed_epoch, 1);
        assert_eq!(summary.batches_trained, 3);
        assert!(orchestrator.checkpoints().exists(1));
        assert!(!orchestrator.checkpoints().exists(2));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn malformed_batch_aborts_training() {
        let dir = temp_dir("malformed");
        let config = TrainingConfig::new(&dir, 4);
        let mut orchestrator = TrainingOrchestrator::new(model(), config).unwrap();
        let batches = vec![vec![example("ab")], Vec::new()];
        let err = orchestrator.train(batches).unwrap_err();
        assert!(matches!(err, Wav2LetterError::ShapeMismatch { .. }));
        assert!(!orchestrator.checkpoints().exists(1));
    }

    #[test]
    fn evaluate_leaves_parameters_untouched() {
        let dir = temp_dir("evaluate");
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let orchestrator = TrainingOrchestrator::new(model(), TrainingConfig::new(&dir, 4))
            .unwrap()
            .with_reporter(Box::new(RecordingReporter(recorded.clone())));
        let snapshot = |o: &TrainingOrchestrator| -> Vec<f32> {
            let data = o.model().varmap().data().lock().unwrap();
            let weight = data["output_conv.weight"].as_tensor().flatten_all().unwrap();
            weight.to_vec1().unwrap()
        };
        let before = snapshot(&orchestrator);
        let batches = vec![vec![example("ab")], vec![example("a"), example("ba")]];
        let mean = orchestrator.evaluate(batches).unwrap().unwrap();
        assert!(mean.is_finite() && mean > 0.0);
        assert_eq!(snapshot(&orchestrator), before);
        assert_eq!(recorded.lock().unwrap().evaluated, 2);
        assert_eq!(orchestrator.evaluate(Vec::<Vec<LabeledFeatures>>::new()).unwrap(), None);
    }

    #[test]
    fn fresh_run_refuses_a_directory_with_later_checkpoints() {
        let dir = temp_dir("reused");
        let mut config = TrainingConfig::new(&dir, 2);
        config.max_epochs = Some(1);
        let batches = vec![vec![example("ab"), example("a")]; 2];

        let mut first = TrainingOrchestrator::new(model(), config.clone()).unwrap();
        assert_eq!(first.train(batches.clone()).unwrap().checkpoints.len(), 1);

        let mut second = TrainingOrchestrator::new(model(), config).unwrap();
        let err = second.train(batches).unwrap_err();
        assert!(matches!(err, Wav2LetterError::Configuration { .. }));
        assert_eq!(second.checkpoints().epochs().unwrap(), vec![1]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn zero_sample_epochs_are_rejected() {
        let config = TrainingConfig::new(temp_dir("zero"), 0);
        assert!(matches!(
            TrainingOrchestrator::new(model(), config),
            Err(Wav2LetterError::Configuration { .. })
        ));
    }
}

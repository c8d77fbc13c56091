pub mod batch;
pub mod config;
pub mod encoding;
pub mod error;
pub mod model;
pub mod training;
pub mod types;

pub use batch::{PaddedFeatures, PaddedLabels, SequenceBatchAssembler, TrainingBatch};
pub use config::{Activation, OptimizerConfig, TrainingConfig, Wav2LetterConfig};
pub use encoding::{
    Alphabet, AsgGraphemeEncoding, AsgTransitions, CtcGraphemeEncoding, GraphemeEncoding,
};
pub use error::{Result, Wav2LetterError};
pub use model::loss_model::{AlignmentLoss, AlignmentLossModel};
pub use model::network::{AcousticNetwork, AcousticNetworkBuilder, LayerSpec, NetworkSpec};
pub use training::checkpoint::CheckpointStore;
pub use training::hooks::{PredictionComparison, TracingReporter, TrainingReporter};
pub use training::orchestrator::{TrainingOrchestrator, TrainingSummary};
pub use training::telemetry::RunningLoss;
pub use types::{FeatureSequence, LabeledExample, LabeledFeatures, ManifestEntry, TargetSequence};

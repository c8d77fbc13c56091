pub mod checkpoint;
pub mod hooks;
pub mod orchestrator;
pub mod telemetry;

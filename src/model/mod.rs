pub(crate) mod ctc;
pub(crate) mod layers;
pub mod loss_model;
pub mod network;

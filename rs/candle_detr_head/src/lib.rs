//! DETR prediction head in candle
//!
//! Class scores, boxes and optional instance masks from the outputs of a
//! DETR-style transformer, with the training-time plumbing that turns polygon
//! annotations into mask targets and hands everything to a set-matching loss.

pub mod config;
pub mod debug;
pub mod detection;
pub mod gt_mask;
pub mod init;
pub mod loss;
pub mod model;
pub mod postprocess;

pub use config::DetrHeadConfig;
pub use detection::Detection;
pub use loss::{DetrLoss, LossInputs, NoLoss};
pub use model::{DetrHead, HeadOutput, Mode, Predictions, Supervision, TransformerOutput};
pub use postprocess::PostProcessor;

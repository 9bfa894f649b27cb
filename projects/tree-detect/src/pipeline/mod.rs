// Detection pipeline: model wrapper, annotation and the per-request invoker

pub mod annotate;
pub mod detection;
pub mod predictor;
pub mod types;

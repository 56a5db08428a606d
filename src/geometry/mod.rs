//! Geometry utilities: simplex measures, symmetric tensors and metric quality.

pub mod metrics;
pub mod quality;
pub mod tensor;

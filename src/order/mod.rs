pub mod estimator;

pub use estimator::{OrderEstimateSnapshot, OrderEstimator};

//! Client metrics.

pub mod prometheus;

pub use self::prometheus::ClientMetrics;

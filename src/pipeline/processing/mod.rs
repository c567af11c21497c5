// Pipeline processing: table loading, reshaping, normalization and aggregation

pub mod loader;
pub mod normalize;

pub use loader::{LoadOutcome, TableLoader};
pub use normalize::{CombineReport, NormalizationEngine};

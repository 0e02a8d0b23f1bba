pub mod fees;
pub mod sync;
pub mod tracker;
pub mod types;

pub use fees::{AmountInput, FeeEstimate, FeeEstimator, FeeQuote, VaultAction};
pub use tracker::{Subscription, VaultTracker};
pub use types::*;

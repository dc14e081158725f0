pub mod config;
pub mod encoding;
pub mod rewards;
pub mod serde;
pub mod signing;
pub mod types;

pub use rewards::{RewardConfig, RewardToken};
pub use signing::{BlsPublicKey, BlsSecretKey, BlsSignature};
pub use types::{Action, Bundle, BundleRow, Operation, TransactionFailure};

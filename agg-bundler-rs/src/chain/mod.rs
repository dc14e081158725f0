mod eth;
pub mod gateway;

pub use eth::EthAdapter;

use agg_rs::{
    signing::BlsPublicKey,
    types::{Bundle, TransactionFailure},
};
use async_trait::async_trait;
use ethers::types::{Bytes, H256, U256};
use std::{collections::HashMap, time::Duration};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error(transparent)]
    Provider(#[from] ethers::providers::ProviderError),
    #[error(transparent)]
    Abi(#[from] ethers::abi::Error),
    #[error("wallet setup failed: {0}")]
    Wallet(String),
    #[error("staged simulation returned a malformed sequence")]
    MalformedSequence,
    #[error("balance measurement failed inside the staged simulation")]
    MeasurementFailed,
    #[error("transaction was not mined within {0:?}")]
    SubmissionTimeout(Duration),
    #[error("transaction was dropped from the mempool")]
    Dropped,
}

/// Outcome of staging one bundle in the simulated sequence: whether any
/// of its operations succeeded, and the reward-token balance delta it
/// produced for the aggregator's wallet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BundleSimulation {
    pub success: bool,
    pub reward: U256,
}

#[derive(Clone, Copy, Debug)]
pub struct SubmissionReceipt {
    pub transaction_hash: H256,
    pub block_number: u64,
}

/// Thin facade over the blockchain. One production implementation talks
/// JSON-RPC; tests substitute a mock.
#[async_trait]
pub trait ChainAdapter: Send + Sync + 'static {
    async fn block_number(&self) -> Result<u64, ChainError>;

    /// Compare each operation's nonce against the on-chain wallet nonce.
    async fn check_nonces(&self, bundle: &Bundle) -> Result<Vec<TransactionFailure>, ChainError>;

    /// Simulate, in one atomic read at the current head, the sequence
    /// `measure, prior?, measure, c₀, measure, c₁, …` where `measure`
    /// reads the aggregator's reward-token balance. Later bundles see the
    /// state effects of earlier ones, which is what lets the culprit
    /// search localize a failing bundle. Returns one entry per candidate.
    async fn measure_bundle_rewards(
        &self,
        prior: Option<&Bundle>,
        candidates: &[Bundle],
    ) -> Result<Vec<BundleSimulation>, ChainError>;

    /// Gas estimate for `processBundle(bundle)`.
    async fn estimate_gas(&self, bundle: &Bundle) -> Result<U256, ChainError>;

    /// Call data for `processBundle(bundle)`; only its length feeds the
    /// reward model, but the encoding is the real wire encoding.
    fn encode_call_data(&self, bundle: &Bundle) -> Bytes;

    /// Broadcast the aggregate and wait for one confirmation.
    async fn submit_bundle(
        &self,
        bundle: &Bundle,
        timeout: Duration,
    ) -> Result<SubmissionReceipt, ChainError>;
}

/// Diff declared operation nonces against looked-up wallet nonces.
/// Several operations from the same wallet inside one bundle consume
/// consecutive nonces.
pub(crate) fn diff_nonces(
    bundle: &Bundle,
    wallet_nonces: &HashMap<BlsPublicKey, u64>,
) -> Vec<TransactionFailure> {
    let mut failures = vec![];
    let mut offsets: HashMap<BlsPublicKey, u64> = HashMap::new();
    for (public_key, operation) in bundle.sender_public_keys.iter().zip(&bundle.operations) {
        let offset = offsets.entry(*public_key).or_default();
        let expected = wallet_nonces.get(public_key).copied().unwrap_or_default() + *offset;
        if operation.nonce < expected {
            failures.push(TransactionFailure::NonceTooLow {
                public_key: *public_key,
                declared: operation.nonce,
                expected,
            });
        } else if operation.nonce > expected {
            failures.push(TransactionFailure::NonceTooHigh {
                public_key: *public_key,
                declared: operation.nonce,
                expected,
            });
        }
        *offset += 1;
    }
    failures
}

/// Poll until the chain advances past `last_seen`, swallowing transient
/// RPC errors. Returns the new block number.
pub async fn wait_for_new_block<C: ChainAdapter + ?Sized>(
    chain: &C,
    last_seen: u64,
    poll_interval: Duration,
) -> u64 {
    loop {
        match chain.block_number().await {
            Ok(block_number) if block_number > last_seen => return block_number,
            Ok(_) => {}
            Err(err) => warn!(%err, "could not poll block number"),
        }
        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::signed_bundle;
    use agg_rs::signing::BlsSecretKey;

    #[test]
    fn test_diff_nonces_accepts_matching() {
        let wallet = BlsSecretKey::from_seed(&[1; 32]);
        let bundle = signed_bundle(&wallet, 3, 1);
        let nonces = HashMap::from([(wallet.public_key(), 3)]);
        assert!(diff_nonces(&bundle, &nonces).is_empty());
    }

    #[test]
    fn test_diff_nonces_flags_low_and_high() {
        let wallet = BlsSecretKey::from_seed(&[1; 32]);
        let nonces = HashMap::from([(wallet.public_key(), 3)]);

        let low = signed_bundle(&wallet, 2, 1);
        assert!(matches!(
            diff_nonces(&low, &nonces)[..],
            [TransactionFailure::NonceTooLow { declared: 2, expected: 3, .. }]
        ));

        let high = signed_bundle(&wallet, 5, 1);
        assert!(matches!(
            diff_nonces(&high, &nonces)[..],
            [TransactionFailure::NonceTooHigh { declared: 5, expected: 3, .. }]
        ));
    }

    #[test]
    fn test_diff_nonces_counts_in_bundle_operations() {
        let wallet = BlsSecretKey::from_seed(&[1; 32]);
        let bundle = Bundle::aggregate(
            [signed_bundle(&wallet, 3, 1), signed_bundle(&wallet, 4, 1)].iter(),
        )
        .unwrap();
        let nonces = HashMap::from([(wallet.public_key(), 3)]);
        assert!(diff_nonces(&bundle, &nonces).is_empty());
    }
}

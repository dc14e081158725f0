use crate::signing::{self, BlsPublicKey, BlsSignature};
use ethers::types::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single call made on behalf of a wallet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub target: Address,
    pub value: U256,
    pub data: Bytes,
}

/// A wallet's nonce-guarded, ordered list of actions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub nonce: u64,
    pub actions: Vec<Action>,
}

/// A signed set of operations from one or more BLS wallets. The
/// aggregation of many bundles is itself a bundle: keys and operations
/// concatenate, signatures aggregate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    pub signature: BlsSignature,
    pub sender_public_keys: Vec<BlsPublicKey>,
    pub operations: Vec<Operation>,
}

impl Bundle {
    /// `sender_public_keys` and `operations` must pair up one-to-one.
    pub fn is_well_formed(&self) -> bool {
        !self.operations.is_empty() && self.sender_public_keys.len() == self.operations.len()
    }

    pub fn action_count(&self) -> usize {
        self.operations.iter().map(|operation| operation.actions.len()).sum()
    }

    /// Aggregate a non-empty sequence of bundles, preserving order.
    pub fn aggregate<'a>(
        bundles: impl IntoIterator<Item = &'a Bundle>,
    ) -> Result<Bundle, signing::Error> {
        let mut sender_public_keys = vec![];
        let mut operations = vec![];
        let mut signatures = vec![];
        for bundle in bundles {
            sender_public_keys.extend_from_slice(&bundle.sender_public_keys);
            operations.extend_from_slice(&bundle.operations);
            signatures.push(bundle.signature);
        }
        let signature = signing::aggregate_signatures(&signatures)?;
        Ok(Bundle { signature, sender_public_keys, operations })
    }

    /// Abbreviated sender keys, for events and log lines.
    pub fn public_key_shorts(&self) -> Vec<String> {
        self.sender_public_keys.iter().map(|key| key.short()).collect()
    }
}

/// A persisted bundle awaiting aggregation. `id` is assigned by the
/// table on insert; a row is eligible once `eligible_after` is at or
/// below the current block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleRow {
    pub id: u64,
    pub bundle: Bundle,
    pub eligible_after: u64,
    pub next_eligibility_delay: u64,
}

impl BundleRow {
    pub fn new(bundle: Bundle, eligible_after: u64) -> Self {
        Self { id: 0, bundle, eligible_after, next_eligibility_delay: 1 }
    }
}

/// Why a submitted bundle was rejected at admission. These are returned
/// to the client synchronously and never persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TransactionFailure {
    #[error("invalid format: {description}")]
    InvalidFormat { description: String },
    #[error("invalid signature")]
    InvalidSignature,
    #[error("nonce too low for {public_key}: declared {declared}, expected {expected}")]
    NonceTooLow { public_key: BlsPublicKey, declared: u64, expected: u64 },
    #[error("nonce too high for {public_key}: declared {declared}, expected {expected}")]
    NonceTooHigh { public_key: BlsPublicKey, declared: u64, expected: u64 },
}

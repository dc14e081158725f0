//! Test doubles: a scriptable in-memory chain and helpers for building
//! signed bundles.

use crate::chain::{
    diff_nonces, BundleSimulation, ChainAdapter, ChainError, SubmissionReceipt,
};
use agg_rs::{
    encoding,
    rewards::RewardConfig,
    signing::{BlsPublicKey, BlsSecretKey},
    types::{Action, Bundle, Operation, TransactionFailure},
};
use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use parking_lot::Mutex;
use std::{collections::HashMap, time::Duration};
use tokio::sync::Notify;

/// Flat gas cost the mock charges per `processBundle` call.
pub const MOCK_GAS_BASE: u64 = 100_000;
/// Marginal gas the mock charges per action.
pub const MOCK_GAS_PER_ACTION: u64 = 40_000;

#[derive(Default)]
struct MockState {
    block_number: u64,
    wallet_nonces: HashMap<BlsPublicKey, u64>,
    rewards: HashMap<Vec<u8>, BundleSimulation>,
    default_reward: U256,
    stall_confirmations: bool,
    fail_submissions: bool,
    submissions: Vec<Bundle>,
    submission_attempts: usize,
    estimate_gas_calls: usize,
}

/// Scriptable chain: block height, wallet nonces, per-bundle simulated
/// rewards, and submission behavior are all under test control.
pub struct MockAdapter {
    state: Mutex<MockState>,
    release: Notify,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdapter {
    pub fn new() -> Self {
        let state = MockState {
            block_number: 1,
            // generous enough that unconfigured bundles always pay their way
            default_reward: U256::exp10(18),
            ..Default::default()
        };
        Self { state: Mutex::new(state), release: Notify::new() }
    }

    pub fn set_block(&self, block_number: u64) {
        self.state.lock().block_number = block_number;
    }

    pub fn advance_block(&self) {
        self.state.lock().block_number += 1;
    }

    pub fn set_wallet_nonce(&self, public_key: BlsPublicKey, nonce: u64) {
        self.state.lock().wallet_nonces.insert(public_key, nonce);
    }

    /// Script the staged-simulation outcome for one bundle.
    pub fn set_reward(&self, bundle: &Bundle, simulation: BundleSimulation) {
        let key = encoding::encode_process_bundle(bundle).to_vec();
        self.state.lock().rewards.insert(key, simulation);
    }

    pub fn set_default_reward(&self, reward: U256) {
        self.state.lock().default_reward = reward;
    }

    /// While set, `submit_bundle` blocks until stalling is turned off.
    pub fn stall_confirmations(&self, stall: bool) {
        self.state.lock().stall_confirmations = stall;
        if !stall {
            self.release.notify_waiters();
        }
    }

    pub fn fail_submissions(&self, fail: bool) {
        self.state.lock().fail_submissions = fail;
    }

    pub fn submissions(&self) -> Vec<Bundle> {
        self.state.lock().submissions.clone()
    }

    /// Broadcasts begun, including ones still waiting on a stalled
    /// confirmation.
    pub fn submission_attempts(&self) -> usize {
        self.state.lock().submission_attempts
    }

    pub fn estimate_gas_calls(&self) -> usize {
        self.state.lock().estimate_gas_calls
    }

    pub fn reset_estimate_gas_calls(&self) {
        self.state.lock().estimate_gas_calls = 0;
    }

    /// The mock's gas model, linear in action count.
    pub fn gas_for(bundle: &Bundle) -> U256 {
        (MOCK_GAS_BASE + MOCK_GAS_PER_ACTION * bundle.action_count() as u64).into()
    }

    fn simulation_for(state: &MockState, bundle: &Bundle) -> BundleSimulation {
        let key = encoding::encode_process_bundle(bundle).to_vec();
        state
            .rewards
            .get(&key)
            .copied()
            .unwrap_or(BundleSimulation { success: true, reward: state.default_reward })
    }
}

#[async_trait]
impl ChainAdapter for MockAdapter {
    async fn block_number(&self) -> Result<u64, ChainError> {
        Ok(self.state.lock().block_number)
    }

    async fn check_nonces(&self, bundle: &Bundle) -> Result<Vec<TransactionFailure>, ChainError> {
        let state = self.state.lock();
        Ok(diff_nonces(bundle, &state.wallet_nonces))
    }

    async fn measure_bundle_rewards(
        &self,
        _prior: Option<&Bundle>,
        candidates: &[Bundle],
    ) -> Result<Vec<BundleSimulation>, ChainError> {
        let state = self.state.lock();
        Ok(candidates.iter().map(|bundle| Self::simulation_for(&state, bundle)).collect())
    }

    async fn estimate_gas(&self, bundle: &Bundle) -> Result<U256, ChainError> {
        self.state.lock().estimate_gas_calls += 1;
        Ok(Self::gas_for(bundle))
    }

    fn encode_call_data(&self, bundle: &Bundle) -> Bytes {
        encoding::encode_process_bundle(bundle)
    }

    async fn submit_bundle(
        &self,
        bundle: &Bundle,
        _timeout: Duration,
    ) -> Result<SubmissionReceipt, ChainError> {
        self.state.lock().submission_attempts += 1;
        loop {
            let released = self.release.notified();
            if !self.state.lock().stall_confirmations {
                break;
            }
            released.await;
        }

        let mut state = self.state.lock();
        if state.fail_submissions {
            return Err(ChainError::Rpc("scripted submission failure".to_string()));
        }
        for (public_key, operation) in bundle.sender_public_keys.iter().zip(&bundle.operations) {
            state.wallet_nonces.insert(*public_key, operation.nonce + 1);
        }
        state.submissions.push(bundle.clone());
        let transaction_hash = H256::from_low_u64_be(state.submissions.len() as u64);
        Ok(SubmissionReceipt { transaction_hash, block_number: state.block_number })
    }
}

pub fn test_wallet(seed: u8) -> BlsSecretKey {
    BlsSecretKey::from_seed(&[seed; 32])
}

/// A bundle with one operation of `actions` identical actions, signed by
/// `wallet`.
pub fn signed_bundle(wallet: &BlsSecretKey, nonce: u64, actions: usize) -> Bundle {
    let operation = Operation {
        nonce,
        actions: (0..actions)
            .map(|i| Action {
                target: Address::repeat_byte(i as u8 + 1),
                value: U256::zero(),
                data: vec![0xab; 4].into(),
            })
            .collect(),
    };
    let signature = wallet.sign_operation(&operation);
    Bundle {
        signature,
        sender_public_keys: vec![wallet.public_key()],
        operations: vec![operation],
    }
}

/// The reward covering exactly this bundle's standalone cost under the
/// mock's gas model and the given reward config.
pub fn funded_reward(rewards: &RewardConfig, bundle: &Bundle) -> U256 {
    let call_data_len = encoding::encode_process_bundle(bundle).len();
    rewards.required_reward(MockAdapter::gas_for(bundle), call_data_len)
}

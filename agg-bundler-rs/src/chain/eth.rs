use crate::{
    chain::{
        diff_nonces,
        gateway::{self, SequenceCall},
        BundleSimulation, ChainAdapter, ChainError, SubmissionReceipt,
    },
    config::ChainConfig,
};
use agg_rs::{
    encoding,
    rewards::RewardToken,
    types::{Bundle, TransactionFailure},
};
use async_trait::async_trait;
use ethers::{
    middleware::SignerMiddleware,
    providers::{Http, Middleware, Provider},
    signers::{coins_bip39::English, LocalWallet, MnemonicBuilder, Signer},
    types::{transaction::eip2718::TypedTransaction, Address, Bytes, TransactionRequest, U256},
};
use std::{collections::HashMap, time::Duration};
use tracing::debug;

type LocalSigner = SignerMiddleware<Provider<Http>, LocalWallet>;

/// JSON-RPC implementation of the chain facade. The reward token is fixed
/// at construction, so balance measurement dispatches once here rather
/// than per call.
pub struct EthAdapter {
    client: LocalSigner,
    wallet_address: Address,
    verification_gateway: Address,
    utilities: Address,
    reward_token: RewardToken,
}

impl EthAdapter {
    pub fn new(config: &ChainConfig, reward_token: RewardToken) -> Result<Self, ChainError> {
        let wallet = MnemonicBuilder::<English>::default()
            .phrase(config.mnemonic.as_str())
            .index(0u32)
            .map_err(|err| ChainError::Wallet(err.to_string()))?
            .build()
            .map_err(|err| ChainError::Wallet(err.to_string()))?;
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .map_err(|err| ChainError::Rpc(err.to_string()))?;
        let client = SignerMiddleware::new(provider, wallet.with_chain_id(config.chain_id));
        let wallet_address = client.address();
        Ok(Self {
            client,
            wallet_address,
            verification_gateway: config.verification_gateway,
            utilities: config.utilities,
            reward_token,
        })
    }

    fn measure_call(&self) -> SequenceCall {
        match self.reward_token {
            RewardToken::Native => SequenceCall {
                target: self.utilities,
                data: gateway::encode_eth_balance_of(self.wallet_address),
            },
            RewardToken::Token(token) => SequenceCall {
                target: token,
                data: gateway::encode_balance_of(self.wallet_address),
            },
        }
    }

    async fn call_static(&self, target: Address, data: Bytes) -> Result<Bytes, ChainError> {
        let tx: TypedTransaction =
            TransactionRequest::new().from(self.wallet_address).to(target).data(data).into();
        self.client.call(&tx, None).await.map_err(|err| ChainError::Rpc(err.to_string()))
    }

    async fn wallet_nonce(&self, public_key: &agg_rs::BlsPublicKey) -> Result<u64, ChainError> {
        let output =
            self.call_static(self.verification_gateway, gateway::encode_nonce_of(public_key)).await?;
        Ok(gateway::decode_uint(&output)?.low_u64())
    }
}

#[async_trait]
impl ChainAdapter for EthAdapter {
    async fn block_number(&self) -> Result<u64, ChainError> {
        let block_number = self
            .client
            .get_block_number()
            .await
            .map_err(|err| ChainError::Rpc(err.to_string()))?;
        Ok(block_number.as_u64())
    }

    async fn check_nonces(&self, bundle: &Bundle) -> Result<Vec<TransactionFailure>, ChainError> {
        let mut wallet_nonces = HashMap::new();
        for public_key in &bundle.sender_public_keys {
            if !wallet_nonces.contains_key(public_key) {
                let nonce = self.wallet_nonce(public_key).await?;
                wallet_nonces.insert(*public_key, nonce);
            }
        }
        Ok(diff_nonces(bundle, &wallet_nonces))
    }

    async fn measure_bundle_rewards(
        &self,
        prior: Option<&Bundle>,
        candidates: &[Bundle],
    ) -> Result<Vec<BundleSimulation>, ChainError> {
        let staged = prior.into_iter().chain(candidates).collect::<Vec<_>>();
        let measure = self.measure_call();
        let mut calls = vec![measure.clone()];
        for &bundle in &staged {
            calls.push(SequenceCall {
                target: self.verification_gateway,
                data: encoding::encode_process_bundle(bundle),
            });
            calls.push(measure.clone());
        }

        let output =
            self.call_static(self.utilities, gateway::encode_perform_sequence(&calls)).await?;
        let results = gateway::decode_perform_sequence_output(&output)?;
        if results.len() != calls.len() {
            return Err(ChainError::MalformedSequence);
        }

        // balance probes sit at the even indices, staged bundles between
        let mut balances = Vec::with_capacity(staged.len() + 1);
        for result in results.iter().step_by(2) {
            if !result.success {
                return Err(ChainError::MeasurementFailed);
            }
            balances.push(gateway::decode_uint(&result.output)?);
        }

        let mut simulations = Vec::with_capacity(staged.len());
        for (i, _) in staged.iter().enumerate() {
            let result = &results[2 * i + 1];
            let success = result.success
                && encoding::decode_process_bundle_output(&result.output)
                    .map(|(successes, _)| successes.iter().any(|ok| *ok))
                    .unwrap_or(false);
            let reward = balances[i + 1].saturating_sub(balances[i]);
            simulations.push(BundleSimulation { success, reward });
        }
        let skip = usize::from(prior.is_some());
        Ok(simulations.split_off(skip))
    }

    async fn estimate_gas(&self, bundle: &Bundle) -> Result<U256, ChainError> {
        let tx: TypedTransaction = TransactionRequest::new()
            .from(self.wallet_address)
            .to(self.verification_gateway)
            .data(encoding::encode_process_bundle(bundle))
            .into();
        self.client.estimate_gas(&tx, None).await.map_err(|err| ChainError::Rpc(err.to_string()))
    }

    fn encode_call_data(&self, bundle: &Bundle) -> Bytes {
        encoding::encode_process_bundle(bundle)
    }

    async fn submit_bundle(
        &self,
        bundle: &Bundle,
        timeout: Duration,
    ) -> Result<SubmissionReceipt, ChainError> {
        let request = TransactionRequest::new()
            .from(self.wallet_address)
            .to(self.verification_gateway)
            .data(encoding::encode_process_bundle(bundle));
        let mut tx: TypedTransaction = request.into();
        self.client
            .fill_transaction(&mut tx, None)
            .await
            .map_err(|err| ChainError::Rpc(err.to_string()))?;
        debug!(actions = bundle.action_count(), "broadcasting aggregate bundle");
        let pending = self
            .client
            .send_transaction(tx, None)
            .await
            .map_err(|err| ChainError::Rpc(err.to_string()))?;
        let receipt = tokio::time::timeout(timeout, pending.confirmations(1))
            .await
            .map_err(|_| ChainError::SubmissionTimeout(timeout))??
            .ok_or(ChainError::Dropped)?;
        let block_number = receipt.block_number.ok_or(ChainError::Dropped)?.as_u64();
        Ok(SubmissionReceipt { transaction_hash: receipt.transaction_hash, block_number })
    }
}

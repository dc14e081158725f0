use agg_rs::rewards::RewardConfig;
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::{net::Ipv4Addr, path::PathBuf, time::Duration};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Address the admission API listens on.
    pub host: Ipv4Addr,
    pub port: u16,
    /// Path of the SQLite bundle table.
    pub db_path: PathBuf,
    pub chain: ChainConfig,
    pub aggregation: AggregationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::UNSPECIFIED,
            port: 3000,
            db_path: "bundles.sqlite".into(),
            chain: Default::default(),
            aggregation: Default::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainConfig {
    pub rpc_url: String,
    /// Mnemonic for the aggregator's submitting wallet.
    pub mnemonic: String,
    pub chain_id: u64,
    pub verification_gateway: Address,
    /// Helper contract providing `ethBalanceOf` and the staged-sequence
    /// static call.
    pub utilities: Address,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://localhost:8545".to_string(),
            mnemonic: String::new(),
            chain_id: 31337,
            verification_gateway: Address::zero(),
            utilities: Address::zero(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Cap on rows fetched per eligibility query.
    pub bundle_query_limit: usize,
    /// Target and hard cap on actions per aggregate.
    pub max_aggregation_size: usize,
    /// Soft deadline after the first eligible activity.
    pub max_aggregation_delay_millis: u64,
    /// Concurrency cap; multiplied by `max_aggregation_size` to bound
    /// in-flight unconfirmed actions.
    pub max_unconfirmed_aggregations: usize,
    /// Largest `next_eligibility_delay` before a failing row is dropped.
    pub max_eligibility_delay: u64,
    pub submission_timeout_secs: u64,
    pub block_poll_interval_millis: u64,
    /// Delay before the block-tick loop starts.
    pub warm_up_millis: u64,
    pub rewards: RewardConfig,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            bundle_query_limit: 50,
            max_aggregation_size: 16,
            max_aggregation_delay_millis: 5000,
            max_unconfirmed_aggregations: 3,
            max_eligibility_delay: 256,
            submission_timeout_secs: 120,
            block_poll_interval_millis: 1000,
            warm_up_millis: 500,
            rewards: Default::default(),
        }
    }
}

impl AggregationConfig {
    pub fn max_aggregation_delay(&self) -> Duration {
        Duration::from_millis(self.max_aggregation_delay_millis)
    }

    pub fn submission_timeout(&self) -> Duration {
        Duration::from_secs(self.submission_timeout_secs)
    }

    pub fn block_poll_interval(&self) -> Duration {
        Duration::from_millis(self.block_poll_interval_millis)
    }

    pub fn warm_up(&self) -> Duration {
        Duration::from_millis(self.warm_up_millis)
    }

    /// Total actions allowed across all unconfirmed aggregates.
    pub fn unconfirmed_action_cap(&self) -> u64 {
        self.max_unconfirmed_aggregations as u64 * self.max_aggregation_size as u64
    }
}

use ethers::types::{Address, U256};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unknown reward token `{0}`; expected `ether` or `token:0x…`")]
    UnknownToken(String),
    #[error("invalid token address in `{0}`")]
    InvalidAddress(String),
}

/// Which asset the aggregator is paid in. Configured once; the chain
/// adapter's measurement primitive dispatches on this at setup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RewardToken {
    Native,
    Token(Address),
}

impl FromStr for RewardToken {
    type Err = ParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if input == "ether" {
            return Ok(Self::Native);
        }
        match input.strip_prefix("token:") {
            Some(address) => address
                .parse()
                .map(Self::Token)
                .map_err(|_| ParseError::InvalidAddress(input.to_string())),
            None => Err(ParseError::UnknownToken(input.to_string())),
        }
    }
}

impl fmt::Display for RewardToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => write!(f, "ether"),
            Self::Token(address) => write!(f, "token:0x{}", hex::encode(address)),
        }
    }
}

impl Serialize for RewardToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RewardToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let input = <String>::deserialize(deserializer)?;
        input.parse().map_err(de::Error::custom)
    }
}

/// Linear reward model: a bundle must pay
/// `per_gas · gas + per_byte · call_data_len` to be worth including.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RewardConfig {
    #[serde(rename = "type")]
    pub token: RewardToken,
    pub per_gas: U256,
    pub per_byte: U256,
}

impl RewardConfig {
    pub fn required_reward(&self, gas: U256, call_data_len: usize) -> U256 {
        self.per_gas
            .saturating_mul(gas)
            .saturating_add(self.per_byte.saturating_mul(call_data_len.into()))
    }

    /// Cheap lower bound on the required reward: the call-data term alone.
    /// Monotone in call-data size, which dominates the cost in practice.
    pub fn required_reward_lower_bound(&self, call_data_len: usize) -> U256 {
        self.per_byte.saturating_mul(call_data_len.into())
    }
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self { token: RewardToken::Native, per_gas: U256::zero(), per_byte: U256::zero() }
    }
}

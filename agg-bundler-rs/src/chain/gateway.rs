//! ABI helpers for the adapter-side contract surface: the utilities
//! contract's balance probes and staged-sequence entry point, and the
//! gateway's wallet-nonce view. `processBundle` itself is encoded in
//! `agg_rs::encoding`, shared with clients.

use agg_rs::signing::BlsPublicKey;
use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, U256};

/// One staged call: a target contract and pre-encoded call data.
#[derive(Clone, Debug)]
pub struct SequenceCall {
    pub target: Address,
    pub data: Bytes,
}

/// Result of one staged call as reported by `performSequence`.
#[derive(Clone, Debug)]
pub struct SequenceResult {
    pub success: bool,
    pub output: Bytes,
}

/// `rewardToken.balanceOf(account)`.
pub fn encode_balance_of(account: Address) -> Bytes {
    let mut data = abi::short_signature("balanceOf", &[ParamType::Address]).to_vec();
    data.extend(abi::encode(&[Token::Address(account)]));
    data.into()
}

/// `utilities.ethBalanceOf(account)`.
pub fn encode_eth_balance_of(account: Address) -> Bytes {
    let mut data = abi::short_signature("ethBalanceOf", &[ParamType::Address]).to_vec();
    data.extend(abi::encode(&[Token::Address(account)]));
    data.into()
}

/// `verificationGateway.nonceOf(publicKey)`.
pub fn encode_nonce_of(public_key: &BlsPublicKey) -> Bytes {
    let mut data = abi::short_signature("nonceOf", &[ParamType::Bytes]).to_vec();
    data.extend(abi::encode(&[Token::Bytes(public_key.as_bytes().to_vec())]));
    data.into()
}

/// `utilities.performSequence((address,bytes)[])`, which executes the
/// calls in order inside one static call, catching reverts per call.
pub fn encode_perform_sequence(calls: &[SequenceCall]) -> Bytes {
    let call_param =
        ParamType::Array(Box::new(ParamType::Tuple(vec![ParamType::Address, ParamType::Bytes])));
    let tokens = calls
        .iter()
        .map(|call| {
            Token::Tuple(vec![Token::Address(call.target), Token::Bytes(call.data.to_vec())])
        })
        .collect();
    let mut data = abi::short_signature("performSequence", &[call_param]).to_vec();
    data.extend(abi::encode(&[Token::Array(tokens)]));
    data.into()
}

/// Decode the `(bool success, bytes result)[]` from `performSequence`.
pub fn decode_perform_sequence_output(data: &[u8]) -> Result<Vec<SequenceResult>, abi::Error> {
    let tokens = abi::decode(
        &[ParamType::Array(Box::new(ParamType::Tuple(vec![
            ParamType::Bool,
            ParamType::Bytes,
        ])))],
        data,
    )?;
    tokens
        .into_iter()
        .next()
        .and_then(Token::into_array)
        .ok_or(abi::Error::InvalidData)?
        .into_iter()
        .map(|token| {
            let mut fields =
                token.into_tuple().ok_or(abi::Error::InvalidData)?.into_iter();
            let success =
                fields.next().and_then(Token::into_bool).ok_or(abi::Error::InvalidData)?;
            let output = fields
                .next()
                .and_then(Token::into_bytes)
                .map(Bytes::from)
                .ok_or(abi::Error::InvalidData)?;
            Ok(SequenceResult { success, output })
        })
        .collect()
}

/// Decode a single ABI-encoded `uint256`, e.g. a balance or nonce.
pub fn decode_uint(data: &[u8]) -> Result<U256, abi::Error> {
    abi::decode(&[ParamType::Uint(256)], data)?
        .into_iter()
        .next()
        .and_then(Token::into_uint)
        .ok_or(abi::Error::InvalidData)
}

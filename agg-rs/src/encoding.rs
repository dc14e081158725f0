//! ABI encoding of the fixed on-chain surface shared between clients and
//! the aggregator: the verification gateway's `processBundle` entry point
//! and the per-operation message that wallets sign.

use crate::types::{Action, Bundle, Operation};
use ethers::abi::{self, ParamType, Token};
use ethers::types::Bytes;

fn action_param() -> ParamType {
    ParamType::Tuple(vec![ParamType::Address, ParamType::Uint(256), ParamType::Bytes])
}

fn operation_param() -> ParamType {
    ParamType::Tuple(vec![ParamType::Uint(256), ParamType::Array(Box::new(action_param()))])
}

fn bundle_param() -> ParamType {
    ParamType::Tuple(vec![
        ParamType::Bytes,
        ParamType::Array(Box::new(ParamType::Bytes)),
        ParamType::Array(Box::new(operation_param())),
    ])
}

fn action_token(action: &Action) -> Token {
    Token::Tuple(vec![
        Token::Address(action.target),
        Token::Uint(action.value),
        Token::Bytes(action.data.to_vec()),
    ])
}

fn operation_token(operation: &Operation) -> Token {
    Token::Tuple(vec![
        Token::Uint(operation.nonce.into()),
        Token::Array(operation.actions.iter().map(action_token).collect()),
    ])
}

fn bundle_token(bundle: &Bundle) -> Token {
    Token::Tuple(vec![
        Token::Bytes(bundle.signature.as_bytes().to_vec()),
        Token::Array(
            bundle
                .sender_public_keys
                .iter()
                .map(|key| Token::Bytes(key.as_bytes().to_vec()))
                .collect(),
        ),
        Token::Array(bundle.operations.iter().map(operation_token).collect()),
    ])
}

/// Call data for `verificationGateway.processBundle(bundle)`.
pub fn encode_process_bundle(bundle: &Bundle) -> Bytes {
    let mut data = abi::short_signature("processBundle", &[bundle_param()]).to_vec();
    data.extend(abi::encode(&[bundle_token(bundle)]));
    data.into()
}

/// Decode the `(bool[] successes, bytes[][] results)` returned by
/// `processBundle`.
pub fn decode_process_bundle_output(data: &[u8]) -> Result<(Vec<bool>, Vec<Vec<Bytes>>), abi::Error> {
    let tokens = abi::decode(
        &[
            ParamType::Array(Box::new(ParamType::Bool)),
            ParamType::Array(Box::new(ParamType::Array(Box::new(ParamType::Bytes)))),
        ],
        data,
    )?;
    let mut tokens = tokens.into_iter();
    let successes = tokens
        .next()
        .and_then(Token::into_array)
        .ok_or(abi::Error::InvalidData)?
        .into_iter()
        .map(|token| token.into_bool().ok_or(abi::Error::InvalidData))
        .collect::<Result<Vec<_>, _>>()?;
    let results = tokens
        .next()
        .and_then(Token::into_array)
        .ok_or(abi::Error::InvalidData)?
        .into_iter()
        .map(|operation_results| {
            operation_results
                .into_array()
                .ok_or(abi::Error::InvalidData)?
                .into_iter()
                .map(|token| {
                    token.into_bytes().map(Bytes::from).ok_or(abi::Error::InvalidData)
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok((successes, results))
}

/// The message a wallet signs for a single operation: the ABI encoding of
/// its nonce and actions. Callers prepend the signer's public key before
/// hashing to the curve (the aug scheme).
pub fn operation_message(operation: &Operation) -> Vec<u8> {
    abi::encode(&[
        Token::Uint(operation.nonce.into()),
        Token::Array(operation.actions.iter().map(action_token).collect()),
    ])
}

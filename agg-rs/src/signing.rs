use crate::{
    encoding::operation_message,
    serde::{to_hex_str, try_bytes_from_hex_str},
    types::{Bundle, Operation},
};
use blst::{
    min_pk::{AggregateSignature, PublicKey, SecretKey, Signature},
    BLST_ERROR,
};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Domain separation tag for the BLS "aug" scheme: every message is
/// prepended with the signer's public key, which makes aggregate
/// verification over per-operation messages well-defined even when the
/// same wallet signs equal payloads.
pub const DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_AUG_";

pub const PUBLIC_KEY_BYTES: usize = 48;
pub const SIGNATURE_BYTES: usize = 96;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid BLS public key encoding")]
    InvalidPublicKey,
    #[error("invalid BLS signature encoding")]
    InvalidSignature,
    #[error("aggregate signature does not verify against the declared operations")]
    VerificationFailed,
    #[error("cannot aggregate an empty set of signatures")]
    EmptyAggregation,
    #[error("operation count {operations} does not match sender key count {keys}")]
    ShapeMismatch { operations: usize, keys: usize },
}

/// Compressed G1 public key of a sender wallet.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlsPublicKey([u8; PUBLIC_KEY_BYTES]);

impl BlsPublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let key = PublicKey::from_bytes(bytes).map_err(|_| Error::InvalidPublicKey)?;
        key.validate().map_err(|_| Error::InvalidPublicKey)?;
        Ok(Self(key.to_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_BYTES] {
        &self.0
    }

    /// Abbreviated form used in log lines and events.
    pub fn short(&self) -> String {
        format!("0x{}", hex::encode(&self.0[..4]))
    }

    fn parsed(&self) -> Result<PublicKey, Error> {
        PublicKey::from_bytes(&self.0).map_err(|_| Error::InvalidPublicKey)
    }
}

impl fmt::Display for BlsPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", to_hex_str(&self.0))
    }
}

impl fmt::Debug for BlsPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlsPublicKey({self})")
    }
}

impl FromStr for BlsPublicKey {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let bytes = try_bytes_from_hex_str(input).map_err(|_| Error::InvalidPublicKey)?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for BlsPublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&to_hex_str(&self.0))
    }
}

impl<'de> Deserialize<'de> for BlsPublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let input = <String>::deserialize(deserializer)?;
        input.parse().map_err(de::Error::custom)
    }
}

/// Compressed G2 signature, possibly the aggregation of many.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BlsSignature([u8; SIGNATURE_BYTES]);

impl BlsSignature {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let signature = Signature::from_bytes(bytes).map_err(|_| Error::InvalidSignature)?;
        Ok(Self(signature.to_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_BYTES] {
        &self.0
    }

    fn parsed(&self) -> Result<Signature, Error> {
        Signature::from_bytes(&self.0).map_err(|_| Error::InvalidSignature)
    }
}

impl fmt::Display for BlsSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", to_hex_str(&self.0))
    }
}

impl fmt::Debug for BlsSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlsSignature({self})")
    }
}

impl FromStr for BlsSignature {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let bytes = try_bytes_from_hex_str(input).map_err(|_| Error::InvalidSignature)?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for BlsSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&to_hex_str(&self.0))
    }
}

impl<'de> Deserialize<'de> for BlsSignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let input = <String>::deserialize(deserializer)?;
        input.parse().map_err(de::Error::custom)
    }
}

/// Client-side signing key. The aggregator itself never holds these; they
/// exist for wallets and for tests.
pub struct BlsSecretKey(SecretKey);

impl BlsSecretKey {
    /// Derive a key from 32 bytes of input key material.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let secret_key = SecretKey::key_gen(seed, &[]).expect("seed meets the ikm length bound");
        Self(secret_key)
    }

    pub fn public_key(&self) -> BlsPublicKey {
        BlsPublicKey(self.0.sk_to_pk().to_bytes())
    }

    pub fn sign_operation(&self, operation: &Operation) -> BlsSignature {
        let message = prepend_public_key(&self.public_key(), &operation_message(operation));
        BlsSignature(self.0.sign(&message, DST, &[]).to_bytes())
    }
}

fn prepend_public_key(public_key: &BlsPublicKey, message: &[u8]) -> Vec<u8> {
    let mut prepended = public_key.as_bytes().to_vec();
    prepended.extend_from_slice(message);
    prepended
}

/// Aggregate many signatures into one.
pub fn aggregate_signatures(signatures: &[BlsSignature]) -> Result<BlsSignature, Error> {
    if signatures.is_empty() {
        return Err(Error::EmptyAggregation);
    }
    let parsed =
        signatures.iter().map(|signature| signature.parsed()).collect::<Result<Vec<_>, _>>()?;
    let refs = parsed.iter().collect::<Vec<_>>();
    let aggregate =
        AggregateSignature::aggregate(&refs, true).map_err(|_| Error::InvalidSignature)?;
    Ok(BlsSignature(aggregate.to_signature().to_bytes()))
}

/// Verify a bundle's aggregate signature against its `(sender, operation)`
/// pairs.
pub fn verify_bundle(bundle: &Bundle) -> Result<(), Error> {
    if bundle.sender_public_keys.len() != bundle.operations.len() {
        return Err(Error::ShapeMismatch {
            operations: bundle.operations.len(),
            keys: bundle.sender_public_keys.len(),
        });
    }
    if bundle.operations.is_empty() {
        return Err(Error::EmptyAggregation);
    }

    let signature = bundle.signature.parsed()?;
    let keys = bundle
        .sender_public_keys
        .iter()
        .map(|key| key.parsed())
        .collect::<Result<Vec<_>, _>>()?;
    let key_refs = keys.iter().collect::<Vec<_>>();
    let messages = bundle
        .sender_public_keys
        .iter()
        .zip(&bundle.operations)
        .map(|(key, operation)| prepend_public_key(key, &operation_message(operation)))
        .collect::<Vec<_>>();
    let message_refs = messages.iter().map(|message| message.as_slice()).collect::<Vec<_>>();

    match signature.aggregate_verify(true, &message_refs, DST, &key_refs, true) {
        BLST_ERROR::BLST_SUCCESS => Ok(()),
        _ => Err(Error::VerificationFailed),
    }
}

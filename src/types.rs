//! Core types for event mining
//!
//! Events follow the Nostr event layout. Difficulty is measured in leading
//! zero bits of the event's SHA-256 commitment (NIP-13).

use crate::{Error, Result};
use serde::de::{self, Deserializer, Unexpected, Visitor};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the tag that carries the proof-of-work nonce
pub const NONCE_TAG: &str = "nonce";

/// Bit width of the event digest (SHA-256)
pub const HASH_BITS: u32 = 256;

/// Number of leading zero bits in a digest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Difficulty(pub u32);

impl Difficulty {
    /// Hardest representable difficulty: an all-zero digest
    pub const MAX: Difficulty = Difficulty(HASH_BITS);

    /// Create a difficulty, rejecting values above the digest width
    pub fn new(bits: u32) -> Result<Self> {
        if bits > HASH_BITS {
            return Err(Error::target_too_high(bits.into(), HASH_BITS));
        }
        Ok(Self(bits))
    }

    /// Get the number of bits
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Difficulty achieved by a digest
    pub fn of_hash(hash: &[u8]) -> Self {
        Self(crate::crypto::leading_zero_bits(hash))
    }

    /// Check whether this (achieved) difficulty satisfies a target
    pub fn meets(self, target: Difficulty) -> bool {
        self >= target
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Proof-of-work nonce, rendered in decimal inside the nonce tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Nonce(pub u64);

impl Nonce {
    /// Create a new nonce
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the nonce value
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Advance by `step`, or `None` once the counter space is exhausted
    pub fn checked_add(self, step: u64) -> Option<Self> {
        self.0.checked_add(step).map(Self)
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Nonce {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// A Nostr-style event submitted for mining.
///
/// ```json
/// {
///   "created_at": 1700000000,
///   "kind": 1,
///   "tags": [["t", "news"]],
///   "content": "hello",
///   "pubkey": "test_pubkey"
/// }
/// ```
///
/// `id` is only present once the event has been mined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Hex SHA-256 of the canonical commitment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Unix timestamp of creation
    pub created_at: u64,
    /// Kind number, e.g. `1`
    pub kind: u32,
    /// Ordered tags; the first element of each names the tag
    pub tags: Vec<Vec<String>>,
    /// Event content body
    pub content: String,
    /// Author public key
    pub pubkey: String,
}

impl Event {
    /// The nonce tag, if the event carries one
    pub fn nonce_tag(&self) -> Option<&[String]> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some(NONCE_TAG))
            .map(Vec::as_slice)
    }

    /// Append `["nonce", <nonce>, <target>]` after the existing tags
    pub fn push_nonce_tag(&mut self, nonce: Nonce, target: Difficulty) {
        self.tags.push(vec![
            NONCE_TAG.to_string(),
            nonce.to_string(),
            target.to_string(),
        ]);
    }

    /// Canonical commitment bytes: `[0,pubkey,created_at,kind,tags,content]`
    pub fn commitment(&self) -> Result<Vec<u8>> {
        let commitment = (
            0u8,
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
        Ok(serde_json::to_vec(&commitment)?)
    }

    /// SHA-256 of the canonical commitment
    pub fn digest(&self) -> Result<[u8; 32]> {
        Ok(crate::crypto::sha256(&self.commitment()?))
    }

    /// Recompute and store `id` from the current fields
    pub fn assign_id(&mut self) -> Result<[u8; 32]> {
        let digest = self.digest()?;
        self.id = Some(hex::encode(digest));
        Ok(digest)
    }
}

/// Request frame: an event template and the requested difficulty
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiningRequest {
    /// Event to mine; must not carry a nonce tag yet
    pub event: Event,
    /// Required leading zero bits; any non-negative integer is accepted
    /// here and range-checked by the coordinator
    #[serde(deserialize_with = "deserialize_target_pow")]
    pub target_pow: u64,
}

/// Integers beyond `u64` arrive from serde_json as floats and saturate,
/// so they are still reported as out of range rather than malformed.
fn deserialize_target_pow<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    struct TargetPowVisitor;

    impl<'de> Visitor<'de> for TargetPowVisitor {
        type Value = u64;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a non-negative integer")
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> std::result::Result<u64, E> {
            Ok(value)
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> std::result::Result<u64, E> {
            u64::try_from(value).map_err(|_| E::invalid_value(Unexpected::Signed(value), &self))
        }

        fn visit_f64<E: de::Error>(self, value: f64) -> std::result::Result<u64, E> {
            if value.fract() == 0.0 && value >= U64_OVERFLOW {
                Ok(u64::MAX)
            } else {
                Err(E::invalid_value(Unexpected::Float(value), &self))
            }
        }
    }

    deserializer.deserialize_any(TargetPowVisitor)
}

/// 2^64, the smallest float above every `u64`
const U64_OVERFLOW: f64 = 18_446_744_073_709_551_616.0;

/// Mined event together with the difficulty its id achieves
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiningResult {
    /// Achieved difficulty, at least the requested target
    pub pow: u32,
    /// Event including the nonce tag and final id
    pub event: Event,
}

//! Hashing for event mining
//!
//! The search hashes the canonical commitment of an event whose last tag is
//! `["nonce", <n>, <target>]`. Everything before the nonce digits is hashed
//! once into a SHA-256 midstate; each trial only feeds the digits and the
//! fixed suffix.

use crate::types::{Difficulty, Event, Nonce, NONCE_TAG};
use crate::{Error, Result};
use sha2::{Digest, Sha256};
use std::io::Write;

/// Version of the canonical serialization hashed by the search
pub const CANONICAL_VERSION: u32 = 1;

/// SHA-256 of `data`
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Count zero bits from the most significant bit of `hash[0]`
pub fn leading_zero_bits(hash: &[u8]) -> u32 {
    let mut count = 0;
    for &byte in hash {
        let zeros = byte.leading_zeros();
        count += zeros;
        if zeros < 8 {
            break;
        }
    }
    count
}

/// Render `value` in decimal into `buf`, returning the used tail
fn decimal_digits(value: u64, buf: &mut [u8; 20]) -> &[u8] {
    let mut pos = buf.len();
    let mut n = value;
    loop {
        pos -= 1;
        buf[pos] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    &buf[pos..]
}

/// Event commitment split around the nonce value
#[derive(Clone)]
pub struct CanonicalTemplate {
    prefix: Vec<u8>,
    suffix: Vec<u8>,
    midstate: Sha256,
}

impl CanonicalTemplate {
    /// Build the template for mining `event` at `target`.
    ///
    /// The event must not already carry a nonce tag.
    pub fn new(event: &Event, target: Difficulty) -> Result<Self> {
        if event.nonce_tag().is_some() {
            return Err(Error::invalid_request("event already carries a nonce tag"));
        }

        let mut prefix = Vec::with_capacity(128 + event.content.len());
        prefix.extend_from_slice(b"[0,");
        serde_json::to_writer(&mut prefix, &event.pubkey)?;
        write!(prefix, ",{},{},[", event.created_at, event.kind)?;
        for tag in &event.tags {
            serde_json::to_writer(&mut prefix, tag)?;
            prefix.push(b',');
        }
        prefix.extend_from_slice(b"[");
        serde_json::to_writer(&mut prefix, NONCE_TAG)?;
        prefix.extend_from_slice(b",\"");

        let mut suffix = Vec::with_capacity(16 + event.content.len());
        suffix.extend_from_slice(b"\",");
        serde_json::to_writer(&mut suffix, &target.to_string())?;
        suffix.extend_from_slice(b"]],");
        serde_json::to_writer(&mut suffix, &event.content)?;
        suffix.push(b']');

        let mut midstate = Sha256::new();
        midstate.update(&prefix);

        Ok(Self {
            prefix,
            suffix,
            midstate,
        })
    }

    /// Full canonical bytes for a trial nonce
    pub fn serialize(&self, nonce: Nonce) -> Vec<u8> {
        let mut buf = [0u8; 20];
        let digits = decimal_digits(nonce.value(), &mut buf);
        let mut bytes = Vec::with_capacity(self.prefix.len() + digits.len() + self.suffix.len());
        bytes.extend_from_slice(&self.prefix);
        bytes.extend_from_slice(digits);
        bytes.extend_from_slice(&self.suffix);
        bytes
    }

    /// Digest of the commitment with `nonce` in the nonce tag
    pub fn digest(&self, nonce: Nonce) -> [u8; 32] {
        let mut buf = [0u8; 20];
        let mut hasher = self.midstate.clone();
        hasher.update(decimal_digits(nonce.value(), &mut buf));
        hasher.update(&self.suffix);
        hasher.finalize().into()
    }

    /// Hash a trial nonce and check it against `target`
    pub fn hash_and_check(&self, nonce: Nonce, target: Difficulty) -> (bool, [u8; 32]) {
        let hash = self.digest(nonce);
        (Difficulty::of_hash(&hash).meets(target), hash)
    }
}

impl std::fmt::Debug for CanonicalTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanonicalTemplate")
            .field("prefix", &String::from_utf8_lossy(&self.prefix))
            .field("suffix", &String::from_utf8_lossy(&self.suffix))
            .finish()
    }
}

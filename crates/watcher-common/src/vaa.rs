//! VAA (attestation) parsing
//!
//! A redemption transaction always carries the attestation it consumes. Two
//! encodings reach the watcher:
//!
//! - the signed v1 VAA (big-endian), embedded in EVM calldata, Aptos entry
//!   function arguments and Terra execute messages;
//! - the borsh-encoded `PostVAA` instruction data (little-endian) of the
//!   Solana core bridge, which carries the body without signatures.
//!
//! Both reduce to the same identity `(emitter_chain, emitter_address, sequence)`
//! and therefore the same [`MessageId`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ChainId;

const SIGNATURE_LEN: usize = 66;
const HEADER_LEN: usize = 6;
const BODY_FIXED_LEN: usize = 4 + 4 + 2 + 32 + 8 + 1;

/// `PostVAA` instruction discriminant on the Solana core bridge.
pub const POST_VAA_TAG: u8 = 0x02;
/// tag + version + gsi + timestamp + nonce + chain + emitter + sequence + consistency + payload len
const POSTED_MIN_LEN: usize = 1 + 1 + 4 + 4 + 4 + 2 + 32 + 8 + 1 + 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VaaError {
    #[error("vaa too short: {len} bytes, need at least {need}")]
    TooShort { len: usize, need: usize },
    #[error("unsupported vaa version {0}")]
    UnsupportedVersion(u8),
    #[error("vaa truncated: {0}")]
    Truncated(&'static str),
    #[error("not a PostVAA instruction (tag {0:#04x})")]
    NotPostVaa(u8),
    #[error("invalid hex: {0}")]
    InvalidHex(String),
}

/// Canonical key of a redemption record: `{chain}/{emitter}/{sequence}`.
///
/// The emitter is rendered as 64 lowercase hex digits without prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(emitter_chain: ChainId, emitter_address: &[u8; 32], sequence: u64) -> Self {
        Self(format!(
            "{}/{}/{}",
            emitter_chain.as_u16(),
            hex::encode(emitter_address),
            sequence
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<MessageId> for String {
    fn from(id: MessageId) -> Self {
        id.0
    }
}

/// A parsed v1 VAA. Signatures are counted but not verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vaa {
    pub version: u8,
    pub guardian_set_index: u32,
    pub signature_count: u8,
    pub timestamp: u32,
    pub nonce: u32,
    pub emitter_chain: ChainId,
    pub emitter_address: [u8; 32],
    pub sequence: u64,
    pub consistency_level: u8,
    pub payload: Vec<u8>,
}

impl Vaa {
    pub fn parse(bytes: &[u8]) -> Result<Self, VaaError> {
        if bytes.len() < HEADER_LEN {
            return Err(VaaError::TooShort { len: bytes.len(), need: HEADER_LEN });
        }
        let mut reader = BeReader::new(bytes);
        let version = reader.u8()?;
        if version != 1 {
            return Err(VaaError::UnsupportedVersion(version));
        }
        let guardian_set_index = reader.u32()?;
        let signature_count = reader.u8()?;
        reader
            .skip(usize::from(signature_count) * SIGNATURE_LEN)
            .map_err(|_| VaaError::Truncated("signatures"))?;
        if reader.remaining() < BODY_FIXED_LEN {
            return Err(VaaError::Truncated("body"));
        }

        let timestamp = reader.u32()?;
        let nonce = reader.u32()?;
        let emitter_chain = ChainId::new(reader.u16()?);
        let emitter_address = reader.array32()?;
        let sequence = reader.u64()?;
        let consistency_level = reader.u8()?;
        let payload = reader.rest().to_vec();

        Ok(Self {
            version,
            guardian_set_index,
            signature_count,
            timestamp,
            nonce,
            emitter_chain,
            emitter_address,
            sequence,
            consistency_level,
            payload,
        })
    }

    /// Parse a hex-encoded VAA, with or without `0x`.
    pub fn parse_hex(value: &str) -> Result<Self, VaaError> {
        let bytes = crate::decode_hex(value).map_err(|e| VaaError::InvalidHex(e.to_string()))?;
        Self::parse(&bytes)
    }

    pub fn message_id(&self) -> MessageId {
        MessageId::new(self.emitter_chain, &self.emitter_address, self.sequence)
    }
}

/// Body of a Solana core-bridge `PostVAA` instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedVaa {
    pub version: u8,
    pub guardian_set_index: u32,
    pub timestamp: u32,
    pub nonce: u32,
    pub emitter_chain: ChainId,
    pub emitter_address: [u8; 32],
    pub sequence: u64,
    pub consistency_level: u8,
    pub payload: Vec<u8>,
}

impl PostedVaa {
    pub fn parse_instruction(data: &[u8]) -> Result<Self, VaaError> {
        if data.len() < POSTED_MIN_LEN {
            return Err(VaaError::TooShort { len: data.len(), need: POSTED_MIN_LEN });
        }
        if data[0] != POST_VAA_TAG {
            return Err(VaaError::NotPostVaa(data[0]));
        }

        let mut reader = LeReader::new(&data[1..]);
        let version = reader.u8()?;
        let guardian_set_index = reader.u32()?;
        let timestamp = reader.u32()?;
        let nonce = reader.u32()?;
        let emitter_chain = ChainId::new(reader.u16()?);
        let emitter_address = reader.array32()?;
        let sequence = reader.u64()?;
        let consistency_level = reader.u8()?;
        let payload_len = reader.u32()? as usize;
        let payload = reader.take(payload_len).map_err(|_| VaaError::Truncated("payload"))?.to_vec();

        Ok(Self {
            version,
            guardian_set_index,
            timestamp,
            nonce,
            emitter_chain,
            emitter_address,
            sequence,
            consistency_level,
            payload,
        })
    }

    pub fn message_id(&self) -> MessageId {
        MessageId::new(self.emitter_chain, &self.emitter_address, self.sequence)
    }
}

// ===== Byte readers =====

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], VaaError> {
        let end = self.pos.checked_add(n).ok_or(VaaError::Truncated("length overflow"))?;
        let slice = self.bytes.get(self.pos..end).ok_or(VaaError::Truncated("body"))?;
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], VaaError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}

struct BeReader<'a>(Cursor<'a>);

impl<'a> BeReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self(Cursor { bytes, pos: 0 })
    }

    fn u8(&mut self) -> Result<u8, VaaError> {
        Ok(self.0.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, VaaError> {
        self.0.array().map(u16::from_be_bytes)
    }

    fn u32(&mut self) -> Result<u32, VaaError> {
        self.0.array().map(u32::from_be_bytes)
    }

    fn u64(&mut self) -> Result<u64, VaaError> {
        self.0.array().map(u64::from_be_bytes)
    }

    fn array32(&mut self) -> Result<[u8; 32], VaaError> {
        self.0.array()
    }

    fn skip(&mut self, n: usize) -> Result<(), VaaError> {
        self.0.take(n).map(|_| ())
    }

    fn remaining(&self) -> usize {
        self.0.bytes.len().saturating_sub(self.0.pos)
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.0.bytes[self.0.pos..];
        self.0.pos = self.0.bytes.len();
        rest
    }
}

struct LeReader<'a>(Cursor<'a>);

impl<'a> LeReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self(Cursor { bytes, pos: 0 })
    }

    fn u8(&mut self) -> Result<u8, VaaError> {
        Ok(self.0.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, VaaError> {
        self.0.array().map(u16::from_le_bytes)
    }

    fn u32(&mut self) -> Result<u32, VaaError> {
        self.0.array().map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> Result<u64, VaaError> {
        self.0.array().map(u64::from_le_bytes)
    }

    fn array32(&mut self) -> Result<[u8; 32], VaaError> {
        self.0.array()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], VaaError> {
        self.0.take(n)
    }
}

/// Test fixtures shared with the extractor tests of the main crate.
#[cfg(any(test, feature = "test-utils"))]
pub mod fixtures {
    use crate::ChainId;

    /// Build a signed v1 VAA with `signatures` zeroed guardian signatures.
    pub fn signed_vaa(
        emitter_chain: ChainId,
        emitter_address: [u8; 32],
        sequence: u64,
        signatures: u8,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut out = vec![1u8];
        out.extend_from_slice(&3u32.to_be_bytes());
        out.push(signatures);
        for index in 0..signatures {
            let mut sig = [0u8; 66];
            sig[0] = index;
            out.extend_from_slice(&sig);
        }
        out.extend_from_slice(&1_700_000_000u32.to_be_bytes());
        out.extend_from_slice(&42u32.to_be_bytes());
        out.extend_from_slice(&emitter_chain.as_u16().to_be_bytes());
        out.extend_from_slice(&emitter_address);
        out.extend_from_slice(&sequence.to_be_bytes());
        out.push(15);
        out.extend_from_slice(payload);
        out
    }

    /// Build a Solana `PostVAA` instruction body.
    pub fn post_vaa_instruction(
        emitter_chain: ChainId,
        emitter_address: [u8; 32],
        sequence: u64,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut out = vec![super::POST_VAA_TAG, 1];
        out.extend_from_slice(&3u32.to_le_bytes());
        out.extend_from_slice(&1_700_000_000u32.to_le_bytes());
        out.extend_from_slice(&42u32.to_le_bytes());
        out.extend_from_slice(&emitter_chain.as_u16().to_le_bytes());
        out.extend_from_slice(&emitter_address);
        out.extend_from_slice(&sequence.to_le_bytes());
        out.push(1);
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
        out
    }
}

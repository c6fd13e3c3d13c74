//! Common utilities for the blockchain watcher
//!
//! Provides the Wormhole chain id registry, VAA (attestation) parsing with
//! message-id derivation, and the hex/address normalisation shared by every
//! chain extractor.

pub mod chain;
pub mod vaa;

pub use chain::ChainId;
pub use vaa::{MessageId, PostedVaa, Vaa, VaaError};

// ===== Hex conversions =====

/// Strip an optional `0x`/`0X` prefix.
pub fn strip_hex_prefix(value: &str) -> &str {
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value)
}

/// Decode a hex string (with or without `0x`) into bytes.
pub fn decode_hex(value: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(strip_hex_prefix(value))
}

/// Encode bytes as a lowercase `0x`-prefixed hex string.
pub fn encode_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Parse a `0x`-prefixed hex quantity (JSON-RPC style) into a u64.
///
/// Accepts `"0x0"`, rejects empty quantities and values wider than 64 bits.
pub fn parse_hex_u64(value: &str) -> Option<u64> {
    let digits = strip_hex_prefix(value);
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

// ===== Address normalisation =====

/// Normalise an EVM address to lowercase `0x` + 40 hex digits.
///
/// Returns `None` when the input is not a 20-byte hex address.
pub fn normalize_evm_address(address: &str) -> Option<String> {
    let digits = strip_hex_prefix(address.trim());
    if digits.len() != 40 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(format!("0x{}", digits.to_ascii_lowercase()))
}

/// Normalise an EVM method selector to lowercase `0x` + 8 hex digits.
pub fn normalize_selector(selector: &str) -> Option<String> {
    let digits = strip_hex_prefix(selector.trim());
    if digits.len() != 8 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(format!("0x{}", digits.to_ascii_lowercase()))
}

/// Normalise a Move (Aptos) account address.
///
/// Move addresses are 32 bytes but nodes print them with or without leading
/// zeros, so the canonical form drops them: `0x0001` and `0x1` compare equal.
pub fn normalize_move_address(address: &str) -> Option<String> {
    let digits = strip_hex_prefix(address.trim());
    if digits.is_empty() || digits.len() > 64 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let trimmed = digits.trim_start_matches('0');
    let trimmed = if trimmed.is_empty() { "0" } else { trimmed };
    Some(format!("0x{}", trimmed.to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_u64() {
        assert_eq!(parse_hex_u64("0x0"), Some(0));
        assert_eq!(parse_hex_u64("0x10"), Some(16));
        assert_eq!(parse_hex_u64("ff"), Some(255));
        assert_eq!(parse_hex_u64("0x"), None);
        assert_eq!(parse_hex_u64("0xzz"), None);
    }

    #[test]
    fn test_normalize_evm_address() {
        assert_eq!(
            normalize_evm_address("0x3ee18B2214AFF97000D974cf647E7C347E8fa585").as_deref(),
            Some("0x3ee18b2214aff97000d974cf647e7c347e8fa585")
        );
        assert!(normalize_evm_address("0x1234").is_none());
        assert!(normalize_evm_address("0xZZe18B2214AFF97000D974cf647E7C347E8fa585").is_none());
    }

    #[test]
    fn test_normalize_selector() {
        assert_eq!(normalize_selector("0xC6878519").as_deref(), Some("0xc6878519"));
        assert_eq!(normalize_selector("c6878519").as_deref(), Some("0xc6878519"));
        assert!(normalize_selector("0xc68785").is_none());
    }

    #[test]
    fn test_normalize_move_address() {
        assert_eq!(normalize_move_address("0x0001").as_deref(), Some("0x1"));
        assert_eq!(normalize_move_address("0x1").as_deref(), Some("0x1"));
        assert_eq!(normalize_move_address("0x000").as_deref(), Some("0x0"));
        assert!(normalize_move_address("").is_none());
    }

    #[test]
    fn test_hex_roundtrip_prefix() {
        assert_eq!(decode_hex("0x0102").unwrap(), vec![1, 2]);
        assert_eq!(encode_hex(&[1, 2]), "0x0102");
    }
}

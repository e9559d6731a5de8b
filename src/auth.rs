//! Address syntax checks for the two settlement rails
//!
//! - Custodial chain: `0x` followed by 40 hex digits
//! - Transfer service: SS58-encoded sr25519 account (base-58 with checksum)

use sp_core::crypto::Ss58Codec;
use sp_core::sr25519::Public;
use tracing::debug;

const HEX_ADDRESS_LEN: usize = 20;

/// Check if a string is a `0x`-prefixed 20-byte hex address
pub fn is_valid_hex_address(address: &str) -> bool {
    let Some(body) = address.strip_prefix("0x") else {
        return false;
    };
    if body.len() != HEX_ADDRESS_LEN * 2 {
        return false;
    }
    match hex::decode(body) {
        Ok(bytes) => bytes.len() == HEX_ADDRESS_LEN,
        Err(e) => {
            debug!("Failed to decode hex address {}: {}", address, e);
            false
        }
    }
}

/// The all-zero hex address burns funds and is never a valid recipient.
pub fn is_zero_hex_address(address: &str) -> bool {
    address
        .strip_prefix("0x")
        .map(|body| !body.is_empty() && body.chars().all(|c| c == '0'))
        .unwrap_or(false)
}

/// Check if a string is a valid SS58-encoded sr25519 public key
pub fn is_valid_ss58_address(address: &str) -> bool {
    if address.len() < 40 || address.len() > 60 {
        return false;
    }
    match Public::from_ss58check(address) {
        Ok(_) => true,
        Err(e) => {
            debug!("Failed to parse SS58 address {}: {:?}", address, e);
            false
        }
    }
}

/// Normalize a hex address to lowercase so principals compare consistently.
pub fn normalize_hex_address(address: &str) -> String {
    address.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_validation() {
        assert!(is_valid_hex_address(
            "0x00000000000000000000000000000000000000a1"
        ));
        assert!(is_valid_hex_address(
            "0xAbCdEf0123456789abcdef0123456789ABCDEF01"
        ));
        assert!(!is_valid_hex_address("00000000000000000000000000000000000000a1"));
        assert!(!is_valid_hex_address("0x1234"));
        assert!(!is_valid_hex_address(
            "0xzz000000000000000000000000000000000000a1"
        ));
        assert!(!is_valid_hex_address(""));
    }

    #[test]
    fn test_zero_address() {
        assert!(is_zero_hex_address(
            "0x0000000000000000000000000000000000000000"
        ));
        assert!(!is_zero_hex_address(
            "0x00000000000000000000000000000000000000a1"
        ));
    }

    #[test]
    fn test_ss58_validation() {
        assert!(is_valid_ss58_address(
            "5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQY"
        ));
        // Flipped last character breaks the checksum
        assert!(!is_valid_ss58_address(
            "5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQZ"
        ));
        assert!(!is_valid_ss58_address("not_a_valid_address"));
        assert!(!is_valid_ss58_address(""));
        assert!(!is_valid_ss58_address(
            "0x00000000000000000000000000000000000000a1"
        ));
    }
}

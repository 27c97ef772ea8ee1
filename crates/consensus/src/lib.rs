//! Consensus parameters, constants and the verification error taxonomy.

pub mod constants;
pub mod money;
pub mod params;
pub mod rewards;
pub mod verify;

/// A 256-bit hash, little-endian internally. The reversed form is only
/// used for display.
pub type Hash256 = [u8; 32];

pub use params::{chain_params, Bip9Deployment, ChainParams, Checkpoint, ConsensusParams, Network};
pub use rewards::block_subsidy;
pub use verify::{ErrorKind, VerifyError};

pub fn hash256_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

pub fn hash256_from_hex(hex: &str) -> Option<Hash256> {
    if hex.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    let bytes = hex.as_bytes();
    for i in 0..32 {
        let high = (bytes[i * 2] as char).to_digit(16)? as u8;
        let low = (bytes[i * 2 + 1] as char).to_digit(16)? as u8;
        // Display order is reversed relative to the internal layout.
        out[31 - i] = high << 4 | low;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip_reverses_byte_order() {
        let hex = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";
        let hash = hash256_from_hex(hex).expect("valid hex");
        assert_eq!(hash[31], 0x00);
        assert_eq!(hash[0], 0x6f);
        assert_eq!(hash256_to_hex(&hash), hex);
    }
}

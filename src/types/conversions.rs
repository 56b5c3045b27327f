use ethers::types::{Address, H256};
use std::str::FromStr;

// Registry keys and log lines use the lowercase hex form; inbound logs carry
// lowercase addresses while config and API callers may pass checksummed ones.
pub fn address_to_string(addr: Address) -> String {
    format!("{:?}", addr).to_lowercase()
}

pub fn string_to_address(s: &str) -> Result<Address, ConversionError> {
    Address::from_str(s.trim()).map_err(|e| ConversionError::InvalidAddress(format!("{s}: {e}")))
}

pub fn string_to_h256(s: &str) -> Result<H256, ConversionError> {
    let normalized = s.trim().trim_start_matches("0x");
    let bytes = hex::decode(normalized)
        .map_err(|e| ConversionError::InvalidHash(format!("{s}: {e}")))?;
    if bytes.len() != 32 {
        return Err(ConversionError::InvalidHash(format!(
            "expected 32 bytes, got {} (value: {s})",
            bytes.len()
        )));
    }
    Ok(H256::from_slice(&bytes))
}

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Invalid hash: {0}")]
    InvalidHash(String),
}

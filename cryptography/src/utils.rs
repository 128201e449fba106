//! Helpers shared across schemes.

/// Converts bytes to a lowercase hexadecimal string.
pub fn hex(bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in bytes.iter() {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}

/// Converts a hexadecimal string to bytes.
pub fn from_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

/// Prefixes `message` with a length-delimited `namespace` so that a signature produced in
/// one context cannot be replayed in another.
pub fn union_unique(namespace: &[u8], message: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8 + namespace.len() + message.len());
    payload.extend_from_slice(&(namespace.len() as u64).to_be_bytes());
    payload.extend_from_slice(namespace);
    payload.extend_from_slice(message);
    payload
}

//! Per-VM MAC address derivation.
//!
//! Using `52:54:00:` as the vendor prefix keeps derived addresses out of the
//! range used by the coexisting foreign VM manager on the same host, and
//! makes each VM identifiable in the proxy's lease table by name alone.

use sha2::{Digest, Sha256};

const PREFIX: [u8; 3] = [0x52, 0x54, 0x00];

/// Derive a stable MAC address for a VM name: `52:54:00:` followed by the
/// first three bytes of `SHA-256(name)`.
pub fn derive_mac(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        PREFIX[0], PREFIX[1], PREFIX[2], digest[0], digest[1], digest[2]
    )
}

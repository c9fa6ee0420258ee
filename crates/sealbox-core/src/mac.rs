//! Document integrity hash.
//!
//! Both walks feed every cleartext leaf's canonical bytes into a
//! running SHA-512. The digest is rendered upper-case hex, sealed with
//! the data key under the last-modified timestamp as AAD, and stored in
//! the metadata envelope. Comparison happens on the decoded digest
//! bytes in constant time.

use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;

/// Accumulates leaf bytes in visit order.
#[derive(Default)]
pub struct MacBuilder {
    hasher: Sha512,
}

impl MacBuilder {
    pub fn new() -> Self {
        MacBuilder::default()
    }

    pub fn add(&mut self, leaf_bytes: &[u8]) {
        self.hasher.update(leaf_bytes);
    }

    /// Upper-case hexadecimal rendering of the final digest.
    pub fn finish(self) -> String {
        hex::encode_upper(self.hasher.finalize())
    }
}

/// Constant-time comparison of two hex digests. Digests that do not
/// decode, or decode to different lengths, compare unequal.
pub fn mac_equal(a: &str, b: &str) -> bool {
    let (a, b) = match (hex::decode(a), hex::decode(b)) {
        (Ok(a), Ok(b)) => (a, b),
        _ => return false,
    };
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(&b).into()
}

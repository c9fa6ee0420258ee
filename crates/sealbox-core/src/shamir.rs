//! Shamir secret sharing over GF(2^8), applied bytewise.
//!
//! When a document sets a quorum threshold, the data key is split into
//! one share per key group. Group *i* (document order, 0-indexed)
//! always holds the share at x-coordinate *i + 1*, so documents written
//! here are recoverable by any implementation following the same
//! convention. Field arithmetic is branchless; secret-dependent values
//! never select a branch or an index.

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// One recovered share: the x-coordinate and the share bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Share {
    pub x: u8,
    pub data: Vec<u8>,
}

impl Drop for Share {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

/// Splits `secret` into `count` shares, any `threshold` of which
/// reconstruct it. Share *i* is the evaluation at x = i + 1.
pub fn split(secret: &[u8], count: usize, threshold: usize) -> Result<Vec<Share>> {
    if threshold == 0 || threshold > count || count > 255 {
        return Err(Error::MalformedMetadata(format!(
            "cannot split into {count} shares with threshold {threshold}"
        )));
    }

    let mut shares: Vec<Share> = (1..=count as u8)
        .map(|x| Share {
            x,
            data: Vec::with_capacity(secret.len()),
        })
        .collect();

    let mut coefficients = vec![0u8; threshold];
    for &byte in secret {
        // Random polynomial of degree threshold-1 with the secret as
        // the constant term.
        coefficients[0] = byte;
        OsRng
            .try_fill_bytes(&mut coefficients[1..])
            .map_err(|e| Error::Rng(e.to_string()))?;
        for share in shares.iter_mut() {
            share.data.push(eval(&coefficients, share.x));
        }
    }
    coefficients.zeroize();

    Ok(shares)
}

/// Reconstructs the secret from shares via Lagrange interpolation at
/// x = 0. Shares must have distinct x-coordinates and equal lengths.
pub fn combine(shares: &[Share]) -> Result<Vec<u8>> {
    let first = shares.first().ok_or(Error::InsufficientShares {
        needed: 1,
        got: 0,
        attempts: Vec::new(),
    })?;
    let len = first.data.len();
    for (i, a) in shares.iter().enumerate() {
        if a.data.len() != len {
            return Err(Error::MalformedMetadata(
                "group shares have differing lengths".into(),
            ));
        }
        if shares[i + 1..].iter().any(|b| b.x == a.x) {
            return Err(Error::MalformedMetadata(
                "duplicate share x-coordinate".into(),
            ));
        }
    }

    let mut secret = vec![0u8; len];
    for (position, byte) in secret.iter_mut().enumerate() {
        let mut acc = 0u8;
        for share in shares {
            let mut basis = 1u8;
            for other in shares {
                if other.x == share.x {
                    continue;
                }
                basis = mul(basis, div(other.x, other.x ^ share.x));
            }
            acc ^= mul(basis, share.data[position]);
        }
        *byte = acc;
    }
    Ok(secret)
}

/// Horner evaluation of the polynomial at x.
fn eval(coefficients: &[u8], x: u8) -> u8 {
    let mut acc = 0u8;
    for &c in coefficients.iter().rev() {
        acc = mul(acc, x) ^ c;
    }
    acc
}

/// Carry-less multiplication in GF(2^8) mod x^8 + x^4 + x^3 + x + 1,
/// with no data-dependent branches.
fn mul(mut a: u8, mut b: u8) -> u8 {
    let mut product = 0u8;
    for _ in 0..8 {
        product ^= a & (b & 1).wrapping_neg();
        let carry = (a >> 7) & 1;
        a = (a << 1) ^ (0x1b & carry.wrapping_neg());
        b >>= 1;
    }
    product
}

/// Inversion as a^254, a fixed multiplication chain.
fn inv(a: u8) -> u8 {
    let a2 = mul(a, a);
    let a3 = mul(a2, a);
    let a6 = mul(a3, a3);
    let a12 = mul(a6, a6);
    let a14 = mul(a12, a2);
    let a15 = mul(a12, a3);
    let a30 = mul(a15, a15);
    let a60 = mul(a30, a30);
    let a120 = mul(a60, a60);
    let a240 = mul(a120, a120);
    mul(a240, a14)
}

fn div(a: u8, b: u8) -> u8 {
    mul(a, inv(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_axioms_hold() {
        assert_eq!(mul(0, 0x53), 0);
        assert_eq!(mul(1, 0x53), 0x53);
        // Classic AES test vector: 0x53 * 0xCA = 0x01.
        assert_eq!(mul(0x53, 0xca), 0x01);
        for a in 1..=255u8 {
            assert_eq!(mul(a, inv(a)), 1, "inverse of {a}");
        }
    }

    #[test]
    fn any_quorum_reconstructs() {
        let secret = b"0123456789abcdef0123456789abcdef";
        let shares = split(secret, 5, 3).unwrap();

        for selection in [[0usize, 1, 2], [0, 2, 4], [1, 3, 4]] {
            let picked: Vec<Share> = selection.iter().map(|&i| shares[i].clone()).collect();
            assert_eq!(combine(&picked).unwrap(), secret);
        }
    }

    #[test]
    fn below_quorum_yields_garbage() {
        let secret = b"0123456789abcdef0123456789abcdef";
        let shares = split(secret, 3, 2).unwrap();
        let one = vec![shares[1].clone()];
        assert_ne!(combine(&one).unwrap(), secret);
    }

    #[test]
    fn threshold_one_shares_equal_secret() {
        let secret = b"k";
        let shares = split(secret, 3, 1).unwrap();
        for share in &shares {
            assert_eq!(combine(std::slice::from_ref(share)).unwrap(), secret);
        }
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        assert!(split(b"s", 2, 3).is_err());
        assert!(split(b"s", 2, 0).is_err());
    }

    #[test]
    fn x_coordinates_start_at_one() {
        let shares = split(b"s", 4, 2).unwrap();
        let xs: Vec<u8> = shares.iter().map(|s| s.x).collect();
        assert_eq!(xs, vec![1, 2, 3, 4]);
    }
}

use std::fmt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One failed attempt at wrapping or unwrapping the data key with a
/// particular master key. Collected so an operator can see every
/// custodian that was tried, not just the last one.
#[derive(Debug, Clone)]
pub struct KeyAttempt {
    pub variant: &'static str,
    pub identifier: String,
    pub error: String,
}

impl fmt::Display for KeyAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.variant, self.identifier, self.error)
    }
}

fn render_attempts(attempts: &[KeyAttempt]) -> String {
    attempts
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The input does not match the ENC value grammar.
    #[error("input string {0:?} does not match the encrypted value format")]
    BadFormat(String),

    #[error("invalid base64 in encrypted value: {0}")]
    BadBase64(#[from] base64::DecodeError),

    #[error("unknown type tag {0:?} in encrypted value")]
    UnknownType(String),

    #[error("cannot encrypt value of unsupported type {0}")]
    UnsupportedType(&'static str),

    #[error("malformed document metadata: {0}")]
    MalformedMetadata(String),

    /// Wrong key, corrupted ciphertext and wrong AAD are deliberately
    /// indistinguishable on the wire.
    #[error("authentication failed")]
    AeadVerifyFailed,

    #[error("random generator failure: {0}")]
    Rng(String),

    #[error("data key must be 32 bytes, got {0}")]
    UnsupportedKeySize(usize),

    /// A single master-key operation failed. Carries variant and
    /// identifier so the failure can be diagnosed without exposing any
    /// key material.
    #[error("{variant} {identifier}: {message}")]
    MasterKey {
        variant: &'static str,
        identifier: String,
        message: String,
    },

    #[error("could not recover the data key with any master key: {}", render_attempts(.attempts))]
    KeyRecovery { attempts: Vec<KeyAttempt> },

    #[error("could not wrap the data key for every master key: {}", render_attempts(.attempts))]
    KeyWrap { attempts: Vec<KeyAttempt> },

    #[error(
        "recovered {got} of {needed} required group shares: {}", render_attempts(.attempts)
    )]
    InsufficientShares {
        needed: usize,
        got: usize,
        attempts: Vec<KeyAttempt>,
    },

    #[error("no master keys configured in metadata")]
    NoKeysConfigured,

    #[error("at most one encryption selection rule may be configured")]
    PolicyConflict,

    #[error("computed MAC does not match the document MAC")]
    MacMismatch,

    #[error("operation cancelled")]
    Cancelled,

    #[error("store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn master_key(
        variant: &'static str,
        identifier: impl Into<String>,
        message: impl fmt::Display,
    ) -> Self {
        Error::MasterKey {
            variant,
            identifier: identifier.into(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovery_error_lists_every_attempt() {
        let err = Error::KeyRecovery {
            attempts: vec![
                KeyAttempt {
                    variant: "kms",
                    identifier: "arn:aws:kms:us-east-1:123456789012:key/abc".into(),
                    error: "access denied".into(),
                },
                KeyAttempt {
                    variant: "age",
                    identifier: "age1example".into(),
                    error: "no identity matched".into(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("access denied"));
        assert!(msg.contains("age1example"));
    }

    #[test]
    fn aead_failure_is_opaque() {
        assert_eq!(Error::AeadVerifyFailed.to_string(), "authentication failed");
    }
}

//! Field-level encryption seam.

use crate::error::Result;

/// Encrypts individual string fields before they reach a store.
///
/// Implementations wrap whatever key management the deployment uses; the
/// crate itself only ships the pass-through [`PlaintextCipher`].
pub trait FieldCipher: Send + Sync {
    /// Encrypt one field
    fn encrypt(&self, plaintext: &str) -> Result<String>;

    /// Reverse [`FieldCipher::encrypt`]
    fn decrypt(&self, ciphertext: &str) -> Result<String>;

    /// Whether this cipher leaves data readable (no encryption at all)
    fn is_plaintext(&self) -> bool {
        false
    }
}

/// Pass-through cipher; snapshots are written in the clear
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextCipher;

impl FieldCipher for PlaintextCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        Ok(plaintext.to_string())
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        Ok(ciphertext.to_string())
    }

    fn is_plaintext(&self) -> bool {
        true
    }
}

//! Key records
//!
//! A [`Key`] is immutable once generated. Its material is zeroized on drop
//! and never appears in `Debug` output; use [`Key::preview`] for diagnostics.

use std::fmt;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{KmeError, KmeResult};
use crate::identity::KeyId;

/// Number of leading bytes shown by [`Key::preview`]
const PREVIEW_BYTES: usize = 4;

/// Raw key bytes, wiped when dropped
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial(Vec<u8>);

impl KeyMaterial {
    /// Wrap existing bytes
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Fill `len` bytes from the thread-local CSPRNG
    pub fn random(len: usize) -> Self {
        let mut bytes = vec![0u8; len];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Borrow the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the material is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial({} bytes)", self.0.len())
    }
}

/// A single key record
#[derive(Clone, PartialEq, Eq)]
pub struct Key {
    key_id: KeyId,
    material: KeyMaterial,
    size_bits: usize,
}

impl Key {
    /// Generate a key with fresh random material and a fresh ID
    pub fn generate(size_bits: usize) -> KmeResult<Self> {
        validate_size(size_bits)?;
        Ok(Self {
            key_id: KeyId::generate(),
            material: KeyMaterial::random(size_bits / 8),
            size_bits,
        })
    }

    /// Rebuild a key received from a peer
    ///
    /// The size is derived from the material so the two cannot disagree.
    pub fn from_parts(key_id: KeyId, material: Vec<u8>) -> KmeResult<Self> {
        let size_bits = material.len() * 8;
        validate_size(size_bits)?;
        Ok(Self {
            key_id,
            material: KeyMaterial::from_bytes(material),
            size_bits,
        })
    }

    /// Decode a key whose material arrives base64-encoded
    pub fn from_base64(key_id: KeyId, material_b64: &str) -> KmeResult<Self> {
        let bytes = STANDARD
            .decode(material_b64.trim())
            .map_err(|e| KmeError::invalid(format!("key {key_id} is not valid base64: {e}")))?;
        Self::from_parts(key_id, bytes)
    }

    /// The key's identifier
    pub fn key_id(&self) -> &KeyId {
        &self.key_id
    }

    /// The key's raw material
    pub fn material(&self) -> &KeyMaterial {
        &self.material
    }

    /// Key size in bits
    pub fn size_bits(&self) -> usize {
        self.size_bits
    }

    /// Material encoded as standard base64
    pub fn material_base64(&self) -> String {
        STANDARD.encode(self.material.as_bytes())
    }

    /// Truncated hex preview of the material, safe to log
    pub fn preview(&self) -> String {
        let shown = self.material.len().min(PREVIEW_BYTES);
        format!("{}…", hex::encode(&self.material.as_bytes()[..shown]))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("key_id", &self.key_id)
            .field("size_bits", &self.size_bits)
            .finish_non_exhaustive()
    }
}

/// Check that a key size is positive and byte aligned
pub fn validate_size(size_bits: usize) -> KmeResult<()> {
    if size_bits == 0 || size_bits % 8 != 0 {
        return Err(KmeError::InvalidKeySize(size_bits));
    }
    Ok(())
}

use std::fmt;

use crate::{CoreError, StorageMode};

/// BLAKE3 digest of an object's serialized state.
///
/// Used for integrity checks and debugging only; two revisions with equal
/// fingerprints are still stored separately.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CoreError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CoreError::InvalidData(format!("fingerprint of {} bytes", bytes.len())))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn verify(&self, data: &[u8]) -> bool {
        *self == Self::of(data)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({:02x}{:02x}...)", self.0[0], self.0[1])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Chooses whether staged states get a fingerprint.
///
/// History-free databases detect conflicts purely by tid and have no
/// fingerprint column, so they use `Disabled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fingerprinter {
    Blake3,
    Disabled,
}

impl Fingerprinter {
    pub fn for_mode(mode: StorageMode) -> Self {
        match mode {
            StorageMode::HistoryPreserving => Self::Blake3,
            StorageMode::HistoryFree => Self::Disabled,
        }
    }

    /// `None` for a missing state (undone creation) or when disabled.
    pub fn compute(&self, state: Option<&[u8]>) -> Option<Fingerprint> {
        match (self, state) {
            (Self::Blake3, Some(data)) => Some(Fingerprint::of(data)),
            _ => None,
        }
    }
}

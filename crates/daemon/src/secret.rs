//! Unlock key material

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use zeroize::Zeroizing;

/// Key used when no key file is configured
pub const DEFAULT_KEY: &[u8] = b"THIS IS KEY";

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("failed to read key file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("key material is empty")]
    Empty,

    #[error("key material contains a NUL byte")]
    ContainsNul,
}

/// Opaque key bytes, zeroed on drop and never printed
///
/// Shared by reference (`Arc`) with every binding; the bytes are never copied
/// out except into the helper's argument vector.
#[derive(Clone)]
pub struct SecretMaterial {
    bytes: Arc<Zeroizing<Vec<u8>>>,
}

impl SecretMaterial {
    pub fn new(bytes: Vec<u8>) -> Result<Self, SecretError> {
        let bytes = Zeroizing::new(bytes);
        if bytes.is_empty() {
            return Err(SecretError::Empty);
        }
        if bytes.contains(&0) {
            return Err(SecretError::ContainsNul);
        }
        Ok(Self {
            bytes: Arc::new(bytes),
        })
    }

    /// The built-in fallback key
    pub fn builtin() -> Self {
        Self {
            bytes: Arc::new(Zeroizing::new(DEFAULT_KEY.to_vec())),
        }
    }

    /// Read a key file, dropping one trailing newline
    pub fn from_file(path: &Path) -> Result<Self, SecretError> {
        let mut bytes = Zeroizing::new(fs::read(path).map_err(|source| SecretError::Read {
            path: path.display().to_string(),
            source,
        })?);
        if bytes.last() == Some(&b'\n') {
            bytes.pop();
            if bytes.last() == Some(&b'\r') {
                bytes.pop();
            }
        }
        Self::new(std::mem::take(&mut *bytes))
    }

    pub(crate) fn expose(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether two handles refer to the same allocation
    pub fn same_material(&self, other: &SecretMaterial) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }
}

impl fmt::Debug for SecretMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretMaterial(<redacted>, {} bytes)", self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretMaterial::new(b"hunter2".to_vec()).unwrap();
        let shown = format!("{:?}", secret);
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("7 bytes"));
    }

    #[test]
    fn test_rejects_empty_and_nul() {
        assert!(matches!(SecretMaterial::new(Vec::new()), Err(SecretError::Empty)));
        assert!(matches!(
            SecretMaterial::new(b"a\0b".to_vec()),
            Err(SecretError::ContainsNul)
        ));
    }

    #[test]
    fn test_from_file_trims_newline() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"s3cret\n").unwrap();
        let secret = SecretMaterial::from_file(file.path()).unwrap();
        assert_eq!(secret.expose(), b"s3cret");
    }

    #[test]
    fn test_from_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let result = SecretMaterial::from_file(&dir.path().join("absent"));
        assert!(matches!(result, Err(SecretError::Read { .. })));
    }

    #[test]
    fn test_clone_shares_material() {
        let a = SecretMaterial::builtin();
        let b = a.clone();
        assert!(a.same_material(&b));
        assert!(!a.same_material(&SecretMaterial::builtin()));
    }
}

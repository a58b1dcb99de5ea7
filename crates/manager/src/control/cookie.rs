//! Control-port authentication cookie.

use std::fmt;
use std::path::Path;

use crate::error::{ManagerError, Result};

/// Raw bytes of the daemon's authentication cookie.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthCookie(Vec<u8>);

impl AuthCookie {
    /// Wraps cookie bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Reads the cookie file. An absent, unreadable or empty file is
    /// reported as [`ManagerError::MissingCookie`].
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) if !bytes.is_empty() => Ok(Self(bytes)),
            Ok(_) => {
                tracing::debug!(path = %path.display(), "Cookie file is empty");
                Err(ManagerError::MissingCookie {
                    path: path.to_path_buf(),
                })
            }
            Err(e) => {
                tracing::debug!(path = %path.display(), "Cannot read cookie file: {}", e);
                Err(ManagerError::MissingCookie {
                    path: path.to_path_buf(),
                })
            }
        }
    }

    /// The cookie bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consumes the cookie, returning its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for AuthCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthCookie({} bytes)", self.0.len())
    }
}

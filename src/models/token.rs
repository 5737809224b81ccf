// src/models/token.rs

//! Run-scoped secrets: operator credentials and the bearer token.

use std::fmt;

use zeroize::Zeroize;

/// Operator credentials for the portal login.
///
/// The secret's buffer is wiped when the value is dropped and never printed.
/// Copies made elsewhere (argument parsing, the driver request body) are
/// outside its reach.
pub struct Credentials {
    identifier: String,
    secret: String,
}

impl Credentials {
    pub fn new(identifier: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            secret: secret.into(),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Overwrite the secret's buffer with zeros and empty it.
    fn wipe(&mut self) {
        self.secret.zeroize();
    }

    /// Whether both fields were filled in.
    pub fn is_complete(&self) -> bool {
        !self.identifier.trim().is_empty() && !self.secret.is_empty()
    }
}

impl Drop for Credentials {
    fn drop(&mut self) {
        self.wipe();
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("identifier", &self.identifier)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Opaque bearer credential, valid for one run and never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken(String);

impl BearerToken {
    /// Sanitize a raw value read from client storage.
    ///
    /// Strips whitespace and enclosing quote characters; returns `None`
    /// when nothing is left.
    pub fn sanitize(raw: &str) -> Option<Self> {
        let token = raw.trim().trim_matches(|c| c == '"' || c == '\'').trim();
        if token.is_empty() {
            None
        } else {
            Some(Self(token.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BearerToken(<{} chars>)", self.0.len())
    }
}

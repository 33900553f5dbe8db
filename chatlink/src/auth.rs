//! Credential access for the synchronization engine.
//!
//! The engine never issues or refreshes tokens. It reads the current
//! bearer token through [`CredentialProvider`] at connection-open and
//! history-fetch time and surfaces `Unauthenticated` notices when the
//! token is absent; rotation is the authentication collaborator's job.

use parking_lot::RwLock;

/// Read-only view of the current access credential.
pub trait CredentialProvider: Send + Sync {
    /// Returns the current bearer token, or `None` when logged out.
    fn access_token(&self) -> Option<String>;
}

/// Credential slot owned by the surrounding application.
///
/// The auth collaborator calls [`set`](Self::set) after login or token
/// refresh and [`clear`](Self::clear) on logout; the engine only reads.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    token: RwLock<Option<String>>,
}

impl StaticCredentials {
    /// Creates an empty (logged-out) credential slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a slot holding the given token.
    #[must_use]
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }

    /// Replaces the stored token.
    pub fn set(&self, token: impl Into<String>) {
        *self.token.write() = Some(token.into());
    }

    /// Clears the stored token (logout).
    pub fn clear(&self) {
        *self.token.write() = None;
    }
}

impl CredentialProvider for StaticCredentials {
    fn access_token(&self) -> Option<String> {
        self.token.read().clone()
    }
}

impl<P: CredentialProvider> CredentialProvider for std::sync::Arc<P> {
    fn access_token(&self) -> Option<String> {
        self.as_ref().access_token()
    }
}

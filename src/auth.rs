use std::collections::HashMap;
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64, Engine as _};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::room::UserId;

/// Identity collaborator: maps a presented credential to an authenticated
/// user. `None` means anonymous.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Option<UserId>;
}

/// Bearer tokens held only as SHA-256 digests.
#[derive(Default)]
pub struct TokenAuthenticator {
    digests: RwLock<HashMap<String, UserId>>,
}

impl TokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    fn digest(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        BASE64.encode(hasher.finalize())
    }

    /// Issues a fresh random token for `user`.
    pub async fn issue(&self, user: UserId) -> String {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let token = BASE64.encode(bytes);
        self.digests.write().await.insert(Self::digest(&token), user);
        token
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Option<UserId> {
        let token = token.trim();
        if token.is_empty() {
            return None;
        }
        self.digests.read().await.get(&Self::digest(token)).copied()
    }
}

/// Extracts the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
}

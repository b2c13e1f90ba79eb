//! Auth token storage.
//!
//! Several storage backends can hold the token. They are ranked by the
//! caller and the first available one is chosen once, when the
//! `TokenStore` is built.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use tracing::{debug, info, warn};

use crate::local_store::KeyValueStore;

pub const TOKEN_KEY: &str = "auth_token";

pub trait CredentialProvider: Send + Sync {
    fn name(&self) -> &str;
    fn is_available(&self) -> bool;
    fn get(&self) -> Result<Option<String>>;
    fn set(&self, token: &str) -> Result<()>;
    fn remove(&self) -> Result<()>;
}

/// Keeps the token in a `KeyValueStore`, typically the on-device database.
pub struct StoreCredentialProvider {
    name: String,
    store: Arc<dyn KeyValueStore>,
}

impl StoreCredentialProvider {
    pub fn new(name: impl Into<String>, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            name: name.into(),
            store,
        }
    }
}

impl CredentialProvider for StoreCredentialProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        self.store.get(TOKEN_KEY).is_ok()
    }

    fn get(&self) -> Result<Option<String>> {
        self.store.get(TOKEN_KEY)
    }

    fn set(&self, token: &str) -> Result<()> {
        self.store.set(TOKEN_KEY, token)
    }

    fn remove(&self) -> Result<()> {
        self.store.remove(TOKEN_KEY)
    }
}

/// Volatile last resort.
#[derive(Debug, Default)]
pub struct MemoryCredentialProvider {
    token: Mutex<Option<String>>,
}

impl MemoryCredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialProvider for MemoryCredentialProvider {
    fn name(&self) -> &str {
        "memory"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn get(&self) -> Result<Option<String>> {
        let token = self
            .token
            .lock()
            .map_err(|_| anyhow!("credential lock poisoned"))?;
        Ok(token.clone())
    }

    fn set(&self, token: &str) -> Result<()> {
        let mut slot = self
            .token
            .lock()
            .map_err(|_| anyhow!("credential lock poisoned"))?;
        *slot = Some(token.to_string());
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        let mut slot = self
            .token
            .lock()
            .map_err(|_| anyhow!("credential lock poisoned"))?;
        *slot = None;
        Ok(())
    }
}

/// The selected credential provider.
pub struct TokenStore {
    provider: Box<dyn CredentialProvider>,
}

impl TokenStore {
    /// Chooses the first available provider in rank order. Falls back to
    /// memory when none is available.
    pub fn select(providers: Vec<Box<dyn CredentialProvider>>) -> Self {
        for provider in providers {
            if provider.is_available() {
                info!("Using credential provider: {}", provider.name());
                return Self { provider };
            }
            debug!("Credential provider {} unavailable", provider.name());
        }

        warn!("No credential provider available, token will not survive a restart");
        Self {
            provider: Box::new(MemoryCredentialProvider::new()),
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Non-empty token, if any. Read errors count as no token.
    pub fn get(&self) -> Option<String> {
        match self.provider.get() {
            Ok(token) => token.filter(|t| !t.is_empty()),
            Err(e) => {
                warn!("Failed to read token from {}: {}", self.provider.name(), e);
                None
            }
        }
    }

    pub fn set(&self, token: &str) -> Result<()> {
        self.provider.set(token)
    }

    pub fn remove(&self) -> Result<()> {
        self.provider.remove()
    }

    /// Value for the `Authorization` header when a token is present.
    pub fn bearer(&self) -> Option<String> {
        self.get().map(|token| format!("Bearer {}", token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_store::MemoryStore;

    struct Unavailable;

    impl CredentialProvider for Unavailable {
        fn name(&self) -> &str {
            "secure-storage"
        }
        fn is_available(&self) -> bool {
            false
        }
        fn get(&self) -> Result<Option<String>> {
            Err(anyhow!("not installed"))
        }
        fn set(&self, _token: &str) -> Result<()> {
            Err(anyhow!("not installed"))
        }
        fn remove(&self) -> Result<()> {
            Err(anyhow!("not installed"))
        }
    }

    #[test]
    fn test_first_available_provider_wins() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let tokens = TokenStore::select(vec![
            Box::new(Unavailable),
            Box::new(StoreCredentialProvider::new("preferences", store.clone())),
            Box::new(MemoryCredentialProvider::new()),
        ]);
        assert_eq!(tokens.provider_name(), "preferences");

        tokens.set("abc").unwrap();
        assert_eq!(store.get(TOKEN_KEY).unwrap().as_deref(), Some("abc"));
        assert_eq!(tokens.bearer().as_deref(), Some("Bearer abc"));

        tokens.remove().unwrap();
        assert_eq!(tokens.get(), None);
    }

    #[test]
    fn test_falls_back_to_memory_when_nothing_is_available() {
        let tokens = TokenStore::select(vec![Box::new(Unavailable)]);
        assert_eq!(tokens.provider_name(), "memory");
    }

    #[test]
    fn test_empty_token_means_no_bearer() {
        let tokens = TokenStore::select(vec![Box::new(MemoryCredentialProvider::new())]);
        tokens.set("").unwrap();
        assert_eq!(tokens.bearer(), None);
    }
}

//! Account registration, login and the token check used to guard screens.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info, warn};

use crate::client::{CreateUsuario, LoginRequest, RemoteGateway, UsuarioApi};
use crate::credentials::TokenStore;

pub struct AuthService {
    gateway: Arc<dyn RemoteGateway>,
    tokens: Arc<TokenStore>,
}

impl AuthService {
    pub fn new(gateway: Arc<dyn RemoteGateway>, tokens: Arc<TokenStore>) -> Self {
        Self { gateway, tokens }
    }

    pub async fn register(&self, nome: &str, email: &str, senha: &str) -> Result<UsuarioApi> {
        let user = self
            .gateway
            .register_user(&CreateUsuario {
                nome: nome.to_string(),
                email: email.to_string(),
                senha: senha.to_string(),
            })
            .await
            .context("Failed to register user")?;
        info!("Registered user {} ({})", user.id, user.email);
        Ok(user)
    }

    /// Logs in and stores the returned token with the selected provider.
    pub async fn login(&self, email: &str, senha: &str) -> Result<()> {
        let response = self
            .gateway
            .login(&LoginRequest {
                email: email.to_string(),
                senha: senha.to_string(),
            })
            .await
            .context("Login failed")?;
        if response.token.is_empty() {
            return Err(anyhow!("Backend returned an empty token"));
        }
        self.tokens.set(&response.token)?;
        info!("Logged in as {}", email);
        Ok(())
    }

    /// False without a token; otherwise the backend decides. Any failure to
    /// verify counts as not authenticated.
    pub async fn is_authenticated(&self) -> bool {
        let Some(token) = self.tokens.get() else {
            debug!("No stored token");
            return false;
        };
        match self.gateway.verify_token(&token).await {
            Ok(()) => true,
            Err(e) => {
                match e.status_code() {
                    Some(401) | Some(403) => debug!("Stored token rejected by backend"),
                    _ => debug!("Token verification failed: {}", e),
                }
                false
            }
        }
    }

    pub fn logout(&self) -> Result<()> {
        if let Err(e) = self.tokens.remove() {
            warn!("Failed to remove token from {}: {}", self.tokens.provider_name(), e);
            return Err(e);
        }
        info!("Logged out");
        Ok(())
    }
}

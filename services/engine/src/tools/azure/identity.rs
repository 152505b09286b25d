//! Azure identity
//!
//! Entra ID access tokens for Resource Manager and Storage, from a static
//! token, a client secret, or a federated workload identity token. Tokens
//! are cached per scope until shortly before they expire.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::info;

use crate::agents::asset_scan::errors::ProviderError;

/// Refresh tokens this long before they expire
const REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// Resource a token is requested for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenScope {
    Management,
    Storage,
}

impl TokenScope {
    fn scope(&self) -> &'static str {
        match self {
            TokenScope::Management => "https://management.azure.com/.default",
            TokenScope::Storage => "https://storage.azure.com/.default",
        }
    }
}

impl std::fmt::Display for TokenScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenScope::Management => write!(f, "management"),
            TokenScope::Storage => write!(f, "storage"),
        }
    }
}

/// How tokens are obtained
#[derive(Clone)]
pub enum AzureCredential {
    /// Pre-issued bearer token, used for every scope
    Static(String),
    ClientSecret {
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
    /// Federated token file projected by the workload identity webhook
    WorkloadIdentity {
        tenant_id: String,
        client_id: String,
        token_file: String,
    },
}

impl std::fmt::Debug for AzureCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AzureCredential::Static(_) => write!(f, "Static(<redacted>)"),
            AzureCredential::ClientSecret { client_id, .. } => {
                write!(f, "ClientSecret {{ client_id: {} }}", client_id)
            }
            AzureCredential::WorkloadIdentity {
                client_id,
                token_file,
                ..
            } => write!(
                f,
                "WorkloadIdentity {{ client_id: {}, token_file: {} }}",
                client_id, token_file
            ),
        }
    }
}

impl AzureCredential {
    /// Pick a credential from the environment.
    ///
    /// `AZURE_ACCESS_TOKEN` wins; otherwise `AZURE_TENANT_ID` and
    /// `AZURE_CLIENT_ID` with either `AZURE_CLIENT_SECRET` or
    /// `AZURE_FEDERATED_TOKEN_FILE`.
    pub fn from_env() -> Result<Self> {
        if let Ok(token) = env::var("AZURE_ACCESS_TOKEN") {
            return Ok(AzureCredential::Static(token));
        }

        let tenant_id = env::var("AZURE_TENANT_ID")
            .context("AZURE_TENANT_ID not configured (or set AZURE_ACCESS_TOKEN)")?;
        let client_id = env::var("AZURE_CLIENT_ID").context("AZURE_CLIENT_ID not configured")?;

        if let Ok(client_secret) = env::var("AZURE_CLIENT_SECRET") {
            return Ok(AzureCredential::ClientSecret {
                tenant_id,
                client_id,
                client_secret,
            });
        }

        let token_file = env::var("AZURE_FEDERATED_TOKEN_FILE")
            .context("Neither AZURE_CLIENT_SECRET nor AZURE_FEDERATED_TOKEN_FILE is set")?;

        Ok(AzureCredential::WorkloadIdentity {
            tenant_id,
            client_id,
            token_file,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        self.expires_at
            .checked_duration_since(Instant::now())
            .map(|left| left > REFRESH_MARGIN)
            .unwrap_or(false)
    }
}

/// Token source shared by every Azure client
pub struct AzureIdentity {
    http_client: reqwest::Client,
    credential: AzureCredential,
    authority: String,
    cache: Mutex<HashMap<TokenScope, CachedToken>>,
}

impl AzureIdentity {
    pub fn new(http_client: reqwest::Client, credential: AzureCredential) -> Self {
        Self {
            http_client,
            credential,
            authority: "https://login.microsoftonline.com".to_string(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Bearer token for `scope`, from cache when still fresh
    pub async fn token(&self, scope: TokenScope) -> Result<String, ProviderError> {
        if let AzureCredential::Static(token) = &self.credential {
            return Ok(token.clone());
        }

        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.get(&scope).filter(|c| c.is_fresh()) {
            return Ok(cached.token.clone());
        }

        let fetched = self.fetch(scope).await?;
        let token = fetched.token.clone();
        cache.insert(scope, fetched);
        Ok(token)
    }

    async fn fetch(&self, scope: TokenScope) -> Result<CachedToken, ProviderError> {
        let operation = format!("acquiring {} token", scope);

        let (tenant_id, form) = match &self.credential {
            AzureCredential::Static(token) => {
                return Ok(CachedToken {
                    token: token.clone(),
                    expires_at: Instant::now() + Duration::from_secs(3600),
                })
            }
            AzureCredential::ClientSecret {
                tenant_id,
                client_id,
                client_secret,
            } => (
                tenant_id,
                vec![
                    ("grant_type", "client_credentials".to_string()),
                    ("client_id", client_id.clone()),
                    ("client_secret", client_secret.clone()),
                    ("scope", scope.scope().to_string()),
                ],
            ),
            AzureCredential::WorkloadIdentity {
                tenant_id,
                client_id,
                token_file,
            } => {
                let assertion = tokio::fs::read_to_string(token_file).await.map_err(|e| {
                    ProviderError::malformed(
                        operation.clone(),
                        format!("failed to read federated token {}: {}", token_file, e),
                    )
                })?;

                (
                    tenant_id,
                    vec![
                        ("grant_type", "client_credentials".to_string()),
                        ("client_id", client_id.clone()),
                        (
                            "client_assertion_type",
                            "urn:ietf:params:oauth:client-assertion-type:jwt-bearer".to_string(),
                        ),
                        ("client_assertion", assertion.trim().to_string()),
                        ("scope", scope.scope().to_string()),
                    ],
                )
            }
        };

        let token_url = format!("{}/{}/oauth2/v2.0/token", self.authority, tenant_id);

        let response = self
            .http_client
            .post(&token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(operation.clone(), e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::from_reqwest(operation.clone(), e))?;

        if !status.is_success() {
            return Err(parse_token_error(&operation, status.as_u16(), &body));
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::malformed(operation.clone(), e.to_string()))?;

        info!(scope = %scope, "Azure token acquired");

        Ok(CachedToken {
            token: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in.unwrap_or(3600)),
        })
    }
}

fn parse_token_error(operation: &str, status: u16, body: &str) -> ProviderError {
    match serde_json::from_str::<TokenErrorResponse>(body) {
        Ok(err) => ProviderError::api(
            operation,
            status,
            Some(&err.error),
            err.error_description.unwrap_or_default(),
        ),
        Err(_) => ProviderError::api(operation, status, None, body.to_string()),
    }
}

//! GitHub API collaborator.
//!
//! Coordinators depend on the narrow [`IssueHost`] trait; the concrete
//! client authenticates as a GitHub App (RS256 JWT, then a cached
//! per-installation access token) and carries a fixed short timeout on
//! every request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

/// Fixed timeout for source-control API calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const API_BASE: &str = "https://api.github.com";

#[derive(Debug, Clone, Deserialize)]
pub struct IssueDetails {
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub html_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullFile {
    pub filename: String,
    pub status: String,
    pub patch: Option<String>,
}

/// The narrow interface coordinators use to talk to the source-control
/// platform. `repo` is always the `owner/name` form.
#[async_trait]
pub trait IssueHost: Send + Sync {
    async fn get_issue(&self, installation_id: u64, repo: &str, number: u64)
        -> Result<IssueDetails>;

    /// Returns the created issue's number.
    async fn create_issue(
        &self,
        installation_id: u64,
        repo: &str,
        title: &str,
        body: &str,
    ) -> Result<u64>;

    /// Returns the created comment's id.
    async fn post_comment(
        &self,
        installation_id: u64,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<u64>;

    async fn list_pull_files(
        &self,
        installation_id: u64,
        repo: &str,
        pr_number: u64,
    ) -> Result<Vec<PullFile>>;
}

#[derive(Debug, Serialize)]
struct GitHubAppClaims {
    iss: u64,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
}

#[derive(Debug, Serialize)]
struct CreateIssueRequest<'a> {
    title: &'a str,
    body: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateCommentRequest<'a> {
    body: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreatedIssueResponse {
    number: u64,
}

#[derive(Debug, Deserialize)]
struct CreatedCommentResponse {
    id: u64,
}

/// GitHub App client with a per-installation token cache.
#[derive(Clone)]
pub struct GitHubClient {
    client: Client,
    app_id: u64,
    private_key: String,
    token_cache: Arc<RwLock<HashMap<u64, (String, SystemTime)>>>,
}

impl GitHubClient {
    pub fn new(app_id: u64, private_key: String) -> Self {
        let client = Client::builder()
            .user_agent(format!("octorelay/{}", octorelay_core::service_version()))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            app_id,
            private_key,
            token_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn generate_jwt(&self) -> Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("Failed to get current time")?
            .as_secs();

        let claims = GitHubAppClaims {
            iss: self.app_id,
            iat: now - 60,  // Issued 60 seconds ago to account for clock skew
            exp: now + 600, // Expires in 10 minutes
        };

        let header = Header::new(Algorithm::RS256);
        let encoding_key = EncodingKey::from_rsa_pem(self.private_key.as_bytes())
            .context("Failed to parse private key")?;

        encode(&header, &claims, &encoding_key).context("Failed to encode JWT")
    }

    async fn get_installation_token(&self, installation_id: u64) -> Result<String> {
        // Reuse a cached token while it has at least 5 minutes left.
        {
            let cache = self.token_cache.read().await;
            if let Some((token, expires_at)) = cache.get(&installation_id) {
                if expires_at
                    .duration_since(SystemTime::now())
                    .unwrap_or_default()
                    .as_secs()
                    > 300
                {
                    return Ok(token.clone());
                }
            }
        }

        let jwt = self.generate_jwt()?;
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            API_BASE, installation_id
        );

        info!(installation_id, "Requesting new installation access token");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", jwt))
            .header("Accept", "application/vnd.github.v3+json")
            .send()
            .await
            .context("Failed to send installation token request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            return Err(anyhow!(
                "GitHub App token request failed: {} - {}",
                status,
                error_text
            ));
        }

        let token_response: InstallationTokenResponse = response
            .json()
            .await
            .context("Failed to parse installation token response")?;

        // Installation tokens last an hour; track our own conservative expiry.
        let expires_at = SystemTime::now() + Duration::from_secs(3600);
        self.token_cache
            .write()
            .await
            .insert(installation_id, (token_response.token.clone(), expires_at));

        Ok(token_response.token)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        installation_id: u64,
        url: &str,
    ) -> Result<T> {
        let token = self.get_installation_token(installation_id).await?;
        let response = self
            .client
            .get(url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/vnd.github.v3+json")
            .send()
            .await
            .with_context(|| format!("Failed to GET {}", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            return Err(anyhow!("GitHub API error: {} - {}", status, error_text));
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))
    }

    async fn post_json<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        installation_id: u64,
        url: &str,
        body: &B,
    ) -> Result<T> {
        let token = self.get_installation_token(installation_id).await?;
        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/vnd.github.v3+json")
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to POST {}", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            return Err(anyhow!("GitHub API error: {} - {}", status, error_text));
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))
    }
}

#[async_trait]
impl IssueHost for GitHubClient {
    async fn get_issue(
        &self,
        installation_id: u64,
        repo: &str,
        number: u64,
    ) -> Result<IssueDetails> {
        let url = format!("{}/repos/{}/issues/{}", API_BASE, repo, number);
        self.get_json(installation_id, &url).await
    }

    async fn create_issue(
        &self,
        installation_id: u64,
        repo: &str,
        title: &str,
        body: &str,
    ) -> Result<u64> {
        let url = format!("{}/repos/{}/issues", API_BASE, repo);
        let created: CreatedIssueResponse = self
            .post_json(installation_id, &url, &CreateIssueRequest { title, body })
            .await?;
        Ok(created.number)
    }

    async fn post_comment(
        &self,
        installation_id: u64,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<u64> {
        let url = format!("{}/repos/{}/issues/{}/comments", API_BASE, repo, number);
        let created: CreatedCommentResponse = self
            .post_json(installation_id, &url, &CreateCommentRequest { body })
            .await?;
        Ok(created.id)
    }

    async fn list_pull_files(
        &self,
        installation_id: u64,
        repo: &str,
        pr_number: u64,
    ) -> Result<Vec<PullFile>> {
        let url = format!(
            "{}/repos/{}/pulls/{}/files?per_page=100",
            API_BASE, repo, pr_number
        );
        self.get_json(installation_id, &url).await
    }
}

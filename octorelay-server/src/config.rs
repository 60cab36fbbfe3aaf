//! Server configuration, read once from the environment at startup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::claim::DEFAULT_STALENESS_WINDOW;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_LLM_MODEL: &str = "gpt-4o";
const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_MAX_CONCURRENT_TASKS: usize = 8;

/// A peer coordinator service the router forwards raw deliveries to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub github_app_id: u64,
    pub github_private_key: String,
    /// Missing secret means reduced-security mode: accept all deliveries.
    pub webhook_secret: Option<String>,
    pub openai_api_key: String,
    pub llm_model: String,
    pub llm_timeout: Duration,
    pub port: u16,
    pub state_dir: PathBuf,
    /// source repo (owner/name) -> target repo (owner/name)
    pub copy_targets: HashMap<String, String>,
    pub peers: Vec<Peer>,
    pub staleness_window: Duration,
    pub max_concurrent_tasks: usize,
    /// No retention configured means records are kept forever.
    pub retention: Option<Duration>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let github_app_id = std::env::var("GITHUB_APP_ID")
            .context("GITHUB_APP_ID environment variable not set")?
            .parse::<u64>()
            .context("GITHUB_APP_ID must be a number")?;

        let github_private_key = std::env::var("GITHUB_PRIVATE_KEY")
            .context("GITHUB_PRIVATE_KEY environment variable not set")?
            .replace("\\n", "\n");

        let webhook_secret = std::env::var("GITHUB_WEBHOOK_SECRET").ok();

        let openai_api_key = std::env::var("OPENAI_API_KEY")
            .context("OPENAI_API_KEY environment variable not set")?;

        let llm_model =
            std::env::var("LLM_MODEL").unwrap_or_else(|_| DEFAULT_LLM_MODEL.to_string());

        let llm_timeout = match std::env::var("LLM_TIMEOUT_SECS") {
            Ok(value) => Duration::from_secs(
                value
                    .parse::<u64>()
                    .context("LLM_TIMEOUT_SECS must be a number")?,
            ),
            Err(_) => DEFAULT_LLM_TIMEOUT,
        };

        let port = match std::env::var("PORT") {
            Ok(value) => value.parse::<u16>().context("PORT must be a number")?,
            Err(_) => DEFAULT_PORT,
        };

        let state_dir = std::env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let copy_targets = match std::env::var("COPY_TARGETS") {
            Ok(value) => parse_copy_targets(&value)?,
            Err(_) => HashMap::new(),
        };

        let peers = match std::env::var("PEER_COORDINATORS") {
            Ok(value) => parse_peers(&value)?,
            Err(_) => Vec::new(),
        };

        let staleness_window = match std::env::var("CLAIM_STALENESS_SECS") {
            Ok(value) => Duration::from_secs(
                value
                    .parse::<u64>()
                    .context("CLAIM_STALENESS_SECS must be a number")?,
            ),
            Err(_) => DEFAULT_STALENESS_WINDOW,
        };

        let max_concurrent_tasks = match std::env::var("MAX_CONCURRENT_TASKS") {
            Ok(value) => value
                .parse::<usize>()
                .context("MAX_CONCURRENT_TASKS must be a number")?,
            Err(_) => DEFAULT_MAX_CONCURRENT_TASKS,
        };

        let retention = match std::env::var("RETENTION_DAYS") {
            Ok(value) => {
                let days = value
                    .parse::<u64>()
                    .context("RETENTION_DAYS must be a number")?;
                Some(Duration::from_secs(days * 24 * 3600))
            }
            Err(_) => None,
        };

        Ok(Config {
            github_app_id,
            github_private_key,
            webhook_secret,
            openai_api_key,
            llm_model,
            llm_timeout,
            port,
            state_dir,
            copy_targets,
            peers,
            staleness_window,
            max_concurrent_tasks,
            retention,
        })
    }
}

/// Parse `source=target,source2=target2` repository mappings.
pub fn parse_copy_targets(value: &str) -> Result<HashMap<String, String>> {
    let mut targets = HashMap::new();
    for entry in value.split(',').filter(|e| !e.trim().is_empty()) {
        let (source, target) = entry
            .split_once('=')
            .with_context(|| format!("Invalid COPY_TARGETS entry (expected src=dst): {}", entry))?;
        let source = source.trim();
        let target = target.trim();
        anyhow::ensure!(
            source.contains('/') && target.contains('/'),
            "Repositories in COPY_TARGETS must be owner/name: {}",
            entry
        );
        targets.insert(source.to_string(), target.to_string());
    }
    Ok(targets)
}

/// Parse `name=url,name2=url2` peer coordinator endpoints.
pub fn parse_peers(value: &str) -> Result<Vec<Peer>> {
    let mut peers = Vec::new();
    for entry in value.split(',').filter(|e| !e.trim().is_empty()) {
        let (name, url) = entry.split_once('=').with_context(|| {
            format!("Invalid PEER_COORDINATORS entry (expected name=url): {}", entry)
        })?;
        anyhow::ensure!(
            url.trim().starts_with("http://") || url.trim().starts_with("https://"),
            "Peer URL must be http(s): {}",
            entry
        );
        peers.push(Peer {
            name: name.trim().to_string(),
            url: url.trim().to_string(),
        });
    }
    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_copy_targets() {
        let targets =
            parse_copy_targets("acme/public=acme/internal, beta/ui = beta/ui-mirror").unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets["acme/public"], "acme/internal");
        assert_eq!(targets["beta/ui"], "beta/ui-mirror");
    }

    #[test]
    fn test_parse_copy_targets_rejects_malformed_entries() {
        assert!(parse_copy_targets("acme/public").is_err());
        assert!(parse_copy_targets("public=internal").is_err());
    }

    #[test]
    fn test_parse_copy_targets_empty() {
        assert!(parse_copy_targets("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_peers() {
        let peers = parse_peers("audit=https://audit.internal/webhook").unwrap();
        assert_eq!(
            peers,
            vec![Peer {
                name: "audit".to_string(),
                url: "https://audit.internal/webhook".to_string(),
            }]
        );
    }

    #[test]
    fn test_parse_peers_rejects_non_http_urls() {
        assert!(parse_peers("audit=ftp://audit.internal").is_err());
        assert!(parse_peers("audit").is_err());
    }
}

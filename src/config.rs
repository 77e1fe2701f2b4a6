use anyhow::{Context, Result};
use std::env;

use crate::upload::IdentityHeader;

/// Workers used when UPLOAD_CONCURRENCY is not set
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Upper bound for UPLOAD_CONCURRENCY
pub const MAX_CONCURRENCY: usize = 32;

/// Header name used when UPLOAD_IDENTITY_HEADER is not set
pub const DEFAULT_IDENTITY_HEADER: &str = "authorization";

/// Request timeout used when UPLOAD_TIMEOUT_SECS is not set
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Configuration for signed upload operations
#[derive(Debug, Clone)]
pub struct Config {
    pub grant_url: String,
    pub identity_header: String,
    pub identity_token: Option<String>,
    pub concurrency: usize,
    pub timeout_secs: u64,
}

impl Config {
    /// Load configuration from environment variables and .env file
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or invalid
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if it exists

        let grant_url = env::var("UPLOAD_GRANT_URL")
            .context("UPLOAD_GRANT_URL not found in environment. Please set it in .env file")?;
        Self::validate_grant_url(&grant_url)?;

        let identity_header = env::var("UPLOAD_IDENTITY_HEADER")
            .unwrap_or_else(|_| DEFAULT_IDENTITY_HEADER.to_string());
        Self::validate_header_name(&identity_header)?;

        let identity_token = env::var("UPLOAD_IDENTITY_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty());

        let concurrency = match env::var("UPLOAD_CONCURRENCY") {
            Ok(value) => Self::parse_concurrency(&value)?,
            Err(_) => DEFAULT_CONCURRENCY,
        };

        let timeout_secs = match env::var("UPLOAD_TIMEOUT_SECS") {
            Ok(value) => value
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|t| *t > 0)
                .with_context(|| {
                    format!("UPLOAD_TIMEOUT_SECS '{}' must be a positive number", value)
                })?,
            Err(_) => DEFAULT_TIMEOUT_SECS,
        };

        Ok(Self {
            grant_url,
            identity_header,
            identity_token,
            concurrency,
            timeout_secs,
        })
    }

    /// The identity header to attach to grant requests, if a token is set
    pub fn identity(&self) -> Option<IdentityHeader> {
        self.identity_token.as_ref().map(|token| IdentityHeader {
            name: self.identity_header.clone(),
            value: token.clone(),
        })
    }

    /// Validate the grant endpoint URL
    fn validate_grant_url(url: &str) -> Result<()> {
        if url.is_empty() {
            anyhow::bail!("UPLOAD_GRANT_URL cannot be empty");
        }

        let parsed = reqwest::Url::parse(url)
            .with_context(|| format!("UPLOAD_GRANT_URL '{}' is not a valid URL", url))?;

        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            anyhow::bail!(
                "UPLOAD_GRANT_URL '{}' must use http or https (got {})",
                url,
                parsed.scheme()
            );
        }

        if parsed.host_str().is_none() {
            anyhow::bail!("UPLOAD_GRANT_URL '{}' has no host", url);
        }

        Ok(())
    }

    /// Validate the identity header name
    fn validate_header_name(name: &str) -> Result<()> {
        reqwest::header::HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("UPLOAD_IDENTITY_HEADER '{}' is not a valid header name", name))?;
        Ok(())
    }

    /// Parse and bound the worker count
    fn parse_concurrency(value: &str) -> Result<usize> {
        let concurrency: usize = value
            .trim()
            .parse()
            .with_context(|| format!("UPLOAD_CONCURRENCY '{}' is not a number", value))?;

        Self::validate_concurrency(concurrency)?;
        Ok(concurrency)
    }

    pub fn validate_concurrency(concurrency: usize) -> Result<()> {
        if concurrency == 0 || concurrency > MAX_CONCURRENCY {
            anyhow::bail!(
                "Concurrency must be between 1 and {} (got {})",
                MAX_CONCURRENCY,
                concurrency
            );
        }
        Ok(())
    }
}

//! Email sender capability and the Mailgun HTTP implementation.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, from: &str, to: &str, subject: &str, html_body: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct MailgunSender {
    http: Client,
    endpoint: Url,
    api_key: String,
}

impl fmt::Debug for MailgunSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailgunSender")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl MailgunSender {
    pub fn new(api_base: &str, domain: &str, api_key: impl Into<String>) -> Result<Self> {
        // Url::join drops the last path segment unless the base ends with '/'.
        let mut base = api_base.trim_end_matches('/').to_string();
        base.push('/');
        let endpoint = Url::parse(&base)
            .context("invalid mail.api_base")?
            .join(&format!("{}/messages", domain.trim_matches('/')))
            .context("invalid mail.domain")?;
        let http = Client::builder()
            .user_agent("tw-digest/0.1")
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build mail HTTP client")?;
        Ok(Self {
            http,
            endpoint,
            api_key: api_key.into(),
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        Self::new(&cfg.mail.api_base, &cfg.mail.domain, cfg.mail.api_key.clone())
    }
}

#[async_trait]
impl EmailSender for MailgunSender {
    async fn send(&self, from: &str, to: &str, subject: &str, html_body: &str) -> Result<()> {
        debug!(%to, %subject, "sending email");
        let form = [("from", from), ("to", to), ("subject", subject), ("html", html_body)];
        let res = self
            .http
            .post(self.endpoint.clone())
            .basic_auth("api", Some(&self.api_key))
            .form(&form)
            .send()
            .await
            .context("failed to reach mail API")?;

        let status = res.status();
        if status.is_success() {
            return Ok(());
        }
        let body = res.text().await.unwrap_or_default();
        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!(%to, "rate limited by mail API: {}", body);
        }
        Err(anyhow!("mail API error {}: {}", status, body))
    }
}

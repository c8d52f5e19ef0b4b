//! Signed links that confirm an owner's notification address.
//!
//! A link carries an HS256 token with the address, the owner id and an
//! expiry. Whatever serves `confirmation.link_base` verifies the token and
//! moves the address to CONFIRMED.

use crate::config::Config;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfirmClaims {
    pub email: String,
    pub user_id: String,
    pub exp: i64,
}

#[derive(Clone)]
pub struct LinkSigner {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    link_base: Url,
    ttl: Duration,
}

impl fmt::Debug for LinkSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkSigner")
            .field("link_base", &self.link_base.as_str())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl LinkSigner {
    pub fn new(secret: &str, link_base: &str, ttl: Duration) -> Result<Self> {
        let link_base = Url::parse(link_base).with_context(|| format!("invalid link base {link_base}"))?;
        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            link_base,
            ttl,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        Self::new(
            &cfg.confirmation.signing_key,
            &cfg.confirmation.link_base,
            Duration::hours(i64::from(cfg.confirmation.token_ttl_hours)),
        )
    }

    /// Token for `email` of `owner_id`, valid for the configured ttl after `now`.
    pub fn token(&self, email: &str, owner_id: Uuid, now: DateTime<Utc>) -> Result<String> {
        let claims = ConfirmClaims {
            email: email.to_string(),
            user_id: owner_id.to_string(),
            exp: (now + self.ttl).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding_key).context("failed to sign confirmation token")
    }

    pub fn link(&self, email: &str, owner_id: Uuid, now: DateTime<Utc>) -> Result<String> {
        let token = self.token(email, owner_id, now)?;
        let mut url = self.link_base.clone();
        url.query_pairs_mut().append_pair("token", &token);
        Ok(url.to_string())
    }

    /// Check the signature and expiry of `token` and return its claims.
    pub fn verify(&self, token: &str) -> Result<ConfirmClaims> {
        decode::<ConfirmClaims>(token, &self.decoding_key, &Validation::default())
            .map(|data| data.claims)
            .context("invalid confirmation token")
    }
}

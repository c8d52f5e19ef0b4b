//! Row and view models returned by the store.
//!
//! Rows mirror table columns exactly; conversions into domain types live here
//! so the query modules stay focused on SQL.

use crate::model::{Credentials, CycleStatus, DigestCycle, EmailStatus, FollowedAccount, Owner, OwnerEmail, Post};
use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::parse_uuid;

#[derive(Debug, Clone, FromRow)]
pub(crate) struct OwnerRow {
    pub id: String,
    pub name: String,
    pub upstream_user_id: String,
    pub access_token: String,
    pub token_secret: String,
}

impl TryFrom<OwnerRow> for Owner {
    type Error = anyhow::Error;

    fn try_from(row: OwnerRow) -> Result<Self> {
        Ok(Owner {
            id: parse_uuid(&row.id)?,
            name: row.name,
            credentials: Credentials {
                user_id: row.upstream_user_id,
                access_token: row.access_token,
                token_secret: row.token_secret,
            },
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct OwnerEmailRow {
    pub owner_id: String,
    pub email: String,
    pub status: String,
}

impl TryFrom<OwnerEmailRow> for OwnerEmail {
    type Error = anyhow::Error;

    fn try_from(row: OwnerEmailRow) -> Result<Self> {
        let status = EmailStatus::parse_state(&row.status)
            .ok_or_else(|| anyhow!("email {} has unknown status {}", row.email, row.status))?;
        Ok(OwnerEmail {
            owner_id: parse_uuid(&row.owner_id)?,
            email: row.email,
            status,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct SubscriptionRow {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub notify_email: String,
    pub day_of_week: String,
    pub ignore_retweets: bool,
    pub ignore_replies: bool,
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct AccountRow {
    pub external_id: String,
    pub display_name: String,
    pub screen_name: String,
    pub avatar_url: String,
}

impl From<AccountRow> for FollowedAccount {
    fn from(row: AccountRow) -> Self {
        FollowedAccount {
            external_id: row.external_id,
            display_name: row.display_name,
            screen_name: row.screen_name,
            avatar_url: row.avatar_url,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct CycleRow {
    pub id: i64,
    pub subscription_id: String,
    pub status: String,
    pub cycle_date: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<CycleRow> for DigestCycle {
    type Error = anyhow::Error;

    fn try_from(row: CycleRow) -> Result<Self> {
        let status = CycleStatus::parse_state(&row.status)
            .ok_or_else(|| anyhow!("cycle {} has unknown status {}", row.id, row.status))?;
        Ok(DigestCycle {
            id: row.id,
            subscription_id: parse_uuid(&row.subscription_id)?,
            status,
            cycle_date: row.cycle_date,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct PostRow {
    pub id: i64,
    pub external_id: String,
    pub account_id: String,
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

impl From<PostRow> for Post {
    fn from(row: PostRow) -> Self {
        Post {
            id: row.id,
            external_id: row.external_id,
            account_id: row.account_id,
            payload: row.payload,
            created_at: row.created_at,
        }
    }
}

/// One post delivered by a SENT cycle, used to advance watermarks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentContribution {
    pub subscription_id: Uuid,
    pub account_id: String,
    pub external_post_id: String,
}

/// Outcome of reconciling a subscription's follow list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

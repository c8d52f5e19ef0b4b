#![allow(dead_code)]

use anyhow::{anyhow, Result};
use chrono::{NaiveDate, Weekday};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use tw_digest::confirm::LinkSigner;
use tw_digest::db::{self, Pool};
use tw_digest::mail::EmailSender;
use tw_digest::model::{
    cmp_post_ids, Credentials, EmailStatus, FetchedPost, FollowedAccount, Owner, PostPayload, Subscription,
    TimelineFilters,
};
use tw_digest::pipeline::{Pipeline, PipelineSettings};
use tw_digest::timeline::{PostStream, TimelineFetcher};

/// 2024-03-04 is a Monday.
pub fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()
}

pub async fn setup_pool() -> (tempfile::TempDir, Pool) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("digest.db").display());
    let pool = db::init_pool(&url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    (dir, pool)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineCall {
    Recent { account: String, since: Option<String> },
    MostRecent { account: String },
}

/// Serves canned timelines per account and records every call.
#[derive(Clone, Default)]
pub struct FakeTimeline {
    timelines: Arc<Mutex<HashMap<String, Vec<FetchedPost>>>>,
    failing: Arc<Mutex<HashSet<String>>>,
    broken: Arc<Mutex<HashSet<String>>>,
    calls: Arc<Mutex<Vec<TimelineCall>>>,
}

impl FakeTimeline {
    pub async fn push(&self, post: FetchedPost) {
        self.timelines
            .lock()
            .await
            .entry(post.account_id.clone())
            .or_default()
            .push(post);
    }

    pub async fn fail_account(&self, account: &str) {
        self.failing.lock().await.insert(account.to_string());
    }

    /// `fetch_recent` for `account` yields its newest post, then an error.
    pub async fn break_mid_stream(&self, account: &str) {
        self.broken.lock().await.insert(account.to_string());
    }

    pub async fn calls(&self) -> Vec<TimelineCall> {
        self.calls.lock().await.clone()
    }

    pub async fn clear_calls(&self) {
        self.calls.lock().await.clear();
    }

    async fn check(&self, account: &str) -> Result<()> {
        if self.failing.lock().await.contains(account) {
            return Err(anyhow!("upstream unavailable for {}", account));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl TimelineFetcher for FakeTimeline {
    async fn fetch_recent(
        &self,
        account: &FollowedAccount,
        _credentials: &Credentials,
        since: Option<&str>,
        filters: TimelineFilters,
    ) -> Result<PostStream> {
        self.calls.lock().await.push(TimelineCall::Recent {
            account: account.external_id.clone(),
            since: since.map(str::to_string),
        });
        self.check(&account.external_id).await?;
        let mut posts: Vec<FetchedPost> = self
            .timelines
            .lock()
            .await
            .get(&account.external_id)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|p| since.map_or(true, |s| cmp_post_ids(&p.external_id, s).is_gt()))
            .filter(|p| !(filters.ignore_retweets && p.payload.is_retweet))
            .filter(|p| !(filters.ignore_replies && p.payload.in_reply_to_status_id.is_some()))
            .collect();
        posts.sort_by(|a, b| cmp_post_ids(&b.external_id, &a.external_id));
        if self.broken.lock().await.contains(&account.external_id) {
            let mut items: Vec<Result<FetchedPost>> = posts.into_iter().take(1).map(Ok).collect();
            items.push(Err(anyhow!("connection reset")));
            return Ok(stream::iter(items).boxed());
        }
        Ok(stream::iter(posts.into_iter().map(Ok)).boxed())
    }

    async fn fetch_most_recent_one(
        &self,
        account: &FollowedAccount,
        _credentials: &Credentials,
    ) -> Result<Option<FetchedPost>> {
        self.calls.lock().await.push(TimelineCall::MostRecent {
            account: account.external_id.clone(),
        });
        self.check(&account.external_id).await?;
        let timelines = self.timelines.lock().await;
        Ok(timelines.get(&account.external_id).and_then(|posts| {
            posts
                .iter()
                .max_by(|a, b| cmp_post_ids(&a.external_id, &b.external_id))
                .cloned()
        }))
    }
}

#[derive(Debug, Clone)]
pub struct SentMail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[derive(Clone, Default)]
pub struct RecordingMailer {
    responses: Arc<Mutex<VecDeque<Result<()>>>>,
    sent: Arc<Mutex<Vec<SentMail>>>,
}

impl RecordingMailer {
    pub async fn queue_failure(&self, message: &str) {
        self.responses.lock().await.push_back(Err(anyhow!(message.to_string())));
    }

    pub async fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl EmailSender for RecordingMailer {
    async fn send(&self, from: &str, to: &str, subject: &str, html_body: &str) -> Result<()> {
        let response = self.responses.lock().await.pop_front().unwrap_or(Ok(()));
        if response.is_ok() {
            self.sent.lock().await.push(SentMail {
                from: from.to_string(),
                to: to.to_string(),
                subject: subject.to_string(),
                html: html_body.to_string(),
            });
        }
        response
    }
}

pub struct Harness {
    _dir: tempfile::TempDir,
    pub pool: Pool,
    pub timeline: FakeTimeline,
    pub mailer: RecordingMailer,
    pub pipeline: Pipeline,
}

pub async fn harness() -> Harness {
    let (dir, pool) = setup_pool().await;
    let timeline = FakeTimeline::default();
    let mailer = RecordingMailer::default();
    let settings = PipelineSettings {
        from: "digest@example.com".into(),
        lock_lease: Duration::from_secs(60),
        post_ttl: chrono::Duration::days(30),
        links: link_signer(),
    };
    let pipeline = Pipeline::new(
        pool.clone(),
        Arc::new(timeline.clone()),
        Arc::new(mailer.clone()),
        settings,
    );
    Harness {
        _dir: dir,
        pool,
        timeline,
        mailer,
        pipeline,
    }
}

pub fn link_signer() -> LinkSigner {
    LinkSigner::new(
        "test-signing-key",
        "https://digest.example.com/confirm/email",
        chrono::Duration::hours(24),
    )
    .unwrap()
}

pub fn account(id: &str) -> FollowedAccount {
    FollowedAccount {
        external_id: id.into(),
        display_name: format!("Account {id}"),
        screen_name: format!("acct{id}"),
        avatar_url: format!("https://img.example.com/{id}.png"),
    }
}

pub fn post(external_id: &str, account_id: &str) -> FetchedPost {
    FetchedPost {
        external_id: external_id.into(),
        account_id: account_id.into(),
        payload: PostPayload {
            text: format!("post number {external_id}"),
            author_id: account_id.into(),
            author_name: format!("Account {account_id}"),
            author_screen_name: format!("acct{account_id}"),
            ..Default::default()
        },
    }
}

/// An owner whose address `email` has the given verification status.
pub async fn owner(pool: &Pool, email: &str, status: EmailStatus) -> Owner {
    let owner = Owner {
        id: Uuid::new_v4(),
        name: "Owner".into(),
        credentials: Credentials {
            user_id: "1".into(),
            access_token: "token".into(),
            token_secret: "secret".into(),
        },
    };
    db::upsert_owner(pool, &owner).await.unwrap();
    db::upsert_owner_email(pool, owner.id, email, status).await.unwrap();
    owner
}

pub async fn subscription(pool: &Pool, owner: &Owner, day: Weekday, accounts: &[&str]) -> Subscription {
    let subscription = Subscription {
        id: Uuid::new_v4(),
        owner_id: owner.id,
        title: "Weekly".into(),
        notify_email: "me@example.com".into(),
        day_of_week: day,
        ignore_retweets: false,
        ignore_replies: false,
        follow_list: accounts.iter().map(|id| account(id)).collect::<Vec<_>>().into(),
    };
    db::insert_subscription(pool, &subscription).await.unwrap();
    subscription
}

pub async fn count(pool: &Pool, sql: &str) -> i64 {
    sqlx::query_scalar(sql).fetch_one(pool).await.unwrap()
}

use chrono::{DateTime, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CycleStatus {
    Preparing,
    Ready,
    Sending,
    Sent,
    Failed,
    /// Recipient address is not confirmed; re-checked by later send runs the same day.
    Blocked,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Preparing => "PREPARING",
            CycleStatus::Ready => "READY",
            CycleStatus::Sending => "SENDING",
            CycleStatus::Sent => "SENT",
            CycleStatus::Failed => "FAILED",
            CycleStatus::Blocked => "BLOCKED",
        }
    }

    pub fn parse_state(value: &str) -> Option<Self> {
        match value {
            "PREPARING" => Some(CycleStatus::Preparing),
            "READY" => Some(CycleStatus::Ready),
            "SENDING" => Some(CycleStatus::Sending),
            "SENT" => Some(CycleStatus::Sent),
            "FAILED" => Some(CycleStatus::Failed),
            "BLOCKED" => Some(CycleStatus::Blocked),
            _ => None,
        }
    }
}

impl fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EmailStatus {
    New,
    Sent,
    Confirmed,
}

impl EmailStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailStatus::New => "NEW",
            EmailStatus::Sent => "SENT",
            EmailStatus::Confirmed => "CONFIRMED",
        }
    }

    pub fn parse_state(value: &str) -> Option<Self> {
        match value {
            "NEW" => Some(EmailStatus::New),
            "SENT" => Some(EmailStatus::Sent),
            "CONFIRMED" => Some(EmailStatus::Confirmed),
            _ => None,
        }
    }
}

/// A notification address registered by an owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerEmail {
    pub owner_id: Uuid,
    pub email: String,
    pub status: EmailStatus,
}

/// Orders upstream post ids as unsigned decimal numbers of any length.
///
/// Ids are assigned monotonically upstream, so "99" sorts before "100" even
/// though it is lexically greater.
pub fn cmp_post_ids(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

pub fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

/// Accepts full or abbreviated English day names, case-insensitively.
pub fn parse_weekday(value: &str) -> Option<Weekday> {
    value.trim().parse::<Weekday>().ok()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FollowedAccount {
    pub external_id: String,
    pub display_name: String,
    pub screen_name: String,
    pub avatar_url: String,
}

/// Accounts followed by one subscription, kept in the order the user chose.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FollowList(Vec<FollowedAccount>);

impl FollowList {
    pub fn new(accounts: Vec<FollowedAccount>) -> Self {
        Self(accounts)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FollowedAccount> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Accounts of `self` whose external id does not appear in `other`.
    ///
    /// Membership is decided by identity: `other`'s ids are sorted once and
    /// each of `self`'s accounts is binary-searched. The result keeps
    /// `self`'s order.
    pub fn diff(&self, other: &FollowList) -> Vec<FollowedAccount> {
        let mut ids: Vec<&str> = other.0.iter().map(|a| a.external_id.as_str()).collect();
        ids.sort_unstable();
        self.0
            .iter()
            .filter(|a| ids.binary_search(&a.external_id.as_str()).is_err())
            .cloned()
            .collect()
    }

    pub fn set_eq(&self, other: &FollowList) -> bool {
        self.diff(other).is_empty() && other.diff(self).is_empty()
    }
}

impl From<Vec<FollowedAccount>> for FollowList {
    fn from(accounts: Vec<FollowedAccount>) -> Self {
        Self(accounts)
    }
}

impl<'a> IntoIterator for &'a FollowList {
    type Item = &'a FollowedAccount;
    type IntoIter = std::slice::Iter<'a, FollowedAccount>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub notify_email: String,
    pub day_of_week: Weekday,
    pub ignore_retweets: bool,
    pub ignore_replies: bool,
    pub follow_list: FollowList,
}

impl Subscription {
    pub fn filters(&self) -> TimelineFilters {
        TimelineFilters {
            ignore_retweets: self.ignore_retweets,
            ignore_replies: self.ignore_replies,
        }
    }

    pub fn subject(&self, date: NaiveDate) -> String {
        format!("{}: {}", self.title, date.format("%Y-%m-%d"))
    }
}

/// Scalar fields must match exactly; the follow list only as a set.
impl PartialEq for Subscription {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.owner_id == other.owner_id
            && self.title == other.title
            && self.notify_email == other.notify_email
            && self.day_of_week == other.day_of_week
            && self.ignore_retweets == other.ignore_retweets
            && self.ignore_replies == other.ignore_replies
            && self.follow_list.set_eq(&other.follow_list)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimelineFilters {
    pub ignore_retweets: bool,
    pub ignore_replies: bool,
}

/// Upstream credentials of a subscription owner.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub user_id: String,
    pub access_token: String,
    pub token_secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Owner {
    pub id: Uuid,
    pub name: String,
    pub credentials: Credentials,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostPayload {
    pub text: String,
    #[serde(default)]
    pub full_text: Option<String>,
    #[serde(default)]
    pub in_reply_to_status_id: Option<String>,
    #[serde(default)]
    pub in_reply_to_user_id: Option<String>,
    #[serde(default)]
    pub is_retweet: bool,
    pub author_id: String,
    pub author_name: String,
    pub author_screen_name: String,
    #[serde(default)]
    pub author_avatar_url: String,
    #[serde(default)]
    pub posted_at: Option<DateTime<Utc>>,
}

impl PostPayload {
    pub fn body(&self) -> &str {
        self.full_text
            .as_deref()
            .filter(|t| !t.is_empty())
            .unwrap_or(&self.text)
    }
}

/// A post as produced by the timeline fetcher, before it is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPost {
    pub external_id: String,
    /// The followed account whose timeline produced the post.
    pub account_id: String,
    pub payload: PostPayload,
}

#[derive(Debug, Clone)]
pub struct Post {
    pub id: i64,
    pub external_id: String,
    pub account_id: String,
    /// JSON-encoded [`PostPayload`].
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

impl Post {
    pub fn decode_payload(&self) -> Result<PostPayload, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestCycle {
    pub id: i64,
    pub subscription_id: Uuid,
    pub status: CycleStatus,
    pub cycle_date: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

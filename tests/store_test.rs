mod common;

use chrono::{Utc, Weekday};
use common::*;
use tw_digest::db;
use tw_digest::model::{EmailStatus, FollowList};

#[tokio::test]
async fn removing_an_account_drops_link_and_watermark() {
    let h = harness().await;
    let owner = owner(&h.pool, "me@example.com", EmailStatus::Confirmed).await;
    let mut sub = subscription(&h.pool, &owner, Weekday::Mon, &["10", "20"]).await;
    db::insert_watermark(&h.pool, sub.id, "10", "100").await.unwrap();
    db::insert_watermark(&h.pool, sub.id, "20", "200").await.unwrap();

    sub.follow_list = FollowList::new(vec![account("10")]);
    let outcome = db::update_subscription(&h.pool, &sub).await.unwrap();
    assert!(outcome.added.is_empty());
    assert_eq!(outcome.removed, vec!["20"]);
    assert_eq!(db::get_watermark(&h.pool, sub.id, "20").await.unwrap(), None);
    let stored = db::get_subscription(&h.pool, sub.id).await.unwrap().unwrap();
    assert_eq!(stored, sub);

    // Following it again starts from scratch.
    sub.follow_list = FollowList::new(vec![account("10"), account("20")]);
    let outcome = db::update_subscription(&h.pool, &sub).await.unwrap();
    assert_eq!(outcome.added, vec!["20"]);
    assert_eq!(db::get_watermark(&h.pool, sub.id, "20").await.unwrap(), None);

    h.timeline.push(post("250", "20")).await;
    h.pipeline.prepare_subscriptions_on(monday(), &[]).await.unwrap();
    assert!(h
        .timeline
        .calls()
        .await
        .iter()
        .all(|call| !matches!(call, TimelineCall::Recent { account, .. } if account == "20")));

    h.pipeline.init_subscriptions(&[sub.id]).await.unwrap();
    assert_eq!(db::get_watermark(&h.pool, sub.id, "20").await.unwrap().as_deref(), Some("250"));
}

#[tokio::test]
async fn unchanged_follow_list_reconciles_to_nothing() {
    let h = harness().await;
    let owner = owner(&h.pool, "me@example.com", EmailStatus::Confirmed).await;
    let mut sub = subscription(&h.pool, &owner, Weekday::Mon, &["10", "20"]).await;
    sub.title = "Renamed".into();
    sub.follow_list = FollowList::new(vec![account("20"), account("10")]);

    let outcome = db::update_subscription(&h.pool, &sub).await.unwrap();
    assert_eq!(outcome, db::Reconciliation::default());
    let stored = db::get_subscription(&h.pool, sub.id).await.unwrap().unwrap();
    assert_eq!(stored.title, "Renamed");
}

#[tokio::test]
async fn shared_accounts_are_stored_once() {
    let h = harness().await;
    let owner = owner(&h.pool, "me@example.com", EmailStatus::Confirmed).await;
    subscription(&h.pool, &owner, Weekday::Mon, &["10", "20"]).await;
    subscription(&h.pool, &owner, Weekday::Fri, &["20", "30"]).await;

    assert_eq!(count(&h.pool, "SELECT COUNT(*) FROM accounts").await, 3);
    assert_eq!(count(&h.pool, "SELECT COUNT(*) FROM subscription_accounts").await, 4);
}

#[tokio::test]
async fn deleting_a_subscription_keeps_shared_posts() {
    let h = harness().await;
    let owner = owner(&h.pool, "me@example.com", EmailStatus::Confirmed).await;
    let sub = subscription(&h.pool, &owner, Weekday::Mon, &["10"]).await;
    db::insert_watermark(&h.pool, sub.id, "10", "100").await.unwrap();
    h.timeline.push(post("101", "10")).await;
    h.pipeline.prepare_subscriptions_on(monday(), &[]).await.unwrap();

    db::delete_subscription(&h.pool, sub.id).await.unwrap();
    assert!(db::get_subscription(&h.pool, sub.id).await.unwrap().is_none());
    assert_eq!(count(&h.pool, "SELECT COUNT(*) FROM digest_cycles").await, 0);
    assert_eq!(count(&h.pool, "SELECT COUNT(*) FROM watermarks").await, 0);
    assert!(db::get_post_by_external_id(&h.pool, "101").await.unwrap().is_some());
}

#[tokio::test]
async fn pruning_removes_expired_posts_and_links() {
    let h = harness().await;
    let owner = owner(&h.pool, "me@example.com", EmailStatus::Confirmed).await;
    let sub = subscription(&h.pool, &owner, Weekday::Mon, &["10"]).await;
    db::insert_watermark(&h.pool, sub.id, "10", "100").await.unwrap();
    h.timeline.push(post("101", "10")).await;
    h.timeline.push(post("102", "10")).await;
    h.pipeline.prepare_subscriptions_on(monday(), &[]).await.unwrap();

    let removed = h.pipeline.prune_posts_at(Utc::now()).await.unwrap();
    assert_eq!(removed, 0);

    let removed = h
        .pipeline
        .prune_posts_at(Utc::now() + chrono::Duration::days(31))
        .await
        .unwrap();
    assert_eq!(removed, 2);
    assert_eq!(count(&h.pool, "SELECT COUNT(*) FROM posts").await, 0);
    assert_eq!(count(&h.pool, "SELECT COUNT(*) FROM cycle_posts").await, 0);
}

#[tokio::test]
async fn watermark_only_moves_forward() {
    let h = harness().await;
    let owner = owner(&h.pool, "me@example.com", EmailStatus::Confirmed).await;
    let sub = subscription(&h.pool, &owner, Weekday::Mon, &["10", "20"]).await;
    db::insert_watermark(&h.pool, sub.id, "10", "100").await.unwrap();

    assert!(!db::advance_watermark(&h.pool, sub.id, "10", "99").await.unwrap());
    assert!(!db::advance_watermark(&h.pool, sub.id, "10", "100").await.unwrap());
    assert_eq!(db::get_watermark(&h.pool, sub.id, "10").await.unwrap().as_deref(), Some("100"));

    assert!(db::advance_watermark(&h.pool, sub.id, "10", "1000").await.unwrap());
    assert_eq!(db::get_watermark(&h.pool, sub.id, "10").await.unwrap().as_deref(), Some("1000"));

    // Advancing never creates a watermark.
    assert!(!db::advance_watermark(&h.pool, sub.id, "20", "500").await.unwrap());
    assert_eq!(db::get_watermark(&h.pool, sub.id, "20").await.unwrap(), None);
}

#[tokio::test]
async fn email_status_transition_requires_the_expected_state() {
    let h = harness().await;
    let owner = owner(&h.pool, "me@example.com", EmailStatus::Confirmed).await;

    let moved = db::transition_email_status(&h.pool, owner.id, "me@example.com", EmailStatus::New, EmailStatus::Sent)
        .await
        .unwrap();
    assert!(!moved);
    assert_eq!(
        db::email_status(&h.pool, owner.id, "me@example.com").await.unwrap(),
        Some(EmailStatus::Confirmed)
    );
    assert!(db::emails_with_status(&h.pool, EmailStatus::New).await.unwrap().is_empty());
}

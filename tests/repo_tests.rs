#![cfg(feature = "inmem-store")]

use chrono::{Duration, Utc};
use ember::{
    auth::Role,
    models::{NewDiscussion, NewUser, RegistrationToken},
    repo::{inmem::InMemRepo, RepoError, MIGRATIONS},
};
// Bring trait method namespaces into scope so calls on InMemRepo resolve.
use ember::repo::{DiscussionRepo, MigrationRepo, SettingsRepo, TokenRepo, UserRepo};
use serde_json::{Map, Value};

fn new_user(name: &str) -> NewUser {
    NewUser {
        username: name.into(),
        email: format!("{name}@forum.test"),
        password_hash: "hash".into(),
        role: Role::User,
        is_email_confirmed: false,
    }
}

#[tokio::test]
async fn users_are_unique_by_username_and_email() {
    let r = InMemRepo::ephemeral();
    let alice = r.create_user(new_user("alice")).await.unwrap();

    let err = r.create_user(new_user("Alice")).await.unwrap_err();
    assert!(matches!(err, RepoError::Conflict));

    let mut clash = new_user("bob");
    clash.email = "ALICE@forum.test".into();
    assert!(matches!(r.create_user(clash).await.unwrap_err(), RepoError::Conflict));

    // login accepts either identifier, case-insensitively
    let found = r.find_user_by_login("alice@FORUM.test").await.unwrap().unwrap();
    assert_eq!(found.id, alice.id);
    assert!(r.find_user_by_login("carol").await.unwrap().is_none());
    assert_eq!(r.count_users().await.unwrap(), 1);
}

#[tokio::test]
async fn discussions_need_an_author_and_list_latest_first() {
    let r = InMemRepo::ephemeral();
    let err = r
        .create_discussion(NewDiscussion { title: "Orphan".into(), content: String::new(), author_id: 99 })
        .await
        .unwrap_err();
    assert!(matches!(err, RepoError::NotFound));

    let author = r.create_user(new_user("alice")).await.unwrap();
    for title in ["first", "second", "third"] {
        r.create_discussion(NewDiscussion { title: title.into(), content: String::new(), author_id: author.id })
            .await
            .unwrap();
    }

    let page = r.list_discussions(2, 0).await.unwrap();
    let titles: Vec<_> = page.iter().map(|d| d.title.as_str()).collect();
    assert_eq!(titles, ["third", "second"]);
    let rest = r.list_discussions(2, 2).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert!(matches!(r.get_discussion(12345).await.unwrap_err(), RepoError::NotFound));
}

#[tokio::test]
async fn migrations_track_what_ran_and_reset_clears_everything() {
    let r = InMemRepo::ephemeral();
    assert_eq!(r.pending_migrations().await.unwrap().len(), MIGRATIONS.len());

    let ran = r.migrate().await.unwrap();
    assert_eq!(ran.first().map(String::as_str), Some("create settings table"));
    assert!(r.pending_migrations().await.unwrap().is_empty());
    assert!(r.migrate().await.unwrap().is_empty());

    r.set_setting("forum_title", "Ember").await.unwrap();
    r.reset().await.unwrap();
    assert!(r.all_settings().await.unwrap().is_empty());
    assert_eq!(r.pending_migrations().await.unwrap().len(), MIGRATIONS.len());
}

#[tokio::test]
async fn snapshot_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    {
        let r = InMemRepo::open(&path);
        r.migrate().await.unwrap();
        r.set_setting("forum_title", "Persisted").await.unwrap();
        r.create_user(new_user("alice")).await.unwrap();
    }

    let r = InMemRepo::open(&path);
    assert!(r.pending_migrations().await.unwrap().is_empty());
    assert_eq!(r.all_settings().await.unwrap().get("forum_title").map(String::as_str), Some("Persisted"));
    // ids keep counting after a reopen
    let bob = r.create_user(new_user("bob")).await.unwrap();
    assert_eq!(bob.id, 2);
}

#[tokio::test]
async fn token_purge_keeps_tokens_at_the_cutoff() {
    let r = InMemRepo::ephemeral();
    let now = Utc::now();
    let token = |id: &str, age_hours: i64| RegistrationToken {
        id: id.into(),
        provider: "github".into(),
        identifier: id.into(),
        user_attributes: Map::new(),
        payload: Value::Null,
        created_at: now - Duration::hours(age_hours),
    };
    r.save_registration_token(token("old", 30)).await.unwrap();
    r.save_registration_token(token("edge", 24)).await.unwrap();
    r.save_registration_token(token("fresh", 1)).await.unwrap();
    assert!(matches!(r.save_registration_token(token("fresh", 2)).await.unwrap_err(), RepoError::Conflict));

    let purged = r.purge_registration_tokens(now - Duration::hours(24)).await.unwrap();
    assert_eq!(purged, 1);
    assert!(r.find_registration_token("edge").await.unwrap().is_some());
    assert!(r.find_registration_token("old").await.unwrap().is_none());
}

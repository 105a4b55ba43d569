mod common;

use axum::http::{Method, StatusCode};
use branchchat::db::conversations::NewConversation;
use branchchat::db::messages::NewMessage;
use branchchat::db::models::Role;
use branchchat::db::shares::NewShare;
use branchchat::db::{format_timestamp, MAIN_BRANCH};
use chrono::{Duration, Utc};
use common::TestApp;
use serde_json::json;

fn seed(app: &TestApp) -> String {
    let conversation = app
        .state
        .db
        .create_conversation(
            "alice",
            NewConversation {
                title: "Shared chat".into(),
                model: "openai/gpt-4o".into(),
                ..Default::default()
            },
        )
        .unwrap();
    for (role, content) in [(Role::User, "question"), (Role::Assistant, "answer")] {
        app.state
            .db
            .add_message(
                "alice",
                NewMessage::new(&conversation.id, MAIN_BRANCH, role, content),
            )
            .unwrap();
    }
    conversation.id
}

#[tokio::test]
async fn test_public_view_shows_only_the_shared_branch() {
    let app = TestApp::new();
    let token = app.login("alice");
    let conversation_id = seed(&app);
    let base = format!("/api/conversations/{}", conversation_id);

    app.post(
        &format!("{}/branches", base),
        &token,
        json!({"branch_name": "alt", "up_to_index": 0}),
    )
    .await;
    app.state
        .db
        .add_message(
            "alice",
            NewMessage::new(&conversation_id, "alt", Role::User, "alt question"),
        )
        .unwrap();

    let created = app
        .post(&format!("{}/shares", base), &token, json!({"branch_name": "main"}))
        .await;
    assert_eq!(created.status, StatusCode::CREATED);
    let share = created.json();
    let share_token = share["token"].as_str().unwrap().to_string();
    assert_eq!(share_token.len(), 32);
    assert!(share_token.chars().all(|c| c.is_ascii_alphanumeric()));
    assert_eq!(
        share["url"],
        format!("http://localhost:3000/shared/{}", share_token)
    );
    assert!(share.get("user_id").is_none());

    let conversation = app.get(&base, &token).await.json();
    assert_eq!(conversation["is_shared"], true);

    let public = app
        .request(Method::GET, &format!("/api/shared/{}", share_token), None, None)
        .await;
    assert_eq!(public.status, StatusCode::OK);
    let transcript = public.json();
    assert_eq!(transcript["title"], "Shared chat");
    assert_eq!(transcript["branch_name"], "main");
    let contents: Vec<&str> = transcript["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["content"].as_str().unwrap())
        .collect();
    assert_eq!(contents, vec!["question", "answer"]);
}

#[tokio::test]
async fn test_sharing_the_same_branch_reuses_the_token() {
    let app = TestApp::new();
    let token = app.login("alice");
    let conversation_id = seed(&app);
    let uri = format!("/api/conversations/{}/shares", conversation_id);

    let first = app.post(&uri, &token, json!({})).await.json();
    let second = app
        .post(&uri, &token, json!({"expires_in_hours": 24}))
        .await
        .json();
    assert_eq!(first["token"], second["token"]);
    assert!(second["expires_at"].is_string());

    let listed = app.get(&uri, &token).await.json();
    assert_eq!(listed.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_expired_share_returns_gone() {
    let app = TestApp::new();
    let conversation_id = seed(&app);
    let share = app
        .state
        .db
        .create_share(
            "alice",
            NewShare {
                conversation_id,
                branch_name: MAIN_BRANCH.into(),
                expires_at: Some(format_timestamp(Utc::now() - Duration::hours(1))),
            },
        )
        .unwrap();

    let response = app
        .request(Method::GET, &format!("/api/shared/{}", share.token), None, None)
        .await;
    assert_eq!(response.status, StatusCode::GONE);
    assert_eq!(response.json(), json!({"error": "expired"}));
    assert!(!response.text().contains("question"));
}

#[tokio::test]
async fn test_unknown_share_token_is_not_found() {
    let app = TestApp::new();
    let response = app
        .request(Method::GET, "/api/shared/doesnotexist", None, None)
        .await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_revoking_last_share_clears_flag() {
    let app = TestApp::new();
    let token = app.login("alice");
    let conversation_id = seed(&app);
    let base = format!("/api/conversations/{}", conversation_id);

    let share = app
        .post(&format!("{}/shares", base), &token, json!({}))
        .await
        .json();
    let share_id = share["id"].as_str().unwrap();

    let revoked = app
        .delete(&format!("{}/shares/{}", base, share_id), &token)
        .await;
    assert_eq!(revoked.status, StatusCode::NO_CONTENT);
    assert_eq!(app.get(&base, &token).await.json()["is_shared"], false);

    let public = app
        .request(
            Method::GET,
            &format!("/api/shared/{}", share["token"].as_str().unwrap()),
            None,
            None,
        )
        .await;
    assert_eq!(public.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_view_counter_increments_in_background() {
    let app = TestApp::new();
    let token = app.login("alice");
    let conversation_id = seed(&app);
    let share = app
        .post(
            &format!("/api/conversations/{}/shares", conversation_id),
            &token,
            json!({}),
        )
        .await
        .json();
    let uri = format!("/api/shared/{}", share["token"].as_str().unwrap());

    app.request(Method::GET, &uri, None, None).await;
    let mut views = 0;
    for _ in 0..50 {
        views = app.state.db.resolve_share(share["token"].as_str().unwrap()).unwrap().view_count;
        if views >= 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(views, 1);
}

#[tokio::test]
async fn test_out_of_range_expiry_is_rejected() {
    let app = TestApp::new();
    let token = app.login("alice");
    let conversation_id = seed(&app);

    let response = app
        .post(
            &format!("/api/conversations/{}/shares", conversation_id),
            &token,
            json!({"expires_in_hours": 9_000_000_000_000i64}),
        )
        .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.json()["details"][0]["field"], "expires_in_hours");
    assert!(app.state.db.list_shares("alice", &conversation_id).unwrap().is_empty());
}

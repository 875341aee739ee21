//! End-to-end tests for the session commands against a mock backend.

use std::fs;
use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use serde_json::json;
use tempfile::tempdir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ANON: &str = "anon-key";

fn can_bind_localhost() -> bool {
    std::net::TcpListener::bind("127.0.0.1:0").is_ok()
}

fn kinship(home: &Path, server: &MockServer) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("kinship");
    cmd.env("KINSHIP_HOME", home)
        .env("KINSHIP_BACKEND_URL", server.uri())
        .env("KINSHIP_ANON_KEY", ANON)
        .env("KINSHIP_NO_BROWSER", "1")
        .env_remove("KINSHIP_PASSWORD");
    cmd
}

fn session_json() -> serde_json::Value {
    json!({
        "access_token": "at-1",
        "refresh_token": "rt-1",
        "token_type": "bearer",
        "expires_in": 3600,
        "user": {
            "id": "u-1",
            "email": "ada@example.com",
            "user_metadata": { "full_name": "Ada" }
        }
    })
}

async fn mount_password_grant(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/auth/v1/token"))
        .and(query_param("grant_type", "password"))
        .respond_with(ResponseTemplate::new(200).set_body_json(session_json()))
        .mount(server)
        .await;
}

async fn mount_missing_profile(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/rest/v1/profiles"))
        .respond_with(ResponseTemplate::new(406).set_body_json(json!({
            "code": "PGRST116",
            "message": "JSON object requested, multiple (or no) rows returned"
        })))
        .mount(server)
        .await;
}

async fn mount_completed_profile(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/rest/v1/profiles"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "is_profile_completed": true,
            "profile_skipped": false
        })))
        .mount(server)
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_login_then_status_reads_persisted_session() {
    if !can_bind_localhost() {
        eprintln!("Skipping: cannot bind localhost TCP port in this environment.");
        return;
    }
    let server = MockServer::start().await;
    mount_password_grant(&server).await;
    mount_missing_profile(&server).await;
    let home = tempdir().unwrap();

    kinship(home.path(), &server)
        .args(["login", "--email", "ada@example.com", "--password", "secret1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("✓ Signed in as ada@example.com"))
        .stdout(predicate::str::contains("Profile incomplete"));

    let storage = fs::read_to_string(home.path().join("storage.json")).unwrap();
    assert!(storage.contains("kinship.auth.token"));
    assert!(storage.contains("auth_user_id"));

    kinship(home.path(), &server)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Signed in as ada@example.com (u-1)"))
        .stdout(predicate::str::contains("Profile: incomplete"))
        .stdout(predicate::str::contains("Next route: /complete-profile"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_status_json_for_completed_profile() {
    if !can_bind_localhost() {
        eprintln!("Skipping: cannot bind localhost TCP port in this environment.");
        return;
    }
    let server = MockServer::start().await;
    mount_password_grant(&server).await;
    mount_completed_profile(&server).await;
    let home = tempdir().unwrap();

    kinship(home.path(), &server)
        .env("KINSHIP_PASSWORD", "secret1")
        .args(["login", "--email", "ada@example.com"])
        .assert()
        .success();

    let output = kinship(home.path(), &server)
        .args(["status", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let body: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(body["authenticated"], true);
    assert_eq!(body["user_id"], "u-1");
    assert_eq!(body["profile_completed"], true);
    assert_eq!(body["phase"], "authenticated");
    assert_eq!(body["next_route"], "/home");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_status_when_signed_out() {
    if !can_bind_localhost() {
        eprintln!("Skipping: cannot bind localhost TCP port in this environment.");
        return;
    }
    let server = MockServer::start().await;
    let home = tempdir().unwrap();

    kinship(home.path(), &server)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Not signed in."));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_login_with_bad_credentials_fails() {
    if !can_bind_localhost() {
        eprintln!("Skipping: cannot bind localhost TCP port in this environment.");
        return;
    }
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/v1/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error_code": "invalid_credentials",
            "msg": "Invalid login credentials"
        })))
        .mount(&server)
        .await;
    let home = tempdir().unwrap();

    kinship(home.path(), &server)
        .args(["login", "--email", "ada@example.com", "--password", "wrong"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid login credentials"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_logout_revokes_and_clears_storage() {
    if !can_bind_localhost() {
        eprintln!("Skipping: cannot bind localhost TCP port in this environment.");
        return;
    }
    let server = MockServer::start().await;
    mount_password_grant(&server).await;
    mount_completed_profile(&server).await;
    Mock::given(method("POST"))
        .and(path("/auth/v1/logout"))
        .and(query_param("scope", "global"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    let home = tempdir().unwrap();

    kinship(home.path(), &server)
        .args(["login", "--email", "ada@example.com", "--password", "secret1"])
        .assert()
        .success();

    kinship(home.path(), &server)
        .arg("logout")
        .assert()
        .success()
        .stdout(predicate::str::contains("✓ Signed out"))
        .stdout(predicate::str::contains("Redirect: /"));

    let storage = fs::read_to_string(home.path().join("storage.json")).unwrap();
    assert!(!storage.contains("kinship.auth.token"));
    assert!(!storage.contains("auth_user_id"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_google_prints_authorization_url() {
    if !can_bind_localhost() {
        eprintln!("Skipping: cannot bind localhost TCP port in this environment.");
        return;
    }
    let server = MockServer::start().await;
    let home = tempdir().unwrap();

    kinship(home.path(), &server)
        .arg("google")
        .assert()
        .success()
        .stdout(predicate::str::contains("Authorization URL:"))
        .stdout(predicate::str::contains("/auth/v1/authorize?provider=google"))
        .stdout(predicate::str::contains("access_type=offline"))
        .stdout(predicate::str::contains("prompt=consent"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_callback_with_provider_error_fails() {
    if !can_bind_localhost() {
        eprintln!("Skipping: cannot bind localhost TCP port in this environment.");
        return;
    }
    let server = MockServer::start().await;
    let home = tempdir().unwrap();

    kinship(home.path(), &server)
        .args([
            "callback",
            "http://localhost:5173/auth/callback#error=access_denied&error_description=User+denied+access",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Sign-in failed: User denied access"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reset_password_sends_recovery_email() {
    if !can_bind_localhost() {
        eprintln!("Skipping: cannot bind localhost TCP port in this environment.");
        return;
    }
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/v1/recover"))
        .and(query_param(
            "redirect_to",
            "http://localhost:5173/reset-password",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;
    let home = tempdir().unwrap();

    kinship(home.path(), &server)
        .args(["reset-password", "--email", "ada@example.com"])
        .assert()
        .success()
        .stdout(predicate::str::contains("✓ Recovery email sent to ada@example.com"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_password_requires_sign_in() {
    if !can_bind_localhost() {
        eprintln!("Skipping: cannot bind localhost TCP port in this environment.");
        return;
    }
    let server = MockServer::start().await;
    let home = tempdir().unwrap();

    kinship(home.path(), &server)
        .args(["password", "--password", "new-secret"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Not signed in"));
}

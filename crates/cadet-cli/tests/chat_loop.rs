//! End-to-end chat runs against a stand-in Gemini server.


use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use fixtures::{can_bind_localhost, function_call_response, generate_path, text_response};
use predicates::prelude::*;
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request};

const MODEL: &str = "gemini-test";

/// A chat command isolated from the host: temp home, no GitHub, no MCP.
fn chat_cmd(home: &TempDir, root: &TempDir, base_url: &str) -> Command {
    let mut cmd = cargo_bin_cmd!("cadet");
    cmd.current_dir(root.path())
        .env("CADET_HOME", home.path())
        .env("GOOGLE_API_KEY", "test-key")
        .env("GEMINI_BASE_URL", base_url)
        .env_remove("GITHUB_TOKEN")
        .env_remove("CADET_LOG")
        .args([
            "--root",
            root.path().to_str().unwrap(),
            "--model",
            MODEL,
            "--no-mcp",
        ]);
    cmd
}

#[test]
fn test_missing_api_key_is_fatal() {
    let home = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();

    cargo_bin_cmd!("cadet")
        .current_dir(root.path())
        .env("CADET_HOME", home.path())
        .env_remove("GOOGLE_API_KEY")
        .write_stdin("hi\nexit\n")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("GOOGLE_API_KEY is not set"));
}

#[tokio::test]
async fn test_text_answer_is_numbered_and_saved() {
    if !can_bind_localhost() {
        eprintln!("Skipping: cannot bind localhost TCP port in this environment.");
        return;
    }
    let home = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(generate_path(MODEL)))
        .and(header("x-goog-api-key", "test-key"))
        .respond_with(text_response("Next steps:\n- Run the tests\n- Read the docs"))
        .expect(1)
        .mount(&server)
        .await;

    chat_cmd(&home, &root, &server.uri())
        .write_stdin("hi\nexit\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("Quick start:"))
        .stdout(predicate::str::contains("**1.** Run the tests"))
        .stdout(predicate::str::contains("**2.** Read the docs"))
        .stdout(predicate::str::contains("Goodbye!"));

    cargo_bin_cmd!("cadet")
        .env("CADET_HOME", home.path())
        .args(["checkpoints", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("default_session  3 messages"));
}

#[tokio::test]
async fn test_tool_call_result_reaches_model() {
    if !can_bind_localhost() {
        eprintln!("Skipping: cannot bind localhost TCP port in this environment.");
        return;
    }
    let home = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    std::fs::write(root.path().join("marker.txt"), "marker content").unwrap();
    let server = MockServer::start().await;

    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = Arc::clone(&calls);
    let second_body = Arc::new(Mutex::new(String::new()));
    let second_body_clone = Arc::clone(&second_body);

    Mock::given(method("POST"))
        .and(path(generate_path(MODEL)))
        .respond_with(move |req: &Request| {
            if calls_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                function_call_response("list_files", json!({"path": "."}))
            } else {
                *second_body_clone.lock().unwrap() = String::from_utf8_lossy(&req.body).to_string();
                text_response("Found marker.txt")
            }
        })
        .expect(2)
        .mount(&server)
        .await;

    chat_cmd(&home, &root, &server.uri())
        .write_stdin("list the files\nexit\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("Found marker.txt"))
        .stderr(predicate::str::contains("Running list_files"));

    let body = second_body.lock().unwrap().clone();
    assert!(body.contains("functionResponse"), "body: {body}");
    assert!(body.contains("marker.txt"), "body: {body}");
}

#[tokio::test]
async fn test_number_selects_quick_start_option() {
    if !can_bind_localhost() {
        eprintln!("Skipping: cannot bind localhost TCP port in this environment.");
        return;
    }
    let home = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    let server = MockServer::start().await;

    let body = Arc::new(Mutex::new(String::new()));
    let body_clone = Arc::clone(&body);
    Mock::given(method("POST"))
        .and(path(generate_path(MODEL)))
        .respond_with(move |req: &Request| {
            *body_clone.lock().unwrap() = String::from_utf8_lossy(&req.body).to_string();
            text_response("ok")
        })
        .expect(1)
        .mount(&server)
        .await;

    chat_cmd(&home, &root, &server.uri())
        .write_stdin("1\nquit\n")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Selected: List all files in current directory",
        ));

    assert!(body.lock().unwrap().contains("List all files in current directory"));
}

#[tokio::test]
async fn test_backend_failure_keeps_session_alive() {
    if !can_bind_localhost() {
        eprintln!("Skipping: cannot bind localhost TCP port in this environment.");
        return;
    }
    let home = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(generate_path(MODEL)))
        .respond_with(wiremock::ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    chat_cmd(&home, &root, &server.uri())
        .write_stdin("hi\ntools\nexit\n")
        .assert()
        .success()
        .stderr(predicate::str::contains("Error [protocol]"))
        .stdout(predicate::str::contains("Local (4):"))
        .stdout(predicate::str::contains("Goodbye!"));

    cargo_bin_cmd!("cadet")
        .env("CADET_HOME", home.path())
        .args(["checkpoints", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No checkpoints found."));
}

#[test]
fn test_end_of_input_says_goodbye() {
    let home = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();

    // No request is made, so the base URL is never contacted.
    chat_cmd(&home, &root, "http://127.0.0.1:9")
        .write_stdin("help\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("exit, quit, q"))
        .stdout(predicate::str::contains("Goodbye!"));
}

//! HTTP surface, served on an ephemeral port.

mod common;

use common::*;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;

use contract_lens::cache::Cache;
use contract_lens::server;

async fn serve(h: &Harness) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = server::router(h.app.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

fn file_form(bytes: Vec<u8>, filename: &str, mime: &str) -> Form {
    Form::new().part(
        "file",
        Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str(mime)
            .unwrap(),
    )
}

fn scripted() -> ScriptedProvider {
    ScriptedProvider::new("openrouter")
        .on("validation", VALID_VERDICT)
        .on("contract_analysis", ANALYSIS)
        .on(
            "element_detection",
            r#"{"elements": [{"element": "payment_terms", "present": true, "confidence": 0.9}], "confidence": 0.85}"#,
        )
}

#[tokio::test]
async fn upload_requires_actor() {
    let h = harness(scripted());
    let base = serve(&h).await;
    let resp = reqwest::Client::new()
        .post(format!("{}/contracts/upload", base))
        .multipart(file_form(contract_text().into_bytes(), "c.txt", "text/plain"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "unauthenticated");
}

#[tokio::test]
async fn unsupported_and_oversize_uploads_are_400() {
    let h = harness(scripted());
    let base = serve(&h).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/contracts/upload", base))
        .header("X-User-ID", "alice")
        .multipart(file_form(b"MZ\x90\x00".to_vec(), "test.exe", "application/x-msdownload"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "unsupported_type");

    let mut big = b"%PDF-1.4\n".to_vec();
    big.resize(12 * 1024 * 1024, b' ');
    let resp = client
        .post(format!("{}/contracts/upload", base))
        .header("X-User-ID", "alice")
        .multipart(file_form(big, "big.pdf", "application/pdf"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "too_large");

    let resp = client
        .post(format!("{}/contracts/upload", base))
        .header("X-User-ID", "alice")
        .multipart(Form::new().text("note", "no file here"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    assert_eq!(h.llm.total_calls(), 0);
    assert_eq!(h.blob_count(), 0);
}

#[tokio::test]
async fn body_over_the_request_limit_is_too_large() {
    let h = harness_with(scripted(), |c| c.pipeline.max_file_size = 1024);
    let base = serve(&h).await;

    // Past twice the file limit plus the multipart allowance.
    let mut bytes = b"%PDF-1.4\n".to_vec();
    bytes.resize(1024 * 1024 + 16 * 1024, b' ');
    let resp = reqwest::Client::new()
        .post(format!("{}/contracts/upload", base))
        .header("X-User-ID", "alice")
        .multipart(file_form(bytes, "big.pdf", "application/pdf"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "too_large");
    assert_eq!(h.blob_count(), 0);
}

#[tokio::test]
async fn upload_analyze_then_read_and_delete() {
    let h = harness(scripted());
    let base = serve(&h).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/contracts/upload-analyze", base))
        .header("X-User-ID", "alice")
        .multipart(file_form(contract_text().into_bytes(), "supply.txt", "text/plain"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "analyzed");
    let id = body["document_id"].as_str().unwrap().to_string();
    assert!(body["validation_id"].is_string());

    let resp = client
        .get(format!("{}/contracts/{}", base, id))
        .header("X-User-ID", "alice")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let record: Value = resp.json().await.unwrap();
    assert_eq!(record["owner_id"], "alice");

    let resp = client
        .get(format!("{}/contracts/{}", base, id))
        .header("X-User-ID", "mallory")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let fields: Value = client
        .get(format!("{}/contracts/{}/analysis", base, id))
        .header("X-User-ID", "alice")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fields["contract_id"], id.as_str());
    assert_eq!(fields["contract_name"], "Supply Agreement");
    assert_eq!(fields["parties_involved"][1], "Widget GmbH");
    assert_eq!(fields["effective_date"], "2024-01-01");

    let resp = client
        .get(format!("{}/contracts/{}/elements", base, id))
        .header("X-User-ID", "alice")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = client
        .delete(format!("{}/contracts/{}", base, id))
        .header("X-User-ID", "alice")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert_eq!(h.blob_count(), 0);

    let resp = client
        .get(format!("{}/contracts/{}", base, id))
        .header("X-User-ID", "alice")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn ephemeral_analysis_stores_nothing() {
    let h = harness(scripted());
    let base = serve(&h).await;
    let resp = reqwest::Client::new()
        .post(format!("{}/contracts/analyze", base))
        .header("X-User-ID", "alice")
        .multipart(file_form(contract_text().into_bytes(), "supply.txt", "text/plain"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["analysis"]["summary"]["currency"], "USD");
    assert_eq!(h.blob_count(), 0);
}

#[tokio::test]
async fn feedback_updates_confidence_and_audit() {
    let h = harness(scripted());
    let base = serve(&h).await;
    let client = reqwest::Client::new();

    let body: Value = client
        .post(format!("{}/contracts/upload-analyze", base))
        .header("X-User-ID", "alice")
        .multipart(file_form(contract_text().into_bytes(), "supply.txt", "text/plain"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let validation_id = body["validation_id"].as_str().unwrap().to_string();

    let resp = client
        .post(format!("{}/validations/{}/feedback", base, validation_id))
        .header("X-User-ID", "bob")
        .json(&serde_json::json!({"feedback_type": "accuracy", "rating": 1, "comment": "wrong parties"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = client
        .post(format!("{}/validations/{}/feedback", base, validation_id))
        .header("X-User-ID", "bob")
        .json(&serde_json::json!({"feedback_type": "accuracy", "rating": 9}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let trail: Vec<Value> = client
        .get(format!("{}/validations/{}/audit", base, validation_id))
        .header("X-User-ID", "alice")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let actions: Vec<&str> = trail.iter().filter_map(|e| e["action"].as_str()).collect();
    assert_eq!(actions, vec!["created", "feedback_added", "confidence_updated"]);
}

#[tokio::test]
async fn knowledge_roundtrip_and_operational_routes() {
    let h = harness(scripted());
    let base = serve(&h).await;
    let client = reqwest::Client::new();
    h.cache
        .set_with_ttl("knowledge:construction", "stale", Duration::from_secs(3600))
        .await
        .unwrap();

    let resp = client
        .post(format!("{}/knowledge", base))
        .header("X-User-ID", "admin")
        .json(&serde_json::json!({
            "title": "Retainage",
            "content": "Withhold 5-10% until completion.",
            "category": "construction",
            "tags": ["payment"]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let entry: Value = resp.json().await.unwrap();
    assert_eq!(entry["version"], 1);
    assert!(h.cache.get("knowledge:construction").await.unwrap().is_none());

    let listed: Value = client
        .get(format!("{}/knowledge?category=construction", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed["entries"].as_array().unwrap().len(), 1);

    let searched: Value = client
        .get(format!("{}/knowledge?q=retainage", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(searched["entries"][0]["title"], "Retainage");

    let health: Value = client
        .get(format!("{}/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");

    let resp = client.get(format!("{}/ready", base)).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = client.get(format!("{}/metrics", base)).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
}

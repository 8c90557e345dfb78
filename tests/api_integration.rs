//! End-to-end tests against an in-process API server with embedded workers.

use async_trait::async_trait;
use kbhub::config::Config;
use kbhub::error::Result as KbResult;
use kbhub::llm::{LanguageBackend, LlmRouter};
use kbhub::server::{run_server, ServerOptions};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct CannedBackend;

#[async_trait]
impl LanguageBackend for CannedBackend {
    fn name(&self) -> &str {
        "canned"
    }
    fn model(&self) -> &str {
        "canned-1"
    }
    async fn generate(&self, prompt: &str) -> KbResult<String> {
        Ok(format!("answered from {} prompt bytes", prompt.len()))
    }
}

fn test_config(tmp: &TempDir, port: u16) -> Config {
    let root = tmp.path();
    let config_content = format!(
        r#"
[db]
path = "{}/kbhub.sqlite"

[storage]
data_dir = "{}/data"

[server]
bind = "127.0.0.1:{}"

[worker]
poll_interval_ms = 50

[retrieval]
max_search_top_k = 10
"#,
        root.display(),
        root.display(),
        port
    );
    toml::from_str(&config_content).unwrap()
}

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for_server(port: u16) {
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/health", port);
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                return;
            }
        }
    }
    panic!("Server did not become ready within 5 seconds");
}

struct TestServer {
    _tmp: TempDir,
    base: String,
    client: reqwest::Client,
}

impl TestServer {
    async fn start() -> Self {
        let tmp = TempDir::new().unwrap();
        let port = find_free_port();
        let cfg = test_config(&tmp, port);
        let options = ServerOptions {
            workers: 2,
            llm: Some(LlmRouter::fixed(Arc::new(CannedBackend))),
        };
        tokio::spawn(async move {
            run_server(&cfg, options).await.unwrap();
        });
        wait_for_server(port).await;
        Self {
            _tmp: tmp,
            base: format!("http://127.0.0.1:{}", port),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn create_project(&self, name: &str) -> String {
        let resp = self
            .client
            .post(self.url("/projects"))
            .json(&json!({ "name": name }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let body: Value = resp.json().await.unwrap();
        body["id"].as_str().unwrap().to_string()
    }

    async fn submit(&self, path: &str, body: Value) -> String {
        let resp = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202, "submit {} failed", path);
        let accepted: Value = resp.json().await.unwrap();
        assert_eq!(accepted["status"], "queued");
        accepted["job_id"].as_str().unwrap().to_string()
    }

    /// Poll until the job leaves queued/started.
    async fn wait_job(&self, job_id: &str) -> Value {
        for _ in 0..200 {
            let job: Value = self
                .client
                .get(self.url(&format!("/jobs/{}", job_id)))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            match job["status"].as_str() {
                Some("finished") | Some("failed") => return job,
                _ => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
        panic!("job {} did not finish within 10 seconds", job_id);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_health_and_root() {
    let server = TestServer::start().await;

    let health: Value = server
        .client
        .get(server.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["projects"], 0);

    let root = server.client.get(server.url("/")).send().await.unwrap();
    assert!(root.status().is_success());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_project_crud() {
    let server = TestServer::start().await;
    let id = server.create_project("handbook").await;

    let list: Value = server
        .client
        .get(server.url("/projects"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["id"], id.as_str());
    assert_eq!(list[0]["config"]["chunk_size"], 512);

    let updated: Value = server
        .client
        .put(server.url(&format!("/projects/{}", id)))
        .json(&json!({ "description": "ops notes" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(updated["name"], "handbook");
    assert_eq!(updated["description"], "ops notes");

    let stats: Value = server
        .client
        .get(server.url(&format!("/projects/{}/stats", id)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["total_chunks"], 0);

    let del = server
        .client
        .delete(server.url(&format!("/projects/{}", id)))
        .send()
        .await
        .unwrap();
    assert_eq!(del.status(), 200);

    let gone = server
        .client
        .get(server.url(&format!("/projects/{}", id)))
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), 404);
    let body: Value = gone.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");

    let again = server
        .client
        .delete(server.url(&format!("/projects/{}", id)))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), 404);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_create_project_rejects_blank_name() {
    let server = TestServer::start().await;
    let resp = server
        .client
        .post(server.url("/projects"))
        .json(&json!({ "name": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "validation_error");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_index_text_is_additive_then_search_and_chat() {
    let server = TestServer::start().await;
    let id = server.create_project("rust").await;

    let first = server
        .submit(
            &format!("/projects/{}/index/text/async", id),
            json!({ "text": "Rust ownership rules prevent data races at compile time." }),
        )
        .await;
    let job = server.wait_job(&first).await;
    assert_eq!(job["status"], "finished", "job: {}", job);
    assert_eq!(job["queue"], "indexing");
    let first_total = job["result"]["total_chunks"].as_u64().unwrap();
    assert!(first_total >= 1);

    let second = server
        .submit(
            &format!("/projects/{}/index/text/async", id),
            json!({ "text": "Cargo builds crates and resolves dependencies." }),
        )
        .await;
    let job = server.wait_job(&second).await;
    assert_eq!(job["status"], "finished");
    let added = job["result"]["chunks_added"].as_u64().unwrap();
    assert_eq!(job["result"]["total_chunks"].as_u64().unwrap(), first_total + added);

    let search = server
        .submit(
            &format!("/projects/{}/search/async", id),
            json!({ "query": "ownership", "top_k": 3 }),
        )
        .await;
    let job = server.wait_job(&search).await;
    assert_eq!(job["status"], "finished", "job: {}", job);
    assert_eq!(job["queue"], "chat");
    let results = job["result"]["results"].as_array().unwrap();
    assert!(!results.is_empty());
    assert!(results.len() <= 3);
    assert!(results[0]["text"].as_str().unwrap().contains("ownership"));

    let chat = server
        .submit(
            &format!("/projects/{}/chat/async", id),
            json!({ "query": "What do ownership rules prevent?", "top_k": 1 }),
        )
        .await;
    let job = server.wait_job(&chat).await;
    assert_eq!(job["status"], "finished", "job: {}", job);
    let result = &job["result"];
    assert_eq!(result["backend"], "canned");
    assert!(result["context_chunks"].as_u64().unwrap() <= 1);
    assert!(result["answer"].as_str().unwrap().starts_with("answered from"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_search_before_indexing_fails_not_indexed() {
    let server = TestServer::start().await;
    let id = server.create_project("empty").await;

    let job_id = server
        .submit(
            &format!("/projects/{}/search/async", id),
            json!({ "query": "anything" }),
        )
        .await;
    let job = server.wait_job(&job_id).await;
    assert_eq!(job["status"], "failed");
    assert_eq!(job["error"]["kind"], "not_indexed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_folder_with_corrupt_pdf_indexes_remaining_files() {
    let server = TestServer::start().await;
    let id = server.create_project("folder").await;

    let docs = TempDir::new().unwrap();
    std::fs::write(
        docs.path().join("notes.txt"),
        "Deployment uses blue green rollouts.",
    )
    .unwrap();
    std::fs::write(docs.path().join("broken.pdf"), b"not really a pdf").unwrap();

    let job_id = server
        .submit(
            &format!("/projects/{}/index/folder/async", id),
            json!({ "folder_path": docs.path(), "file_extensions": [".txt", ".pdf"] }),
        )
        .await;
    let job = server.wait_job(&job_id).await;
    assert_eq!(job["status"], "finished", "job: {}", job);
    assert_eq!(job["result"]["files_indexed"], 1);
    assert_eq!(job["result"]["files_skipped"].as_array().unwrap().len(), 1);

    let project: Value = server
        .client
        .get(server.url(&format!("/projects/{}", id)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(project["files_count"], 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_folder_missing_is_rejected_at_submission() {
    let server = TestServer::start().await;
    let id = server.create_project("folder").await;

    let resp = server
        .client
        .post(server.url(&format!("/projects/{}/index/folder/async", id)))
        .json(&json!({ "folder_path": "/definitely/not/here" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_file_upload_and_reset() {
    let server = TestServer::start().await;
    let id = server.create_project("uploads").await;

    let part = reqwest::multipart::Part::bytes(b"Incident runbook: page the on-call.".to_vec())
        .file_name("runbook.md");
    let form = reqwest::multipart::Form::new().part("file", part);
    let resp = server
        .client
        .post(server.url(&format!("/projects/{}/index/file/async", id)))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let accepted: Value = resp.json().await.unwrap();
    let job = server.wait_job(accepted["job_id"].as_str().unwrap()).await;
    assert_eq!(job["status"], "finished", "job: {}", job);
    assert_eq!(job["result"]["filename"], "runbook.md");

    let stats: Value = server
        .client
        .get(server.url(&format!("/projects/{}/stats", id)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["files_count"], 1);
    assert!(stats["total_chunks"].as_u64().unwrap() >= 1);

    let reset = server
        .submit(&format!("/projects/{}/reset/async", id), json!({}))
        .await;
    let job = server.wait_job(&reset).await;
    assert_eq!(job["status"], "finished");
    assert_eq!(job["queue"], "default");

    let stats: Value = server
        .client
        .get(server.url(&format!("/projects/{}/stats", id)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["total_chunks"], 0);
    assert_eq!(stats["storage_size"], 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_upload_with_disallowed_extension_is_rejected() {
    let server = TestServer::start().await;
    let id = server.create_project("uploads").await;

    let part = reqwest::multipart::Part::bytes(b"MZ".to_vec()).file_name("tool.exe");
    let form = reqwest::multipart::Form::new().part("file", part);
    let resp = server
        .client
        .post(server.url(&format!("/projects/{}/index/file/async", id)))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "unsupported_format");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_submission_validation() {
    let server = TestServer::start().await;
    let id = server.create_project("limits").await;

    let resp = server
        .client
        .post(server.url(&format!("/projects/{}/search/async", id)))
        .json(&json!({ "query": "x", "top_k": 11 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = server
        .client
        .post(server.url(&format!("/projects/{}/chat/async", id)))
        .json(&json!({ "query": "x", "model_params": { "temperature": 3.5 } }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = server
        .client
        .post(server.url("/projects/no-such-project/index/text/async"))
        .json(&json!({ "text": "hello" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = server
        .client
        .post(server.url(&format!("/projects/{}/index/text/async", id)))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_jobs_listing_and_unknown_job() {
    let server = TestServer::start().await;
    let id = server.create_project("jobs").await;

    let job_id = server
        .submit(
            &format!("/projects/{}/index/text/async", id),
            json!({ "text": "queue me" }),
        )
        .await;
    server.wait_job(&job_id).await;

    let list: Value = server
        .client
        .get(server.url("/jobs?status=finished&limit=10"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(list["jobs"]
        .as_array()
        .unwrap()
        .iter()
        .any(|j| j["id"] == job_id.as_str()));

    let bad = server
        .client
        .get(server.url("/jobs?status=sleeping"))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), 400);

    // Empty status is no filter
    let unfiltered = server
        .client
        .get(server.url("/jobs?status=&limit=10"))
        .send()
        .await
        .unwrap();
    assert_eq!(unfiltered.status(), 200);
    let unfiltered: Value = unfiltered.json().await.unwrap();
    assert!(unfiltered["total"].as_u64().unwrap() >= 1);

    let bad_limit = server
        .client
        .get(server.url("/jobs?limit="))
        .send()
        .await
        .unwrap();
    assert_eq!(bad_limit.status(), 400);
    let body: Value = bad_limit.json().await.unwrap();
    assert_eq!(body["error"]["code"], "validation_error");

    let missing = server
        .client
        .get(server.url("/jobs/00000000-0000-0000-0000-000000000000"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_metrics_exposition() {
    let server = TestServer::start().await;
    server.create_project("observed").await;

    let resp = server.client.get(server.url("/metrics")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let text = resp.text().await.unwrap();
    assert!(text.contains("kbhub_projects_total"));
}

//! Integration tests for the supervisor HTTP API and the agent protocol.
//!
//! Each test spins up an Axum server on a random port and talks to it with
//! the crate's own client; agent tests also run the agent poll loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::timeout;

use sim_supervisor::backend::{BackendKind, Backends, LocalBackend};
use sim_supervisor::client::RunnerClient;
use sim_supervisor::config::{AgentConfig, BackendConfig};
use sim_supervisor::error::ProtocolError;
use sim_supervisor::job::store::INPUT_FILE;
use sim_supervisor::job::{JobIdentity, JobStatus, JobTracker};
use sim_supervisor::protocol::agent::spawn_agent;
use sim_supervisor::protocol::server::{ServerState, supervisor_routes};
use sim_supervisor::runner::{AgentDispatcher, LocalRunner};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(15);

fn backend_config() -> BackendConfig {
    BackendConfig {
        grace_period: Duration::from_millis(500),
        ..BackendConfig::default()
    }
}

/// Start an Axum server on a random port, return its base URL.
async fn start_server(state: ServerState) -> String {
    let app = supervisor_routes(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    format!("http://127.0.0.1:{port}")
}

async fn local_server() -> String {
    let config = backend_config();
    let backends = Backends::new().with(Arc::new(LocalBackend::new(&config)));
    let tracker = Arc::new(JobTracker::new(config.grace_period));
    start_server(ServerState::local(Arc::new(LocalRunner::new(tracker, backends)))).await
}

async fn prepare_tmp(root: &Path, name: &str, jhash: &str) -> PathBuf {
    let tmp = root.join(format!("{name}-tmp"));
    tokio::fs::create_dir_all(&tmp).await.unwrap();
    tokio::fs::write(
        tmp.join(INPUT_FILE),
        serde_json::json!({"reportParametersHash": jhash}).to_string(),
    )
    .await
    .unwrap();
    tmp
}

fn cmd(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

async fn wait_for_status(client: &RunnerClient, run_dir: &Path, jhash: &JobIdentity, want: JobStatus) {
    loop {
        if client.status(run_dir, jhash).await.unwrap() == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

// ── Local dispatch ───────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_ok() {
    timeout(TEST_TIMEOUT, async {
        let base = local_server().await;
        let body: serde_json::Value = reqwest::get(format!("{base}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn start_status_cancel_over_http() {
    timeout(TEST_TIMEOUT, async {
        let root = tempfile::tempdir().unwrap();
        let base = local_server().await;
        let client = RunnerClient::new(&base);
        let run_dir = root.path().join("job1");
        let jhash = JobIdentity::from("hash-A");

        let tmp = prepare_tmp(root.path(), "a", "hash-A").await;
        let reply = client
            .start_report_job(&run_dir, &jhash, BackendKind::Local, &cmd(&["sleep", "30"]), &tmp)
            .await
            .unwrap();
        assert_eq!(reply.state, JobStatus::Running);

        let other = JobIdentity::from("hash-Z");
        assert_eq!(client.status(&run_dir, &other).await.unwrap(), JobStatus::Missing);
        // Cancel for another identity leaves the job alone.
        client.cancel(&run_dir, &other).await.unwrap();
        assert_eq!(client.status(&run_dir, &jhash).await.unwrap(), JobStatus::Running);

        client.cancel(&run_dir, &jhash).await.unwrap();
        wait_for_status(&client, &run_dir, &jhash, JobStatus::Canceled).await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unconfigured_backend_is_bad_request() {
    timeout(TEST_TIMEOUT, async {
        let root = tempfile::tempdir().unwrap();
        let base = local_server().await;
        let client = RunnerClient::new(&base);

        let tmp = prepare_tmp(root.path(), "a", "hash-A").await;
        let err = client
            .start_report_job(
                &root.path().join("job1"),
                &JobIdentity::from("hash-A"),
                BackendKind::Batch,
                &cmd(&["render"]),
                &tmp,
            )
            .await
            .unwrap_err();
        match err {
            ProtocolError::Status { status, body } => {
                assert_eq!(status, 400);
                assert!(body.contains("batch"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn agent_endpoint_absent_in_local_mode() {
    timeout(TEST_TIMEOUT, async {
        let base = local_server().await;
        let resp = reqwest::Client::new()
            .post(format!("{base}/agent"))
            .json(&serde_json::json!({"action": "ready_for_work", "agent_id": "a1"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    })
    .await
    .expect("test timed out");
}

// ── Agent dispatch ───────────────────────────────────────────────────

fn spawn_test_agent(base: &str, agent_id: &str) -> Arc<AtomicBool> {
    let config = AgentConfig {
        agent_id: agent_id.to_string(),
        supervisor_url: base.to_string(),
        poll_interval: Duration::from_millis(25),
        backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(200),
        backends: backend_config(),
        log_dir: None,
    };
    let backends = Backends::from_config(&config.backends);
    let tracker = Arc::new(JobTracker::new(config.backends.grace_period));
    let (_handle, shutdown) = spawn_agent(config, tracker, backends);
    shutdown
}

async fn agent_setup() -> (String, Arc<AtomicBool>) {
    let base = start_server(ServerState::dispatching(Arc::new(AgentDispatcher::new()))).await;
    let shutdown = spawn_test_agent(&base, "agent-1");
    (base, shutdown)
}

#[tokio::test]
async fn agent_runs_dispatched_job_to_completion() {
    timeout(TEST_TIMEOUT, async {
        let root = tempfile::tempdir().unwrap();
        let (base, shutdown) = agent_setup().await;
        let client = RunnerClient::new(&base);
        let run_dir = root.path().join("job1");
        let jhash = JobIdentity::from("hash-A");

        let tmp = prepare_tmp(root.path(), "a", "hash-A").await;
        let reply = client
            .start_report_job(
                &run_dir,
                &jhash,
                BackendKind::Local,
                &cmd(&["sh", "-c", "sleep 0.2; echo done > out.txt"]),
                &tmp,
            )
            .await
            .unwrap();
        assert_eq!(reply.state, JobStatus::Pending);
        assert!(reply.request_id.is_some());

        wait_for_status(&client, &run_dir, &jhash, JobStatus::Completed).await;
        assert!(run_dir.join("out.txt").exists());

        shutdown.store(true, Ordering::Relaxed);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn agent_cancels_dispatched_job() {
    timeout(TEST_TIMEOUT, async {
        let root = tempfile::tempdir().unwrap();
        let (base, shutdown) = agent_setup().await;
        let client = RunnerClient::new(&base);
        let run_dir = root.path().join("job1");
        let jhash = JobIdentity::from("hash-A");

        let tmp = prepare_tmp(root.path(), "a", "hash-A").await;
        client
            .start_report_job(&run_dir, &jhash, BackendKind::Local, &cmd(&["sleep", "30"]), &tmp)
            .await
            .unwrap();
        wait_for_status(&client, &run_dir, &jhash, JobStatus::Running).await;

        client.cancel(&run_dir, &jhash).await.unwrap();
        wait_for_status(&client, &run_dir, &jhash, JobStatus::Canceled).await;

        shutdown.store(true, Ordering::Relaxed);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn agent_reports_start_failure() {
    timeout(TEST_TIMEOUT, async {
        let root = tempfile::tempdir().unwrap();
        let (base, shutdown) = agent_setup().await;
        let client = RunnerClient::new(&base);
        let run_dir = root.path().join("job1");
        let jhash = JobIdentity::from("hash-A");

        let tmp = prepare_tmp(root.path(), "a", "hash-A").await;
        client
            .start_report_job(
                &run_dir,
                &jhash,
                BackendKind::Local,
                &cmd(&["/nonexistent/simulation-binary"]),
                &tmp,
            )
            .await
            .unwrap();

        wait_for_status(&client, &run_dir, &jhash, JobStatus::Error).await;

        shutdown.store(true, Ordering::Relaxed);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn two_agents_keep_directory_work_with_its_owner() {
    timeout(TEST_TIMEOUT, async {
        let root = tempfile::tempdir().unwrap();
        let base = start_server(ServerState::dispatching(Arc::new(AgentDispatcher::new()))).await;
        let agents = [spawn_test_agent(&base, "agent-1"), spawn_test_agent(&base, "agent-2")];
        let client = RunnerClient::new(&base);
        let run_dir = root.path().join("job2");
        let hash_b = JobIdentity::from("hash-B");
        let hash_c = JobIdentity::from("hash-C");

        let tmp_b = prepare_tmp(root.path(), "b", "hash-B").await;
        client
            .start_report_job(&run_dir, &hash_b, BackendKind::Local, &cmd(&["sleep", "30"]), &tmp_b)
            .await
            .unwrap();
        wait_for_status(&client, &run_dir, &hash_b, JobStatus::Running).await;

        // The takeover must reach the agent running hash-B, which kills it.
        let tmp_c = prepare_tmp(root.path(), "c", "hash-C").await;
        client
            .start_report_job(&run_dir, &hash_c, BackendKind::Local, &cmd(&["sleep", "30"]), &tmp_c)
            .await
            .unwrap();
        wait_for_status(&client, &run_dir, &hash_c, JobStatus::Running).await;
        assert_eq!(client.status(&run_dir, &hash_b).await.unwrap(), JobStatus::Missing);

        client.cancel(&run_dir, &hash_c).await.unwrap();
        wait_for_status(&client, &run_dir, &hash_c, JobStatus::Canceled).await;

        for shutdown in agents {
            shutdown.store(true, Ordering::Relaxed);
        }
    })
    .await
    .expect("test timed out");
}

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use job_fabric::config::JobConfig;
use job_fabric::protocol::JobRequest;
use job_fabric::worker::executor::{CLIENT_NOT_ALLOWED, JOB_NOT_FOUND};
use job_fabric::worker::JobExecutor;

/// Create a test executor with a single job named `job`
fn test_executor(job: JobConfig) -> JobExecutor {
    let mut jobs = BTreeMap::new();
    jobs.insert("job".to_string(), job);
    JobExecutor::new(jobs)
}

fn sh(script: &str, timeout_ms: u64) -> JobConfig {
    JobConfig::new("sh", timeout_ms).with_arguments(format!("-c '{script}'"))
}

fn request(job_name: &str, client: &str) -> JobRequest {
    JobRequest {
        job_id: "1".to_string(),
        job_name: job_name.to_string(),
        job_data: r#"{"ref":"main"}"#.to_string(),
        client_name: client.to_string(),
    }
}

#[tokio::test]
async fn test_execute_simple_command() {
    let executor = test_executor(JobConfig::new("echo", 5000).with_arguments("hello"));

    let response = executor.execute(&request("job", "ci")).await;

    assert_eq!(response.job_id, "1");
    assert!(response.success);
    assert!(!response.is_async);
    assert_eq!(response.result.as_deref(), Some("hello\n"));
}

#[tokio::test]
async fn test_execute_quoted_arguments() {
    let executor = test_executor(sh("echo one two", 5000));

    let response = executor.execute(&request("job", "ci")).await;

    assert!(response.success);
    assert_eq!(response.result.as_deref(), Some("one two\n"));
}

#[tokio::test]
async fn test_execute_empty_output() {
    let executor = test_executor(JobConfig::new("true", 5000));

    let response = executor.execute(&request("job", "ci")).await;

    assert!(response.success);
    assert_eq!(response.result.as_deref(), Some(""));
}

#[tokio::test]
async fn test_execute_large_output() {
    let executor = test_executor(JobConfig::new("seq", 5000).with_arguments("1 1000"));

    let response = executor.execute(&request("job", "ci")).await;

    assert!(response.success);
    assert_eq!(response.result.unwrap().lines().count(), 1000);
}

#[tokio::test]
async fn test_execute_command_failure() {
    let executor = test_executor(sh("echo failing; exit 3", 5000));

    let response = executor.execute(&request("job", "ci")).await;

    assert!(!response.success);
    assert_eq!(response.result.as_deref(), Some("failing\n"));
}

#[tokio::test]
async fn test_stderr_is_captured() {
    let executor = test_executor(sh("echo oops >&2", 5000));

    let response = executor.execute(&request("job", "ci")).await;

    assert!(response.success);
    assert_eq!(response.result.as_deref(), Some("oops\n"));
}

#[tokio::test]
async fn test_job_environment() {
    let executor = test_executor(sh(
        "echo $JOB_ID $JOB_NAME $JOB_CLIENT; echo \"$JOB_DATA\"",
        5000,
    ));

    let response = executor.execute(&request("job", "ci")).await;

    assert!(response.success);
    assert_eq!(
        response.result.as_deref(),
        Some("1 job ci\n{\"ref\":\"main\"}\n")
    );
}

#[tokio::test]
async fn test_sync_timeout_kills_process() {
    let executor = test_executor(sh("echo started; exec sleep 5", 300));

    let start = Instant::now();
    let response = executor.execute(&request("job", "ci")).await;

    assert!(start.elapsed() < Duration::from_secs(4));
    assert!(!response.success);
    assert!(!response.is_async);
    assert_eq!(response.result.as_deref(), Some("started\n"));
}

#[tokio::test]
async fn test_async_job_replies_before_exit() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("done");
    let executor = test_executor(
        sh(&format!("sleep 0.5; touch {}", marker.display()), 5000).asynchronous(),
    );

    let start = Instant::now();
    let response = executor.execute(&request("job", "ci")).await;

    assert!(start.elapsed() < Duration::from_millis(400));
    assert!(response.success);
    assert!(response.is_async);
    assert!(response.result.is_none());
    assert!(!marker.exists());
    assert_eq!(executor.background_jobs(), 1);

    let finished = tokio::time::timeout(Duration::from_secs(5), async {
        while executor.background_jobs() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(finished.is_ok(), "background job should finish");
    assert!(marker.exists());
}

#[tokio::test]
async fn test_async_job_killed_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("done");
    let executor = test_executor(
        sh(&format!("sleep 2; touch {}", marker.display()), 10_000).asynchronous(),
    );

    let response = executor.execute(&request("job", "ci")).await;
    assert!(response.is_async);

    // The orphaned `sleep` may hold the output pipe until the drain window closes.
    tokio::time::timeout(Duration::from_secs(4), executor.shutdown())
        .await
        .expect("shutdown should finish");
    assert_eq!(executor.background_jobs(), 0);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!marker.exists());
}

#[tokio::test]
async fn test_unknown_job() {
    let executor = test_executor(JobConfig::new("true", 5000));

    let response = executor.execute(&request("deploy", "ci")).await;

    assert!(!response.success);
    assert_eq!(response.result.as_deref(), Some(JOB_NOT_FOUND));
}

#[tokio::test]
async fn test_disallowed_client_never_spawns() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");
    let executor = test_executor(
        sh(&format!("touch {}", marker.display()), 5000).allow_clients(["release"]),
    );

    let response = executor.execute(&request("job", "ci")).await;

    assert!(!response.success);
    assert!(!response.is_async);
    assert_eq!(response.result.as_deref(), Some(CLIENT_NOT_ALLOWED));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!marker.exists());

    let response = executor.execute(&request("job", "release")).await;
    assert!(response.success);
    assert!(marker.exists());
}

#[tokio::test]
async fn test_spawn_failure() {
    let executor = test_executor(JobConfig::new("/nonexistent/job-binary", 5000));

    let response = executor.execute(&request("job", "ci")).await;

    assert!(!response.success);
    assert!(response
        .result
        .unwrap()
        .starts_with("Failed to start process:"));
}

use serde_json::json;
use sockd::client::{ClientConfig, DaemonClient};
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use tokio::time::timeout;

const SERVICE: &str = "reload";

/// A private copy of the echo binary, so touching it cannot interfere with
/// any other test using the shared build artifact.
fn copy_script(root: &Path) -> std::path::PathBuf {
    let script = root.join("echo-daemon");
    fs::copy(env!("CARGO_BIN_EXE_sockd-echo"), &script).unwrap();
    script
}

fn client_for(root: &Path, script: &Path) -> DaemonClient {
    let mut config = ClientConfig::new(SERVICE, script);
    config.root = Some(root.to_path_buf());
    config.exec_argv = vec![
        "--service-name".to_string(),
        SERVICE.to_string(),
        "--root".to_string(),
        root.to_str().unwrap().to_string(),
        "--idle-timeout-ms".to_string(),
        "3000".to_string(),
    ];
    DaemonClient::new(config).expect("client config should be valid")
}

async fn ping_pid(client: &DaemonClient) -> u64 {
    let pong = timeout(Duration::from_secs(10), client.ping())
        .await
        .expect("ping timed out")
        .unwrap();
    pong["pid"].as_u64().unwrap()
}

/// Touching the daemon script makes clients replace the running daemon: all
/// subsequent requests succeed against a fresh pid.
#[tokio::test]
async fn test_script_mtime_change_restarts_daemon() {
    let temp_dir = TempDir::new().unwrap();
    let script = copy_script(temp_dir.path());

    let first = client_for(temp_dir.path(), &script);
    let handle = first.request(json!({"n": 0})).await;
    timeout(Duration::from_secs(10), handle.wait())
        .await
        .expect("request timed out")
        .unwrap();
    let old_pid = ping_pid(&first).await;

    // Simulate a rebuild: push the script mtime past the recorded one.
    // Read-only handle: a write-open of a running executable is ETXTBSY.
    fs::File::open(&script)
        .unwrap()
        .set_modified(SystemTime::now() + Duration::from_secs(30))
        .unwrap();

    // The next check notices, unlinks the record, and stops the daemon
    assert!(first.check_script_mtime().await);
    assert!(!first.paths().mtime_path().exists());
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Fresh clients race their requests; every one succeeds against the
    // replacement daemon
    let clients: Vec<DaemonClient> = (0..3)
        .map(|_| client_for(temp_dir.path(), &script))
        .collect();

    let mut handles = Vec::new();
    for (i, client) in clients.iter().enumerate() {
        handles.push(client.request(json!({"n": i})).await);
    }
    for handle in handles {
        timeout(Duration::from_secs(15), handle.wait())
            .await
            .expect("request against replacement daemon timed out")
            .unwrap();
    }

    // All clients see the same new daemon, and it is a new process
    let mut new_pids = Vec::new();
    for client in &clients {
        new_pids.push(ping_pid(client).await);
    }
    assert!(new_pids.iter().all(|&pid| pid == new_pids[0]));
    assert_ne!(new_pids[0], old_pid);
}

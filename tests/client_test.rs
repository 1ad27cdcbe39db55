use serde_json::json;
use sockd::client::{ClientConfig, DaemonClient};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::timeout;

const SERVICE: &str = "echo";

fn client_in(root: &Path) -> DaemonClient {
    let mut config = ClientConfig::new(SERVICE, env!("CARGO_BIN_EXE_sockd-echo"));
    config.root = Some(root.to_path_buf());
    config.exec_argv = vec![
        "--service-name".to_string(),
        SERVICE.to_string(),
        "--root".to_string(),
        root.to_str().unwrap().to_string(),
        // Die soon after the test stops talking to it
        "--idle-timeout-ms".to_string(),
        "3000".to_string(),
    ];
    DaemonClient::new(config).expect("client config should be valid")
}

/// A request against an empty directory spawns the daemon, and the response
/// carries the request's id.
#[tokio::test]
async fn test_request_spawns_daemon_and_resolves() {
    let temp_dir = TempDir::new().unwrap();
    let client = client_in(temp_dir.path());

    let handle = client.request(json!({"msg": "hi"})).await;
    let request_id = handle.id().to_string();

    let response = timeout(Duration::from_secs(10), handle.wait())
        .await
        .expect("request timed out")
        .unwrap();

    assert_eq!(response["id"].as_str().unwrap(), request_id);
    assert_eq!(response["echo"]["msg"], "hi");
    assert_eq!(response["echo"]["id"].as_str().unwrap(), request_id);

    // The spawned daemon committed leadership and recorded the script mtime
    let paths = client.paths();
    assert!(paths.pid_path().exists());
    assert!(paths.mtime_path().exists());
    assert!(!paths.lock_path().exists());
}

/// Pings resolve to a pong carrying the daemon pid and a measured RTT.
#[tokio::test]
async fn test_ping_measures_rtt() {
    let temp_dir = TempDir::new().unwrap();
    let client = client_in(temp_dir.path());

    let pong = timeout(Duration::from_secs(10), client.ping())
        .await
        .expect("ping timed out")
        .unwrap();

    assert_eq!(pong["PING"], "PONG");
    let daemon_pid = pong["pid"].as_u64().unwrap();
    assert!(daemon_pid > 0);
    assert_ne!(daemon_pid, u64::from(std::process::id()));

    let duration = pong["duration"].as_u64().unwrap();
    assert!(duration < 10_000, "RTT should be on the caller's clock");

    // pid file agrees with the pong
    let recorded: u64 = fs::read_to_string(client.paths().pid_path())
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert_eq!(recorded, daemon_pid);
}

/// Two clients sharing a directory share one daemon.
#[tokio::test]
async fn test_clients_share_one_daemon() {
    let temp_dir = TempDir::new().unwrap();
    let first = client_in(temp_dir.path());
    let second = client_in(temp_dir.path());

    let a = timeout(Duration::from_secs(10), first.ping())
        .await
        .expect("first ping timed out")
        .unwrap();
    let b = timeout(Duration::from_secs(10), second.ping())
        .await
        .expect("second ping timed out")
        .unwrap();

    assert_eq!(a["pid"], b["pid"]);
}

/// A recorded PID naming a process that never listened: the stale socket
/// file refuses connections, a replacement daemon is spawned, and its
/// election terminates the recorded process before taking the endpoint.
#[tokio::test]
async fn test_wedged_non_listener_is_terminated() {
    let temp_dir = TempDir::new().unwrap();
    let client = client_in(temp_dir.path());
    let paths = client.paths().clone();

    fs::create_dir_all(paths.dir()).unwrap();

    // An unrelated process posing as the daemon: its pid is recorded, the
    // socket path exists, but nothing listens
    let mut imposter = std::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .unwrap();
    fs::write(paths.pid_path(), format!("{}\n", imposter.id())).unwrap();
    fs::write(paths.socket_path(), "").unwrap();

    let handle = client.request(json!({"msg": "anyway"})).await;
    let response = timeout(Duration::from_secs(15), handle.wait())
        .await
        .expect("request never resolved past the imposter")
        .unwrap();
    assert_eq!(response["echo"]["msg"], "anyway");

    // The usurping daemon terminated the recorded process
    let mut terminated = false;
    for _ in 0..40 {
        if imposter.try_wait().unwrap().is_some() {
            terminated = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(terminated, "imposter should have received a termination signal");
}

/// A process that holds the endpoint open but never answers is usurped: the
/// client's handshake times out, a replacement daemon is spawned, the
/// replacement evicts the silent peer, and the request still resolves.
#[tokio::test]
async fn test_silent_wedged_peer_is_usurped() {
    let temp_dir = TempDir::new().unwrap();
    let client = client_in(temp_dir.path());
    let paths = client.paths().clone();

    fs::create_dir_all(paths.dir()).unwrap();

    // A listener that accepts (via the OS backlog) but never writes a byte,
    // posing as the daemon via the pid file
    let _wedged = tokio::net::UnixListener::bind(paths.socket_path()).unwrap();
    fs::write(paths.pid_path(), "999999\n").unwrap();

    let handle = client.request(json!({"msg": "through"})).await;
    let response = timeout(Duration::from_secs(15), handle.wait())
        .await
        .expect("request never resolved past the wedged peer")
        .unwrap();

    assert_eq!(response["echo"]["msg"], "through");

    // The wedged process's pid file entry was replaced by the usurper's
    let new_pid: u64 = fs::read_to_string(paths.pid_path())
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert_ne!(new_pid, 999_999);
}

//! End-to-end lifecycle and scenario coverage across Config Store, Rule
//! Evaluator, and Traffic Log wired together the way `main.rs` wires them
//! across a handful of representative rule-evaluation scenarios.

use secure_proxy::config::{self, ConfigStore};
use secure_proxy::log::{TrafficEntry, TrafficLog};
use secure_proxy::proxy::{BridgeContext, CertManager, Listener};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn write_rules(dir: &std::path::Path, contents: &str) -> std::path::PathBuf {
    let path = dir.join("rules.json");
    std::fs::write(&path, contents).unwrap();
    path
}

/// Monitor mode never blocks, regardless of rules present.
#[test]
fn monitor_mode_always_allows() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_rules(
        dir.path(),
        r#"{"mode":"monitor","allowed_rules":[{"host":"blocked.example","allowed_paths":[]}]}"#,
    );
    let store = ConfigStore::load_initial(&path);
    let snapshot = store.current();
    let decision = config::evaluate("blocked.example", "/anything", &snapshot);
    assert!(decision.is_allow());
    assert_eq!(decision.reason(), "Monitor Mode");
}

/// Enforce mode blocks a host absent from the allowlist.
#[test]
fn enforce_mode_blocks_unknown_host() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_rules(
        dir.path(),
        r#"{"mode":"enforce","allowed_rules":[{"host":"allowed.example","allowed_paths":[]}]}"#,
    );
    let store = ConfigStore::load_initial(&path);
    let decision = config::evaluate("evil.example", "/", &store.current());
    assert!(!decision.is_allow());
    assert_eq!(decision.reason(), "Host Not Allowed");
}

/// Enforce mode allows a path matching an allowed prefix.
#[test]
fn enforce_mode_allows_matching_path_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_rules(
        dir.path(),
        r#"{"mode":"enforce","allowed_rules":[{"host":"api.example","allowed_paths":["/v1/"]}]}"#,
    );
    let store = ConfigStore::load_initial(&path);
    let decision = config::evaluate("api.example", "/v1/users?id=1", &store.current());
    assert!(decision.is_allow());
    assert_eq!(decision.reason(), "Path Match");
}

/// Enforce mode blocks a path outside the allowed prefixes.
#[test]
fn enforce_mode_blocks_disallowed_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_rules(
        dir.path(),
        r#"{"mode":"enforce","allowed_rules":[{"host":"api.example","allowed_paths":["/v1/"]}]}"#,
    );
    let store = ConfigStore::load_initial(&path);
    let decision = config::evaluate("api.example", "/admin", &store.current());
    assert!(!decision.is_allow());
    assert!(decision.reason().starts_with("Path Not Allowed"));
}

/// A subdomain matches its parent host rule on a label boundary, never on
/// a bare substring.
#[test]
fn subdomain_matches_on_label_boundary_only() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_rules(
        dir.path(),
        r#"{"mode":"enforce","allowed_rules":[{"host":"example.com","allowed_paths":[]}]}"#,
    );
    let store = ConfigStore::load_initial(&path);
    assert!(config::evaluate("api.example.com", "/", &store.current()).is_allow());
    assert!(!config::evaluate("notexample.com", "/", &store.current()).is_allow());
}

/// A request evaluated against a snapshot taken before a reload must
/// not observe the reloaded rules, even if the reload completes first.
#[test]
fn snapshot_taken_before_reload_is_unaffected_by_it() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_rules(
        dir.path(),
        r#"{"mode":"enforce","allowed_rules":[{"host":"old.example","allowed_paths":[]}]}"#,
    );
    let store = ConfigStore::load_initial(&path);
    let snapshot_before = store.current();

    write_rules(
        dir.path(),
        r#"{"mode":"enforce","allowed_rules":[{"host":"new.example","allowed_paths":[]}]}"#,
    );
    store.reload().unwrap();

    assert!(config::evaluate("old.example", "/", &snapshot_before).is_allow());
    assert!(!config::evaluate("old.example", "/", &store.current()).is_allow());
    assert!(config::evaluate("new.example", "/", &store.current()).is_allow());
}

/// A bad reload keeps serving the last good snapshot rather than falling
/// back to a default or poisoning the store.
#[test]
fn failed_reload_keeps_previous_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_rules(
        dir.path(),
        r#"{"mode":"enforce","allowed_rules":[{"host":"good.example","allowed_paths":[]}]}"#,
    );
    let store = ConfigStore::load_initial(&path);

    std::fs::write(&path, "not json").unwrap();
    assert!(store.reload().is_err());

    assert!(config::evaluate("good.example", "/", &store.current()).is_allow());
}

/// The traffic log records one valid, independently-parseable JSON line
/// per evaluated request, carrying the fields an operator correlates
/// against `tracing` diagnostics.
#[tokio::test]
async fn traffic_log_records_one_self_delimited_line_per_request() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_rules(
        dir.path(),
        r#"{"mode":"enforce","allowed_rules":[{"host":"api.example","allowed_paths":["/v1/"]}]}"#,
    );
    let store = ConfigStore::load_initial(&path);
    let log = TrafficLog::open(dir.path().join("traffic.jsonl")).unwrap();

    for (host, req_path) in [("api.example", "/v1/ok"), ("api.example", "/forbidden")] {
        let decision = config::evaluate(host, req_path, &store.current());
        let action = if decision.is_allow() { "ALLOW" } else { "BLOCK" };
        log.append(TrafficEntry::now(
            action,
            "enforce",
            host,
            req_path,
            "GET",
            decision.reason(),
        ))
        .await;
    }

    let content = std::fs::read_to_string(dir.path().join("traffic.jsonl")).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 2);
    let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first["action"], "ALLOW");
    let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
    assert_eq!(second["action"], "BLOCK");
}

/// The listener binds, accepts a connection, and shuts down cleanly within
/// the drain grace period once signalled — exercising the Root
/// orchestration + Listener wiring used by `main.rs`.
#[tokio::test(flavor = "multi_thread")]
async fn listener_binds_and_shuts_down_gracefully() {
    let dir = tempfile::tempdir().unwrap();
    let rules_path = write_rules(
        dir.path(),
        r#"{"mode":"monitor","allowed_rules":[]}"#,
    );

    let cert_manager = std::sync::Arc::new(CertManager::new(dir.path().join("ca")).unwrap());
    let config_store = std::sync::Arc::new(ConfigStore::load_initial(&rules_path));
    let traffic_log =
        std::sync::Arc::new(TrafficLog::open(dir.path().join("traffic.jsonl")).unwrap());
    let ctx = BridgeContext::new(cert_manager, config_store, traffic_log);

    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let bound = std::net::TcpListener::bind(addr).unwrap();
    let real_addr = bound.local_addr().unwrap();
    drop(bound);

    let listener = Listener::new(real_addr);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let serve_handle = tokio::spawn(async move { listener.serve(ctx, shutdown_rx).await });

    let mut connected = None;
    for _ in 0..50 {
        if let Ok(stream) = TcpStream::connect(real_addr).await {
            connected = Some(stream);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let mut client = connected.expect("listener should accept a connection");
    client.write_all(b"GET / HTTP/1.1\r\n").await.ok();

    shutdown_tx.send(true).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), serve_handle).await;
    assert!(result.is_ok(), "listener should shut down within the drain grace period");

    let mut buf = [0u8; 1];
    let _ = client.read(&mut buf).await;
}

/// Full network MITM round-trip (real TLS handshake against the minted
/// leaf, real plaintext upstream dial) requires binding port 80, which is
/// privileged in most sandboxes — exercised only where that privilege is
/// available.
#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires binding privileged port 80 for the plaintext upstream"]
async fn plaintext_request_is_forwarded_and_logged_end_to_end() {
    // Intentionally left as a documented gap: a full redirector-free E2E
    // harness would need either CAP_NET_BIND_SERVICE or a loopback DNAT
    // rule neither of which this test suite assumes it has.
}

//! Scenario tests against mock wire-protocol members.
//!
//! Each mock member is a real TCP listener speaking the framed protocol with
//! JSON payloads: it answers handshakes from a mutable reply document (so a
//! test can promote or demote it at runtime), echoes everything else back
//! with its own port, and swallows any command carrying a `sleep` key.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use veleta::{
    ClientConfig, DeploymentConfig, DriverError, JsonCodec, PoolConfig, ReadMode, ReadPreference,
    ReplicaSetClient, SelectionError, StrategyKind, TopologyError, TopologyEvent,
};

const OP_REPLY: i32 = 1;

struct MockMember {
    port: u16,
    handshake: Arc<Mutex<Value>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl MockMember {
    async fn spawn(listener: TcpListener, handshake: Value) -> Self {
        let port = listener.local_addr().unwrap().port();
        let handshake = Arc::new(Mutex::new(handshake));
        let tasks: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_tasks = Arc::clone(&tasks);
        let accept_handshake = Arc::clone(&handshake);
        let accept = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let handshake = Arc::clone(&accept_handshake);
                let conn = tokio::spawn(serve_connection(stream, handshake, port));
                accept_tasks.lock().unwrap().push(conn);
            }
        });
        tasks.lock().unwrap().push(accept);

        Self {
            port,
            handshake,
            tasks,
        }
    }

    fn address(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    fn set_handshake(&self, value: Value) {
        *self.handshake.lock().unwrap() = value;
    }

    /// Stop accepting and drop every open connection.
    fn kill(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

async fn serve_connection(mut stream: TcpStream, handshake: Arc<Mutex<Value>>, port: u16) {
    loop {
        let mut len_buf = [0u8; 4];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return;
        }
        let len = i32::from_le_bytes(len_buf) as usize;
        let mut rest = vec![0u8; len - 4];
        if stream.read_exact(&mut rest).await.is_err() {
            return;
        }
        let request_id = i32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]);
        let doc: Value = serde_json::from_slice(&rest[12..]).unwrap();

        if doc.get("sleep").is_some() {
            // Never answer; lets tests exercise the request timeout.
            continue;
        }
        let reply = if doc.get("ismaster").is_some() {
            handshake.lock().unwrap().clone()
        } else {
            json!({"ok": 1, "port": port, "echo": doc})
        };

        let body = serde_json::to_vec(&reply).unwrap();
        let total = (16 + body.len()) as i32;
        let mut out = Vec::with_capacity(total as usize);
        out.extend_from_slice(&total.to_le_bytes());
        out.extend_from_slice(&0i32.to_le_bytes());
        out.extend_from_slice(&request_id.to_le_bytes());
        out.extend_from_slice(&OP_REPLY.to_le_bytes());
        out.extend_from_slice(&body);
        if stream.write_all(&out).await.is_err() {
            return;
        }
    }
}

struct Fixture {
    members: Vec<MockMember>,
    hosts: Vec<String>,
}

impl Fixture {
    /// A replica set of `n` members; member 0 starts as the primary.
    async fn replica_set(n: usize) -> Self {
        let mut listeners = Vec::with_capacity(n);
        for _ in 0..n {
            listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
        }
        let hosts: Vec<String> = listeners
            .iter()
            .map(|l| format!("127.0.0.1:{}", l.local_addr().unwrap().port()))
            .collect();

        let mut members = Vec::with_capacity(n);
        for (i, listener) in listeners.into_iter().enumerate() {
            let handshake = Self::member_handshake(&hosts, i, 0, None);
            members.push(MockMember::spawn(listener, handshake).await);
        }
        Self { members, hosts }
    }

    fn member_handshake(
        hosts: &[String],
        member: usize,
        primary: usize,
        tags: Option<Value>,
    ) -> Value {
        let mut handshake = json!({
            "ismaster": member == primary,
            "secondary": member != primary,
            "setName": "rs0",
            "hosts": hosts,
            "me": hosts[member],
            "primary": hosts[primary],
        });
        if let Some(tags) = tags {
            handshake["tags"] = tags;
        }
        handshake
    }

    /// Rewrite every member's handshake so `idx` is the primary.
    fn promote(&self, idx: usize) {
        for (i, member) in self.members.iter().enumerate() {
            member.set_handshake(Self::member_handshake(&self.hosts, i, idx, None));
        }
    }

    fn tag_member(&self, idx: usize, tags: Value) {
        self.members[idx].set_handshake(Self::member_handshake(&self.hosts, idx, 0, Some(tags)));
    }

    fn port(&self, idx: usize) -> u16 {
        self.members[idx].port
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_config(seeds: Vec<String>) -> ClientConfig {
    init_tracing();
    let mut config = ClientConfig::default();
    config.deployment = DeploymentConfig::ReplicaSet {
        seeds,
        set_name: Some("rs0".to_string()),
    };
    config.pool = PoolConfig {
        size: 2,
        connect_timeout_ms: 1_000,
    };
    config.operation.request_timeout_ms = 2_000;
    config.monitor.ha_interval_ms = 100;
    config.monitor.ping_interval_ms = 100;
    config
}

async fn connect(config: ClientConfig) -> ReplicaSetClient {
    ReplicaSetClient::connect(config, Arc::new(JsonCodec))
        .await
        .unwrap()
}

fn reply_port(reply: &Value) -> u16 {
    reply["port"].as_u64().unwrap() as u16
}

#[tokio::test]
async fn test_discovers_all_members_from_one_seed() {
    let fixture = Fixture::replica_set(3).await;
    // Seed with a single secondary; the primary and the other secondary are
    // only reachable through gossip.
    let client = connect(test_config(vec![fixture.members[1].address()])).await;

    let topology = client.topology();
    assert_eq!(topology.member_count().await, 3);
    assert_eq!(
        topology.master_address().await.unwrap().to_string(),
        fixture.members[0].address()
    );
    assert_eq!(topology.secondary_count().await, 2);
    assert!(topology.is_full_setup().await);
    client.close().await;
}

#[tokio::test]
async fn test_write_goes_to_primary() -> anyhow::Result<()> {
    let fixture = Fixture::replica_set(3).await;
    let client = connect(test_config(vec![fixture.members[0].address()])).await;

    let reply = client.write_command(&json!({"insert": "users"})).await?;
    assert_eq!(reply_port(&reply), fixture.port(0));
    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_secondary_preferred_avoids_primary_when_possible() {
    let fixture = Fixture::replica_set(3).await;
    let client = connect(test_config(vec![fixture.members[0].address()])).await;

    for _ in 0..6 {
        let reply = client
            .read_command(&json!({"count": "users"}), &ReadPreference::secondary_preferred())
            .await
            .unwrap();
        assert_ne!(reply_port(&reply), fixture.port(0));
    }
    client.close().await;
}

#[tokio::test]
async fn test_secondary_preferred_falls_back_to_primary() {
    let fixture = Fixture::replica_set(1).await;
    let client = connect(test_config(vec![fixture.members[0].address()])).await;

    let reply = client
        .read_command(&json!({"count": "users"}), &ReadPreference::secondary_preferred())
        .await
        .unwrap();
    assert_eq!(reply_port(&reply), fixture.port(0));
    client.close().await;
}

#[tokio::test]
async fn test_secondary_mode_fails_without_secondaries() {
    let fixture = Fixture::replica_set(1).await;
    let client = connect(test_config(vec![fixture.members[0].address()])).await;

    let err = client
        .read_command(
            &json!({"count": "users"}),
            &ReadPreference::new(ReadMode::Secondary),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DriverError::Selection(SelectionError::NoSecondary)
    ));
    client.close().await;
}

#[tokio::test]
async fn test_tag_targeted_read() {
    let fixture = Fixture::replica_set(3).await;
    fixture.tag_member(1, json!({"dc": "east"}));
    fixture.tag_member(2, json!({"dc": "west"}));
    let client = connect(test_config(vec![fixture.members[0].address()])).await;

    let tags = vec![[("dc".to_string(), "west".to_string())]
        .into_iter()
        .collect()];
    let pref = ReadPreference::new(ReadMode::Secondary).with_tags(tags);
    for _ in 0..4 {
        let reply = client.read_command(&json!({"count": "users"}), &pref).await.unwrap();
        assert_eq!(reply_port(&reply), fixture.port(2));
    }
    client.close().await;
}

#[tokio::test]
async fn test_set_name_mismatch_is_fatal() {
    let a = MockMember::spawn(
        TcpListener::bind("127.0.0.1:0").await.unwrap(),
        json!({"ismaster": true, "secondary": false, "setName": "rs0", "hosts": []}),
    )
    .await;
    let b = MockMember::spawn(
        TcpListener::bind("127.0.0.1:0").await.unwrap(),
        json!({"ismaster": false, "secondary": true, "setName": "rogue", "hosts": []}),
    )
    .await;

    let err = ReplicaSetClient::connect(
        test_config(vec![a.address(), b.address()]),
        Arc::new(JsonCodec),
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        DriverError::Topology(TopologyError::SetNameMismatch { .. })
    ));
}

#[tokio::test]
async fn test_primary_death_and_failover() {
    let fixture = Fixture::replica_set(3).await;
    let client = connect(test_config(vec![fixture.members[0].address()])).await;
    let topology = Arc::clone(client.topology());

    // An in-flight request against the dying primary fails rather than
    // hanging for the full timeout.
    let conn = client.checkout_writer().await.unwrap();
    fixture.members[0].kill();
    let err = client.send_command(&conn, &json!({"insert": "users"})).await.unwrap_err();
    assert!(err.is_recoverable(), "unexpected error: {err}");

    // The topology notices the loss and refuses writes.
    let mut demoted = false;
    for _ in 0..100 {
        if topology.master_address().await.is_none() {
            demoted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(demoted, "primary was never marked down");
    let err = client.write_command(&json!({"insert": "users"})).await.unwrap_err();
    assert!(matches!(
        err,
        DriverError::Selection(SelectionError::NoPrimary)
    ));

    // Reads keep working off the surviving secondaries the whole time.
    let reply = client
        .read_command(&json!({"count": "users"}), &ReadPreference::secondary_preferred())
        .await
        .unwrap();
    assert_ne!(reply_port(&reply), fixture.port(0));

    // Promotion of a survivor restores writes.
    fixture.promote(1);
    let mut promoted = false;
    for _ in 0..100 {
        if let Ok(reply) = client.write_command(&json!({"insert": "users"})).await {
            assert_eq!(reply_port(&reply), fixture.port(1));
            promoted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(promoted, "no primary was promoted");
    client.close().await;
}

#[tokio::test]
async fn test_request_timeout_resolves_single_request() {
    let fixture = Fixture::replica_set(1).await;
    let mut config = test_config(vec![fixture.members[0].address()]);
    config.operation.request_timeout_ms = 300;
    let client = connect(config).await;
    let mut events = client.subscribe();

    let conn = client.checkout_writer().await.unwrap();
    let err = client.send_command(&conn, &json!({"sleep": 1})).await.unwrap_err();
    assert!(matches!(err, DriverError::Timeout { .. }));

    // The connection survives the timeout and serves the next request.
    let reply = client.send_command(&conn, &json!({"insert": "users"})).await.unwrap();
    assert_eq!(reply_port(&reply), fixture.port(0));

    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, TopologyEvent::Timeout { .. }));
    client.close().await;
}

#[tokio::test]
async fn test_chained_send_surfaces_final_reply() {
    let fixture = Fixture::replica_set(1).await;
    let client = connect(test_config(vec![fixture.members[0].address()])).await;

    let conn = client.checkout_writer().await.unwrap();
    let docs = vec![
        json!({"insert": "a"}),
        json!({"insert": "b"}),
        json!({"insert": "final"}),
    ];
    let reply = client.send_chained(&conn, &docs).await.unwrap();
    assert_eq!(reply["echo"]["insert"], "final");
    assert_eq!(client.topology().pending_requests(), 0);
    client.close().await;
}

#[tokio::test]
async fn test_raw_send_and_await() -> anyhow::Result<()> {
    let fixture = Fixture::replica_set(1).await;
    let client = connect(test_config(vec![fixture.members[0].address()])).await;

    let conn = client.checkout_reader(&ReadPreference::primary()).await?;
    let payload = serde_json::to_vec(&json!({"count": "users"}))?;
    let request_id = client.next_request_id();
    let reply = client.send_and_await(&conn, &payload, request_id).await?;
    let frame = reply.first().expect("reply has one frame");
    let decoded: Value = serde_json::from_slice(&frame.payload)?;
    assert_eq!(reply_port(&decoded), fixture.port(0));
    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_nearest_with_ping_strategy() {
    let fixture = Fixture::replica_set(3).await;
    let mut config = test_config(vec![fixture.members[0].address()]);
    config.monitor.strategy = Some(StrategyKind::Ping);
    let client = connect(config).await;

    // Give the probe task a moment to measure.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let reply = client
        .read_command(&json!({"count": "users"}), &ReadPreference::nearest())
        .await
        .unwrap();
    let port = reply_port(&reply);
    assert!((0..3).any(|i| fixture.port(i) == port));
    client.close().await;
}

#[tokio::test]
async fn test_nearest_without_strategy_fails() {
    let fixture = Fixture::replica_set(2).await;
    let client = connect(test_config(vec![fixture.members[0].address()])).await;

    let err = client
        .read_command(&json!({"count": "users"}), &ReadPreference::nearest())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DriverError::Selection(SelectionError::NoLatencyStrategy)
    ));
    client.close().await;
}

#[tokio::test]
async fn test_concurrent_reads_spread_over_secondaries() {
    let fixture = Fixture::replica_set(3).await;
    let client = connect(test_config(vec![fixture.members[0].address()])).await;

    let reads = (0..8).map(|_| {
        let client = client.clone();
        async move {
            client
                .read_command(&json!({"count": "users"}), &ReadPreference::secondary_preferred())
                .await
        }
    });
    let replies = join_all(reads).await;
    let mut ports = std::collections::HashSet::new();
    for reply in replies {
        ports.insert(reply_port(&reply.unwrap()));
    }
    assert!(ports.contains(&fixture.port(1)));
    assert!(ports.contains(&fixture.port(2)));
    client.close().await;
}

#[tokio::test]
async fn test_standalone_deployment() {
    let member = MockMember::spawn(
        TcpListener::bind("127.0.0.1:0").await.unwrap(),
        json!({"ismaster": true}),
    )
    .await;
    let mut config = ClientConfig::default();
    config.deployment = DeploymentConfig::Standalone {
        address: member.address(),
    };
    config.pool = PoolConfig {
        size: 1,
        connect_timeout_ms: 1_000,
    };
    let client = connect(config).await;

    let write = client.write_command(&json!({"insert": "users"})).await.unwrap();
    assert_eq!(reply_port(&write), member.port);

    // Direct mode answers reads from itself regardless of role gating.
    let read = client
        .read_command(&json!({"count": "users"}), &ReadPreference::secondary_preferred())
        .await
        .unwrap();
    assert_eq!(reply_port(&read), member.port);

    // The configured default preference works the same way.
    let read = client
        .read_command(&json!({"count": "users"}), &client.default_read_preference())
        .await
        .unwrap();
    assert_eq!(reply_port(&read), member.port);
    client.close().await;
}

#[tokio::test]
async fn test_lazy_connect_runs_buffered_operations_after_discovery() {
    let fixture = Fixture::replica_set(3).await;
    let client = ReplicaSetClient::connect_lazy(
        test_config(vec![fixture.members[0].address()]),
        Arc::new(JsonCodec),
    )
    .unwrap();

    // Issued before discovery finishes; parks in the pending queue and runs
    // once the topology is ready.
    let reply = client.write_command(&json!({"insert": "users"})).await.unwrap();
    assert_eq!(reply_port(&reply), fixture.port(0));
    client.close().await;
}

#[tokio::test]
async fn test_lazy_connect_failure_fails_buffered_operations() {
    // Non-routable seed: discovery hangs until the connect timeout, so the
    // write below is buffered when setup fails.
    let client = ReplicaSetClient::connect_lazy(
        test_config(vec!["10.255.255.1:27017".to_string()]),
        Arc::new(JsonCodec),
    )
    .unwrap();

    let err = client.write_command(&json!({"insert": "users"})).await.unwrap_err();
    assert!(matches!(err, DriverError::Closed));
}

#[tokio::test]
async fn test_close_is_idempotent_and_emits_close() {
    let fixture = Fixture::replica_set(1).await;
    let client = connect(test_config(vec![fixture.members[0].address()])).await;
    let mut events = client.subscribe();

    client.close().await;
    client.close().await;

    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, TopologyEvent::Close));

    let err = client.write_command(&json!({"insert": "users"})).await.unwrap_err();
    assert!(matches!(err, DriverError::Closed));
}

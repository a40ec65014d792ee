// E2E Test 5: Stream Proxy
// Tests TCP and UDP relays, their access policy and listener
// reconciliation on reload.

mod e2e;

use e2e::backends::{spawn_tcp_echo, spawn_udp_echo};
use e2e::helpers::{step, TestEnv, TestResult};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

fn rules(tcp_backend: &str, udp_backend: &str, access: &str) -> String {
    format!(
        r#"
[[stream]]
name = "db"
listen = "127.0.0.1:0"
backends = [{{ address = "{}", protocol = "tcp" }}]

[[stream]]
name = "dns"
listen = "127.0.0.1:0"
tcp = false
udp = true
idle_timeout_secs = 2
backends = [{{ address = "{}", protocol = "udp" }}]

{}
"#,
        tcp_backend, udp_backend, access
    )
}

async fn tcp_round_trip(addr: std::net::SocketAddr, payload: &[u8]) -> Result<Vec<u8>, String> {
    let mut client = TcpStream::connect(addr)
        .await
        .map_err(|e| format!("Failed to connect to {}: {}", addr, e))?;
    client
        .write_all(payload)
        .await
        .map_err(|e| format!("Failed to write: {}", e))?;
    let mut echoed = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut echoed))
        .await
        .map_err(|_| "Timed out waiting for echo".to_string())?
        .map_err(|e| format!("Failed to read echo: {}", e))?;
    Ok(echoed)
}

#[tokio::test]
async fn test_e2e_5_stream_proxy() {
    let start = Instant::now();
    let test_name = "E2E Test 5: Stream Proxy".to_string();

    println!("\n🚀 Starting: {}", test_name);
    println!("{}", "=".repeat(80));

    // Step 1: Start echo servers and the gateway
    println!("\n📋 Step 1: Starting echo servers and gateway...");
    let tcp_backend = spawn_tcp_echo().await.to_string();
    let udp_backend = spawn_udp_echo().await.to_string();
    let env = step(&test_name, start, TestEnv::start(&rules(&tcp_backend, &udp_backend, "")).await);
    let streams = env.gateway.streams();
    assert_eq!(streams.names().await, vec!["db".to_string(), "dns".to_string()]);
    let db = streams.tcp_addr("db").await.expect("db listens on TCP");
    let dns = streams.udp_addr("dns").await.expect("dns listens on UDP");
    println!("✅ Stream listeners on {} (tcp) and {} (udp)", db, dns);

    // Step 2: TCP relay
    println!("\n📋 Step 2: Relaying TCP...");
    let echoed = step(&test_name, start, tcp_round_trip(db, b"SELECT 1;").await);
    assert_eq!(echoed, b"SELECT 1;");
    println!("✅ TCP bytes relayed");

    // Step 3: UDP relay
    println!("\n📋 Step 3: Relaying UDP...");
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(dns).await.unwrap();
    client.send(b"query").await.unwrap();
    let mut buf = [0u8; 64];
    let len = tokio::time::timeout(Duration::from_secs(5), client.recv(&mut buf))
        .await
        .expect("UDP echo within timeout")
        .unwrap();
    assert_eq!(&buf[..len], b"query");
    assert_eq!(streams.active_connections("dns").await, 1, "session stays open until idle");
    println!("✅ UDP datagram relayed");

    // Step 4: Access policy applies to stream connections
    println!("\n📋 Step 4: Denying loopback clients...");
    let deny = r#"
[access]
default = "allow"

[[access.rules]]
priority = 1
policy = "deny"
cidr = "127.0.0.1/32"
"#;
    step(&test_name, start, env.reload(&rules(&tcp_backend, &udp_backend, deny)).await);
    assert_eq!(streams.tcp_addr("db").await, Some(db), "unchanged rule keeps its listener");
    let denied = tcp_round_trip(db, b"SELECT 2;").await;
    assert!(denied.is_err(), "denied client must be disconnected");
    println!("✅ Stream connection denied");

    // Step 5: Removing a rule stops its listener
    println!("\n📋 Step 5: Removing the TCP rule...");
    let only_dns = format!(
        r#"
[[stream]]
name = "dns"
listen = "127.0.0.1:0"
tcp = false
udp = true
idle_timeout_secs = 2
backends = [{{ address = "{}", protocol = "udp" }}]
"#,
        udp_backend
    );
    step(&test_name, start, env.reload(&only_dns).await);
    assert_eq!(streams.names().await, vec!["dns".to_string()]);
    assert!(streams.tcp_addr("db").await.is_none());
    assert!(TcpStream::connect(db).await.is_err(), "removed listener no longer accepts");
    println!("✅ Listener reconciled");

    env.stop().await;

    let result = TestResult::success(test_name, start.elapsed());
    result.print();
    println!("\n🎉 Test completed successfully!");
}

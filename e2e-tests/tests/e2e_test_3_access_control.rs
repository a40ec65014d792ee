// E2E Test 3: Access Control
// Tests CIDR and country policies, path blocks and hot reload of the
// rule set.

mod e2e;

use e2e::backends::spawn_http_backend;
use e2e::helpers::{step, EnvOptions, TestEnv, TestResult};
use gateway_rs::access::StaticGeoIp;
use std::sync::Arc;
use std::time::Instant;

fn rules(backend: &str, access: &str) -> String {
    format!(
        r#"
[[block]]
host = "app.example.com"
path = "/admin"

[[block]]
host = "app.example.com"
path = "/gone"
status = 410

[[proxy]]
id = "app"
host = "app.example.com"
backends = [{{ address = "{}" }}]

{}
"#,
        backend, access
    )
}

const DENY_LOOPBACK: &str = r#"
[access]
default = "allow"

[[access.rules]]
priority = 10
policy = "deny"
cidr = "127.0.0.0/8"
"#;

const ALLOW_ALL: &str = r#"
[access]
default = "allow"
"#;

const DENY_FRANCE: &str = r#"
[access]
default = "allow"

[[access.rules]]
priority = 5
policy = "deny"
country = "FR"
"#;

#[tokio::test]
async fn test_e2e_3_access_control() {
    let start = Instant::now();
    let test_name = "E2E Test 3: Access Control".to_string();

    println!("\n🚀 Starting: {}", test_name);
    println!("{}", "=".repeat(80));

    // Step 1: Start with loopback denied
    println!("\n📋 Step 1: Starting gateway with a CIDR deny...");
    let backend = spawn_http_backend("app").await;
    let env = step(&test_name, start, TestEnv::start(&rules(&backend.address(), DENY_LOOPBACK)).await);
    let response = step(&test_name, start, env.get("app.example.com", "/").await);
    assert_eq!(response.status(), 403);
    let response = step(&test_name, start, env.get("unknown.test", "/").await);
    assert_eq!(response.status(), 403, "access runs before routing");
    println!("✅ Loopback client denied");

    // Step 2: Hot reload opens access
    println!("\n📋 Step 2: Reloading with an open policy...");
    let generation = step(&test_name, start, env.reload(&rules(&backend.address(), ALLOW_ALL)).await);
    println!("   active generation {}", generation);
    let response = step(&test_name, start, env.get("app.example.com", "/").await);
    assert_eq!(response.status(), 200);
    println!("✅ Reload applied");

    // Step 3: Path blocks
    println!("\n📋 Step 3: Checking path blocks...");
    let response = step(&test_name, start, env.get("app.example.com", "/admin/users").await);
    assert_eq!(response.status(), 403);
    let response = step(&test_name, start, env.get("app.example.com", "/gone").await);
    assert_eq!(response.status(), 410);
    let response = step(&test_name, start, env.get("app.example.com", "/administrator").await);
    assert_eq!(response.status(), 200, "blocks match whole path segments");
    println!("✅ Blocks enforced");

    // Step 4: An invalid rule set is rejected and the active one kept
    println!("\n📋 Step 4: Reloading an invalid rule set...");
    let broken = rules(&backend.address(), ALLOW_ALL).replace("path = \"/gone\"", "path = \"gone\"");
    let err = env.reload(&broken).await.expect_err("invalid rules must be rejected");
    assert!(err.contains("gone"), "error names the bad rule: {}", err);
    let response = step(&test_name, start, env.get("app.example.com", "/gone").await);
    assert_eq!(response.status(), 410, "previous snapshot still active");
    println!("✅ Invalid reload rejected");

    env.stop().await;

    // Step 5: Country policy through the GeoIP lookup
    println!("\n📋 Step 5: Checking country policy...");
    let geoip = StaticGeoIp::new()
        .with("127.0.0.0/8", "FR")
        .expect("valid CIDR");
    let env = step(
        &test_name,
        start,
        TestEnv::start_with(
            &rules(&backend.address(), DENY_FRANCE),
            EnvOptions {
                geoip: Some(Arc::new(geoip)),
                ..EnvOptions::default()
            },
        )
        .await,
    );
    let response = step(&test_name, start, env.get("app.example.com", "/").await);
    assert_eq!(response.status(), 403);
    println!("✅ Country denied");

    env.stop().await;

    let result = TestResult::success(test_name, start.elapsed());
    result.print();
    println!("\n🎉 Test completed successfully!");
}

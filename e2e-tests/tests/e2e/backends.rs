use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::Request;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use tokio::net::{TcpListener, UdpSocket};

/// Axum backend answering every request with a JSON description of it
pub struct MockBackend {
    pub name: String,
    pub addr: SocketAddr,
}

impl MockBackend {
    /// `ip:port` as written in rules
    pub fn address(&self) -> String {
        self.addr.to_string()
    }
}

/// Start an HTTP backend that echoes the request it received
pub async fn spawn_http_backend(name: &str) -> MockBackend {
    let app = Router::new()
        .route("/ws", get(websocket_echo))
        .fallback(describe_request)
        .with_state(name.to_string());
    serve(name, app).await
}

async fn serve(name: &str, app: Router) -> MockBackend {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind mock backend");
    let addr = listener.local_addr().expect("Mock backend has an address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    MockBackend {
        name: name.to_string(),
        addr,
    }
}

async fn describe_request(State(name): State<String>, req: Request<Body>) -> Json<Value> {
    let headers: Map<String, Value> = req
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), Value::String(v.to_str().unwrap_or_default().to_string())))
        .collect();

    Json(json!({
        "backend": name,
        "method": req.method().as_str(),
        "path": req.uri().path(),
        "query": req.uri().query(),
        "headers": headers,
    }))
}

async fn websocket_echo(State(name): State<String>, ws: WebSocketUpgrade) -> axum::response::Response {
    ws.on_upgrade(move |socket| echo_socket(socket, name))
}

async fn echo_socket(mut socket: WebSocket, name: String) {
    while let Some(Ok(message)) = socket.recv().await {
        let reply = match message {
            Message::Text(text) => Message::Text(format!("{}: {}", name, text)),
            Message::Binary(data) => Message::Binary(data),
            Message::Close(_) => break,
            _ => continue,
        };
        if socket.send(reply).await.is_err() {
            break;
        }
    }
}

/// Start a TCP server echoing every byte back
pub async fn spawn_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind TCP echo");
    let addr = listener.local_addr().expect("TCP echo has an address");
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// Start a UDP server echoing every datagram back
pub async fn spawn_udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind UDP echo");
    let addr = socket.local_addr().expect("UDP echo has an address");
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..len], peer).await;
        }
    });
    addr
}

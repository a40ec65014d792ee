use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite::Message};

type Stream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub struct WebSocketTestClient {
    write: futures_util::stream::SplitSink<Stream, Message>,
    read: futures_util::stream::SplitStream<Stream>,
}

impl WebSocketTestClient {
    /// Connect through the gateway at `addr`, presenting `host`
    pub async fn connect(addr: SocketAddr, host: &str, path: &str) -> Result<Self, String> {
        let mut request = format!("ws://{}{}", addr, path)
            .into_client_request()
            .map_err(|e| format!("Invalid WebSocket URL: {}", e))?;
        let host = HeaderValue::from_str(host).map_err(|e| format!("Invalid host: {}", e))?;
        request.headers_mut().insert("host", host);

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| format!("Failed to connect to WebSocket: {}", e))?;

        let (write, read) = ws_stream.split();

        Ok(Self { write, read })
    }

    /// Send a message
    pub async fn send(&mut self, msg: Message) -> Result<(), String> {
        self.write
            .send(msg)
            .await
            .map_err(|e| format!("Failed to send message: {}", e))
    }

    /// Receive a message with timeout
    pub async fn receive(&mut self, timeout_secs: u64) -> Result<Message, String> {
        let result = timeout(Duration::from_secs(timeout_secs), self.read.next()).await;

        match result {
            Ok(Some(Ok(message))) => Ok(message),
            Ok(Some(Err(e))) => Err(format!("WebSocket error: {}", e)),
            Ok(None) => Err("WebSocket closed".to_string()),
            Err(_) => Err(format!("Timeout after {} seconds", timeout_secs)),
        }
    }

    /// Send a text frame and return the text reply
    pub async fn round_trip(&mut self, text: &str) -> Result<String, String> {
        self.send(Message::Text(text.to_string())).await?;
        match self.receive(5).await? {
            Message::Text(reply) => Ok(reply),
            other => Err(format!("Expected a text frame, got {:?}", other)),
        }
    }

    /// Close connection
    pub async fn close(mut self) -> Result<(), String> {
        self.write
            .close()
            .await
            .map_err(|e| format!("Failed to close connection: {}", e))
    }
}

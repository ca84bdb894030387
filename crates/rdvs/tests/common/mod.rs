use futures_util::{SinkExt, StreamExt};
use rdvs::config::ServerConfig;
use rdvs::registry::Registry;
use rdvs::server::ServerState;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

pub fn test_config(listen: SocketAddr) -> ServerConfig {
    ServerConfig {
        listen,
        metrics_addr: "127.0.0.1:0".parse().unwrap(),
        max_conns: 1000,
        max_message: 65_536,
        ping_interval: 30,
        idle_timeout: 120,
        retain_admin_key: true,
    }
}

pub struct TestClient {
    pub ws_tx: futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        Message,
    >,
    pub ws_rx: futures_util::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    >,
}

impl TestClient {
    pub async fn connect(addr: &SocketAddr) -> Self {
        let url = format!("ws://{addr}");
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let (ws_tx, ws_rx) = ws.split();
        Self { ws_tx, ws_rx }
    }

    /// Connect and consume the role greeting, asserting the arbitrated
    /// role matches.
    pub async fn connect_as(addr: &SocketAddr, role: &str) -> Self {
        let mut client = Self::connect(addr).await;
        let greeting = client.recv_json().await;
        assert_eq!(greeting["type"], "STATUS");
        assert_eq!(greeting["role"], role);
        client
    }

    pub async fn send_json(&mut self, value: &Value) {
        self.send_raw(&value.to_string()).await;
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws_tx
            .send(Message::Text(text.to_owned()))
            .await
            .unwrap();
    }

    pub async fn recv_json(&mut self) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.ws_rx.next())
                .await
                .expect("timeout waiting for envelope")
                .unwrap()
                .unwrap();
            match msg {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }

    pub async fn recv_json_timeout(&mut self, timeout: Duration) -> Option<Value> {
        tokio::time::timeout(timeout, self.recv_json()).await.ok()
    }

    /// Wait for a close frame or the end of the stream.
    pub async fn recv_close(&mut self) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(msg) = self.ws_rx.next().await {
                match msg {
                    Ok(Message::Close(_)) | Err(_) => return,
                    _ => {}
                }
            }
        })
        .await
        .expect("timeout waiting for close");
    }
}

fn make_state(config: ServerConfig) -> Arc<ServerState> {
    Arc::new(ServerState {
        registry: Registry::new(),
        config,
        active_connections: AtomicUsize::new(0),
    })
}

async fn spawn_server(config_fn: impl FnOnce(&mut ServerConfig)) -> (SocketAddr, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = test_config(addr);
    config_fn(&mut config);
    let state = make_state(config);

    let state_clone = state.clone();
    tokio::spawn(async move {
        if let Err(e) = rdvs::run(listener, state_clone).await {
            eprintln!("server error in test: {e}");
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    (addr, state)
}

pub async fn start_server() -> (SocketAddr, Arc<ServerState>) {
    spawn_server(|_| {}).await
}

pub async fn start_server_without_key_retention() -> (SocketAddr, Arc<ServerState>) {
    spawn_server(|config| config.retain_admin_key = false).await
}

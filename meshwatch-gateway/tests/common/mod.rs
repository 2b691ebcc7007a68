#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use futures::StreamExt;
use meshwatch_gateway::config::GatewayConfig;
use meshwatch_gateway::Gateway;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub gateway: Gateway,
    pub addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    served: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(GatewayConfig::default()).await
    }

    pub async fn start_with(config: GatewayConfig) -> Self {
        let (gateway, broadcaster) = Gateway::new(config).unwrap();
        broadcaster.spawn();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let server = gateway.clone();
        let served = tokio::spawn(async move {
            server
                .serve(listener, async move {
                    let _ = stopped.await;
                })
                .await
                .unwrap();
        });
        Self { gateway, addr, stop: Some(stop), served }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub async fn connect(&self) -> Client {
        let (ws, _) = connect_async(self.ws_url()).await.unwrap();
        ws
    }

    /// Feeds one raw payload through the ingestor.
    pub fn ingest(&self, payload: &[u8]) {
        self.gateway.ingestor.ingest(payload);
    }

    /// Triggers graceful shutdown and waits for the server task.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = tokio::time::timeout(Duration::from_secs(5), self.served).await;
    }
}

/// Next text frame, skipping pings. Panics after two seconds of silence.
pub async fn next_text(ws: &mut Client) -> String {
    next_text_within(ws, Duration::from_secs(2)).await
}

pub async fn next_text_within(ws: &mut Client, patience: Duration) -> String {
    loop {
        let msg = tokio::time::timeout(patience, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection ended")
            .expect("read error");
        match msg {
            Message::Text(text) => return text,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

/// Waits until the registry holds `n` subscribers.
pub async fn wait_for_subscribers(server: &TestServer, n: usize) {
    for _ in 0..100 {
        if server.gateway.registry.len() == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {n} subscribers, have {}", server.gateway.registry.len());
}

//! A scripted Everlog node for integration tests: accepts connections,
//! answers heartbeats, and lets each test dictate the protocol exchange.

#![allow(dead_code)]

use std::{net::SocketAddr, time::Duration};

use bytes::Bytes;
use everlog::proto::{command, Package, PackageCodec};
use everlog::{Settings, SettingsBuilder};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use uuid::Uuid;

pub type ServerConn = Framed<TcpStream, PackageCodec>;

pub struct MockNode {
    listener: TcpListener,
    pub addr: SocketAddr,
}

impl MockNode {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock node");
        let addr = listener.local_addr().expect("local addr");
        Self { listener, addr }
    }

    pub async fn accept(&self) -> ServerConn {
        let (stream, _) = self.listener.accept().await.expect("accept");
        Framed::new(stream, PackageCodec::default())
    }
}

/// Returns the next data package, transparently answering client
/// heartbeat probes.
pub async fn next_request(conn: &mut ServerConn) -> Package {
    loop {
        let package = conn
            .next()
            .await
            .expect("client closed the connection")
            .expect("client sent a malformed frame");
        match package.command {
            command::HEARTBEAT_REQUEST => {
                let pong =
                    Package::new(command::HEARTBEAT_RESPONSE, package.correlation, Bytes::new());
                conn.send(pong).await.expect("send heartbeat response");
            }
            command::HEARTBEAT_RESPONSE => {}
            _ => return package,
        }
    }
}

pub async fn respond(conn: &mut ServerConn, command: u8, correlation: Uuid, payload: Bytes) {
    conn.send(Package::new(command, correlation, payload)).await.expect("send response");
}

/// Settings tuned so lifecycle transitions happen within test patience.
pub fn fast_settings(addr: SocketAddr) -> SettingsBuilder {
    Settings::builder()
        .single_node("127.0.0.1", addr.port())
        .reconnection_delay(Duration::from_millis(20))
        .operation_timeout(Duration::from_millis(500))
        .operation_timeout_check_interval(Duration::from_millis(50))
        .heartbeat_interval(Duration::from_secs(5))
        .heartbeat_timeout(Duration::from_secs(2))
}

pub const PATIENCE: Duration = Duration::from_secs(10);

//! A ready-to-use server: binds a listener, accepts and negotiates
//! connections concurrently, and funnels every lifecycle transition into a
//! single [`EventStream`].

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;

use crate::config::ServerConfig;
use crate::error::Error;
use crate::event::{ConnectionId, Event, EventStream};
use crate::handshake::server::accept;
use crate::stream::WsStream;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Starts a plaintext server on `port` with default limits and no origin
/// restriction.
pub async fn start_server(port: u16) -> std::io::Result<EventStream> {
    start_server_with_config(port, ServerConfig::default()).await
}

/// Starts a server on `port` governed by `config` (TLS, origin allow-list,
/// frame/message limits). Returns immediately with an `EventStream`; the
/// accept loop runs on a spawned task for the listener's lifetime.
pub async fn start_server_with_config(port: u16, config: ServerConfig) -> std::io::Result<EventStream> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let local_addr = listener.local_addr()?;
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let _ = tx.send(Event::ListenerStarted { local_addr }).await;
        loop {
            let (socket, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    log::warn!("accept failed: {e}");
                    continue;
                }
            };
            let config = config.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                negotiate_and_drive(socket, peer_addr, config, tx).await;
            });
        }
    });

    Ok(EventStream::new(rx))
}

async fn negotiate_and_drive(
    socket: TcpStream,
    peer_addr: SocketAddr,
    config: ServerConfig,
    tx: mpsc::Sender<Event>,
) {
    let _ = socket.set_nodelay(true);

    let stream = match wrap_tls(socket, &config).await {
        Ok(stream) => stream,
        Err(e) => {
            log::info!("TLS handshake with {peer_addr} failed: {e}");
            return;
        }
    };

    let (mut reader, writer) = match accept(stream, &config).await {
        Ok(pair) => pair,
        Err(e) => {
            log::info!("handshake with {peer_addr} rejected: {e}");
            if !e.is_io_class() {
                let _ = tx.send(Event::ConnectionAborted { id: ConnectionId::new(), error: e }).await;
            }
            return;
        }
    };

    let id = writer.id();
    let compression = writer.compression();
    let _ = tx.send(Event::ConnectionOpened { id, peer_addr, compression, writer }).await;

    loop {
        match reader.receive().await {
            Ok(message) => {
                let closing = message.is_close();
                let _ = tx.send(Event::MessageReceived { id, message }).await;
                if closing {
                    break;
                }
            }
            Err(e) => {
                // I/O-class errors (peer reset, pipe closed) are expected on
                // disconnect and only logged; `ConnectionAborted` is reserved
                // for failures the caller couldn't have predicted from the
                // transport alone.
                if e.is_io_class() {
                    log::debug!("connection {id} dropped: {e}");
                    let _ = tx.send(Event::ConnectionClosed { id }).await;
                } else {
                    log::warn!("connection {id} aborted: {e}");
                    let _ = tx.send(Event::ConnectionAborted { id, error: e }).await;
                }
                return;
            }
        }
    }

    let _ = tx.send(Event::ConnectionClosed { id }).await;
}

async fn wrap_tls(socket: TcpStream, config: &ServerConfig) -> Result<WsStream, Error> {
    match &config.tls_config {
        Some(tls_config) => {
            let acceptor = TlsAcceptor::from(Arc::clone(tls_config));
            let tls = acceptor.accept(socket).await?;
            Ok(WsStream::Tls(Box::new(tokio_rustls::TlsStream::from(tls))))
        }
        None => Ok(WsStream::Plain(socket)),
    }
}

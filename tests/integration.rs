//! Black-box handshake-to-message integration tests, driving a real loopback
//! TCP connection through both the server and client halves of the upgrade.

use tokio::net::TcpListener;

use wsengine::config::{ClientConfig, ServerConfig};
use wsengine::error::CloseCode;
use wsengine::handshake::{client, server};
use wsengine::message::Message;

#[tokio::test]
async fn client_connects_and_echoes_a_text_message() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server_task = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let config = ServerConfig::default();
        let (mut reader, writer) = server::accept(wsengine::stream::WsStream::Plain(socket), &config)
            .await
            .unwrap();
        let message = reader.receive().await.unwrap();
        writer.send(message).await.unwrap();
    });

    let (mut client_reader, client_writer) =
        client::connect(&format!("ws://127.0.0.1:{}/", addr.port()), ClientConfig::default()).await.unwrap();

    client_writer.send(Message::text("hello there")).await.unwrap();
    let echoed = client_reader.receive().await.unwrap();
    assert_eq!(echoed, Message::text("hello there"));

    server_task.await.unwrap();
}

#[tokio::test]
async fn permessage_deflate_round_trips_a_large_repeating_payload() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let payload = "ab".repeat(10_000);
    let expected = payload.clone();

    let server_task = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let config = ServerConfig::default();
        let (mut reader, writer) = server::accept(wsengine::stream::WsStream::Plain(socket), &config)
            .await
            .unwrap();
        let message = reader.receive().await.unwrap();
        assert_eq!(message, Message::text(expected));
        writer.close(CloseCode::NormalClosure, "bye").await.unwrap();
    });

    let mut client_config = ClientConfig::default();
    client_config.web_socket_config.compression = true;
    let (mut client_reader, client_writer) =
        client::connect(&format!("ws://127.0.0.1:{}/", addr.port()), client_config).await.unwrap();
    assert!(client_writer.compression());

    client_writer.send(Message::text(payload)).await.unwrap();
    let closing = client_reader.receive().await.unwrap();
    assert!(closing.is_close());

    server_task.await.unwrap();
}

#[tokio::test]
async fn graceful_close_carries_code_and_reason() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server_task = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let config = ServerConfig::default();
        let (_reader, writer) = server::accept(wsengine::stream::WsStream::Plain(socket), &config)
            .await
            .unwrap();
        writer.close(CloseCode::NormalClosure, "bye").await.unwrap();
    });

    let (mut client_reader, _client_writer) =
        client::connect(&format!("ws://127.0.0.1:{}/", addr.port()), ClientConfig::default()).await.unwrap();

    let message = client_reader.receive().await.unwrap();
    match message {
        Message::Close(Some(reason)) => {
            assert_eq!(reason.code, CloseCode::NormalClosure);
            assert_eq!(reason.reason, "bye");
        }
        other => panic!("expected a close message, got {other:?}"),
    }

    server_task.await.unwrap();
}

//! Server side of the HTTP/1.1 upgrade: validates the request, negotiates
//! `permessage-deflate`, and answers with a `101 Switching Protocols` or a
//! rejection status before handing the stream to [`crate::connection`].

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use tokio::io::{AsyncWriteExt, BufReader};

use crate::config::ServerConfig;
use crate::connection::{new_connection, Flags, WsReader, WsWriter};
use crate::error::Error;
use crate::request::HttpRequest;
use crate::stream::WsStream;
use crate::utils::generate_websocket_accept_value;

fn header_contains_token(value: &str, token: &str) -> bool {
    value.split(',').any(|part| part.trim().eq_ignore_ascii_case(token))
}

fn validate_request(request: &HttpRequest) -> Result<&str, Error> {
    if request.method != "GET" {
        return Err(Error::InvalidHttpHandshake);
    }
    let connection = request.header("connection").ok_or(Error::NoConnectionHeader)?;
    if !header_contains_token(connection, "upgrade") {
        return Err(Error::NoConnectionHeader);
    }
    let upgrade = request.header("upgrade").ok_or(Error::NoUpgradeHeader)?;
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(Error::NoUpgradeHeader);
    }
    if request.header("host").is_none() {
        return Err(Error::NoHostHeader);
    }
    if request.header("sec-websocket-version") != Some("13") {
        return Err(Error::UnsupportedVersion);
    }
    let key = request.header("sec-websocket-key").ok_or(Error::InvalidSecWebSocketKey)?;
    let decoded = BASE64_STANDARD.decode(key).map_err(|_| Error::InvalidSecWebSocketKey)?;
    if decoded.len() != 16 {
        return Err(Error::InvalidSecWebSocketKey);
    }
    Ok(key)
}

fn wants_compression(request: &HttpRequest) -> bool {
    request
        .header("sec-websocket-extensions")
        .is_some_and(|value| value.split(',').any(|ext| ext.trim().starts_with("permessage-deflate")))
}

async fn write_status(stream: &mut WsStream, status: u16, reason: &str) -> Result<(), Error> {
    let body = format!("{status} {reason}");
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads one HTTP request off `stream`, validates it as a WebSocket upgrade,
/// applies `config`'s origin allow-list and compression preference, and
/// either answers `101` and returns a live connection, or answers a `4xx`
/// and returns the error that caused it.
pub async fn accept(mut stream: WsStream, config: &ServerConfig) -> Result<(WsReader, WsWriter), Error> {
    let (request, leftover) = {
        let mut reader = BufReader::new(&mut stream);
        let request = HttpRequest::parse(&mut reader).await?;
        (request, reader.buffer().to_vec())
    };

    let key = match validate_request(&request) {
        Ok(key) => key,
        Err(e) => {
            let _ = write_status(&mut stream, 400, "Bad Request").await;
            return Err(e);
        }
    };

    if let Some(origin) = request.header("origin") {
        if !config.is_origin_allowed(origin) {
            let _ = write_status(&mut stream, 403, "Forbidden").await;
            return Err(Error::OriginNotAllowed(origin.to_string()));
        }
    }

    let compression = config.web_socket_config.compression && wants_compression(&request);
    let accept_value = generate_websocket_accept_value(key.to_string());

    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept_value}\r\n"
    );
    if compression {
        response.push_str("Sec-WebSocket-Extensions: permessage-deflate\r\n");
    }
    response.push_str("\r\n");
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;

    let flags = Flags { server: true, compression };
    Ok(new_connection(stream, flags, config.web_socket_config.clone(), leftover))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn loopback_pair() -> (WsStream, WsStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (WsStream::Plain(server), WsStream::Plain(client))
    }

    #[tokio::test]
    async fn accept_value_matches_rfc_6455_example() {
        assert_eq!(
            generate_websocket_accept_value("dGhlIHNhbXBsZSBub25jZQ==".to_string()),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[tokio::test]
    async fn valid_upgrade_request_is_accepted() {
        let (server_stream, mut client_stream) = loopback_pair().await;
        let config = ServerConfig::default();

        let accept_task = tokio::spawn(async move { accept(server_stream, &config).await });

        client_stream
            .write_all(
                b"GET /chat HTTP/1.1\r\n\
                  Host: example.com\r\n\
                  Connection: Upgrade\r\n\
                  Upgrade: websocket\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  Sec-WebSocket-Version: 13\r\n\
                  \r\n",
            )
            .await
            .unwrap();

        let mut response = [0u8; 4096];
        let n = client_stream.read(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response[..n]);
        assert!(response.starts_with("HTTP/1.1 101"));
        assert!(response.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

        let (_reader, _writer) = accept_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn disallowed_origin_is_rejected_with_403() {
        let (server_stream, mut client_stream) = loopback_pair().await;
        let mut config = ServerConfig::default();
        config.allowed_origins.insert("https://allowed.example".to_string());

        let accept_task = tokio::spawn(async move { accept(server_stream, &config).await });

        client_stream
            .write_all(
                b"GET / HTTP/1.1\r\n\
                  Host: example.com\r\n\
                  Connection: Upgrade\r\n\
                  Upgrade: websocket\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  Sec-WebSocket-Version: 13\r\n\
                  Origin: https://evil.example\r\n\
                  \r\n",
            )
            .await
            .unwrap();

        let mut response = [0u8; 4096];
        let n = client_stream.read(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response[..n]);
        assert!(response.starts_with("HTTP/1.1 403"));

        let err = accept_task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::OriginNotAllowed(_)));
    }
}

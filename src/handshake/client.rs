//! Client side of the HTTP/1.1 upgrade: resolves and dials the target host,
//! optionally wraps the socket in TLS for `wss`, writes the upgrade request,
//! and validates the response before handing the stream to
//! [`crate::connection`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use pki_types::ServerName;
use rustls::{ClientConfig as RustlsClientConfig, RootCertStore};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::{TlsConnector, TlsStream};
use url::Url;

use crate::config::ClientConfig;
use crate::connection::{new_connection, Flags, WsReader, WsWriter};
use crate::error::Error;
use crate::stream::WsStream;
use crate::utils::generate_websocket_accept_value;
use crate::utils::generate_websocket_key;

const MAX_RESPONSE_HEADER_BYTES: usize = 16 * 1024;

fn tls_client_config() -> Arc<RustlsClientConfig> {
    static CONFIG: OnceLock<Arc<RustlsClientConfig>> = OnceLock::new();
    CONFIG
        .get_or_init(|| {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            Arc::new(RustlsClientConfig::builder().with_root_certificates(roots).with_no_client_auth())
        })
        .clone()
}

struct HandshakeResponse {
    status: u16,
    headers: HashMap<String, String>,
    leftover: Vec<u8>,
}

fn canonical_header_name(lower: &str) -> Option<&'static str> {
    match lower {
        "upgrade" => Some("Upgrade"),
        "connection" => Some("Connection"),
        "sec-websocket-accept" => Some("Sec-WebSocket-Accept"),
        "sec-websocket-extensions" => Some("Sec-WebSocket-Extensions"),
        _ => None,
    }
}

async fn read_response(stream: &mut WsStream) -> Result<HandshakeResponse, Error> {
    let mut raw = Vec::new();
    let mut reader = BufReader::new(stream);
    loop {
        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Err(Error::NoUpgrade);
        }
        raw.extend_from_slice(&line);
        if line == b"\r\n" || raw.len() > MAX_RESPONSE_HEADER_BYTES {
            break;
        }
    }
    let leftover = reader.buffer().to_vec();

    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Response::new(&mut header_storage);
    match parsed.parse(&raw)? {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => return Err(Error::NoUpgrade),
    }
    let status = parsed.code.ok_or(Error::NoUpgrade)?;

    let mut headers = HashMap::new();
    let mut seen = HashSet::new();
    for header in parsed.headers.iter() {
        let lower = header.name.to_ascii_lowercase();
        if let Some(canonical) = canonical_header_name(&lower) {
            if !seen.insert(lower.clone()) {
                return Err(Error::DuplicateHeader(canonical));
            }
        }
        headers.insert(lower, String::from_utf8_lossy(header.value).into_owned());
    }

    Ok(HandshakeResponse { status, headers, leftover })
}

fn validate_response(response: &HandshakeResponse, expected_accept: &str) -> Result<bool, Error> {
    if response.status >= 400 {
        return Err(Error::HandshakeRefused(response.status));
    }
    if response.status != 101 {
        return Err(Error::NoUpgrade);
    }
    let upgrade = response.headers.get("upgrade").ok_or(Error::NoUpgradeHeader)?;
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(Error::NoUpgradeHeader);
    }
    let connection = response.headers.get("connection").ok_or(Error::NoConnectionHeader)?;
    if !connection.split(',').any(|part| part.trim().eq_ignore_ascii_case("upgrade")) {
        return Err(Error::NoConnectionHeader);
    }
    let accept = response.headers.get("sec-websocket-accept").ok_or(Error::InvalidAcceptKey)?;
    if accept != expected_accept {
        return Err(Error::InvalidAcceptKey);
    }
    let compression = response
        .headers
        .get("sec-websocket-extensions")
        .is_some_and(|value| value.split(',').any(|ext| ext.trim().starts_with("permessage-deflate")));
    Ok(compression)
}

async fn connect_tcp(host: &str, port: u16) -> Result<TcpStream, Error> {
    let addrs: Vec<_> = tokio::net::lookup_host((host, port)).await?.collect();
    if addrs.is_empty() {
        return Err(Error::NoAddressResolved(host.to_string()));
    }
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.map(Error::from).unwrap_or_else(|| Error::NoAddressResolved(host.to_string())))
}

/// Connects to `url` (`ws://` or `wss://`), performs the upgrade handshake,
/// and returns a ready-to-use connection. Addresses returned by DNS
/// resolution are tried in order until one accepts.
pub async fn connect(url: &str, config: ClientConfig) -> Result<(WsReader, WsWriter), Error> {
    let parsed = Url::parse(url)?;
    let secure = match parsed.scheme() {
        "ws" => false,
        "wss" => true,
        _ => return Err(Error::InvalidSchemeUrl),
    };
    let host = parsed.host_str().ok_or(Error::UrlNoHost)?.to_string();
    let port = parsed.port_or_known_default().unwrap_or(if secure { 443 } else { 80 });
    let path = match parsed.query() {
        Some(query) => format!("{}?{}", if parsed.path().is_empty() { "/" } else { parsed.path() }, query),
        None => if parsed.path().is_empty() { "/".to_string() } else { parsed.path().to_string() },
    };

    let tcp = connect_tcp(&host, port).await?;
    tcp.set_nodelay(true)?;

    let mut stream = if secure {
        let server_name = ServerName::try_from(host.clone())?;
        let connector = TlsConnector::from(tls_client_config());
        let tls = connector.connect(server_name, tcp).await?;
        WsStream::Tls(Box::new(TlsStream::from(tls)))
    } else {
        WsStream::Plain(tcp)
    };

    let key = generate_websocket_key();
    let host_header = config.host_override.clone().unwrap_or_else(|| match (secure, port) {
        (false, 80) | (true, 443) => host.clone(),
        _ => format!("{host}:{port}"),
    });

    let mut request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host_header}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n"
    );
    if config.web_socket_config.compression {
        request.push_str("Sec-WebSocket-Extensions: permessage-deflate\r\n");
    }
    for (name, value) in &config.headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let response = read_response(&mut stream).await?;
    let expected_accept = generate_websocket_accept_value(key);
    let compression = validate_response(&response, &expected_accept)? && config.web_socket_config.compression;

    let flags = Flags { server: false, compression };
    Ok(new_connection(stream, flags, config.web_socket_config.clone(), response.leftover))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_header_names_cover_the_handshake_headers() {
        assert_eq!(canonical_header_name("upgrade"), Some("Upgrade"));
        assert_eq!(canonical_header_name("sec-websocket-accept"), Some("Sec-WebSocket-Accept"));
        assert_eq!(canonical_header_name("x-custom"), None);
    }

    #[tokio::test]
    async fn rejects_non_websocket_scheme() {
        let result = connect("http://example.com", ClientConfig::default()).await;
        assert!(matches!(result, Err(Error::InvalidSchemeUrl)));
    }
}

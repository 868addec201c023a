//! HTTP/1.1 request parsing for the server-side upgrade handshake. The
//! handshake request never carries a body, so this reads only the request
//! line and headers.

use std::collections::HashMap;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::{timeout, Duration};

use crate::error::Error;

const MAX_HEADER_BYTES: usize = 16 * 1024;
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct HttpRequest {
    pub method: String,
    pub uri: String,
    pub version: String,
    headers: HashMap<String, String>,
}

impl HttpRequest {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    /// Reads request-line-plus-headers from `reader` line by line under a
    /// timeout, so a connection that opens a socket and never finishes its
    /// handshake doesn't pin a task forever, then parses the whole thing
    /// with `httparse`.
    pub async fn parse<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> Result<HttpRequest, Error> {
        let mut raw = Vec::new();
        timeout(HEADER_READ_TIMEOUT, async {
            loop {
                let mut line = Vec::new();
                let n = reader.read_until(b'\n', &mut line).await?;
                if n == 0 {
                    return Err(Error::IncompleteHttpRequest);
                }
                raw.extend_from_slice(&line);
                if line == b"\r\n" || raw.len() > MAX_HEADER_BYTES {
                    break;
                }
            }
            Ok(())
        })
        .await??;

        let mut header_storage = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Request::new(&mut header_storage);
        match parsed.parse(&raw)? {
            httparse::Status::Complete(_) => {}
            httparse::Status::Partial => return Err(Error::IncompleteHttpRequest),
        }

        let method = parsed.method.ok_or(Error::MissingHttpMethod)?.to_string();
        let uri = parsed.path.ok_or(Error::MissingHttpUri)?.to_string();
        if parsed.version != Some(1) {
            return Err(Error::MissingHttpVersion);
        }

        let mut headers = HashMap::new();
        for header in parsed.headers.iter() {
            headers.insert(header.name.to_ascii_lowercase(), String::from_utf8_lossy(header.value).into_owned());
        }

        Ok(HttpRequest { method, uri, version: "HTTP/1.1".to_string(), headers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn parses_a_minimal_upgrade_request() {
        let raw = b"GET /chat HTTP/1.1\r\n\
            Host: example.com\r\n\
            Connection: Upgrade\r\n\
            Upgrade: websocket\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Version: 13\r\n\
            \r\n";
        let mut reader = BufReader::new(&raw[..]);
        let request = HttpRequest::parse(&mut reader).await.unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.uri, "/chat");
        assert_eq!(request.header("host"), Some("example.com"));
        assert_eq!(request.header("sec-websocket-key"), Some("dGhlIHNhbXBsZSBub25jZQ=="));
    }

    #[tokio::test]
    async fn header_lookup_is_case_insensitive() {
        let raw = b"GET / HTTP/1.1\r\nHOST: example.com\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let request = HttpRequest::parse(&mut reader).await.unwrap();
        assert_eq!(request.header("Host"), Some("example.com"));
    }
}

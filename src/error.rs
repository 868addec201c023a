use pki_types::InvalidDnsNameError;
use std::io;
use std::string::FromUtf8Error;
use thiserror::Error;
use tokio::time::error::Elapsed;
use url::ParseError;

/// RFC 6455 §7.4 status codes, plus the subset of §11.7 codes this engine ever
/// originates itself. Peers may send other codes; those pass through unexamined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    NormalClosure,
    EndpointUnavailable,
    ProtocolError,
    InvalidMessageType,
    Empty,
    InvalidPayloadData,
    PolicyViolation,
    MessageTooBig,
    MandatoryExtension,
    InternalServerError,
    Other(u16),
}

impl CloseCode {
    pub fn code(self) -> u16 {
        match self {
            CloseCode::NormalClosure => 1000,
            CloseCode::EndpointUnavailable => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::InvalidMessageType => 1003,
            CloseCode::Empty => 1005,
            CloseCode::InvalidPayloadData => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::MessageTooBig => 1009,
            CloseCode::MandatoryExtension => 1010,
            CloseCode::InternalServerError => 1011,
            CloseCode::Other(c) => c,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            1000 => CloseCode::NormalClosure,
            1001 => CloseCode::EndpointUnavailable,
            1002 => CloseCode::ProtocolError,
            1003 => CloseCode::InvalidMessageType,
            1005 => CloseCode::Empty,
            1007 => CloseCode::InvalidPayloadData,
            1008 => CloseCode::PolicyViolation,
            1009 => CloseCode::MessageTooBig,
            1010 => CloseCode::MandatoryExtension,
            1011 => CloseCode::InternalServerError,
            other => CloseCode::Other(other),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("channel communication error")]
    CommunicationError,

    // General errors
    #[error("{source}")]
    Timeout {
        #[from]
        source: Elapsed,
    },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    #[error("{source}")]
    FromUtf8Error {
        #[from]
        source: FromUtf8Error,
    },

    // Handshake errors
    #[error("invalid HTTP handshake request line")]
    InvalidHttpHandshake,

    #[error("Connection: Upgrade header missing in the request")]
    NoConnectionHeader,

    #[error("Upgrade: websocket header missing in the request")]
    NoUpgradeHeader,

    #[error("Host header missing in the request")]
    NoHostHeader,

    #[error("Sec-WebSocket-Key header missing or malformed")]
    InvalidSecWebSocketKey,

    #[error("Sec-WebSocket-Version must be 13")]
    UnsupportedVersion,

    #[error("Origin `{0}` is not in the server's allow-list")]
    OriginNotAllowed(String),

    #[error("server refused the upgrade with status {0}")]
    HandshakeRefused(u16),

    #[error("server did not upgrade the connection")]
    NoUpgrade,

    #[error("server sent an invalid Sec-WebSocket-Accept value")]
    InvalidAcceptKey,

    #[error("duplicate `{0}` header in handshake response")]
    DuplicateHeader(&'static str),

    #[error("no usable address resolved for host `{0}`")]
    NoAddressResolved(String),

    // Framing / protocol errors
    #[error("reserved bits set without a negotiated extension")]
    RsvNotZero,

    #[error("control frames must not be fragmented")]
    ControlFramesFragmented,

    #[error("control frame payload exceeds 125 bytes")]
    ControlFramePayloadSize,

    #[error("fragment_size `{0}` exceeds max_frame_size `{1}`")]
    CustomFragmentSizeExceeded(usize, usize),

    #[error("frame exceeds configured max_frame_size")]
    MaxFrameSize,

    #[error("message exceeds configured max_message_size")]
    MaxMessageSize,

    #[error("invalid frame while a fragmented message is already in progress")]
    InvalidFrameFragmentation,

    #[error("fragmented message already in progress")]
    FragmentedInProgress,

    #[error("continuation frame received with no fragmented message in progress")]
    InvalidContinuationFrame,

    #[error("invalid opcode")]
    InvalidOpcode,

    #[error("compressed flag set on a non-initial frame, or without a negotiated extension")]
    InvalidCompressedFrame,

    #[error("close frame payload must be empty or at least 2 bytes")]
    InvalidCloseFramePayload,

    #[error("text message is not valid UTF-8")]
    InvalidUtf8InTextMessage,

    #[error("client frame was not masked")]
    UnmaskedClientFrame,

    #[error("server frame was masked")]
    MaskedServerFrame,

    #[error("peer closed the connection without a close frame")]
    AbruptDisconnect,

    // Compression errors
    #[error("deflate stream error: {0}")]
    CompressionError(String),

    #[error("max_window_bits should be a value between 8 and 15")]
    InvalidMaxWindowBits,

    // Programming / user errors
    #[error("a receive is already in progress on this connection")]
    ConcurrentReceive,

    #[error("cannot send on a connection that is closing, closed, or aborted")]
    ConnectionNotOpen,

    // URL / HTTP parsing
    #[error("{source}")]
    UrlParseError {
        #[from]
        source: ParseError,
    },

    #[error("Invalid scheme in WebSocket URL")]
    InvalidSchemeUrl,

    #[error("URL has no host")]
    UrlNoHost,

    #[error("{source}")]
    HttpParseError {
        #[from]
        source: httparse::Error,
    },

    #[error("Incomplete HTTP request")]
    IncompleteHttpRequest,

    #[error("missing HTTP method")]
    MissingHttpMethod,

    #[error("missing HTTP URI")]
    MissingHttpUri,

    #[error("missing HTTP version")]
    MissingHttpVersion,

    #[error("invalid Content-Length header")]
    InvalidContentLength,

    #[error("{source}")]
    DomainError {
        #[from]
        source: InvalidDnsNameError,
    },
}

impl Error {
    /// True for errors that originate from the transport itself (peer reset, pipe
    /// closed, read past EOF) rather than a protocol or programming mistake. These
    /// are logged but never handed to a user `on_exception` callback.
    pub fn is_io_class(&self) -> bool {
        matches!(self, Error::Io { .. } | Error::Timeout { .. } | Error::AbruptDisconnect)
    }

    /// The close status this error should provoke when detected while parsing or
    /// assembling a message, or `None` if the connection should just abort.
    pub fn protocol_close_code(&self) -> Option<CloseCode> {
        match self {
            Error::RsvNotZero
            | Error::ControlFramesFragmented
            | Error::ControlFramePayloadSize
            | Error::InvalidFrameFragmentation
            | Error::FragmentedInProgress
            | Error::InvalidContinuationFrame
            | Error::InvalidOpcode
            | Error::InvalidCompressedFrame
            | Error::UnmaskedClientFrame
            | Error::MaskedServerFrame
            | Error::InvalidCloseFramePayload
            | Error::InvalidUtf8InTextMessage
            | Error::FromUtf8Error { .. } => Some(CloseCode::InvalidPayloadData),
            Error::MaxMessageSize => Some(CloseCode::MessageTooBig),
            _ => None,
        }
    }
}

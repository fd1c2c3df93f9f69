use core::fmt;

use std::error;

/// http/2 error codes carried by RST_STREAM and GOAWAY frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    /// unknown codes are treated as INTERNAL_ERROR.
    pub fn from_u32(v: u32) -> Self {
        match v {
            0x0 => Self::NoError,
            0x1 => Self::ProtocolError,
            0x2 => Self::InternalError,
            0x3 => Self::FlowControlError,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSizeError,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::CompressionError,
            0xa => Self::ConnectError,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            _ => Self::InternalError,
        }
    }
}

/// Violation of the http/2 framing layer.
#[derive(Debug, Clone)]
pub enum H2Error {
    /// Received a frame that violates the protocol.
    Protocol(String),
    /// HPACK header block failed to decode.
    Compression,
    /// window overflow or peer sending beyond granted credit.
    FlowControl,
    /// frame length exceeds the negotiated maximum or is malformed.
    FrameSize,
    /// peer closed the connection with GOAWAY carrying an error code.
    GoAway(ErrorCode),
}

impl H2Error {
    /// error code announced to the peer when this error tears the connection down.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Protocol(_) => ErrorCode::ProtocolError,
            Self::Compression => ErrorCode::CompressionError,
            Self::FlowControl => ErrorCode::FlowControlError,
            Self::FrameSize => ErrorCode::FrameSizeError,
            Self::GoAway(code) => *code,
        }
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

impl fmt::Display for H2Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(s) => write!(f, "protocol error: {s}"),
            Self::Compression => f.write_str("HPACK compression error"),
            Self::FlowControl => f.write_str("flow control error"),
            Self::FrameSize => f.write_str("frame size error"),
            Self::GoAway(code) => write!(f, "connection closed by peer: {code:?}"),
        }
    }
}

impl error::Error for H2Error {}

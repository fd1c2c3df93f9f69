//! per stream state machine.

use super::error::{ErrorCode, H2Error};

/// Why a stream reached [StreamState::Closed].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cause {
    /// both sides sent END_STREAM.
    EndStream,
    /// peer sent RST_STREAM.
    Reset(ErrorCode),
    /// we sent RST_STREAM.
    LocalReset(ErrorCode),
    /// stream was refused by GOAWAY or the connection failed.
    Connection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    /// promised by the peer through PUSH_PROMISE. clients disable push so this is never entered
    /// by a well behaved server.
    ReservedRemote,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed(Cause),
}

impl StreamState {
    /// we sent HEADERS opening the stream.
    pub fn send_headers(&mut self, end_stream: bool) -> Result<(), H2Error> {
        *self = match *self {
            Self::Idle if end_stream => Self::HalfClosedLocal,
            Self::Idle => Self::Open,
            s => return Err(H2Error::protocol(format!("send HEADERS on {s:?} stream"))),
        };
        Ok(())
    }

    /// we sent END_STREAM on DATA.
    pub fn send_end(&mut self) -> Result<(), H2Error> {
        *self = match *self {
            Self::Open => Self::HalfClosedLocal,
            Self::HalfClosedRemote => Self::Closed(Cause::EndStream),
            s => return Err(H2Error::protocol(format!("send END_STREAM on {s:?} stream"))),
        };
        Ok(())
    }

    /// peer sent HEADERS or DATA. `end_stream` closes the remote side.
    pub fn recv(&mut self, end_stream: bool) -> Result<(), H2Error> {
        match *self {
            Self::Idle | Self::Open | Self::ReservedRemote if !end_stream => *self = Self::Open,
            Self::Idle | Self::Open | Self::ReservedRemote => *self = Self::HalfClosedRemote,
            Self::HalfClosedLocal if end_stream => *self = Self::Closed(Cause::EndStream),
            Self::HalfClosedLocal => {}
            Self::HalfClosedRemote | Self::Closed(_) => {
                return Err(H2Error::protocol(format!("frame received on {self:?} stream")));
            }
        }
        Ok(())
    }

    /// any RST_STREAM, GOAWAY refusal or connection failure.
    pub fn close(&mut self, cause: Cause) {
        if !self.is_closed() {
            *self = Self::Closed(cause);
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }

    /// true once the peer can send nothing more.
    pub fn is_recv_closed(&self) -> bool {
        matches!(self, Self::HalfClosedRemote | Self::Closed(_))
    }

    pub fn is_send_closed(&self) -> bool {
        matches!(self, Self::HalfClosedLocal | Self::Closed(_))
    }
}

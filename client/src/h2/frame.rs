//! frame codec.
//!
//! Every frame starts with a 9 byte header:
//! ```text
//! +-----------------------------------------------+
//! |                 Length (24)                   |
//! +---------------+---------------+---------------+
//! |   Type (8)    |   Flags (8)   |
//! +-+-------------+---------------+-------------------------------+
//! |R|                 Stream Identifier (31)                      |
//! +=+=============================================================+
//! |                   Frame Payload (0...)                      ...
//! +---------------------------------------------------------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{
    error::{ErrorCode, H2Error},
    settings::Setting,
};

/// client connection preface.
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub const HEADER_LEN: usize = 9;

const DATA: u8 = 0x0;
const HEADERS: u8 = 0x1;
const PRIORITY: u8 = 0x2;
const RST_STREAM: u8 = 0x3;
const SETTINGS: u8 = 0x4;
const PUSH_PROMISE: u8 = 0x5;
const PING: u8 = 0x6;
const GOAWAY: u8 = 0x7;
const WINDOW_UPDATE: u8 = 0x8;
const CONTINUATION: u8 = 0x9;

const END_STREAM: u8 = 0x1;
const ACK: u8 = 0x1;
const END_HEADERS: u8 = 0x4;
const PADDED: u8 = 0x8;
const PRIORITY_FLAG: u8 = 0x20;

const STREAM_ID_MASK: u32 = 0x7fff_ffff;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream_id: u32,
        payload: Bytes,
        end_stream: bool,
        /// `Some(n)` when the frame was padded with `n` bytes.
        padding: Option<u8>,
    },
    /// a header block fragment. PRIORITY information is dropped on decode.
    Headers {
        stream_id: u32,
        block: Bytes,
        end_stream: bool,
        end_headers: bool,
    },
    Priority {
        stream_id: u32,
    },
    RstStream {
        stream_id: u32,
        code: ErrorCode,
    },
    Settings {
        ack: bool,
        settings: Vec<Setting>,
    },
    PushPromise {
        stream_id: u32,
        promised_id: u32,
    },
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        code: ErrorCode,
        debug: Bytes,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Continuation {
        stream_id: u32,
        block: Bytes,
        end_headers: bool,
    },
    /// unknown frame types are ignored.
    Unknown {
        kind: u8,
        stream_id: u32,
    },
}

impl Frame {
    pub fn data(stream_id: u32, payload: impl Into<Bytes>, end_stream: bool) -> Self {
        Self::Data {
            stream_id,
            payload: payload.into(),
            end_stream,
            padding: None,
        }
    }

    pub fn stream_id(&self) -> u32 {
        match *self {
            Self::Data { stream_id, .. }
            | Self::Headers { stream_id, .. }
            | Self::Priority { stream_id }
            | Self::RstStream { stream_id, .. }
            | Self::PushPromise { stream_id, .. }
            | Self::WindowUpdate { stream_id, .. }
            | Self::Continuation { stream_id, .. }
            | Self::Unknown { stream_id, .. } => stream_id,
            Self::Settings { .. } | Self::Ping { .. } | Self::GoAway { .. } => 0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Data { .. } => "DATA",
            Self::Headers { .. } => "HEADERS",
            Self::Priority { .. } => "PRIORITY",
            Self::RstStream { .. } => "RST_STREAM",
            Self::Settings { .. } => "SETTINGS",
            Self::PushPromise { .. } => "PUSH_PROMISE",
            Self::Ping { .. } => "PING",
            Self::GoAway { .. } => "GOAWAY",
            Self::WindowUpdate { .. } => "WINDOW_UPDATE",
            Self::Continuation { .. } => "CONTINUATION",
            Self::Unknown { .. } => "UNKNOWN",
        }
    }

    /// length counted against flow control windows. zero for everything but DATA.
    pub fn flow_len(&self) -> u32 {
        match self {
            Self::Data { payload, padding, .. } => {
                payload.len() as u32 + padding.map(|p| u32::from(p) + 1).unwrap_or(0)
            }
            _ => 0,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::Data {
                stream_id,
                payload,
                end_stream,
                padding,
            } => {
                let mut flags = flag(*end_stream, END_STREAM);
                match padding {
                    Some(pad) => {
                        flags |= PADDED;
                        head(buf, self.flow_len(), DATA, flags, *stream_id);
                        buf.put_u8(*pad);
                        buf.extend_from_slice(payload);
                        buf.put_bytes(0, usize::from(*pad));
                    }
                    None => {
                        head(buf, payload.len() as u32, DATA, flags, *stream_id);
                        buf.extend_from_slice(payload);
                    }
                }
            }
            Self::Headers {
                stream_id,
                block,
                end_stream,
                end_headers,
            } => {
                let flags = flag(*end_stream, END_STREAM) | flag(*end_headers, END_HEADERS);
                head(buf, block.len() as u32, HEADERS, flags, *stream_id);
                buf.extend_from_slice(block);
            }
            Self::Priority { stream_id } => {
                head(buf, 5, PRIORITY, 0, *stream_id);
                buf.put_u32(0);
                buf.put_u8(15);
            }
            Self::RstStream { stream_id, code } => {
                head(buf, 4, RST_STREAM, 0, *stream_id);
                buf.put_u32(*code as u32);
            }
            Self::Settings { ack, settings } => {
                let len = if *ack { 0 } else { settings.len() as u32 * 6 };
                head(buf, len, SETTINGS, flag(*ack, ACK), 0);
                if !*ack {
                    settings.iter().for_each(|s| s.encode(buf));
                }
            }
            Self::PushPromise { stream_id, promised_id } => {
                head(buf, 4, PUSH_PROMISE, END_HEADERS, *stream_id);
                buf.put_u32(*promised_id & STREAM_ID_MASK);
            }
            Self::Ping { ack, payload } => {
                head(buf, 8, PING, flag(*ack, ACK), 0);
                buf.extend_from_slice(payload);
            }
            Self::GoAway {
                last_stream_id,
                code,
                debug,
            } => {
                head(buf, 8 + debug.len() as u32, GOAWAY, 0, 0);
                buf.put_u32(*last_stream_id & STREAM_ID_MASK);
                buf.put_u32(*code as u32);
                buf.extend_from_slice(debug);
            }
            Self::WindowUpdate { stream_id, increment } => {
                head(buf, 4, WINDOW_UPDATE, 0, *stream_id);
                buf.put_u32(*increment & STREAM_ID_MASK);
            }
            Self::Continuation {
                stream_id,
                block,
                end_headers,
            } => {
                head(buf, block.len() as u32, CONTINUATION, flag(*end_headers, END_HEADERS), *stream_id);
                buf.extend_from_slice(block);
            }
            Self::Unknown { kind, stream_id } => head(buf, 0, *kind, 0, *stream_id),
        }
    }

    /// Decode one frame from the front of `buf`, advancing it.
    ///
    /// `Ok(None)` means more bytes are needed.
    pub fn decode(buf: &mut BytesMut, max_frame_size: u32) -> Result<Option<Self>, H2Error> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = (u32::from(buf[0]) << 16) | (u32::from(buf[1]) << 8) | u32::from(buf[2]);
        if len > max_frame_size {
            return Err(H2Error::FrameSize);
        }

        if buf.len() < HEADER_LEN + len as usize {
            return Ok(None);
        }

        let mut header = buf.split_to(HEADER_LEN);
        let mut payload = buf.split_to(len as usize).freeze();

        header.advance(3);
        let kind = header.get_u8();
        let flags = header.get_u8();
        let stream_id = header.get_u32() & STREAM_ID_MASK;

        let frame = match kind {
            DATA => {
                require_stream(stream_id, "DATA")?;
                let padding = strip_padding(&mut payload, flags)?;
                Self::Data {
                    stream_id,
                    payload,
                    end_stream: flags & END_STREAM != 0,
                    padding,
                }
            }
            HEADERS => {
                require_stream(stream_id, "HEADERS")?;
                strip_padding(&mut payload, flags)?;
                if flags & PRIORITY_FLAG != 0 {
                    if payload.len() < 5 {
                        return Err(H2Error::FrameSize);
                    }
                    payload.advance(5);
                }
                Self::Headers {
                    stream_id,
                    block: payload,
                    end_stream: flags & END_STREAM != 0,
                    end_headers: flags & END_HEADERS != 0,
                }
            }
            PRIORITY => {
                require_stream(stream_id, "PRIORITY")?;
                exact_len(&payload, 5)?;
                Self::Priority { stream_id }
            }
            RST_STREAM => {
                require_stream(stream_id, "RST_STREAM")?;
                exact_len(&payload, 4)?;
                Self::RstStream {
                    stream_id,
                    code: ErrorCode::from_u32(payload.get_u32()),
                }
            }
            SETTINGS => {
                require_connection(stream_id, "SETTINGS")?;
                let ack = flags & ACK != 0;
                if ack && !payload.is_empty() {
                    return Err(H2Error::FrameSize);
                }
                if payload.len() % 6 != 0 {
                    return Err(H2Error::FrameSize);
                }
                let mut settings = Vec::with_capacity(payload.len() / 6);
                while payload.has_remaining() {
                    let id = payload.get_u16();
                    let value = payload.get_u32();
                    if let Some(setting) = Setting::decode(id, value)? {
                        settings.push(setting);
                    }
                }
                Self::Settings { ack, settings }
            }
            PUSH_PROMISE => {
                require_stream(stream_id, "PUSH_PROMISE")?;
                strip_padding(&mut payload, flags)?;
                if payload.len() < 4 {
                    return Err(H2Error::FrameSize);
                }
                Self::PushPromise {
                    stream_id,
                    promised_id: payload.get_u32() & STREAM_ID_MASK,
                }
            }
            PING => {
                require_connection(stream_id, "PING")?;
                exact_len(&payload, 8)?;
                let mut data = [0; 8];
                payload.copy_to_slice(&mut data);
                Self::Ping {
                    ack: flags & ACK != 0,
                    payload: data,
                }
            }
            GOAWAY => {
                require_connection(stream_id, "GOAWAY")?;
                if payload.len() < 8 {
                    return Err(H2Error::FrameSize);
                }
                Self::GoAway {
                    last_stream_id: payload.get_u32() & STREAM_ID_MASK,
                    code: ErrorCode::from_u32(payload.get_u32()),
                    debug: payload,
                }
            }
            WINDOW_UPDATE => {
                exact_len(&payload, 4)?;
                let increment = payload.get_u32() & STREAM_ID_MASK;
                if increment == 0 {
                    return Err(H2Error::protocol("WINDOW_UPDATE with 0 increment"));
                }
                Self::WindowUpdate { stream_id, increment }
            }
            CONTINUATION => {
                require_stream(stream_id, "CONTINUATION")?;
                Self::Continuation {
                    stream_id,
                    block: payload,
                    end_headers: flags & END_HEADERS != 0,
                }
            }
            kind => Self::Unknown { kind, stream_id },
        };

        Ok(Some(frame))
    }
}

fn head(buf: &mut BytesMut, len: u32, kind: u8, flags: u8, stream_id: u32) {
    buf.reserve(HEADER_LEN + len as usize);
    buf.put_uint(u64::from(len), 3);
    buf.put_u8(kind);
    buf.put_u8(flags);
    buf.put_u32(stream_id & STREAM_ID_MASK);
}

const fn flag(set: bool, flag: u8) -> u8 {
    if set { flag } else { 0 }
}

fn require_stream(stream_id: u32, name: &str) -> Result<(), H2Error> {
    if stream_id == 0 {
        return Err(H2Error::protocol(format!("{name} on stream 0")));
    }
    Ok(())
}

fn require_connection(stream_id: u32, name: &str) -> Result<(), H2Error> {
    if stream_id != 0 {
        return Err(H2Error::protocol(format!("{name} on stream {stream_id}")));
    }
    Ok(())
}

fn exact_len(payload: &Bytes, len: usize) -> Result<(), H2Error> {
    if payload.len() != len {
        return Err(H2Error::FrameSize);
    }
    Ok(())
}

fn strip_padding(payload: &mut Bytes, flags: u8) -> Result<Option<u8>, H2Error> {
    if flags & PADDED == 0 {
        return Ok(None);
    }
    if payload.is_empty() {
        return Err(H2Error::FrameSize);
    }
    let pad = payload.get_u8();
    if usize::from(pad) > payload.len() {
        return Err(H2Error::protocol("padding exceeds payload"));
    }
    payload.truncate(payload.len() - usize::from(pad));
    Ok(Some(pad))
}

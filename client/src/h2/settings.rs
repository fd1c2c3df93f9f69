//! SETTINGS parameters.

use bytes::{BufMut, BytesMut};

use super::{
    error::H2Error,
    flow::{DEFAULT_WINDOW, MAX_WINDOW},
};

const HEADER_TABLE_SIZE: u16 = 0x1;
const ENABLE_PUSH: u16 = 0x2;
const MAX_CONCURRENT_STREAMS: u16 = 0x3;
const INITIAL_WINDOW_SIZE: u16 = 0x4;
const MAX_FRAME_SIZE: u16 = 0x5;
const MAX_HEADER_LIST_SIZE: u16 = 0x6;

pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
const MAX_MAX_FRAME_SIZE: u32 = 16_777_215;

/// One (identifier, value) pair of a SETTINGS frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    HeaderTableSize(u32),
    EnablePush(bool),
    MaxConcurrentStreams(u32),
    InitialWindowSize(u32),
    MaxFrameSize(u32),
    MaxHeaderListSize(u32),
}

impl Setting {
    /// validate one pair. unknown identifiers yield `None` and must be ignored.
    pub(crate) fn decode(id: u16, value: u32) -> Result<Option<Self>, H2Error> {
        let setting = match id {
            HEADER_TABLE_SIZE => Self::HeaderTableSize(value),
            ENABLE_PUSH => match value {
                0 => Self::EnablePush(false),
                1 => Self::EnablePush(true),
                _ => return Err(H2Error::protocol("ENABLE_PUSH must be 0 or 1")),
            },
            MAX_CONCURRENT_STREAMS => Self::MaxConcurrentStreams(value),
            INITIAL_WINDOW_SIZE => {
                if i64::from(value) > MAX_WINDOW {
                    return Err(H2Error::FlowControl);
                }
                Self::InitialWindowSize(value)
            }
            MAX_FRAME_SIZE => {
                if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&value) {
                    return Err(H2Error::protocol("MAX_FRAME_SIZE out of range"));
                }
                Self::MaxFrameSize(value)
            }
            MAX_HEADER_LIST_SIZE => Self::MaxHeaderListSize(value),
            _ => return Ok(None),
        };

        Ok(Some(setting))
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        let (id, value) = match *self {
            Self::HeaderTableSize(v) => (HEADER_TABLE_SIZE, v),
            Self::EnablePush(v) => (ENABLE_PUSH, u32::from(v)),
            Self::MaxConcurrentStreams(v) => (MAX_CONCURRENT_STREAMS, v),
            Self::InitialWindowSize(v) => (INITIAL_WINDOW_SIZE, v),
            Self::MaxFrameSize(v) => (MAX_FRAME_SIZE, v),
            Self::MaxHeaderListSize(v) => (MAX_HEADER_LIST_SIZE, v),
        };
        buf.put_u16(id);
        buf.put_u32(value);
    }
}

/// Settings announced by one side of a connection.
///
/// Values not announced keep their protocol defaults. `None` means unlimited.
#[derive(Debug, Clone)]
pub struct Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: DEFAULT_WINDOW,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: None,
        }
    }
}

impl Settings {
    /// settings a client announces: push disabled and the given stream window.
    pub fn client(initial_window_size: u32) -> Vec<Setting> {
        vec![
            Setting::EnablePush(false),
            Setting::InitialWindowSize(initial_window_size),
        ]
    }

    pub fn apply(&mut self, setting: Setting) {
        match setting {
            Setting::HeaderTableSize(v) => self.header_table_size = v,
            Setting::EnablePush(v) => self.enable_push = v,
            Setting::MaxConcurrentStreams(v) => self.max_concurrent_streams = Some(v),
            Setting::InitialWindowSize(v) => self.initial_window_size = v,
            Setting::MaxFrameSize(v) => self.max_frame_size = v,
            Setting::MaxHeaderListSize(v) => self.max_header_list_size = Some(v),
        }
    }
}

// SPDX-License-Identifier: MPL-2.0

use crate::mqtt_serde::control_packet::MqttPacket;
use crate::mqtt_serde::parser::{frame_bounds, ParseError};
use bytes::{Buf, Bytes, BytesMut};

/// A raw frame cut from the stream: the fixed header byte and exactly the
/// bytes covered by the remaining length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub header: u8,
    pub body: Bytes,
}

impl RawFrame {
    pub fn decode(&self) -> Result<MqttPacket, ParseError> {
        MqttPacket::decode(self.header, &self.body)
    }
}

/// A stateful parser for a stream of MQTT data.
/// It internally buffers data from a stream and yields complete frames.
#[derive(Debug)]
pub struct MqttParser {
    buffer: BytesMut,
}

impl Default for MqttParser {
    fn default() -> Self {
        Self::new(16384)
    }
}

impl MqttParser {
    pub fn new(buffer_size: usize) -> Self {
        MqttParser {
            buffer: BytesMut::with_capacity(buffer_size),
        }
    }

    /// Appends new data from the stream to the internal buffer.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Cuts the next whole frame off the buffer.
    ///
    /// - `Ok(Some(frame))` when a full frame was buffered; its bytes are consumed.
    /// - `Ok(None)` when more input is needed.
    /// - `Err` when the fixed header cannot be framed; the stream is unusable.
    pub fn next_frame(&mut self) -> Result<Option<RawFrame>, ParseError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        match frame_bounds(&self.buffer)? {
            Ok((_, header_len, total_len)) => {
                let mut frame = self.buffer.split_to(total_len);
                let header = frame[0];
                frame.advance(header_len);
                Ok(Some(RawFrame {
                    header,
                    body: frame.freeze(),
                }))
            }
            Err(_) => Ok(None),
        }
    }

    /// Like [`MqttParser::next_frame`] but decodes the frame as well.
    pub fn next_packet(&mut self) -> Result<Option<MqttPacket>, ParseError> {
        match self.next_frame()? {
            Some(frame) => frame.decode().map(Some),
            None => Ok(None),
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }
}

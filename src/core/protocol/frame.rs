// src/core/protocol/frame.rs

//! Implements the fixed-header cluster frame and the corresponding
//! `Encoder` and `Decoder` for network communication.
//!
//! Wire layout: `counter:u32 BE ‖ payload_len:u32 BE ‖ command:12 bytes`
//! followed by `payload_len` payload bytes. The command is ASCII, padded
//! with spaces to 12 bytes; only the first space-delimited token is
//! significant. When a cipher is installed the payload travels sealed and
//! `payload_len` counts the sealed bytes.

use crate::core::SentraError;
use crate::core::protocol::cipher::{CIPHER_OVERHEAD, PayloadCipher};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum length of a command token.
pub const COMMAND_LEN: usize = 12;
/// Fixed header size: two big-endian u32 words plus the command field.
pub const HEADER_LEN: usize = 8 + COMMAND_LEN;
/// Maximum plaintext payload carried by a single frame.
pub const MAX_PAYLOAD: usize = 1_000_000;
/// Maximum total size of a string sent through the chunked sub-protocol.
pub const MAX_STRING_SIZE: usize = 100_000_000;

/// A single decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// The 32-bit exchange identifier pairing a request with its reply.
    pub counter: u32,
    /// The command verb (first space-delimited token of the command field).
    pub command: String,
    /// The plaintext payload.
    pub payload: Bytes,
}

impl Frame {
    pub fn new(counter: u32, command: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            counter,
            command: command.into(),
            payload: payload.into(),
        }
    }
}

/// Serializes one frame into bytes, sealing the payload when a cipher is
/// installed.
pub fn build_frame(
    counter: u32,
    command: &str,
    payload: &[u8],
    cipher: Option<&PayloadCipher>,
) -> Result<Vec<u8>, SentraError> {
    if command.len() > COMMAND_LEN {
        return Err(SentraError::CommandTooLong(command.len(), COMMAND_LEN));
    }
    if payload.len() > MAX_PAYLOAD {
        return Err(SentraError::Oversize {
            got: payload.len(),
            max: MAX_PAYLOAD,
        });
    }

    let wire_payload = match cipher {
        Some(c) if !payload.is_empty() => c.seal(payload)?,
        _ => payload.to_vec(),
    };

    let mut out = Vec::with_capacity(HEADER_LEN + wire_payload.len());
    out.put_u32(counter);
    out.put_u32(wire_payload.len() as u32);
    out.extend_from_slice(command.as_bytes());
    out.resize(HEADER_LEN, b' ');
    out.extend_from_slice(&wire_payload);
    Ok(out)
}

/// The pure decoding function. Inspects `buf` without mutating it and
/// returns `Ok(None)` while the buffer does not yet hold a complete frame,
/// or `(consumed, counter, command, payload)` once it does.
pub fn parse_frame(
    buf: &[u8],
    cipher: Option<&PayloadCipher>,
) -> Result<Option<(usize, u32, String, Bytes)>, SentraError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let counter = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let payload_len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;

    // Sealed payloads carry the AEAD overhead on top of the plaintext limit.
    let max_wire = MAX_PAYLOAD + if cipher.is_some() { CIPHER_OVERHEAD } else { 0 };
    if payload_len > max_wire {
        return Err(SentraError::Oversize {
            got: payload_len,
            max: max_wire,
        });
    }

    let command_field = &buf[8..HEADER_LEN];
    if !command_field.is_ascii() {
        return Err(SentraError::UnknownCommand(format!("{command_field:?}")));
    }
    let command_field = std::str::from_utf8(command_field)?;
    let command = command_field
        .split(' ')
        .next()
        .unwrap_or_default()
        .to_string();

    if buf.len() < HEADER_LEN + payload_len {
        return Ok(None);
    }

    let wire_payload = &buf[HEADER_LEN..HEADER_LEN + payload_len];
    let payload = match cipher {
        Some(c) if !wire_payload.is_empty() => {
            let plaintext = c.open(wire_payload)?;
            if plaintext.len() > MAX_PAYLOAD {
                return Err(SentraError::Oversize {
                    got: plaintext.len(),
                    max: MAX_PAYLOAD,
                });
            }
            Bytes::from(plaintext)
        }
        _ => Bytes::copy_from_slice(wire_payload),
    };

    Ok(Some((HEADER_LEN + payload_len, counter, command, payload)))
}

/// A `tokio_util::codec` implementation for encoding and decoding [`Frame`]s.
#[derive(Debug, Clone, Default)]
pub struct FrameCodec {
    cipher: Option<PayloadCipher>,
}

impl FrameCodec {
    pub fn new(cipher: Option<PayloadCipher>) -> Self {
        Self { cipher }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = SentraError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = build_frame(
            item.counter,
            &item.command,
            &item.payload,
            self.cipher.as_ref(),
        )?;
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = SentraError;

    /// Decodes a [`Frame`] from a `BytesMut` buffer.
    ///
    /// It returns `Ok(None)` if the buffer does not contain a full frame yet,
    /// allowing the `Framed` stream to wait for more data from the network.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match parse_frame(src, self.cipher.as_ref())? {
            Some((consumed, counter, command, payload)) => {
                // Advance the buffer past the successfully parsed frame.
                src.advance(consumed);
                Ok(Some(Frame {
                    counter,
                    command,
                    payload,
                }))
            }
            None => Ok(None),
        }
    }
}

// src/core/protocol/mod.rs

//! The framed wire protocol spoken between cluster nodes.

pub mod cipher;
pub mod frame;

pub use cipher::PayloadCipher;
pub use frame::{COMMAND_LEN, Frame, FrameCodec, HEADER_LEN, MAX_PAYLOAD, MAX_STRING_SIZE};
pub use frame::{build_frame, parse_frame};

//! # termbroker protocol
//!
//! Wire-level definitions shared by the termbroker daemon and the processes
//! that talk to it.
//!
//! ## Overview
//!
//! - **Opcodes**: the stable numeric catalog of requests and replies
//! - **Envelopes**: opcode, two integer arguments, a typed payload and the
//!   correlation ids that pair a blocking call with its reply
//! - **Frame Codec**: length-prefixed framing with optional LZ4 compression
//!
//! ## Layering
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │               Envelope                  │  MessagePack-encoded
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  Length-prefixed, LZ4
//! ├─────────────────────────────────────────┤
//! │   Unix stream socket (+ SCM_RIGHTS)     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Envelope, FrameCodec, Opcode, Payload, Registration};
//!
//! let envelope = Envelope::new(Opcode::REGISTER_TRACKED_PROCESS)
//!     .with_payload(Payload::Registration(Registration::new("demo", 4321)));
//!
//! let codec = FrameCodec::new();
//! let bytes = codec.encode(&envelope).unwrap();
//! let (decoded, _) = codec.try_decode(&bytes).unwrap().unwrap();
//! assert_eq!(decoded, envelope);
//! ```

pub mod error;
pub mod framing;
pub mod messages;
pub mod opcode;

pub use error::{ProtocolError, Result};
pub use framing::{
    FrameBuffer, FrameCodec, FrameFlags, COMPRESSION_THRESHOLD, FRAME_HEADER_SIZE, FRAME_MAGIC,
    MAX_FRAME_SIZE,
};
pub use messages::{
    Envelope, Failure, Payload, Registration, SessionKindTag, SessionRequest, SessionSummary,
    INVALID_IDENTITY, PROTOCOL_VERSION,
};
pub use opcode::Opcode;

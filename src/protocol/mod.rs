//! WebSocket wire protocol: framing, masking, parsing, UTF-8 validation.

pub mod frame;
pub mod mask;
pub mod opcode;
pub mod parser;
pub mod utf8;

pub use frame::{encode_close_payload, Frame, MAX_CONTROL_PAYLOAD, RSV1};
pub use mask::{apply_mask, apply_mask_fast};
pub use opcode::OpCode;
pub use parser::{FrameEvent, FrameParser};
pub use utf8::Utf8Validator;

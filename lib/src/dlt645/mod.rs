//! DL/T 645-2007 support: frame layer, request/response codec and the data
//! identifier registry.

pub mod codec;
pub mod frame;
pub mod registers;

pub use codec::{
    build_read_address_frame, build_read_frame, build_write_frame, parse_error_response,
    parse_read_response,
};
pub use frame::{Frame, FrameAssembler, FrameError};

mod byte_cursor;
pub(crate) mod bytes;
mod hexdump;
mod utf16;
mod windows;

pub(crate) use self::byte_cursor::ByteCursor;
pub(crate) use self::hexdump::dump_around;
pub(crate) use self::utf16::decode_utf16le_lossy;
pub(crate) use self::windows::{filetime_to_timestamp, format_timestamp, systime_to_timestamp};
pub use self::windows::INVALID_TIMESTAMP_SENTINEL;

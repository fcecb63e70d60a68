//! Non-blocking MariaDB/MySQL wire protocol: framing, handshake/auth, command
//! encode/decode, and result materialisation. Everything here is pure
//! byte-buffer manipulation; none of it performs I/O. [`crate::connector`]
//! drives these functions against a non-blocking socket.

pub mod command;
pub mod handshake;
pub mod column_definition;
pub mod packet;
pub mod params;
pub mod primitive;
pub mod response;
pub mod row;

pub use column_definition::{ColumnDefinition, ColumnDefinitions};
pub use row::{BinaryRow, NullBitmap, TextRow};

use crate::constant::ColumnType;
use crate::error::Result;
use crate::wire::primitive::*;
use crate::wire::row::null_bitmap_len;

/// A single bound parameter: raw bytes, or NULL. Matches the scope of the
/// public API, which never infers a richer type than "bytes or null".
pub type ParamValue<'a> = Option<&'a [u8]>;

pub fn encode_null_bitmap(params: &[ParamValue<'_>], out: &mut Vec<u8>) {
    let len = null_bitmap_len(params.len(), 0);
    let start = out.len();
    out.resize(start + len, 0);
    for (i, p) in params.iter().enumerate() {
        if p.is_none() {
            out[start + i / 8] |= 1 << (i % 8);
        }
    }
}

pub fn encode_types(params: &[ParamValue<'_>], out: &mut Vec<u8>) {
    for _ in params {
        out.push(ColumnType::MYSQL_TYPE_VAR_STRING as u8);
        out.push(0x00);
    }
}

pub fn encode_values(params: &[ParamValue<'_>], out: &mut Vec<u8>) -> Result<()> {
    for param in params {
        if let Some(bytes) = param {
            write_bytes_lenenc(out, bytes);
        }
    }
    Ok(())
}

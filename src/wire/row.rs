use crate::constant::ColumnType;
use crate::error::{Error, Result, eyre};
use crate::wire::column_definition::ColumnDefinition;
use crate::wire::primitive::*;

/// NULL bitmap used by the binary protocol, for both result-set rows (bit
/// offset 2, per `COM_STMT_EXECUTE` response framing) and bound parameters
/// (bit offset 0).
#[derive(Debug, Clone, Copy)]
pub struct NullBitmap<'a> {
    bitmap: &'a [u8],
    offset: usize,
}

impl<'a> NullBitmap<'a> {
    pub fn for_result_set(bitmap: &'a [u8]) -> Self {
        Self { bitmap, offset: 2 }
    }

    pub fn for_parameters(bitmap: &'a [u8]) -> Self {
        Self { bitmap, offset: 0 }
    }

    pub fn is_null(&self, idx: usize) -> bool {
        let bit_pos = idx + self.offset;
        let byte_pos = bit_pos >> 3;
        let bit_offset = bit_pos & 7;
        match self.bitmap.get(byte_pos) {
            Some(byte) => byte & (1 << bit_offset) != 0,
            None => false,
        }
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bitmap
    }
}

pub fn null_bitmap_len(num_columns: usize, offset: usize) -> usize {
    (num_columns + offset + 7) / 8
}

#[derive(Debug, Clone, Copy)]
pub struct BinaryRow<'a> {
    null_bitmap: NullBitmap<'a>,
    values: &'a [u8],
    num_columns: usize,
}

impl<'a> BinaryRow<'a> {
    pub fn num_columns(&self) -> usize {
        self.num_columns
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TextRow<'a>(pub &'a [u8]);

/// Parse the `Protocol::BinaryResultsetRow` header (status byte + NULL bitmap)
/// and return the row with its NULL bitmap and remaining value bytes.
pub fn read_binary_row(payload: &[u8], num_columns: usize) -> Result<BinaryRow<'_>> {
    let (header, data) = read_int_1(payload)?;
    if header != 0x00 {
        return Err(Error::InvalidPacket);
    }
    let len = null_bitmap_len(num_columns, 2);
    let (bitmap, values) = read_string_fix(data, len)?;
    Ok(BinaryRow {
        null_bitmap: NullBitmap::for_result_set(bitmap),
        values,
        num_columns,
    })
}

/// Width, in bytes, that a non-NULL binary-protocol value of this type
/// occupies, given the bytes immediately following the NULL bitmap.
fn binary_value_width(column_type: ColumnType, data: &[u8]) -> Result<usize> {
    use ColumnType::*;
    Ok(match column_type {
        MYSQL_TYPE_NULL => 0,
        MYSQL_TYPE_TINY => 1,
        MYSQL_TYPE_SHORT | MYSQL_TYPE_YEAR => 2,
        MYSQL_TYPE_LONG | MYSQL_TYPE_INT24 | MYSQL_TYPE_FLOAT => 4,
        MYSQL_TYPE_LONGLONG | MYSQL_TYPE_DOUBLE => 8,
        MYSQL_TYPE_DATE
        | MYSQL_TYPE_DATETIME
        | MYSQL_TYPE_TIMESTAMP
        | MYSQL_TYPE_TIMESTAMP2
        | MYSQL_TYPE_DATETIME2
        | MYSQL_TYPE_NEWDATE
        | MYSQL_TYPE_TIME
        | MYSQL_TYPE_TIME2 => {
            let (len, _) = read_int_1(data)?;
            1 + len as usize
        }
        MYSQL_TYPE_VARCHAR
        | MYSQL_TYPE_VAR_STRING
        | MYSQL_TYPE_STRING
        | MYSQL_TYPE_BLOB
        | MYSQL_TYPE_TINY_BLOB
        | MYSQL_TYPE_MEDIUM_BLOB
        | MYSQL_TYPE_LONG_BLOB
        | MYSQL_TYPE_GEOMETRY
        | MYSQL_TYPE_JSON
        | MYSQL_TYPE_DECIMAL
        | MYSQL_TYPE_NEWDECIMAL
        | MYSQL_TYPE_ENUM
        | MYSQL_TYPE_SET
        | MYSQL_TYPE_BIT
        | MYSQL_TYPE_TYPED_ARRAY => {
            let (s, _) = read_string_lenenc(data)?;
            encoded_lenenc_header_len(data)? + s.len()
        }
    })
}

fn encoded_lenenc_header_len(data: &[u8]) -> Result<usize> {
    match data.first() {
        None => Err(Error::UnexpectedEof),
        Some(0xFC) => Ok(3),
        Some(0xFD) => Ok(4),
        Some(0xFE) => Ok(9),
        Some(_) => Ok(1),
    }
}

/// Split a binary-protocol row into one `Option<&[u8]>` cell per column,
/// consuming each value's column-type-specific width and leaving the *meaning*
/// of those bytes uninterpreted beyond NULL-or-not.
pub fn binary_row_cells<'a>(row: &BinaryRow<'a>, defs: &[ColumnDefinition<'_>]) -> Result<Vec<Option<&'a [u8]>>> {
    if defs.len() != row.num_columns {
        return Err(Error::LibraryBug(eyre!(
            "column definition count {} does not match row column count {}",
            defs.len(),
            row.num_columns
        )));
    }

    let mut cells = Vec::with_capacity(row.num_columns);
    let mut data = row.values;
    for (idx, def) in defs.iter().enumerate() {
        if row.null_bitmap.is_null(idx) {
            cells.push(None);
            continue;
        }
        let column_type = def.tail.column_type()?;
        let width = binary_value_width(column_type, data)?;
        if data.len() < width {
            return Err(Error::UnexpectedEof);
        }
        let (cell, rest) = data.split_at(width);
        cells.push(Some(strip_lenenc_header(column_type, cell)?));
        data = rest;
    }
    Ok(cells)
}

/// For length-encoded types, drop the header bytes so the cell is exactly the
/// payload; fixed-width numeric types are returned verbatim (raw little-endian bytes).
fn strip_lenenc_header(column_type: ColumnType, cell: &[u8]) -> Result<&[u8]> {
    use ColumnType::*;
    match column_type {
        MYSQL_TYPE_VARCHAR
        | MYSQL_TYPE_VAR_STRING
        | MYSQL_TYPE_STRING
        | MYSQL_TYPE_BLOB
        | MYSQL_TYPE_TINY_BLOB
        | MYSQL_TYPE_MEDIUM_BLOB
        | MYSQL_TYPE_LONG_BLOB
        | MYSQL_TYPE_GEOMETRY
        | MYSQL_TYPE_JSON
        | MYSQL_TYPE_DECIMAL
        | MYSQL_TYPE_NEWDECIMAL
        | MYSQL_TYPE_ENUM
        | MYSQL_TYPE_SET
        | MYSQL_TYPE_BIT
        | MYSQL_TYPE_TYPED_ARRAY => {
            let (s, _) = read_string_lenenc(cell)?;
            Ok(s)
        }
        MYSQL_TYPE_DATE
        | MYSQL_TYPE_DATETIME
        | MYSQL_TYPE_TIMESTAMP
        | MYSQL_TYPE_TIMESTAMP2
        | MYSQL_TYPE_DATETIME2
        | MYSQL_TYPE_NEWDATE
        | MYSQL_TYPE_TIME
        | MYSQL_TYPE_TIME2 => Ok(&cell[1..]),
        _ => Ok(cell),
    }
}

/// Split a text-protocol row packet into `num_columns` cells; `0xFB` marks NULL.
pub fn text_row_cells(row: &TextRow<'_>, num_columns: usize) -> Result<Vec<Option<&[u8]>>> {
    let mut cells = Vec::with_capacity(num_columns);
    let mut data = row.0;
    for _ in 0..num_columns {
        if data.first() == Some(&0xFB) {
            cells.push(None);
            data = &data[1..];
            continue;
        }
        let (s, rest) = read_string_lenenc(data)?;
        cells.push(Some(s));
        data = rest;
    }
    Ok(cells)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_bitmap_result_set_offset() {
        let bitmap = [0b0000_0100u8, 0b0001_0000];
        let nb = NullBitmap::for_result_set(&bitmap);
        assert!(nb.is_null(0));
        assert!(!nb.is_null(1));
        assert!(nb.is_null(10));
    }

    #[test]
    fn text_row_cells_with_null() {
        let mut payload = Vec::new();
        payload.push(0xFB); // NULL
        payload.push(2);
        payload.extend_from_slice(b"hi");
        let row = TextRow(&payload);
        let cells = text_row_cells(&row, 2).unwrap();
        assert_eq!(cells[0], None);
        assert_eq!(cells[1], Some(&b"hi"[..]));
    }
}

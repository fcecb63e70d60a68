use crate::constant::{ColumnFlags, ColumnType};
use crate::error::{Error, Result, eyre};
use crate::wire::primitive::*;
use zerocopy::byteorder::little_endian::{U16 as U16LE, U32 as U32LE};
use zerocopy::{FromBytes, Immutable, KnownLayout};

/// `Protocol::ColumnDefinition41`.
#[derive(Debug, Clone)]
pub struct ColumnDefinition<'a> {
    pub schema: &'a [u8],
    pub table_alias: &'a [u8],
    pub table_original: &'a [u8],
    pub name_alias: &'a [u8],
    pub name_original: &'a [u8],
    pub tail: &'a ColumnDefinitionTail,
}

impl<'a> ColumnDefinition<'a> {
    pub fn name(&self) -> &'a [u8] {
        self.name_alias
    }
}

/// Fixed-size tail of a column definition packet (12 bytes).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
pub struct ColumnDefinitionTail {
    charset: U16LE,
    column_length: U32LE,
    column_type: u8,
    flags: U16LE,
    decimals: u8,
    _reserved: U16LE,
}

impl ColumnDefinitionTail {
    pub fn charset(&self) -> u16 {
        self.charset.get()
    }

    pub fn column_length(&self) -> u32 {
        self.column_length.get()
    }

    pub fn column_type(&self) -> Result<ColumnType> {
        ColumnType::from_u8(self.column_type)
            .ok_or_else(|| Error::LibraryBug(eyre!("unknown column type: 0x{:02X}", self.column_type)))
    }

    pub fn flags(&self) -> ColumnFlags {
        ColumnFlags::from_bits_truncate(self.flags.get())
    }

    pub fn decimals(&self) -> u8 {
        self.decimals
    }
}

/// Parse one `Protocol::ColumnDefinition41` packet payload.
pub fn parse_column_definition(payload: &[u8]) -> Result<ColumnDefinition<'_>> {
    let (_catalog, data) = read_string_lenenc(payload)?;
    let (schema, data) = read_string_lenenc(data)?;
    let (table_alias, data) = read_string_lenenc(data)?;
    let (table_original, data) = read_string_lenenc(data)?;
    let (name_alias, data) = read_string_lenenc(data)?;
    let (name_original, data) = read_string_lenenc(data)?;

    let (_fixed_len, data) = read_int_lenenc(data)?;
    if data.len() < 12 {
        return Err(Error::LibraryBug(eyre!(
            "column definition tail too short: {} < 12",
            data.len()
        )));
    }
    let tail = ColumnDefinitionTail::ref_from_bytes(&data[..12])?;

    Ok(ColumnDefinition {
        schema,
        table_alias,
        table_original,
        name_alias,
        name_original,
        tail,
    })
}

/// Owns the raw bytes of N column-definition packets (each prefixed with a
/// native-endian `u32` length, written by the connector as it reads them off
/// the wire) and parses them back into borrowed [`ColumnDefinition`]s on demand.
///
/// Cached on a prepared statement across executions per the MariaDB
/// `CLIENT_CACHE_METADATA` capability: subsequent executes of the same
/// statement may omit metadata and reuse this cache.
#[derive(Debug, Clone)]
pub struct ColumnDefinitions {
    packets: Vec<u8>,
    count: usize,
}

impl ColumnDefinitions {
    pub fn new(count: usize, packets: Vec<u8>) -> Self {
        Self { packets, count }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn parse(&self) -> Result<Vec<ColumnDefinition<'_>>> {
        let mut buf = self.packets.as_slice();
        let mut defs = Vec::with_capacity(self.count);
        for _ in 0..self.count {
            if buf.len() < 4 {
                return Err(Error::LibraryBug(eyre!("column definition buffer truncated")));
            }
            let len = u32::from_ne_bytes(buf[..4].try_into().map_err(Error::from_debug)?) as usize;
            buf = &buf[4..];
            if buf.len() < len {
                return Err(Error::LibraryBug(eyre!("column definition buffer truncated")));
            }
            defs.push(parse_column_definition(&buf[..len])?);
            buf = &buf[len..];
        }
        Ok(defs)
    }
}

use crate::constant::CommandByte;
use crate::error::{Error, Result, eyre};
use crate::wire::params::ParamValue;
use crate::wire::primitive::*;
use crate::wire::response::ErrPayloadBytes;
use zerocopy::byteorder::little_endian::{U16 as U16LE, U32 as U32LE};
use zerocopy::{FromBytes, Immutable, KnownLayout};

pub fn write_query(out: &mut Vec<u8>, sql: &str) {
    write_int_1(out, CommandByte::Query as u8);
    out.extend_from_slice(sql.as_bytes());
}

pub fn write_ping(out: &mut Vec<u8>) {
    write_int_1(out, CommandByte::Ping as u8);
}

pub fn write_init_db(out: &mut Vec<u8>, database: &str) {
    write_int_1(out, CommandByte::InitDb as u8);
    out.extend_from_slice(database.as_bytes());
}

pub fn write_reset_connection(out: &mut Vec<u8>) {
    write_int_1(out, CommandByte::ResetConnection as u8);
}

pub fn write_quit(out: &mut Vec<u8>) {
    write_int_1(out, CommandByte::Quit as u8);
}

pub fn write_change_user(
    out: &mut Vec<u8>,
    username: &str,
    auth_response: &[u8],
    database: Option<&str>,
    charset: u8,
) {
    write_int_1(out, CommandByte::ChangeUser as u8);
    write_string_null(out, username);
    write_int_1(out, auth_response.len() as u8);
    out.extend_from_slice(auth_response);
    write_string_null(out, database.unwrap_or(""));
    write_int_2(out, u16::from(charset));
}

/// `COM_STMT_PREPARE` response header (12 bytes: status byte + 11 below).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
pub struct PrepareOk {
    statement_id: U32LE,
    num_columns: U16LE,
    num_params: U16LE,
    _reserved: u8,
    warning_count: U16LE,
}

impl PrepareOk {
    pub fn statement_id(&self) -> u32 {
        self.statement_id.get()
    }

    pub fn num_columns(&self) -> u16 {
        self.num_columns.get()
    }

    pub fn num_params(&self) -> u16 {
        self.num_params.get()
    }

    pub fn warning_count(&self) -> u16 {
        self.warning_count.get()
    }
}

pub fn write_prepare(out: &mut Vec<u8>, sql: &str) {
    write_int_1(out, CommandByte::StmtPrepare as u8);
    out.extend_from_slice(sql.as_bytes());
}

pub fn read_prepare_ok(payload: &[u8]) -> Result<PrepareOk> {
    let (status, data) = read_int_1(payload)?;
    if status != 0x00 {
        return Err(ErrPayloadBytes(payload).into());
    }
    if data.len() < 11 {
        return Err(Error::LibraryBug(eyre!("short COM_STMT_PREPARE OK: {} < 11", data.len())));
    }
    Ok(*PrepareOk::ref_from_bytes(&data[..11])?)
}

pub fn write_execute(out: &mut Vec<u8>, statement_id: u32, params: &[ParamValue<'_>]) -> Result<()> {
    use crate::wire::params::{encode_null_bitmap, encode_types, encode_values};

    write_int_1(out, CommandByte::StmtExecute as u8);
    write_int_4(out, statement_id);
    write_int_1(out, 0x00); // CURSOR_TYPE_NO_CURSOR
    write_int_4(out, 1); // iteration count

    if !params.is_empty() {
        encode_null_bitmap(params, out);
        write_int_1(out, 0x01); // new-params-bound-flag
        encode_types(params, out);
        encode_values(params, out)?;
    }
    Ok(())
}

pub fn write_close_statement(out: &mut Vec<u8>, statement_id: u32) {
    write_int_1(out, CommandByte::StmtClose as u8);
    write_int_4(out, statement_id);
}

pub fn write_reset_statement(out: &mut Vec<u8>, statement_id: u32) {
    write_int_1(out, CommandByte::StmtReset as u8);
    write_int_4(out, statement_id);
}

use crate::constant::CapabilityFlags;
use crate::error::{Error, Result};
use crate::wire::primitive::*;
use crate::wire::response::ErrPayloadBytes;

/// Initial handshake packet from server (`Protocol::HandshakeV10`).
#[derive(Debug, Clone)]
pub struct InitialHandshake<'a> {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub auth_plugin_data: Vec<u8>,
    pub capability_flags: CapabilityFlags,
    pub charset: u8,
    pub status_flags: u16,
    pub auth_plugin_name: &'a [u8],
}

pub fn read_initial_handshake(payload: &[u8]) -> Result<InitialHandshake<'_>> {
    let (protocol_version, mut data) = read_int_1(payload)?;

    if protocol_version == 0xFF {
        return Err(ErrPayloadBytes(payload).into());
    }

    let (server_version_bytes, rest) = read_string_null(data)?;
    let server_version = String::from_utf8_lossy(server_version_bytes).to_string();
    data = rest;

    let (connection_id, rest) = read_int_4(data)?;
    data = rest;

    let (auth_data_1, rest) = read_string_fix(data, 8)?;
    data = rest;

    let (_filler, rest) = read_int_1(data)?;
    data = rest;

    let (cap_lower, rest) = read_int_2(data)?;
    data = rest;

    let (charset, rest) = read_int_1(data)?;
    data = rest;

    let (status_flags, rest) = read_int_2(data)?;
    data = rest;

    let (cap_upper, rest) = read_int_2(data)?;
    data = rest;

    let cap_bits = (u32::from(cap_upper) << 16) | u32::from(cap_lower);
    let capability_flags = CapabilityFlags::from_bits_truncate(cap_bits);

    let (auth_data_len, rest) = read_int_1(data)?;
    data = rest;

    let (_reserved, rest) = read_string_fix(data, 10)?;
    data = rest;

    let auth_data_2_len = (auth_data_len as usize).saturating_sub(8).saturating_sub(1).max(12);
    let (auth_data_2, rest) = read_string_fix(data, auth_data_2_len)?;
    data = rest;

    let mut auth_plugin_data = Vec::with_capacity(8 + auth_data_2_len);
    auth_plugin_data.extend_from_slice(auth_data_1);
    auth_plugin_data.extend_from_slice(auth_data_2);

    let (auth_plugin_name, _rest) = read_string_null(data)?;

    Ok(InitialHandshake {
        protocol_version,
        server_version,
        connection_id,
        auth_plugin_data,
        capability_flags,
        charset,
        status_flags,
        auth_plugin_name,
    })
}

/// Client response to the initial handshake (`HandshakeResponse41`).
#[derive(Debug, Clone)]
pub struct HandshakeResponse41<'a> {
    pub capability_flags: CapabilityFlags,
    pub max_packet_size: u32,
    pub charset: u8,
    pub username: &'a str,
    pub auth_response: &'a [u8],
    pub database: Option<&'a str>,
    pub auth_plugin_name: Option<&'a str>,
}

pub fn write_handshake_response(out: &mut Vec<u8>, response: &HandshakeResponse41) {
    write_int_4(out, response.capability_flags.bits());
    write_int_4(out, response.max_packet_size);
    write_int_1(out, response.charset);
    out.extend_from_slice(&[0u8; 23]);
    write_string_null(out, response.username);

    if response
        .capability_flags
        .contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA)
    {
        write_bytes_lenenc(out, response.auth_response);
    } else {
        write_int_1(out, response.auth_response.len() as u8);
        out.extend_from_slice(response.auth_response);
    }

    if let Some(db) = response.database {
        write_string_null(out, db);
    }

    if let Some(plugin) = response.auth_plugin_name
        && response
            .capability_flags
            .contains(CapabilityFlags::CLIENT_PLUGIN_AUTH)
    {
        write_string_null(out, plugin);
    }
}

/// Auth switch request from server, sent when it wants a different plugin than advertised.
#[derive(Debug, Clone)]
pub struct AuthSwitchRequest<'a> {
    pub plugin_name: &'a [u8],
    pub plugin_data: &'a [u8],
}

pub fn read_auth_switch_request(payload: &[u8]) -> Result<AuthSwitchRequest<'_>> {
    let (header, data) = read_int_1(payload)?;
    if header != 0xFE {
        return Err(Error::InvalidPacket);
    }

    let (plugin_name, data) = read_string_null(data)?;

    if data.last() == Some(&0) {
        Ok(AuthSwitchRequest {
            plugin_name,
            plugin_data: &data[..data.len() - 1],
        })
    } else {
        Ok(AuthSwitchRequest {
            plugin_name,
            plugin_data: data,
        })
    }
}

pub fn write_auth_switch_response(out: &mut Vec<u8>, auth_data: &[u8]) {
    out.extend_from_slice(auth_data);
}

/// `mysql_native_password`: SHA1(password) XOR SHA1(challenge + SHA1(SHA1(password))).
pub fn auth_mysql_native_password(password: &str, challenge: &[u8]) -> [u8; 20] {
    use sha1::{Digest, Sha1};

    if password.is_empty() {
        return [0u8; 20];
    }

    let stage1_hash = Sha1::digest(password.as_bytes());
    let stage2_hash = Sha1::digest(stage1_hash);

    let mut hasher = Sha1::new();
    hasher.update(challenge);
    hasher.update(stage2_hash);
    let token_hash = hasher.finalize();

    let mut result = [0u8; 20];
    for i in 0..20 {
        result[i] = stage1_hash[i] ^ token_hash[i];
    }
    result
}

/// `caching_sha2_password` initial response: SHA256(password) XOR SHA256(SHA256(SHA256(password)) + challenge).
pub fn auth_caching_sha2_password(password: &str, challenge: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};

    if password.is_empty() {
        return [0u8; 32];
    }

    let stage1 = Sha256::digest(password.as_bytes());
    let stage2 = Sha256::digest(stage1);

    let mut hasher = Sha256::new();
    hasher.update(stage2);
    hasher.update(challenge);
    let scramble = hasher.finalize();

    let mut result = [0u8; 32];
    for i in 0..32 {
        result[i] = stage1[i] ^ scramble[i];
    }
    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachingSha2PasswordFastAuthResult {
    Success,
    FullAuthRequired,
}

pub fn read_caching_sha2_password_fast_auth_result(
    payload: &[u8],
) -> Result<CachingSha2PasswordFastAuthResult> {
    match payload.first() {
        Some(0x03) => Ok(CachingSha2PasswordFastAuthResult::Success),
        Some(0x04) => Ok(CachingSha2PasswordFastAuthResult::FullAuthRequired),
        Some(_) => Err(Error::InvalidPacket),
        None => Err(Error::UnexpectedEof),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_password_yields_empty_response() {
        assert_eq!(auth_mysql_native_password("", b"01234567890123456789"), [0u8; 20]);
        assert_eq!(auth_caching_sha2_password("", b"01234567890123456789"), [0u8; 32]);
    }

    #[test]
    fn native_password_is_deterministic() {
        let challenge = b"abcdefghijklmnopqrst";
        let a = auth_mysql_native_password("hunter2", challenge);
        let b = auth_mysql_native_password("hunter2", challenge);
        assert_eq!(a, b);
        assert_ne!(a, [0u8; 20]);
    }
}

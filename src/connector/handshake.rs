//! Connection + authentication handshake, driven non-blockingly by
//! [`super::Connector::connect_start`]/`connect_cont`.

use crate::constant::{CAPABILITIES_ALWAYS_ENABLED, CAPABILITIES_CONFIGURABLE, CapabilityFlags};
use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::wire::handshake::{
    AuthSwitchRequest, CachingSha2PasswordFastAuthResult, HandshakeResponse41, InitialHandshake,
    auth_caching_sha2_password, auth_mysql_native_password, read_auth_switch_request,
    read_caching_sha2_password_fast_auth_result, read_initial_handshake, write_handshake_response,
};
use crate::wire::response::{OkPayloadBytes, is_err_packet, is_ok_packet};

const MYSQL_NATIVE_PASSWORD: &[u8] = b"mysql_native_password";
const CACHING_SHA2_PASSWORD: &[u8] = b"caching_sha2_password";

#[derive(Debug)]
pub struct ServerInfo {
    pub server_version: String,
    pub connection_id: u32,
    pub capabilities: CapabilityFlags,
    pub charset: u8,
    pub status_flags: u16,
}

pub enum HandshakeStep {
    AwaitingInitial,
    AwaitingAuthResult { challenge: Vec<u8> },
    AwaitingFullAuthResult,
}

fn negotiate_capabilities(opts: &Opts, server: CapabilityFlags) -> CapabilityFlags {
    let mut wanted = CAPABILITIES_ALWAYS_ENABLED | (opts.capabilities & CAPABILITIES_CONFIGURABLE);
    if opts.db.is_some() {
        wanted |= CapabilityFlags::CLIENT_CONNECT_WITH_DB;
    }
    wanted & server
}

fn compute_auth_response(plugin: &[u8], password: Option<&str>, challenge: &[u8]) -> Result<Vec<u8>> {
    let password = password.unwrap_or("");
    match plugin {
        MYSQL_NATIVE_PASSWORD => Ok(auth_mysql_native_password(password, challenge).to_vec()),
        CACHING_SHA2_PASSWORD => Ok(auth_caching_sha2_password(password, challenge).to_vec()),
        other => Err(Error::Unsupported(format!(
            "auth plugin '{}' is not supported",
            String::from_utf8_lossy(other)
        ))),
    }
}

pub fn on_initial_handshake(opts: &Opts, payload: &[u8]) -> Result<(ServerInfo, HandshakeStep, Vec<u8>)> {
    let handshake: InitialHandshake<'_> = read_initial_handshake(payload)?;

    if opts.tls {
        return Err(Error::Unsupported("tls".to_string()));
    }

    let capabilities = negotiate_capabilities(opts, handshake.capability_flags);
    let plugin: Vec<u8> = handshake.auth_plugin_name.to_vec();
    let auth_response = compute_auth_response(&plugin, opts.password.as_deref(), &handshake.auth_plugin_data)?;

    let mut out = Vec::new();
    write_handshake_response(
        &mut out,
        &HandshakeResponse41 {
            capability_flags: capabilities,
            max_packet_size: 0x0100_0000,
            charset: charset_id(&opts.charset),
            username: &opts.user,
            auth_response: &auth_response,
            database: opts.db.as_deref(),
            auth_plugin_name: Some(std::str::from_utf8(&plugin).unwrap_or(""))
                .filter(|_| capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH)),
        },
    );

    let server_info = ServerInfo {
        server_version: handshake.server_version,
        connection_id: handshake.connection_id,
        capabilities,
        charset: handshake.charset,
        status_flags: handshake.status_flags,
    };

    Ok((server_info, HandshakeStep::AwaitingAuthResult { challenge: handshake.auth_plugin_data }, out))
}

/// Outcome of feeding one post-response packet into the handshake. `Pending`
/// carries bytes that must be written before waiting for the next packet.
pub enum AuthProgress {
    Done,
    Pending { step: HandshakeStep, write: Vec<u8> },
}

pub fn on_auth_packet(opts: &Opts, step: HandshakeStep, payload: &[u8]) -> Result<AuthProgress> {
    if is_ok_packet(payload) {
        OkPayloadBytes(payload).assert_eof().ok();
        return Ok(AuthProgress::Done);
    }
    if is_err_packet(payload) {
        return Err(crate::wire::response::ErrPayloadBytes(payload).into());
    }

    match (step, payload.first()) {
        (HandshakeStep::AwaitingAuthResult { .. }, Some(0xFE)) => {
            let switch: AuthSwitchRequest<'_> = read_auth_switch_request(payload)?;
            let plugin = switch.plugin_name.to_vec();
            let auth_response = compute_auth_response(&plugin, opts.password.as_deref(), switch.plugin_data)?;
            Ok(AuthProgress::Pending {
                step: HandshakeStep::AwaitingFullAuthResult,
                write: auth_response,
            })
        }
        (HandshakeStep::AwaitingAuthResult { challenge: _ }, Some(0x01)) => {
            match read_caching_sha2_password_fast_auth_result(&payload[1..])? {
                CachingSha2PasswordFastAuthResult::Success => Ok(AuthProgress::Pending {
                    step: HandshakeStep::AwaitingFullAuthResult,
                    write: Vec::new(),
                }),
                CachingSha2PasswordFastAuthResult::FullAuthRequired => Err(Error::Unsupported(
                    "caching_sha2_password full authentication requires TLS, which is not supported".to_string(),
                )),
            }
        }
        (HandshakeStep::AwaitingFullAuthResult, _) => Err(Error::InvalidPacket),
        (HandshakeStep::AwaitingInitial, _) => Err(Error::InvalidPacket),
    }
}

fn charset_id(name: &str) -> u8 {
    match name {
        "utf8mb4" => 45,
        "utf8" => 33,
        "latin1" => 8,
        "binary" => 63,
        _ => 45,
    }
}

//! MySQL 인증 처리
//!
//! Native password authentication, SSL request, auth switch 처리

use crate::error::{BinlogError, Result};
use crate::protocol::read_null_terminated_string;
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::{Cursor, Write};

pub const NATIVE_PASSWORD_PLUGIN: &str = "mysql_native_password";

/// 서버가 다른 인증 방식을 요구할 때 보내는 마커
pub const AUTH_SWITCH_MARKER: u8 = 0xFE;

/// Client capability flags
pub mod capabilities {
    pub const LONG_PASSWORD: u32 = 1;
    pub const LONG_FLAG: u32 = 4;
    pub const CONNECT_WITH_DB: u32 = 8;
    pub const PROTOCOL_41: u32 = 512;
    pub const SSL: u32 = 2048;
    pub const TRANSACTIONS: u32 = 8192;
    pub const SECURE_CONNECTION: u32 = 32768;
    pub const MULTI_STATEMENTS: u32 = 1 << 16;
    pub const MULTI_RESULTS: u32 = 1 << 17;
    pub const PLUGIN_AUTH: u32 = 1 << 19;
}

fn client_capabilities(with_database: bool, with_ssl: bool) -> u32 {
    let mut flags = capabilities::LONG_PASSWORD
        | capabilities::LONG_FLAG
        | capabilities::PROTOCOL_41
        | capabilities::TRANSACTIONS
        | capabilities::SECURE_CONNECTION
        | capabilities::MULTI_STATEMENTS
        | capabilities::MULTI_RESULTS
        | capabilities::PLUGIN_AUTH;

    if with_database {
        flags |= capabilities::CONNECT_WITH_DB;
    }
    if with_ssl {
        flags |= capabilities::SSL;
    }
    flags
}

/// Native password 인증 응답 생성
pub fn create_auth_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    // SHA1(password)
    let stage1 = sha1(password.as_bytes());

    // SHA1(SHA1(password))
    let stage2 = sha1(&stage1);

    // SHA1(scramble + SHA1(SHA1(password)))
    let mut combined = scramble.to_vec();
    combined.extend_from_slice(&stage2);
    let stage3 = sha1(&combined);

    stage1
        .iter()
        .zip(stage3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

fn sha1(data: &[u8]) -> Vec<u8> {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// SSL request 패킷. 이 패킷 직후 TLS 핸드셰이크가 시작된다.
pub fn create_ssl_request(collation: u8, with_database: bool) -> Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(32);
    buffer.write_u32::<LittleEndian>(client_capabilities(with_database, true))?;
    buffer.write_u32::<LittleEndian>(0)?;
    buffer.write_u8(collation)?;
    buffer.write_all(&[0u8; 23])?;
    Ok(buffer)
}

/// 인증 패킷 생성
pub fn create_handshake_response(
    username: &str,
    password: &str,
    database: Option<&str>,
    scramble: &[u8],
    collation: u8,
    with_ssl: bool,
) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();

    buffer.write_u32::<LittleEndian>(client_capabilities(database.is_some(), with_ssl))?;

    // Max packet size - 0이면 서버 기본값
    buffer.write_u32::<LittleEndian>(0)?;
    buffer.write_u8(collation)?;

    // Reserved
    buffer.write_all(&[0u8; 23])?;

    buffer.write_all(username.as_bytes())?;
    buffer.write_u8(0)?;

    let auth_response = create_auth_response(password, scramble);
    buffer.write_u8(auth_response.len() as u8)?;
    buffer.write_all(&auth_response)?;

    if let Some(db) = database {
        buffer.write_all(db.as_bytes())?;
        buffer.write_u8(0)?;
    }

    buffer.write_all(NATIVE_PASSWORD_PLUGIN.as_bytes())?;
    buffer.write_u8(0)?;

    Ok(buffer)
}

/// 서버의 auth switch 요청
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSwitchRequest {
    pub plugin_name: String,
    pub scramble: Vec<u8>,
}

impl AuthSwitchRequest {
    /// 0xFE 마커를 포함한 전체 패킷에서 파싱
    pub fn parse(packet: &[u8]) -> Result<Self> {
        if packet.first() != Some(&AUTH_SWITCH_MARKER) {
            return Err(BinlogError::Protocol(
                "Not an auth switch request".to_string(),
            ));
        }
        let mut cursor = Cursor::new(&packet[1..]);
        let plugin_name = read_null_terminated_string(&mut cursor)?;
        let rest = &packet[1 + cursor.position() as usize..];
        let scramble = match rest.split_last() {
            Some((0, head)) => head.to_vec(),
            _ => rest.to_vec(),
        };
        Ok(AuthSwitchRequest {
            plugin_name,
            scramble,
        })
    }

    /// native password 외의 방식은 지원하지 않는다
    pub fn create_response(&self, password: &str) -> Result<Vec<u8>> {
        if self.plugin_name != NATIVE_PASSWORD_PLUGIN {
            return Err(BinlogError::authentication(format!(
                "Unsupported authentication type: {}",
                self.plugin_name
            )));
        }
        Ok(create_auth_response(password, &self.scramble))
    }
}

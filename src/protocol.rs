//! MySQL 프로토콜 패킷 처리
//!
//! 패킷 = 3 bytes 길이(LE) + 1 byte 시퀀스 + 본문.
//! 채널의 모든 읽기/쓰기는 close token을 함께 기다리므로, 다른 태스크에서
//! 토큰을 취소하면 블로킹 중인 읽기가 즉시 실패한다.

use crate::config::SslMode;
use crate::error::{BinlogError, Result};
use crate::transport::{IoStream, TlsUpgrader};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 단일 패킷 본문의 최대 길이. 이보다 긴 본문은 여러 패킷으로 나뉜다.
pub const MAX_PACKET_LENGTH: usize = 16_777_215;

pub const COM_QUERY: u8 = 0x03;
pub const COM_PING: u8 = 0x0e;
pub const COM_BINLOG_DUMP: u8 = 0x12;
pub const COM_REGISTER_SLAVE: u8 = 0x15;

type BufferedStream = BufReader<Box<dyn IoStream>>;

fn channel_closed() -> BinlogError {
    BinlogError::Io(io::Error::new(
        io::ErrorKind::ConnectionAborted,
        "packet channel closed",
    ))
}

/// (시퀀스, 본문)
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 4];
    tokio::io::AsyncReadExt::read_exact(reader, &mut header).await?;
    let length = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;

    let mut buffer = vec![0u8; length];
    tokio::io::AsyncReadExt::read_exact(reader, &mut buffer).await?;
    Ok((header[3], buffer))
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8], sequence: u8) -> Result<()> {
    if data.len() > MAX_PACKET_LENGTH {
        return Err(BinlogError::Protocol(format!(
            "Packet too large: {} bytes",
            data.len()
        )));
    }

    let mut header = Vec::with_capacity(4);
    WriteBytesExt::write_u24::<LittleEndian>(&mut header, data.len() as u32)?;
    WriteBytesExt::write_u8(&mut header, sequence)?;

    tokio::io::AsyncWriteExt::write_all(writer, &header).await?;
    tokio::io::AsyncWriteExt::write_all(writer, data).await?;
    tokio::io::AsyncWriteExt::flush(writer).await?;
    Ok(())
}

/// 협상 단계에서 쓰는 양방향 패킷 채널
pub struct PacketChannel {
    stream: Option<BufferedStream>,
    close_token: CancellationToken,
}

impl PacketChannel {
    pub fn new(stream: Box<dyn IoStream>, close_token: CancellationToken) -> Self {
        PacketChannel {
            stream: Some(BufReader::new(stream)),
            close_token,
        }
    }

    pub fn close_token(&self) -> &CancellationToken {
        &self.close_token
    }

    fn stream(&mut self) -> Result<&mut BufferedStream> {
        if self.close_token.is_cancelled() {
            return Err(channel_closed());
        }
        self.stream.as_mut().ok_or_else(channel_closed)
    }

    /// 읽을 데이터가 있는지 확인 (상대가 연결을 닫았으면 false)
    pub async fn has_data(&mut self) -> Result<bool> {
        let close_token = self.close_token.clone();
        let stream = self.stream()?;
        tokio::select! {
            _ = close_token.cancelled() => Err(channel_closed()),
            buf = stream.fill_buf() => Ok(!buf?.is_empty()),
        }
    }

    /// 패킷 읽기 (헤더 제외한 본문)
    pub async fn read_packet(&mut self) -> Result<Vec<u8>> {
        Ok(self.read_sequenced_packet().await?.1)
    }

    /// 시퀀스 번호까지 함께 읽는다
    pub async fn read_sequenced_packet(&mut self) -> Result<(u8, Vec<u8>)> {
        let close_token = self.close_token.clone();
        let stream = self.stream()?;
        tokio::select! {
            _ = close_token.cancelled() => Err(channel_closed()),
            packet = read_frame(stream) => packet,
        }
    }

    /// 패킷 쓰기
    pub async fn write_packet(&mut self, data: &[u8], sequence: u8) -> Result<()> {
        let close_token = self.close_token.clone();
        let stream = self.stream()?;
        tokio::select! {
            _ = close_token.cancelled() => Err(channel_closed()),
            result = write_frame(stream, data, sequence) => result,
        }
    }

    /// SSL request 전송 직후 호출한다. 이후 모든 패킷은 TLS 위로 오간다.
    pub async fn upgrade_to_tls(
        &mut self,
        upgrader: &dyn TlsUpgrader,
        hostname: &str,
        mode: SslMode,
    ) -> Result<()> {
        self.stream()?;
        let plain = self.stream.take().ok_or_else(channel_closed)?;
        if !plain.buffer().is_empty() {
            return Err(BinlogError::Protocol(
                "Unexpected data buffered before TLS upgrade".to_string(),
            ));
        }
        let close_token = self.close_token.clone();
        let upgraded = tokio::select! {
            _ = close_token.cancelled() => return Err(channel_closed()),
            upgraded = upgrader.upgrade(plain.into_inner(), hostname, mode) => upgraded?,
        };
        self.stream = Some(BufReader::new(upgraded));
        debug!("Packet channel upgraded to TLS ({})", mode);
        Ok(())
    }

    pub fn close(&mut self) {
        self.close_token.cancel();
        self.stream = None;
    }

    /// 스트리밍용 읽기/쓰기 반쪽으로 분리
    pub fn split(mut self) -> Result<(PacketReader, PacketWriter)> {
        let stream = self.stream.take().ok_or_else(channel_closed)?;
        let (read_half, write_half) = tokio::io::split(stream);
        Ok((
            PacketReader {
                reader: BufReader::new(read_half),
                close_token: self.close_token.clone(),
            },
            PacketWriter {
                writer: write_half,
                close_token: self.close_token.clone(),
            },
        ))
    }
}

/// 이벤트 스트림 수신 쪽. Stream Reader만 소유한다.
pub struct PacketReader {
    reader: BufReader<ReadHalf<BufferedStream>>,
    close_token: CancellationToken,
}

impl PacketReader {
    pub async fn read_packet(&mut self) -> Result<Vec<u8>> {
        if self.close_token.is_cancelled() {
            return Err(channel_closed());
        }
        tokio::select! {
            _ = self.close_token.cancelled() => Err(channel_closed()),
            packet = read_frame(&mut self.reader) => packet.map(|(_, body)| body),
        }
    }

    pub async fn has_data(&mut self) -> Result<bool> {
        tokio::select! {
            _ = self.close_token.cancelled() => Err(channel_closed()),
            buf = self.reader.fill_buf() => Ok(!buf?.is_empty()),
        }
    }
}

/// 스트리밍 중 제어 명령(COM_PING) 전송 쪽
pub struct PacketWriter {
    writer: WriteHalf<BufferedStream>,
    close_token: CancellationToken,
}

impl PacketWriter {
    pub async fn write_packet(&mut self, data: &[u8], sequence: u8) -> Result<()> {
        if self.close_token.is_cancelled() {
            return Err(channel_closed());
        }
        tokio::select! {
            _ = self.close_token.cancelled() => Err(channel_closed()),
            result = write_frame(&mut self.writer, data, sequence) => result,
        }
    }
}

/// Greeting 패킷 파싱
#[derive(Debug, Clone)]
pub struct GreetingPacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub thread_id: u32,
    pub scramble: Vec<u8>,
    pub server_capabilities: u32,
    pub server_collation: u8,
    pub server_status: u16,
}

impl GreetingPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);

        let protocol_version = cursor.read_u8().map_err(protocol_error("protocol version"))?;
        let server_version = read_null_terminated_string(&mut cursor)?;
        let thread_id = cursor
            .read_u32::<LittleEndian>()
            .map_err(protocol_error("thread ID"))?;

        // Auth plugin data part 1 (8 bytes)
        let mut scramble = vec![0u8; 8];
        Read::read_exact(&mut cursor, &mut scramble).map_err(protocol_error("scramble part 1"))?;

        // Filler
        cursor.read_u8().map_err(protocol_error("filler"))?;

        let capabilities_lower = cursor
            .read_u16::<LittleEndian>()
            .map_err(protocol_error("capabilities"))?;
        let server_collation = cursor.read_u8().map_err(protocol_error("collation"))?;
        let server_status = cursor
            .read_u16::<LittleEndian>()
            .map_err(protocol_error("status"))?;
        let capabilities_upper = cursor
            .read_u16::<LittleEndian>()
            .map_err(protocol_error("capabilities upper"))?;
        let server_capabilities = (capabilities_upper as u32) << 16 | capabilities_lower as u32;

        let auth_data_len = cursor.read_u8().map_err(protocol_error("auth data length"))?;

        // Reserved (10 bytes)
        let mut reserved = [0u8; 10];
        Read::read_exact(&mut cursor, &mut reserved).map_err(protocol_error("reserved"))?;

        // Auth plugin data part 2 (최소 13 bytes, 마지막 null 제외)
        let scramble_len = std::cmp::max(13, auth_data_len.saturating_sub(8)) as usize;
        let mut scramble_part2 = vec![0u8; scramble_len];
        Read::read_exact(&mut cursor, &mut scramble_part2)
            .map_err(protocol_error("scramble part 2"))?;
        scramble.extend_from_slice(&scramble_part2[..scramble_part2.len() - 1]);

        Ok(GreetingPacket {
            protocol_version,
            server_version,
            thread_id,
            scramble,
            server_capabilities,
            server_collation,
            server_status,
        })
    }

    pub fn is_mariadb(&self) -> bool {
        self.server_version.contains("MariaDB")
    }
}

fn protocol_error(field: &'static str) -> impl Fn(io::Error) -> BinlogError {
    move |e| BinlogError::Protocol(format!("Failed to read {}: {}", field, e))
}

/// null로 끝나는 문자열 읽기
pub(crate) fn read_null_terminated_string<R: Read>(reader: &mut R) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let byte = reader.read_u8().map_err(protocol_error("string byte"))?;
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    String::from_utf8(bytes)
        .map_err(|e| BinlogError::Protocol(format!("Invalid UTF-8 in string: {}", e)))
}

/// 서버 에러 패킷 (0xFF 마커 다음부터)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPacket {
    pub error_code: u16,
    pub sql_state: String,
    pub message: String,
}

impl ErrorPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(BinlogError::Protocol("Truncated error packet".to_string()));
        }
        let error_code = u16::from_le_bytes([data[0], data[1]]);
        let rest = &data[2..];
        let (sql_state, message) = if rest.first() == Some(&b'#') && rest.len() >= 6 {
            (
                String::from_utf8_lossy(&rest[1..6]).to_string(),
                String::from_utf8_lossy(&rest[6..]).to_string(),
            )
        } else {
            (String::new(), String::from_utf8_lossy(rest).to_string())
        };
        Ok(ErrorPacket {
            error_code,
            sql_state,
            message,
        })
    }

    /// 마커 포함 전체 패킷에서 파싱
    pub fn from_packet(packet: &[u8]) -> Result<Self> {
        Self::parse(packet.get(1..).unwrap_or_default())
    }

    pub fn into_server_error(self) -> BinlogError {
        BinlogError::Server {
            code: self.error_code,
            sql_state: self.sql_state,
            message: self.message,
        }
    }

    pub fn into_authentication_error(self) -> BinlogError {
        BinlogError::Authentication {
            code: self.error_code,
            sql_state: self.sql_state,
            message: self.message,
        }
    }
}

/// 텍스트 결과셋의 한 행
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultSetRow {
    values: Vec<Option<String>>,
}

impl ResultSetRow {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let mut values = Vec::new();
        while (cursor.position() as usize) < data.len() {
            match read_length_encoded_int(&mut cursor)? {
                None => values.push(None),
                Some(len) => {
                    let mut bytes = vec![0u8; len as usize];
                    Read::read_exact(&mut cursor, &mut bytes)
                        .map_err(protocol_error("result set value"))?;
                    values.push(Some(String::from_utf8_lossy(&bytes).to_string()));
                }
            }
        }
        Ok(ResultSetRow { values })
    }

    pub fn value(&self, index: usize) -> Option<&str> {
        self.values.get(index).and_then(|v| v.as_deref())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Length-encoded integer. 0xFB(NULL)이면 None.
pub(crate) fn read_length_encoded_int(cursor: &mut Cursor<&[u8]>) -> Result<Option<u64>> {
    let first = cursor.read_u8().map_err(protocol_error("length-encoded integer"))?;
    let value = match first {
        0..=0xfa => first as u64,
        0xfb => return Ok(None),
        0xfc => cursor
            .read_u16::<LittleEndian>()
            .map_err(protocol_error("length-encoded integer"))? as u64,
        0xfd => cursor
            .read_u24::<LittleEndian>()
            .map_err(protocol_error("length-encoded integer"))? as u64,
        0xfe => cursor
            .read_u64::<LittleEndian>()
            .map_err(protocol_error("length-encoded integer"))?,
        0xff => {
            return Err(BinlogError::Protocol(
                "Invalid length-encoded integer".to_string(),
            ))
        }
    };
    Ok(Some(value))
}

/// Error 패킷 확인
pub fn is_error_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == 0xFF
}

/// OK 패킷 확인
pub fn is_ok_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == 0x00
}

/// EOF 패킷 확인 (0xFE, 길이 < 9)
pub fn is_eof_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == 0xFE && data.len() < 9
}

/// COM_QUERY 명령어 생성
pub fn create_query_command(sql: &str) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(sql.len() + 1);
    buffer.push(COM_QUERY);
    buffer.extend_from_slice(sql.as_bytes());
    buffer
}

/// COM_BINLOG_DUMP 명령어 생성
pub fn create_binlog_dump_command(
    server_id: u32,
    binlog_filename: &str,
    binlog_position: u64,
) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    buffer.write_u8(COM_BINLOG_DUMP)?;
    buffer.write_u32::<LittleEndian>(binlog_position as u32)?;
    // Flags (2 bytes)
    buffer.write_u16::<LittleEndian>(0)?;
    buffer.write_u32::<LittleEndian>(server_id)?;
    buffer.write_all(binlog_filename.as_bytes())?;
    Ok(buffer)
}

/// COM_REGISTER_SLAVE 명령어 생성 (호스트/계정 정보는 비워서 보낸다)
pub fn create_register_slave_command(server_id: u32) -> Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(18);
    buffer.write_u8(COM_REGISTER_SLAVE)?;
    buffer.write_u32::<LittleEndian>(server_id)?;
    buffer.write_u8(0)?; // hostname
    buffer.write_u8(0)?; // user
    buffer.write_u8(0)?; // password
    buffer.write_u16::<LittleEndian>(0)?; // port
    buffer.write_u32::<LittleEndian>(0)?; // replication rank
    buffer.write_u32::<LittleEndian>(0)?; // master id
    Ok(buffer)
}

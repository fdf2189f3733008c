//! Binlog 이벤트 디코딩
//!
//! 이벤트 프레임 구조:
//!   - Timestamp (4 bytes)
//!   - Type (1 byte)
//!   - Server ID (4 bytes)
//!   - Event Length (4 bytes)
//!   - Next Position (4 bytes)
//!   - Flags (2 bytes)
//!   - Event Data (variable)
//!   - Checksum (0 or 4 bytes)
//!
//! 타입별 디코더는 교체할 수 있다. 클라이언트가 위치 추적에 꼭 필요한 타입은
//! [`EventDeserializer::ensure_decoder`]로 내부 디코더를 덧씌워 사용자 디코더와 함께 돌린다.

use crate::error::{BinlogError, Result};
use crate::events::*;
use crate::gtid::MariaGtid;
use crate::protocol::read_length_encoded_int;
use byteorder::{LittleEndian, ReadBytesExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// binlog_checksum 알고리즘
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumType {
    #[default]
    None,
    Crc32,
}

impl ChecksumType {
    pub fn length(&self) -> usize {
        match self {
            ChecksumType::None => 0,
            ChecksumType::Crc32 => 4,
        }
    }
}

impl FromStr for ChecksumType {
    type Err = BinlogError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "" | "NONE" => Ok(ChecksumType::None),
            "CRC32" => Ok(ChecksumType::Crc32),
            other => Err(BinlogError::Protocol(format!(
                "Unsupported binlog checksum: {}",
                other
            ))),
        }
    }
}

/// 이벤트 본문 디코더
pub trait EventDataDecoder: Send + Sync {
    /// 같은 디코더가 이미 설치되어 있는지 비교할 때 쓰는 이름
    fn name(&self) -> &'static str;

    /// 체크섬을 뗀 본문을 받는다. None이면 payload 없는 이벤트로 전달된다.
    fn decode(&self, header: &EventHeader, data: &[u8]) -> Result<Option<EventData>>;

    /// 래핑 디코더면 내부 디코더 이름
    fn wrapped_internal(&self) -> Option<&'static str> {
        None
    }
}

/// 이벤트 헤더 파싱
pub fn parse_header(data: &[u8]) -> Result<EventHeader> {
    if data.len() < EVENT_HEADER_SIZE {
        return Err(BinlogError::Decode(format!(
            "Invalid event header: {} bytes",
            data.len()
        )));
    }

    let mut cursor = Cursor::new(data);
    let timestamp = cursor.read_u32::<LittleEndian>()?;
    let event_type = cursor.read_u8()?;
    let server_id = cursor.read_u32::<LittleEndian>()?;
    let event_length = cursor.read_u32::<LittleEndian>()?;
    let next_pos = cursor.read_u32::<LittleEndian>()?;
    let flags = cursor.read_u16::<LittleEndian>()?;

    Ok(EventHeader {
        timestamp,
        event_type: EventType::from_u8(event_type),
        server_id,
        event_length,
        next_pos,
        flags,
    })
}

/// 타입별 디코더 레지스트리
pub struct EventDeserializer {
    decoders: RwLock<HashMap<EventType, Arc<dyn EventDataDecoder>>>,
    default_decoder: Arc<dyn EventDataDecoder>,
    checksum: RwLock<ChecksumType>,
}

impl Default for EventDeserializer {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDeserializer {
    /// 기본 디코더가 등록된 상태로 생성
    pub fn new() -> Self {
        let mut decoders: HashMap<EventType, Arc<dyn EventDataDecoder>> = HashMap::new();
        decoders.insert(EventType::Query, Arc::new(QueryDecoder));
        decoders.insert(EventType::Rotate, Arc::new(RotateDecoder));
        decoders.insert(EventType::TableMap, Arc::new(TableMapDecoder));
        decoders.insert(EventType::FormatDescription, Arc::new(FormatDescriptionDecoder));
        decoders.insert(EventType::Xid, Arc::new(XidDecoder));
        decoders.insert(EventType::Heartbeat, Arc::new(HeartbeatDecoder));
        decoders.insert(EventType::MariaGtid, Arc::new(MariaGtidDecoder));
        decoders.insert(EventType::MariaGtidList, Arc::new(MariaGtidListDecoder));
        decoders.insert(EventType::MariaBinlogCheckpoint, Arc::new(BinlogCheckpointDecoder));

        EventDeserializer {
            decoders: RwLock::new(decoders),
            default_decoder: Arc::new(RawDecoder),
            checksum: RwLock::new(ChecksumType::None),
        }
    }

    pub fn set_decoder(&self, event_type: EventType, decoder: Arc<dyn EventDataDecoder>) {
        self.decoders.write().insert(event_type, decoder);
    }

    pub fn decoder(&self, event_type: EventType) -> Arc<dyn EventDataDecoder> {
        self.decoders
            .read()
            .get(&event_type)
            .cloned()
            .unwrap_or_else(|| self.default_decoder.clone())
    }

    pub fn set_checksum(&self, checksum: ChecksumType) {
        *self.checksum.write() = checksum;
    }

    pub fn checksum(&self) -> ChecksumType {
        *self.checksum.read()
    }

    /// 해당 타입에 `internal` 디코더 결과가 항상 나오도록 보장한다.
    /// 다른 디코더가 설치되어 있으면 둘을 묶는다.
    pub fn ensure_decoder(&self, event_type: EventType, internal: Arc<dyn EventDataDecoder>) {
        let mut decoders = self.decoders.write();
        let current = decoders
            .get(&event_type)
            .cloned()
            .unwrap_or_else(|| self.default_decoder.clone());

        if current.name() == internal.name() || current.wrapped_internal() == Some(internal.name())
        {
            return;
        }

        debug!(
            "Wrapping {:?} decoder '{}' with '{}'",
            event_type,
            current.name(),
            internal.name()
        );
        decoders.insert(
            event_type,
            Arc::new(WrappingDecoder {
                internal,
                external: current,
            }),
        );
    }

    /// 이벤트 프레임(패킷의 마커 바이트 다음부터) 하나를 디코딩
    pub fn next_event(&self, frame: &[u8]) -> Result<Event> {
        let header = parse_header(frame)?;
        let body = &frame[EVENT_HEADER_SIZE..];
        let checksum_len = self.checksum().length();
        let body = if body.len() >= checksum_len {
            &body[..body.len() - checksum_len]
        } else {
            body
        };

        let event_type = header.event_type;
        let data = self
            .decoder(event_type)
            .decode(&header, body)
            .map_err(|e| match e {
                BinlogError::Decode(_) => e,
                other => BinlogError::Decode(format!("{:?} event: {}", event_type, other)),
            })?;

        Ok(Event::new(header, data))
    }
}

struct WrappingDecoder {
    internal: Arc<dyn EventDataDecoder>,
    external: Arc<dyn EventDataDecoder>,
}

impl EventDataDecoder for WrappingDecoder {
    fn name(&self) -> &'static str {
        "wrapping"
    }

    fn decode(&self, header: &EventHeader, data: &[u8]) -> Result<Option<EventData>> {
        let internal = self.internal.decode(header, data)?;
        let external = self.external.decode(header, data)?;
        Ok(match internal {
            Some(internal) => Some(EventData::Wrapped {
                internal: Box::new(internal),
                external: external.map(Box::new),
            }),
            None => external,
        })
    }

    fn wrapped_internal(&self) -> Option<&'static str> {
        Some(self.internal.name())
    }
}

/// 본문을 그대로 전달
pub struct RawDecoder;

impl EventDataDecoder for RawDecoder {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn decode(&self, _header: &EventHeader, data: &[u8]) -> Result<Option<EventData>> {
        Ok(Some(EventData::Raw(data.to_vec())))
    }
}

/// payload를 만들지 않는다. 관심 없는 타입의 디코딩 비용을 없앨 때 쓴다.
pub struct NullDecoder;

impl EventDataDecoder for NullDecoder {
    fn name(&self) -> &'static str {
        "null"
    }

    fn decode(&self, _header: &EventHeader, _data: &[u8]) -> Result<Option<EventData>> {
        Ok(None)
    }
}

fn read_bytes(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn remaining<'a>(cursor: &Cursor<&'a [u8]>) -> &'a [u8] {
    let data: &'a [u8] = *cursor.get_ref();
    &data[(cursor.position() as usize).min(data.len())..]
}

/// QUERY_EVENT (2)
pub struct QueryDecoder;

impl EventDataDecoder for QueryDecoder {
    fn name(&self) -> &'static str {
        "query"
    }

    fn decode(&self, _header: &EventHeader, data: &[u8]) -> Result<Option<EventData>> {
        let mut cursor = Cursor::new(data);

        let thread_id = cursor.read_u32::<LittleEndian>()?;
        let exec_time = cursor.read_u32::<LittleEndian>()?;
        let db_len = cursor.read_u8()? as usize;
        let error_code = cursor.read_u16::<LittleEndian>()?;
        let status_len = cursor.read_u16::<LittleEndian>()? as usize;

        // status variables는 해석하지 않는다
        read_bytes(&mut cursor, status_len)?;

        let database = String::from_utf8_lossy(&read_bytes(&mut cursor, db_len)?).to_string();
        // null terminator
        cursor.read_u8()?;

        let query = String::from_utf8_lossy(remaining(&cursor)).to_string();

        Ok(Some(EventData::Query(QueryEventData {
            thread_id,
            exec_time,
            error_code,
            database,
            query,
        })))
    }
}

/// ROTATE_EVENT (4)
pub struct RotateDecoder;

impl EventDataDecoder for RotateDecoder {
    fn name(&self) -> &'static str {
        "rotate"
    }

    fn decode(&self, _header: &EventHeader, data: &[u8]) -> Result<Option<EventData>> {
        let mut cursor = Cursor::new(data);
        let position = cursor.read_u64::<LittleEndian>()?;
        let next_binlog_name = String::from_utf8_lossy(remaining(&cursor)).to_string();

        Ok(Some(EventData::Rotate(RotateEventData {
            next_binlog_name,
            position,
        })))
    }
}

/// TABLE_MAP_EVENT (19). 컬럼 메타데이터는 해석하지 않는다.
pub struct TableMapDecoder;

impl EventDataDecoder for TableMapDecoder {
    fn name(&self) -> &'static str {
        "table_map"
    }

    fn decode(&self, _header: &EventHeader, data: &[u8]) -> Result<Option<EventData>> {
        let mut cursor = Cursor::new(data);

        let table_id = cursor.read_u48::<LittleEndian>()?;
        let _flags = cursor.read_u16::<LittleEndian>()?;

        let db_len = cursor.read_u8()? as usize;
        let database = String::from_utf8_lossy(&read_bytes(&mut cursor, db_len)?).to_string();
        cursor.read_u8()?;

        let table_len = cursor.read_u8()? as usize;
        let table = String::from_utf8_lossy(&read_bytes(&mut cursor, table_len)?).to_string();
        cursor.read_u8()?;

        let column_count = read_length_encoded_int(&mut cursor)?.ok_or_else(|| {
            BinlogError::Decode("NULL column count in table map".to_string())
        })? as usize;
        let column_types = read_bytes(&mut cursor, column_count)?;

        Ok(Some(EventData::TableMap(TableMapData {
            table_id,
            database,
            table,
            column_types,
        })))
    }
}

/// FORMAT_DESCRIPTION_EVENT (15)
pub struct FormatDescriptionDecoder;

impl EventDataDecoder for FormatDescriptionDecoder {
    fn name(&self) -> &'static str {
        "format_description"
    }

    fn decode(&self, _header: &EventHeader, data: &[u8]) -> Result<Option<EventData>> {
        let mut cursor = Cursor::new(data);
        let binlog_version = cursor.read_u16::<LittleEndian>()?;
        let version_bytes = read_bytes(&mut cursor, 50)?;
        let version_end = version_bytes
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(version_bytes.len());
        let server_version = String::from_utf8_lossy(&version_bytes[..version_end]).to_string();
        let _created = cursor.read_u32::<LittleEndian>()?;
        let header_length = cursor.read_u8()?;

        Ok(Some(EventData::FormatDescription(FormatDescriptionData {
            binlog_version,
            server_version,
            header_length,
        })))
    }
}

/// XID_EVENT (16)
pub struct XidDecoder;

impl EventDataDecoder for XidDecoder {
    fn name(&self) -> &'static str {
        "xid"
    }

    fn decode(&self, _header: &EventHeader, data: &[u8]) -> Result<Option<EventData>> {
        let xid = Cursor::new(data).read_u64::<LittleEndian>()?;
        Ok(Some(EventData::Xid { xid }))
    }
}

/// HEARTBEAT_LOG_EVENT (27)
pub struct HeartbeatDecoder;

impl EventDataDecoder for HeartbeatDecoder {
    fn name(&self) -> &'static str {
        "heartbeat"
    }

    fn decode(&self, _header: &EventHeader, data: &[u8]) -> Result<Option<EventData>> {
        Ok(Some(EventData::Heartbeat {
            binlog_filename: String::from_utf8_lossy(data).to_string(),
        }))
    }
}

/// MARIA GTID_EVENT (162)
pub struct MariaGtidDecoder;

impl EventDataDecoder for MariaGtidDecoder {
    fn name(&self) -> &'static str {
        "maria_gtid"
    }

    fn decode(&self, header: &EventHeader, data: &[u8]) -> Result<Option<EventData>> {
        let mut cursor = Cursor::new(data);
        let sequence = cursor.read_u64::<LittleEndian>()?;
        let domain_id = cursor.read_u32::<LittleEndian>()?;
        let flags = cursor.read_u8()?;

        Ok(Some(EventData::MariaGtid(MariaGtidEventData {
            gtid: MariaGtid::new(domain_id, header.server_id, sequence),
            flags,
        })))
    }
}

/// MARIA GTID_LIST_EVENT (163)
pub struct MariaGtidListDecoder;

impl EventDataDecoder for MariaGtidListDecoder {
    fn name(&self) -> &'static str {
        "maria_gtid_list"
    }

    fn decode(&self, _header: &EventHeader, data: &[u8]) -> Result<Option<EventData>> {
        let mut cursor = Cursor::new(data);
        // 상위 4비트는 플래그
        let count = cursor.read_u32::<LittleEndian>()? & 0x0FFF_FFFF;

        let mut gtids = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let domain_id = cursor.read_u32::<LittleEndian>()?;
            let server_id = cursor.read_u32::<LittleEndian>()?;
            let sequence = cursor.read_u64::<LittleEndian>()?;
            gtids.push(MariaGtid::new(domain_id, server_id, sequence));
        }

        Ok(Some(EventData::MariaGtidList { gtids }))
    }
}

/// MARIA BINLOG_CHECKPOINT_EVENT (161)
pub struct BinlogCheckpointDecoder;

impl EventDataDecoder for BinlogCheckpointDecoder {
    fn name(&self) -> &'static str {
        "binlog_checkpoint"
    }

    fn decode(&self, _header: &EventHeader, data: &[u8]) -> Result<Option<EventData>> {
        let mut cursor = Cursor::new(data);
        let len = cursor.read_u32::<LittleEndian>()? as usize;
        let binlog_filename = String::from_utf8_lossy(&read_bytes(&mut cursor, len)?).to_string();
        Ok(Some(EventData::BinlogCheckpoint { binlog_filename }))
    }
}

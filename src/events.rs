//! MariaDB Binlog 이벤트 타입 및 데이터 구조 정의

use crate::gtid::MariaGtid;
use serde::{Deserialize, Serialize};

/// 이벤트 헤더 길이 (v4)
pub const EVENT_HEADER_SIZE: usize = 19;

/// Binlog 이벤트 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Start,
    /// 쿼리 이벤트 (DDL, BEGIN/COMMIT/ROLLBACK, statement 기반 DML)
    Query,
    Stop,
    /// 로테이션 이벤트 (새 binlog 파일)
    Rotate,
    Intvar,
    FormatDescription,
    /// 트랜잭션 커밋
    Xid,
    /// 테이블 맵 이벤트 (스키마 정보)
    TableMap,
    WriteRowsV1,
    UpdateRowsV1,
    DeleteRowsV1,
    Heartbeat,
    WriteRows,
    UpdateRows,
    DeleteRows,
    /// MySQL GTID 이벤트
    Gtid,
    AnonymousGtid,
    PreviousGtids,
    MariaAnnotateRows,
    MariaBinlogCheckpoint,
    /// MariaDB GTID 이벤트 (트랜잭션 시작)
    MariaGtid,
    MariaGtidList,
    MariaStartEncryption,
    /// 이 클라이언트가 이름을 붙이지 않은 타입
    Other(u8),
}

impl EventType {
    pub fn from_u8(val: u8) -> Self {
        match val {
            1 => EventType::Start,
            2 => EventType::Query,
            3 => EventType::Stop,
            4 => EventType::Rotate,
            5 => EventType::Intvar,
            15 => EventType::FormatDescription,
            16 => EventType::Xid,
            19 => EventType::TableMap,
            23 => EventType::WriteRowsV1,
            24 => EventType::UpdateRowsV1,
            25 => EventType::DeleteRowsV1,
            27 => EventType::Heartbeat,
            30 => EventType::WriteRows,
            31 => EventType::UpdateRows,
            32 => EventType::DeleteRows,
            33 => EventType::Gtid,
            34 => EventType::AnonymousGtid,
            35 => EventType::PreviousGtids,
            160 => EventType::MariaAnnotateRows,
            161 => EventType::MariaBinlogCheckpoint,
            162 => EventType::MariaGtid,
            163 => EventType::MariaGtidList,
            164 => EventType::MariaStartEncryption,
            other => EventType::Other(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            EventType::Start => 1,
            EventType::Query => 2,
            EventType::Stop => 3,
            EventType::Rotate => 4,
            EventType::Intvar => 5,
            EventType::FormatDescription => 15,
            EventType::Xid => 16,
            EventType::TableMap => 19,
            EventType::WriteRowsV1 => 23,
            EventType::UpdateRowsV1 => 24,
            EventType::DeleteRowsV1 => 25,
            EventType::Heartbeat => 27,
            EventType::WriteRows => 30,
            EventType::UpdateRows => 31,
            EventType::DeleteRows => 32,
            EventType::Gtid => 33,
            EventType::AnonymousGtid => 34,
            EventType::PreviousGtids => 35,
            EventType::MariaAnnotateRows => 160,
            EventType::MariaBinlogCheckpoint => 161,
            EventType::MariaGtid => 162,
            EventType::MariaGtidList => 163,
            EventType::MariaStartEncryption => 164,
            EventType::Other(code) => *code,
        }
    }

    pub fn is_row_mutation(&self) -> bool {
        matches!(
            self,
            EventType::WriteRows
                | EventType::UpdateRows
                | EventType::DeleteRows
                | EventType::WriteRowsV1
                | EventType::UpdateRowsV1
                | EventType::DeleteRowsV1
        )
    }
}

/// Binlog 이벤트 헤더
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    /// 이벤트 타임스탬프 (초 단위)
    pub timestamp: u32,
    pub event_type: EventType,
    /// 이벤트를 기록한 서버 ID
    pub server_id: u32,
    /// 헤더 포함 이벤트 길이 (바이트)
    pub event_length: u32,
    /// 다음 이벤트 위치. 0이면 위치 정보 없음 (heartbeat, 가상 rotate 등)
    pub next_pos: u32,
    pub flags: u16,
}

impl EventHeader {
    /// 헤더 뒤 본문 길이
    pub fn data_length(&self) -> usize {
        (self.event_length as usize).saturating_sub(EVENT_HEADER_SIZE)
    }
}

/// 쿼리 이벤트 데이터
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryEventData {
    pub thread_id: u32,
    /// 실행 시간 (초)
    pub exec_time: u32,
    pub error_code: u16,
    pub database: String,
    pub query: String,
}

/// 회전 이벤트 데이터
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotateEventData {
    /// 새 바이너리 로그 파일명
    pub next_binlog_name: String,
    /// 새 파일의 시작 위치
    pub position: u64,
}

/// 테이블 맵 정보 (컬럼 값 해석은 하지 않는다)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMapData {
    pub table_id: u64,
    pub database: String,
    pub table: String,
    pub column_types: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatDescriptionData {
    pub binlog_version: u16,
    pub server_version: String,
    pub header_length: u8,
}

/// MariaDB GTID 이벤트 데이터
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MariaGtidEventData {
    /// server_id는 이벤트 헤더에서 가져온다
    pub gtid: MariaGtid,
    pub flags: u8,
}

impl MariaGtidEventData {
    /// FL_STANDALONE: BEGIN/COMMIT 없이 단독으로 실행되는 이벤트 그룹 (DDL 등)
    pub fn is_standalone(&self) -> bool {
        self.flags & 0x01 != 0
    }
}

/// 모든 Binlog 이벤트 데이터를 포함하는 열거형
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventData {
    Query(QueryEventData),
    Rotate(RotateEventData),
    TableMap(TableMapData),
    FormatDescription(FormatDescriptionData),
    Xid { xid: u64 },
    Heartbeat { binlog_filename: String },
    MariaGtid(MariaGtidEventData),
    MariaGtidList { gtids: Vec<MariaGtid> },
    BinlogCheckpoint { binlog_filename: String },
    /// 디코더가 없는 타입의 본문 그대로
    Raw(Vec<u8>),
    /// 내부 디코더(클라이언트 상태 추적용)와 외부 디코더(리스너 전달용) 결과 묶음
    Wrapped {
        internal: Box<EventData>,
        external: Option<Box<EventData>>,
    },
}

impl EventData {
    /// 위치/GTID 추적에 쓰는 쪽
    pub fn internal(&self) -> &EventData {
        match self {
            EventData::Wrapped { internal, .. } => internal,
            other => other,
        }
    }

    /// 리스너에게 보여줄 쪽
    pub fn external(&self) -> Option<&EventData> {
        match self {
            EventData::Wrapped { external, .. } => external.as_deref(),
            other => Some(other),
        }
    }
}

/// 완성된 Binlog 이벤트. payload가 None이면 외부 디코더가 값을 만들지 않은 경우.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub header: EventHeader,
    pub data: Option<EventData>,
}

impl Event {
    pub fn new(header: EventHeader, data: Option<EventData>) -> Self {
        Event { header, data }
    }

    pub fn event_type(&self) -> EventType {
        self.header.event_type
    }

    /// 리스너 전달용 사본 (Wrapped를 벗긴다)
    pub fn to_external(&self) -> Event {
        Event {
            header: self.header.clone(),
            data: self.data.as_ref().and_then(|d| d.external().cloned()),
        }
    }
}

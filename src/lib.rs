//! MariaDB / MySQL Binlog 복제 클라이언트
//!
//! 복제 슬레이브처럼 서버에 접속해 바이너리 로그 이벤트를 스트리밍으로 받는다.
//! 주요 기능:
//! - 핸드셰이크, 인증(native password, auth switch), TLS 업그레이드
//! - 체크섬 / heartbeat 협상, 파일 위치 또는 MariaDB GTID 기반 재개
//! - 청크 재조립, 이벤트 디코딩, 리스너 알림
//! - keep-alive 재연결과 협상 워치독

pub mod auth;
pub mod binlog_client;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod gtid;
mod keepalive;
pub mod listener;
mod negotiator;
pub mod offset;
pub mod protocol;
mod stream;
pub mod transport;
mod watchdog;

#[cfg(test)]
mod test_support;

pub use binlog_client::{BinaryLogClient, ConnectionState};
pub use codec::{ChecksumType, EventDataDecoder, EventDeserializer};
pub use config::{ClientConfig, SslMode};
pub use error::{BinlogError, Result};
pub use events::{Event, EventData, EventHeader, EventType};
pub use gtid::{GtidSet, MariaGtid};
pub use listener::{EventListener, LifecycleListener, ListenerId};
pub use offset::{PositionSnapshot, ResumePosition};
pub use transport::{SocketFactory, TlsUpgrader};

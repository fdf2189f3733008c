//! 테스트용 가짜 MariaDB 서버와 리스너 기록기
//!
//! `FakeServer`는 `SocketFactory`로 끼워 넣는다. 연결마다 duplex 스트림을 만들고
//! 서버 쪽에서 스크립트대로 greeting, 인증, 쿼리 응답, 이벤트 전송을 수행한다.

use crate::binlog_client::BinaryLogClient;
use crate::config::{ClientConfig, SslMode};
use crate::error::{BinlogError, Result};
use crate::events::{Event, EventType, EVENT_HEADER_SIZE};
use crate::listener::LifecycleListener;
use crate::protocol::{PacketChannel, COM_BINLOG_DUMP, COM_PING, COM_QUERY, COM_REGISTER_SLAVE};
use crate::transport::{IoStream, SocketFactory, TlsUpgrader};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const OLDEST_BINLOG: &str = "mysql-bin.000001";
const SSL_REQUEST_LENGTH: usize = 32;

/// 이벤트 프레임 (헤더 19 bytes + 본문)
pub(crate) fn event_frame(event_type: EventType, server_id: u32, next_pos: u32, body: &[u8]) -> Vec<u8> {
    let mut frame = BytesMut::with_capacity(EVENT_HEADER_SIZE + body.len());
    frame.put_u32_le(1_700_000_000);
    frame.put_u8(event_type.code());
    frame.put_u32_le(server_id);
    frame.put_u32_le((EVENT_HEADER_SIZE + body.len()) as u32);
    frame.put_u32_le(next_pos);
    frame.put_u16_le(0);
    frame.put_slice(body);
    frame.to_vec()
}

/// 서버가 dump 시작 시 보내는 것과 같은 next_pos 0의 ROTATE
pub(crate) fn rotate_event(filename: &str, position: u64) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u64_le(position);
    body.put_slice(filename.as_bytes());
    event_frame(EventType::Rotate, 1, 0, &body)
}

pub(crate) fn xid_event(server_id: u32, next_pos: u32, xid: u64) -> Vec<u8> {
    event_frame(EventType::Xid, server_id, next_pos, &xid.to_le_bytes())
}

pub(crate) fn query_event(server_id: u32, next_pos: u32, sql: &str) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u32_le(1); // thread id
    body.put_u32_le(0); // exec time
    body.put_u8(4); // db len
    body.put_u16_le(0); // error code
    body.put_u16_le(0); // status vars len
    body.put_slice(b"test\0");
    body.put_slice(sql.as_bytes());
    event_frame(EventType::Query, server_id, next_pos, &body)
}

pub(crate) fn table_map_event(server_id: u32, next_pos: u32, database: &str, table: &str) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_uint_le(42, 6); // table id
    body.put_u16_le(1);
    body.put_u8(database.len() as u8);
    body.put_slice(database.as_bytes());
    body.put_u8(0);
    body.put_u8(table.len() as u8);
    body.put_slice(table.as_bytes());
    body.put_u8(0);
    body.put_u8(2); // column count
    body.put_slice(&[3, 15]);
    event_frame(EventType::TableMap, server_id, next_pos, &body)
}

pub(crate) fn maria_gtid_event(server_id: u32, next_pos: u32, domain_id: u32, sequence: u64) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u64_le(sequence);
    body.put_u32_le(domain_id);
    body.put_u8(0);
    event_frame(EventType::MariaGtid, server_id, next_pos, &body)
}

pub(crate) fn heartbeat_event(next_pos: u32, filename: &str) -> Vec<u8> {
    event_frame(EventType::Heartbeat, 1, next_pos, filename.as_bytes())
}

/// COM_BINLOG_DUMP 요청 내용
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DumpRequest {
    pub position: u32,
    pub server_id: u32,
    pub filename: String,
}

#[derive(Debug, Clone)]
enum StreamTail {
    /// 이벤트를 보낸 뒤 클라이언트가 끊을 때까지 유지
    Hold,
    /// non-blocking 종료 EOF 패킷
    Eof,
    /// 서버가 연결을 닫는다
    Close,
    Error(u16, String),
}

#[derive(Debug, Clone)]
struct Script {
    server_version: String,
    silent: bool,
    /// 이 개수 이후의 연결은 silent
    silent_after: Option<usize>,
    ssl: bool,
    auth_error: Option<(u16, String, String)>,
    auth_switch: Option<String>,
    binlog_status: Option<(String, u64)>,
    master_status_removed: bool,
    checksum: Option<String>,
    gtid_current_pos: String,
    oldest_gtid_list: Option<String>,
    events: Vec<Vec<u8>>,
    tail: StreamTail,
}

#[derive(Default)]
struct Recorded {
    connections: AtomicUsize,
    pings: AtomicUsize,
    queries: Mutex<Vec<String>>,
    dumps: Mutex<Vec<DumpRequest>>,
    registrations: Mutex<Vec<u32>>,
    auth_responses: Mutex<Vec<Vec<u8>>>,
    auth_sequences: Mutex<Vec<u8>>,
    tls_requests: Mutex<Vec<u8>>,
}

/// 스크립트로 동작하는 가짜 서버. Clone은 같은 기록을 공유한다.
#[derive(Clone)]
pub(crate) struct FakeServer {
    script: Script,
    recorded: Arc<Recorded>,
}

impl FakeServer {
    pub(crate) fn mariadb() -> Self {
        Self::with_version("10.11.6-MariaDB-log")
    }

    pub(crate) fn mysql() -> Self {
        Self::with_version("8.0.36")
    }

    fn with_version(version: &str) -> Self {
        FakeServer {
            script: Script {
                server_version: version.to_string(),
                silent: false,
                silent_after: None,
                ssl: false,
                auth_error: None,
                auth_switch: None,
                binlog_status: None,
                master_status_removed: false,
                checksum: None,
                gtid_current_pos: String::new(),
                oldest_gtid_list: None,
                events: Vec::new(),
                tail: StreamTail::Hold,
            },
            recorded: Arc::new(Recorded::default()),
        }
    }

    /// 연결을 받기만 하고 아무것도 보내지 않는다
    pub(crate) fn silent(mut self) -> Self {
        self.script.silent = true;
        self
    }

    pub(crate) fn silent_after(mut self, connections: usize) -> Self {
        self.script.silent_after = Some(connections);
        self
    }

    /// greeting에 SSL capability를 싣는다
    pub(crate) fn with_ssl(mut self) -> Self {
        self.script.ssl = true;
        self
    }

    pub(crate) fn with_auth_error(mut self, code: u16, sql_state: &str, message: &str) -> Self {
        self.script.auth_error = Some((code, sql_state.to_string(), message.to_string()));
        self
    }

    pub(crate) fn with_auth_switch(mut self, plugin: &str) -> Self {
        self.script.auth_switch = Some(plugin.to_string());
        self
    }

    pub(crate) fn with_binlog_status(mut self, filename: &str, position: u64) -> Self {
        self.script.binlog_status = Some((filename.to_string(), position));
        self
    }

    /// `show master status`가 없는 서버 (MySQL 8.4+)
    pub(crate) fn without_master_status(mut self) -> Self {
        self.script.master_status_removed = true;
        self
    }

    pub(crate) fn with_checksum(mut self, checksum: &str) -> Self {
        self.script.checksum = Some(checksum.to_string());
        self
    }

    pub(crate) fn with_gtid_current_pos(mut self, gtid: &str) -> Self {
        self.script.gtid_current_pos = gtid.to_string();
        self
    }

    /// 가장 오래된 binlog의 GTID_LIST ("[0-1-5]")
    pub(crate) fn with_oldest_gtid_list(mut self, gtid_list: &str) -> Self {
        self.script.oldest_gtid_list = Some(gtid_list.to_string());
        self
    }

    pub(crate) fn with_events(mut self, events: Vec<Vec<u8>>) -> Self {
        self.script.events = events;
        self
    }

    pub(crate) fn end_with_eof(mut self) -> Self {
        self.script.tail = StreamTail::Eof;
        self
    }

    pub(crate) fn close_after_events(mut self) -> Self {
        self.script.tail = StreamTail::Close;
        self
    }

    pub(crate) fn with_stream_error(mut self, code: u16, message: &str) -> Self {
        self.script.tail = StreamTail::Error(code, message.to_string());
        self
    }

    pub(crate) fn connections(&self) -> usize {
        self.recorded.connections.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait_for_connections(&self, count: usize) {
        wait_until("connections", || self.connections() >= count).await;
    }

    pub(crate) fn pings(&self) -> usize {
        self.recorded.pings.load(Ordering::SeqCst)
    }

    pub(crate) fn queries(&self) -> Vec<String> {
        self.recorded.queries.lock().clone()
    }

    pub(crate) fn dumps(&self) -> Vec<DumpRequest> {
        self.recorded.dumps.lock().clone()
    }

    pub(crate) fn registrations(&self) -> Vec<u32> {
        self.recorded.registrations.lock().clone()
    }

    /// 클라이언트가 보낸 인증 패킷들 (handshake response, auth switch response)
    pub(crate) fn auth_responses(&self) -> Vec<Vec<u8>> {
        self.recorded.auth_responses.lock().clone()
    }

    /// 인증 패킷들의 시퀀스 번호
    pub(crate) fn auth_sequences(&self) -> Vec<u8> {
        self.recorded.auth_sequences.lock().clone()
    }

    /// 받은 SSL request의 시퀀스 번호
    pub(crate) fn tls_requests(&self) -> Vec<u8> {
        self.recorded.tls_requests.lock().clone()
    }

    async fn serve(self, stream: Box<dyn IoStream>, index: usize) {
        let mut channel = PacketChannel::new(stream, CancellationToken::new());
        let silent = self.script.silent || self.script.silent_after.is_some_and(|n| index >= n);
        if silent {
            // 클라이언트가 끊을 때까지 대기
            while let Ok(true) = channel.has_data().await {
                if channel.read_packet().await.is_err() {
                    break;
                }
            }
            return;
        }
        // 클라이언트가 먼저 끊으면 에러로 끝난다
        let _ = self.run_session(&mut channel).await;
    }

    async fn run_session(&self, channel: &mut PacketChannel) -> Result<()> {
        channel.write_packet(&self.greeting(), 0).await?;

        // SSL request 뒤에는 같은 스트림으로 handshake response가 이어진다
        let (sequence, response) = match channel.read_sequenced_packet().await? {
            (sequence, request) if self.script.ssl && request.len() == SSL_REQUEST_LENGTH => {
                self.recorded.tls_requests.lock().push(sequence);
                channel.read_sequenced_packet().await?
            }
            other => other,
        };
        self.recorded.auth_sequences.lock().push(sequence);
        self.recorded.auth_responses.lock().push(response);

        let mut sequence = sequence.wrapping_add(1);
        if let Some((code, state, message)) = &self.script.auth_error {
            channel
                .write_packet(&error_packet(*code, state, message), sequence)
                .await?;
            return Ok(());
        }
        if let Some(plugin) = &self.script.auth_switch {
            let mut switch = BytesMut::new();
            switch.put_u8(0xFE);
            switch.put_slice(plugin.as_bytes());
            switch.put_u8(0);
            switch.put_slice(&[7u8; 20]);
            switch.put_u8(0);
            channel.write_packet(&switch, sequence).await?;

            let (switch_sequence, response) = channel.read_sequenced_packet().await?;
            self.recorded.auth_sequences.lock().push(switch_sequence);
            self.recorded.auth_responses.lock().push(response);
            sequence = switch_sequence.wrapping_add(1);
        }
        channel.write_packet(&ok_packet(), sequence).await?;

        loop {
            let command = channel.read_packet().await?;
            match command.first() {
                Some(&COM_QUERY) => {
                    let sql = String::from_utf8_lossy(&command[1..]).to_string();
                    self.recorded.queries.lock().push(sql.clone());
                    self.answer_query(channel, &sql).await?;
                }
                Some(&COM_REGISTER_SLAVE) => {
                    let server_id = u32::from_le_bytes([command[1], command[2], command[3], command[4]]);
                    self.recorded.registrations.lock().push(server_id);
                    channel.write_packet(&ok_packet(), 1).await?;
                }
                Some(&COM_BINLOG_DUMP) => {
                    self.recorded.dumps.lock().push(DumpRequest {
                        position: u32::from_le_bytes([command[1], command[2], command[3], command[4]]),
                        server_id: u32::from_le_bytes([command[7], command[8], command[9], command[10]]),
                        filename: String::from_utf8_lossy(&command[11..]).to_string(),
                    });
                    return self.stream_events(channel).await;
                }
                _ => channel.write_packet(&ok_packet(), 1).await?,
            }
        }
    }

    async fn stream_events(&self, channel: &mut PacketChannel) -> Result<()> {
        let mut sequence: u8 = 1;
        for frame in &self.script.events {
            let mut packet = Vec::with_capacity(frame.len() + 1);
            packet.push(0x00);
            packet.extend_from_slice(frame);
            channel.write_packet(&packet, sequence).await?;
            sequence = sequence.wrapping_add(1);
        }

        match &self.script.tail {
            StreamTail::Hold => {}
            StreamTail::Eof => {
                channel.write_packet(&eof_packet(), sequence).await?;
            }
            StreamTail::Close => return Ok(()),
            StreamTail::Error(code, message) => {
                channel
                    .write_packet(&error_packet(*code, "HY000", message), sequence)
                    .await?;
                return Ok(());
            }
        }

        // dump 중에는 COM_PING에 응답하지 않는다
        loop {
            let packet = channel.read_packet().await?;
            if packet.first() == Some(&COM_PING) {
                self.recorded.pings.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    async fn answer_query(&self, channel: &mut PacketChannel, sql: &str) -> Result<()> {
        let lowered = sql.to_lowercase();
        let status_row = || {
            self.script
                .binlog_status
                .iter()
                .map(|(file, pos)| vec![file.clone(), pos.to_string()])
                .collect::<Vec<_>>()
        };

        let rows = if lowered == "show master status" {
            if self.script.master_status_removed {
                let message = "You have an error in your SQL syntax";
                return channel
                    .write_packet(&error_packet(1064, "42000", message), 1)
                    .await;
            }
            status_row()
        } else if lowered == "show binary log status" {
            status_row()
        } else if lowered.starts_with("show global variables like 'binlog_checksum'") {
            self.script
                .checksum
                .iter()
                .map(|value| vec!["binlog_checksum".to_string(), value.clone()])
                .collect()
        } else if lowered == "select @@gtid_current_pos" {
            vec![vec![self.script.gtid_current_pos.clone()]]
        } else if lowered == "show binary logs" {
            match self.script.oldest_gtid_list {
                Some(_) => vec![vec![OLDEST_BINLOG.to_string(), "1024".to_string()]],
                None => Vec::new(),
            }
        } else if lowered.starts_with("show binlog events in") {
            let gtid_list = self.script.oldest_gtid_list.clone().unwrap_or_default();
            vec![
                vec![
                    OLDEST_BINLOG.to_string(),
                    "4".to_string(),
                    "Format_desc".to_string(),
                    "1".to_string(),
                    "256".to_string(),
                    "Server ver: 10.11.6-MariaDB-log, Binlog ver: 4".to_string(),
                ],
                vec![
                    OLDEST_BINLOG.to_string(),
                    "256".to_string(),
                    "Gtid_list".to_string(),
                    "1".to_string(),
                    "285".to_string(),
                    gtid_list,
                ],
            ]
        } else {
            return channel.write_packet(&ok_packet(), 1).await;
        };

        let columns = rows.first().map(Vec::len).unwrap_or(2);
        write_result_set(channel, columns, &rows).await
    }

    fn greeting(&self) -> Vec<u8> {
        let mut packet = BytesMut::new();
        packet.put_u8(10);
        packet.put_slice(self.script.server_version.as_bytes());
        packet.put_u8(0);
        packet.put_u32_le(42); // thread id
        packet.put_slice(b"abcdefgh");
        packet.put_u8(0);
        let ssl = if self.script.ssl { 0x0800 } else { 0 };
        packet.put_u16_le(0xF7FF | ssl);
        packet.put_u8(33);
        packet.put_u16_le(2);
        packet.put_u16_le(0x0008); // PLUGIN_AUTH
        packet.put_u8(21);
        packet.put_slice(&[0u8; 10]);
        packet.put_slice(b"ijklmnopqrst\0");
        packet.put_slice(b"mysql_native_password\0");
        packet.to_vec()
    }
}

#[async_trait]
impl SocketFactory for FakeServer {
    async fn connect(&self, _hostname: &str, _port: u16, _timeout: Duration) -> Result<Box<dyn IoStream>> {
        let index = self.recorded.connections.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(self.clone().serve(Box::new(server), index));
        Ok(Box::new(client))
    }
}

/// TLS 없이 스트림을 그대로 돌려주고 호출만 기록한다
#[derive(Clone, Default)]
pub(crate) struct PassthroughTls {
    upgrades: Arc<Mutex<Vec<(String, SslMode)>>>,
}

impl PassthroughTls {
    pub(crate) fn upgrades(&self) -> Vec<(String, SslMode)> {
        self.upgrades.lock().clone()
    }
}

#[async_trait]
impl TlsUpgrader for PassthroughTls {
    async fn upgrade(
        &self,
        stream: Box<dyn IoStream>,
        hostname: &str,
        mode: SslMode,
    ) -> Result<Box<dyn IoStream>> {
        self.upgrades.lock().push((hostname.to_string(), mode));
        Ok(stream)
    }
}

fn ok_packet() -> Vec<u8> {
    vec![0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]
}

fn eof_packet() -> Vec<u8> {
    vec![0xFE, 0x00, 0x00, 0x02, 0x00]
}

pub(crate) fn error_packet(code: u16, sql_state: &str, message: &str) -> Vec<u8> {
    let mut packet = BytesMut::new();
    packet.put_u8(0xFF);
    packet.put_u16_le(code);
    packet.put_u8(b'#');
    packet.put_slice(sql_state.as_bytes());
    packet.put_slice(message.as_bytes());
    packet.to_vec()
}

fn put_lenenc_str(buffer: &mut BytesMut, value: &str) {
    buffer.put_u8(value.len() as u8);
    buffer.put_slice(value.as_bytes());
}

async fn write_result_set(channel: &mut PacketChannel, columns: usize, rows: &[Vec<String>]) -> Result<()> {
    let mut sequence: u8 = 1;
    channel.write_packet(&[columns as u8], sequence).await?;
    for i in 0..columns {
        sequence += 1;
        let mut definition = BytesMut::new();
        put_lenenc_str(&mut definition, "def");
        put_lenenc_str(&mut definition, &format!("col{}", i));
        channel.write_packet(&definition, sequence).await?;
    }
    sequence += 1;
    channel.write_packet(&eof_packet(), sequence).await?;
    for row in rows {
        sequence += 1;
        let mut packet = BytesMut::new();
        for value in row {
            put_lenenc_str(&mut packet, value);
        }
        channel.write_packet(&packet, sequence).await?;
    }
    sequence += 1;
    channel.write_packet(&eof_packet(), sequence).await
}

pub(crate) fn test_client(config: ClientConfig, server: &FakeServer) -> BinaryLogClient {
    let client = BinaryLogClient::new(config).unwrap();
    client.set_socket_factory(Arc::new(server.clone())).unwrap();
    client
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// 에러는 Clone이 아니라서 검사에 필요한 만큼만 복사한다
fn duplicate(error: &BinlogError) -> BinlogError {
    match error {
        BinlogError::Server {
            code,
            sql_state,
            message,
        } => BinlogError::Server {
            code: *code,
            sql_state: sql_state.clone(),
            message: message.clone(),
        },
        BinlogError::Io(e) => BinlogError::Io(io::Error::new(e.kind(), e.to_string())),
        BinlogError::Decode(message) => BinlogError::Decode(message.clone()),
        other => BinlogError::Protocol(other.to_string()),
    }
}

#[derive(Default)]
pub(crate) struct RecordingLifecycle {
    history: Mutex<Vec<&'static str>>,
    last_failure: Mutex<Option<BinlogError>>,
}

impl RecordingLifecycle {
    pub(crate) fn register(client: &BinaryLogClient) -> Arc<Self> {
        let recorder = Arc::new(RecordingLifecycle::default());
        client.register_lifecycle_listener(recorder.clone());
        recorder
    }

    fn count(&self, kind: &str) -> usize {
        self.history.lock().iter().filter(|k| **k == kind).count()
    }

    pub(crate) fn history(&self) -> Vec<&'static str> {
        self.history.lock().clone()
    }

    pub(crate) fn connects(&self) -> usize {
        self.count("connect")
    }

    pub(crate) fn disconnects(&self) -> usize {
        self.count("disconnect")
    }

    pub(crate) fn failures(&self) -> usize {
        self.count("communication_failure")
    }

    pub(crate) fn deserialization_failures(&self) -> usize {
        self.count("deserialization_failure")
    }

    pub(crate) fn last_failure(&self) -> Option<BinlogError> {
        self.last_failure.lock().as_ref().map(duplicate)
    }

    pub(crate) async fn wait_for_connects(&self, n: usize) {
        wait_until("connects", || self.connects() >= n).await;
    }

    pub(crate) async fn wait_for_disconnects(&self, n: usize) {
        wait_until("disconnects", || self.disconnects() >= n).await;
    }
}

impl LifecycleListener for RecordingLifecycle {
    fn on_connect(&self) {
        self.history.lock().push("connect");
    }

    fn on_communication_failure(&self, error: &BinlogError) {
        self.history.lock().push("communication_failure");
        *self.last_failure.lock() = Some(duplicate(error));
    }

    fn on_event_deserialization_failure(&self, _error: &BinlogError) {
        self.history.lock().push("deserialization_failure");
    }

    fn on_disconnect(&self) {
        self.history.lock().push("disconnect");
    }
}

#[derive(Default)]
pub(crate) struct RecordingEvents {
    events: Mutex<Vec<Event>>,
}

impl RecordingEvents {
    pub(crate) fn register(client: &BinaryLogClient) -> Arc<Self> {
        let recorder = Arc::new(RecordingEvents::default());
        let sink = recorder.clone();
        client.register_event_listener(Arc::new(move |event: &Event| {
            sink.events.lock().push(event.clone());
        }));
        recorder
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub(crate) fn types(&self) -> Vec<EventType> {
        self.events.lock().iter().map(Event::event_type).collect()
    }

    pub(crate) async fn wait_for(&self, n: usize) {
        wait_until("events", || self.events.lock().len() >= n).await;
    }
}

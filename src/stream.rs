//! Binlog 이벤트 수신 루프
//!
//! 패킷 마커:
//!   - 0xFF: 서버 에러 → 루프 종료
//!   - 0xFE (non-blocking): 서버가 마지막 이벤트를 보냈음 → 정상 종료
//!   - 그 외: 이벤트 프레임 (마커 다음 바이트부터)

use crate::binlog_client::BinaryLogClient;
use crate::error::{BinlogError, Result};
use crate::events::{Event, EventData, EventType};
use crate::protocol::{ErrorPacket, PacketReader, MAX_PACKET_LENGTH};
use std::io;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    /// non-blocking 모드에서 서버가 EOF를 보냈다
    EndOfStream,
    /// 다른 쪽에서 채널을 닫았다
    Closed,
}

/// 최대 길이 패킷으로 잘려 온 이벤트를 이어 붙인다.
/// 최대 길이보다 짧은 청크가 나오면 끝이다.
pub(crate) async fn reassemble_split_packet(
    reader: &mut PacketReader,
    first: Vec<u8>,
) -> Result<Vec<u8>> {
    let mut buffer = first;
    loop {
        let chunk = reader.read_packet().await?;
        let last = chunk.len() < MAX_PACKET_LENGTH;
        buffer.extend_from_slice(&chunk);
        if last {
            return Ok(buffer);
        }
    }
}

impl BinaryLogClient {
    /// 세션이 끝날 때까지 이벤트를 읽는다. 종료 처리(알림, 채널 정리)까지 여기서 한다.
    pub(crate) async fn listen_for_event_packets(&self, mut reader: PacketReader) {
        let outcome = self.read_event_packets(&mut reader).await;

        let complete_shutdown = matches!(outcome, Ok(StreamEnd::EndOfStream));
        match &outcome {
            Err(e) if self.is_connected() => {
                info!("Binlog stream failed: {}", e);
                self.inner.listeners.notify_communication_failure(e);
            }
            Err(e) => debug!("Binlog stream closed: {}", e),
            Ok(end) => debug!("Binlog stream ended: {:?}", end),
        }

        if self.is_connected() {
            if complete_shutdown {
                self.inner.keep_alive.stop().await;
            }
            self.disconnect_channel();
        }
        self.inner.writer.lock().await.take();
    }

    async fn read_event_packets(&self, reader: &mut PacketReader) -> Result<StreamEnd> {
        let blocking = self.inner.config.blocking;

        loop {
            let has_data = match reader.has_data().await {
                Ok(has_data) => has_data,
                Err(_) if !self.is_connected() => return Ok(StreamEnd::Closed),
                Err(e) => return Err(e),
            };
            if !has_data {
                return Err(BinlogError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "server closed the binlog stream",
                )));
            }

            let packet = match reader.read_packet().await {
                Ok(packet) => packet,
                Err(_) if !self.is_connected() => return Ok(StreamEnd::Closed),
                Err(e) => return Err(e),
            };

            match packet.first() {
                Some(0xFF) => return Err(ErrorPacket::from_packet(&packet)?.into_server_error()),
                Some(0xFE) if !blocking => return Ok(StreamEnd::EndOfStream),
                _ => {}
            }

            let packet = if packet.len() == MAX_PACKET_LENGTH {
                reassemble_split_packet(reader, packet).await?
            } else {
                packet
            };

            let frame = packet.get(1..).unwrap_or_default();
            let event = match self.event_deserializer().next_event(frame) {
                Ok(event) => event,
                Err(e) if e.is_connection_loss() => return Err(e),
                Err(e) => {
                    if self.is_connected() {
                        self.inner.listeners.notify_deserialization_failure(&e);
                    }
                    continue;
                }
            };

            // 본문을 건너뛴 디코더의 이벤트는 위치와 리스너 어디에도 반영하지 않는다
            if self.is_connected() && event.data.is_some() {
                self.stamp_event_seen();
                self.handle_event(&event);
            }
        }
    }

    fn handle_event(&self, event: &Event) {
        let internal = event.data.as_ref().map(EventData::internal);

        {
            let mut state = self.inner.position.lock();
            match internal {
                Some(EventData::MariaGtid(gtid)) => state.on_gtid(gtid.gtid),
                Some(EventData::Xid { .. }) => state.on_commit(),
                Some(EventData::Query(query)) => state.on_query(&query.query),
                _ => {}
            }
        }

        self.inner.listeners.notify_event(&event.to_external());

        let mut state = self.inner.position.lock();
        match (event.event_type(), internal) {
            (EventType::Rotate, Some(EventData::Rotate(rotate))) => {
                state.on_rotate(rotate.next_binlog_name.clone(), rotate.position);
            }
            // TABLE_MAP 위치는 저장하지 않는다: 재연결 시 테이블 맵부터 다시 받아야
            // 뒤따르는 row 이벤트를 해석할 수 있다
            (EventType::Rotate, _) | (EventType::TableMap, _) => {}
            _ => state.on_next_position(event.header.next_pos as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::protocol::PacketChannel;
    use crate::test_support::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_test::io::Builder;
    use tokio_util::sync::CancellationToken;

    fn header(len: usize, sequence: u8) -> [u8; 4] {
        [len as u8, (len >> 8) as u8, (len >> 16) as u8, sequence]
    }

    #[tokio::test]
    async fn test_reassemble_split_packet() {
        let second = vec![7u8; MAX_PACKET_LENGTH];
        let third = vec![9u8; 500];
        let mock = Builder::new()
            .read(&header(second.len(), 1))
            .read(&second)
            .read(&header(third.len(), 2))
            .read(&third)
            .build();
        let (mut reader, _writer) = PacketChannel::new(Box::new(mock), CancellationToken::new())
            .split()
            .unwrap();

        let first = vec![0u8; MAX_PACKET_LENGTH];
        let buffer = reassemble_split_packet(&mut reader, first).await.unwrap();
        assert_eq!(buffer.len(), 33_554_930);
        assert_eq!(buffer[MAX_PACKET_LENGTH], 7);
        assert_eq!(buffer[buffer.len() - 1], 9);
    }

    #[tokio::test]
    async fn test_reassembled_event_matches_unsplit_payload() {
        // 헤더 19 bytes + 본문 = 마커 포함 MAX + 10 bytes
        let body_len = MAX_PACKET_LENGTH + 10 - 1 - 19;
        let frame = event_frame(EventType::WriteRows, 1, 1000, &vec![3u8; body_len]);
        let mut packet = vec![0x00];
        packet.extend_from_slice(&frame);

        let (first, rest) = packet.split_at(MAX_PACKET_LENGTH);
        let mock = Builder::new()
            .read(&header(rest.len(), 1))
            .read(rest)
            .build();
        let (mut reader, _writer) = PacketChannel::new(Box::new(mock), CancellationToken::new())
            .split()
            .unwrap();

        let buffer = reassemble_split_packet(&mut reader, first.to_vec()).await.unwrap();
        assert_eq!(buffer, packet);
    }

    #[tokio::test]
    async fn test_decode_failure_does_not_stop_stream() {
        let server = FakeServer::mariadb()
            .with_binlog_status("mysql-bin.000001", 4)
            .with_events(vec![
                // 잘린 XID 본문
                event_frame(EventType::Xid, 1, 200, &[1, 2, 3]),
                xid_event(1, 300, 8),
            ]);
        let client = test_client(
            ClientConfig::default().with_keep_alive(false, Duration::from_secs(1)),
            &server,
        );
        let lifecycle = RecordingLifecycle::register(&client);
        let events = RecordingEvents::register(&client);

        client.connect_with_timeout(Duration::from_secs(5)).await.unwrap();
        events.wait_for(1).await;

        assert_eq!(lifecycle.deserialization_failures(), 1);
        assert_eq!(events.types(), vec![EventType::Xid]);
        assert_eq!(client.binlog_position(), 300);
        assert!(client.is_connected());

        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_skipped_payload_is_not_delivered() {
        let server = FakeServer::mariadb()
            .with_binlog_status("mysql-bin.000001", 4)
            .with_events(vec![xid_event(1, 300, 8), query_event(1, 400, "COMMIT")])
            .close_after_events();
        let client = test_client(
            ClientConfig::default().with_keep_alive(false, Duration::from_secs(1)),
            &server,
        );
        client
            .set_event_data_decoder(EventType::Xid, Arc::new(crate::codec::NullDecoder))
            .unwrap();
        let positions = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let recorder = positions.clone();
        let observer = client.clone();
        client.register_event_listener(Arc::new(move |event: &Event| {
            recorder
                .lock()
                .push((event.event_type(), observer.binlog_position()));
        }));

        client.connect().await.unwrap();

        // XID는 리스너에 가지 않고 위치도 300으로 옮기지 않는다
        assert_eq!(*positions.lock(), vec![(EventType::Query, 4)]);
        assert_eq!(client.binlog_position(), 400);
    }

    #[tokio::test]
    async fn test_non_blocking_end_of_stream() {
        let server = FakeServer::mariadb()
            .with_binlog_status("mysql-bin.000001", 4)
            .with_events(vec![xid_event(1, 300, 8)])
            .end_with_eof();
        let config = ClientConfig::default()
            .with_blocking(false)
            .with_keep_alive(true, Duration::from_secs(30));
        let client = test_client(config, &server);
        let lifecycle = RecordingLifecycle::register(&client);

        client.connect().await.unwrap();

        assert_eq!(lifecycle.history(), vec!["connect", "disconnect"]);
        assert!(!client.is_connected());
        assert!(!client.is_keep_alive_running());
        // non-blocking dump는 server_id 0으로 요청한다
        assert_eq!(server.dumps()[0].server_id, 0);
    }

    #[tokio::test]
    async fn test_server_close_is_communication_failure() {
        let server = FakeServer::mariadb()
            .with_binlog_status("mysql-bin.000001", 4)
            .with_events(vec![xid_event(1, 300, 8)])
            .close_after_events();
        let client = test_client(
            ClientConfig::default().with_keep_alive(false, Duration::from_secs(1)),
            &server,
        );
        let lifecycle = RecordingLifecycle::register(&client);

        client.connect().await.unwrap();

        assert_eq!(
            lifecycle.history(),
            vec!["connect", "communication_failure", "disconnect"]
        );
        assert_eq!(client.binlog_position(), 300);
    }

    #[tokio::test]
    async fn test_server_error_marker_ends_session() {
        let server = FakeServer::mariadb()
            .with_binlog_status("mysql-bin.000001", 4)
            .with_stream_error(1236, "Could not find first log file name in binary log index file");
        let client = test_client(
            ClientConfig::default().with_keep_alive(false, Duration::from_secs(1)),
            &server,
        );
        let lifecycle = RecordingLifecycle::register(&client);

        client.connect().await.unwrap();

        assert_eq!(lifecycle.history(), vec!["connect", "communication_failure", "disconnect"]);
        assert!(matches!(
            lifecycle.last_failure(),
            Some(BinlogError::Server { code: 1236, .. })
        ));
    }

    #[tokio::test]
    async fn test_table_map_does_not_advance_position() {
        let server = FakeServer::mariadb()
            .with_binlog_status("mysql-bin.000001", 4)
            .with_events(vec![
                query_event(1, 500, "BEGIN"),
                table_map_event(1, 600, "shop", "orders"),
                event_frame(EventType::WriteRows, 1, 700, &[0u8; 8]),
            ])
            .close_after_events();
        let client = test_client(
            ClientConfig::default().with_keep_alive(false, Duration::from_secs(1)),
            &server,
        );
        let positions = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let recorder = positions.clone();
        let observer = client.clone();
        client.register_event_listener(Arc::new(move |event: &Event| {
            recorder
                .lock()
                .push((event.event_type(), observer.binlog_position()));
        }));

        client.connect().await.unwrap();

        // 리스너는 위치 갱신 전에 호출된다
        assert_eq!(
            *positions.lock(),
            vec![
                (EventType::Query, 4),
                (EventType::TableMap, 500),
                (EventType::WriteRows, 500),
            ]
        );
        assert_eq!(client.binlog_position(), 700);
    }

    #[tokio::test]
    async fn test_gtid_mode_commits_on_xid() {
        let server = FakeServer::mariadb()
            .with_gtid_current_pos("0-1-10")
            .with_events(vec![
                maria_gtid_event(1, 100, 0, 11),
                xid_event(1, 200, 1),
                maria_gtid_event(1, 300, 0, 12),
                query_event(1, 400, "ROLLBACK"),
            ])
            .close_after_events();
        let client = test_client(
            ClientConfig::default()
                .with_gtid_set("0-1-10")
                .with_keep_alive(false, Duration::from_secs(1)),
            &server,
        );

        client.connect().await.unwrap();
        assert_eq!(client.gtid_set().as_deref(), Some("0-1-11"));
    }
}

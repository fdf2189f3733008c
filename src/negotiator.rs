//! 연결 협상
//!
//! 소켓 열기 → greeting → (TLS) → 인증 → 위치 조회 → 체크섬 → heartbeat →
//! GTID 맞추기 → COM_BINLOG_DUMP 순서로 진행한다. 실패하면 채널을 닫고
//! 에러를 그대로 돌려준다.

use crate::auth::{self, AuthSwitchRequest, AUTH_SWITCH_MARKER};
use crate::binlog_client::{BinaryLogClient, ConnectionState};
use crate::codec::ChecksumType;
use crate::config::SslMode;
use crate::error::{BinlogError, Result};
use crate::gtid::{self, GtidSet};
use crate::protocol::{
    self, create_binlog_dump_command, create_query_command, create_register_slave_command,
    ErrorPacket, GreetingPacket, PacketChannel, PacketReader, PacketWriter, ResultSetRow,
};
use crate::watchdog::Watchdog;
use std::sync::atomic::Ordering;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

impl BinaryLogClient {
    /// 인증된 스트리밍 세션을 하나 만든다. connect lock을 잡은 상태에서만 호출한다.
    pub(crate) async fn negotiate(&self) -> Result<(PacketReader, PacketWriter)> {
        let config = &self.inner.config;
        self.set_state(ConnectionState::Connecting);

        let close_token = CancellationToken::new();
        *self.inner.channel_token.lock() = Some(close_token.clone());

        let watchdog = if !config.connect_timeout.is_zero() && !self.inner.keep_alive.is_running()
        {
            Some(Watchdog::schedule(self.clone(), config.connect_timeout))
        } else {
            None
        };

        let result = self.open_session(close_token.clone()).await;

        let timed_out = match watchdog {
            Some(watchdog) => watchdog.cancel().await,
            None => false,
        };

        match result {
            Ok(mut channel) => {
                if close_token.is_cancelled() {
                    channel.close();
                    return Err(BinlogError::State(
                        "Disconnected while negotiating the replication session".to_string(),
                    ));
                }
                channel.split()
            }
            Err(e) => {
                close_token.cancel();
                if timed_out {
                    Err(BinlogError::Timeout(format!(
                        "Failed to negotiate with {}:{} within {:?}: {}",
                        config.hostname, config.port, config.connect_timeout, e
                    )))
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn open_session(&self, close_token: CancellationToken) -> Result<PacketChannel> {
        let config = &self.inner.config;

        let factory = self.socket_factory();
        let stream = tokio::select! {
            _ = close_token.cancelled() => {
                return Err(BinlogError::Connection(format!(
                    "Connection to {}:{} cancelled", config.hostname, config.port
                )))
            }
            stream = factory.connect(&config.hostname, config.port, config.connect_timeout) => stream?,
        };
        let mut channel = PacketChannel::new(stream, close_token);

        if !channel.has_data().await? {
            return Err(BinlogError::Connection(format!(
                "Failed to connect to MySQL on {}:{}. Please make sure it's running.",
                config.hostname, config.port
            )));
        }

        let greeting = self.receive_greeting(&mut channel).await?;
        self.set_state(ConnectionState::Authenticating);
        self.authenticate(&mut channel, &greeting).await?;

        self.resolve_start_position(&mut channel).await?;
        self.negotiate_checksum(&mut channel).await?;
        if let Some(interval) = config.heartbeat_interval {
            self.enable_heartbeat(&mut channel, interval.as_millis() as u64)
                .await?;
        }
        self.request_binlog_stream(&mut channel).await?;

        Ok(channel)
    }

    async fn receive_greeting(&self, channel: &mut PacketChannel) -> Result<GreetingPacket> {
        let packet = channel.read_packet().await?;
        if protocol::is_error_packet(&packet) {
            return Err(ErrorPacket::from_packet(&packet)?.into_server_error());
        }
        let greeting = GreetingPacket::parse(&packet)?;

        self.inner
            .connection_id
            .store(greeting.thread_id as u64, Ordering::SeqCst);
        if greeting.is_mariadb() {
            info!(
                "Switch to mariadb mode, server version is {}",
                greeting.server_version
            );
            self.inner.mariadb.store(true, Ordering::SeqCst);
        }
        debug!(
            "Server version: {}, Thread ID: {}",
            greeting.server_version, greeting.thread_id
        );
        Ok(greeting)
    }

    async fn authenticate(&self, channel: &mut PacketChannel, greeting: &GreetingPacket) -> Result<()> {
        let config = &self.inner.config;
        let collation = greeting.server_collation;
        let mut sequence: u8 = 1;

        let use_ssl = self.upgrade_to_tls(channel, greeting).await?;
        if use_ssl {
            sequence += 1;
        }

        let response = auth::create_handshake_response(
            &config.username,
            &config.password,
            config.schema.as_deref(),
            &greeting.scramble,
            collation,
            use_ssl,
        )?;
        channel.write_packet(&response, sequence).await?;

        let result = channel.read_packet().await?;
        match result.first() {
            Some(0x00) => {}
            Some(0xFF) => return Err(ErrorPacket::from_packet(&result)?.into_authentication_error()),
            Some(&AUTH_SWITCH_MARKER) => {
                let request = AuthSwitchRequest::parse(&result)?;
                debug!("Server requested auth switch to {}", request.plugin_name);
                let switch_response = request.create_response(&config.password)?;
                channel
                    .write_packet(&switch_response, sequence + 2)
                    .await?;

                let switch_result = channel.read_packet().await?;
                match switch_result.first() {
                    Some(0x00) => {}
                    Some(0xFF) => {
                        return Err(ErrorPacket::from_packet(&switch_result)?
                            .into_authentication_error())
                    }
                    other => {
                        return Err(BinlogError::authentication(format!(
                            "Unexpected authentication result ({:?})",
                            other
                        )))
                    }
                }
            }
            other => {
                return Err(BinlogError::authentication(format!(
                    "Unexpected authentication result ({:?})",
                    other
                )))
            }
        }

        debug!("Authentication successful");
        Ok(())
    }

    /// TLS를 쓰게 되면 true
    async fn upgrade_to_tls(&self, channel: &mut PacketChannel, greeting: &GreetingPacket) -> Result<bool> {
        let config = &self.inner.config;
        if config.ssl_mode == SslMode::Disabled {
            return Ok(false);
        }

        let server_supports_ssl = greeting.server_capabilities & auth::capabilities::SSL != 0;
        if !server_supports_ssl {
            if config.ssl_mode.is_required() {
                return Err(BinlogError::Connection(
                    "MySQL server does not support SSL".to_string(),
                ));
            }
            warn!("Server does not support SSL, continuing without TLS");
            return Ok(false);
        }

        let request = auth::create_ssl_request(greeting.server_collation, config.schema.is_some())?;
        channel.write_packet(&request, 1).await?;
        channel
            .upgrade_to_tls(self.tls_upgrader().as_ref(), &config.hostname, config.ssl_mode)
            .await?;
        Ok(true)
    }

    /// 시작 파일이 없으면 서버 현재 위치 조회, 최소 위치 보정
    async fn resolve_start_position(&self, channel: &mut PacketChannel) -> Result<()> {
        let needs_lookup = self.inner.position.lock().binlog_filename().is_none();
        if needs_lookup {
            let rows = match self.query(channel, "show master status").await {
                Err(BinlogError::Server { code, message, .. }) => {
                    debug!(
                        "show master status failed ({} {}), trying show binary log status",
                        code, message
                    );
                    self.query(channel, "show binary log status").await?
                }
                other => other?,
            };

            let row = rows.first().ok_or_else(|| {
                BinlogError::Connection("Failed to determine binlog filename/position".to_string())
            })?;
            let filename = row.value(0).unwrap_or_default().to_string();
            let position = row
                .value(1)
                .and_then(|p| p.parse::<u64>().ok())
                .ok_or_else(|| {
                    BinlogError::Protocol(format!("Invalid binlog position: {:?}", row.value(1)))
                })?;

            let mut state = self.inner.position.lock();
            state.set_binlog_filename(Some(filename));
            state.set_binlog_position(position);
        }

        if let Some(previous) = self.inner.position.lock().clamp_position() {
            warn!(
                "Binary log position adjusted from {} to {}",
                previous,
                crate::offset::MIN_BINLOG_POSITION
            );
        }
        Ok(())
    }

    async fn negotiate_checksum(&self, channel: &mut PacketChannel) -> Result<()> {
        let rows = self
            .query(channel, "show global variables like 'binlog_checksum'")
            .await?;
        let checksum = match rows.first().and_then(|row| row.value(1)) {
            Some(value) => value.parse::<ChecksumType>()?,
            None => ChecksumType::None,
        };

        if checksum != ChecksumType::None {
            self.execute(channel, "set @master_binlog_checksum= @@global.binlog_checksum")
                .await?;
        }
        debug!("Binlog checksum: {:?}", checksum);
        self.event_deserializer().set_checksum(checksum);
        Ok(())
    }

    async fn enable_heartbeat(&self, channel: &mut PacketChannel, interval_ms: u64) -> Result<()> {
        let sql = format!(
            "set @master_heartbeat_period={}",
            interval_ms.saturating_mul(1_000_000)
        );
        self.execute(channel, &sql).await
    }

    async fn request_binlog_stream(&self, channel: &mut PacketChannel) -> Result<()> {
        let config = &self.inner.config;
        let dump_server_id = if config.blocking { config.server_id } else { 0 };

        let gtid_request = {
            let state = self.inner.position.lock();
            if state.is_gtid_mode() {
                Some(state.gtid_set().unwrap_or_default())
            } else {
                None
            }
        };

        let command = match gtid_request {
            Some(requested) => {
                if !self.is_mariadb() {
                    return Err(BinlogError::Config(
                        "GTID mode requires a MariaDB server".to_string(),
                    ));
                }
                self.register_gtid_replica(channel, &requested).await?;
                create_binlog_dump_command(dump_server_id, "", crate::offset::MIN_BINLOG_POSITION)?
            }
            None => {
                let (filename, position) = {
                    let state = self.inner.position.lock();
                    (
                        state.binlog_filename().unwrap_or_default().to_string(),
                        state.binlog_position(),
                    )
                };
                create_binlog_dump_command(dump_server_id, &filename, position)?
            }
        };

        channel.write_packet(&command, 0).await
    }

    /// GTID 시작 위치를 서버 상태와 맞추고 복제 슬레이브로 등록
    async fn register_gtid_replica(&self, channel: &mut PacketChannel, requested: &str) -> Result<()> {
        info!("GTID list before reset {}", requested);

        let current = self
            .query(channel, "select @@gtid_current_pos")
            .await?
            .first()
            .and_then(|row| row.value(0).map(str::to_string))
            .unwrap_or_default();
        let server_current = GtidSet::parse(&current)?;
        let reconciled = gtid::reconcile(requested, &server_current)?;

        match self.oldest_retained_gtids(channel).await {
            Ok(Some(oldest)) => {
                for (wanted, retained) in gtid::purged_domains(&reconciled.request, &oldest) {
                    warn!(
                        "Requested GTID {} is older than the oldest retained {}; the server may have purged it",
                        wanted, retained
                    );
                }
            }
            Ok(None) => {}
            Err(e) => debug!("Could not determine oldest retained GTID list: {}", e),
        }

        self.inner.position.lock().apply_reconciled(&reconciled.tracked);
        info!("Gtid list after reset {}", reconciled.tracked);

        self.execute_lenient(channel, "SET @mariadb_slave_capability = 4")
            .await?;
        self.execute_lenient(
            channel,
            &format!("SET @slave_connect_state = \"{}\"", reconciled.request),
        )
        .await?;
        self.execute_lenient(channel, "SET @slave_gtid_strict_mode = 0")
            .await?;
        self.execute_lenient(channel, "SET @slave_gtid_ignore_duplicates = 0")
            .await?;

        let register = create_register_slave_command(self.inner.config.server_id)?;
        channel.write_packet(&register, 0).await?;
        let response = channel.read_packet().await?;
        if protocol::is_error_packet(&response) {
            return Err(ErrorPacket::from_packet(&response)?.into_server_error());
        }
        Ok(())
    }

    /// 가장 오래된 binlog의 GTID_LIST 이벤트 ("[0-1-5,1-2-9]")
    async fn oldest_retained_gtids(&self, channel: &mut PacketChannel) -> Result<Option<GtidSet>> {
        let logs = self.query(channel, "show binary logs").await?;
        let oldest_file = match logs.first().and_then(|row| row.value(0)) {
            Some(file) => file.to_string(),
            None => return Ok(None),
        };
        debug!("Oldest binlog file: {}", oldest_file);

        let events = self
            .query(
                channel,
                &format!("show binlog events in '{}' limit 2", oldest_file),
            )
            .await?;
        match events.get(1).and_then(|row| row.value(5)) {
            Some(gtid_list) => Ok(Some(GtidSet::parse(gtid_list)?)),
            None => Ok(None),
        }
    }

    /// 텍스트 쿼리를 보내고 결과셋 행을 읽는다
    pub(crate) async fn query(&self, channel: &mut PacketChannel, sql: &str) -> Result<Vec<ResultSetRow>> {
        channel.write_packet(&create_query_command(sql), 0).await?;

        let first = channel.read_packet().await?;
        if protocol::is_error_packet(&first) {
            return Err(ErrorPacket::from_packet(&first)?.into_server_error());
        }

        // 컬럼 정의는 건너뛴다
        loop {
            let packet = channel.read_packet().await?;
            if protocol::is_eof_packet(&packet) {
                break;
            }
        }

        let mut rows = Vec::new();
        loop {
            let packet = channel.read_packet().await?;
            if protocol::is_error_packet(&packet) {
                return Err(ErrorPacket::from_packet(&packet)?.into_server_error());
            }
            if protocol::is_eof_packet(&packet) {
                break;
            }
            rows.push(ResultSetRow::parse(&packet)?);
        }
        Ok(rows)
    }

    /// 결과셋 없는 문장 실행. 서버 에러는 실패로 본다.
    async fn execute(&self, channel: &mut PacketChannel, sql: &str) -> Result<()> {
        channel.write_packet(&create_query_command(sql), 0).await?;
        let response = channel.read_packet().await?;
        if protocol::is_error_packet(&response) {
            return Err(ErrorPacket::from_packet(&response)?.into_server_error());
        }
        Ok(())
    }

    /// 응답을 읽기만 하고 서버 에러는 경고로 남긴다
    async fn execute_lenient(&self, channel: &mut PacketChannel, sql: &str) -> Result<()> {
        if let Err(e) = self.execute(channel, sql).await {
            match e {
                BinlogError::Server { .. } => warn!("Ignoring error for '{}': {}", sql, e),
                other => return Err(other),
            }
        }
        Ok(())
    }
}

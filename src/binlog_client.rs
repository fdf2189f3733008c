//! MariaDB Binlog 복제 클라이언트
//!
//! 연결 하나를 소유하고 협상 → 스트리밍 → 종료의 생명주기를 관리한다.
//! 협상은 [`crate::negotiator`], 수신 루프는 [`crate::stream`], 연결 감시는
//! [`crate::keepalive`] / [`crate::watchdog`]에 있다.

use crate::codec::{EventDataDecoder, EventDeserializer, QueryDecoder, RotateDecoder};
use crate::config::ClientConfig;
use crate::error::{BinlogError, Result};
use crate::events::EventType;
use crate::keepalive::KeepAliveSupervisor;
use crate::listener::{EventListener, LifecycleListener, ListenerId, ListenerRegistry};
use crate::offset::{PositionSnapshot, PositionState, ResumePosition};
use crate::protocol::{PacketWriter, COM_PING};
use crate::transport::{RustlsUpgrader, SocketFactory, TcpSocketFactory, TlsUpgrader};
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 연결 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Idle = 0,
    Connecting = 1,
    Authenticating = 2,
    Streaming = 3,
    Disconnecting = 4,
    Disconnected = 5,
}

impl ConnectionState {
    fn from_u8(val: u8) -> Self {
        match val {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Authenticating,
            3 => ConnectionState::Streaming,
            4 => ConnectionState::Disconnecting,
            5 => ConnectionState::Disconnected,
            _ => ConnectionState::Idle,
        }
    }
}

pub(crate) struct ClientInner {
    pub(crate) config: ClientConfig,
    /// 협상 + 스트리밍 동안 잡고 있는다. 동시에 하나의 세션만 존재한다.
    pub(crate) connect_lock: tokio::sync::Mutex<()>,
    pub(crate) connected: AtomicBool,
    state: AtomicU8,
    pub(crate) connection_id: AtomicU64,
    pub(crate) mariadb: AtomicBool,
    /// 마지막 이벤트 수신 시각 (epoch millis)
    pub(crate) event_last_seen: AtomicI64,
    pub(crate) position: Mutex<PositionState>,
    /// 현재 채널의 close token. 취소하면 진행 중인 읽기/쓰기가 즉시 실패한다.
    pub(crate) channel_token: Mutex<Option<CancellationToken>>,
    pub(crate) writer: tokio::sync::Mutex<Option<PacketWriter>>,
    deserializer: RwLock<Arc<EventDeserializer>>,
    pub(crate) listeners: ListenerRegistry,
    pub(crate) keep_alive: KeepAliveSupervisor,
    socket_factory: RwLock<Arc<dyn SocketFactory>>,
    tls_upgrader: RwLock<Arc<dyn TlsUpgrader>>,
}

/// Binlog 복제 클라이언트. Clone은 같은 연결을 공유한다.
#[derive(Clone)]
pub struct BinaryLogClient {
    pub(crate) inner: Arc<ClientInner>,
}

impl BinaryLogClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let position = PositionState::from_config(&config)?;

        Ok(BinaryLogClient {
            inner: Arc::new(ClientInner {
                config,
                connect_lock: tokio::sync::Mutex::new(()),
                connected: AtomicBool::new(false),
                state: AtomicU8::new(ConnectionState::Idle as u8),
                connection_id: AtomicU64::new(0),
                mariadb: AtomicBool::new(false),
                event_last_seen: AtomicI64::new(0),
                position: Mutex::new(position),
                channel_token: Mutex::new(None),
                writer: tokio::sync::Mutex::new(None),
                deserializer: RwLock::new(Arc::new(EventDeserializer::new())),
                listeners: ListenerRegistry::new(),
                keep_alive: KeepAliveSupervisor::new(),
                socket_factory: RwLock::new(Arc::new(TcpSocketFactory)),
                tls_upgrader: RwLock::new(Arc::new(RustlsUpgrader)),
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// 연결하고 세션이 끝날 때까지 이벤트를 수신한다.
    ///
    /// 협상 실패는 에러로 돌려준다. 연결된 뒤의 실패는 라이프사이클 리스너로
    /// 전달되고 이 함수는 세션 종료 후 `Ok(())`를 돌려준다.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.inner.connect_lock.try_lock().map_err(|_| {
            BinlogError::State("BinaryLogClient is already connected".to_string())
        })?;

        let (reader, writer) = match self.negotiate().await {
            Ok(halves) => halves,
            Err(e) => {
                self.inner.channel_token.lock().take();
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        *self.inner.writer.lock().await = Some(writer);
        self.inner.connected.store(true, Ordering::SeqCst);

        // 협상 직후 disconnect가 채널을 닫았으면 세션을 시작하지 않는다
        let closed = self
            .inner
            .channel_token
            .lock()
            .as_ref()
            .map_or(true, CancellationToken::is_cancelled);
        if closed {
            self.inner.connected.store(false, Ordering::SeqCst);
            self.inner.writer.lock().await.take();
            self.set_state(ConnectionState::Disconnected);
            debug!("Disconnect requested before the binlog stream started");
            return Err(BinlogError::State(
                "Disconnected while negotiating the replication session".to_string(),
            ));
        }
        self.set_state(ConnectionState::Streaming);
        self.stamp_event_seen();

        info!(
            "Connected to {}:{} at {} (sid:{}, cid:{})",
            self.inner.config.hostname,
            self.inner.config.port,
            self.resume_position(),
            self.inner.config.server_id,
            self.connection_id()
        );
        self.inner.listeners.notify_connect();

        if self.inner.config.keep_alive && !self.inner.keep_alive.is_running() {
            self.inner.keep_alive.start(self.clone());
        }
        self.ensure_decoders();

        self.listen_for_event_packets(reader).await;

        self.set_state(ConnectionState::Disconnected);
        self.inner.listeners.notify_disconnect();
        Ok(())
    }

    /// spawn 가능한 형태의 connect
    pub(crate) fn connect_owned(self) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
        Box::pin(async move { self.connect().await })
    }

    /// 별도 태스크에서 연결하고, 협상이 끝날 때까지만 기다린다.
    pub async fn connect_with_timeout(&self, timeout: Duration) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let signal = Arc::new(ConnectSignal {
            sender: Mutex::new(Some(tx)),
        });
        let listener_id = self
            .inner
            .listeners
            .register_lifecycle_listener(signal.clone());

        let session = self.clone().connect_owned();
        tokio::spawn(async move {
            if let Err(e) = session.await {
                signal.fire(Err(e));
            }
        });

        let outcome = tokio::time::timeout(timeout, rx).await;
        self.inner.listeners.unregister_lifecycle_listener(listener_id);

        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BinlogError::State(
                "Connect task finished without reporting a result".to_string(),
            )),
            Err(_) => {
                self.terminate_connect().await;
                Err(BinlogError::Timeout(format!(
                    "BinaryLogClient was unable to connect in {:?}",
                    timeout
                )))
            }
        }
    }

    /// keep-alive를 멈추고 현재 세션이 완전히 끝날 때까지 기다린다. 여러 번 불러도 된다.
    pub async fn disconnect(&self) -> Result<()> {
        self.inner.keep_alive.stop().await;
        self.terminate_connect().await;
        Ok(())
    }

    /// 채널을 닫고 connect lock을 얻을 수 있을 때까지(세션 종료) 기다린다
    pub(crate) async fn terminate_connect(&self) {
        loop {
            self.disconnect_channel();
            match tokio::time::timeout(Duration::from_secs(1), self.inner.connect_lock.lock()).await
            {
                Ok(_guard) => return,
                Err(_) => debug!("Waiting for binlog session to terminate"),
            }
        }
    }

    /// 연결 플래그를 내리고 현재 채널을 닫는다. 어느 태스크에서든 호출할 수 있다.
    pub(crate) fn disconnect_channel(&self) {
        if self.inner.connected.swap(false, Ordering::SeqCst) {
            self.set_state(ConnectionState::Disconnecting);
        }
        if let Some(token) = self.inner.channel_token.lock().take() {
            token.cancel();
        }
    }

    /// 스트리밍 중인 연결에 COM_PING 전송
    pub(crate) async fn ping(&self) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;
        match writer.as_mut() {
            Some(writer) => writer.write_packet(&[COM_PING], 0).await,
            None => Err(BinlogError::State("Not connected".to_string())),
        }
    }

    fn ensure_decoders(&self) {
        let deserializer = self.event_deserializer();
        deserializer.ensure_decoder(EventType::Rotate, Arc::new(RotateDecoder));
        if self.inner.position.lock().is_gtid_mode() {
            deserializer.ensure_decoder(EventType::Query, Arc::new(QueryDecoder));
        }
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.inner.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn connection_state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// 서버가 greeting에서 알려준 스레드 ID
    pub fn connection_id(&self) -> u64 {
        self.inner.connection_id.load(Ordering::SeqCst)
    }

    pub fn is_mariadb(&self) -> bool {
        self.inner.mariadb.load(Ordering::SeqCst)
    }

    pub fn is_keep_alive_running(&self) -> bool {
        self.inner.keep_alive.is_running()
    }

    pub(crate) fn stamp_event_seen(&self) {
        self.inner
            .event_last_seen
            .store(chrono::Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    /// 마지막 이벤트 이후 경과 시간
    pub(crate) fn since_last_event(&self) -> Duration {
        let elapsed = chrono::Utc::now().timestamp_millis()
            - self.inner.event_last_seen.load(Ordering::SeqCst);
        Duration::from_millis(elapsed.max(0) as u64)
    }

    fn ensure_disconnected(&self, what: &str) -> Result<()> {
        if self.is_connected() {
            return Err(BinlogError::State(format!(
                "Cannot change {} while connected",
                what
            )));
        }
        Ok(())
    }

    pub fn binlog_filename(&self) -> Option<String> {
        self.inner
            .position
            .lock()
            .binlog_filename()
            .map(str::to_string)
    }

    pub fn binlog_position(&self) -> u64 {
        self.inner.position.lock().binlog_position()
    }

    /// GTID 모드일 때 도메인별 커밋된 GTID ("0-1-100,1-2-50")
    pub fn gtid_set(&self) -> Option<String> {
        self.inner.position.lock().gtid_set()
    }

    pub fn resume_position(&self) -> ResumePosition {
        self.inner.position.lock().resume_position()
    }

    pub fn position_snapshot(&self) -> PositionSnapshot {
        self.inner
            .position
            .lock()
            .snapshot(self.inner.config.server_id)
    }

    pub fn set_binlog_filename(&self, filename: Option<String>) -> Result<()> {
        self.ensure_disconnected("binlog filename")?;
        self.inner.position.lock().set_binlog_filename(filename);
        Ok(())
    }

    pub fn set_binlog_position(&self, position: u64) -> Result<()> {
        self.ensure_disconnected("binlog position")?;
        self.inner.position.lock().set_binlog_position(position);
        Ok(())
    }

    /// None이 아니면 GTID 모드로 전환한다 (파일명이 없으면 ""로 설정)
    pub fn set_gtid_set(&self, gtid_set: Option<String>) -> Result<()> {
        self.ensure_disconnected("GTID set")?;
        self.inner.position.lock().set_gtid_set(gtid_set)?;
        Ok(())
    }

    pub fn event_deserializer(&self) -> Arc<EventDeserializer> {
        self.inner.deserializer.read().clone()
    }

    pub fn set_event_deserializer(&self, deserializer: EventDeserializer) -> Result<()> {
        self.ensure_disconnected("event deserializer")?;
        *self.inner.deserializer.write() = Arc::new(deserializer);
        Ok(())
    }

    /// 특정 타입의 디코더 교체
    pub fn set_event_data_decoder(
        &self,
        event_type: EventType,
        decoder: Arc<dyn EventDataDecoder>,
    ) -> Result<()> {
        self.ensure_disconnected("event data decoder")?;
        self.event_deserializer().set_decoder(event_type, decoder);
        Ok(())
    }

    pub(crate) fn socket_factory(&self) -> Arc<dyn SocketFactory> {
        self.inner.socket_factory.read().clone()
    }

    pub fn set_socket_factory(&self, factory: Arc<dyn SocketFactory>) -> Result<()> {
        self.ensure_disconnected("socket factory")?;
        *self.inner.socket_factory.write() = factory;
        Ok(())
    }

    pub(crate) fn tls_upgrader(&self) -> Arc<dyn TlsUpgrader> {
        self.inner.tls_upgrader.read().clone()
    }

    pub fn set_tls_upgrader(&self, upgrader: Arc<dyn TlsUpgrader>) -> Result<()> {
        self.ensure_disconnected("TLS upgrader")?;
        *self.inner.tls_upgrader.write() = upgrader;
        Ok(())
    }

    pub fn register_event_listener(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        self.inner.listeners.register_event_listener(listener)
    }

    pub fn unregister_event_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.unregister_event_listener(id)
    }

    pub fn register_lifecycle_listener(&self, listener: Arc<dyn LifecycleListener>) -> ListenerId {
        self.inner.listeners.register_lifecycle_listener(listener)
    }

    pub fn unregister_lifecycle_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.unregister_lifecycle_listener(id)
    }

    pub fn event_listener_count(&self) -> usize {
        self.inner.listeners.event_listener_count()
    }

    pub fn lifecycle_listener_count(&self) -> usize {
        self.inner.listeners.lifecycle_listener_count()
    }
}

/// connect_with_timeout이 협상 결과를 한 번만 받기 위한 리스너
struct ConnectSignal {
    sender: Mutex<Option<oneshot::Sender<Result<()>>>>,
}

impl ConnectSignal {
    fn fire(&self, result: Result<()>) {
        if let Some(sender) = self.sender.lock().take() {
            if sender.send(result).is_err() {
                warn!("Connect result dropped: caller stopped waiting");
            }
        }
    }
}

impl LifecycleListener for ConnectSignal {
    fn on_connect(&self) {
        self.fire(Ok(()));
    }
}

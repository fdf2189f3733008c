/// Binlog 복제 클라이언트 사용 예제
///
/// 환경 변수(DB_HOST, DB_PORT, DB_USER, DB_PASSWORD, DB_SERVER_ID, DB_SSL_MODE, DB_GTID)로
/// 접속해 받은 이벤트를 로그로 출력한다. Ctrl-C로 종료.
use maria_binlog::{BinaryLogClient, BinlogError, ClientConfig, Event, LifecycleListener};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

struct LoggingLifecycle;

impl LifecycleListener for LoggingLifecycle {
    fn on_connect(&self) {
        info!("Replication session started");
    }

    fn on_communication_failure(&self, error: &BinlogError) {
        error!("Communication failure: {}", error);
    }

    fn on_event_deserialization_failure(&self, error: &BinlogError) {
        warn!("Skipped event: {}", error);
    }

    fn on_disconnect(&self) {
        info!("Replication session ended");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 초기화 (RUST_LOG로 레벨 조정)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ClientConfig::from_env()?;
    info!(
        "Connecting to {}:{} as {} (server_id={})",
        config.hostname, config.port, config.username, config.server_id
    );

    let client = BinaryLogClient::new(config)?;
    client.register_lifecycle_listener(Arc::new(LoggingLifecycle));

    let observer = client.clone();
    client.register_event_listener(Arc::new(move |event: &Event| {
        info!(
            "{:?} next_pos={} resume={}",
            event.event_type(),
            event.header.next_pos,
            observer.resume_position()
        );
    }));

    client.connect_with_timeout(Duration::from_secs(10)).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down at {}", client.position_snapshot());
    client.disconnect().await?;

    Ok(())
}

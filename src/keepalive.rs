//! Keep-alive 감시 태스크
//!
//! 주기마다 연결이 살아 있는지 확인하고, 끊겼으면 기존 세션을 정리한 뒤 다시
//! 연결한다. heartbeat를 켰으면 마지막 이벤트 수신 시각으로, 아니면 COM_PING
//! 전송 성공 여부로 판단한다.

use crate::binlog_client::BinaryLogClient;
use crate::error::Result;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Running = (CancellationToken, JoinHandle<()>);

/// 클라이언트당 하나만 돈다
pub(crate) struct KeepAliveSupervisor {
    running: Mutex<Option<Running>>,
}

impl KeepAliveSupervisor {
    pub(crate) fn new() -> Self {
        KeepAliveSupervisor {
            running: Mutex::new(None),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map(|(cancel, handle)| !cancel.is_cancelled() && !handle.is_finished())
            .unwrap_or(false)
    }

    /// 이미 돌고 있으면 아무것도 하지 않는다
    pub(crate) fn start(&self, client: BinaryLogClient) {
        let mut running = self.running.lock();
        if let Some((cancel, handle)) = running.as_ref() {
            if !cancel.is_cancelled() && !handle.is_finished() {
                return;
            }
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(supervise(client, cancel.clone()));
        *running = Some((cancel, handle));
    }

    /// 태스크를 멈추고 끝날 때까지 기다린다. 진행 중인 재연결도 함께 취소된다.
    pub(crate) async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some((cancel, handle)) = running {
            cancel.cancel();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!("Keep-alive task failed: {}", e);
                }
            }
            debug!("Keep-alive stopped");
        }
    }
}

async fn supervise(client: BinaryLogClient, cancel: CancellationToken) {
    let interval = client.config().keep_alive_interval;
    let heartbeat = client.config().heartbeat_interval.is_some();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let lost = if heartbeat {
            client.since_last_event() > interval
        } else {
            tokio::select! {
                _ = cancel.cancelled() => return,
                result = client.ping() => match result {
                    Ok(()) => false,
                    Err(e) => {
                        debug!("Keep-alive ping failed: {}", e);
                        true
                    }
                },
            }
        };
        if !lost {
            continue;
        }

        let config = client.config();
        info!(
            "Trying to restore lost connection to {}:{}",
            config.hostname, config.port
        );
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = restore(&client) => {
                if let Err(e) = result {
                    warn!(
                        "Failed to restore connection to {}:{}. Next attempt in {:?}: {}",
                        config.hostname, config.port, interval, e
                    );
                }
            }
        }
    }
}

async fn restore(client: &BinaryLogClient) -> Result<()> {
    client.terminate_connect().await;
    client
        .connect_with_timeout(client.config().keep_alive_connect_timeout)
        .await
}

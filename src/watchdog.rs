//! 협상 워치독
//!
//! 협상이 제한 시간 안에 끝나지 않으면 채널을 강제로 닫는다.

use crate::binlog_client::BinaryLogClient;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub(crate) struct Watchdog {
    cancel: CancellationToken,
    handle: JoinHandle<bool>,
}

impl Watchdog {
    pub(crate) fn schedule(client: BinaryLogClient, timeout: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => false,
                _ = tokio::time::sleep(timeout) => {
                    warn!(
                        "Failed to establish connection in {:?}. Forcing disconnect.",
                        timeout
                    );
                    client.disconnect_channel();
                    true
                }
            }
        });
        Watchdog { cancel, handle }
    }

    /// 워치독을 멈춘다. 이미 채널을 닫았으면 true.
    pub(crate) async fn cancel(self) -> bool {
        self.cancel.cancel();
        match self.handle.await {
            Ok(fired) => fired,
            Err(e) => {
                warn!("Watchdog task failed: {}", e);
                false
            }
        }
    }
}

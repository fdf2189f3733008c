//! 이벤트 / 라이프사이클 리스너 등록과 알림
//!
//! 등록/해제는 목록 전체를 복사해서 교체하고(copy-on-write), 알림은 그 순간의
//! 스냅샷을 순회한다. 알림 중에는 락을 잡지 않으므로 리스너 안에서 등록/해제해도 된다.

use crate::error::BinlogError;
use crate::events::Event;
use parking_lot::RwLock;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// 디코딩된 이벤트를 받는 리스너. 스트림 수신 태스크에서 동기적으로 호출된다.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &Event);
}

impl<F> EventListener for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        self(event)
    }
}

/// 연결 상태 변화를 받는 리스너
pub trait LifecycleListener: Send + Sync {
    fn on_connect(&self) {}

    /// 연결된 뒤 발생한 치명적 에러. 곧이어 on_disconnect가 온다.
    fn on_communication_failure(&self, _error: &BinlogError) {}

    /// 이벤트 하나를 디코딩하지 못했다. 연결은 유지된다.
    fn on_event_deserialization_failure(&self, _error: &BinlogError) {}

    fn on_disconnect(&self) {}
}

/// 등록 해제에 쓰는 핸들
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listeners<T: ?Sized> {
    entries: RwLock<Arc<Vec<(ListenerId, Arc<T>)>>>,
}

impl<T: ?Sized> Listeners<T> {
    fn new() -> Self {
        Listeners {
            entries: RwLock::new(Arc::new(Vec::new())),
        }
    }

    fn add(&self, id: ListenerId, listener: Arc<T>) {
        let mut entries = self.entries.write();
        let mut next = Vec::with_capacity(entries.len() + 1);
        next.extend(entries.iter().cloned());
        next.push((id, listener));
        *entries = Arc::new(next);
    }

    fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write();
        if !entries.iter().any(|(existing, _)| *existing == id) {
            return false;
        }
        let next: Vec<_> = entries
            .iter()
            .filter(|(existing, _)| *existing != id)
            .cloned()
            .collect();
        *entries = Arc::new(next);
        true
    }

    fn snapshot(&self) -> Arc<Vec<(ListenerId, Arc<T>)>> {
        self.entries.read().clone()
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn guarded<F: FnOnce()>(callback: &str, f: F) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        warn!(
            "{} listener panicked: {}",
            callback,
            panic_message(payload.as_ref())
        );
    }
}

/// 리스너 레지스트리
pub struct ListenerRegistry {
    next_id: AtomicU64,
    event_listeners: Listeners<dyn EventListener>,
    lifecycle_listeners: Listeners<dyn LifecycleListener>,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        ListenerRegistry {
            next_id: AtomicU64::new(1),
            event_listeners: Listeners::new(),
            lifecycle_listeners: Listeners::new(),
        }
    }

    fn next_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn register_event_listener(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        let id = self.next_id();
        self.event_listeners.add(id, listener);
        id
    }

    pub fn unregister_event_listener(&self, id: ListenerId) -> bool {
        self.event_listeners.remove(id)
    }

    pub fn register_lifecycle_listener(&self, listener: Arc<dyn LifecycleListener>) -> ListenerId {
        let id = self.next_id();
        self.lifecycle_listeners.add(id, listener);
        id
    }

    pub fn unregister_lifecycle_listener(&self, id: ListenerId) -> bool {
        self.lifecycle_listeners.remove(id)
    }

    pub fn event_listener_count(&self) -> usize {
        self.event_listeners.len()
    }

    pub fn lifecycle_listener_count(&self) -> usize {
        self.lifecycle_listeners.len()
    }

    pub fn notify_event(&self, event: &Event) {
        for (_, listener) in self.event_listeners.snapshot().iter() {
            guarded("event", || listener.on_event(event));
        }
    }

    pub fn notify_connect(&self) {
        for (_, listener) in self.lifecycle_listeners.snapshot().iter() {
            guarded("on_connect", || listener.on_connect());
        }
    }

    pub fn notify_communication_failure(&self, error: &BinlogError) {
        for (_, listener) in self.lifecycle_listeners.snapshot().iter() {
            guarded("on_communication_failure", || {
                listener.on_communication_failure(error)
            });
        }
    }

    pub fn notify_deserialization_failure(&self, error: &BinlogError) {
        for (_, listener) in self.lifecycle_listeners.snapshot().iter() {
            guarded("on_event_deserialization_failure", || {
                listener.on_event_deserialization_failure(error)
            });
        }
    }

    pub fn notify_disconnect(&self) {
        for (_, listener) in self.lifecycle_listeners.snapshot().iter() {
            guarded("on_disconnect", || listener.on_disconnect());
        }
    }
}

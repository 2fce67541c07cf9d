// 进程内事件总线
//
// 按事件类别注册回调，emit 时同步分发给所有匹配的订阅者。
// 分发前先复制出回调列表，回调内可以安全地订阅或取消订阅。

use super::types::{EventKind, UploadEvent};
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::debug;

type Handler = Arc<dyn Fn(&UploadEvent) + Send + Sync>;

struct Subscriber {
    /// None 表示订阅全部事件
    kind: Option<EventKind>,
    handler: Handler,
}

#[derive(Default)]
struct EventBusInner {
    subscribers: DashMap<u64, Subscriber>,
    next_id: AtomicU64,
}

/// 事件总线
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 订阅指定类别的事件
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(handler))
    }

    /// 订阅全部事件
    pub fn subscribe_all<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(handler))
    }

    /// 以 channel 形式订阅，供异步消费者（WebSocket 等）使用
    pub fn subscribe_channel(
        &self,
        kind: Option<EventKind>,
    ) -> (Subscription, mpsc::UnboundedReceiver<UploadEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.register(
            kind,
            Arc::new(move |event: &UploadEvent| {
                let _ = tx.send(event.clone());
            }),
        );
        (subscription, rx)
    }

    fn register(&self, kind: Option<EventKind>, handler: Handler) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.subscribers.insert(id, Subscriber { kind, handler });
        debug!(
            "注册事件订阅: id={}, kind={}",
            id,
            kind.map(|k| k.as_str()).unwrap_or("*")
        );
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// 发布事件
    pub fn emit(&self, event: UploadEvent) {
        let kind = event.kind();
        let handlers: Vec<Handler> = self
            .inner
            .subscribers
            .iter()
            .filter(|entry| entry.kind.map_or(true, |k| k == kind))
            .map(|entry| entry.handler.clone())
            .collect();

        for handler in handlers {
            handler(&event);
        }
    }

    /// 当前订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// 移除所有订阅者
    pub fn clear(&self) {
        self.inner.subscribers.clear();
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// 订阅句柄
///
/// 调用 `unsubscribe` 取消订阅；直接丢弃句柄不会取消订阅
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    bus: Weak<EventBusInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 取消订阅，返回订阅是否仍然存在
    pub fn unsubscribe(self) -> bool {
        match self.bus.upgrade() {
            Some(inner) => inner.subscribers.remove(&self.id).is_some(),
            None => false,
        }
    }
}

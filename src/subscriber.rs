//! LISTEN/NOTIFY fan-out.
//!
//! A `PgSubscriber` multiplexes one physical `LISTEN` per topic into any
//! number of consumer streams. Consumers each hold a FIFO backlog; a
//! notification either satisfies a parked consumer or queues behind its
//! earlier payloads. The physical `LISTEN` is reference-counted: it is
//! issued for a topic's first consumer and torn down when the last one
//! detaches.
//!
//! Consumer streams back-reference the subscriber only weakly (detach hook
//! plus a weak handle list on the topic), never as a strong cycle.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};

use futures::future::BoxFuture;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::backend::{ListenErrorCallback, NotifyCallback, UnlistenHandle};
use crate::error::{PgBridgeError, PgBridgeResult};
use crate::pool::{PgPool, WeakPgPool};

// ============================================================================
// Listen sources
// ============================================================================

/// Where the subscriber gets its physical `LISTEN`s from. In production
/// this is a pool; tests inject a scripted source.
pub(crate) trait ListenSource: Send + Sync {
    fn listen(
        &self,
        channel: String,
        on_notify: NotifyCallback,
        on_error: ListenErrorCallback,
    ) -> BoxFuture<'static, PgBridgeResult<UnlistenHandle>>;
}

impl ListenSource for WeakPgPool {
    fn listen(
        &self,
        channel: String,
        on_notify: NotifyCallback,
        on_error: ListenErrorCallback,
    ) -> BoxFuture<'static, PgBridgeResult<UnlistenHandle>> {
        let weak = self.clone();
        Box::pin(async move {
            let Some(pool) = weak.upgrade() else {
                return Err(PgBridgeError::PoolReleased);
            };
            pool.listen(&channel, on_notify, on_error).await
        })
    }
}

// ============================================================================
// Consumer state
// ============================================================================

#[derive(Default)]
struct ConsumerState {
    backlog: VecDeque<String>,
    waker: Option<Waker>,
    done: bool,
}

#[derive(Default)]
struct ConsumerShared {
    state: Mutex<ConsumerState>,
}

impl ConsumerShared {
    /// Deliver one payload: satisfy the parked consumer or queue the value.
    fn push(&self, payload: &str) {
        let mut state = self.state.lock();
        if state.done {
            return;
        }
        state.backlog.push_back(payload.to_string());
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }

    /// Mark the stream finished and resolve any parked waiter with done.
    fn finish(&self) {
        let mut state = self.state.lock();
        state.done = true;
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }
}

// ============================================================================
// Subscriber
// ============================================================================

struct SubscriberInner {
    source: Arc<dyn ListenSource>,
    /// Per-topic consumer handles, in registration order. Delivery walks
    /// this list; dead handles are pruned as they are found.
    fanout: Mutex<HashMap<String, Vec<Weak<ConsumerShared>>>>,
    /// One live unlisten handle per physically-listened channel. The lock
    /// also serializes topic setup/teardown.
    registry: AsyncMutex<HashMap<String, UnlistenHandle>>,
    released: AtomicBool,
}

impl SubscriberInner {
    fn dispatch(&self, topic: &str, payload: &str) {
        let consumers: Vec<Arc<ConsumerShared>> = {
            let mut fanout = self.fanout.lock();
            match fanout.get_mut(topic) {
                Some(list) => {
                    list.retain(|weak| weak.strong_count() > 0);
                    list.iter().filter_map(Weak::upgrade).collect()
                }
                None => Vec::new(),
            }
        };
        for consumer in consumers {
            consumer.push(payload);
        }
    }

    fn topic_in_use(&self, topic: &str) -> bool {
        self.fanout
            .lock()
            .get(topic)
            .map(|list| list.iter().any(|weak| weak.strong_count() > 0))
            .unwrap_or(false)
    }
}

/// The LISTEN/NOTIFY fan-out component. Cheap to clone; all clones share
/// one set of topics and physical listens.
#[derive(Clone)]
pub struct PgSubscriber {
    inner: Arc<SubscriberInner>,
}

impl PgSubscriber {
    /// A subscriber driven by `pool`'s LISTEN capability. The subscriber
    /// does not keep the pool alive.
    pub fn new(pool: &PgPool) -> Self {
        Self::with_source(Arc::new(pool.downgrade()))
    }

    pub(crate) fn with_source(source: Arc<dyn ListenSource>) -> Self {
        Self {
            inner: Arc::new(SubscriberInner {
                source,
                fanout: Mutex::new(HashMap::new()),
                registry: AsyncMutex::new(HashMap::new()),
                released: AtomicBool::new(false),
            }),
        }
    }

    /// Open a consumer stream for `topic`. The first consumer of a topic
    /// issues the physical `LISTEN`; later ones share it.
    pub async fn subscribe(&self, topic: &str) -> PgBridgeResult<PgSubscription> {
        if self.inner.released.load(Ordering::SeqCst) {
            return Err(PgBridgeError::SubscriberReleased);
        }

        let mut registry = self.inner.registry.lock().await;
        if self.inner.released.load(Ordering::SeqCst) {
            return Err(PgBridgeError::SubscriberReleased);
        }

        let consumer = Arc::new(ConsumerShared::default());
        {
            let mut fanout = self.inner.fanout.lock();
            fanout
                .entry(topic.to_string())
                .or_default()
                .push(Arc::downgrade(&consumer));
        }

        if !registry.contains_key(topic) {
            let weak = Arc::downgrade(&self.inner);
            let notify_topic = topic.to_string();
            let on_notify: NotifyCallback = Arc::new(move |payload| {
                if let Some(inner) = weak.upgrade() {
                    inner.dispatch(&notify_topic, payload);
                }
            });
            let error_topic = topic.to_string();
            let on_error: ListenErrorCallback = Arc::new(move |error| {
                // consumers keep buffering while the backend reconnects
                tracing::error!(topic = %error_topic, error = %error, "subscriber listen error");
            });

            match self
                .inner
                .source
                .listen(topic.to_string(), on_notify, on_error)
                .await
            {
                Ok(handle) => {
                    registry.insert(topic.to_string(), handle);
                }
                Err(error) => {
                    let mut fanout = self.inner.fanout.lock();
                    if let Some(list) = fanout.get_mut(topic) {
                        list.retain(|weak| match weak.upgrade() {
                            Some(c) => !Arc::ptr_eq(&c, &consumer),
                            None => false,
                        });
                        if list.is_empty() {
                            fanout.remove(topic);
                        }
                    }
                    return Err(error);
                }
            }
        }

        Ok(PgSubscription {
            consumer,
            subscriber: Arc::downgrade(&self.inner),
            topic: topic.to_string(),
        })
    }

    /// Finish every consumer stream, issue every pending unlisten, and
    /// refuse new subscriptions from here on.
    pub async fn release(&self) {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return;
        }

        let consumers: Vec<Weak<ConsumerShared>> = {
            let mut fanout = self.inner.fanout.lock();
            fanout.drain().flat_map(|(_, list)| list).collect()
        };
        for consumer in consumers.iter().filter_map(Weak::upgrade) {
            consumer.finish();
        }

        let handles: Vec<(String, UnlistenHandle)> = {
            let mut registry = self.inner.registry.lock().await;
            registry.drain().collect()
        };
        for (_, handle) in handles {
            handle.unlisten().await;
        }
    }
}

impl std::fmt::Debug for PgSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgSubscriber")
            .field("topics", &self.inner.fanout.lock().len())
            .field("released", &self.inner.released.load(Ordering::SeqCst))
            .finish()
    }
}

// ============================================================================
// Consumer streams
// ============================================================================

/// One consumer's lazy sequence of payloads for a topic.
///
/// Dropping the stream detaches it; when a topic's last consumer detaches,
/// the physical `LISTEN` is torn down.
pub struct PgSubscription {
    consumer: Arc<ConsumerShared>,
    subscriber: Weak<SubscriberInner>,
    topic: String,
}

impl PgSubscription {
    /// The next payload, or `None` once the stream is finished.
    pub async fn next(&mut self) -> Option<String> {
        futures::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }

    /// Finish this stream and detach it, tearing down the topic's physical
    /// `LISTEN` if this was the last consumer.
    pub async fn close(self) {
        let Some(inner) = self.subscriber.upgrade() else {
            self.consumer.finish();
            return;
        };
        detach(&inner, &self.topic, &self.consumer);
        teardown_if_unused(&inner, &self.topic).await;
        // Drop runs after, but the consumer is already detached.
    }
}

impl Stream for PgSubscription {
    type Item = String;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        let mut state = self.consumer.state.lock();
        if let Some(payload) = state.backlog.pop_front() {
            return Poll::Ready(Some(payload));
        }
        if state.done {
            return Poll::Ready(None);
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for PgSubscription {
    fn drop(&mut self) {
        let Some(inner) = self.subscriber.upgrade() else {
            self.consumer.finish();
            return;
        };
        if !detach(&inner, &self.topic, &self.consumer) {
            return;
        }
        // teardown needs the async registry; hand it to the runtime when
        // one is available
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let topic = self.topic.clone();
            handle.spawn(async move {
                teardown_if_unused(&inner, &topic).await;
            });
        }
    }
}

impl std::fmt::Debug for PgSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgSubscription")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

/// Remove the consumer from its topic's list. Returns whether the topic may
/// now be unused.
fn detach(inner: &Arc<SubscriberInner>, topic: &str, consumer: &Arc<ConsumerShared>) -> bool {
    consumer.finish();
    let mut fanout = inner.fanout.lock();
    match fanout.get_mut(topic) {
        Some(list) => {
            list.retain(|weak| match weak.upgrade() {
                Some(c) => !Arc::ptr_eq(&c, consumer),
                None => false,
            });
            if list.is_empty() {
                fanout.remove(topic);
                true
            } else {
                false
            }
        }
        None => false,
    }
}

/// Tear the topic's physical `LISTEN` down unless a consumer re-registered
/// in the meantime. Serialized against `subscribe` by the registry lock.
async fn teardown_if_unused(inner: &Arc<SubscriberInner>, topic: &str) {
    let mut registry = inner.registry.lock().await;
    if inner.topic_in_use(topic) {
        return;
    }
    if let Some(handle) = registry.remove(topic) {
        handle.unlisten().await;
    }
}

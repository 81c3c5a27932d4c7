use std::{
    collections::{HashMap, VecDeque},
    convert::Infallible,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::{Duration, Instant},
};

use axum::response::sse::Event;
use metrics::{counter, gauge};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tracing::warn;

use anesth_roster_core::types::NotificationKind;
use anesth_roster_storage::{NewNotification, Notification};

use crate::router::AppState;

const EVENT_NAME: &str = "notification";
const BROADCAST_BUFFER: usize = 256;

/// In-process hub fanning notifications out to connected SSE clients.
///
/// Each recipient has an independent channel with a bounded replay ring so a
/// reconnecting client can resume from its `Last-Event-ID`. Clients that fell
/// behind the ring receive a full `sync` event instead.
#[derive(Clone)]
pub struct NotificationHub {
    channels: Arc<RwLock<HashMap<String, Arc<Channel>>>>,
    ring_max: usize,
    ring_ttl: Duration,
    counters: Arc<ClientCounters>,
}

impl NotificationHub {
    pub fn new(ring_max: usize, ring_ttl: Duration) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            ring_max,
            ring_ttl,
            counters: Arc::new(ClientCounters::new()),
        }
    }

    async fn ensure_channel(&self, recipient_id: &str) -> Arc<Channel> {
        let mut guard = self.channels.write().await;
        guard
            .entry(recipient_id.to_string())
            .or_insert_with(|| Arc::new(Channel::new()))
            .clone()
    }

    /// Publishes one event to a recipient's channel, returning its sequence.
    ///
    /// Sequences are dense per recipient so a gap seen by a resuming client
    /// always means lost events.
    pub async fn publish(
        &self,
        recipient_id: &str,
        kind: &str,
        data: &Value,
    ) -> Result<u64, PushError> {
        let channel = self.ensure_channel(recipient_id).await;
        let seq = channel.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let message = Arc::new(PushMessage::new(seq, kind, data)?);

        {
            let mut ring = channel.ring.lock().await;
            ring.push_back(message.clone());
            while ring.len() > self.ring_max {
                ring.pop_front();
            }
            while let Some(front) = ring.front() {
                if front.created_at.elapsed() > self.ring_ttl {
                    ring.pop_front();
                } else {
                    break;
                }
            }
        }
        let _ = channel.sender.send(message);

        Ok(seq)
    }

    /// Subscribes a client, replaying ring entries newer than `since`.
    pub async fn subscribe(&self, recipient_id: &str, since: Option<u64>) -> Subscription {
        let channel = self.ensure_channel(recipient_id).await;

        let ring_snapshot = {
            let ring = channel.ring.lock().await;
            ring.iter().cloned().collect::<Vec<_>>()
        };
        // A resume point older than the oldest retained entry means events
        // were lost; the caller must send a full sync instead.
        let ring_miss = ring_snapshot
            .first()
            .map(|first| since.map(|v| v + 1 < first.seq).unwrap_or(false))
            .unwrap_or(false);
        if ring_miss {
            counter!("sse_ring_miss_total").increment(1);
        }

        let backlog = if ring_miss {
            Vec::new()
        } else {
            ring_snapshot
                .into_iter()
                .filter(|msg| since.map(|v| msg.seq > v).unwrap_or(false))
                .collect()
        };

        let guard = ClientGuard::new(self.counters.clone());
        let receiver = BroadcastStream::new(channel.sender.subscribe());
        Subscription {
            backlog,
            receiver,
            guard,
            ring_miss,
        }
    }

    /// Builds a full-state `sync` event carried at the recipient's current sequence.
    pub async fn sync_message(
        &self,
        recipient_id: &str,
        unread: &[Notification],
    ) -> Result<Arc<PushMessage>, PushError> {
        let channel = self.ensure_channel(recipient_id).await;
        let seq = channel.seq.load(Ordering::SeqCst);
        let data = json!({ "unread": unread_payload(unread) });
        Ok(Arc::new(PushMessage::new(seq, "sync", &data)?))
    }
}

fn unread_payload(unread: &[Notification]) -> Vec<Value> {
    unread.iter().map(notification_payload).collect()
}

/// JSON shape of one notification pushed over the stream.
pub fn notification_payload(notification: &Notification) -> Value {
    json!({
        "id": notification.id,
        "kind": notification.kind,
        "title": notification.title,
        "body": notification.body,
        "link": notification.link,
        "read": notification.read != 0,
        "created_at": notification.created_at,
    })
}

struct Channel {
    sender: broadcast::Sender<Arc<PushMessage>>,
    ring: Mutex<VecDeque<Arc<PushMessage>>>,
    seq: AtomicU64,
}

impl Channel {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_BUFFER);
        Self {
            sender,
            ring: Mutex::new(VecDeque::new()),
            seq: AtomicU64::new(0),
        }
    }
}

pub struct Subscription {
    backlog: Vec<Arc<PushMessage>>,
    receiver: BroadcastStream<Arc<PushMessage>>,
    guard: ClientGuard,
    ring_miss: bool,
}

impl Subscription {
    pub fn ring_miss(&self) -> bool {
        self.ring_miss
    }

    pub fn into_stream(self) -> PushStream {
        self.into_stream_with_initial(Vec::new())
    }

    pub fn into_stream_with_initial(mut self, initial: Vec<Arc<PushMessage>>) -> PushStream {
        if !initial.is_empty() {
            self.backlog = initial;
        }

        let backlog_stream =
            tokio_stream::iter(self.backlog).map(|msg| Ok::<_, Infallible>(msg.to_event()));
        let live_stream = self.receiver.filter_map(|result| match result {
            Ok(msg) => Some(Ok(msg.to_event())),
            Err(_) => None,
        });

        let stream = backlog_stream.chain(live_stream);
        PushStream {
            inner: Box::pin(stream),
            _guard: self.guard,
        }
    }
}

pub struct PushStream {
    inner: Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>,
    _guard: ClientGuard,
}

impl Stream for PushStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.inner.as_mut().poll_next(cx)
    }
}

pub struct PushMessage {
    seq: u64,
    kind: String,
    data: String,
    created_at: Instant,
}

impl PushMessage {
    fn new(seq: u64, kind: &str, data: &Value) -> Result<Self, serde_json::Error> {
        let data = serde_json::to_string(&json!({ "kind": kind, "data": data }))?;
        Ok(Self {
            seq,
            kind: kind.to_string(),
            data,
            created_at: Instant::now(),
        })
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    fn to_event(&self) -> Event {
        Event::default()
            .id(self.seq.to_string())
            .event(EVENT_NAME)
            .data(self.data.clone())
    }
}

struct ClientCounters {
    connected: AtomicUsize,
}

impl ClientCounters {
    fn new() -> Self {
        Self {
            connected: AtomicUsize::new(0),
        }
    }

    fn increment(&self) {
        let value = self.connected.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!("sse_clients").set(value as f64);
    }

    fn decrement(&self) {
        let value = self.connected.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        gauge!("sse_clients").set(value as f64);
    }
}

struct ClientGuard {
    counters: Arc<ClientCounters>,
}

impl ClientGuard {
    fn new(counters: Arc<ClientCounters>) -> Self {
        counters.increment();
        Self { counters }
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.counters.decrement();
    }
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("failed to serialize push event: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Persists a notification and pushes it to the recipient, fire-and-forget.
///
/// Delivery failures are logged, never surfaced to the mutation that caused
/// them; the database write has already committed at this point.
pub async fn deliver(
    state: &AppState,
    recipient_id: &str,
    kind: NotificationKind,
    title: &str,
    body: &str,
    link: Option<&str>,
) {
    let stored = state
        .storage()
        .notifications()
        .insert(NewNotification {
            recipient_id,
            kind,
            title,
            body,
            link,
            created_at: state.now(),
        })
        .await;

    let notification = match stored {
        Ok(notification) => notification,
        Err(err) => {
            warn!(stage = "push", recipient_id, error = %err, "failed to persist notification");
            return;
        }
    };

    counter!("notifications_emitted_total", "kind" => kind.as_str()).increment(1);

    if let Err(err) = state
        .push()
        .publish(
            recipient_id,
            kind.as_str(),
            &notification_payload(&notification),
        )
        .await
    {
        warn!(stage = "push", recipient_id, error = %err, "failed to push notification event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn hub() -> NotificationHub {
        NotificationHub::new(4, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn live_subscriber_receives_published_events() {
        let hub = hub();
        let subscription = hub.subscribe("user-1", None).await;
        let mut stream = subscription.into_stream();

        hub.publish("user-1", "leave.approved", &json!({"id": "n-1"}))
            .await
            .expect("publish");

        let event = timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("event arrives")
            .expect("stream open")
            .expect("event ok");
        // Event renders with the id and payload on the wire.
        let rendered = format!("{event:?}");
        assert!(rendered.contains("leave.approved"));
    }

    #[tokio::test]
    async fn replay_skips_already_seen_events() {
        let hub = hub();
        let first = hub
            .publish("user-1", "leave.approved", &json!({"n": 1}))
            .await
            .expect("publish");
        hub.publish("user-1", "leave.rejected", &json!({"n": 2}))
            .await
            .expect("publish");

        let subscription = hub.subscribe("user-1", Some(first)).await;
        assert!(!subscription.ring_miss());
        assert_eq!(subscription.backlog.len(), 1);
        assert_eq!(subscription.backlog[0].kind(), "leave.rejected");
    }

    #[tokio::test]
    async fn falling_behind_the_ring_is_a_miss() {
        let hub = NotificationHub::new(2, Duration::from_secs(60));
        for n in 0..5 {
            hub.publish("user-1", "leave.approved", &json!({ "n": n }))
                .await
                .expect("publish");
        }

        // The ring only holds seq 4 and 5; resuming from 1 is a miss.
        let subscription = hub.subscribe("user-1", Some(1)).await;
        assert!(subscription.ring_miss());
        assert!(subscription.backlog.is_empty());
    }

    #[tokio::test]
    async fn channels_are_isolated_per_recipient() {
        let hub = hub();
        hub.publish("user-1", "leave.approved", &json!({}))
            .await
            .expect("publish");

        let subscription = hub.subscribe("user-2", Some(0)).await;
        assert!(subscription.backlog.is_empty());
        assert!(!subscription.ring_miss());
    }
}

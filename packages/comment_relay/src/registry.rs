//! One upstream session per live broadcast, shared by its subscribers.
//!
//! Locking is two-level. A short synchronous lock guards the map from
//! [`LiveId`] to slot; it is never held across an await. Each slot carries
//! an async lock that serializes create, add, remove and delete for that
//! id, so a slow login for one broadcast never blocks another. A slot that
//! has lost its session is retired and removed from the map; it is never
//! reused, so a slot's entry always belongs to the one session it opened.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use nicolive::{AuthContext, Connector, LiveId, LiveSession, PostOptions, SessionConfig};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broadcaster;
use crate::error::RelayError;
use crate::metrics::RelayMetrics;
use crate::subscriber::{DeliveryError, Subscriber, SubscriberId};

pub struct SessionRegistry {
    connector: Arc<dyn Connector>,
    session_config: SessionConfig,
    post_options: PostOptions,
    metrics: Arc<RelayMetrics>,
    slots: Mutex<HashMap<LiveId, Arc<Slot>>>,
}

#[derive(Default)]
pub(crate) struct Slot {
    state: tokio::sync::Mutex<SlotState>,
}

#[derive(Default)]
struct SlotState {
    retired: bool,
    entry: Option<Entry>,
}

struct Entry {
    session: Arc<LiveSession>,
    subscribers: HashMap<SubscriberId, Arc<dyn Subscriber>>,
    pump: JoinHandle<()>,
}

/// Status view of one live session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub live_id: String,
    pub room_label: String,
    pub subscribers: usize,
    pub watch_count: u64,
    pub comment_count: u64,
    pub state: String,
}

impl SessionRegistry {
    pub fn new(
        connector: Arc<dyn Connector>,
        session_config: SessionConfig,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            connector,
            session_config,
            post_options: PostOptions::default(),
            metrics,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Add a subscriber, opening the upstream session if there is none.
    ///
    /// `auth` is only used when a session has to be opened. Errors from
    /// opening leave no trace in the registry.
    pub async fn subscribe(
        self: &Arc<Self>,
        live_id: &LiveId,
        auth: AuthContext,
        subscriber: Arc<dyn Subscriber>,
    ) -> Result<(), RelayError> {
        loop {
            let slot = self.slot(live_id);
            let mut state = slot.state.lock().await;
            if state.retired {
                // Lost a race with teardown; the slot is on its way out of the map.
                drop(state);
                tokio::task::yield_now().await;
                continue;
            }

            if let Some(entry) = state.entry.as_mut() {
                entry.subscribers.insert(subscriber.id(), subscriber);
                debug!(
                    live_id = %live_id,
                    subscribers = entry.subscribers.len(),
                    "Subscriber joined existing session"
                );
                return Ok(());
            }

            let session = match LiveSession::open(
                live_id.clone(),
                auth,
                self.connector.as_ref(),
                self.session_config.clone(),
            )
            .await
            {
                Ok(session) => session,
                Err(e) => {
                    warn!(live_id = %live_id, "Failed to open session: {}", e);
                    state.retired = true;
                    drop(state);
                    self.remove_slot(live_id, &slot);
                    self.metrics.session_failed();
                    return Err(e.into());
                }
            };

            let Some(stream) = session.receive() else {
                // Closed between handshake and here.
                state.retired = true;
                drop(state);
                self.remove_slot(live_id, &slot);
                self.metrics.session_failed();
                return Err(nicolive::LiveError::ClosedStream.into());
            };

            let pump = broadcaster::spawn_pump(
                Arc::downgrade(self),
                slot.clone(),
                Arc::downgrade(&session),
                stream,
                self.metrics.clone(),
            );
            let mut subscribers: HashMap<SubscriberId, Arc<dyn Subscriber>> = HashMap::new();
            subscribers.insert(subscriber.id(), subscriber);
            state.entry = Some(Entry {
                session,
                subscribers,
                pump,
            });
            self.metrics.session_opened();
            info!(live_id = %live_id, "Relaying comments");
            return Ok(());
        }
    }

    /// Remove a subscriber. Returns whether it was registered.
    ///
    /// Removing the last subscriber closes the session.
    pub async fn unsubscribe(&self, live_id: &LiveId, subscriber_id: SubscriberId) -> bool {
        let Some(slot) = self.existing_slot(live_id) else {
            return false;
        };
        let mut state = slot.state.lock().await;
        let Some(entry) = state.entry.as_mut() else {
            return false;
        };
        if entry.subscribers.remove(&subscriber_id).is_none() {
            return false;
        }
        debug!(
            live_id = %live_id,
            subscribers = entry.subscribers.len(),
            "Subscriber left"
        );

        if entry.subscribers.is_empty() {
            if let Some(entry) = state.entry.take() {
                entry.session.close();
                self.metrics.session_closed();
            }
            state.retired = true;
            drop(state);
            self.remove_slot(live_id, &slot);
            info!(live_id = %live_id, "Last subscriber left, session closed");
        }
        true
    }

    /// Post `text` on behalf of a registered subscriber.
    pub async fn forward(
        &self,
        live_id: &LiveId,
        subscriber_id: SubscriberId,
        text: &str,
    ) -> Result<(), RelayError> {
        let unknown = || RelayError::UnknownSubscription {
            live_id: live_id.clone(),
            subscriber: subscriber_id,
        };

        let session = {
            let slot = self.existing_slot(live_id).ok_or_else(unknown)?;
            let state = slot.state.lock().await;
            state
                .entry
                .as_ref()
                .filter(|entry| entry.subscribers.contains_key(&subscriber_id))
                .map(|entry| entry.session.clone())
                .ok_or_else(unknown)?
        };

        match session.post(text, &self.post_options).await {
            Ok(()) => {
                self.metrics.post_accepted();
                Ok(())
            }
            Err(e) => {
                self.metrics.post_failed();
                Err(e.into())
            }
        }
    }

    pub async fn sessions(&self) -> Vec<SessionSummary> {
        let slots: Vec<Arc<Slot>> = self.lock_slots().values().cloned().collect();
        let mut summaries = Vec::new();
        for slot in slots {
            let state = slot.state.lock().await;
            if let Some(entry) = state.entry.as_ref() {
                let session = &entry.session;
                summaries.push(SessionSummary {
                    live_id: session.live_id().to_string(),
                    room_label: session.info().room_label.clone(),
                    subscribers: entry.subscribers.len(),
                    watch_count: session.watch_count(),
                    comment_count: session.comment_count(),
                    state: session.state().to_string(),
                });
            }
        }
        summaries.sort_by(|a, b| a.live_id.cmp(&b.live_id));
        summaries
    }

    pub async fn subscriber_count(&self, live_id: &LiveId) -> usize {
        let Some(slot) = self.existing_slot(live_id) else {
            return 0;
        };
        let state = slot.state.lock().await;
        state
            .entry
            .as_ref()
            .map(|entry| entry.subscribers.len())
            .unwrap_or(0)
    }

    pub async fn session(&self, live_id: &LiveId) -> Option<Arc<LiveSession>> {
        let slot = self.existing_slot(live_id)?;
        let state = slot.state.lock().await;
        state.entry.as_ref().map(|entry| entry.session.clone())
    }

    /// Close every session and wait for the pumps and heartbeats to finish.
    pub async fn shutdown(&self) {
        let slots: Vec<(LiveId, Arc<Slot>)> = self.lock_slots().drain().collect();
        let mut pumps = Vec::new();
        let mut sessions = Vec::new();
        for (live_id, slot) in slots {
            let mut state = slot.state.lock().await;
            state.retired = true;
            if let Some(entry) = state.entry.take() {
                for subscriber in entry.subscribers.values() {
                    subscriber.detach("relay shutting down");
                }
                entry.session.close();
                self.metrics.session_closed();
                pumps.push(entry.pump);
                sessions.push(entry.session);
                debug!(live_id = %live_id, "Session closed for shutdown");
            }
        }
        for pump in pumps {
            if let Err(e) = pump.await {
                warn!("Pump task failed: {}", e);
            }
        }
        for session in sessions {
            session.shutdown().await;
        }
    }

    /// Fan one payload out to the slot's subscribers.
    ///
    /// Returns `false` once there is nobody left to deliver to. Losing the
    /// last subscriber removes the entry under the same lock, so no
    /// subscriber can join a session that is about to close.
    pub(crate) async fn deliver(&self, slot: &Arc<Slot>, payload: &str) -> bool {
        let mut state = slot.state.lock().await;
        let Some(entry) = state.entry.as_mut() else {
            return false;
        };

        let mut gone = Vec::new();
        for (id, subscriber) in &entry.subscribers {
            match subscriber.deliver(payload) {
                Ok(()) => self.metrics.comment_delivered(),
                Err(DeliveryError::Full) => {
                    warn!(live_id = %entry.session.live_id(), subscriber = %id, "Subscriber queue full, dropping comment");
                    self.metrics.comment_dropped();
                }
                Err(DeliveryError::Gone) => gone.push(*id),
            }
        }
        for id in gone {
            entry.subscribers.remove(&id);
            self.metrics.subscriber_removed();
            debug!(live_id = %entry.session.live_id(), subscriber = %id, "Removed departed subscriber");
        }
        if !entry.subscribers.is_empty() {
            return true;
        }

        let live_id = entry.session.live_id().clone();
        if let Some(entry) = state.entry.take() {
            entry.session.close();
            self.metrics.session_closed();
        }
        state.retired = true;
        drop(state);
        self.remove_slot(&live_id, slot);
        info!(live_id = %live_id, "All subscribers gone, session closed");
        false
    }

    /// Remove the slot's entry after its pump stopped.
    pub(crate) async fn teardown(
        &self,
        live_id: &LiveId,
        slot: &Arc<Slot>,
        session: &Weak<LiveSession>,
        reason: &str,
    ) {
        let mut state = slot.state.lock().await;
        let owned = state
            .entry
            .as_ref()
            .is_some_and(|entry| Weak::ptr_eq(&Arc::downgrade(&entry.session), session));
        if !owned {
            return;
        }
        if let Some(entry) = state.entry.take() {
            for subscriber in entry.subscribers.values() {
                subscriber.detach(reason);
            }
            entry.session.close();
            self.metrics.session_closed();
        }
        state.retired = true;
        drop(state);
        self.remove_slot(live_id, slot);
        info!(live_id = %live_id, "Session torn down: {}", reason);
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<LiveId, Arc<Slot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, live_id: &LiveId) -> Arc<Slot> {
        self.lock_slots()
            .entry(live_id.clone())
            .or_default()
            .clone()
    }

    fn existing_slot(&self, live_id: &LiveId) -> Option<Arc<Slot>> {
        self.lock_slots().get(live_id).cloned()
    }

    fn remove_slot(&self, live_id: &LiveId, slot: &Arc<Slot>) {
        let mut slots = self.lock_slots();
        if slots.get(live_id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(live_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber::ChannelSubscriber;
    use crate::test_helpers::{Upstream, wait_until};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn lv(raw: &str) -> LiveId {
        LiveId::parse(raw).unwrap()
    }

    fn channel(capacity: usize) -> (Arc<ChannelSubscriber>, crate::subscriber::SubscriberFeed) {
        let (subscriber, feed) = ChannelSubscriber::new(capacity);
        (Arc::new(subscriber), feed)
    }

    #[tokio::test]
    async fn two_subscribers_share_one_session() {
        let upstream = Upstream::start().await;
        let registry = upstream.registry();
        let (a, _feed_a) = channel(8);
        let (b, _feed_b) = channel(8);

        registry.subscribe(&lv("lv1"), upstream.auth(), a).await.unwrap();
        registry.subscribe(&lv("lv1"), upstream.auth(), b).await.unwrap();

        assert_eq!(upstream.connector.connects(), 1);
        assert_eq!(upstream.server.connections(), 1);
        assert_eq!(registry.subscriber_count(&lv("lv1")).await, 2);
        let sessions = registry.sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].subscribers, 2);
        assert_eq!(sessions[0].room_label, "arena");
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn last_unsubscribe_closes_session() {
        let upstream = Upstream::start().await;
        let registry = upstream.registry();
        let (a, _feed_a) = channel(8);
        let (b, _feed_b) = channel(8);
        let (a_id, b_id) = (a.id(), b.id());

        registry.subscribe(&lv("lv1"), upstream.auth(), a).await.unwrap();
        registry.subscribe(&lv("lv1"), upstream.auth(), b).await.unwrap();
        let session = registry.session(&lv("lv1")).await.unwrap();

        assert!(registry.unsubscribe(&lv("lv1"), a_id).await);
        assert!(!session.is_closed());
        assert!(!registry.unsubscribe(&lv("lv1"), a_id).await);

        assert!(registry.unsubscribe(&lv("lv1"), b_id).await);
        assert!(session.is_closed());
        session.close();
        assert!(registry.sessions().await.is_empty());
        assert!(registry.session(&lv("lv1")).await.is_none());

        // a new subscriber gets a fresh session
        let (c, _feed_c) = channel(8);
        registry.subscribe(&lv("lv1"), upstream.auth(), c).await.unwrap();
        assert_eq!(upstream.connector.connects(), 2);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn comments_reach_every_subscriber_in_order() {
        let upstream = Upstream::start().await;
        let registry = upstream.registry();
        let (a, mut feed_a) = channel(8);
        let (b, mut feed_b) = channel(8);
        registry.subscribe(&lv("lv1"), upstream.auth(), a).await.unwrap();
        registry.subscribe(&lv("lv1"), upstream.auth(), b).await.unwrap();

        upstream.server.push_chat(1, "first", None);
        upstream.server.push_chat(2, "second", Some("1"));

        for feed in [&mut feed_a, &mut feed_b] {
            let first: serde_json::Value =
                serde_json::from_str(&feed.comments.recv().await.unwrap()).unwrap();
            assert_eq!(first["body"], "first");
            assert_eq!(first["no"], 1);
            assert!(first["premium"].is_null());

            let second: serde_json::Value =
                serde_json::from_str(&feed.comments.recv().await.unwrap()).unwrap();
            assert_eq!(second["body"], "second");
            assert_eq!(second["premium"], "1");
        }
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn disconnect_tears_down_without_unsubscribe() {
        let upstream = Upstream::start().await;
        let registry = upstream.registry();
        let (a, mut feed_a) = channel(8);
        let (b, feed_b) = channel(8);
        registry.subscribe(&lv("lv1"), upstream.auth(), a).await.unwrap();
        registry.subscribe(&lv("lv1"), upstream.auth(), b).await.unwrap();
        let session = registry.session(&lv("lv1")).await.unwrap();

        upstream.server.push_chat(1, "last words", None);
        upstream.server.disconnect();

        assert_eq!(feed_a.detached.await.unwrap(), "broadcast ended");
        assert_eq!(feed_b.detached.await.unwrap(), "broadcast ended");
        assert!(session.is_closed());
        assert!(registry.sessions().await.is_empty());

        // the disconnect command itself is not relayed
        let delivered = feed_a.comments.recv().await.unwrap();
        assert!(delivered.contains("last words"));
        assert!(feed_a.comments.recv().await.is_none());
    }

    #[tokio::test]
    async fn upstream_failure_tears_down() {
        let upstream = Upstream::start().await;
        let registry = upstream.registry();
        let (a, feed_a) = channel(8);
        registry.subscribe(&lv("lv1"), upstream.auth(), a).await.unwrap();

        upstream.server.drop_connections();

        let reason = feed_a.detached.await.unwrap();
        assert!(reason.starts_with("upstream error"), "{}", reason);
        assert!(registry.sessions().await.is_empty());
    }

    #[tokio::test]
    async fn login_failure_leaves_no_entry() {
        let upstream = Upstream::start().await;
        let registry = upstream.registry();
        upstream.connector.reject_logins(true);

        let (a, _feed_a) = channel(8);
        let err = registry
            .subscribe(&lv("lv1"), upstream.auth(), a)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Live(nicolive::LiveError::Login)));
        assert!(registry.sessions().await.is_empty());
        assert_eq!(registry.subscriber_count(&lv("lv1")).await, 0);
        assert_eq!(upstream.metrics.snapshot().sessions.failed, 1);

        upstream.connector.reject_logins(false);
        let (b, _feed_b) = channel(8);
        registry.subscribe(&lv("lv1"), upstream.auth(), b).await.unwrap();
        assert_eq!(registry.subscriber_count(&lv("lv1")).await, 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_first_subscribers_open_one_session() {
        let upstream = Upstream::start().await;
        upstream.connector.set_connect_delay(Duration::from_millis(100));
        let registry = upstream.registry();

        let mut tasks = tokio::task::JoinSet::new();
        let mut feeds = Vec::new();
        for _ in 0..4 {
            let (subscriber, feed) = channel(8);
            feeds.push(feed);
            let registry = registry.clone();
            let auth = upstream.auth();
            tasks.spawn(async move { registry.subscribe(&lv("lv1"), auth, subscriber).await });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }

        assert_eq!(upstream.connector.connects(), 1);
        assert_eq!(registry.subscriber_count(&lv("lv1")).await, 4);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn forward_requires_membership() {
        let upstream = Upstream::start().await;
        let registry = upstream.registry();
        let (a, _feed_a) = channel(8);
        let a_id = a.id();
        registry.subscribe(&lv("lv1"), upstream.auth(), a).await.unwrap();

        let err = registry
            .forward(&lv("lv1"), SubscriberId::new(), "intruder")
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::UnknownSubscription { .. }));
        let err = registry.forward(&lv("lv2"), a_id, "wrong room").await.unwrap_err();
        assert!(matches!(err, RelayError::UnknownSubscription { .. }));

        registry.forward(&lv("lv1"), a_id, "hello").await.unwrap();
        let posts = upstream.server.received_posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].text, "hello");
        assert_eq!(posts[0].mail, "184");
        assert_eq!(upstream.metrics.snapshot().posts.accepted, 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn rejected_forward_is_local_to_caller() {
        let upstream = Upstream::start().await;
        let registry = upstream.registry();
        let (a, _feed_a) = channel(8);
        let a_id = a.id();
        registry.subscribe(&lv("lv1"), upstream.auth(), a).await.unwrap();

        upstream.server.ack_with(Some(1));
        let err = registry.forward(&lv("lv1"), a_id, "spam").await.unwrap_err();
        assert_eq!(err.error_code(), "post_error");
        assert_eq!(registry.subscriber_count(&lv("lv1")).await, 1);
        assert_eq!(upstream.metrics.snapshot().posts.failed, 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn departed_subscribers_are_removed() {
        let upstream = Upstream::start().await;
        let registry = upstream.registry();
        let (a, feed_a) = channel(8);
        let (b, mut feed_b) = channel(8);
        registry.subscribe(&lv("lv1"), upstream.auth(), a).await.unwrap();
        registry.subscribe(&lv("lv1"), upstream.auth(), b).await.unwrap();
        let session = registry.session(&lv("lv1")).await.unwrap();

        drop(feed_a);
        upstream.server.push_chat(1, "still here?", None);
        assert!(feed_b.comments.recv().await.unwrap().contains("still here?"));
        assert_eq!(registry.subscriber_count(&lv("lv1")).await, 1);

        // losing the last one ends the session
        drop(feed_b);
        upstream.server.push_chat(2, "anyone?", None);
        wait_until(|| session.is_closed()).await;
        assert!(registry.sessions().await.is_empty());
    }

    /// Takes a while to notice it is gone, holding up delivery meanwhile.
    struct SlowToLeave {
        id: SubscriberId,
        delay: Duration,
        entered: AtomicBool,
    }

    impl Subscriber for SlowToLeave {
        fn id(&self) -> SubscriberId {
            self.id
        }

        fn deliver(&self, _payload: &str) -> Result<(), DeliveryError> {
            self.entered.store(true, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            Err(DeliveryError::Gone)
        }

        fn detach(&self, _reason: &str) {}
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn joining_while_last_subscriber_departs_gets_a_live_session() {
        let upstream = Upstream::start().await;
        let registry = upstream.registry();
        let departing = Arc::new(SlowToLeave {
            id: SubscriberId::new(),
            delay: Duration::from_millis(300),
            entered: AtomicBool::new(false),
        });
        registry
            .subscribe(&lv("lv1"), upstream.auth(), departing.clone())
            .await
            .unwrap();
        let first = registry.session(&lv("lv1")).await.unwrap();

        upstream.server.push_chat(1, "anyone?", None);
        wait_until(|| departing.entered.load(Ordering::SeqCst)).await;

        let (late, mut late_feed) = channel(8);
        registry.subscribe(&lv("lv1"), upstream.auth(), late).await.unwrap();

        assert!(first.is_closed());
        let current = registry.session(&lv("lv1")).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &current));
        assert!(!current.is_closed());
        assert_eq!(registry.subscriber_count(&lv("lv1")).await, 1);
        assert_eq!(upstream.connector.connects(), 2);

        upstream.server.push_chat(2, "welcome", None);
        assert!(late_feed.comments.recv().await.unwrap().contains("welcome"));
        assert!(late_feed.detached.try_recv().is_err());
        assert_eq!(upstream.metrics.snapshot().sessions.active, 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn full_queue_drops_comment_for_that_subscriber_only() {
        let upstream = Upstream::start().await;
        let registry = upstream.registry();
        let (slow, mut slow_feed) = channel(1);
        let (fast, mut fast_feed) = channel(8);
        registry.subscribe(&lv("lv1"), upstream.auth(), slow).await.unwrap();
        registry.subscribe(&lv("lv1"), upstream.auth(), fast).await.unwrap();

        for no in 1..=3 {
            upstream.server.push_chat(no, &format!("c{}", no), None);
        }
        for no in 1..=3 {
            let payload = fast_feed.comments.recv().await.unwrap();
            assert!(payload.contains(&format!("c{}", no)));
        }

        assert!(slow_feed.comments.recv().await.unwrap().contains("c1"));
        assert_eq!(upstream.metrics.snapshot().comments.dropped, 2);
        assert_eq!(registry.subscriber_count(&lv("lv1")).await, 2);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_detaches_everyone() {
        let upstream = Upstream::start().await;
        let registry = upstream.registry();
        let (a, feed_a) = channel(8);
        registry.subscribe(&lv("lv1"), upstream.auth(), a).await.unwrap();
        let session = registry.session(&lv("lv1")).await.unwrap();

        registry.shutdown().await;

        assert!(session.is_closed());
        assert_eq!(feed_a.detached.await.unwrap(), "relay shutting down");
        assert!(registry.sessions().await.is_empty());
        assert_eq!(upstream.metrics.snapshot().sessions.active, 0);
    }
}

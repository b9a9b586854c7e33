//! Cross-tab session synchronisation
//!
//! Every open tab keeps an in-memory [`TabView`] of the session. Tabs share a
//! client-local [`SharedChannel`]: after the server confirms a change, the tab
//! that made it writes a [`ChannelMessage`] and every other tab applies it
//! without a server round trip. A periodic [`Heartbeat`], leased so that at
//! most one tab probes per interval, catches changes made elsewhere (another
//! device, an expired session) and bounds staleness to one interval.
//!
//! Ordering rules, applied identically by the channel and by each tab:
//! a message with a newer `as_of` wins, an older one is ignored, and on a tie
//! `Reauth` beats a state blob.
//!
//! [`SyncHub`] is the server-side half: confirmed states are published there
//! for in-process subscribers.

use crate::clock::Clock;
use crate::model::{PlatformId, SessionContext, SessionTag, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// The blob tabs exchange; contains no bearer secrets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub session_tag: SessionTag,
    pub platform_id: Option<PlatformId>,
    pub as_of: DateTime<Utc>,
}

impl SyncState {
    pub fn from_context(ctx: &SessionContext, as_of: DateTime<Utc>) -> Self {
        Self {
            session_tag: ctx.session_id.tag(),
            platform_id: ctx.platform_id,
            as_of,
        }
    }

    fn same_session_state(&self, other: &SyncState) -> bool {
        self.session_tag == other.session_tag && self.platform_id == other.platform_id
    }
}

/// A confirmed server-side change, published on the [`SyncHub`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncNotice {
    pub user_id: UserId,
    pub state: SyncState,
}

/// In-process fan-out of confirmed session states
#[derive(Debug, Clone)]
pub struct SyncHub {
    sender: broadcast::Sender<SyncNotice>,
}

impl SyncHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns the number of subscribers that will see the notice
    pub fn publish(&self, notice: SyncNotice) -> usize {
        self.sender.send(notice).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotice> {
        self.sender.subscribe()
    }
}

impl Default for SyncHub {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Message written to the shared channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelMessage {
    State(SyncState),
    Reauth { as_of: DateTime<Utc> },
}

impl ChannelMessage {
    pub fn as_of(&self) -> DateTime<Utc> {
        match self {
            Self::State(state) => state.as_of,
            Self::Reauth { as_of } => *as_of,
        }
    }

    /// Whether this message replaces `current`
    pub fn supersedes(&self, current: &ChannelMessage) -> bool {
        match self.as_of().cmp(&current.as_of()) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => {
                matches!(self, Self::Reauth { .. }) && matches!(current, Self::State(_))
            }
        }
    }
}

/// What a single tab currently believes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TabView {
    /// Nothing received yet
    Pending,
    Active(SyncState),
    RequireReauth { as_of: DateTime<Utc> },
}

impl TabView {
    fn as_message(&self) -> Option<ChannelMessage> {
        match self {
            Self::Pending => None,
            Self::Active(state) => Some(ChannelMessage::State(state.clone())),
            Self::RequireReauth { as_of } => Some(ChannelMessage::Reauth { as_of: *as_of }),
        }
    }

    /// The view after receiving `message`, or `None` if it is stale
    pub fn apply(&self, message: &ChannelMessage) -> Option<TabView> {
        if let Some(current) = self.as_message() {
            if !message.supersedes(&current) {
                return None;
            }
        }

        Some(match message {
            ChannelMessage::State(state) => Self::Active(state.clone()),
            ChannelMessage::Reauth { as_of } => Self::RequireReauth { as_of: *as_of },
        })
    }
}

impl From<&ChannelMessage> for TabView {
    fn from(message: &ChannelMessage) -> Self {
        Self::Pending.apply(message).unwrap_or(Self::Pending)
    }
}

/// Client-local storage shared by every tab of one browser profile
pub trait SharedChannel: Send + Sync {
    /// Store and fan out `message` unless the stored value supersedes it
    fn write(&self, message: ChannelMessage) -> bool;

    fn latest(&self) -> Option<ChannelMessage>;

    fn subscribe(&self) -> broadcast::Receiver<ChannelMessage>;

    /// Take the heartbeat lease for this interval; `false` if another probe
    /// already ran inside it
    fn try_claim_heartbeat(&self, tab_id: Uuid, now: DateTime<Utc>, interval: Duration) -> bool;
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    holder: Uuid,
    acquired_at: DateTime<Utc>,
}

/// In-process [`SharedChannel`]
#[derive(Debug)]
pub struct LocalChannel {
    latest: Mutex<Option<ChannelMessage>>,
    lease: Mutex<Option<Lease>>,
    sender: broadcast::Sender<ChannelMessage>,
}

impl LocalChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            latest: Mutex::new(None),
            lease: Mutex::new(None),
            sender,
        }
    }

    pub fn lease_holder(&self) -> Option<Uuid> {
        self.lease
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .map(|lease| lease.holder)
    }
}

impl Default for LocalChannel {
    fn default() -> Self {
        Self::new(64)
    }
}

impl SharedChannel for LocalChannel {
    fn write(&self, message: ChannelMessage) -> bool {
        let mut latest = self
            .latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(current) = latest.as_ref() {
            if !message.supersedes(current) {
                return false;
            }
        }

        *latest = Some(message.clone());
        let _ = self.sender.send(message);
        true
    }

    fn latest(&self) -> Option<ChannelMessage> {
        self.latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelMessage> {
        self.sender.subscribe()
    }

    fn try_claim_heartbeat(&self, tab_id: Uuid, now: DateTime<Utc>, interval: Duration) -> bool {
        let mut lease = self
            .lease
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let interval = chrono::Duration::milliseconds(interval.as_millis() as i64);
        if let Some(current) = lease.as_ref() {
            if now < current.acquired_at + interval {
                return false;
            }
        }

        *lease = Some(Lease {
            holder: tab_id,
            acquired_at: now,
        });
        true
    }
}

/// One open tab
pub struct Tab {
    id: Uuid,
    channel: Arc<dyn SharedChannel>,
    view: Arc<watch::Sender<TabView>>,
    listener: JoinHandle<()>,
}

impl Tab {
    /// Open a tab, seeding its view from the channel's latest value
    pub fn open(channel: Arc<dyn SharedChannel>) -> Self {
        let initial = channel
            .latest()
            .map(|message| TabView::from(&message))
            .unwrap_or(TabView::Pending);
        let view = Arc::new(watch::channel(initial).0);

        let mut receiver = channel.subscribe();
        let listener_view = view.clone();
        let listener_channel = channel.clone();
        let id = Uuid::new_v4();

        let listener = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => apply_to(&listener_view, &message),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(tab = %id, skipped, "Tab lagged, resynchronising from channel");
                        if let Some(latest) = listener_channel.latest() {
                            apply_to(&listener_view, &latest);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Self {
            id,
            channel,
            view,
            listener,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn view(&self) -> TabView {
        self.view.borrow().clone()
    }

    /// Watch this tab's view change over time
    pub fn watch(&self) -> watch::Receiver<TabView> {
        self.view.subscribe()
    }

    /// Publish a change the server has confirmed
    pub fn confirm(&self, state: SyncState) {
        let message = ChannelMessage::State(state);
        apply_to(&self.view, &message);
        self.channel.write(message);
    }

    pub fn heartbeat(
        &self,
        probe: Arc<dyn StateProbe>,
        interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Heartbeat {
        Heartbeat {
            tab_id: self.id,
            channel: self.channel.clone(),
            probe,
            interval,
            clock,
        }
    }
}

impl Drop for Tab {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

impl std::fmt::Debug for Tab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tab")
            .field("id", &self.id)
            .field("view", &*self.view.borrow())
            .finish_non_exhaustive()
    }
}

fn apply_to(view: &watch::Sender<TabView>, message: &ChannelMessage) {
    view.send_if_modified(|current| match current.apply(message) {
        Some(next) => {
            *current = next;
            true
        }
        None => false,
    });
}

/// Body of the state-query endpoint when authenticated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub user_id: UserId,
    pub platform_id: Option<PlatformId>,
    pub session_created_at: DateTime<Utc>,
    pub session_last_activity_at: DateTime<Utc>,
    pub session_tag: SessionTag,
    pub as_of: DateTime<Utc>,
}

impl SessionSnapshot {
    pub fn from_context(ctx: &SessionContext, as_of: DateTime<Utc>) -> Self {
        Self {
            user_id: ctx.user_id,
            platform_id: ctx.platform_id,
            session_created_at: ctx.created_at,
            session_last_activity_at: ctx.last_activity_at,
            session_tag: ctx.session_id.tag(),
            as_of,
        }
    }

    pub fn to_sync_state(&self) -> SyncState {
        SyncState {
            session_tag: self.session_tag.clone(),
            platform_id: self.platform_id,
            as_of: self.as_of,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Authenticated(SessionSnapshot),
    Unauthenticated,
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Probe transport failed: {0}")]
    Transport(String),

    #[error("State endpoint answered {0}")]
    Status(u16),

    #[error("Malformed state response: {0}")]
    Decode(String),
}

/// Queries the state endpoint on behalf of the heartbeat
#[async_trait]
pub trait StateProbe: Send + Sync {
    async fn probe(&self) -> Result<ProbeOutcome, ProbeError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeatOutcome {
    /// Another tab holds the lease for this interval
    Skipped,
    Reauth,
    Updated(SyncState),
    Unchanged,
    /// Transient probe failure; nothing was written
    Failed,
}

/// Periodic reconciliation against the server
pub struct Heartbeat {
    tab_id: Uuid,
    channel: Arc<dyn SharedChannel>,
    probe: Arc<dyn StateProbe>,
    interval: Duration,
    clock: Arc<dyn Clock>,
}

impl Heartbeat {
    pub async fn beat(&self) -> BeatOutcome {
        let now = self.clock.now();
        if !self
            .channel
            .try_claim_heartbeat(self.tab_id, now, self.interval)
        {
            return BeatOutcome::Skipped;
        }

        match self.probe.probe().await {
            Err(e) => {
                warn!(tab = %self.tab_id, error = %e, "Heartbeat probe failed");
                BeatOutcome::Failed
            }
            Ok(ProbeOutcome::Unauthenticated) => {
                // Never let the reauth blob lose to a state written with a later clock
                let as_of = self
                    .channel
                    .latest()
                    .map(|latest| latest.as_of().max(now))
                    .unwrap_or(now);
                self.channel.write(ChannelMessage::Reauth { as_of });
                BeatOutcome::Reauth
            }
            Ok(ProbeOutcome::Authenticated(snapshot)) => {
                let state = snapshot.to_sync_state();
                let unchanged = matches!(
                    self.channel.latest(),
                    Some(ChannelMessage::State(ref current)) if current.same_session_state(&state)
                );

                if unchanged {
                    BeatOutcome::Unchanged
                } else {
                    self.channel.write(ChannelMessage::State(state.clone()));
                    BeatOutcome::Updated(state)
                }
            }
        }
    }

    /// Run [`beat`](Self::beat) every interval until the handle is aborted
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let outcome = self.beat().await;
                debug!(tab = %self.tab_id, ?outcome, "Heartbeat");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::SessionId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedProbe {
        outcome: Mutex<Result<ProbeOutcome, String>>,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(outcome: Result<ProbeOutcome, String>) -> Arc<Self> {
            Arc::new(Self {
                outcome: Mutex::new(outcome),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl StateProbe for ScriptedProbe {
        async fn probe(&self) -> Result<ProbeOutcome, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome
                .lock()
                .unwrap()
                .clone()
                .map_err(ProbeError::Transport)
        }
    }

    fn state(tag: &SessionTag, platform: i64, as_of: DateTime<Utc>) -> SyncState {
        SyncState {
            session_tag: tag.clone(),
            platform_id: Some(PlatformId(platform)),
            as_of,
        }
    }

    async fn settle(tab: &Tab, expected: &TabView) {
        let mut rx = tab.watch();
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|v| v == expected))
            .await
            .expect("tab did not converge")
            .unwrap();
    }

    #[tokio::test]
    async fn test_confirmed_change_reaches_every_tab() {
        let channel: Arc<dyn SharedChannel> = Arc::new(LocalChannel::default());
        let a = Tab::open(channel.clone());
        let b = Tab::open(channel.clone());
        let tag = SessionId::generate().tag();

        let switched = state(&tag, 9, Utc::now());
        a.confirm(switched.clone());

        assert_eq!(a.view(), TabView::Active(switched.clone()));
        settle(&b, &TabView::Active(switched)).await;
    }

    #[tokio::test]
    async fn test_older_blob_is_ignored() {
        let channel = LocalChannel::default();
        let tag = SessionId::generate().tag();
        let now = Utc::now();

        assert!(channel.write(ChannelMessage::State(state(&tag, 9, now))));
        assert!(!channel.write(ChannelMessage::State(state(
            &tag,
            7,
            now - chrono::Duration::seconds(1)
        ))));

        let view = TabView::Active(state(&tag, 9, now));
        assert_eq!(
            view.apply(&ChannelMessage::State(state(&tag, 7, now - chrono::Duration::seconds(1)))),
            None
        );
    }

    #[test]
    fn test_reauth_wins_ties() {
        let tag = SessionId::generate().tag();
        let now = Utc::now();
        let view = TabView::Active(state(&tag, 9, now));

        assert_eq!(
            view.apply(&ChannelMessage::Reauth { as_of: now }),
            Some(TabView::RequireReauth { as_of: now })
        );
        assert_eq!(
            TabView::RequireReauth { as_of: now }.apply(&ChannelMessage::State(state(&tag, 9, now))),
            None
        );
    }

    #[tokio::test]
    async fn test_only_one_tab_probes_per_interval() {
        let channel: Arc<dyn SharedChannel> = Arc::new(LocalChannel::default());
        let clock = Arc::new(ManualClock::default());
        let probe = ScriptedProbe::new(Ok(ProbeOutcome::Unauthenticated));
        let interval = Duration::from_secs(5);

        let a = Tab::open(channel.clone());
        let b = Tab::open(channel.clone());
        let hb_a = a.heartbeat(probe.clone(), interval, clock.clone());
        let hb_b = b.heartbeat(probe.clone(), interval, clock.clone());

        assert_eq!(hb_a.beat().await, BeatOutcome::Reauth);
        assert_eq!(hb_b.beat().await, BeatOutcome::Skipped);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);

        clock.advance(chrono::Duration::seconds(5));
        assert_eq!(hb_b.beat().await, BeatOutcome::Reauth);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unauthenticated_probe_converges_all_tabs() {
        let channel: Arc<dyn SharedChannel> = Arc::new(LocalChannel::default());
        let clock = Arc::new(ManualClock::default());
        let tag = SessionId::generate().tag();

        let a = Tab::open(channel.clone());
        let b = Tab::open(channel.clone());
        a.confirm(state(&tag, 7, clock.now()));

        let probe = ScriptedProbe::new(Ok(ProbeOutcome::Unauthenticated));
        clock.advance(chrono::Duration::seconds(1));
        let hb = b.heartbeat(probe, Duration::from_secs(5), clock.clone());
        assert_eq!(hb.beat().await, BeatOutcome::Reauth);

        let expected = TabView::RequireReauth { as_of: clock.now() };
        settle(&a, &expected).await;
        settle(&b, &expected).await;
    }

    #[tokio::test]
    async fn test_transient_probe_failure_changes_nothing() {
        let channel: Arc<dyn SharedChannel> = Arc::new(LocalChannel::default());
        let clock = Arc::new(ManualClock::default());
        let tag = SessionId::generate().tag();

        let tab = Tab::open(channel.clone());
        let confirmed = state(&tag, 7, clock.now());
        tab.confirm(confirmed.clone());

        let probe = ScriptedProbe::new(Err("connection reset".to_string()));
        let hb = tab.heartbeat(probe, Duration::from_secs(5), clock.clone());

        assert_eq!(hb.beat().await, BeatOutcome::Failed);
        assert_eq!(channel.latest(), Some(ChannelMessage::State(confirmed.clone())));
        assert_eq!(tab.view(), TabView::Active(confirmed));
    }

    #[tokio::test]
    async fn test_heartbeat_repairs_platform_mismatch() {
        let channel: Arc<dyn SharedChannel> = Arc::new(LocalChannel::default());
        let clock = Arc::new(ManualClock::default());
        let tag = SessionId::generate().tag();

        let tab = Tab::open(channel.clone());
        tab.confirm(state(&tag, 7, clock.now()));

        clock.advance(chrono::Duration::seconds(1));
        let snapshot = SessionSnapshot {
            user_id: UserId(42),
            platform_id: Some(PlatformId(9)),
            session_created_at: clock.now(),
            session_last_activity_at: clock.now(),
            session_tag: tag.clone(),
            as_of: clock.now(),
        };
        let probe = ScriptedProbe::new(Ok(ProbeOutcome::Authenticated(snapshot.clone())));
        let hb = tab.heartbeat(probe, Duration::from_secs(5), clock.clone());

        let expected = snapshot.to_sync_state();
        assert_eq!(hb.beat().await, BeatOutcome::Updated(expected.clone()));
        settle(&tab, &TabView::Active(expected)).await;

        clock.advance(chrono::Duration::seconds(5));
        assert_eq!(hb.beat().await, BeatOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_lagging_tab_resynchronises_from_latest() {
        let channel: Arc<dyn SharedChannel> = Arc::new(LocalChannel::new(2));
        let tab = Tab::open(channel.clone());
        let tag = SessionId::generate().tag();
        let start = Utc::now();

        let mut last = None;
        for i in 0..32 {
            let s = state(&tag, i, start + chrono::Duration::milliseconds(i));
            channel.write(ChannelMessage::State(s.clone()));
            last = Some(s);
        }

        settle(&tab, &TabView::Active(last.unwrap())).await;
    }

    #[test]
    fn test_channel_message_wire_shape() {
        let as_of = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let json = serde_json::to_value(ChannelMessage::Reauth { as_of }).unwrap();
        assert_eq!(json["kind"], "reauth");

        let tag = SessionTag::from("0123456789abcdef".to_string());
        let json = serde_json::to_value(ChannelMessage::State(state(&tag, 7, as_of))).unwrap();
        assert_eq!(json["kind"], "state");
        assert_eq!(json["session_tag"], "0123456789abcdef");
        assert_eq!(json["platform_id"], 7);
    }

    #[test]
    fn test_hub_reports_subscriber_count() {
        let hub = SyncHub::new(8);
        let tag = SessionTag::from("0123456789abcdef".to_string());
        let notice = SyncNotice {
            user_id: UserId(42),
            state: state(&tag, 7, Utc::now()),
        };

        assert_eq!(hub.publish(notice.clone()), 0);
        let mut rx = hub.subscribe();
        assert_eq!(hub.publish(notice.clone()), 1);
        assert_eq!(rx.try_recv().unwrap(), notice);
    }
}

//! Heartbeat and rate-limit scheduler.
//!
//! A single one-second tick shared by every connection registered with a
//! [`Scheduler`] handle. Each tick refreshes the shared clock, resets the
//! per-connection byte/frame rate windows, wakes throttled readers, and
//! walks the heartbeat expiry index: idle connections get pinged, and
//! connections with too many unanswered pings are closed.
//!
//! The tick task starts with the first registered connection and exits
//! after the last one deregisters. The handle is cheap to clone; state is
//! mutex-protected so parallel runtimes are safe.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::connection::connection::ConnectionInner;
use crate::message::close_code;

const TICK_PERIOD: Duration = Duration::from_secs(1);

/// Shared heartbeat/rate scheduler handle.
///
/// Create one per runtime and pass it to every
/// [`Connection::establish`](crate::Connection::establish) call.
#[derive(Clone, Default)]
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
}

#[derive(Default)]
struct SchedulerShared {
    state: Mutex<SchedulerState>,
    /// Signaled once per tick; throttled readers wait on it.
    tick: Notify,
}

struct SchedulerState {
    next_id: u64,
    connections: HashMap<u64, Weak<ConnectionInner>>,
    /// Heartbeat entries in insertion order. Because an entry is removed
    /// and re-inserted whenever its connection reads data, insertion order
    /// is expiry order and the oldest entry sits at the front.
    queue: VecDeque<HeartbeatEntry>,
    /// Current (seq, expiry) per connection; queue entries with a stale
    /// seq are skipped during the walk.
    index: HashMap<u64, HeartbeatSlot>,
    next_seq: u64,
    ticking: bool,
    now: Instant,
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self {
            next_id: 0,
            connections: HashMap::new(),
            queue: VecDeque::new(),
            index: HashMap::new(),
            next_seq: 0,
            ticking: false,
            now: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct HeartbeatEntry {
    id: u64,
    seq: u64,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct HeartbeatSlot {
    seq: u64,
    expires_at: Instant,
}

impl Scheduler {
    /// Create a new scheduler. The tick task is started lazily.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of currently registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.shared.state.lock().unwrap().connections.len()
    }

    pub(crate) fn allocate_id(&self) -> u64 {
        let mut st = self.shared.state.lock().unwrap();
        st.next_id += 1;
        st.next_id
    }

    /// Register a connection and start the tick task if it is not running.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn attach(&self, conn: &Arc<ConnectionInner>) {
        let spawn_tick = {
            let mut st = self.shared.state.lock().unwrap();
            let id = conn.id();
            st.connections.insert(id, Arc::downgrade(conn));
            if conn.heartbeat_enabled() {
                let expires_at = Instant::now() + conn.heartbeat_period();
                insert_heartbeat(&mut st, id, expires_at);
            }
            let spawn = !st.ticking;
            st.ticking = true;
            spawn
        };

        if spawn_tick {
            debug!("scheduler tick task starting");
            let shared = Arc::clone(&self.shared);
            tokio::spawn(run_ticks(shared));
        }
    }

    /// Remove a connection. The tick task notices an empty registry on its
    /// next tick and exits.
    pub(crate) fn detach(&self, id: u64) {
        let mut st = self.shared.state.lock().unwrap();
        st.connections.remove(&id);
        st.index.remove(&id);
    }

    /// Push a connection's heartbeat expiry out after read activity.
    pub(crate) fn refresh_heartbeat(&self, id: u64, period: Duration) {
        let mut st = self.shared.state.lock().unwrap();
        if st.connections.contains_key(&id) {
            let expires_at = Instant::now() + period;
            insert_heartbeat(&mut st, id, expires_at);
        }
    }

    /// Suspend until the next tick. Used by throttled readers.
    pub(crate) async fn wait_tick(&self) {
        self.shared.tick.notified().await;
    }
}

fn insert_heartbeat(st: &mut SchedulerState, id: u64, expires_at: Instant) {
    st.next_seq += 1;
    let seq = st.next_seq;
    st.index.insert(id, HeartbeatSlot { seq, expires_at });
    st.queue.push_back(HeartbeatEntry {
        id,
        seq,
        expires_at,
    });
}

async fn run_ticks(shared: Arc<SchedulerShared>) {
    let mut ticker = tokio::time::interval(TICK_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // interval's first tick completes immediately; the real cadence
    // starts one period later.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let due = {
            let mut st = shared.state.lock().unwrap();
            st.now = Instant::now();

            // Reset rate windows; prune connections that are gone.
            let mut dead = Vec::new();
            for (&id, weak) in &st.connections {
                match weak.upgrade() {
                    Some(conn) => conn.reset_rate_window(),
                    None => dead.push(id),
                }
            }
            for id in dead {
                st.connections.remove(&id);
                st.index.remove(&id);
            }

            let due = collect_expired(&mut st);

            if st.connections.is_empty() {
                st.ticking = false;
                drop(st);
                shared.tick.notify_waiters();
                debug!("scheduler tick task stopping: no connections");
                return;
            }
            due
        };

        // Budget windows are fresh; let throttled readers resume.
        shared.tick.notify_waiters();

        for conn in due {
            let unanswered = conn.unanswered_pings();
            if unanswered > conn.queued_ping_limit() {
                debug!(
                    id = conn.id(),
                    unanswered, "heartbeat limit exceeded, closing"
                );
                tokio::spawn(async move {
                    let _ = conn
                        .close(
                            close_code::POLICY_VIOLATION,
                            "Exceeded unanswered PING limit",
                        )
                        .await;
                });
            } else {
                trace!(id = conn.id(), "heartbeat ping");
                // Spawned so a connection with a stalled writer cannot
                // hold up the tick for everyone else.
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    let id = conn.id();
                    let period = conn.heartbeat_period();
                    if conn.ping().await.is_ok() {
                        let mut st = shared.state.lock().unwrap();
                        if st.connections.contains_key(&id) {
                            let expires_at = Instant::now() + period;
                            insert_heartbeat(&mut st, id, expires_at);
                        }
                    }
                });
            }
        }
    }
}

/// Pop every expired heartbeat entry, oldest first, stopping at the first
/// live entry whose expiry is still in the future.
fn collect_expired(st: &mut SchedulerState) -> Vec<Arc<ConnectionInner>> {
    let mut due = Vec::new();
    while let Some(front) = st.queue.front().copied() {
        match st.index.get(&front.id) {
            // Superseded or deregistered entry.
            None => {
                st.queue.pop_front();
            }
            Some(slot) if slot.seq != front.seq => {
                st.queue.pop_front();
            }
            Some(slot) if slot.expires_at > st.now => break,
            Some(_) => {
                st.queue.pop_front();
                st.index.remove(&front.id);
                if let Some(conn) = st.connections.get(&front.id).and_then(Weak::upgrade) {
                    due.push(conn);
                }
            }
        }
    }
    due
}

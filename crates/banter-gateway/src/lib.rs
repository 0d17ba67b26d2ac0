pub mod dispatcher;
pub mod metrics;
pub mod session;

pub use dispatcher::{Dispatcher, Outbound};
pub use metrics::{GaugeSnapshot, Metrics};
pub use session::{ActiveSession, Admission, Rejection, SessionIndex};

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::Sender;

use banter_crypto::RsaIdentity;
use banter_db::Database;
use banter_types::ServerPayload;

/// Transport timing knobs, all overridable from the environment.
#[derive(Debug, Clone)]
pub struct Tuning {
    pub idle_timeout: Duration,
    pub rto_base: Duration,
    pub rto_max: Duration,
    pub max_attempts: u32,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(600),
            rto_base: Duration::from_secs(1),
            rto_max: Duration::from_secs(8),
            max_attempts: 5,
        }
    }
}

/// All shared server state, constructed once at startup and passed
/// explicitly — no globals. Cross-entity references are database ids, so
/// the in-memory side holds no object graphs.
pub struct Gateway {
    pub db: Arc<Database>,
    pub identity: Arc<RsaIdentity>,
    pub sessions: SessionIndex,
    pub dispatcher: Dispatcher,
    pub metrics: Arc<Metrics>,
    pub tuning: Tuning,
}

impl Gateway {
    pub fn new(
        db: Arc<Database>,
        identity: Arc<RsaIdentity>,
        tuning: Tuning,
        transmit: Sender<Outbound>,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());
        let dispatcher = Dispatcher::new(
            transmit,
            metrics.clone(),
            tuning.rto_base,
            tuning.rto_max,
            tuning.max_attempts,
        );
        Self {
            db,
            identity,
            sessions: SessionIndex::new(),
            dispatcher,
            metrics,
            tuning,
        }
    }

    /// Fan a payload out to every live session of every member of a room,
    /// one reliable enqueue per target. Returns the number of enqueues.
    pub fn broadcast_to_room(&self, room_db_id: i64, payload: &ServerPayload) -> Result<usize> {
        let member_ids = self.db.member_user_ids(room_db_id)?;
        let targets = self.sessions.sessions_for_users(&member_ids);
        let mut delivered = 0;
        for target in &targets {
            if self.dispatcher.enqueue(target, payload.clone()).is_ok() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Counters plus point-in-time gauges in Prometheus text format.
    pub fn render_metrics(&self) -> String {
        let gauges = GaugeSnapshot {
            active_sessions: self.sessions.len() as u64,
            authenticated_sessions: self.sessions.authenticated_len() as u64,
            retry_queue_depth: self.dispatcher.queue_depth() as u64,
            rooms: self.db.count_rooms().unwrap_or(0) as u64,
            members: self.db.count_members().unwrap_or(0) as u64,
        };
        self.metrics.render(&gauges)
    }
}

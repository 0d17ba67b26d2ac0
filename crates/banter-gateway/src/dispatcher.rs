//! Reliable delivery over the unreliable datagram transport.
//!
//! Every user-visible outbound payload gets a fresh `msg_id`, is sealed
//! once, transmitted, and kept in a retry queue until the peer's
//! `ACK{msg_id}` arrives or the attempt budget runs out. The sealed frame
//! bytes are retransmitted verbatim; clients deduplicate by `msg_id`.
//! `ACK` and `STATUS` replies bypass the queue entirely.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use crossbeam_channel::Sender;
use tracing::{trace, warn};

use banter_crypto::{outbound_nonce, random_id, seal, SESSION_KEY_LEN};
use banter_types::{Envelope, ServerFrame, ServerPayload, MAX_FRAME_BYTES};

use crate::metrics::Metrics;
use crate::session::ActiveSession;

/// One datagram handed to the writer task.
pub type Outbound = (SocketAddr, Vec<u8>);

/// Retry queue key: the target session and the delivery id.
type PendingKey = (String, String);

struct PendingFrame {
    addr: SocketAddr,
    frame: Vec<u8>,
    attempts: u32,
    rto: Duration,
    deadline: Instant,
}

#[derive(Default)]
struct RetryState {
    pending: HashMap<PendingKey, PendingFrame>,
    // Deadline-ordered with lazy deletion: entries whose record was ACKed
    // or rescheduled are skipped when popped.
    deadlines: BinaryHeap<Reverse<(Instant, PendingKey)>>,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    transmit: Sender<Outbound>,
    state: Mutex<RetryState>,
    metrics: Arc<Metrics>,
    rto_base: Duration,
    rto_max: Duration,
    max_attempts: u32,
}

impl Dispatcher {
    pub fn new(
        transmit: Sender<Outbound>,
        metrics: Arc<Metrics>,
        rto_base: Duration,
        rto_max: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                transmit,
                state: Mutex::new(RetryState::default()),
                metrics,
                rto_base,
                rto_max,
                max_attempts,
            }),
        }
    }

    /// Put raw frame bytes on the wire. The single choke point: enforces the
    /// datagram cap and counts outbound traffic.
    pub fn transmit_frame(&self, addr: SocketAddr, frame: Vec<u8>) -> bool {
        if frame.len() > MAX_FRAME_BYTES {
            self.inner.metrics.oversize_drops.fetch_add(1, Ordering::Relaxed);
            warn!(len = frame.len(), %addr, "dropping oversize frame");
            return false;
        }
        self.inner.metrics.frames_out.fetch_add(1, Ordering::Relaxed);
        self.inner
            .metrics
            .bytes_out
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        self.inner.transmit.send((addr, frame)).is_ok()
    }

    /// Send an immediate (unreliable) reply: no `msg_id`, no retry record.
    pub fn send_direct(&self, session: &ActiveSession, payload: ServerPayload) -> Result<()> {
        let frame = seal_frame(&session.session_id, &session.key, &Envelope::new(payload))?;
        self.transmit_frame(session.addr, frame);
        Ok(())
    }

    /// Reliable enqueue: assign a `msg_id`, seal, transmit, and track until
    /// acknowledged. Returns the assigned id.
    pub fn enqueue(&self, session: &ActiveSession, payload: ServerPayload) -> Result<String> {
        let msg_id = random_id();
        let envelope = Envelope::with_msg_id(payload, msg_id.clone());
        let frame = seal_frame(&session.session_id, &session.key, &envelope)?;
        if frame.len() > MAX_FRAME_BYTES {
            self.inner.metrics.oversize_drops.fetch_add(1, Ordering::Relaxed);
            bail!("frame exceeds {} byte cap", MAX_FRAME_BYTES);
        }

        let key = (session.session_id.clone(), msg_id.clone());
        let deadline = Instant::now() + self.inner.rto_base;
        {
            let mut state = self.inner.state.lock().expect("retry state poisoned");
            state.pending.insert(
                key.clone(),
                PendingFrame {
                    addr: session.addr,
                    frame: frame.clone(),
                    attempts: 1,
                    rto: self.inner.rto_base,
                    deadline,
                },
            );
            state.deadlines.push(Reverse((deadline, key)));
        }

        if !self.transmit_frame(session.addr, frame) {
            let mut state = self.inner.state.lock().expect("retry state poisoned");
            state
                .pending
                .remove(&(session.session_id.clone(), msg_id.clone()));
            bail!("transmit channel closed");
        }
        trace!(session_id = %session.session_id, %msg_id, "reliable enqueue");
        Ok(msg_id)
    }

    /// Retire a retry record after the peer acknowledged it. Duplicate or
    /// unknown ACKs are ignored.
    pub fn acknowledge(&self, session_id: &str, msg_id: &str) {
        let removed = {
            let mut state = self.inner.state.lock().expect("retry state poisoned");
            state
                .pending
                .remove(&(session_id.to_string(), msg_id.to_string()))
                .is_some()
        };
        if removed {
            self.inner.metrics.acks_received.fetch_add(1, Ordering::Relaxed);
            trace!(session_id, msg_id, "delivery acknowledged");
        }
    }

    /// Drop all pending deliveries for a session (expiry, merge).
    pub fn purge_session(&self, session_id: &str) {
        let mut state = self.inner.state.lock().expect("retry state poisoned");
        state.pending.retain(|(sid, _), _| sid != session_id);
    }

    pub fn queue_depth(&self) -> usize {
        self.inner
            .state
            .lock()
            .expect("retry state poisoned")
            .pending
            .len()
    }

    /// Retry loop body; runs on its own thread until `shutdown`. Sleeps to
    /// the nearest deadline, capped so shutdown is observed promptly.
    pub fn run_retry_loop(&self, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::Relaxed) {
            let sleep_for = self.fire_due();
            std::thread::sleep(sleep_for);
        }
    }

    /// Retransmit everything past deadline; returns how long to sleep until
    /// the next one.
    fn fire_due(&self) -> Duration {
        let now = Instant::now();
        let mut sends: Vec<Outbound> = Vec::new();
        let mut retransmissions = 0u64;
        let sleep_for;

        {
            let mut guard = self.inner.state.lock().expect("retry state poisoned");
            let state = &mut *guard;

            let mut due: Vec<PendingKey> = Vec::new();
            loop {
                let fired = match state.deadlines.peek() {
                    Some(Reverse((deadline, _))) => *deadline <= now,
                    None => false,
                };
                if !fired {
                    break;
                }
                let Reverse((_, key)) = state.deadlines.pop().expect("peeked entry");
                due.push(key);
            }

            for key in due {
                let Some(record) = state.pending.get_mut(&key) else {
                    continue; // already acknowledged
                };
                if record.deadline > now {
                    // Stale heap entry from a reschedule; put the live one back.
                    let deadline = record.deadline;
                    state.deadlines.push(Reverse((deadline, key)));
                    continue;
                }
                if record.attempts >= self.inner.max_attempts {
                    warn!(
                        session_id = %key.0,
                        msg_id = %key.1,
                        attempts = record.attempts,
                        "delivery exhausted, peer degraded"
                    );
                    state.pending.remove(&key);
                    self.inner
                        .metrics
                        .delivery_exhausted
                        .fetch_add(1, Ordering::Relaxed);
                    continue;
                }

                record.attempts += 1;
                record.rto = next_rto(record.rto, self.inner.rto_max);
                record.deadline = now + record.rto;
                sends.push((record.addr, record.frame.clone()));
                retransmissions += 1;
                let deadline = record.deadline;
                state.deadlines.push(Reverse((deadline, key)));
            }

            sleep_for = state
                .deadlines
                .peek()
                .map(|Reverse((deadline, _))| deadline.saturating_duration_since(now))
                .unwrap_or(Duration::from_millis(200))
                .min(Duration::from_millis(200));
        }

        if retransmissions > 0 {
            self.inner
                .metrics
                .retransmissions
                .fetch_add(retransmissions, Ordering::Relaxed);
        }
        for (addr, frame) in sends {
            self.transmit_frame(addr, frame);
        }

        sleep_for
    }
}

/// Geometric backoff: double, capped.
fn next_rto(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

/// Serialize and seal an envelope into a complete `SECURE_MSG` frame.
pub fn seal_frame(
    session_id: &str,
    key: &[u8; SESSION_KEY_LEN],
    envelope: &Envelope<ServerPayload>,
) -> Result<Vec<u8>> {
    let plaintext = serde_json::to_vec(envelope)?;
    let nonce = outbound_nonce();
    let sealed = seal(key, &nonce, &plaintext)?;
    let frame = ServerFrame::SecureMsg {
        session_id: session_id.to_string(),
        nonce: hex::encode(nonce),
        ciphertext: hex::encode(sealed),
    };
    Ok(serde_json::to_vec(&frame)?)
}

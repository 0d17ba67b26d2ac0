//! The datagram engine: plain OS threads over a std UDP socket, joined by
//! bounded channels.
//!
//! ```text
//! [Receive] --shard by session--> [Worker xN] --payloads--> [Dispatcher]
//! recv_from()                      router.handle()               |
//! parse + admission                DB + chat state               v
//!                                                           [Writer]
//! [Retry] ---- retransmits ---------------------------------> send_to()
//! [Sweeper] -- idle session expiry
//! [AI]      -- bounded generation queue
//! ```
//!
//! The receive thread performs the full admission pipeline (lookup, nonce,
//! decrypt, parse) sequentially, then routes each envelope to the worker
//! owning that session's shard — per-session FIFO is preserved while
//! distinct sessions proceed in parallel.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use banter_api::{AiBackend, AiBridge, Router};
use banter_crypto::RsaIdentity;
use banter_db::Database;
use banter_gateway::{ActiveSession, Admission, Gateway, Outbound, Rejection};
use banter_types::{ClientFrame, ClientPayload, Envelope};

use crate::config::Config;

/// Socket read timeout; bounds how long shutdown takes to observe.
const RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// Idle-session sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Depth of each worker shard's inbound queue.
const WORKER_QUEUE_DEPTH: usize = 256;

/// Depth of the writer's transmit queue.
const TRANSMIT_QUEUE_DEPTH: usize = 1024;

struct Job {
    session: ActiveSession,
    envelope: Envelope<ClientPayload>,
}

pub struct Engine {
    pub gateway: Arc<Gateway>,
    router: Arc<Router>,
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    ai_thread: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl Engine {
    pub fn start(
        config: &Config,
        db: Arc<Database>,
        identity: Arc<RsaIdentity>,
        ai_backend: AiBackend,
    ) -> Result<Engine> {
        let socket = UdpSocket::bind(config.bind_addr)
            .with_context(|| format!("cannot bind {}", config.bind_addr))?;
        socket
            .set_read_timeout(Some(RECV_TIMEOUT))
            .context("cannot set socket timeout")?;
        let local_addr = socket.local_addr()?;

        let (transmit_tx, transmit_rx) = bounded::<Outbound>(TRANSMIT_QUEUE_DEPTH);
        let gateway = Arc::new(Gateway::new(db, identity, config.tuning(), transmit_tx));

        let (bridge, ai_thread) = if ai_backend.is_disabled() {
            (AiBridge::disabled(), None)
        } else {
            let (bridge, handle) =
                AiBridge::start(gateway.clone(), ai_backend, config.ai.context_messages);
            (bridge, Some(handle))
        };
        let router = Arc::new(Router::new(gateway.clone(), bridge));

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::new();

        // Worker shards.
        let workers = config.worker_threads.max(1);
        let mut worker_txs: Vec<Sender<Job>> = Vec::with_capacity(workers);
        for i in 0..workers {
            let (tx, rx) = bounded::<Job>(WORKER_QUEUE_DEPTH);
            worker_txs.push(tx);
            let router = router.clone();
            let shutdown = shutdown.clone();
            threads.push(spawn_named(format!("banter-worker-{}", i), move || {
                worker_loop(router, rx, shutdown)
            })?);
        }

        // Writer: single owner of outbound socket sends.
        {
            let socket = socket.try_clone().context("cannot clone socket")?;
            let shutdown = shutdown.clone();
            threads.push(spawn_named("banter-writer".to_string(), move || {
                writer_loop(socket, transmit_rx, shutdown)
            })?);
        }

        // Retry: retransmit until ACK or exhaustion.
        {
            let dispatcher = gateway.dispatcher.clone();
            let shutdown = shutdown.clone();
            threads.push(spawn_named("banter-retry".to_string(), move || {
                dispatcher.run_retry_loop(&shutdown)
            })?);
        }

        // Sweeper: idle-session expiry.
        {
            let gateway = gateway.clone();
            let shutdown = shutdown.clone();
            threads.push(spawn_named("banter-sweeper".to_string(), move || {
                sweeper_loop(gateway, shutdown)
            })?);
        }

        // Receive: owns the socket read side.
        {
            let gateway = gateway.clone();
            let shutdown = shutdown.clone();
            threads.push(spawn_named("banter-recv".to_string(), move || {
                receive_loop(socket, gateway, worker_txs, shutdown)
            })?);
        }

        info!(%local_addr, workers, "engine started");
        Ok(Engine {
            gateway,
            router,
            shutdown,
            threads,
            ai_thread,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, drain in-flight work, join every thread.
    pub fn shutdown(self) {
        let Engine {
            gateway,
            router,
            shutdown,
            threads,
            ai_thread,
            ..
        } = self;

        shutdown.store(true, Ordering::Relaxed);
        for handle in threads {
            let _ = handle.join();
        }
        // Dropping the router drops the AI bridge handle; the worker exits
        // once the queue disconnects.
        drop(router);
        drop(gateway);
        if let Some(handle) = ai_thread {
            let _ = handle.join();
        }
        info!("engine stopped");
    }
}

fn spawn_named<F>(name: String, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name)
        .spawn(f)
        .context("failed to spawn engine thread")
}

fn receive_loop(
    socket: UdpSocket,
    gateway: Arc<Gateway>,
    workers: Vec<Sender<Job>>,
    shutdown: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; 64 * 1024];
    while !shutdown.load(Ordering::Relaxed) {
        let (len, addr) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                error!(error = %e, "socket receive failed");
                continue;
            }
        };
        gateway
            .metrics
            .bytes_in
            .fetch_add(len as u64, Ordering::Relaxed);
        if len > banter_types::MAX_FRAME_BYTES {
            gateway.metrics.oversize_drops.fetch_add(1, Ordering::Relaxed);
            debug!(%addr, len, "oversize datagram dropped");
            continue;
        }

        let frame: ClientFrame = match serde_json::from_slice(&buf[..len]) {
            Ok(frame) => frame,
            Err(e) => {
                gateway
                    .metrics
                    .protocol_errors
                    .fetch_add(1, Ordering::Relaxed);
                debug!(%addr, error = %e, "unparseable datagram dropped");
                continue;
            }
        };

        match frame {
            ClientFrame::SessionInit { client_key } => {
                gateway
                    .metrics
                    .handshake_frames_in
                    .fetch_add(1, Ordering::Relaxed);
                match gateway.handle_session_init(&client_key, addr) {
                    Ok(reply) => match serde_json::to_vec(&reply) {
                        Ok(bytes) => {
                            gateway.dispatcher.transmit_frame(addr, bytes);
                        }
                        Err(e) => error!(error = %e, "handshake reply serialization failed"),
                    },
                    Err(e) => warn!(%addr, error = %e, "handshake rejected"),
                }
            }
            ClientFrame::SecureMsg {
                session_id,
                nonce,
                ciphertext,
            } => {
                gateway
                    .metrics
                    .secure_frames_in
                    .fetch_add(1, Ordering::Relaxed);
                match gateway.admit(&session_id, &nonce, &ciphertext, addr) {
                    Ok(Admission::Accepted { session, envelope }) => {
                        let shard = shard_for(&session.session_id, workers.len());
                        if workers[shard].send(Job { session, envelope }).is_err() {
                            break; // workers are gone, we are shutting down
                        }
                    }
                    Ok(Admission::Rejected(rejection)) => match rejection {
                        Rejection::UnknownSession {
                            alternate_exists: true,
                        } => gateway.send_no_session_hint(addr),
                        Rejection::Malformed { session, message } => {
                            let reply = banter_types::ServerPayload::Error { message };
                            if let Err(e) = gateway.dispatcher.send_direct(&session, reply) {
                                warn!(error = %e, "failed to send protocol error");
                            }
                        }
                        // Replay, decrypt failure, unknown session without an
                        // alternate: silent drops, already counted.
                        _ => {}
                    },
                    Err(e) => error!(%addr, error = %e, "admission failed"),
                }
            }
        }
    }
    debug!("receive loop exited");
}

fn worker_loop(router: Arc<Router>, rx: Receiver<Job>, shutdown: Arc<AtomicBool>) {
    loop {
        match rx.recv_timeout(Duration::from_millis(250)) {
            Ok(job) => router.handle(&job.session, job.envelope),
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn writer_loop(socket: UdpSocket, rx: Receiver<Outbound>, shutdown: Arc<AtomicBool>) {
    loop {
        match rx.recv_timeout(Duration::from_millis(250)) {
            Ok((addr, frame)) => {
                if let Err(e) = socket.send_to(&frame, addr) {
                    warn!(%addr, error = %e, "datagram send failed");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn sweeper_loop(gateway: Arc<Gateway>, shutdown: Arc<AtomicBool>) {
    let mut last_sweep = Instant::now();
    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(500));
        if last_sweep.elapsed() < SWEEP_INTERVAL {
            continue;
        }
        last_sweep = Instant::now();
        if let Err(e) = gateway.sweep_sessions() {
            warn!(error = %e, "session sweep failed");
        }
    }
}

/// Stable shard choice so one session's frames always land on one worker.
fn shard_for(session_id: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    session_id.hash(&mut hasher);
    (hasher.finish() as usize) % shards
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sharding_is_stable_and_in_range() {
        for shards in 1..8 {
            let a = shard_for("session-a", shards);
            assert_eq!(a, shard_for("session-a", shards));
            assert!(a < shards);
        }
    }
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use gotong_core::{ClusterError, NodeId, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::NetError;
use crate::frame::{Frame, read_frame, write_frame};
use crate::transport::TokioTransport;

/// Connectivity of a [`PeerLink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
}

#[derive(Debug, Clone)]
pub struct LinkOptions {
    /// Heartbeat period, also the delay between reconnect attempts.
    pub ping: Duration,
    /// Silence after which a connection is declared dead.
    pub timeout: Duration,
    /// How long [`PeerLink::request`] waits for the link to come up.
    pub connect_timeout: Duration,
    /// Default deadline for a remote call.
    pub call_timeout: Duration,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            ping: Duration::from_millis(500),
            timeout: Duration::from_millis(1500),
            connect_timeout: Duration::from_millis(500),
            call_timeout: Duration::from_secs(5),
        }
    }
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, ClusterError>>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to an established connection, used to call remote methods.
#[derive(Clone)]
pub struct Remote {
    peer: NodeId,
    outbound: mpsc::Sender<Frame>,
    pending: Pending,
    next_id: Arc<AtomicU64>,
    call_timeout: Duration,
}

impl Remote {
    pub async fn invoke(&self, method: &str, params: Value) -> Result<Value, ClusterError> {
        self.invoke_within(method, params, self.call_timeout).await
    }

    pub async fn invoke_within(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, ClusterError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, response) = oneshot::channel();
        lock(&self.pending).insert(id, reply);

        let request = Frame::Request {
            id,
            method: method.to_string(),
            params,
        };
        if self.outbound.send(request).await.is_err() {
            lock(&self.pending).remove(&id);
            return Err(NetError::Closed.into());
        }

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClusterError::uninitialized(format!(
                "connection to {} lost mid-request",
                self.peer
            ))),
            Err(_) => {
                lock(&self.pending).remove(&id);
                Err(ClusterError::Transport(format!(
                    "`{method}` on {} timed out after {timeout:?}",
                    self.peer
                )))
            }
        }
    }
}

struct Shared {
    peer: NodeId,
    options: LinkOptions,
    state: watch::Sender<LinkState>,
    session: Mutex<Option<Remote>>,
    next_id: Arc<AtomicU64>,
}

impl Shared {
    fn transition(&self, next: LinkState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            match next {
                LinkState::Up => info!(peer = %self.peer, "peer up"),
                LinkState::Down => warn!(peer = %self.peer, "peer down"),
            }
        }
    }
}

/// A self-healing RPC channel to one other node.
///
/// The link connects in the background and reconnects whenever the
/// connection drops or goes silent. State transitions are observable through
/// [`PeerLink::subscribe`].
pub struct PeerLink {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl PeerLink {
    /// Starts connecting to `peer` (`host:port`). Must be called within a
    /// Tokio runtime.
    pub fn connect(peer: NodeId, options: LinkOptions) -> Self {
        let (state, _) = watch::channel(LinkState::Down);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            peer,
            options,
            state,
            session: Mutex::new(None),
            next_id: Arc::new(AtomicU64::new(1)),
        });
        let supervisor = tokio::spawn(supervise(Arc::clone(&shared), shutdown_rx));

        Self {
            shared,
            shutdown,
            supervisor: Mutex::new(Some(supervisor)),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.shared.peer
    }

    pub fn state(&self) -> LinkState {
        *self.shared.state.borrow()
    }

    pub fn is_up(&self) -> bool {
        self.state() == LinkState::Up
    }

    /// Observes state transitions. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.shared.state.subscribe()
    }

    /// Waits up to the connect timeout for the first connection.
    ///
    /// A link that misses this deadline keeps reconnecting and becomes
    /// usable as soon as it connects.
    pub async fn ready(&self) -> Result<(), ClusterError> {
        self.request().await.map(|_| ())
    }

    /// Returns a handle to the live connection, waiting up to the connect
    /// timeout for one.
    pub async fn request(&self) -> Result<Remote, ClusterError> {
        self.request_within(self.shared.options.connect_timeout).await
    }

    pub async fn request_within(&self, wait: Duration) -> Result<Remote, ClusterError> {
        debug!(peer = %self.shared.peer, "requesting connection");
        let mut state = self.subscribe();
        let connected = matches!(
            tokio::time::timeout(wait, state.wait_for(|s| *s == LinkState::Up)).await,
            Ok(Ok(_))
        );
        let session = if connected {
            lock(&self.shared.session).clone()
        } else {
            None
        };
        session.ok_or_else(|| {
            warn!(peer = %self.shared.peer, "connection not initialized in time");
            let peer = &self.shared.peer;
            ClusterError::uninitialized(format!("peer {peer} did not connect in time"))
        })
    }

    /// Stops reconnecting and tears the connection down. Idempotent.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        let supervisor = lock(&self.supervisor).take();
        if let Some(supervisor) = supervisor {
            if let Err(err) = supervisor.await {
                warn!(peer = %self.shared.peer, %err, "link supervisor ended abnormally");
            }
        }
        self.shared.transition(LinkState::Down);
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

async fn supervise(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let attempt = tokio::time::timeout(
            shared.options.timeout,
            TokioTransport::connect(shared.peer.as_str()),
        );
        let connected = tokio::select! {
            connected = attempt => connected,
            _ = shutdown.changed() => break,
        };
        match connected {
            Ok(Ok(transport)) => {
                let result = run_session(&shared, transport, &mut shutdown).await;
                if let Err(err) = result {
                    debug!(peer = %shared.peer, %err, "session ended");
                }
                shared.transition(LinkState::Down);
                if *shutdown.borrow() {
                    break;
                }
            }
            Ok(Err(err)) => debug!(peer = %shared.peer, %err, "connect failed"),
            Err(_) => debug!(peer = %shared.peer, "connect timed out"),
        }

        tokio::select! {
            _ = tokio::time::sleep(shared.options.ping) => {}
            _ = shutdown.changed() => break,
        }
    }
}

async fn run_session(
    shared: &Shared,
    transport: TokioTransport,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), NetError> {
    let (mut reader, mut writer) = transport.into_split();
    let (outbound, mut queued) = mpsc::channel::<Frame>(64);
    let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
    let remote = Remote {
        peer: shared.peer.clone(),
        outbound: outbound.clone(),
        pending: Arc::clone(&pending),
        next_id: Arc::clone(&shared.next_id),
        call_timeout: shared.options.call_timeout,
    };
    *lock(&shared.session) = Some(remote);
    shared.transition(LinkState::Up);

    let started = Instant::now();
    let last_seen = AtomicU64::new(0);

    let read_loop = async {
        while let Some(frame) = read_frame(&mut reader).await? {
            last_seen.store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
            match frame {
                Frame::Response { id, result } => {
                    if let Some(reply) = lock(&pending).remove(&id) {
                        let _ = reply.send(result);
                    }
                }
                Frame::Ping { id } => {
                    if outbound.send(Frame::Pong { id }).await.is_err() {
                        return Err(NetError::Closed);
                    }
                }
                Frame::Pong { .. } => {}
                Frame::Request { method, .. } => {
                    debug!(peer = %shared.peer, %method, "ignoring request on outbound link")
                }
            }
        }
        Err::<(), NetError>(NetError::Closed)
    };

    let write_loop = async {
        while let Some(frame) = queued.recv().await {
            write_frame(&mut writer, &frame).await?;
        }
        Ok::<(), NetError>(())
    };

    let heartbeat = async {
        let silence_limit = shared.options.timeout.as_millis() as u64;
        let mut ticker = tokio::time::interval(shared.options.ping);
        ticker.tick().await;
        let mut seq = 0u64;
        loop {
            ticker.tick().await;
            let now = started.elapsed().as_millis() as u64;
            if now.saturating_sub(last_seen.load(Ordering::Relaxed)) > silence_limit {
                return Err::<(), NetError>(NetError::Silent(shared.options.timeout));
            }
            seq += 1;
            if outbound.send(Frame::Ping { id: seq }).await.is_err() {
                return Err(NetError::Closed);
            }
        }
    };

    let result = tokio::select! {
        result = read_loop => result,
        result = write_loop => result,
        result = heartbeat => result,
        _ = shutdown.changed() => Ok(()),
    };

    // Callers holding the old handle see a closed channel from here on.
    drop(queued);
    lock(&shared.session).take();
    for (_, reply) in lock(&pending).drain() {
        let _ = reply.send(Err(ClusterError::uninitialized(format!(
            "connection to {} lost",
            shared.peer
        ))));
    }
    result
}

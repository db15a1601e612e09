use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use gotong_core::{ClusterError, NodeId, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::error::NetError;
use crate::frame::{Frame, read_frame, write_frame};
use crate::transport::TokioTransport;

pub type Handler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, ClusterError>> + Send + Sync>;

/// Remotely callable methods, keyed by name.
///
/// Filled once during setup and frozen when handed to [`RpcListener::serve`].
#[derive(Clone, Default)]
pub struct MethodTable {
    handlers: HashMap<String, Handler>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, method: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ClusterError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(
            move |params| -> BoxFuture<'static, Result<Value, ClusterError>> {
                Box::pin(handler(params))
            },
        );
        self.handlers.insert(method.into(), handler);
        self
    }

    pub fn dispatch(
        &self,
        method: &str,
        params: Value,
    ) -> BoxFuture<'static, Result<Value, ClusterError>> {
        match self.handlers.get(method) {
            Some(handler) => handler(params),
            None => {
                let err = ClusterError::internal(format!("unknown method `{method}`"));
                Box::pin(async move { Err(err) })
            }
        }
    }
}

/// A bound listener that has not started serving yet.
///
/// Binding first gives the node its identity (`host:port`, with the port
/// resolved when 0 was requested) before its methods are wired up.
pub struct RpcListener {
    listener: TcpListener,
    id: NodeId,
}

impl RpcListener {
    pub async fn bind(host: &str, port: u16) -> Result<Self, NetError> {
        let listener = TcpListener::bind((host, port)).await?;
        let port = listener.local_addr()?.port();
        Ok(Self {
            listener,
            id: NodeId::from_host_port(host, port),
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        Ok(self.listener.local_addr()?)
    }

    /// Starts accepting peers. Must be called within a Tokio runtime.
    pub fn serve(self, methods: MethodTable) -> RpcServer {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let clients = Arc::new(AtomicUsize::new(0));
        let accept = tokio::spawn(accept_loop(
            self.listener,
            self.id.clone(),
            Arc::new(methods),
            Arc::clone(&clients),
            shutdown_rx,
        ));
        info!(node_id = %self.id, "rpc server listening");

        RpcServer {
            id: self.id,
            clients,
            shutdown,
            accept: Mutex::new(Some(accept)),
        }
    }
}

/// Serves [`MethodTable`] calls to every connected peer link.
pub struct RpcServer {
    id: NodeId,
    clients: Arc<AtomicUsize>,
    shutdown: watch::Sender<bool>,
    accept: Mutex<Option<JoinHandle<()>>>,
}

impl RpcServer {
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Number of inbound connections currently being served.
    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    /// Stops accepting and drops every client connection. Idempotent.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        let accept = self
            .accept
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(accept) = accept {
            if let Err(err) = accept.await {
                warn!(node_id = %self.id, %err, "accept loop ended abnormally");
            }
            info!(node_id = %self.id, "rpc server closed");
        }
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

struct ClientGuard(Arc<AtomicUsize>);

impl ClientGuard {
    fn enter(clients: &Arc<AtomicUsize>) -> Self {
        clients.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(clients))
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn accept_loop(
    listener: TcpListener,
    id: NodeId,
    methods: Arc<MethodTable>,
    clients: Arc<AtomicUsize>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    info!(node_id = %id, %remote, "incoming stream");
                    let guard = ClientGuard::enter(&clients);
                    let methods = Arc::clone(&methods);
                    let id = id.clone();
                    connections.spawn(async move {
                        let _guard = guard;
                        if let Err(err) = serve_connection(stream, methods).await {
                            debug!(node_id = %id, %remote, %err, "client connection ended");
                        }
                    });
                }
                Err(err) => warn!(node_id = %id, %err, "failed to accept connection"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown.changed() => break,
        }
    }
    connections.shutdown().await;
}

async fn serve_connection(stream: TcpStream, methods: Arc<MethodTable>) -> Result<(), NetError> {
    let (mut reader, mut writer) = TokioTransport::accepted(stream)?.into_split();
    let (outbound, mut queued) = mpsc::channel::<Frame>(64);
    // Dropped with the connection, aborting calls still in flight.
    let mut calls = JoinSet::new();

    let read_loop = async {
        while let Some(frame) = read_frame(&mut reader).await? {
            match frame {
                Frame::Ping { id } => {
                    if outbound.send(Frame::Pong { id }).await.is_err() {
                        return Err(NetError::Closed);
                    }
                }
                Frame::Request { id, method, params } => {
                    let call = methods.dispatch(&method, params);
                    let outbound = outbound.clone();
                    calls.spawn(async move {
                        let result = call.await;
                        let _ = outbound.send(Frame::Response { id, result }).await;
                    });
                }
                other => debug!(?other, "ignoring unexpected frame"),
            }
            while calls.try_join_next().is_some() {}
        }
        Ok::<(), NetError>(())
    };

    let write_loop = async {
        while let Some(frame) = queued.recv().await {
            write_frame(&mut writer, &frame).await?;
        }
        Ok::<(), NetError>(())
    };

    tokio::select! {
        result = read_loop => result,
        result = write_loop => result,
    }
}

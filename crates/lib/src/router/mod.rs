//! Route-port server and worker pools.
//!
//! One TCP listener accepts length-prefixed envelopes, runs the admission
//! checks, and dispatches decoded requests onto the outer worker pool;
//! self-enqueued issue requests flow through the inner pool. Both pools are
//! fixed-size sets of tasks consuming a queue and subscribing to the
//! shutdown bus.

mod errors;

pub use errors::RouterError;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::Config;
use crate::constants::MSG_VERSION;
use crate::proto::{
    self, Envelope, MsgCode, RequestBody, ResponseBody, WireError, read_frame, write_frame,
};
use crate::store::MetaStore;
use crate::Result;

/// Context a request arrived under.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// UUID the sender put in the message head.
    pub sender_uuid: String,
    /// Peer address for externally-sourced requests, None for inner ones.
    pub remote_addr: Option<SocketAddr>,
}

/// Implemented by the outer/inner pool (C8); the router only dispatches.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: RequestBody, context: RequestContext) -> ResponseBody;
}

struct OuterJob {
    request: RequestBody,
    context: RequestContext,
    reply: oneshot::Sender<ResponseBody>,
}

/// The route-port server.
pub struct Router {
    config: Arc<Config>,
    inner_tx: mpsc::Sender<RequestBody>,
    accept_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    outer_tx: mpsc::Sender<OuterJob>,
    shutdown: broadcast::Sender<()>,
    store: Arc<MetaStore>,
    handler: Arc<dyn RequestHandler>,
}

impl Router {
    /// Bind the route port and start the accept loop and both pools.
    pub async fn start(
        store: Arc<MetaStore>,
        config: Arc<Config>,
        handler: Arc<dyn RequestHandler>,
        shutdown: broadcast::Sender<()>,
    ) -> Result<Arc<Self>> {
        let port = config.route_port();
        let listener = bind_route_listener(port).await?;
        info!(port, "Route listener bound");

        let (outer_tx, outer_rx) = mpsc::channel::<OuterJob>(256);
        let (inner_tx, inner_rx) = mpsc::channel::<RequestBody>(256);

        let router = Arc::new(Self {
            config: Arc::clone(&config),
            inner_tx,
            accept_handle: std::sync::Mutex::new(None),
            outer_tx,
            shutdown: shutdown.clone(),
            store,
            handler: Arc::clone(&handler),
        });

        router.spawn_outer_pool(outer_rx, config.outer_workers());
        router.spawn_inner_pool(inner_rx, config.inner_workers());

        let accept = router.clone().accept_loop(listener);
        *router.accept_handle.lock().unwrap() =
            Some(tokio::spawn(accept.instrument(info_span!("route_accept"))));

        Ok(router)
    }

    /// Sender for self-enqueued issue requests (timers, discovery).
    pub fn inner_sender(&self) -> mpsc::Sender<RequestBody> {
        self.inner_tx.clone()
    }

    /// Rebind the route port; replies success only once the new socket is
    /// accepting. The old listener stays bound on failure.
    pub async fn set_port(self: &Arc<Self>, port: u16) -> Result<()> {
        let listener = bind_route_listener(port).await?;
        let accept = Arc::clone(self).accept_loop(listener);
        let new_handle = tokio::spawn(accept.instrument(info_span!("route_accept")));
        if let Some(old) = self.accept_handle.lock().unwrap().replace(new_handle) {
            old.abort();
        }
        info!(port, "Route listener rebound");
        Ok(())
    }

    /// Stop accepting; workers drain on the shutdown bus.
    pub fn stop(&self) {
        if let Some(handle) = self.accept_handle.lock().unwrap().take() {
            handle.abort();
        }
    }

    fn spawn_outer_pool(
        self: &Arc<Self>,
        outer_rx: mpsc::Receiver<OuterJob>,
        workers: usize,
    ) {
        let outer_rx = Arc::new(tokio::sync::Mutex::new(outer_rx));
        for worker in 0..workers {
            let rx = Arc::clone(&outer_rx);
            let handler = Arc::clone(&self.handler);
            let mut shutdown = self.shutdown.subscribe();
            tokio::spawn(
                async move {
                    loop {
                        let job = tokio::select! {
                            job = async { rx.lock().await.recv().await } => job,
                            _ = shutdown.recv() => break,
                        };
                        let Some(job) = job else { break };
                        let response = handler.handle(job.request, job.context).await;
                        let _ = job.reply.send(response);
                    }
                    debug!("Outer worker exiting");
                }
                .instrument(info_span!("outer_worker", worker)),
            );
        }
    }

    fn spawn_inner_pool(
        self: &Arc<Self>,
        inner_rx: mpsc::Receiver<RequestBody>,
        workers: usize,
    ) {
        let inner_rx = Arc::new(tokio::sync::Mutex::new(inner_rx));
        for worker in 0..workers {
            let rx = Arc::clone(&inner_rx);
            let handler = Arc::clone(&self.handler);
            let config = Arc::clone(&self.config);
            let mut shutdown = self.shutdown.subscribe();
            tokio::spawn(
                async move {
                    loop {
                        let request = tokio::select! {
                            request = async { rx.lock().await.recv().await } => request,
                            _ = shutdown.recv() => break,
                        };
                        let Some(request) = request else { break };
                        let context = RequestContext {
                            sender_uuid: config.device_uuid(),
                            remote_addr: None,
                        };
                        if let ResponseBody::Error { code, message } =
                            handler.handle(request, context).await
                        {
                            debug!(?code, message, "Inner request failed");
                        }
                    }
                    debug!("Inner worker exiting");
                }
                .instrument(info_span!("inner_worker", worker)),
            );
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("Route accept failed: {e}");
                        continue;
                    }
                },
                _ = shutdown.recv() => break,
            };
            let router = Arc::clone(&self);
            tokio::spawn(
                async move {
                    if let Err(e) = router.serve_connection(stream, peer).await {
                        debug!(peer = %peer, "Route connection ended: {e}");
                    }
                }
                .instrument(info_span!("route_conn", peer = %peer)),
            );
        }
        info!("Route accept loop stopped");
    }

    async fn serve_connection(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let own_uuid = self.config.device_uuid();
        while let Some(envelope) = read_frame(&mut stream).await? {
            let code = envelope.head.code;
            match self.admit(&envelope, &own_uuid).await {
                Admission::Drop => break,
                Admission::Reject(error, message) => {
                    self.respond_error(&mut stream, code, error, message).await?;
                }
                Admission::Accept(request) => {
                    let context = RequestContext {
                        sender_uuid: envelope.head.sender_uuid.clone(),
                        remote_addr: Some(peer),
                    };
                    let (reply_tx, reply_rx) = oneshot::channel();
                    let job = OuterJob {
                        request,
                        context,
                        reply: reply_tx,
                    };
                    if self.outer_tx.send(job).await.is_err() {
                        return Err(RouterError::PoolClosed { pool: "outer" }.into());
                    }
                    let response = reply_rx
                        .await
                        .unwrap_or(ResponseBody::Error {
                            code: WireError::General,
                            message: "worker dropped request".to_string(),
                        });
                    self.write_response(&mut stream, code, &response).await?;
                }
            }
        }
        Ok(())
    }

    async fn admit(&self, envelope: &Envelope, own_uuid: &str) -> Admission {
        if envelope.head.version != MSG_VERSION {
            return Admission::Reject(
                WireError::VersionIncompatible,
                format!("version {}", envelope.head.version),
            );
        }
        if envelope.head.sender_uuid == own_uuid {
            // Our own message looped back.
            return Admission::Drop;
        }
        if envelope.head.code.is_inner() {
            return Admission::Reject(
                WireError::InvalidMsg,
                "inner code on external socket".to_string(),
            );
        }

        let account_key = self.config.account_key().ok();
        let request = match proto::decode_request(envelope, account_key.as_ref()) {
            Ok(request) => request,
            Err(e) if e.is_cipher_error() => {
                return Admission::Reject(WireError::PermissionDeny, "cipher".to_string());
            }
            Err(e) => {
                return Admission::Reject(WireError::InvalidMsg, e.to_string());
            }
        };

        // A known foreign-account device only gets identity exchange and
        // share offers.
        if !matches!(
            envelope.head.code,
            MsgCode::DeviceMeta | MsgCode::ShareSync
        ) && let Ok(Some(device)) = self.store.device_by_uuid(&envelope.head.sender_uuid).await
            && !device.is_mine
        {
            return Admission::Reject(WireError::PermissionDeny, "token mismatch".to_string());
        }

        Admission::Accept(request)
    }

    async fn respond_error(
        &self,
        stream: &mut TcpStream,
        code: MsgCode,
        error: WireError,
        message: String,
    ) -> Result<()> {
        let response = ResponseBody::Error {
            code: error,
            message,
        };
        self.write_response(stream, code, &response).await
    }

    async fn write_response(
        &self,
        stream: &mut TcpStream,
        code: MsgCode,
        response: &ResponseBody,
    ) -> Result<()> {
        let account_key = self.config.account_key().ok();
        let envelope = proto::encode_response(
            &self.config.device_uuid(),
            code,
            response,
            account_key.as_ref(),
        )?;
        write_frame(stream, &envelope).await?;
        Ok(())
    }
}

enum Admission {
    Accept(RequestBody),
    Reject(WireError, String),
    Drop,
}

async fn bind_route_listener(port: u16) -> Result<TcpListener> {
    TcpListener::bind(("0.0.0.0", port)).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::AddrInUse {
            RouterError::AddrInUse { port }.into()
        } else {
            RouterError::Bind {
                port,
                reason: e.to_string(),
            }
            .into()
        }
    })
}

//! TCP provider: accept loop, per-connection framing and request tasks.

use super::dispatch::Dispatcher;
use super::methods::ServiceDefinition;
use crate::address::{Address, ServiceKey};
use crate::error::{Error, Result};
use crate::protocol::{CodecRegistry, Envelope, Frame, FrameCodec, MessageKind, ResponseBody};
use crate::registry::Registry;
use crate::shutdown::DrainOutcome;

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

/// Replies buffered per connection before request tasks wait.
const REPLY_BUFFER: usize = 1024;

/// Listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind.
    pub host: String,
    /// Port to bind. `0` picks a free port.
    pub port: u16,
    /// Host published to the registry.
    pub advertise_host: String,
    /// Concurrent connections accepted before new ones are dropped.
    pub max_connections: usize,
    /// Maximum frame size accepted or produced.
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8094,
            advertise_host: "127.0.0.1".to_string(),
            max_connections: 1024,
            max_frame_size: crate::protocol::framing::MAX_FRAME_SIZE,
        }
    }
}

/// State every connection task needs.
#[derive(Debug, Clone)]
struct ConnectionContext {
    codecs: Arc<CodecRegistry>,
    dispatcher: Dispatcher,
    max_frame_size: usize,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

/// RPC provider bound to a TCP port.
///
/// Methods are published with [`publish`](Self::publish), which also
/// announces the advertised address to the registry. Requests are served
/// once [`start`](Self::start) has been called.
#[derive(Debug)]
pub struct RpcServer {
    local_address: SocketAddr,
    advertised: Address,
    max_connections: usize,
    listener: Mutex<Option<TcpListener>>,
    registry: Arc<dyn Registry>,
    published: Mutex<Vec<ServiceKey>>,
    context: ConnectionContext,
}

impl RpcServer {
    /// Bind the listening socket.
    ///
    /// # Errors
    ///
    /// Returns a network error if the address cannot be bound.
    pub async fn bind(
        config: ServerConfig,
        codecs: Arc<CodecRegistry>,
        dispatcher: Dispatcher,
        registry: Arc<dyn Registry>,
    ) -> Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .map_err(|e| {
                Error::Network(format!(
                    "failed to bind {}:{}: {e}",
                    config.host, config.port
                ))
            })?;
        let local_address = listener.local_addr()?;
        let advertised = Address::new(config.advertise_host.clone(), local_address.port());

        info!("RPC server bound to {}, advertising {}", local_address, advertised);

        Ok(Self {
            local_address,
            advertised,
            max_connections: config.max_connections.max(1),
            listener: Mutex::new(Some(listener)),
            registry,
            published: Mutex::new(Vec::new()),
            context: ConnectionContext {
                codecs,
                dispatcher,
                max_frame_size: config.max_frame_size,
                shutdown_token: CancellationToken::new(),
                task_tracker: TaskTracker::new(),
            },
        })
    }

    /// Socket address actually bound.
    #[must_use]
    pub const fn local_address(&self) -> SocketAddr {
        self.local_address
    }

    /// Address published to the registry.
    #[must_use]
    pub const fn advertised_address(&self) -> &Address {
        &self.advertised
    }

    /// Make `service`'s methods callable and announce this provider.
    ///
    /// # Errors
    ///
    /// Returns the registry's error if the announcement fails. The methods stay
    /// published locally in that case.
    pub async fn publish(&self, service: ServiceDefinition) -> Result<()> {
        self.context.dispatcher.methods().publish(&service);
        self.registry
            .register(service.key(), self.advertised.clone())
            .await?;

        info!("Published {} at {}", service.key(), self.advertised);
        self.published.lock().push(service.key().clone());
        Ok(())
    }

    /// Start accepting connections on a background task.
    ///
    /// # Errors
    ///
    /// Returns an error if the server was already started.
    pub fn start(&self) -> Result<()> {
        let Some(listener) = self.listener.lock().take() else {
            return Err(Error::Configuration("RPC server already started".to_string()));
        };

        let context = self.context.clone();
        let semaphore = Arc::new(Semaphore::new(self.max_connections));

        self.context.task_tracker.spawn(async move {
            loop {
                tokio::select! {
                    () = context.shutdown_token.cancelled() => {
                        debug!("Accept loop stopped");
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                                warn!("Max connections reached, rejecting connection from {}", peer);
                                continue;
                            };

                            let context = context.clone();
                            context.task_tracker.clone().spawn(async move {
                                context.serve_connection(stream, peer).await;
                                drop(permit);
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        });

        info!("RPC server listening on {}", self.local_address);
        Ok(())
    }

    /// Stop serving.
    ///
    /// Withdraws every published service from the registry, answers new
    /// requests with a closing status while admitted ones drain, then closes
    /// the listener and every connection.
    pub async fn shutdown(&self) -> DrainOutcome {
        let published: Vec<ServiceKey> = self.published.lock().drain(..).collect();
        for service in &published {
            if let Err(e) = self.registry.unregister(service, &self.advertised).await {
                warn!("Failed to unregister {} at {}: {}", service, self.advertised, e);
            }
        }

        let outcome = self.context.dispatcher.shutdown().shutdown().await;

        self.context.shutdown_token.cancel();
        self.context.task_tracker.close();
        self.context.task_tracker.wait().await;

        info!("RPC server on {} stopped: {:?}", self.local_address, outcome);
        outcome
    }
}

impl ConnectionContext {
    #[instrument(skip(self, stream))]
    async fn serve_connection(&self, stream: TcpStream, peer: SocketAddr) {
        debug!("New connection from {}", peer);

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        let framed = Framed::new(
            stream,
            FrameCodec::new().with_max_frame_size(self.max_frame_size),
        );
        let (mut sink, mut frames) = framed.split();
        let (replies, mut queue) = mpsc::channel::<Frame>(REPLY_BUFFER);

        let writer = tokio::spawn(async move {
            while let Some(frame) = queue.recv().await {
                if let Err(e) = sink.send(frame).await {
                    warn!("Failed to write reply to {}: {}", peer, e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let caller = Address::from(peer);

        loop {
            tokio::select! {
                () = self.shutdown_token.cancelled() => break,
                frame = frames.next() => match frame {
                    Some(Ok(frame)) => {
                        let context = self.clone();
                        let replies = replies.clone();
                        let caller = caller.clone();

                        self.task_tracker.spawn(async move {
                            tokio::select! {
                                () = context.shutdown_token.cancelled() => {}
                                reply = context.respond(frame, &caller) => {
                                    if let Some(reply) = reply {
                                        let _ = replies.send(reply).await;
                                    }
                                }
                            }
                        });
                    }
                    Some(Err(e)) => {
                        warn!("Closing connection from {}: {}", peer, e);
                        break;
                    }
                    None => {
                        debug!("Connection from {} closed by caller", peer);
                        break;
                    }
                }
            }
        }

        drop(replies);
        let _ = writer.await;

        self.dispatcher.disconnected(&caller);
        debug!("Connection from {} finished", peer);
    }

    async fn respond(&self, frame: Frame, caller: &Address) -> Option<Frame> {
        let header = frame.header;

        let envelope = match self.codecs.decode(&frame) {
            Ok(envelope) => envelope,
            Err(e) if header.kind == MessageKind::Response => {
                warn!("Dropping undecodable response {} from {}: {}", header.request_id, caller, e);
                return None;
            }
            Err(e) => {
                warn!("Failed to decode request {} from {}: {}", header.request_id, caller, e);
                return self.encode(&Envelope::reply_to(&header, ResponseBody::failure(e.to_string())));
            }
        };

        let reply = self.dispatcher.handle(envelope, caller).await?;
        match self.codecs.encode(&reply) {
            Ok(frame) => Some(frame),
            Err(e) => {
                error!("Failed to encode reply {}: {}", header.request_id, e);
                self.encode(&Envelope::reply_to(&header, ResponseBody::failure(e.to_string())))
            }
        }
    }

    fn encode(&self, envelope: &Envelope) -> Option<Frame> {
        self.codecs
            .encode(envelope)
            .inspect_err(|e| error!("Failed to encode reply {}: {}", envelope.request_id(), e))
            .ok()
    }
}

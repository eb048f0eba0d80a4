//! A single client connection to a provider.

use crate::address::Address;
use crate::correlator::Correlator;
use crate::error::{Error, Result};
use crate::protocol::{Body, CodecRegistry, Envelope, Frame, FrameCodec, MessageKind};

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Outbound frames buffered per connection before senders wait.
const OUTBOUND_BUFFER: usize = 1024;

/// Connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Maximum frame size accepted or produced.
    pub max_frame_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 3_000,
            max_frame_size: crate::protocol::framing::MAX_FRAME_SIZE,
        }
    }
}

impl ConnectionConfig {
    /// Connect timeout as a duration.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Duplex framed stream to one provider, shared by every call to it.
///
/// A reader task completes pending calls in the [`Correlator`]; a writer task
/// drains an outbound queue so concurrent callers never contend on the socket.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    address: Address,
    codecs: Arc<CodecRegistry>,
    outbound: mpsc::Sender<Frame>,
    in_flight: Arc<DashSet<u64>>,
    closed: CancellationToken,
}

impl Connection {
    /// Connect to `address` and start the reader and writer tasks.
    ///
    /// # Errors
    ///
    /// Returns a network error if the connect fails or times out.
    pub async fn connect(
        id: u64,
        address: Address,
        config: &ConnectionConfig,
        codecs: Arc<CodecRegistry>,
        correlator: Correlator,
    ) -> Result<Arc<Self>> {
        let connect_timeout = config.connect_timeout();
        let stream = timeout(
            connect_timeout,
            TcpStream::connect((address.host(), address.port())),
        )
        .await
        .map_err(|_| {
            Error::Network(format!(
                "connect to {address} timed out after {connect_timeout:?}"
            ))
        })?
        .map_err(|e| Error::Network(format!("failed to connect to {address}: {e}")))?;

        stream.set_nodelay(true)?;

        let framed = Framed::new(
            stream,
            FrameCodec::new().with_max_frame_size(config.max_frame_size),
        );
        let (sink, stream) = framed.split();
        let (outbound, queue) = mpsc::channel(OUTBOUND_BUFFER);

        let conn = Arc::new(Self {
            id,
            address,
            codecs,
            outbound,
            in_flight: Arc::new(DashSet::new()),
            closed: CancellationToken::new(),
        });

        tokio::spawn(Self::write_loop(
            conn.address.clone(),
            sink,
            queue,
            conn.closed.clone(),
        ));
        tokio::spawn(Self::read_loop(Arc::clone(&conn), stream, correlator));

        debug!("Created new connection {} to {}", id, conn.address);

        Ok(conn)
    }

    /// Connection id, unique within a manager.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Remote address.
    #[must_use]
    pub const fn address(&self) -> &Address {
        &self.address
    }

    /// Whether the connection has shut down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection has shut down.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Close the connection. Pending calls on it fail with a network error.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Requests written on this connection that have not been answered.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Stop tracking request `id`, whose caller no longer waits for it.
    pub fn forget(&self, id: u64) {
        self.in_flight.remove(&id);
    }

    /// Encode and queue an envelope for writing.
    ///
    /// The caller must have registered the request id with the correlator
    /// beforehand, otherwise a fast reply is dropped as unknown.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the envelope cannot be encoded, or a network
    /// error if the connection is closed.
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Network(format!("connection to {} is closed", self.address)));
        }

        let frame = self.codecs.encode(envelope)?;
        let id = frame.header.request_id;

        if frame.header.kind != MessageKind::Response {
            self.in_flight.insert(id);
        }

        if self.outbound.send(frame).await.is_err() {
            self.in_flight.remove(&id);
            return Err(Error::Network(format!("connection to {} is closed", self.address)));
        }

        Ok(())
    }

    async fn write_loop(
        address: Address,
        mut sink: SplitSink<Framed<TcpStream, FrameCodec>, Frame>,
        mut queue: mpsc::Receiver<Frame>,
        closed: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = closed.cancelled() => break,
                frame = queue.recv() => {
                    let Some(frame) = frame else { break };
                    if let Err(e) = sink.send(frame).await {
                        warn!("Write to {} failed: {}", address, e);
                        break;
                    }
                }
            }
        }

        let _ = sink.close().await;
        closed.cancel();
    }

    async fn read_loop(
        conn: Arc<Self>,
        mut stream: SplitStream<Framed<TcpStream, FrameCodec>>,
        correlator: Correlator,
    ) {
        loop {
            tokio::select! {
                () = conn.closed.cancelled() => break,
                frame = stream.next() => match frame {
                    Some(Ok(frame)) => conn.dispatch(frame, &correlator),
                    Some(Err(e)) => {
                        error!("Stream error from {}: {}", conn.address, e);
                        break;
                    }
                    None => {
                        debug!("Connection {} to {} closed by peer", conn.id, conn.address);
                        break;
                    }
                }
            }
        }

        conn.closed.cancel();

        let orphaned: Vec<u64> = conn.in_flight.iter().map(|id| *id).collect();
        conn.in_flight.clear();
        correlator.fail_all(
            orphaned,
            &Error::Network(format!("connection to {} lost", conn.address)),
        );
    }

    fn dispatch(&self, frame: Frame, correlator: &Correlator) {
        let id = frame.header.request_id;

        if frame.header.kind != MessageKind::Response {
            warn!(
                "Ignoring {:?} frame {} from provider {}",
                frame.header.kind, id, self.address
            );
            return;
        }

        self.in_flight.remove(&id);

        match self.codecs.decode(&frame) {
            Ok(Envelope {
                body: Body::Response(body),
                ..
            }) => {
                correlator.complete(id, Ok(body));
            }
            Ok(envelope) => {
                warn!("Response {} carried {:?}", id, envelope.body);
            }
            Err(e) => {
                warn!("Failed to decode response {} from {}: {}", id, self.address, e);
                correlator.complete(id, Err(e.into()));
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

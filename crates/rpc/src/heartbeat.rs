//! Background liveness probing of cached connections.

use crate::address::Address;
use crate::balancer::{LatencySamples, LatencyTable};
use crate::correlator::Correlator;
use crate::error::{Error, Result};
use crate::id::IdGenerator;
use crate::protocol::{Envelope, Status};
use crate::transport::ConnectionManager;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use serde::Deserialize;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Probe timing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Time between cycles, in milliseconds.
    pub interval_ms: u64,
    /// How long one probe waits for its reply, in milliseconds.
    pub timeout_ms: u64,
    /// Probes per address per cycle before it is presumed dead.
    pub attempts: u32,
    /// Upper bound of the random pause between attempts, in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            timeout_ms: 1_000,
            attempts: 3,
            max_backoff_ms: 40,
        }
    }
}

impl HeartbeatConfig {
    /// Cycle interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Probe timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

enum Probe {
    Alive(Duration),
    Closing,
    Dead(Error),
}

/// Periodically probes every cached connection, keeps the [`LatencyTable`]
/// current and evicts connections that stop answering.
#[derive(Debug, Clone)]
pub struct HeartbeatDetector {
    config: HeartbeatConfig,
    connections: ConnectionManager,
    correlator: Correlator,
    latency: LatencyTable,
    ids: Arc<IdGenerator>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl HeartbeatDetector {
    /// Create a stopped detector.
    #[must_use]
    pub fn new(
        config: HeartbeatConfig,
        connections: ConnectionManager,
        latency: LatencyTable,
        ids: Arc<IdGenerator>,
    ) -> Self {
        let correlator = connections.correlator().clone();

        Self {
            config,
            connections,
            correlator,
            latency,
            ids,
            shutdown_token: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        }
    }

    /// Start the probe loop on a background task.
    ///
    /// # Errors
    ///
    /// Returns an error if the detector was already started.
    pub fn start(&self) -> Result<()> {
        if self.task_tracker.is_closed() {
            return Err(Error::Configuration(
                "heartbeat detector already started".to_string(),
            ));
        }

        let detector = self.clone();
        self.task_tracker.spawn(async move {
            detector.run().await;
        });
        self.task_tracker.close();

        info!("heartbeat detector started, interval {:?}", self.config.interval());
        Ok(())
    }

    /// Stop the probe loop and wait for it to exit.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;
    }

    async fn run(&self) {
        let mut ticker = interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.shutdown_token.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        () = self.shutdown_token.cancelled() => break,
                        _ = self.probe_once() => {}
                    }
                }
            }
        }

        debug!("heartbeat detector stopped");
    }

    /// Run one probe cycle over every cached address and publish the result.
    pub async fn probe_once(&self) -> LatencySamples {
        let addresses = self.connections.addresses();
        debug!("probing {} connections", addresses.len());

        let outcomes = join_all(addresses.into_iter().map(|address| async move {
            let outcome = self.probe(&address).await;
            (address, outcome)
        }))
        .await;

        let mut samples = BTreeSet::new();
        for (address, outcome) in outcomes {
            match outcome {
                Probe::Alive(rtt) => {
                    debug!("{} answered in {:?}", address, rtt);
                    samples.insert((rtt, address));
                }
                Probe::Closing => {
                    info!("{} is closing, evicting", address);
                    self.connections.evict(&address);
                }
                Probe::Dead(e) => {
                    warn!(
                        "{} failed {} heartbeats, evicting: {}",
                        address, self.config.attempts, e
                    );
                    self.connections.evict(&address);
                }
            }
        }

        self.latency.publish(samples.clone());
        samples
    }

    async fn probe(&self, address: &Address) -> Probe {
        let attempts = self.config.attempts.max(1);
        let mut last = Error::Network(format!("{address} was not probed"));

        for attempt in 1..=attempts {
            match self.ping(address).await {
                Ok(rtt) => return Probe::Alive(rtt),
                Err(Error::ServerClosing(_)) => return Probe::Closing,
                Err(e) => {
                    debug!("heartbeat {} of {} to {} failed: {}", attempt, attempts, address, e);
                    last = e;
                }
            }

            if attempt < attempts {
                let backoff = rand::thread_rng().gen_range(0..=self.config.max_backoff_ms);
                sleep(Duration::from_millis(backoff)).await;
            }
        }

        Probe::Dead(last)
    }

    /// Send one heartbeat to `address` and measure the round trip.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServerClosing`] if the provider is draining, or the
    /// network, timeout or codec error that prevented a reply.
    pub async fn ping(&self, address: &Address) -> Result<Duration> {
        let conn = self.connections.acquire(address).await?;
        let codecs = self.connections.codecs();

        let id = self.ids.next_id();
        let handle = self.correlator.register(id);
        let started = Instant::now();

        conn.send(&Envelope::heartbeat(
            id,
            codecs.default_serializer(),
            codecs.default_compressor(),
        ))
        .await?;

        let reply = match self.correlator.wait(handle, self.config.timeout()).await {
            Ok(reply) => reply,
            Err(e) => {
                conn.forget(id);
                return Err(e);
            }
        };

        match reply.status {
            Status::HeartbeatOk | Status::Success => Ok(started.elapsed()),
            Status::Closing => Err(Error::ServerClosing(address.clone())),
            status => Err(Error::Network(format!(
                "unexpected heartbeat reply {status:?} from {address}"
            ))),
        }
    }

    /// Latency table maintained by this detector.
    #[must_use]
    pub const fn latency(&self) -> &LatencyTable {
        &self.latency
    }
}

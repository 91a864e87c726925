use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use rand::Rng;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult, StoreError};
use crate::membership::{GroupMembership, Member};
use crate::system::ShutdownReceiver;

use super::wire::{ReplicationMessage, read_message, send_message};
use super::{StateStore, StoreEntry};

const BACKOFF_BASE: Duration = Duration::from_millis(200);
const BACKOFF_MAX: Duration = Duration::from_secs(10);
const MAX_BATCH_ENTRIES: usize = 256;

#[derive(Debug, Clone, Copy)]
pub struct ReplicatorConfig {
    pub sync_interval: Duration,
    pub push_timeout: Duration,
}

/// Pushes locally written entries to every peer and applies entries pushed
/// by peers. Failed peers are retried with jittered exponential backoff; the
/// periodic full sync repairs anything an immediate push missed.
pub struct Replicator {
    store: Arc<dyn StateStore>,
    membership: Arc<dyn GroupMembership>,
    config: ReplicatorConfig,
    backoff: HashMap<String, PeerBackoff>,
}

#[derive(Debug, Clone, Copy)]
struct PeerBackoff {
    failures: u32,
    retry_at: Instant,
}

impl Replicator {
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        membership: Arc<dyn GroupMembership>,
        config: ReplicatorConfig,
    ) -> Self {
        Self {
            store,
            membership,
            config,
            backoff: HashMap::new(),
        }
    }

    /// Binds the listener peers push to.
    ///
    /// # Errors
    ///
    /// Returns an error when the address cannot be bound.
    pub async fn bind(addr: &str) -> AppResult<TcpListener> {
        TcpListener::bind(addr).await.map_err(|err| {
            AppError::store(StoreError::Bind {
                addr: addr.to_owned(),
                source: err,
            })
        })
    }

    /// Runs until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error only when the inbound listener task fails to join.
    pub async fn run(
        mut self,
        listener: TcpListener,
        mut shutdown_rx: ShutdownReceiver,
    ) -> AppResult<()> {
        let inbound = tokio::spawn(serve_inbound(
            listener,
            Arc::clone(&self.store),
            shutdown_rx.resubscribe(),
        ));
        let mut changes = self.store.subscribe();
        let mut sync = tokio::time::interval(self.config.sync_interval);
        sync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                change = changes.recv() => match change {
                    Ok(entry) => {
                        let mut batch = Vec::new();
                        if entry.writer == self.store.writer() {
                            batch.push(entry);
                        }
                        let mut lagged = false;
                        while batch.len() < MAX_BATCH_ENTRIES {
                            match changes.try_recv() {
                                Ok(next) => {
                                    if next.writer == self.store.writer() {
                                        batch.push(next);
                                    }
                                }
                                Err(TryRecvError::Lagged(_)) => {
                                    lagged = true;
                                    break;
                                }
                                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                            }
                        }
                        if lagged {
                            self.full_sync().await;
                        } else if !batch.is_empty() {
                            self.push_to_peers(batch).await;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Replication feed lagged by {} entries; running full sync", skipped);
                        self.full_sync().await;
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = sync.tick() => self.full_sync().await,
            }
        }

        inbound.abort();
        match inbound.await {
            Ok(()) => Ok(()),
            Err(err) if err.is_cancelled() => Ok(()),
            Err(err) => Err(AppError::from(err)),
        }
    }

    async fn full_sync(&mut self) {
        let own: Vec<StoreEntry> = self
            .store
            .get_all("")
            .await
            .into_iter()
            .filter(|entry| entry.writer == self.store.writer())
            .collect();
        if own.is_empty() {
            return;
        }
        for chunk in own.chunks(MAX_BATCH_ENTRIES) {
            self.push_to_peers(chunk.to_vec()).await;
        }
    }

    async fn push_to_peers(&mut self, entries: Vec<StoreEntry>) {
        let now = Instant::now();
        let peers: Vec<Member> = self
            .membership
            .peers()
            .await
            .into_iter()
            .filter(|peer| {
                self.backoff
                    .get(&peer.id)
                    .is_none_or(|backoff| backoff.retry_at <= now)
            })
            .collect();
        if peers.is_empty() {
            return;
        }

        let from = self.store.writer().to_owned();
        let timeout = self.config.push_timeout;
        let pushes = peers.iter().map(|peer| {
            let message = ReplicationMessage::Push {
                from: from.clone(),
                entries: entries.clone(),
            };
            async move {
                let result = tokio::time::timeout(timeout, push(&peer.gossip_addr, &message))
                    .await
                    .unwrap_or_else(|_| {
                        Err(AppError::store(StoreError::Connection {
                            addr: peer.gossip_addr.clone(),
                            source: std::io::Error::new(
                                std::io::ErrorKind::TimedOut,
                                "replication push timed out",
                            ),
                        }))
                    });
                (peer.id.clone(), result)
            }
        });

        for (peer_id, result) in join_all(pushes).await {
            match result {
                Ok(applied) => {
                    if self.backoff.remove(&peer_id).is_some() {
                        info!("Replication to {} recovered", peer_id);
                    }
                    debug!("Pushed {} entries to {} ({} applied)", entries.len(), peer_id, applied);
                }
                Err(err) => {
                    let failures = self
                        .backoff
                        .get(&peer_id)
                        .map_or(1, |backoff| backoff.failures.saturating_add(1));
                    let delay = backoff_delay(failures);
                    warn!(
                        "Replication push to {} failed (attempt {}), retrying in {}ms: {}",
                        peer_id,
                        failures,
                        delay.as_millis(),
                        err
                    );
                    self.backoff.insert(
                        peer_id,
                        PeerBackoff {
                            failures,
                            retry_at: Instant::now()
                                .checked_add(delay)
                                .unwrap_or_else(Instant::now),
                        },
                    );
                }
            }
        }
    }
}

pub(super) fn backoff_delay(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    let base = BACKOFF_BASE
        .saturating_mul(2u32.saturating_pow(exponent))
        .min(BACKOFF_MAX);
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let jitter_ms = rand::thread_rng().gen_range(0..=base_ms / 2);
    Duration::from_millis(base_ms.saturating_add(jitter_ms))
}

async fn push(addr: &str, message: &ReplicationMessage) -> AppResult<usize> {
    let stream = TcpStream::connect(addr).await.map_err(|err| {
        AppError::store(StoreError::Connection {
            addr: addr.to_owned(),
            source: err,
        })
    })?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    send_message(&mut write_half, message).await?;
    match read_message(&mut reader).await? {
        ReplicationMessage::Ack { applied } => Ok(applied),
        ReplicationMessage::Push { .. } => Err(AppError::store(StoreError::ConnectionClosed)),
    }
}

async fn serve_inbound(
    listener: TcpListener,
    store: Arc<dyn StateStore>,
    mut shutdown_rx: ShutdownReceiver,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    let store = Arc::clone(&store);
                    tokio::spawn(async move {
                        if let Err(err) = handle_inbound(stream, store).await {
                            debug!("Replication connection from {} ended: {}", peer_addr, err);
                        }
                    });
                }
                Err(err) => {
                    warn!("Failed to accept replication connection: {}", err);
                }
            },
        }
    }
}

async fn handle_inbound(stream: TcpStream, store: Arc<dyn StateStore>) -> AppResult<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    loop {
        let message = match read_message(&mut reader).await {
            Ok(message) => message,
            Err(AppError::Store(StoreError::ConnectionClosed)) => return Ok(()),
            Err(err) => return Err(err),
        };
        let ReplicationMessage::Push { from, entries } = message else {
            continue;
        };
        let mut applied = 0usize;
        for entry in entries {
            if entry.writer != from {
                warn!(
                    "Ignoring entry '{}' relayed by {} on behalf of {}",
                    entry.key, from, entry.writer
                );
                continue;
            }
            match store.apply(entry).await {
                Ok(true) => applied = applied.saturating_add(1),
                Ok(false) => {}
                Err(err) => warn!("Failed to apply entry from {}: {}", from, err),
            }
        }
        send_message(&mut write_half, &ReplicationMessage::Ack { applied }).await?;
    }
}

//! Keeps a file list snapshot in step with the server.
//!
//! The orchestrator probes on start, refreshes on a fixed period and right after every
//! mutation, and tracks whether the server is online. A failed refresh never clears the list:
//! the last live snapshot stays, or the fallback cache fills in when there is none yet.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::cache::FallbackCache;
use crate::client::FileClient;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::file_info::{FileListSnapshot, FileRecord};
use crate::probe::{ProbeTarget, Prober, ServerEndpoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Unknown,
    Checking,
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSource {
    Empty,
    Live,
    Cache,
}

/// What observers see: connection state plus the file list to display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncView {
    pub state: ServerState,
    pub snapshot: FileListSnapshot,
    pub source: SnapshotSource,
}

impl Default for SyncView {
    fn default() -> Self {
        SyncView {
            state: ServerState::Unknown,
            snapshot: FileListSnapshot::default(),
            source: SnapshotSource::Empty,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub refresh_interval: Duration,
    pub probe_timeout: Duration,
}

impl From<&Config> for SyncOptions {
    fn from(config: &Config) -> Self {
        SyncOptions {
            refresh_interval: config.refresh_interval(),
            probe_timeout: config.probe_timeout(),
        }
    }
}

#[derive(Debug)]
struct Shared {
    client: FileClient,
    prober: Prober,
    cache: FallbackCache,
    endpoint: Mutex<ServerEndpoint>,
    view: watch::Sender<SyncView>,
    probe_timeout: Duration,
}

impl Shared {
    fn state(&self) -> ServerState {
        self.view.borrow().state
    }

    fn set_state(&self, state: ServerState) {
        self.view.send_if_modified(|view| {
            if view.state == state {
                return false;
            }
            tracing::info!("server state {:?} -> {:?}", view.state, state);
            view.state = state;
            true
        });
    }

    fn mark_reachable(&self, reachable: bool) {
        self.endpoint.lock().record(reachable);
    }

    async fn probe(&self) -> bool {
        let mut endpoint = self.endpoint.lock().clone();
        let up = self.prober.probe(&mut endpoint, self.probe_timeout).await;
        *self.endpoint.lock() = endpoint;
        up
    }

    /// Re-list the server. Failures downgrade to Offline and never reach the caller.
    async fn refresh(&self) -> ServerState {
        match self.client.list().await {
            Ok(records) => {
                if let Err(err) = self.cache.replace_all(&records) {
                    tracing::warn!("could not mirror file list into cache: {}", err);
                }
                self.mark_reachable(true);
                let snapshot = FileListSnapshot::from_records(records);
                self.view.send_modify(|view| {
                    if view.state != ServerState::Online {
                        tracing::info!("server state {:?} -> Online", view.state);
                    }
                    view.state = ServerState::Online;
                    view.snapshot = snapshot;
                    view.source = SnapshotSource::Live;
                });
                ServerState::Online
            }
            Err(err) => {
                tracing::warn!("refresh failed, keeping last file list: {}", err);
                self.mark_reachable(false);
                self.go_offline();
                ServerState::Offline
            }
        }
    }

    fn go_offline(&self) {
        let fallback = if self.view.borrow().source == SnapshotSource::Live {
            None
        } else {
            match self.cache.load_all() {
                Ok(records) => Some(FileListSnapshot::from_records(records)),
                Err(err) => {
                    tracing::warn!("fallback cache unreadable: {}", err);
                    None
                }
            }
        };
        self.view.send_modify(|view| {
            if view.state != ServerState::Offline {
                tracing::info!("server state {:?} -> Offline", view.state);
            }
            view.state = ServerState::Offline;
            if let Some(snapshot) = fallback {
                view.snapshot = snapshot;
                view.source = SnapshotSource::Cache;
            }
        });
    }

    /// A failed upload, delete or download flips to Offline without touching the list.
    fn mutation_failed(&self, err: &Error) {
        tracing::warn!("request failed, marking server offline: {}", err);
        self.mark_reachable(false);
        self.go_offline();
    }
}

/// Owns the snapshot, the connection state and the periodic refresh task.
#[derive(Debug)]
pub struct SyncOrchestrator {
    shared: Arc<Shared>,
    refresh_interval: Duration,
    ticker: Option<JoinHandle<()>>,
    stop: Option<oneshot::Sender<()>>,
}

impl SyncOrchestrator {
    pub fn new(config: &Config, cache: FallbackCache) -> Result<SyncOrchestrator> {
        let client = FileClient::new(config.server.clone())?;
        let prober = Prober::new(ProbeTarget::Files)?;
        SyncOrchestrator::with_parts(client, prober, cache, SyncOptions::from(config))
    }

    /// Fails with `Validation` when either duration is zero.
    pub fn with_parts(
        client: FileClient,
        prober: Prober,
        cache: FallbackCache,
        options: SyncOptions,
    ) -> Result<SyncOrchestrator> {
        if options.refresh_interval.is_zero() {
            return Err(Error::Validation("refresh interval must be non-zero".to_string()));
        }
        if options.probe_timeout.is_zero() {
            return Err(Error::Validation("probe timeout must be non-zero".to_string()));
        }
        let endpoint = ServerEndpoint::new(client.server());
        let (view, _) = watch::channel(SyncView::default());
        Ok(SyncOrchestrator {
            shared: Arc::new(Shared {
                client,
                prober,
                cache,
                endpoint: Mutex::new(endpoint),
                view,
                probe_timeout: options.probe_timeout,
            }),
            refresh_interval: options.refresh_interval,
            ticker: None,
            stop: None,
        })
    }

    /// Probe, load the first snapshot and start the refresh timer.
    pub async fn start(&mut self) -> ServerState {
        if self.ticker.is_some() {
            return self.state();
        }
        self.shared.set_state(ServerState::Checking);
        let state = if self.shared.probe().await {
            self.shared.refresh().await
        } else {
            self.shared.go_offline();
            ServerState::Offline
        };

        let (stop, stopped) = oneshot::channel();
        let shared = self.shared.clone();
        let period = self.refresh_interval;
        self.ticker = Some(tokio::spawn(run_ticker(shared, period, stopped)));
        self.stop = Some(stop);
        state
    }

    /// Stop the refresh timer and wait for it to finish.
    pub async fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(ticker) = self.ticker.take() {
            if let Err(err) = ticker.await {
                tracing::warn!("refresh task ended abnormally: {}", err);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.ticker.is_some()
    }

    pub async fn refresh(&self) -> ServerState {
        self.shared.refresh().await
    }

    /// Upload, cache the record, then refresh right away.
    pub async fn upload(&self, name: &str, content: Vec<u8>) -> Result<FileRecord> {
        let record = match self.shared.client.upload(name, content).await {
            Ok(record) => record,
            Err(err) => {
                self.shared.mutation_failed(&err);
                return Err(err);
            }
        };
        if let Err(err) = self.shared.cache.save(&record) {
            tracing::warn!("could not cache {}: {}", record.name, err);
        }
        self.shared.mark_reachable(true);
        self.shared.set_state(ServerState::Online);
        self.shared.refresh().await;
        Ok(record)
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        if let Err(err) = self.shared.client.remove(name).await {
            self.shared.mutation_failed(&err);
            return Err(err);
        }
        if let Err(err) = self.shared.cache.remove(name) {
            tracing::warn!("could not drop {} from cache: {}", name, err);
        }
        self.shared.mark_reachable(true);
        self.shared.set_state(ServerState::Online);
        self.shared.refresh().await;
        Ok(())
    }

    pub async fn download(&self, name: &str) -> Result<Bytes> {
        match self.shared.client.fetch_content(name).await {
            Ok(content) => {
                self.shared.mark_reachable(true);
                self.shared.set_state(ServerState::Online);
                Ok(content)
            }
            Err(err) => {
                self.shared.mutation_failed(&err);
                Err(err)
            }
        }
    }

    pub fn state(&self) -> ServerState {
        self.shared.state()
    }

    pub fn snapshot(&self) -> FileListSnapshot {
        self.shared.view.borrow().snapshot.clone()
    }

    pub fn view(&self) -> SyncView {
        self.shared.view.borrow().clone()
    }

    pub fn endpoint(&self) -> ServerEndpoint {
        self.shared.endpoint.lock().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncView> {
        self.shared.view.subscribe()
    }
}

impl Drop for SyncOrchestrator {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

async fn run_ticker(shared: Arc<Shared>, period: Duration, mut stopped: oneshot::Receiver<()>) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = &mut stopped => break,
            _ = interval.tick() => {
                if shared.state() == ServerState::Offline && !shared.probe().await {
                    continue;
                }
                shared.refresh().await;
            }
        }
    }
    tracing::debug!("refresh task stopped");
}

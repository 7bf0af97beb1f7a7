// Synchronizer - single owner of the active query, catalog and view
//
// Every mutation goes through one command queue drained by one task. Fetches,
// catalog refreshes and the push subscription run on their own tasks and
// report back through the same queue, so nothing touches the state
// concurrently and events are applied strictly in arrival order.
use crate::application::metrics_repository::MetricsRepository;
use crate::application::push_channel::{PushChannel, PushFrame};
use crate::application::reconciler::{reconcile, Action};
use crate::domain::catalog::{CatalogSnapshot, MetricCatalog};
use crate::domain::error::{DomainError, LogPointError, MalformedEvent};
use crate::domain::metric_point::MetricPoint;
use crate::domain::query_key::{QueryKey, QueryParams};
use crate::domain::series::Series;
use crate::domain::view::ViewState;
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// No open push subscription
    Idle,
    /// Subscription open, no fetch outstanding for the active key
    Syncing,
    /// A full aggregate fetch for the active key is outstanding
    Refetching,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Syncing => "syncing",
            SyncPhase::Refetching => "refetching",
        };
        f.write_str(s)
    }
}

/// Recoverable conditions surfaced to observers. None of them stop the
/// synchronizer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error("failed to fetch metrics for {key}: {message}")]
    AggregateFetch { key: String, message: String },

    #[error("failed to fetch metric names: {message}")]
    CatalogFetch { message: String },

    #[error("push subscription unavailable: {message}")]
    Subscription { message: String },

    #[error(transparent)]
    MalformedEvent(#[from] MalformedEvent),

    #[error(transparent)]
    InvalidPoint(#[from] LogPointError),

    #[error("failed to log metric {name}: {message}")]
    LogPoint { name: String, message: String },

    #[error("invalid query: {0}")]
    InvalidQuery(#[from] DomainError),

    #[error("synchronizer is not running")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct SynchronizerOptions {
    /// Metric selected until the first catalog refresh says otherwise
    pub initial_metric: String,
    pub initial_params: QueryParams,
    pub queue_capacity: usize,
    pub resubscribe_delay: Duration,
}

type Reply<T> = oneshot::Sender<Result<T, SyncError>>;

enum Command {
    SetQuery {
        params: QueryParams,
        reply: Reply<QueryKey>,
    },
    Select {
        name: String,
        reply: Reply<QueryKey>,
    },
    RefreshCatalog {
        reply: Reply<CatalogSnapshot>,
    },
    Report(SyncError),
    Push(PushFrame),
    SubscriptionOpened {
        generation: u64,
    },
    SubscriptionClosed {
        generation: u64,
        reason: String,
    },
    Resubscribe {
        generation: u64,
    },
    FetchCompleted {
        key: QueryKey,
        ticket: u64,
        result: anyhow::Result<Series>,
    },
    CatalogFetched {
        result: anyhow::Result<Vec<String>>,
    },
    Shutdown,
}

/// Read side of the synchronizer: the produced interface
#[derive(Clone)]
pub struct SyncObserver {
    view: watch::Receiver<Option<ViewState>>,
    catalog: watch::Receiver<CatalogSnapshot>,
    last_error: watch::Receiver<Option<SyncError>>,
    phase: watch::Receiver<SyncPhase>,
    active_key: watch::Receiver<QueryKey>,
}

impl SyncObserver {
    pub fn current_view(&self) -> Option<ViewState> {
        self.view.borrow().clone()
    }

    pub fn current_catalog(&self) -> CatalogSnapshot {
        self.catalog.borrow().clone()
    }

    pub fn last_error(&self) -> Option<SyncError> {
        self.last_error.borrow().clone()
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    pub fn active_key(&self) -> QueryKey {
        self.active_key.borrow().clone()
    }

    pub fn watch_view(&self) -> watch::Receiver<Option<ViewState>> {
        self.view.clone()
    }

    pub fn watch_catalog(&self) -> watch::Receiver<CatalogSnapshot> {
        self.catalog.clone()
    }

    pub fn watch_errors(&self) -> watch::Receiver<Option<SyncError>> {
        self.last_error.clone()
    }

    pub fn watch_phase(&self) -> watch::Receiver<SyncPhase> {
        self.phase.clone()
    }
}

/// Write side of the synchronizer. Cheap to clone; every call is queued
/// behind whatever is already pending.
#[derive(Clone)]
pub struct SynchronizerHandle {
    commands: mpsc::Sender<Command>,
    repository: Arc<dyn MetricsRepository>,
    observer: SyncObserver,
}

impl SynchronizerHandle {
    pub fn observer(&self) -> &SyncObserver {
        &self.observer
    }

    /// Change date range, interval or zero filling. Resolves to the new
    /// active key once the change has been queued behind earlier events.
    pub async fn set_query(&self, params: QueryParams) -> Result<QueryKey, SyncError> {
        self.request(|reply| Command::SetQuery { params, reply }).await
    }

    pub async fn select_metric(&self, name: impl Into<String>) -> Result<QueryKey, SyncError> {
        let name = name.into();
        self.request(|reply| Command::Select { name, reply }).await
    }

    /// Refetch the metric names and re-establish the selection invariant
    pub async fn refresh_catalog(&self) -> Result<CatalogSnapshot, SyncError> {
        self.request(|reply| Command::RefreshCatalog { reply }).await
    }

    /// Validate and log a raw point. Invalid input never reaches the
    /// backend; backend failures are reported but not retried.
    pub async fn log_metric(&self, name: &str, raw_value: &str) -> Result<MetricPoint, SyncError> {
        let point = MetricPoint::parse(name, raw_value)?;

        match self.repository.log_metric_point(&point).await {
            Ok(()) => {
                debug!(metric = %point.name, value = point.value, "Metric point logged");
                Ok(point)
            }
            Err(e) => {
                let err = SyncError::LogPoint {
                    name: point.name.clone(),
                    message: format!("{:#}", e),
                };
                warn!(error = %err, "Logging metric point failed");
                let _ = self.commands.send(Command::Report(err.clone())).await;
                Err(err)
            }
        }
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| SyncError::Closed)?;
        rx.await.map_err(|_| SyncError::Closed)?
    }
}

#[derive(Default)]
struct FetchTracker {
    next_ticket: u64,
    /// Latest fetch issued for the active key, if still running
    outstanding: Option<u64>,
    /// A requery arrived while `outstanding` was running
    stale: bool,
}

#[derive(Default)]
struct CatalogRefresh {
    in_flight: bool,
    waiters: Vec<Reply<CatalogSnapshot>>,
    again: bool,
    queued: Vec<Reply<CatalogSnapshot>>,
}

pub struct Synchronizer {
    repository: Arc<dyn MetricsRepository>,
    channel: Arc<dyn PushChannel>,
    resubscribe_delay: Duration,
    commands: mpsc::Receiver<Command>,
    // Weak so the loop ends once every handle is gone
    loopback: mpsc::WeakSender<Command>,

    params: QueryParams,
    active: QueryKey,
    catalog: MetricCatalog,

    subscribed: bool,
    generation: u64,
    subscription: Option<JoinHandle<()>>,
    fetch: FetchTracker,
    catalog_refresh: CatalogRefresh,

    view_tx: watch::Sender<Option<ViewState>>,
    catalog_tx: watch::Sender<CatalogSnapshot>,
    error_tx: watch::Sender<Option<SyncError>>,
    phase_tx: watch::Sender<SyncPhase>,
    key_tx: watch::Sender<QueryKey>,
}

impl Synchronizer {
    /// Start the synchronizer task and return its handle. Fails only if the
    /// initial query parameters are invalid.
    pub fn spawn(
        repository: Arc<dyn MetricsRepository>,
        channel: Arc<dyn PushChannel>,
        options: SynchronizerOptions,
    ) -> Result<(SynchronizerHandle, JoinHandle<()>), DomainError> {
        let active = QueryKey::new(options.initial_metric.clone(), &options.initial_params)?;
        let catalog = MetricCatalog::new(options.initial_metric);

        let (commands_tx, commands_rx) = mpsc::channel(options.queue_capacity.max(1));
        let (view_tx, view_rx) = watch::channel(None);
        let (catalog_tx, catalog_rx) = watch::channel(catalog.snapshot());
        let (error_tx, error_rx) = watch::channel(None);
        let (phase_tx, phase_rx) = watch::channel(SyncPhase::Idle);
        let (key_tx, key_rx) = watch::channel(active.clone());

        let synchronizer = Synchronizer {
            repository: repository.clone(),
            channel,
            resubscribe_delay: options.resubscribe_delay,
            commands: commands_rx,
            loopback: commands_tx.downgrade(),
            params: options.initial_params,
            active,
            catalog,
            subscribed: false,
            generation: 0,
            subscription: None,
            fetch: FetchTracker::default(),
            catalog_refresh: CatalogRefresh::default(),
            view_tx,
            catalog_tx,
            error_tx,
            phase_tx,
            key_tx,
        };

        let handle = SynchronizerHandle {
            commands: commands_tx,
            repository,
            observer: SyncObserver {
                view: view_rx,
                catalog: catalog_rx,
                last_error: error_rx,
                phase: phase_rx,
                active_key: key_rx,
            },
        };

        let task = tokio::spawn(synchronizer.run());
        Ok((handle, task))
    }

    async fn run(mut self) {
        info!(key = %self.active, "Synchronizer starting");

        self.open_subscription();
        self.request_catalog_refresh(None);
        self.start_fetch();
        self.publish_phase();

        while let Some(command) = self.commands.recv().await {
            if matches!(command, Command::Shutdown) {
                break;
            }
            self.handle(command);
            self.publish_phase();
        }

        if let Some(task) = self.subscription.take() {
            task.abort();
        }
        self.subscribed = false;
        self.publish_phase();
        info!("Synchronizer stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::SetQuery { params, reply } => {
                let result = QueryKey::new(self.catalog.selected(), &params)
                    .map_err(SyncError::from)
                    .map(|_| {
                        self.params = params;
                        self.rekey();
                        self.active.clone()
                    });
                let _ = reply.send(result);
            }
            Command::Select { name, reply } => {
                let result = QueryKey::new(name.as_str(), &self.params)
                    .map_err(SyncError::from)
                    .map(|_| {
                        self.catalog.select(name);
                        self.publish_catalog();
                        self.rekey();
                        self.active.clone()
                    });
                let _ = reply.send(result);
            }
            Command::RefreshCatalog { reply } => self.request_catalog_refresh(Some(reply)),
            Command::Report(err) => self.set_error(err),
            Command::Push(frame) => self.on_push(frame),
            Command::SubscriptionOpened { generation } => self.on_subscription_opened(generation),
            Command::SubscriptionClosed { generation, reason } => {
                self.on_subscription_closed(generation, reason)
            }
            Command::Resubscribe { generation } => {
                if generation == self.generation && self.subscription.is_none() {
                    debug!(generation, "Reopening push subscription");
                    self.open_subscription();
                }
            }
            Command::FetchCompleted {
                key,
                ticket,
                result,
            } => self.on_fetch_completed(key, ticket, result),
            Command::CatalogFetched { result } => self.on_catalog_fetched(result),
            Command::Shutdown => {}
        }
    }

    fn on_push(&mut self, frame: PushFrame) {
        let event = match frame {
            Ok(event) => event,
            Err(malformed) => {
                warn!(reason = %malformed.reason, "Ignoring malformed push event");
                self.set_error(malformed.into());
                return;
            }
        };

        let kind = event.kind();
        let action = reconcile(event, &self.active, &self.catalog);
        debug!(event = kind, action = action.name(), key = %self.active, "Reconciled push event");

        match action {
            Action::ReplaceView(series) => {
                let key = self.active.clone();
                self.replace_view(key, series);
            }
            Action::Requery => self.request_fetch(),
            Action::RefreshCatalog => self.request_catalog_refresh(None),
            Action::Ignore => {}
        }
    }

    fn on_fetch_completed(&mut self, key: QueryKey, ticket: u64, result: anyhow::Result<Series>) {
        let settled = self.fetch.outstanding == Some(ticket);
        if settled {
            self.fetch.outstanding = None;
        }

        if key != self.active {
            debug!(key = %key, active = %self.active, "Discarding fetch result for superseded query");
            return;
        }

        match result {
            Ok(series) => {
                debug!(key = %key, buckets = series.len(), "Applying fetched series");
                self.clear_error(|e| matches!(e, SyncError::AggregateFetch { .. }));
                self.replace_view(key, series);
            }
            Err(e) => {
                let err = SyncError::AggregateFetch {
                    key: key.encode(),
                    message: format!("{:#}", e),
                };
                warn!(error = %err, "Aggregate fetch failed, keeping last view");
                self.set_error(err);
            }
        }

        if settled && self.fetch.stale {
            self.start_fetch();
        }
    }

    fn on_catalog_fetched(&mut self, result: anyhow::Result<Vec<String>>) {
        self.catalog_refresh.in_flight = false;
        let waiters = std::mem::take(&mut self.catalog_refresh.waiters);

        match result {
            Ok(names) => {
                let reselected = self.catalog.replace_names(names);
                let snapshot = self.catalog.snapshot();
                debug!(names = snapshot.names.len(), selected = %snapshot.selected, "Catalog refreshed");
                self.publish_catalog();
                self.clear_error(|e| matches!(e, SyncError::CatalogFetch { .. }));
                if reselected {
                    self.rekey();
                }
                for waiter in waiters {
                    let _ = waiter.send(Ok(snapshot.clone()));
                }
            }
            Err(e) => {
                let err = SyncError::CatalogFetch {
                    message: format!("{:#}", e),
                };
                warn!(error = %err, "Catalog refresh failed, keeping last catalog");
                self.set_error(err.clone());
                for waiter in waiters {
                    let _ = waiter.send(Err(err.clone()));
                }
            }
        }

        if self.catalog_refresh.again {
            self.catalog_refresh.again = false;
            self.catalog_refresh.waiters = std::mem::take(&mut self.catalog_refresh.queued);
            self.start_catalog_refresh();
        }
    }

    fn on_subscription_opened(&mut self, generation: u64) {
        if generation != self.generation {
            return;
        }

        info!(key = %self.active, "Push subscription open");
        self.subscribed = true;
        self.clear_error(|e| matches!(e, SyncError::Subscription { .. }));

        let current = self
            .view_tx
            .borrow()
            .as_ref()
            .is_some_and(|view| view.answers(&self.active));
        if !current && self.fetch.outstanding.is_none() {
            self.start_fetch();
        }
    }

    fn on_subscription_closed(&mut self, generation: u64, reason: String) {
        if generation != self.generation {
            return;
        }

        warn!(reason = %reason, "Push subscription closed, keeping last view");
        self.subscribed = false;
        self.subscription = None;
        self.set_error(SyncError::Subscription { message: reason });

        let delay = self.resubscribe_delay;
        let loopback = self.loopback.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            send(&loopback, Command::Resubscribe { generation }).await;
        });
    }

    /// Recompute the active key from selection and parameters; on change,
    /// drop interest in the old key, fetch, and resubscribe.
    fn rekey(&mut self) {
        let key = match QueryKey::new(self.catalog.selected(), &self.params) {
            Ok(key) => key,
            Err(e) => {
                // Parameters were validated on entry
                warn!(error = %e, "Could not derive query key");
                return;
            }
        };
        if key == self.active {
            return;
        }

        info!(from = %self.active, to = %key, "Active query changed");
        self.active = key;
        self.key_tx.send_replace(self.active.clone());

        self.fetch.outstanding = None;
        self.fetch.stale = false;
        self.start_fetch();
        self.open_subscription();
    }

    fn request_fetch(&mut self) {
        if self.fetch.outstanding.is_some() {
            debug!(key = %self.active, "Fetch already running, marking view stale");
            self.fetch.stale = true;
            return;
        }
        self.start_fetch();
    }

    fn start_fetch(&mut self) {
        self.fetch.next_ticket += 1;
        let ticket = self.fetch.next_ticket;
        self.fetch.outstanding = Some(ticket);
        self.fetch.stale = false;

        let key = self.active.clone();
        let repository = self.repository.clone();
        let loopback = self.loopback.clone();
        debug!(key = %key, ticket, "Issuing aggregate fetch");

        tokio::spawn(async move {
            let result = repository.fetch_aggregate(&key).await;
            send(&loopback, Command::FetchCompleted { key, ticket, result }).await;
        });
    }

    fn request_catalog_refresh(&mut self, waiter: Option<Reply<CatalogSnapshot>>) {
        if self.catalog_refresh.in_flight {
            self.catalog_refresh.again = true;
            self.catalog_refresh.queued.extend(waiter);
            return;
        }
        self.catalog_refresh.waiters.extend(waiter);
        self.start_catalog_refresh();
    }

    fn start_catalog_refresh(&mut self) {
        self.catalog_refresh.in_flight = true;

        let repository = self.repository.clone();
        let loopback = self.loopback.clone();
        tokio::spawn(async move {
            let result = repository.fetch_metric_names().await;
            send(&loopback, Command::CatalogFetched { result }).await;
        });
    }

    fn open_subscription(&mut self) {
        if let Some(task) = self.subscription.take() {
            task.abort();
        }
        self.generation += 1;

        let generation = self.generation;
        let key = self.active.clone();
        let channel = self.channel.clone();
        let loopback = self.loopback.clone();

        self.subscription = Some(tokio::spawn(async move {
            let reason = match channel.subscribe(&key).await {
                Ok(mut stream) => {
                    if !send(&loopback, Command::SubscriptionOpened { generation }).await {
                        return;
                    }
                    loop {
                        match stream.next().await {
                            Some(Ok(frame)) => {
                                if !send(&loopback, Command::Push(frame)).await {
                                    return;
                                }
                            }
                            Some(Err(e)) => break format!("{:#}", e),
                            None => break "push stream ended".to_string(),
                        }
                    }
                }
                Err(e) => format!("{:#}", e),
            };
            send(&loopback, Command::SubscriptionClosed { generation, reason }).await;
        }));
    }

    fn replace_view(&mut self, key: QueryKey, series: Series) {
        let view = ViewState::new(key, series);
        self.view_tx.send_if_modified(|current| {
            if current.as_ref() == Some(&view) {
                return false;
            }
            *current = Some(view);
            true
        });
    }

    fn publish_catalog(&self) {
        self.catalog_tx.send_replace(self.catalog.snapshot());
    }

    fn publish_phase(&self) {
        let phase = if !self.subscribed {
            SyncPhase::Idle
        } else if self.fetch.outstanding.is_some() {
            SyncPhase::Refetching
        } else {
            SyncPhase::Syncing
        };
        self.phase_tx.send_if_modified(|current| {
            if *current == phase {
                return false;
            }
            *current = phase;
            true
        });
    }

    fn set_error(&self, err: SyncError) {
        self.error_tx.send_replace(Some(err));
    }

    fn clear_error(&self, kind: impl Fn(&SyncError) -> bool) {
        self.error_tx.send_if_modified(|current| {
            if current.as_ref().is_some_and(&kind) {
                *current = None;
                return true;
            }
            false
        });
    }
}

/// Deliver a command from a worker task. False once the synchronizer is gone.
async fn send(loopback: &mpsc::WeakSender<Command>, command: Command) -> bool {
    match loopback.upgrade() {
        Some(tx) => tx.send(command).await.is_ok(),
        None => false,
    }
}

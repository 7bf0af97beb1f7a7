use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use futures::StreamExt;
use metrics_sync::application::metrics_repository::MetricsRepository;
use metrics_sync::application::push_channel::{PushChannel, PushFrame, PushStream};
use metrics_sync::application::synchronizer::{
    SyncError, SyncPhase, Synchronizer, SynchronizerHandle, SynchronizerOptions,
};
use metrics_sync::domain::error::{LogPointError, MalformedEvent};
use metrics_sync::domain::event::PushEvent;
use metrics_sync::domain::metric_point::MetricPoint;
use metrics_sync::domain::query_key::{Interval, QueryKey, QueryParams};
use metrics_sync::domain::series::{AggregatePoint, Series};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

type FetchReply = oneshot::Sender<anyhow::Result<Series>>;
type FrameSender = mpsc::UnboundedSender<anyhow::Result<PushFrame>>;

/// Aggregate fetches are parked until the test answers them.
struct FakeRepository {
    fetches: mpsc::UnboundedSender<(QueryKey, FetchReply)>,
    names: Mutex<Option<Vec<String>>>,
    names_calls: watch::Sender<usize>,
    logged: Mutex<Vec<MetricPoint>>,
    log_fails: AtomicBool,
}

#[async_trait]
impl MetricsRepository for FakeRepository {
    async fn fetch_aggregate(&self, key: &QueryKey) -> anyhow::Result<Series> {
        let (reply, rx) = oneshot::channel();
        self.fetches
            .send((key.clone(), reply))
            .map_err(|_| anyhow::anyhow!("test harness gone"))?;
        rx.await.map_err(|_| anyhow::anyhow!("fetch abandoned"))?
    }

    async fn fetch_metric_names(&self) -> anyhow::Result<Vec<String>> {
        self.names_calls.send_modify(|n| *n += 1);
        self.names
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("names endpoint down"))
    }

    async fn log_metric_point(&self, point: &MetricPoint) -> anyhow::Result<()> {
        if self.log_fails.load(Ordering::SeqCst) {
            anyhow::bail!("backend returned 500");
        }
        self.logged.lock().unwrap().push(point.clone());
        Ok(())
    }
}

/// Every subscription hands its frame sender to the test.
struct FakeChannel {
    subscriptions: mpsc::UnboundedSender<(QueryKey, FrameSender)>,
}

#[async_trait]
impl PushChannel for FakeChannel {
    async fn subscribe(&self, key: &QueryKey) -> anyhow::Result<PushStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions
            .send((key.clone(), tx))
            .map_err(|_| anyhow::anyhow!("test harness gone"))?;
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

struct Harness {
    handle: SynchronizerHandle,
    repo: Arc<FakeRepository>,
    fetches: mpsc::UnboundedReceiver<(QueryKey, FetchReply)>,
    subscriptions: mpsc::UnboundedReceiver<(QueryKey, FrameSender)>,
    names_calls: watch::Receiver<usize>,
}

async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(2), future)
        .await
        .expect("timed out waiting for synchronizer")
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn series(values: &[(&str, f64)]) -> Series {
    Series::new(
        values
            .iter()
            .map(|(bucket, value)| AggregatePoint::new(*bucket, *value))
            .collect(),
    )
    .unwrap()
}

fn point(name: &str, timestamp: chrono::DateTime<Utc>) -> anyhow::Result<PushFrame> {
    Ok(Ok(PushEvent::PointAppended {
        name: name.to_string(),
        value: 1.0,
        timestamp,
    }))
}

fn snapshot(key: &QueryKey, metrics: Series) -> anyhow::Result<PushFrame> {
    Ok(Ok(PushEvent::SnapshotUpdate {
        key: key.encode(),
        metrics,
    }))
}

impl Harness {
    fn start(initial_metric: &str, catalog: &[&str]) -> Harness {
        Self::start_with(initial_metric, catalog, QueryParams::new(Interval::Hour, false))
    }

    fn start_with(initial_metric: &str, catalog: &[&str], params: QueryParams) -> Harness {
        let (fetch_tx, fetches) = mpsc::unbounded_channel();
        let (sub_tx, subscriptions) = mpsc::unbounded_channel();
        let (names_calls_tx, names_calls) = watch::channel(0);

        let repo = Arc::new(FakeRepository {
            fetches: fetch_tx,
            names: Mutex::new(Some(names(catalog))),
            names_calls: names_calls_tx,
            logged: Mutex::new(Vec::new()),
            log_fails: AtomicBool::new(false),
        });
        let channel = Arc::new(FakeChannel {
            subscriptions: sub_tx,
        });

        let options = SynchronizerOptions {
            initial_metric: initial_metric.to_string(),
            initial_params: params,
            queue_capacity: 16,
            resubscribe_delay: Duration::from_millis(200),
        };
        let (handle, _task) = Synchronizer::spawn(repo.clone(), channel, options).unwrap();

        Harness {
            handle,
            repo,
            fetches,
            subscriptions,
            names_calls,
        }
    }

    async fn next_fetch(&mut self) -> (QueryKey, FetchReply) {
        within(self.fetches.recv()).await.expect("fetch channel closed")
    }

    async fn next_subscription(&mut self) -> (QueryKey, FrameSender) {
        within(self.subscriptions.recv())
            .await
            .expect("subscription channel closed")
    }

    async fn wait_names_calls(&mut self, at_least: usize) {
        within(self.names_calls.wait_for(|n| *n >= at_least))
            .await
            .unwrap();
    }

    async fn wait_phase(&self, phase: SyncPhase) {
        let mut rx = self.handle.observer().watch_phase();
        within(rx.wait_for(|p| *p == phase)).await.unwrap();
    }

    async fn wait_view(&self, expected: &Series) {
        let mut rx = self.handle.observer().watch_view();
        within(rx.wait_for(|v| v.as_ref().is_some_and(|v| &v.series == expected)))
            .await
            .unwrap();
    }

    async fn wait_error(&self, pred: impl Fn(&SyncError) -> bool) -> SyncError {
        let mut rx = self.handle.observer().watch_errors();
        let err = within(rx.wait_for(|e| e.as_ref().is_some_and(&pred)))
            .await
            .unwrap();
        err.clone().unwrap()
    }

    /// Answer the initial fetch and wait for a live subscription
    async fn settle(&mut self, initial: Series) -> (QueryKey, FrameSender) {
        let (key, reply) = self.next_fetch().await;
        reply.send(Ok(initial.clone())).unwrap();
        let (_, frames) = self.next_subscription().await;
        self.wait_view(&initial).await;
        self.wait_phase(SyncPhase::Syncing).await;
        (key, frames)
    }

    async fn assert_no_fetch(&mut self) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(self.fetches.try_recv().is_err(), "unexpected aggregate fetch");
    }
}

#[tokio::test]
async fn test_initial_fetch_populates_view() {
    let mut h = Harness::start("signups", &["signups", "logins"]);
    let initial = series(&[("2024-05-01 08:00", 2.0)]);

    let (key, _frames) = h.settle(initial.clone()).await;

    assert_eq!(key.metric_name(), "signups");
    let view = h.handle.observer().current_view().unwrap();
    assert_eq!(view.key, key);
    assert_eq!(view.series, initial);
    assert_eq!(h.handle.observer().current_catalog().selected, "signups");
}

#[tokio::test]
async fn test_point_for_viewed_metric_requeries() {
    let mut h = Harness::start("signups", &["signups", "logins"]);
    let (key, frames) = h.settle(series(&[("a", 1.0)])).await;

    frames.send(point("signups", Utc::now())).unwrap();

    let (requeried, reply) = h.next_fetch().await;
    assert_eq!(requeried, key);
    reply.send(Ok(series(&[("a", 1.0), ("b", 2.0)]))).unwrap();
    h.wait_view(&series(&[("a", 1.0), ("b", 2.0)])).await;
}

#[tokio::test]
async fn test_point_for_other_metric_refreshes_catalog() {
    let mut h = Harness::start("signups", &["signups", "logins"]);
    let (_, frames) = h.settle(series(&[("a", 1.0)])).await;
    h.wait_names_calls(1).await;

    *h.repo.names.lock().unwrap() = Some(names(&["signups", "logins", "checkouts"]));
    frames.send(point("checkouts", Utc::now())).unwrap();

    h.wait_names_calls(2).await;
    let mut catalog = h.handle.observer().watch_catalog();
    within(catalog.wait_for(|c| c.names.contains(&"checkouts".to_string())))
        .await
        .unwrap();
    h.assert_no_fetch().await;
}

#[tokio::test]
async fn test_point_outside_range_refreshes_catalog() {
    let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
    let t1 = t0 + ChronoDuration::days(1);
    let params = QueryParams::new(Interval::Hour, false).with_range(Some(t0), Some(t1));
    let mut h = Harness::start_with("signups", &["signups"], params);
    let (_, frames) = h.settle(series(&[("a", 1.0)])).await;
    h.wait_names_calls(1).await;

    frames
        .send(point("signups", t1 + ChronoDuration::seconds(1)))
        .unwrap();

    h.wait_names_calls(2).await;
    h.assert_no_fetch().await;
}

#[tokio::test]
async fn test_later_snapshot_wins() {
    let mut h = Harness::start("signups", &["signups"]);
    let (key, frames) = h.settle(series(&[("a", 0.0)])).await;

    let s1 = series(&[("a", 1.0)]);
    let s2 = series(&[("a", 2.0)]);
    frames.send(snapshot(&key, s1)).unwrap();
    frames.send(snapshot(&key, s2.clone())).unwrap();

    h.wait_view(&s2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.handle.observer().current_view().unwrap().series, s2);
}

#[tokio::test]
async fn test_repeated_snapshot_is_idempotent() {
    let mut h = Harness::start("signups", &["signups"]);
    let (key, frames) = h.settle(series(&[("a", 0.0)])).await;
    let s1 = series(&[("a", 1.0), ("b", 4.0)]);

    frames.send(snapshot(&key, s1.clone())).unwrap();
    h.wait_view(&s1).await;
    let once = h.handle.observer().current_view();

    let mut view_rx = h.handle.observer().watch_view();
    view_rx.borrow_and_update();
    frames.send(snapshot(&key, s1.clone())).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!view_rx.has_changed().unwrap());
    assert_eq!(h.handle.observer().current_view(), once);
}

#[tokio::test]
async fn test_snapshot_for_other_key_is_ignored() {
    let mut h = Harness::start("signups", &["signups", "logins"]);
    let initial = series(&[("a", 0.0)]);
    let (_, frames) = h.settle(initial.clone()).await;

    let other = QueryKey::new("logins", &QueryParams::new(Interval::Hour, false)).unwrap();
    frames.send(snapshot(&other, series(&[("z", 9.0)]))).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.handle.observer().current_view().unwrap().series, initial);
}

#[tokio::test]
async fn test_result_for_superseded_query_is_discarded() {
    let mut h = Harness::start("signups", &["signups"]);
    let (old_key, old_reply) = h.next_fetch().await;

    let new_params = QueryParams::new(Interval::Day, true);
    let new_key = h.handle.set_query(new_params).await.unwrap();
    assert_ne!(new_key, old_key);
    assert_eq!(h.handle.observer().active_key(), new_key);

    let (fetched_key, new_reply) = h.next_fetch().await;
    assert_eq!(fetched_key, new_key);

    // The slow answer for the abandoned query arrives first
    old_reply.send(Ok(series(&[("old", 1.0)]))).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.handle.observer().current_view().is_none());

    let fresh = series(&[("new", 2.0)]);
    new_reply.send(Ok(fresh.clone())).unwrap();
    h.wait_view(&fresh).await;
    assert_eq!(h.handle.observer().current_view().unwrap().key, new_key);
}

#[tokio::test]
async fn test_query_change_resubscribes_with_new_key() {
    let mut h = Harness::start("signups", &["signups"]);
    let (_, _frames) = h.settle(series(&[("a", 1.0)])).await;

    let new_key = h
        .handle
        .set_query(QueryParams::new(Interval::Minute, false))
        .await
        .unwrap();

    let (subscribed_key, _new_frames) = h.next_subscription().await;
    assert_eq!(subscribed_key, new_key);
    h.wait_phase(SyncPhase::Refetching).await;
}

#[tokio::test]
async fn test_invalid_query_is_rejected_without_side_effects() {
    let mut h = Harness::start("signups", &["signups"]);
    let (key, _frames) = h.settle(series(&[("a", 1.0)])).await;

    let t0 = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();
    let reversed =
        QueryParams::new(Interval::Hour, false).with_range(Some(t0), Some(t0 - ChronoDuration::hours(1)));

    let result = h.handle.set_query(reversed).await;
    assert!(matches!(result, Err(SyncError::InvalidQuery(_))));
    assert_eq!(h.handle.observer().active_key(), key);
    h.assert_no_fetch().await;
}

#[tokio::test]
async fn test_push_during_refetch_then_fetch_result_applies_in_arrival_order() {
    let mut h = Harness::start("signups", &["signups"]);
    let (key, frames) = h.settle(series(&[("a", 0.0)])).await;

    frames.send(point("signups", Utc::now())).unwrap();
    let (_, reply) = h.next_fetch().await;
    h.wait_phase(SyncPhase::Refetching).await;

    let pushed = series(&[("a", 5.0)]);
    frames.send(snapshot(&key, pushed.clone())).unwrap();
    h.wait_view(&pushed).await;

    let fetched = series(&[("a", 4.0)]);
    reply.send(Ok(fetched.clone())).unwrap();
    h.wait_view(&fetched).await;
    h.wait_phase(SyncPhase::Syncing).await;
}

#[tokio::test]
async fn test_requeries_coalesce_while_fetch_outstanding() {
    let mut h = Harness::start("signups", &["signups"]);
    let (_, frames) = h.settle(series(&[("a", 0.0)])).await;

    frames.send(point("signups", Utc::now())).unwrap();
    let (_, first) = h.next_fetch().await;

    for _ in 0..3 {
        frames.send(point("signups", Utc::now())).unwrap();
    }
    h.assert_no_fetch().await;

    first.send(Ok(series(&[("a", 1.0)]))).unwrap();
    let (_, follow_up) = h.next_fetch().await;
    follow_up.send(Ok(series(&[("a", 2.0)]))).unwrap();

    h.wait_view(&series(&[("a", 2.0)])).await;
    h.assert_no_fetch().await;
}

#[tokio::test]
async fn test_fetch_failure_keeps_last_view() {
    let mut h = Harness::start("signups", &["signups"]);
    let initial = series(&[("a", 1.0)]);
    let (_, frames) = h.settle(initial.clone()).await;

    frames.send(point("signups", Utc::now())).unwrap();
    let (_, reply) = h.next_fetch().await;
    reply.send(Err(anyhow::anyhow!("502 from backend"))).unwrap();

    let err = h
        .wait_error(|e| matches!(e, SyncError::AggregateFetch { .. }))
        .await;
    assert!(err.to_string().contains("502 from backend"));
    h.wait_phase(SyncPhase::Syncing).await;
    assert_eq!(h.handle.observer().current_view().unwrap().series, initial);

    // Next event is the retry path
    frames.send(point("signups", Utc::now())).unwrap();
    let (_, retry) = h.next_fetch().await;
    retry.send(Ok(series(&[("a", 3.0)]))).unwrap();
    h.wait_view(&series(&[("a", 3.0)])).await;
    assert!(h.handle.observer().last_error().is_none());
}

#[tokio::test]
async fn test_stale_selection_is_replaced_after_catalog_refresh() {
    let mut h = Harness::start("c", &["a", "b"]);

    let mut catalog = h.handle.observer().watch_catalog();
    within(catalog.wait_for(|c| c.selected == "a")).await.unwrap();

    // The initial fetch was for "c"; the reselection issues one for "a"
    let mut answered_a = false;
    for _ in 0..2 {
        let (key, reply) = h.next_fetch().await;
        if key.metric_name() == "a" {
            reply.send(Ok(series(&[("x", 1.0)]))).unwrap();
            answered_a = true;
        } else {
            reply.send(Ok(series(&[("stale", 1.0)]))).unwrap();
        }
    }
    assert!(answered_a);

    h.wait_view(&series(&[("x", 1.0)])).await;
    assert_eq!(h.handle.observer().active_key().metric_name(), "a");
}

#[tokio::test]
async fn test_empty_catalog_clears_selection() {
    let h = Harness::start("signups", &[]);

    let snapshot = h.handle.refresh_catalog().await.unwrap();
    assert!(snapshot.names.is_empty());
    assert_eq!(snapshot.selected, "");
    assert_eq!(h.handle.observer().active_key().metric_name(), "");
}

#[tokio::test]
async fn test_catalog_refresh_failure_keeps_catalog() {
    let mut h = Harness::start("signups", &["signups", "logins"]);
    h.wait_names_calls(1).await;
    let before = h.handle.refresh_catalog().await.unwrap();

    *h.repo.names.lock().unwrap() = None;
    let result = h.handle.refresh_catalog().await;

    assert!(matches!(result, Err(SyncError::CatalogFetch { .. })));
    assert_eq!(h.handle.observer().current_catalog(), before);
}

#[tokio::test]
async fn test_optimistic_select_changes_query() {
    let mut h = Harness::start("signups", &["signups", "logins"]);
    let (_, _frames) = h.settle(series(&[("a", 1.0)])).await;

    let key = h.handle.select_metric("logins").await.unwrap();
    assert_eq!(key.metric_name(), "logins");
    assert_eq!(h.handle.observer().current_catalog().selected, "logins");

    let (fetched, _reply) = h.next_fetch().await;
    assert_eq!(fetched, key);
}

#[tokio::test]
async fn test_malformed_frame_is_reported_and_skipped() {
    let mut h = Harness::start("signups", &["signups"]);
    let (key, frames) = h.settle(series(&[("a", 1.0)])).await;

    frames
        .send(Ok(Err(MalformedEvent::new("neither shape"))))
        .unwrap();
    let err = h
        .wait_error(|e| matches!(e, SyncError::MalformedEvent(_)))
        .await;
    assert!(err.to_string().contains("neither shape"));

    let next = series(&[("a", 7.0)]);
    frames.send(snapshot(&key, next.clone())).unwrap();
    h.wait_view(&next).await;
}

#[tokio::test]
async fn test_subscription_loss_goes_idle_and_recovers() {
    let mut h = Harness::start("signups", &["signups"]);
    let initial = series(&[("a", 1.0)]);
    let (key, frames) = h.settle(initial.clone()).await;

    frames
        .send(Err(anyhow::anyhow!("connection reset")))
        .unwrap();

    h.wait_phase(SyncPhase::Idle).await;
    let err = h
        .wait_error(|e| matches!(e, SyncError::Subscription { .. }))
        .await;
    assert!(err.to_string().contains("connection reset"));
    assert_eq!(h.handle.observer().current_view().unwrap().series, initial);

    let (resubscribed, new_frames) = h.next_subscription().await;
    assert_eq!(resubscribed, key);
    h.wait_phase(SyncPhase::Syncing).await;
    assert!(h.handle.observer().last_error().is_none());

    let next = series(&[("a", 2.0)]);
    new_frames.send(snapshot(&key, next.clone())).unwrap();
    h.wait_view(&next).await;
}

#[tokio::test]
async fn test_log_metric_validates_before_sending() {
    let h = Harness::start("signups", &["signups"]);

    let result = h.handle.log_metric("  ", "1").await;
    assert!(matches!(result, Err(SyncError::InvalidPoint(LogPointError::EmptyName))));

    let result = h.handle.log_metric("signups", "twelve").await;
    assert!(matches!(
        result,
        Err(SyncError::InvalidPoint(LogPointError::InvalidValue(_)))
    ));
    assert!(h.repo.logged.lock().unwrap().is_empty());

    let point = h.handle.log_metric("signups", "12.5").await.unwrap();
    assert_eq!(point.value, 12.5);
    assert_eq!(h.repo.logged.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_log_metric_failure_is_reported() {
    let h = Harness::start("signups", &["signups"]);
    h.repo.log_fails.store(true, Ordering::SeqCst);

    let result = h.handle.log_metric("signups", "1").await;
    assert!(matches!(result, Err(SyncError::LogPoint { .. })));
    h.wait_error(|e| matches!(e, SyncError::LogPoint { .. })).await;
}

#[tokio::test]
async fn test_handle_reports_closed_after_shutdown() {
    let h = Harness::start("signups", &["signups"]);
    h.handle.shutdown().await;

    let mut phase = h.handle.observer().watch_phase();
    within(phase.wait_for(|p| *p == SyncPhase::Idle)).await.unwrap();

    let mut attempts = 0;
    loop {
        match h.handle.refresh_catalog().await {
            Err(SyncError::Closed) => break,
            _ if attempts < 20 => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            other => panic!("expected Closed, got {:?}", other),
        }
    }
}

//! The bot core: lifecycle state machine and run loop.
//!
//! `Starting` opens the store, registers handlers and subscribes to the event
//! source. `Running` feeds events through per-source lanes into the
//! dispatcher and sends replies. A shutdown signal (or the source closing)
//! moves to `Draining`, which finishes admitted events within the drain
//! deadline and flushes the store. `Stopped` is terminal.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::watch, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    config::Config,
    dispatch::{BotContext, Dispatcher, Handler},
    domain::{Event, HandlerStatus},
    errors::Error,
    handlers,
    ports::EventSource,
    sequencer::{Processor, Sequencer},
    store::{open_with_retry, FileStoreOpener, StoreOpener},
    Result,
};

/// Pause before polling the event source again after it reported an error.
const SOURCE_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Starting,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Default, Debug)]
struct CoreStats {
    received: AtomicU64,
    ok: AtomicU64,
    failed: AtomicU64,
    ignored: AtomicU64,
    delivered: AtomicU64,
    delivery_failed: AtomicU64,
}

/// Counters of a finished run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunReport {
    pub received: u64,
    pub ok: u64,
    pub failed: u64,
    pub ignored: u64,
    pub delivered: u64,
    pub delivery_failed: u64,
    /// Lanes cut off by the drain deadline.
    pub aborted_lanes: usize,
    pub flushed: bool,
}

impl CoreStats {
    fn report(&self) -> RunReport {
        RunReport {
            received: self.received.load(Ordering::Relaxed),
            ok: self.ok.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            delivery_failed: self.delivery_failed.load(Ordering::Relaxed),
            aborted_lanes: 0,
            flushed: false,
        }
    }
}

pub struct BotCoreBuilder {
    cfg: Arc<Config>,
    source: Arc<dyn EventSource>,
    opener: Option<Arc<dyn StoreOpener>>,
    handlers: Vec<(String, Arc<dyn Handler>)>,
}

impl BotCoreBuilder {
    /// Use a custom store instead of the file store at `cfg.data_dir`.
    pub fn store(mut self, opener: impl StoreOpener + 'static) -> Self {
        let opener: Arc<dyn StoreOpener> = Arc::new(opener);
        self.opener = Some(opener);
        self
    }

    /// Queue a handler registration. Later registrations of a kind win.
    pub fn handler(mut self, kind: impl Into<String>, handler: impl Handler + 'static) -> Self {
        let handler: Arc<dyn Handler> = Arc::new(handler);
        self.handlers.push((kind.into(), handler));
        self
    }

    pub fn builtin_handlers(mut self) -> Self {
        self.handlers.extend(
            handlers::builtin()
                .into_iter()
                .map(|(kind, h)| (kind.to_string(), h)),
        );
        self
    }

    pub fn build(self) -> BotCore {
        let opener: Arc<dyn StoreOpener> = match self.opener {
            Some(opener) => opener,
            None => Arc::new(FileStoreOpener::new(
                self.cfg.data_dir.clone(),
                self.cfg.store_timeout,
            )),
        };
        let (state, _) = watch::channel(Lifecycle::Starting);
        BotCore {
            cfg: self.cfg,
            source: self.source,
            opener,
            handlers: self.handlers,
            state,
        }
    }
}

pub struct BotCore {
    cfg: Arc<Config>,
    source: Arc<dyn EventSource>,
    opener: Arc<dyn StoreOpener>,
    handlers: Vec<(String, Arc<dyn Handler>)>,
    state: watch::Sender<Lifecycle>,
}

impl BotCore {
    pub fn builder(cfg: Arc<Config>, source: Arc<dyn EventSource>) -> BotCoreBuilder {
        BotCoreBuilder {
            cfg,
            source,
            opener: None,
            handlers: Vec::new(),
        }
    }

    pub fn state(&self) -> Lifecycle {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn lifecycle(&self) -> watch::Receiver<Lifecycle> {
        self.state.subscribe()
    }

    fn enter(&self, next: Lifecycle) {
        tracing::info!(state = %next, "lifecycle");
        self.state.send_replace(next);
    }

    /// Run until `shutdown` fires or the event source closes.
    ///
    /// Only startup failures are returned as errors; per-event failures are
    /// counted in the report.
    pub async fn run(self, shutdown: CancellationToken) -> Result<RunReport> {
        self.enter(Lifecycle::Starting);

        let store = match open_with_retry(
            self.opener.as_ref(),
            self.cfg.open_retries,
            self.cfg.open_backoff,
        )
        .await
        {
            Ok(store) => store,
            Err(e) => {
                tracing::error!(error = %e, "could not open store");
                self.enter(Lifecycle::Stopped);
                return Err(e);
            }
        };

        let mut dispatcher = Dispatcher::new(self.cfg.handler_timeout);
        for (kind, handler) in &self.handlers {
            dispatcher.register(kind.clone(), handler.clone());
        }

        let subscribed = timeout(self.cfg.reply_timeout, self.source.subscribe())
            .await
            .unwrap_or_else(|_| Err(Error::External("subscribe timed out".to_string())));
        if let Err(e) = subscribed {
            tracing::error!(error = %e, "could not subscribe to event source");
            self.enter(Lifecycle::Stopped);
            return Err(e);
        }

        let stats = Arc::new(CoreStats::default());
        let worker = Arc::new(Worker {
            dispatcher,
            ctx: BotContext::new(self.cfg.clone(), store.clone()),
            source: self.source.clone(),
            stats: stats.clone(),
            reply_timeout: self.cfg.reply_timeout,
        });
        tracing::info!(
            handlers = ?worker.dispatcher.kinds(),
            workers = self.cfg.workers,
            "handlers registered"
        );

        let mut lanes = Sequencer::new(
            worker,
            self.cfg.workers,
            self.cfg.queue_capacity,
            self.cfg.lane_idle,
        );
        self.enter(Lifecycle::Running);

        'ingest: loop {
            // Pull the next event only once the backlog has room for it.
            let slot = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::info!("shutdown requested");
                    break 'ingest;
                }
                slot = lanes.admit() => match slot {
                    Some(slot) => slot,
                    None => break 'ingest,
                },
            };

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::info!("shutdown requested");
                    break 'ingest;
                }
                next = self.source.next_event() => match next {
                    Ok(Some(event)) => {
                        stats.received.fetch_add(1, Ordering::Relaxed);
                        lanes.submit(slot, event);
                    }
                    Ok(None) => {
                        tracing::info!("event source closed");
                        break 'ingest;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "event source error");
                        tokio::select! {
                            _ = shutdown.cancelled() => break 'ingest,
                            _ = tokio::time::sleep(SOURCE_RETRY_DELAY) => {}
                        }
                    }
                },
            }
        }

        self.enter(Lifecycle::Draining);
        let drained = lanes.drain(self.cfg.drain_timeout).await;
        if !drained.completed {
            tracing::warn!(
                aborted_lanes = drained.aborted_lanes,
                "drain deadline reached; abandoning in-flight events"
            );
        }

        let flushed = match store.flush().await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "store flush failed");
                false
            }
        };

        let report = RunReport {
            aborted_lanes: drained.aborted_lanes,
            flushed,
            ..stats.report()
        };
        tracing::info!(?report, "stopped");
        self.enter(Lifecycle::Stopped);
        Ok(report)
    }
}

/// Applies one event: route, then reply.
struct Worker {
    dispatcher: Dispatcher,
    ctx: BotContext,
    source: Arc<dyn EventSource>,
    stats: Arc<CoreStats>,
    reply_timeout: Duration,
}

#[async_trait]
impl Processor for Worker {
    async fn process(&self, event: Event) {
        let span = tracing::info_span!("event", source = %event.source_id, kind = %event.kind);
        async {
            let result = self.dispatcher.route(&self.ctx, &event).await;
            match result.status {
                HandlerStatus::Ok => {
                    self.stats.ok.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("handled");
                }
                HandlerStatus::Ignored => {
                    self.stats.ignored.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("no handler registered; ignored");
                }
                HandlerStatus::Failed => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        error = result.error.as_deref().unwrap_or("unknown"),
                        "handler failed"
                    );
                }
            }

            let Some(reply) = result.reply else {
                return;
            };
            let sent = timeout(self.reply_timeout, self.source.reply(&event.source_id, &reply))
                .await
                .unwrap_or_else(|_| {
                    Err(Error::DeliveryFailed(format!(
                        "reply timed out after {}ms",
                        self.reply_timeout.as_millis()
                    )))
                });
            match sent {
                Ok(()) => {
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.stats.delivery_failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "reply lost");
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dispatch::BotContext,
        domain::{HandlerResult, SourceId},
        source::ChannelSource,
        store::{FileStore, MemoryStore, OpenedStore, Store},
    };
    use serde_json::json;
    use std::path::Path;

    fn test_config(data_dir: &Path) -> Arc<Config> {
        Arc::new(Config {
            data_dir: data_dir.to_path_buf(),
            store_timeout: Duration::from_secs(5),
            open_retries: 2,
            open_backoff: Duration::from_millis(1),
            workers: 4,
            queue_capacity: 64,
            handler_timeout: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(5),
            lane_idle: Duration::from_millis(200),
            leaderboard_size: 5,
        })
    }

    struct Boom;

    #[async_trait]
    impl Handler for Boom {
        async fn handle(&self, _ctx: &BotContext, _event: &Event) -> Result<HandlerResult> {
            Err(Error::Handler("boom".to_string()))
        }
    }

    /// Appends `payload.n` to the list at `<source>:log`, slower for early items.
    struct Append;

    #[async_trait]
    impl Handler for Append {
        async fn handle(&self, ctx: &BotContext, event: &Event) -> Result<HandlerResult> {
            let n = event.payload["n"].as_u64().unwrap_or(0);
            let key = format!("{}:log", event.source_id);
            let mut log = match ctx.store.get(&key).await {
                Ok(r) => r.value.as_array().cloned().unwrap_or_default(),
                Err(e) if e.is_not_found() => Vec::new(),
                Err(e) => return Err(e),
            };
            tokio::time::sleep(Duration::from_millis(5u64.saturating_sub(n))).await;
            log.push(json!(n));
            ctx.store.put(&key, json!(log)).await?;
            Ok(HandlerResult::ok())
        }
    }

    struct Sleepy;

    #[async_trait]
    impl Handler for Sleepy {
        async fn handle(&self, _ctx: &BotContext, _event: &Event) -> Result<HandlerResult> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(HandlerResult::ok())
        }
    }

    /// Takes events from a channel but never finishes a reply.
    struct HungReplies(ChannelSource);

    #[async_trait]
    impl EventSource for HungReplies {
        async fn next_event(&self) -> Result<Option<Event>> {
            self.0.next_event().await
        }

        async fn reply(&self, _source_id: &SourceId, _data: &serde_json::Value) -> Result<()> {
            std::future::pending().await
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn ping_writes_counter_and_replies() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let (tx, source) = ChannelSource::new(16);
        let source = Arc::new(source);

        let core = BotCore::builder(test_config(dir.path()), source.clone())
            .store(OpenedStore(store.clone()))
            .builtin_handlers()
            .build();

        tx.send(Event::new("A", "ping", json!(null))).await.unwrap();
        drop(tx);

        let report = core.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.received, 1);
        assert_eq!(report.ok, 1);
        assert_eq!(report.delivered, 1);
        assert!(report.flushed);

        assert_eq!(source.replies(), vec![(SourceId::from("A"), json!("pong"))]);
        assert_eq!(store.get("count:A").await.unwrap().value, json!(1));
    }

    #[tokio::test]
    async fn unknown_kind_is_ignored_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let (tx, source) = ChannelSource::new(16);
        let source = Arc::new(source);

        let core = BotCore::builder(test_config(dir.path()), source.clone())
            .store(OpenedStore(store.clone()))
            .builtin_handlers()
            .build();

        tx.send(Event::new("A", "unknown", json!({"x": 1})))
            .await
            .unwrap();
        drop(tx);

        let report = core.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.ignored, 1);
        assert!(store.is_empty().await);
        assert!(source.replies().is_empty());
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let (tx, source) = ChannelSource::new(16);
        let source = Arc::new(source);

        let core = BotCore::builder(test_config(dir.path()), source.clone())
            .store(OpenedStore(store.clone()))
            .builtin_handlers()
            .handler("boom", Boom)
            .build();

        tx.send(Event::new("A", "boom", json!(null))).await.unwrap();
        tx.send(Event::new("A", "ping", json!(null))).await.unwrap();
        tx.send(Event::new("B", "ping", json!(null))).await.unwrap();
        drop(tx);

        let report = core.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.ok, 2);
        assert_eq!(store.get("count:A").await.unwrap().value, json!(1));
        assert_eq!(store.get("count:B").await.unwrap().value, json!(1));
    }

    #[tokio::test]
    async fn same_source_effects_commit_in_arrival_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let (tx, source) = ChannelSource::new(64);

        let core = BotCore::builder(test_config(dir.path()), Arc::new(source))
            .store(OpenedStore(store.clone()))
            .handler("append", Append)
            .build();

        for n in 0..10u64 {
            for src in ["A", "B", "C"] {
                tx.send(Event::new(src, "append", json!({ "n": n })))
                    .await
                    .unwrap();
            }
        }
        drop(tx);

        core.run(CancellationToken::new()).await.unwrap();
        let expected: Vec<serde_json::Value> = (0..10u64).map(|n| json!(n)).collect();
        for src in ["A", "B", "C"] {
            let log = store.get(&format!("{src}:log")).await.unwrap().value;
            assert_eq!(log, json!(expected), "order broken for {src}");
        }
    }

    #[tokio::test]
    async fn lost_reply_keeps_committed_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let (tx, source) = ChannelSource::new(16);
        let source = Arc::new(source);
        source.set_fail_replies(true);

        let core = BotCore::builder(test_config(dir.path()), source.clone())
            .store(OpenedStore(store.clone()))
            .builtin_handlers()
            .build();

        tx.send(Event::new("A", "ping", json!(null))).await.unwrap();
        drop(tx);

        let report = core.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.delivery_failed, 1);
        assert_eq!(report.delivered, 0);
        assert_eq!(store.get("count:A").await.unwrap().value, json!(1));
    }

    #[tokio::test]
    async fn shutdown_signal_drains_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let (tx, source) = ChannelSource::new(16);
        let source = Arc::new(source);

        let core = BotCore::builder(test_config(dir.path()), source.clone())
            .store(OpenedStore(store.clone()))
            .builtin_handlers()
            .build();
        let mut states = core.lifecycle();
        let shutdown = CancellationToken::new();
        let run = tokio::spawn(core.run(shutdown.clone()));

        states
            .wait_for(|s| *s == Lifecycle::Running)
            .await
            .unwrap();
        tx.send(Event::new("A", "ping", json!(null))).await.unwrap();
        wait_until(|| source.replies().len() == 1).await;

        shutdown.cancel();
        let report = run.await.unwrap().unwrap();
        assert_eq!(*states.borrow(), Lifecycle::Stopped);
        assert_eq!(report.ok, 1);

        // Nothing is admitted after the stop.
        tx.send(Event::new("A", "ping", json!(null))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(source.replies().len(), 1);
        assert_eq!(store.get("count:A").await.unwrap().value, json!(1));
    }

    #[tokio::test]
    async fn drain_deadline_forces_stop() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Arc::new(Config {
            drain_timeout: Duration::from_millis(50),
            handler_timeout: Duration::from_secs(120),
            ..(*test_config(dir.path())).clone()
        });
        let (tx, source) = ChannelSource::new(16);

        let core = BotCore::builder(cfg, Arc::new(source))
            .store(OpenedStore(Arc::new(MemoryStore::new())))
            .handler("sleep", Sleepy)
            .build();
        let mut states = core.lifecycle();
        let shutdown = CancellationToken::new();
        let run = tokio::spawn(core.run(shutdown.clone()));

        states
            .wait_for(|s| *s == Lifecycle::Running)
            .await
            .unwrap();
        tx.send(Event::new("A", "sleep", json!(null))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        let report = timeout(Duration::from_secs(5), run)
            .await
            .expect("core must stop at the drain deadline")
            .unwrap()
            .unwrap();
        assert_eq!(report.aborted_lanes, 1);
        assert_eq!(report.ok, 0);
    }

    #[tokio::test]
    async fn unopenable_store_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("data");
        std::fs::write(&blocker, b"").unwrap();
        let (_tx, source) = ChannelSource::new(1);

        let core = BotCore::builder(test_config(&blocker), Arc::new(source))
            .builtin_handlers()
            .build();
        let states = core.lifecycle();

        let err = core.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::StorageUnavailable(_)));
        assert!(err.is_fatal());
        assert_eq!(*states.borrow(), Lifecycle::Stopped);
    }

    #[tokio::test]
    async fn restart_preserves_scan_results() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());

        let (tx, source) = ChannelSource::new(64);
        let core = BotCore::builder(cfg.clone(), Arc::new(source))
            .builtin_handlers()
            .build();
        for (src, name) in [("1", "Ann"), ("2", "Bob"), ("1", "Ann"), ("3", "Cid")] {
            let question = json!({"question": "Capital of France?", "answer": "Paris"});
            let answer = json!({"text": "Paris", "name": name});
            for (kind, payload) in [("ask", question), ("answer", answer), ("ping", json!(null))] {
                tx.send(Event::new(src, kind, payload)).await.unwrap();
            }
        }
        drop(tx);
        core.run(CancellationToken::new()).await.unwrap();

        let before = {
            let store: Arc<dyn Store> =
                Arc::new(FileStore::open(dir.path(), cfg.store_timeout).await.unwrap());
            store.scan("").await.unwrap().collect_all().await.unwrap()
        };
        assert_eq!(before.len(), 9);

        let (tx, source) = ChannelSource::new(1);
        drop(tx);
        let core = BotCore::builder(cfg.clone(), Arc::new(source))
            .builtin_handlers()
            .build();
        core.run(CancellationToken::new()).await.unwrap();

        let store: Arc<dyn Store> =
            Arc::new(FileStore::open(dir.path(), cfg.store_timeout).await.unwrap());
        let after = store.scan("").await.unwrap().collect_all().await.unwrap();
        assert_eq!(before, after);
        assert_eq!(
            store.get("score:1").await.unwrap().value,
            json!({"name": "Ann", "score": 2})
        );
    }

    #[tokio::test]
    async fn hung_reply_is_cut_off_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Arc::new(Config {
            reply_timeout: Duration::from_millis(50),
            ..(*test_config(dir.path())).clone()
        });
        let store = Arc::new(MemoryStore::new());
        let (tx, source) = ChannelSource::new(4);

        let core = BotCore::builder(cfg, Arc::new(HungReplies(source)))
            .store(OpenedStore(store.clone()))
            .builtin_handlers()
            .build();

        tx.send(Event::new("A", "ping", json!(null))).await.unwrap();
        drop(tx);

        let report = timeout(Duration::from_secs(5), core.run(CancellationToken::new()))
            .await
            .expect("a hung reply must not hang the core")
            .unwrap();
        assert_eq!(report.delivery_failed, 1);
        assert_eq!(report.delivered, 0);
        assert!(report.flushed);
        assert_eq!(store.get("count:A").await.unwrap().value, json!(1));
    }

    #[tokio::test]
    async fn backlog_limits_events_taken_from_the_source() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Arc::new(Config {
            queue_capacity: 4,
            drain_timeout: Duration::from_millis(50),
            handler_timeout: Duration::from_secs(120),
            ..(*test_config(dir.path())).clone()
        });
        let (tx, source) = ChannelSource::new(200);
        for _ in 0..100 {
            tx.send(Event::new("A", "sleep", json!(null))).await.unwrap();
        }

        let core = BotCore::builder(cfg, Arc::new(source))
            .store(OpenedStore(Arc::new(MemoryStore::new())))
            .handler("sleep", Sleepy)
            .build();
        let mut states = core.lifecycle();
        let shutdown = CancellationToken::new();
        let run = tokio::spawn(core.run(shutdown.clone()));

        states
            .wait_for(|s| *s == Lifecycle::Running)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();

        let report = timeout(Duration::from_secs(5), run)
            .await
            .expect("core must stop at the drain deadline")
            .unwrap()
            .unwrap();
        assert_eq!(report.received, 4);
        assert_eq!(report.aborted_lanes, 1);
        // The rest were never pulled off the source.
        assert_eq!(tx.capacity(), 200 - 96);
    }
}

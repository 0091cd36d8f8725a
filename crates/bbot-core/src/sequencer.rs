//! Per-source sequencing.
//!
//! Every `source_id` gets a lane: a FIFO queue drained by a single task, so
//! events from one origin are applied in arrival order while different
//! origins proceed in parallel. A semaphore bounds how many lanes process at
//! once, and a second one bounds how many events may be queued in total:
//! callers must [`Sequencer::admit`] an event before submitting it, which
//! waits while the backlog is full.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        OwnedSemaphorePermit, Semaphore,
    },
    task::JoinSet,
    time::timeout,
};

use crate::domain::{Event, SourceId};

/// Work applied to each event in a lane.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    async fn process(&self, event: Event);
}

/// A reserved slot in the backlog, held until its event has been processed.
pub struct Admission {
    _slot: OwnedSemaphorePermit,
}

type Queued = (Event, Admission);
type Lanes = Arc<Mutex<HashMap<SourceId, UnboundedSender<Queued>>>>;

fn lock(lanes: &Lanes) -> MutexGuard<'_, HashMap<SourceId, UnboundedSender<Queued>>> {
    lanes.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrainOutcome {
    /// All lanes emptied before the deadline.
    pub completed: bool,
    /// Lanes cut off by the deadline.
    pub aborted_lanes: usize,
}

pub struct Sequencer<P: Processor> {
    processor: Arc<P>,
    lanes: Lanes,
    permits: Arc<Semaphore>,
    backlog: Arc<Semaphore>,
    tasks: JoinSet<()>,
    idle: Duration,
}

impl<P: Processor> Sequencer<P> {
    /// `capacity` caps the number of admitted events not yet processed.
    pub fn new(processor: Arc<P>, workers: usize, capacity: usize, idle: Duration) -> Self {
        Self {
            processor,
            lanes: Arc::new(Mutex::new(HashMap::new())),
            permits: Arc::new(Semaphore::new(workers.max(1))),
            backlog: Arc::new(Semaphore::new(capacity.max(1))),
            tasks: JoinSet::new(),
            idle,
        }
    }

    /// Wait for room in the backlog. `None` once the sequencer is closed.
    pub async fn admit(&self) -> Option<Admission> {
        let slot = self.backlog.clone().acquire_owned().await.ok()?;
        Some(Admission { _slot: slot })
    }

    /// Free backlog slots.
    pub fn available(&self) -> usize {
        self.backlog.available_permits()
    }

    /// Queue `event` behind earlier events from the same source.
    pub fn submit(&mut self, admission: Admission, event: Event) {
        while self.tasks.try_join_next().is_some() {}

        let mut lanes = lock(&self.lanes);
        let queued = match lanes.get(&event.source_id) {
            Some(tx) => match tx.send((event, admission)) {
                Ok(()) => return,
                // Lane task is gone (aborted); start a fresh one.
                Err(mpsc::error::SendError(queued)) => queued,
            },
            None => (event, admission),
        };

        let source = queued.0.source_id.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        // The receiver is alive, so this cannot fail.
        let _ = tx.send(queued);
        lanes.insert(source.clone(), tx);
        drop(lanes);

        tracing::debug!(source = %source, "lane opened");
        self.tasks.spawn(run_lane(
            source,
            rx,
            self.lanes.clone(),
            self.permits.clone(),
            self.processor.clone(),
            self.idle,
        ));
    }

    pub fn active_lanes(&self) -> usize {
        lock(&self.lanes).len()
    }

    /// Close all lanes and wait for queued events to be processed.
    ///
    /// Lanes still running at `deadline` are aborted.
    pub async fn drain(mut self, deadline: Duration) -> DrainOutcome {
        lock(&self.lanes).clear();

        let finished = timeout(deadline, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if finished {
            return DrainOutcome {
                completed: true,
                aborted_lanes: 0,
            };
        }

        let aborted_lanes = self.tasks.len();
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
        DrainOutcome {
            completed: false,
            aborted_lanes,
        }
    }
}

async fn run_lane<P: Processor>(
    source: SourceId,
    mut rx: UnboundedReceiver<Queued>,
    lanes: Lanes,
    permits: Arc<Semaphore>,
    processor: Arc<P>,
    idle: Duration,
) {
    loop {
        let (event, admission) = match timeout(idle, rx.recv()).await {
            Ok(Some(queued)) => queued,
            Ok(None) => break,
            Err(_) => {
                // Retire only if nothing slipped in; `submit` sends under the same lock.
                let mut map = lock(&lanes);
                match rx.try_recv() {
                    Ok(queued) => queued,
                    Err(_) => {
                        map.remove(&source);
                        tracing::debug!(source = %source, "lane retired");
                        break;
                    }
                }
            }
        };

        let Ok(_permit) = permits.acquire().await else {
            break;
        };
        processor.process(event).await;
        drop(admission);
    }
}

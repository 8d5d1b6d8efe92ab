// Resource watcher and worker loop

//! Feeds managed resources into the work queue and drives the reconciler
//!
//! One [`ResourceWatcher`] exists per resource kind. Adds and updates are
//! queued by `namespace/name` key and processed by worker tasks, which
//! always re-fetch the current object. Deletes, including the tombstones of
//! a re-list, bypass the queue and go straight to
//! [`Reconcile::handle_delete`] with the final object state.

use anyhow::Result;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::k8s_client::{Change, ClusterClient, FeedEvent};
use crate::queue::WorkQueue;
use crate::reconciler::{PersistedTunnelIds, Reconcile};
use crate::resource::{split_key, ResourceKind, WatchedResource};

/// Change feed consumer and worker pool for one resource kind
pub struct ResourceWatcher {
    kind: ResourceKind,
    cluster: Arc<dyn ClusterClient>,
    reconciler: Arc<dyn Reconcile>,
    persisted: Arc<PersistedTunnelIds>,
    queue: Arc<WorkQueue<String>>,
    workers: usize,
}

impl ResourceWatcher {
    /// Create a watcher running `workers` worker loops (at least one)
    ///
    /// `persisted` is the set of tunnel ids the reconciler wrote, so the
    /// update those writes cause is not queued again.
    pub fn new(
        kind: ResourceKind,
        cluster: Arc<dyn ClusterClient>,
        reconciler: Arc<dyn Reconcile>,
        persisted: Arc<PersistedTunnelIds>,
        workers: usize,
    ) -> Self {
        Self {
            kind,
            cluster,
            reconciler,
            persisted,
            queue: Arc::new(WorkQueue::new()),
            workers: workers.max(1),
        }
    }

    /// Kind this watcher handles
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Consume `feed` until it ends or `cancel` fires, then stop the workers
    pub async fn run(self: Arc<Self>, mut feed: BoxStream<'static, FeedEvent>, cancel: CancellationToken) {
        log::info!("Starting {} watcher with {} worker(s)", self.kind, self.workers);

        let workers: Vec<_> = (0..self.workers)
            .map(|_| {
                let watcher = Arc::clone(&self);
                tokio::spawn(async move { while watcher.process_next_item().await {} })
            })
            .collect();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = feed.next() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        log::warn!("{} change feed ended", self.kind);
                        break;
                    }
                },
            }
        }
        drop(feed);

        let dropped = self.queue.shut_down().await;
        if dropped > 0 {
            log::info!("Dropped {} pending {} key(s) on shutdown", dropped, self.kind);
        }

        for worker in workers {
            if let Err(e) = worker.await {
                log::error!("{} worker panicked: {}", self.kind, e);
            }
        }
        log::info!("{} watcher stopped", self.kind);
    }

    /// Apply one change feed event
    pub async fn handle_event(&self, event: FeedEvent) {
        match event {
            FeedEvent::Init => log::debug!("{} re-list started", self.kind),
            FeedEvent::InitDone => log::debug!("{} re-list complete", self.kind),
            FeedEvent::InitApply(change) | FeedEvent::Apply(change) => self.on_apply(change).await,
            FeedEvent::Delete(resource) => self.on_delete(resource).await,
        }
    }

    async fn on_apply(&self, change: Change) {
        let Change { current, previous } = change;
        let key = current.key();

        if !current.is_managed() {
            log::trace!("{} {} is not managed, ignoring", self.kind, key);
            return;
        }

        if let Some(previous) = previous.filter(WatchedResource::is_managed) {
            if previous == current {
                log::trace!("{} {}: status-only update, ignoring", self.kind, key);
                return;
            }
            if previous.differs_only_in_tunnel_id(&current)
                && self.persisted.take_matching(&key, current.tunnel_id()).await
            {
                log::trace!("{} {}: own tunnel id write, ignoring", self.kind, key);
                return;
            }
        }

        log::debug!("Queueing {} {}", self.kind, key);
        self.queue.add(key).await;
    }

    async fn on_delete(&self, resource: WatchedResource) {
        let key = resource.key();
        self.persisted.forget(&key).await;

        if !resource.is_managed() {
            return;
        }

        log::info!("{} {} deleted", self.kind, key);
        if let Err(e) = self.reconciler.handle_delete(&resource).await {
            log::error!("delete {} {}: {:#}", self.kind, key, e);
        }
    }

    /// Process one queued key. Returns false once the queue is shut down.
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        match split_key(&key) {
            Ok((namespace, name)) => match self.sync(&namespace, &name).await {
                Ok(()) => self.queue.forget(&key).await,
                Err(e) => {
                    let retries = self.queue.num_requeues(&key).await;
                    log::error!(
                        "reconcile {} {} (retry {}): {:#}",
                        self.kind,
                        key,
                        retries,
                        e
                    );
                    self.queue.add_rate_limited(key.clone()).await;
                }
            },
            Err(e) => {
                log::error!("Dropping {} key: {:#}", self.kind, e);
                self.queue.forget(&key).await;
            }
        }

        self.queue.done(&key).await;
        true
    }

    async fn sync(&self, namespace: &str, name: &str) -> Result<()> {
        match self.cluster.get(self.kind, namespace, name).await? {
            None => {
                log::debug!("{} {}/{} no longer exists", self.kind, namespace, name);
                Ok(())
            }
            Some(resource) if !resource.is_managed() => {
                log::debug!("{} {} is no longer managed", self.kind, resource.key());
                Ok(())
            }
            Some(resource) => self.reconciler.reconcile(&resource).await,
        }
    }
}

//! # Jobs
//!
//! Periodic drivers for the engine's passes: route, push, pull, purge.
//! Every job runs under its cluster lock, so in a multi-server deployment
//! exactly one server performs each pass per tick.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::cluster::actions;
use crate::engine::Engine;
use crate::error::Result;

/// Spawns and owns the periodic job tasks of one engine.
pub struct JobScheduler {
    engine: Arc<Engine>,
    shutdown: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl JobScheduler {
    pub fn new(engine: Arc<Engine>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            engine,
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Clear stale locks from a previous run and spawn the job loops.
    pub async fn start(&self) -> Result<()> {
        self.engine.locks().startup().await?;
        let jobs = self.engine.config().jobs.clone();
        info!(node = self.engine.node_id(), "starting replication jobs");

        let mut handles = self.handles.lock();
        handles.push(self.spawn_loop(actions::ROUTE, jobs.route_interval, |engine| async move {
            engine.route_pass().await.map(|n| n as u64)
        }));
        handles.push(self.spawn_loop(actions::PUSH, jobs.push_interval, |engine| async move {
            engine.push_pass().await
        }));
        handles.push(self.spawn_loop(actions::PULL, jobs.pull_interval, |engine| async move {
            engine.pull_pass().await
        }));
        handles.push(self.spawn_loop(actions::PURGE, jobs.purge_interval, |engine| async move {
            engine.purge_pass().await.map(|s| s.purged)
        }));
        Ok(())
    }

    /// Signal the job loops and wait for them to finish their current tick.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(());
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
        info!(node = self.engine.node_id(), "replication jobs stopped");
    }

    fn spawn_loop<F, Fut>(
        &self,
        action: &'static str,
        interval: std::time::Duration,
        pass: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<Engine>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<u64>> + Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let guarded = engine
                            .locks()
                            .with_lock(action, || pass(Arc::clone(&engine)))
                            .await;
                        match guarded {
                            Ok(Some(n)) if n > 0 => {
                                debug!(job = action, processed = n, "job pass complete");
                            }
                            Ok(_) => {}
                            Err(e) if e.is_retriable() => {
                                warn!(job = action, error = %e, "job pass failed, retrying next tick");
                            }
                            Err(e) => {
                                error!(job = action, error = %e, "job pass failed");
                            }
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }
}

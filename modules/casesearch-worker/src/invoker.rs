// Self-invocation for the worker chain.
//
// A worker link asks for its successor through `WorkerInvoker` and returns
// without waiting. `ChannelInvoker` delivers the request over an unbounded
// channel; `ChainRunner` receives it and runs the next link, so links never
// nest on the stack.

use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{error, info};
use uuid::Uuid;

use casesearch_scraper::PortalSession;

use crate::controller::WorkerController;
use crate::trigger::Trigger;

#[async_trait]
pub trait WorkerInvoker: Send + Sync {
    /// Request one more worker run. Fire-and-forget.
    async fn invoke_worker(&self) -> Result<()>;
}

/// A pending request for a worker run.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub id: Uuid,
    pub requested_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ChannelInvoker {
    tx: mpsc::UnboundedSender<Invocation>,
}

impl ChannelInvoker {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Invocation>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl WorkerInvoker for ChannelInvoker {
    async fn invoke_worker(&self) -> Result<()> {
        let invocation = Invocation {
            id: Uuid::new_v4(),
            requested_at: Utc::now(),
        };
        info!(invocation_id = %invocation.id, "Invoking scraper worker");
        self.tx
            .send(invocation)
            .map_err(|_| anyhow!("worker chain runner has shut down"))
    }
}

/// Runs worker links as their invocations arrive.
pub struct ChainRunner<S> {
    controller: Arc<WorkerController<S>>,
    rx: mpsc::UnboundedReceiver<Invocation>,
}

impl<S: PortalSession + 'static> ChainRunner<S> {
    pub fn new(
        controller: Arc<WorkerController<S>>,
        rx: mpsc::UnboundedReceiver<Invocation>,
    ) -> Self {
        Self { controller, rx }
    }

    /// Process invocations until `shutdown` resolves. A link that errors is
    /// logged; its chain ends there and the liveness record expires on its
    /// own.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Worker chain runner stopping");
                    return;
                }
                invocation = self.rx.recv() => {
                    let Some(invocation) = invocation else {
                        return;
                    };
                    self.run_link(invocation).await;
                }
            }
        }
    }

    /// Process invocations until none are pending. Returns how many links ran.
    pub async fn drain(&mut self) -> usize {
        let mut links = 0;
        while let Ok(invocation) = self.rx.try_recv() {
            self.run_link(invocation).await;
            links += 1;
        }
        links
    }

    async fn run_link(&self, invocation: Invocation) {
        match self.controller.handle(Trigger::Worker).await {
            Ok(decision) => {
                info!(invocation_id = %invocation.id, ?decision, "Worker link finished")
            }
            Err(e) => {
                error!(invocation_id = %invocation.id, error = %e, "Worker link failed")
            }
        }
    }
}

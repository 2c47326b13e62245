//! Worker lifecycle: liveness lease, chain start/continue/end, self-invocation.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::mpsc;

use casesearch_common::{LivenessRecord, WORKER_LIVENESS_KEY};
use casesearch_scraper::testing::{
    test_scraper_config, MemoryCaseStore, MemoryFailureLog, MemoryLiveness, MemoryPageStore,
    MemoryQueue, ScriptedSession, ScriptedSessionFactory,
};
use casesearch_scraper::{DeletePermanentFailures, Harness, Scraper};
use casesearch_worker::{
    ChainRunner, ChannelInvoker, Decision, Invocation, Trigger, WorkerConfig, WorkerController,
};

const ALARM: &str = "scraper-queue-alarm";

struct Rig {
    queue: Arc<MemoryQueue>,
    liveness: Arc<MemoryLiveness>,
    pages: Arc<MemoryPageStore>,
    controller: Arc<WorkerController<ScriptedSession>>,
    rx: mpsc::UnboundedReceiver<Invocation>,
}

impl Rig {
    fn invocations(&mut self) -> usize {
        let mut n = 0;
        while self.rx.try_recv().is_ok() {
            n += 1;
        }
        n
    }

    fn runner(self) -> (ChainRunner<ScriptedSession>, Arc<MemoryQueue>, Arc<MemoryLiveness>) {
        (
            ChainRunner::new(self.controller, self.rx),
            self.queue,
            self.liveness,
        )
    }
}

async fn rig_with(
    queue: MemoryQueue,
    liveness: MemoryLiveness,
    factory: ScriptedSessionFactory,
    concurrency: usize,
) -> Rig {
    let queue = Arc::new(queue);
    let liveness = Arc::new(liveness);
    let pages = Arc::new(MemoryPageStore::new());
    let scraper = Arc::new(Scraper::new(
        test_scraper_config(1, 1),
        pages.clone(),
        Arc::new(MemoryCaseStore::new()),
        Arc::new(MemoryFailureLog::new()),
    ));
    let harness = Harness::create(scraper, &factory, 3)
        .await
        .unwrap()
        .with_error_hook(Arc::new(DeletePermanentFailures));
    let (invoker, rx) = ChannelInvoker::new();
    let controller = Arc::new(WorkerController::new(
        Arc::new(harness),
        queue.clone(),
        liveness.clone(),
        Arc::new(invoker),
        WorkerConfig {
            default_concurrency: concurrency,
            liveness_ttl: Duration::minutes(15),
            alarm_name: ALARM.to_string(),
        },
    ));
    Rig {
        queue,
        liveness,
        pages,
        controller,
        rx,
    }
}

async fn rig(queue: MemoryQueue, liveness: MemoryLiveness) -> Rig {
    rig_with(queue, liveness, ScriptedSessionFactory::new(), 10).await
}

fn cases(n: usize) -> MemoryQueue {
    let numbers: Vec<String> = (0..n).map(|i| format!("24-C-21-{i:06}")).collect();
    MemoryQueue::new().with_cases(numbers.iter().map(String::as_str))
}

#[tokio::test]
async fn tick_on_empty_queue_does_nothing() {
    let mut rig = rig(MemoryQueue::new(), MemoryLiveness::new()).await;

    let decision = rig.controller.handle(Trigger::Scheduled).await.unwrap();

    assert_eq!(decision, Decision::QueueEmpty);
    assert_eq!(rig.invocations(), 0);
    assert!(rig.liveness.current(WORKER_LIVENESS_KEY).is_none());
}

#[tokio::test]
async fn tick_with_work_and_no_chain_starts_one() {
    let mut rig = rig(cases(3), MemoryLiveness::new()).await;

    let decision = rig.controller.handle(Trigger::Scheduled).await.unwrap();

    assert_eq!(decision, Decision::ChainStarted);
    assert_eq!(rig.invocations(), 1);
    assert!(rig.liveness.current(WORKER_LIVENESS_KEY).is_some());
    // Starting a chain scrapes nothing itself.
    assert_eq!(rig.queue.remaining(), 3);
}

#[tokio::test]
async fn live_chain_blocks_a_second_one() {
    let fresh = LivenessRecord::worker(Utc::now() - Duration::minutes(5));
    let mut rig = rig(cases(3), MemoryLiveness::new().with_record(fresh.clone())).await;

    let decision = rig.controller.handle(Trigger::Scheduled).await.unwrap();

    assert_eq!(decision, Decision::ChainAlive);
    assert_eq!(rig.invocations(), 0);
    assert_eq!(rig.liveness.current(WORKER_LIVENESS_KEY), Some(fresh));
}

#[tokio::test]
async fn expired_liveness_record_is_replaced() {
    // Written at T; now is T + TTL + 1 minute.
    let stale = LivenessRecord::worker(Utc::now() - Duration::minutes(16));
    let mut rig = rig(cases(3), MemoryLiveness::new().with_record(stale.clone())).await;

    let decision = rig.controller.handle(Trigger::Scheduled).await.unwrap();

    assert_eq!(decision, Decision::ChainStarted);
    assert_eq!(rig.invocations(), 1);
    let current = rig.liveness.current(WORKER_LIVENESS_KEY).unwrap();
    assert!(current.invoked_at > stale.invoked_at);
}

#[tokio::test]
async fn alarm_with_configured_name_starts_chain() {
    let mut rig = rig(cases(1), MemoryLiveness::new()).await;

    let decision = rig
        .controller
        .handle(Trigger::Alarm {
            name: ALARM.to_string(),
        })
        .await
        .unwrap();

    assert_eq!(decision, Decision::ChainStarted);
    assert_eq!(rig.invocations(), 1);
}

#[tokio::test]
async fn alarm_with_other_name_is_rejected() {
    let mut rig = rig(cases(1), MemoryLiveness::new()).await;

    let err = rig
        .controller
        .handle(Trigger::Alarm {
            name: "billing-alarm".to_string(),
        })
        .await
        .unwrap_err();

    assert!(err.to_string().contains("billing-alarm"));
    assert_eq!(rig.invocations(), 0);
    assert!(rig.liveness.current(WORKER_LIVENESS_KEY).is_none());
}

#[tokio::test]
async fn worker_scrapes_one_batch_and_invokes_successor() {
    let mut rig = rig_with(cases(7), MemoryLiveness::new(), ScriptedSessionFactory::new(), 5).await;

    let decision = rig.controller.handle(Trigger::Worker).await.unwrap();

    assert_eq!(
        decision,
        Decision::ChainContinued {
            total: 5,
            succeeded: 5
        }
    );
    assert_eq!(rig.queue.remaining(), 2);
    assert_eq!(rig.invocations(), 1);
    assert!(rig.liveness.current(WORKER_LIVENESS_KEY).is_some());
}

#[tokio::test]
async fn worker_on_empty_queue_ends_chain() {
    let record = LivenessRecord::worker(Utc::now());
    let mut rig = rig(MemoryQueue::new(), MemoryLiveness::new().with_record(record)).await;

    let decision = rig.controller.handle(Trigger::Worker).await.unwrap();

    assert_eq!(decision, Decision::ChainEnded);
    assert_eq!(rig.invocations(), 0);
    assert!(rig.liveness.current(WORKER_LIVENESS_KEY).is_none());
}

#[tokio::test]
async fn all_failed_batch_keeps_chain_going() {
    let bad = "24-C-21-000000";
    let factory = ScriptedSessionFactory::new().respond(bad, 500, "Internal Server Error");
    let mut rig = rig_with(cases(1), MemoryLiveness::new(), factory, 10).await;

    let decision = rig.controller.handle(Trigger::Worker).await.unwrap();

    assert_eq!(
        decision,
        Decision::ChainContinued {
            total: 1,
            succeeded: 0
        }
    );
    assert_eq!(rig.invocations(), 1);
    // Permanent failure was acknowledged, so the next link ends the chain.
    assert_eq!(rig.queue.remaining(), 0);
    assert_eq!(
        rig.controller.handle(Trigger::Worker).await.unwrap(),
        Decision::ChainEnded
    );
}

#[tokio::test]
async fn chain_runs_until_queue_is_drained() {
    let rig = rig_with(cases(25), MemoryLiveness::new(), ScriptedSessionFactory::new(), 10).await;
    let pages = rig.pages.clone();
    let controller = rig.controller.clone();
    let (mut runner, queue, liveness) = rig.runner();

    assert_eq!(
        controller.handle(Trigger::Scheduled).await.unwrap(),
        Decision::ChainStarted
    );
    let links = runner.drain().await;

    // Three batches of at most ten, then one link that finds nothing.
    assert_eq!(links, 4);
    assert_eq!(queue.remaining(), 0);
    assert!(liveness.current(WORKER_LIVENESS_KEY).is_none());
    assert_eq!(pages.versions("24-C-21-000024").len(), 1);
}

#[tokio::test]
async fn malformed_message_does_not_restart_the_chain() {
    let queue = MemoryQueue::new();
    queue.push_raw("not json");
    let rig = rig(queue, MemoryLiveness::new()).await;
    let controller = rig.controller.clone();
    let (mut runner, queue, liveness) = rig.runner();

    assert_eq!(
        controller.handle(Trigger::Scheduled).await.unwrap(),
        Decision::ChainStarted
    );
    runner.drain().await;
    queue.release_hidden();

    assert_eq!(queue.remaining(), 0);
    assert!(liveness.current(WORKER_LIVENESS_KEY).is_none());
    assert_eq!(
        controller.handle(Trigger::Scheduled).await.unwrap(),
        Decision::QueueEmpty
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chain_runner_runs_as_a_spawned_task() {
    let rig = rig_with(cases(12), MemoryLiveness::new(), ScriptedSessionFactory::new(), 5).await;
    let controller = rig.controller.clone();
    let (runner, queue, liveness) = rig.runner();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

    let task = tokio::spawn(runner.run(async {
        stop_rx.await.ok();
    }));

    assert_eq!(
        controller.handle(Trigger::Scheduled).await.unwrap(),
        Decision::ChainStarted
    );
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while liveness.current(WORKER_LIVENESS_KEY).is_some() {
        assert!(tokio::time::Instant::now() < deadline, "chain never ended");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    stop_tx.send(()).unwrap();
    task.await.unwrap();

    assert_eq!(queue.remaining(), 0);
}

use tracing::{error, info, warn};

use switchyard_events::Broker;

use super::{Assignment, ConsumerDispatcher, DispatchError};
use crate::idempotency::IdempotencyStore;
use crate::workers::{WorkerHandle, shutdown_requested, sleep_or_shutdown};

/// Running dispatcher workers, one per assigned partition.
#[derive(Debug, Default)]
pub struct DispatcherHandle {
    workers: Vec<WorkerHandle>,
}

impl DispatcherHandle {
    pub(super) fn push(&mut self, worker: WorkerHandle) {
        self.workers.push(worker);
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Signal every worker, then wait for all of them. A worker finishes its
    /// current batch before it stops.
    pub fn shutdown(self) {
        for worker in &self.workers {
            worker.signal();
        }
        for worker in self.workers {
            worker.join();
        }
    }
}

pub(super) fn spawn_partition_worker<B, S>(
    dispatcher: ConsumerDispatcher<B, S>,
    assignment: Assignment,
) -> std::io::Result<WorkerHandle>
where
    B: Broker + 'static,
    S: IdempotencyStore + 'static,
{
    let name = format!(
        "switchyard-{}-{}-{}",
        dispatcher.config().consumer_group,
        assignment.channel,
        assignment.partition
    );

    WorkerHandle::spawn(name, move |shutdown| {
        let poll_interval = dispatcher.config().poll_interval;
        info!(
            channel = %assignment.channel,
            partition = assignment.partition,
            "partition worker started"
        );

        while !shutdown_requested(&shutdown) {
            let idle = match dispatcher.poll_partition(&assignment) {
                Ok(handled) => handled == 0,
                Err(DispatchError::Fetch(e)) => {
                    warn!(
                        channel = %assignment.channel,
                        partition = assignment.partition,
                        error = %e,
                        "fetch failed"
                    );
                    true
                }
                Err(e) => {
                    // The failed delivery stays uncommitted; back off and re-fetch it.
                    error!(
                        channel = %assignment.channel,
                        partition = assignment.partition,
                        error = %e,
                        "delivery not committed"
                    );
                    true
                }
            };

            if idle && sleep_or_shutdown(&shutdown, poll_interval) {
                break;
            }
        }

        info!(
            channel = %assignment.channel,
            partition = assignment.partition,
            "partition worker stopped"
        );
    })
}

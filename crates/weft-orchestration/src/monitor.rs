//! Periodic message-queue scan.
//!
//! A single background worker started once at server boot. Each tick it
//! asks the queue which agents have pending messages, wakes the matching
//! tracked loops, and auto-spawns a reply loop for namespaced agents nobody
//! is tracking yet. Agents without a `:` in their id and without a tracked
//! loop are ignored; their messages wait for an explicit consumer.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use weft_comms::MessageQueue;

use crate::{CoordinatorRuntime, MONITOR_TICK};

/// Handle to the running monitor worker.
pub struct QueueMonitor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl QueueMonitor {
    /// Start the monitor. `shutdown` is the server's root token; stopping
    /// the monitor also tears the coordinator runtime down.
    pub fn start(
        queue: Arc<MessageQueue>,
        runtime: CoordinatorRuntime,
        shutdown: &CancellationToken,
    ) -> Self {
        let cancel = shutdown.child_token();
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(MONITOR_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    _ = tick.tick() => {
                        Self::scan(&queue, &runtime).await;
                    }
                }
            }
            // Monitor shutdown cancels every tracked context, unregisters
            // the notification channels, and clears the workflow map.
            runtime.shutdown_all();
            info!("queue monitor stopped");
        });
        Self { cancel, handle }
    }

    async fn scan(queue: &Arc<MessageQueue>, runtime: &CoordinatorRuntime) {
        for agent_id in queue.agents_with_pending_messages() {
            if runtime.signal_agent(&agent_id) {
                continue;
            }
            if agent_id.contains(':') {
                // A workflow registered after startup whose messages arrived
                // before its coordinator connected.
                if let Err(err) = runtime.auto_spawn(&agent_id).await {
                    warn!(agent = %agent_id, error = %err, "auto-spawn failed");
                }
            } else {
                trace!(agent = %agent_id, "pending messages for untracked agent");
            }
        }
    }

    /// Stop the monitor and wait for its final cleanup pass.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockAgentBuilder, MockDirectory};
    use crate::PENDING_MESSAGES_PROMPT;
    use std::time::Duration;
    use weft_runtime::ConcurrencyGovernor;
    use weft_store_memory::MemorySessionStore;
    use weft_types::MessagePayload;

    fn runtime_with(directory: Arc<MockDirectory>, queue: Arc<MessageQueue>) -> CoordinatorRuntime {
        CoordinatorRuntime::new(
            queue,
            Arc::new(ConcurrencyGovernor::new(5)),
            directory,
            Arc::new(MemorySessionStore::new()),
            CancellationToken::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_spawn_within_two_ticks() {
        let directory = Arc::new(MockDirectory::new());
        let worker = MockAgentBuilder::new("wflow:alpha").build();
        directory.add(worker.clone());

        let queue = Arc::new(MessageQueue::new());
        let runtime = runtime_with(directory, queue.clone());
        let shutdown = CancellationToken::new();
        let monitor = QueueMonitor::start(queue.clone(), runtime.clone(), &shutdown);

        // No coordinator running; a message shows up for a namespaced agent.
        queue
            .send("someone", "wflow:alpha", "task", MessagePayload::text("go"), Default::default())
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(runtime.has_context("auto:wflow:alpha"));

        // The reply loop got signalled and processed the pending-messages prompt.
        for _ in 0..200 {
            if worker.chat_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(worker.chats().lock().unwrap()[0].1, PENDING_MESSAGES_PROMPT);

        monitor.stop().await;
        assert_eq!(runtime.tracked_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_plain_agent_ids_are_ignored() {
        let directory = Arc::new(MockDirectory::new());
        let queue = Arc::new(MessageQueue::new());
        let runtime = runtime_with(directory, queue.clone());
        let shutdown = CancellationToken::new();
        let monitor = QueueMonitor::start(queue.clone(), runtime.clone(), &shutdown);

        queue
            .send("someone", "plain", "task", MessagePayload::text("x"), Default::default())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert_eq!(runtime.tracked_count(), 0);
        assert_eq!(queue.pending_count("plain"), 1);
        monitor.stop().await;
    }
}

#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **weft-orchestration** – Coordinator/sub-agent machinery for Weft.
//!
//! This crate hosts the long-lived background workers of the control plane:
//!
//! - **CoordinatorRuntime**: per-session coordinator injection loops and
//!   event-driven sub-agent reply loops, keyed by replaceable composite ids.
//! - **QueueMonitor**: the 1-second scan that wakes tracked agents and
//!   auto-spawns consumers for workflows registered after startup.
//! - **SpawnedAgentManager**: dynamic spawn/despawn driven by agent tool
//!   calls, with auto-subscribe and inactivity-based auto-despawn.
//! - **WorkflowExecutor** and **SchedulerFacade**: bridge patterns and cron
//!   schedules to the external orchestrator and cron engine.
//!
//! Every loop is driven by a `CancellationToken`; a loop's only exit is
//! cancellation. Chat failures are counted per sub-agent and answered with
//! capped exponential backoff, reset on first success.

use std::time::Duration;

pub mod coordinator;
pub mod executor;
pub mod monitor;
pub mod scheduler;
pub mod spawn;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use coordinator::{CoordinatorRuntime, SubAgentContext};
pub use executor::WorkflowExecutor;
pub use monitor::QueueMonitor;
pub use scheduler::SchedulerFacade;
pub use spawn::{SpawnRequest, SpawnResult, SpawnedAgentContext, SpawnedAgentManager};

/// Queue-monitor scan interval.
pub const MONITOR_TICK: Duration = Duration::from_secs(1);

/// Spawned-agent lifecycle check interval.
pub const SPAWN_LIFECYCLE_TICK: Duration = Duration::from_secs(5);

/// Capacity of a coordinator's notify channel.
pub const COORDINATOR_NOTIFY_BUFFER: usize = 10;

/// Capacity of a sub-agent's notify channel.
pub const SUB_AGENT_NOTIFY_BUFFER: usize = 10;

/// Delivery buffer for auto-subscribed topics of a spawned agent.
pub const SPAWN_SUBSCRIBE_BUFFER: usize = 100;

/// Default ceiling on spawned agents per parent session.
pub const DEFAULT_SPAWN_LIMIT: usize = 10;

/// Default inactivity window before a spawned agent is despawned.
pub const DEFAULT_AUTO_DESPAWN: Duration = Duration::from_secs(15 * 60);

/// Per-message chat deadline inside a spawned agent's message loop.
pub const SPAWNED_CHAT_TIMEOUT: Duration = Duration::from_secs(120);

/// Base delay of the reply-loop backoff.
pub const BACKOFF_BASE_SECS: u64 = 1;

/// Ceiling of the reply-loop backoff.
pub const BACKOFF_CAP_SECS: u64 = 32;

/// Prompt injected into a sub-agent when its queue has pending messages.
pub const PENDING_MESSAGES_PROMPT: &str =
    "You have pending messages. Use receive_message to check and process them now.";

/// Backoff delay after `failures` consecutive chat failures:
/// `min(2^(failures-1), 32)` seconds.
pub fn backoff_delay(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(63);
    let secs = BACKOFF_BASE_SECS.saturating_mul(1u64 << exp).min(BACKOFF_CAP_SECS);
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(6), Duration::from_secs(32));
        assert_eq!(backoff_delay(40), Duration::from_secs(32));
    }

    proptest! {
        // The delay doubles per failure until the cap and never overflows.
        #[test]
        fn prop_backoff_capped_and_monotone(failures in 1u32..1000) {
            let delay = backoff_delay(failures);
            prop_assert!(delay.as_secs() >= BACKOFF_BASE_SECS);
            prop_assert!(delay.as_secs() <= BACKOFF_CAP_SECS);
            prop_assert!(backoff_delay(failures + 1) >= delay);
            if failures <= 5 {
                prop_assert_eq!(delay.as_secs(), 1u64 << (failures - 1));
            }
        }
    }
}

use carrot_hutch::transport::memory::{MemoryBroker, QueueStats};
use carrot_hutch::{ConnectionHolder, PoolSizes};
use std::time::Duration;
use uuid::Uuid;

pub fn started_holder(
    connections: usize,
    channels: usize,
) -> (ConnectionHolder<MemoryBroker>, MemoryBroker) {
    let broker = MemoryBroker::new();
    let holder = ConnectionHolder::new(
        broker.clone(),
        PoolSizes {
            connections,
            channels,
            drain_timeout: Duration::from_secs(1),
        },
    );
    holder.start().unwrap();
    (holder, broker)
}

pub fn queue_name() -> String {
    Uuid::new_v4().to_string()
}

/// Poll the stats of `queue` until `condition` holds, panicking after a second.
pub async fn wait_for_stats(
    broker: &MemoryBroker,
    queue: &str,
    condition: impl Fn(&QueueStats) -> bool,
) -> QueueStats {
    for _ in 0..200 {
        if let Some(stats) = broker.queue_stats(queue) {
            if condition(&stats) {
                return stats;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "Queue stats never reached the expected state: {:?}",
        broker.queue_stats(queue)
    );
}

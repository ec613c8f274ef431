//! Periodic maintenance timers
//!
//! Spawns one ticker task per maintenance concern, each feeding a tick event
//! into the logic task. The logic task does the actual work; timers never
//! touch protocol state, so shutdown is just aborting the tickers.

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use meshrelay_core::channel::{Event, EventSender};
use meshrelay_core::config::MeshConfig;

/// Running maintenance timers for one node
pub struct Scheduler {
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Start the retry, dedup-prune, and peer-sweep tickers
    pub fn start(config: &MeshConfig, event_tx: EventSender) -> Self {
        let tasks = vec![
            spawn_ticker(config.relay.retry_interval, event_tx.clone(), || {
                Event::RetryTick
            }),
            spawn_ticker(config.dedup.prune_interval, event_tx.clone(), || {
                Event::DedupPruneTick
            }),
            spawn_ticker(config.dedup.prune_interval, event_tx, || Event::PeerSweepTick),
        ];
        Self { tasks }
    }

    /// Stop all tickers
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_ticker(
    period: core::time::Duration,
    event_tx: EventSender,
    make_event: impl Fn() -> Event + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so a fresh node does
        // not run maintenance before doing any work
        interval.tick().await;
        loop {
            interval.tick().await;
            if event_tx.send(make_event()).await.is_err() {
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshrelay_core::channel::create_channels;
    use meshrelay_core::config::ChannelConfig;
    use core::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_arrive_on_schedule() {
        let mut channels = create_channels(&ChannelConfig::default());
        let mut config = MeshConfig::testing();
        config.relay.retry_interval = Duration::from_millis(50);

        let mut scheduler = Scheduler::start(&config, channels.event_tx.clone());

        tokio::time::advance(Duration::from_millis(60)).await;
        let mut saw_retry = false;
        while let Ok(event) = channels.event_rx.try_recv() {
            if matches!(event, Event::RetryTick) {
                saw_retry = true;
            }
        }
        assert!(saw_retry);

        scheduler.shutdown();
    }
}

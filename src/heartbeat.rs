//! Heartbeat ticker.
//!
//! Runs alongside the shard actor and posts a tick command at the
//! interval advertised by Hello. All heartbeat decisions (ack
//! checking, zombie detection, the actual send) happen on the actor so
//! session state keeps a single owner.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::shard::ShardCommand;

/// Spawn the ticker. The task ends when the shard actor goes away;
/// the actor also aborts it on teardown.
pub(crate) fn spawn_ticker(
    interval: Duration,
    cmd_tx: mpsc::Sender<ShardCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(interval_ms = interval.as_millis() as u64, "heartbeat ticker started");
        let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            timer.tick().await;
            if cmd_tx.send(ShardCommand::HeartbeatTick).await.is_err() {
                return;
            }
        }
    })
}

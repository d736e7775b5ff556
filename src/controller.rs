//! The tick loop driving all running broadcasters.
//!
//! One periodic task serves the whole process, never a timer per
//! broadcaster. Each tick reads the clock once and dispatches that `now`
//! to every registered channel; channels interleave the tick with their
//! queued control commands in FIFO order, so `start`/`stop`/`skip` keep
//! their ordering relative to `emit`.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::clock::MonotonicClock;
use crate::config::StreamConfig;
use crate::registry::Registry;

/// The single periodic driver for all channels in the process.
pub struct Controller {
    cancel: CancellationToken,
    tick_interval_us: u64,
}

impl Controller {
    /// Spawns the tick loop at `stream_interval / 4`.
    #[must_use]
    pub fn spawn(clock: MonotonicClock, registry: Arc<Registry>, config: &StreamConfig) -> Self {
        let tick_interval_us = config.tick_interval_us();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_micros(tick_interval_us));
            // Late ticks fire immediately; broadcasters tolerate arbitrary
            // lateness because `now` comes from the tick, not the timer.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
            log::info!("[Controller] Ticking every {}µs", tick_interval_us);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let now = clock.now();
                        for channel in registry.channels() {
                            channel.tick(now, tick_interval_us);
                        }
                    }
                }
            }
            log::info!("[Controller] Stopped");
        });

        Self {
            cancel,
            tick_interval_us,
        }
    }

    /// The tick period (µs).
    #[must_use]
    pub fn tick_interval_us(&self) -> u64 {
        self.tick_interval_us
    }

    /// Stops the tick loop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

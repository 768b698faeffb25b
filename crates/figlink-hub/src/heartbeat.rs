use crate::registry::{CloseReason, ConnectionHandle, SendOutcome};
use figlink_core::{encode_frame, Envelope, DEFAULT_MAX_FRAME_BYTES};
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub check_interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(30),
            check_interval: Duration::from_secs(1),
        }
    }
}

impl HeartbeatConfig {
    pub fn is_enabled(&self) -> bool {
        !self.ping_interval.is_zero()
            && !self.pong_timeout.is_zero()
            && !self.check_interval.is_zero()
    }
}

/// Last time the peer proved it was alive.
#[derive(Clone, Debug)]
pub struct LivenessClock {
    last_pong: Arc<Mutex<Instant>>,
}

impl Default for LivenessClock {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessClock {
    pub fn new() -> Self {
        Self {
            last_pong: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn touch(&self) {
        let mut last = self.last_pong.lock().unwrap_or_else(PoisonError::into_inner);
        *last = Instant::now();
    }

    pub fn last_pong(&self) -> Instant {
        *self.last_pong.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn elapsed(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_pong())
    }
}

/// Starts the ping/pong-timeout timer pair for one connection.
///
/// Pings go out every `ping_interval`; a separate checker runs every
/// `check_interval` and closes the connection once nothing has refreshed the
/// clock for longer than `pong_timeout`. A pong never resets the ping timer.
/// Returns `None` when heartbeats are disabled.
pub fn spawn_monitor(
    connection_id: String,
    config: HeartbeatConfig,
    handle: ConnectionHandle,
    clock: LivenessClock,
) -> Option<JoinHandle<()>> {
    if !config.is_enabled() {
        return None;
    }
    Some(tokio::spawn(async move {
        let start = Instant::now();
        let mut ping = tokio::time::interval_at(start + config.ping_interval, config.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut check =
            tokio::time::interval_at(start + config.check_interval, config.check_interval);
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    let frame = match encode_frame(&Envelope::ping(), DEFAULT_MAX_FRAME_BYTES) {
                        Ok(value) => value,
                        Err(err) => {
                            warn!(event = "ping_encode_error", connection_id = %connection_id, error = %err);
                            continue;
                        }
                    };
                    match handle.try_send_text(frame) {
                        SendOutcome::Sent => {}
                        SendOutcome::Full => {
                            debug!(event = "ping_skipped", connection_id = %connection_id);
                        }
                        SendOutcome::Closed => {
                            debug!(event = "ping_stopped", connection_id = %connection_id);
                            return;
                        }
                    }
                }
                _ = check.tick() => {
                    let silent_for = clock.elapsed();
                    if silent_for > config.pong_timeout {
                        warn!(
                            event = "heartbeat_timeout",
                            connection_id = %connection_id,
                            silent_ms = silent_for.as_millis() as u64
                        );
                        handle.close(CloseReason::HeartbeatTimeout);
                        return;
                    }
                }
            }
        }
    }))
}

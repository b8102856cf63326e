//! Boot-negotiated node state
//!
//! Registration status, heartbeat interval and clock reference as agreed with
//! the CSMS. The state is one value replaced as a whole: writers swap it in
//! against the version they read, readers take snapshots or subscribe to
//! changes (the heartbeat scheduler does).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::ocpp::types::{BootNotificationResponse, HeartbeatResponse, RegistrationStatus};
use crate::ocpp::Action;
use crate::registry::ResponseHook;

/// Heartbeat intervals below this are raised to it
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Interval used until the CSMS says otherwise
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(300);

/// Registration with the CSMS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// No BootNotification answered on the current connection
    Unregistered,
    Accepted,
    /// CSMS wants the boot retried later
    Pending,
    Rejected,
}

/// Snapshot of the negotiated state
#[derive(Debug, Clone, PartialEq)]
pub struct OperationalState {
    /// Bumped by every successful swap
    pub version: u64,
    pub registration: RegistrationState,
    pub heartbeat_interval: Duration,
    pub heartbeats_enabled: bool,
    /// Boot retry interval requested by a Pending/Rejected answer
    pub retry_interval: Option<Duration>,
    /// CSMS time minus local time
    pub clock_offset: chrono::Duration,
    pub registered_at: Option<DateTime<Utc>>,
    pub last_clock_sync: Option<DateTime<Utc>>,
}

impl Default for OperationalState {
    fn default() -> Self {
        Self {
            version: 0,
            registration: RegistrationState::Unregistered,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeats_enabled: false,
            retry_interval: None,
            clock_offset: chrono::Duration::zero(),
            registered_at: None,
            last_clock_sync: None,
        }
    }
}

impl OperationalState {
    pub fn is_registered(&self) -> bool {
        self.registration == RegistrationState::Accepted
    }
}

fn seconds(value: i32) -> Duration {
    Duration::from_secs(u64::try_from(value).unwrap_or(0))
}

/// Process-wide holder of the [`OperationalState`]
pub struct NodeState {
    tx: watch::Sender<OperationalState>,
    min_heartbeat_interval: Duration,
}

impl Default for NodeState {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeState {
    pub fn new() -> Self {
        Self::with_min_heartbeat_interval(MIN_HEARTBEAT_INTERVAL)
    }

    pub fn with_min_heartbeat_interval(min_heartbeat_interval: Duration) -> Self {
        let (tx, _) = watch::channel(OperationalState::default());
        Self {
            tx,
            min_heartbeat_interval,
        }
    }

    pub fn snapshot(&self) -> OperationalState {
        self.tx.borrow().clone()
    }

    /// Receiver notified on every swap
    pub fn subscribe(&self) -> watch::Receiver<OperationalState> {
        self.tx.subscribe()
    }

    /// Replace the state if it is still at `expected_version`
    ///
    /// On success returns the stored state (with its new version); otherwise
    /// the state that won.
    pub fn compare_and_swap(
        &self,
        expected_version: u64,
        mut next: OperationalState,
    ) -> Result<OperationalState, OperationalState> {
        let swapped = self.tx.send_if_modified(|current| {
            if current.version != expected_version {
                return false;
            }
            next.version = expected_version + 1;
            *current = next.clone();
            true
        });

        if swapped {
            Ok(next)
        } else {
            Err(self.snapshot())
        }
    }

    /// Read-modify-write, retried until the swap lands
    pub fn update(&self, f: impl Fn(&OperationalState) -> OperationalState) -> OperationalState {
        loop {
            let current = self.snapshot();
            match self.compare_and_swap(current.version, f(&current)) {
                Ok(stored) => return stored,
                Err(_) => debug!("Node state changed concurrently, retrying update"),
            }
        }
    }

    /// Apply the CSMS answer to a BootNotification
    pub fn apply_boot_response(&self, response: &BootNotificationResponse) -> OperationalState {
        let min = self.min_heartbeat_interval;

        let stored = self.update(|state| {
            let mut next = state.clone();
            let now = Utc::now();

            match response.status {
                RegistrationStatus::Accepted => {
                    next.registration = RegistrationState::Accepted;
                    next.clock_offset = response.current_time - now;
                    next.last_clock_sync = Some(now);
                    next.heartbeat_interval = seconds(response.interval).max(min);
                    next.heartbeats_enabled = true;
                    next.retry_interval = None;
                    next.registered_at = Some(now);
                }
                RegistrationStatus::Pending => {
                    next.registration = RegistrationState::Pending;
                    next.retry_interval = Some(seconds(response.interval));
                }
                RegistrationStatus::Rejected => {
                    next.registration = RegistrationState::Rejected;
                    next.retry_interval = Some(seconds(response.interval));
                }
            }
            next
        });

        match stored.registration {
            RegistrationState::Accepted => info!(
                "Registered with CSMS, heartbeat interval {:?} (offered {}s)",
                stored.heartbeat_interval, response.interval
            ),
            other => warn!(
                "Boot not accepted ({:?}), retry in {:?}",
                other, stored.retry_interval
            ),
        }
        stored
    }

    /// Refresh the clock reference from a Heartbeat answer
    pub fn apply_heartbeat_response(&self, response: &HeartbeatResponse) -> OperationalState {
        self.update(|state| {
            let mut next = state.clone();
            let now = Utc::now();
            next.clock_offset = response.current_time - now;
            next.last_clock_sync = Some(now);
            next
        })
    }

    /// Forget the registration, e.g. after the uplink dropped
    pub fn mark_disconnected(&self) -> OperationalState {
        self.update(|state| {
            let mut next = state.clone();
            next.registration = RegistrationState::Unregistered;
            next.heartbeats_enabled = false;
            next.registered_at = None;
            next
        })
    }

    /// Current time on the CSMS clock
    pub fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.tx.borrow().clock_offset
    }
}

/// Applies BootNotification answers to the node state
pub struct BootNotificationHook {
    state: Arc<NodeState>,
}

impl BootNotificationHook {
    pub fn new(state: Arc<NodeState>) -> Self {
        Self { state }
    }
}

impl ResponseHook for BootNotificationHook {
    fn on_success(&self, action: Action, payload: &Value) {
        match serde_json::from_value::<BootNotificationResponse>(payload.clone()) {
            Ok(response) => {
                self.state.apply_boot_response(&response);
            }
            Err(e) => warn!("{} response not applied: {}", action, e),
        }
    }
}

/// Refreshes the clock reference from Heartbeat answers
pub struct HeartbeatHook {
    state: Arc<NodeState>,
}

impl HeartbeatHook {
    pub fn new(state: Arc<NodeState>) -> Self {
        Self { state }
    }
}

impl ResponseHook for HeartbeatHook {
    fn on_success(&self, action: Action, payload: &Value) {
        match serde_json::from_value::<HeartbeatResponse>(payload.clone()) {
            Ok(response) => {
                self.state.apply_heartbeat_response(&response);
            }
            Err(e) => warn!("{} response not applied: {}", action, e),
        }
    }
}

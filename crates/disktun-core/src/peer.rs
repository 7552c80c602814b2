//! Peer liveness tracking.
//!
//! The remote peer is never contacted directly: all we can observe is
//! whether its mailbox slot changed since the last poll, and whether our own
//! writes succeed. Two independent state machines turn those observations
//! into a liveness signal:
//!
//! - **Rx** follows what we read. One fresh block is enough to call the link
//!   up, but a peer with nothing to send legitimately leaves its slot
//!   unchanged, so only `threshold` stale reads in a row mark it down.
//! - **Tx** follows what we write. After `threshold - 1` idle ticks it enters
//!   `Idle`, which is the cue for the writer to emit a keepalive. Keepalives
//!   therefore land often enough that the remote reader never sees a full run
//!   of `threshold` stale reads while we are alive.
//!
//! Each tracker is owned and mutated by exactly one pipeline loop.

use crate::config::ConfigError;
use crate::fsm::{Fsm, Transition};
use std::fmt::{self, Display, Formatter};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RxState {
    /// Nothing valid read yet; the slot may still hold garbage
    Init,
    Up,
    Down,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RxEvent {
    ReadError,
    ReadStale,
    ReadNew,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxState {
    Up,
    Idle,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxEvent {
    Written,
    WriteError,
    WriteSkipped,
}

impl RxState {
    pub const ALL: [RxState; 4] = [RxState::Init, RxState::Up, RxState::Down, RxState::Error];

    /// Stable numeric code, used for gauges.
    pub fn code(self) -> u8 {
        match self {
            RxState::Init => 0,
            RxState::Down => 1,
            RxState::Up => 2,
            RxState::Error => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }
}

impl TxState {
    pub const ALL: [TxState; 3] = [TxState::Up, TxState::Idle, TxState::Error];

    /// Stable numeric code, used for gauges.
    pub fn code(self) -> u8 {
        match self {
            TxState::Up => 0,
            TxState::Idle => 1,
            TxState::Error => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }
}

impl Display for RxState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RxState::Init => "init",
            RxState::Up => "up",
            RxState::Down => "down",
            RxState::Error => "error",
        })
    }
}

impl Display for TxState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TxState::Up => "up",
            TxState::Idle => "idle",
            TxState::Error => "error",
        })
    }
}

/// Liveness of the remote peer as seen from our reads.
#[derive(Debug)]
pub struct RxTracker {
    fsm: Fsm<RxState, RxEvent>,
}

impl RxTracker {
    pub fn new(threshold: u32) -> Result<Self, ConfigError> {
        Self::with_observer(threshold, |_, _, _| {})
    }

    /// Create a tracker whose state changes are also reported to `observer`.
    ///
    /// Changes are always logged; the observer is called for every taken
    /// transition, including self-transitions.
    pub fn with_observer(
        threshold: u32,
        mut observer: impl FnMut(RxState, RxState, RxEvent) + Send + 'static,
    ) -> Result<Self, ConfigError> {
        if threshold == 0 {
            return Err(ConfigError::ZeroThreshold);
        }

        let any = RxState::ALL;
        let fsm = Fsm::new(
            RxState::Init,
            vec![
                Transition::new(RxEvent::ReadError, any, RxState::Error),
                Transition::new(RxEvent::ReadStale, any, RxState::Down).min_repeat(threshold),
                Transition::new(RxEvent::ReadNew, any, RxState::Up),
            ],
        )
        .with_observer(move |from, to, event| {
            if from != to {
                info!("peer rx status: {} -> {}", from, to);
            }
            observer(from, to, event);
        });

        Ok(Self { fsm })
    }

    pub fn state(&self) -> RxState {
        self.fsm.state()
    }

    pub fn event(&mut self, event: RxEvent) -> RxState {
        self.fsm.handle(event)
    }
}

/// Liveness of our own writes.
#[derive(Debug)]
pub struct TxTracker {
    fsm: Fsm<TxState, TxEvent>,
}

impl TxTracker {
    pub fn new(threshold: u32) -> Result<Self, ConfigError> {
        Self::with_observer(threshold, |_, _, _| {})
    }

    pub fn with_observer(
        threshold: u32,
        mut observer: impl FnMut(TxState, TxState, TxEvent) + Send + 'static,
    ) -> Result<Self, ConfigError> {
        if threshold == 0 {
            return Err(ConfigError::ZeroThreshold);
        }

        let any = TxState::ALL;
        let fsm = Fsm::new(
            TxState::Up,
            vec![
                Transition::new(TxEvent::Written, any, TxState::Up),
                Transition::new(TxEvent::WriteSkipped, any, TxState::Idle)
                    .min_repeat(threshold - 1),
                Transition::new(TxEvent::WriteError, any, TxState::Error),
            ],
        )
        .with_observer(move |from, to, event| {
            if from != to {
                debug!("peer tx status: {} -> {}", from, to);
            }
            observer(from, to, event);
        });

        Ok(Self { fsm })
    }

    pub fn state(&self) -> TxState {
        self.fsm.state()
    }

    pub fn event(&mut self, event: TxEvent) -> TxState {
        self.fsm.handle(event)
    }
}

/// Both halves of a peer, sharing one staleness threshold.
#[derive(Debug)]
pub struct Peer {
    pub rx: RxTracker,
    pub tx: TxTracker,
}

impl Peer {
    pub fn new(threshold: u32) -> Result<Self, ConfigError> {
        Ok(Self {
            rx: RxTracker::new(threshold)?,
            tx: TxTracker::new(threshold)?,
        })
    }

    /// Build a peer with observers attached to each half.
    pub fn with_observers(
        threshold: u32,
        rx_observer: impl FnMut(RxState, RxState, RxEvent) + Send + 'static,
        tx_observer: impl FnMut(TxState, TxState, TxEvent) + Send + 'static,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            rx: RxTracker::with_observer(threshold, rx_observer)?,
            tx: TxTracker::with_observer(threshold, tx_observer)?,
        })
    }

    /// Split into the halves owned by the disk reader and disk writer.
    pub fn split(self) -> (RxTracker, TxTracker) {
        (self.rx, self.tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    const N: u32 = 5;

    fn rx_up() -> RxTracker {
        let mut rx = RxTracker::new(N).unwrap();
        rx.event(RxEvent::ReadNew);
        assert_eq!(rx.state(), RxState::Up);
        rx
    }

    // ==================== Construction ====================

    #[test]
    fn test_initial_states() {
        let peer = Peer::new(N).unwrap();
        assert_eq!(peer.rx.state(), RxState::Init);
        assert_eq!(peer.tx.state(), TxState::Up);
    }

    #[test]
    fn test_zero_threshold_rejected() {
        assert_eq!(Peer::new(0).unwrap_err(), ConfigError::ZeroThreshold);
        assert!(RxTracker::new(0).is_err());
        assert!(TxTracker::new(0).is_err());
    }

    // ==================== Rx ====================

    #[test]
    fn test_rx_fewer_than_threshold_stale_stays_up() {
        let mut rx = rx_up();
        for _ in 0..N - 1 {
            assert_eq!(rx.event(RxEvent::ReadStale), RxState::Up);
        }
    }

    #[test]
    fn test_rx_threshold_stale_goes_down() {
        let mut rx = rx_up();
        for _ in 0..N - 1 {
            rx.event(RxEvent::ReadStale);
        }
        assert_eq!(rx.event(RxEvent::ReadStale), RxState::Down);
    }

    #[test]
    fn test_rx_new_read_resets_stale_run() {
        let mut rx = rx_up();
        for _ in 0..N - 1 {
            rx.event(RxEvent::ReadStale);
        }
        rx.event(RxEvent::ReadNew);
        for _ in 0..N - 1 {
            assert_eq!(rx.event(RxEvent::ReadStale), RxState::Up);
        }
        assert_eq!(rx.event(RxEvent::ReadStale), RxState::Down);
    }

    #[test]
    fn test_rx_error_is_immediate_and_recoverable() {
        let mut rx = rx_up();
        assert_eq!(rx.event(RxEvent::ReadError), RxState::Error);
        assert_eq!(rx.event(RxEvent::ReadNew), RxState::Up);
    }

    #[test]
    fn test_rx_never_returns_to_init() {
        let mut rx = RxTracker::new(1).unwrap();
        let events = [
            RxEvent::ReadStale,
            RxEvent::ReadError,
            RxEvent::ReadNew,
            RxEvent::ReadStale,
        ];
        for event in events {
            assert_ne!(rx.event(event), RxState::Init);
        }
    }

    #[test]
    fn test_rx_accepts_every_event_in_every_state() {
        let events = [RxEvent::ReadError, RxEvent::ReadStale, RxEvent::ReadNew];
        for first in events {
            for second in events {
                let mut rx = RxTracker::new(1).unwrap();
                rx.event(first);
                rx.event(second);
            }
        }
    }

    // ==================== Tx ====================

    #[test]
    fn test_tx_idle_after_threshold_minus_one_skips() {
        let mut tx = TxTracker::new(N).unwrap();
        for _ in 0..N - 2 {
            assert_eq!(tx.event(TxEvent::WriteSkipped), TxState::Up);
        }
        assert_eq!(tx.event(TxEvent::WriteSkipped), TxState::Idle);
    }

    #[test]
    fn test_tx_written_returns_to_up() {
        let mut tx = TxTracker::new(N).unwrap();
        for _ in 0..N - 1 {
            tx.event(TxEvent::WriteSkipped);
        }
        assert_eq!(tx.state(), TxState::Idle);
        assert_eq!(tx.event(TxEvent::Written), TxState::Up);
    }

    #[test]
    fn test_tx_threshold_one_idles_immediately() {
        let mut tx = TxTracker::new(1).unwrap();
        assert_eq!(tx.event(TxEvent::WriteSkipped), TxState::Idle);
    }

    #[test]
    fn test_tx_write_error() {
        let mut tx = TxTracker::new(N).unwrap();
        assert_eq!(tx.event(TxEvent::WriteError), TxState::Error);
        assert_eq!(tx.event(TxEvent::Written), TxState::Up);
    }

    // ==================== Observers ====================

    #[test]
    fn test_observers_receive_changes() {
        let rx_seen = Arc::new(Mutex::new(Vec::new()));
        let tx_seen = Arc::new(Mutex::new(Vec::new()));
        let rx_log = Arc::clone(&rx_seen);
        let tx_log = Arc::clone(&tx_seen);

        let (mut rx, mut tx) = Peer::with_observers(
            2,
            move |from, to, _| rx_log.lock().unwrap().push((from, to)),
            move |from, to, _| tx_log.lock().unwrap().push((from, to)),
        )
        .unwrap()
        .split();

        rx.event(RxEvent::ReadNew);
        tx.event(TxEvent::WriteSkipped);

        assert_eq!(*rx_seen.lock().unwrap(), vec![(RxState::Init, RxState::Up)]);
        assert_eq!(*tx_seen.lock().unwrap(), vec![(TxState::Up, TxState::Idle)]);
    }

    #[test]
    fn test_state_codes_roundtrip() {
        for state in RxState::ALL {
            assert_eq!(RxState::from_code(state.code()), Some(state));
        }
        for state in TxState::ALL {
            assert_eq!(TxState::from_code(state.code()), Some(state));
        }
        assert_eq!(RxState::from_code(200), None);
    }
}

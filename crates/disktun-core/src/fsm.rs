//! Small table-driven state machine with debounced transitions.
//!
//! Transitions are tried in registration order and the first one whose
//! trigger and source set match is taken. A transition may require the same
//! event to arrive several times in a row before it fires, which gives
//! hysteresis without any timers:
//!
//! ```
//! use disktun_core::fsm::{Fsm, Transition};
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq)]
//! enum Light { On, Off }
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq)]
//! enum Input { Press, Idle }
//!
//! let mut fsm = Fsm::new(
//!     Light::Off,
//!     vec![
//!         Transition::new(Input::Press, [Light::On, Light::Off], Light::On),
//!         Transition::new(Input::Idle, [Light::On, Light::Off], Light::Off).min_repeat(3),
//!     ],
//! );
//!
//! fsm.handle(Input::Press);
//! fsm.handle(Input::Idle);
//! fsm.handle(Input::Idle);
//! assert_eq!(fsm.state(), Light::On);
//! fsm.handle(Input::Idle);
//! assert_eq!(fsm.state(), Light::Off);
//! ```
//!
//! Every state must list every event that can legally reach it. An event
//! with no matching transition is a modeling bug: [`Fsm::handle`] panics on
//! it and [`Fsm::try_handle`] reports it as [`UnmatchedTransition`].

use std::fmt::Debug;
use thiserror::Error;

/// Callback invoked on every taken transition with `(from, to, event)`.
///
/// Self-transitions are reported too; observers that only care about
/// changes should ignore `from == to`.
pub type Observer<S, E> = Box<dyn FnMut(S, S, E) + Send>;

/// Event delivered in a state that has no transition for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("No valid transition for event {event:?} in state {state:?}")]
pub struct UnmatchedTransition<S: Debug, E: Debug> {
    pub state: S,
    pub event: E,
}

/// One row of the transition table.
#[derive(Debug, Clone)]
pub struct Transition<S, E> {
    pub event: E,
    pub sources: Vec<S>,
    pub target: S,
    /// Consecutive deliveries of `event` required before firing (0 and 1 both
    /// mean "fire immediately")
    pub min_repeat: u32,
}

impl<S, E> Transition<S, E> {
    pub fn new(event: E, sources: impl Into<Vec<S>>, target: S) -> Self {
        Self {
            event,
            sources: sources.into(),
            target,
            min_repeat: 0,
        }
    }

    /// Require `count` consecutive identical events before firing.
    pub fn min_repeat(mut self, count: u32) -> Self {
        self.min_repeat = count;
        self
    }
}

pub struct Fsm<S, E> {
    current: S,
    transitions: Vec<Transition<S, E>>,
    observer: Option<Observer<S, E>>,
    last_event: Option<E>,
    repeat: u32,
}

impl<S, E> Fsm<S, E>
where
    S: Copy + Eq + Debug,
    E: Copy + Eq + Debug,
{
    pub fn new(initial: S, transitions: Vec<Transition<S, E>>) -> Self {
        Self {
            current: initial,
            transitions,
            observer: None,
            last_event: None,
            repeat: 0,
        }
    }

    /// Attach an observer, replacing any previous one.
    pub fn with_observer(mut self, observer: impl FnMut(S, S, E) + Send + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn state(&self) -> S {
        self.current
    }

    /// How many times in a row the last event has been delivered.
    pub fn repeat_count(&self) -> u32 {
        self.repeat
    }

    /// Deliver an event and return the resulting state.
    ///
    /// # Panics
    ///
    /// Panics if the current state has no transition for `event`.
    pub fn handle(&mut self, event: E) -> S {
        match self.try_handle(event) {
            Ok(state) => state,
            Err(unmatched) => panic!("{unmatched}"),
        }
    }

    /// Deliver an event, reporting a missing transition instead of panicking.
    ///
    /// A matched transition whose repeat threshold is not reached yet leaves
    /// the state unchanged and does not notify the observer.
    pub fn try_handle(&mut self, event: E) -> Result<S, UnmatchedTransition<S, E>> {
        if self.last_event == Some(event) {
            self.repeat = self.repeat.saturating_add(1);
        } else {
            self.last_event = Some(event);
            self.repeat = 1;
        }

        let current = self.current;
        let (target, min_repeat) = self
            .transitions
            .iter()
            .find(|t| t.event == event && t.sources.contains(&current))
            .map(|t| (t.target, t.min_repeat))
            .ok_or(UnmatchedTransition {
                state: current,
                event,
            })?;

        if self.repeat < min_repeat {
            return Ok(current);
        }

        self.current = target;
        if let Some(observer) = self.observer.as_mut() {
            observer(current, target, event);
        }
        Ok(target)
    }
}

impl<S: Debug, E: Debug> Debug for Fsm<S, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fsm")
            .field("current", &self.current)
            .field("last_event", &self.last_event)
            .field("repeat", &self.repeat)
            .finish_non_exhaustive()
    }
}

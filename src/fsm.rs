//! Finite state machines with static transition tables
//!
//! Each protocol role (server session, room consumer, client) declares its
//! states and events as closed enums and implements [`Transitions`] with an
//! exhaustive `match`. [`StateMachine`] tracks the current state and rejects
//! events the table does not allow.

use std::fmt;

use crate::error::FsmError;

/// A transition table over closed state and event enums
pub trait Transitions {
    type State: Copy + Eq + fmt::Display + fmt::Debug;
    type Event: Copy + Eq + fmt::Display + fmt::Debug;

    /// Starting state
    const INITIAL: Self::State;

    /// Next state for `event` in `state`, or `None` if the pair is invalid
    fn next(state: Self::State, event: Self::Event) -> Option<Self::State>;

    /// Synthetic event that moves a transient state back to a resting one
    fn settle(state: Self::State) -> Option<Self::Event>;
}

/// Current state of one [`Transitions`] table
pub struct StateMachine<T: Transitions> {
    current: T::State,
}

impl<T: Transitions> fmt::Debug for StateMachine<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("current", &self.current)
            .finish()
    }
}

impl<T: Transitions> StateMachine<T> {
    pub fn new() -> Self {
        Self {
            current: T::INITIAL,
        }
    }

    pub fn current(&self) -> T::State {
        self.current
    }

    /// State `event` would lead to, without applying it
    pub fn check(&self, event: T::Event) -> Result<T::State, FsmError> {
        T::next(self.current, event).ok_or_else(|| FsmError {
            state: self.current.to_string(),
            event: event.to_string(),
        })
    }

    /// Apply `event`, returning the new state
    pub fn fire(&mut self, event: T::Event) -> Result<T::State, FsmError> {
        let next = self.check(event)?;
        self.current = next;
        Ok(next)
    }

    /// Fire the synthetic settle event if the current state is transient
    ///
    /// Returns the state reached, or `None` when already at rest.
    pub fn settle(&mut self) -> Option<T::State> {
        let event = T::settle(self.current)?;
        self.fire(event).ok()
    }
}

impl<T: Transitions> Default for StateMachine<T> {
    fn default() -> Self {
        Self::new()
    }
}

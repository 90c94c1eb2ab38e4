//! State machines.
//!
//! Every progress record (trackers, batches, exports) moves through an
//! explicit state type. A state machine is a pure function from the
//! current state and an event to either a new state, a no-op, or an
//! error. Persistence layers turn the same table into a guarded
//! `UPDATE ... WHERE status IN (...)` so that the check and the write
//! happen in one statement.

use std::fmt::Debug;

use crate::error::{FerryError, FerryResult};

/// The result of applying an event to a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition<S> {
    /// The record moves to the contained state.
    ///
    /// The contained state may be equal to the current one (e.g.,
    /// restarting something already started), in which case the
    /// record is still rewritten and its timestamps refreshed.
    Changed(S),

    /// The event re-affirms the current state and nothing is written.
    Unchanged,
}

/// The rows an event may be applied to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guard<S> {
    /// The state every applicable row ends up in.
    pub target: S,

    /// States from which the event changes the row.
    pub from: Vec<S>,

    /// States in which the event is an accepted no-op.
    pub unchanged: Vec<S>,
}

/// A finite state machine over `Self`.
pub trait StateMachine: Sized + Copy + Eq + Debug + Send + Sync + 'static {
    /// Events that drive the machine.
    type Event: Copy + Eq + Debug + Send + Sync + 'static;

    /// Human-readable name of the record kind, for errors.
    const MACHINE: &'static str;

    /// Every state.
    const STATES: &'static [Self];

    /// Applies an event.
    fn transition(self, event: Self::Event) -> FerryResult<Transition<Self>>;

    /// Returns the lowercase name of the state.
    fn name(self) -> &'static str;

    /// Returns the lowercase name of an event.
    fn event_name(event: Self::Event) -> &'static str;

    /// Returns whether no further work happens in this state.
    fn is_terminal(self) -> bool;

    /// Builds the error for an event that is not allowed in this state.
    fn invalid(self, event: Self::Event) -> FerryError {
        FerryError::InvalidTransition {
            machine: Self::MACHINE,
            from: self.name(),
            event: Self::event_name(event),
        }
    }

    /// Computes the guard of an event from the transition table.
    fn guard(event: Self::Event) -> Option<Guard<Self>> {
        let mut target = None;
        let mut from = Vec::new();
        let mut unchanged = Vec::new();

        for state in Self::STATES {
            match state.transition(event) {
                Ok(Transition::Changed(to)) => {
                    debug_assert!(target.is_none() || target == Some(to));
                    target = Some(to);
                    from.push(*state);
                }
                Ok(Transition::Unchanged) => unchanged.push(*state),
                Err(_) => {}
            }
        }

        target.map(|target| Guard {
            target,
            from,
            unchanged,
        })
    }
}

/// Declares a status enum's wire codes.
///
/// Generates `code()` and `from_code()` plus the matching `TryFrom<i16>`
/// and `From<Self> for i16` impls, so the type can be (de)serialized as
/// a bare integer with `#[serde(into = "i16", try_from = "i16")]`.
#[macro_export]
macro_rules! status_codes {
    ($ty:ident, $kind:literal, { $($variant:ident => $code:literal),+ $(,)? }) => {
        impl $ty {
            /// Returns the integer code of this status.
            pub fn code(self) -> i16 {
                match self {
                    $(Self::$variant => $code,)+
                }
            }

            /// Parses an integer status code.
            pub fn from_code(code: i16) -> $crate::error::FerryResult<Self> {
                match code {
                    $($code => Ok(Self::$variant),)+
                    _ => Err($crate::error::FerryError::InvalidStatusCode { kind: $kind, code }),
                }
            }
        }

        impl ::std::convert::TryFrom<i16> for $ty {
            type Error = $crate::error::FerryError;

            fn try_from(code: i16) -> $crate::error::FerryResult<Self> {
                Self::from_code(code)
            }
        }

        impl ::std::convert::From<$ty> for i16 {
            fn from(status: $ty) -> i16 {
                status.code()
            }
        }
    };
}

//! Controller lifecycle modes and the bitmask used to gate queued operations.
//!
//! A device controller is in exactly one [`Mode`] at a time. The normal cycle
//! is `Manual -> TransitioningToBuffered -> Buffered -> TransitioningToManual
//! -> Manual`, with abort paths back to `Manual` from the two armed states.
//! Every queued operation declares a [`ModeSet`] of modes it may execute in;
//! the state queue releases an operation only while the controller's current
//! mode is inside that set.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

/// Lifecycle mode of a device controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    /// Front-panel control; the device is ready to be armed for a run.
    Manual,
    /// Programming hardware for a buffered run.
    TransitioningToBuffered,
    /// Armed for (or executing) the hardware-timed run.
    Buffered,
    /// Returning to front-panel control after a run.
    TransitioningToManual,
}

impl Mode {
    /// Bit value of this mode within a [`ModeSet`].
    pub const fn bit(self) -> u8 {
        match self {
            Mode::Manual => 1,
            Mode::TransitioningToBuffered => 2,
            Mode::TransitioningToManual => 4,
            Mode::Buffered => 8,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Manual => write!(f, "manual"),
            Mode::TransitioningToBuffered => write!(f, "transition_to_buffered"),
            Mode::Buffered => write!(f, "buffered"),
            Mode::TransitioningToManual => write!(f, "transition_to_manual"),
        }
    }
}

/// Set of modes in which a queued operation is allowed to execute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeSet(u8);

impl ModeSet {
    /// The empty set. An operation gated on this never runs.
    pub const NONE: ModeSet = ModeSet(0);

    /// All four modes.
    pub const ALL: ModeSet = ModeSet(1 | 2 | 4 | 8);

    /// Set containing a single mode.
    pub const fn only(mode: Mode) -> Self {
        ModeSet(mode.bit())
    }

    /// Whether `mode` is a member of this set.
    pub const fn contains(self, mode: Mode) -> bool {
        self.0 & mode.bit() != 0
    }

    /// Union of two sets.
    pub const fn union(self, other: ModeSet) -> Self {
        ModeSet(self.0 | other.0)
    }

    /// Whether the set is empty.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl From<Mode> for ModeSet {
    fn from(mode: Mode) -> Self {
        ModeSet::only(mode)
    }
}

impl BitOr for ModeSet {
    type Output = ModeSet;

    fn bitor(self, rhs: ModeSet) -> ModeSet {
        self.union(rhs)
    }
}

impl BitOr<Mode> for ModeSet {
    type Output = ModeSet;

    fn bitor(self, rhs: Mode) -> ModeSet {
        self.union(ModeSet::only(rhs))
    }
}

impl BitOr for Mode {
    type Output = ModeSet;

    fn bitor(self, rhs: Mode) -> ModeSet {
        ModeSet::only(self).union(ModeSet::only(rhs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_are_distinct() {
        let modes = [
            Mode::Manual,
            Mode::TransitioningToBuffered,
            Mode::Buffered,
            Mode::TransitioningToManual,
        ];
        for (i, a) in modes.iter().enumerate() {
            for b in &modes[i + 1..] {
                assert_ne!(a.bit(), b.bit());
            }
        }
    }

    #[test]
    fn union_and_contains() {
        let set = Mode::Manual | Mode::Buffered;
        assert!(set.contains(Mode::Manual));
        assert!(set.contains(Mode::Buffered));
        assert!(!set.contains(Mode::TransitioningToBuffered));
        assert!(!set.contains(Mode::TransitioningToManual));
    }

    #[test]
    fn all_contains_everything() {
        assert!(ModeSet::ALL.contains(Mode::Manual));
        assert!(ModeSet::ALL.contains(Mode::TransitioningToBuffered));
        assert!(ModeSet::ALL.contains(Mode::Buffered));
        assert!(ModeSet::ALL.contains(Mode::TransitioningToManual));
        assert!(ModeSet::NONE.is_empty());
    }
}

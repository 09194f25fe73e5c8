use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

/// State of the region-of-interest gate.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub enum GateState {
    #[default]
    Disabled,
    Enabled,
}

impl GateState {
    pub fn is_enabled(self) -> bool {
        matches!(self, Self::Enabled)
    }
}

impl From<bool> for GateState {
    fn from(enabled: bool) -> Self {
        if enabled {
            Self::Enabled
        } else {
            Self::Disabled
        }
    }
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("disabled"),
            Self::Enabled => f.write_str("enabled"),
        }
    }
}

impl FromStr for GateState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enabled" | "on" | "1" | "true" => Ok(Self::Enabled),
            "disabled" | "off" | "0" | "false" => Ok(Self::Disabled),
            other => Err(format!("expected 'enabled' or 'disabled', got {other:?}")),
        }
    }
}

/// Process-wide switch deciding whether memory accesses are captured.
///
/// Only the marker callbacks write the gate. The capture hook reads it with relaxed ordering, so
/// threads racing with a transition may capture or skip a few accesses on the wrong side of it.
/// The gate is shared by every thread: one thread crossing a marker turns capture on or off for
/// all of them.
#[derive(Debug)]
pub struct RoiGate {
    enabled: AtomicBool,
}

impl RoiGate {
    pub const fn new(initial: GateState) -> Self {
        Self {
            enabled: AtomicBool::new(matches!(initial, GateState::Enabled)),
        }
    }

    /// Opens the gate, returning the previous state.
    pub fn enter(&self) -> GateState {
        GateState::from(self.enabled.swap(true, Ordering::Relaxed))
    }

    /// Closes the gate, returning the previous state.
    pub fn exit(&self) -> GateState {
        GateState::from(self.enabled.swap(false, Ordering::Relaxed))
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> GateState {
        GateState::from(self.is_enabled())
    }
}

impl Default for RoiGate {
    fn default() -> Self {
        Self::new(GateState::default())
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_transitions() {
        let gate = RoiGate::new(GateState::Disabled);
        assert!(!gate.is_enabled());

        assert_eq!(gate.enter(), GateState::Disabled);
        assert_eq!(gate.enter(), GateState::Enabled);
        assert_eq!(gate.state(), GateState::Enabled);

        assert_eq!(gate.exit(), GateState::Enabled);
        assert_eq!(gate.state(), GateState::Disabled);
    }

    #[test]
    fn test_parse_state() {
        assert_eq!("enabled".parse::<GateState>(), Ok(GateState::Enabled));
        assert_eq!("off".parse::<GateState>(), Ok(GateState::Disabled));
        assert!("maybe".parse::<GateState>().is_err());
    }
}

//! Raw mode for the local terminal during TTY sessions.

use rustix::termios::{OptionalActions, Termios, isatty, tcgetattr, tcsetattr};

/// Puts stdin in raw mode and restores the saved settings on drop.
pub struct RawTerminal {
    saved: Termios,
}

impl RawTerminal {
    /// Switch stdin to raw mode. `None` if stdin is not a terminal.
    pub fn enable() -> Option<Self> {
        let stdin = std::io::stdin();
        if !isatty(&stdin) {
            return None;
        }

        let saved = tcgetattr(&stdin).ok()?;
        let mut raw = saved.clone();
        raw.make_raw();
        if let Err(e) = tcsetattr(&stdin, OptionalActions::Now, &raw) {
            tracing::warn!(error = %e, "Could not switch terminal to raw mode");
            return None;
        }
        Some(Self { saved })
    }
}

impl Drop for RawTerminal {
    fn drop(&mut self) {
        let _ = tcsetattr(std::io::stdin(), OptionalActions::Now, &self.saved);
    }
}

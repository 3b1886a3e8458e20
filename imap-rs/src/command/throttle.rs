//! Repeated-command throttle.
//!
//! Tracks the immediately preceding command per connection; a command that
//! is a value-duplicate of its predecessor within the repeat window bumps a
//! counter, and exceeding the configured limit rejects the command.

use crate::command::Command;
use std::time::{Duration, Instant};
use tracing::warn;

/// Window inside which identical commands count as repeats.
const REPEAT_WINDOW: Duration = Duration::from_secs(5 * 60);

pub struct CommandThrottle {
    limit: u32,
    last: Option<(Command, Instant)>,
    repeats: u32,
}

impl CommandThrottle {
    /// `limit` 0 disables the throttle.
    pub fn new(limit: u32) -> Self {
        CommandThrottle {
            limit,
            last: None,
            repeats: 0,
        }
    }

    /// Record `command` and decide whether it must be rejected. The
    /// command's own throttle hook (consecutive-CREATE counting, FETCH
    /// part stripping) runs first.
    pub fn is_command_throttled(&mut self, mut command: Command) -> bool {
        self.check(&mut command, Instant::now())
    }

    /// Like [`CommandThrottle::is_command_throttled`] but lets the caller
    /// keep the command on acceptance.
    pub fn check(&mut self, command: &mut Command, now: Instant) -> bool {
        if self.limit == 0 {
            return false;
        }

        if command.throttle(self.last.as_ref().map(|(c, _)| c), self.limit) {
            warn!(command = command.name(), "command vetoed by its own throttle policy");
            self.remember(command, now);
            return true;
        }

        let is_repeat = match &self.last {
            Some((last, at)) => {
                now.duration_since(*at) <= REPEAT_WINDOW && command.is_duplicate(last)
            }
            None => false,
        };

        if is_repeat {
            self.repeats += 1;
            if self.repeats > self.limit {
                warn!(
                    command = command.name(),
                    repeats = self.repeats,
                    "repeated command throttled"
                );
                self.remember(command, now);
                return true;
            }
        } else {
            self.repeats = 1;
        }
        self.remember(command, now);
        false
    }

    /// Store a lightweight copy of the command as the new predecessor.
    fn remember(&mut self, command: &Command, now: Instant) {
        self.last = Some((command.shallow_clone(), now));
    }
}

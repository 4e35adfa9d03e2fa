use std::time::Duration;

use crate::cli::ServeArgs;

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024;

/// Runtime knobs shared by the hub and every session it serves.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Number of events the hub intake buffers before senders wait.
    pub event_capacity: usize,
    /// Upper bound on a single fan-out write; slower recipients are dropped.
    pub write_timeout: Duration,
    /// Longest chunk a session reads before treating it as one line.
    pub max_line_bytes: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl From<&ServeArgs> for HubConfig {
    fn from(args: &ServeArgs) -> Self {
        // Zero would make `mpsc::channel` panic and stall line reads.
        Self {
            event_capacity: args.event_capacity.max(1),
            write_timeout: Duration::from_millis(args.write_timeout_ms),
            max_line_bytes: args.max_line_bytes.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_args_are_clamped() {
        let args = ServeArgs {
            listen: "127.0.0.1:0".parse().expect("addr"),
            event_capacity: 0,
            write_timeout_ms: 250,
            max_line_bytes: 0,
        };

        let config = HubConfig::from(&args);
        assert_eq!(config.event_capacity, 1);
        assert_eq!(config.max_line_bytes, 1);
        assert_eq!(config.write_timeout, Duration::from_millis(250));
    }
}

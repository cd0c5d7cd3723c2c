/// Turn scheduling configuration
use std::time::Duration;

use crate::FRAME_LENGTH_MS;

/// How a turn decides which pending mutations to replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
    /// Replay everything pending as one frame per turn
    Tick,

    /// Replay `[last_end, now - delay)` in fixed frames. The delay leaves
    /// room for late pushes from slow clients to land in the right frame.
    Span { delay: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Wait between a turn being scheduled and running
    pub turn_interval: Duration,

    pub frame_mode: FrameMode,
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// With turn interval
    pub fn with_turn_interval(mut self, interval: Duration) -> Self {
        self.turn_interval = interval;
        self
    }

    /// With frame mode
    pub fn with_frame_mode(mut self, mode: FrameMode) -> Self {
        self.frame_mode = mode;
        self
    }

    /// With span frames delayed by `delay`
    pub fn with_span_delay(self, delay: Duration) -> Self {
        self.with_frame_mode(FrameMode::Span { delay })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            turn_interval: Duration::from_secs_f64(FRAME_LENGTH_MS / 1000.0),
            frame_mode: FrameMode::Tick,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        let config = ServerConfig::new()
            .with_turn_interval(Duration::from_millis(50))
            .with_span_delay(Duration::from_millis(100));

        assert_eq!(config.turn_interval, Duration::from_millis(50));
        assert_eq!(
            config.frame_mode,
            FrameMode::Span {
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(ServerConfig::default().frame_mode, FrameMode::Tick);
        assert_eq!(ServerConfig::default().turn_interval.as_millis(), 16);
    }
}

use std::time::Duration;

/// Server-side tuning knobs for one control epoch. Unlike the Agent,
/// the Relay never dials a local service, so there is no buffer-size
/// setting here: the original's `buffer-size` flag is parsed by its
/// server binary but never read by the server's logic, so it is not
/// carried into this config either.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_millis(30_000),
            ping_timeout: Duration::from_millis(45_000),
        }
    }
}

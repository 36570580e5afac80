use std::time::Duration;

/// Per-epoch tunables; network addresses live on the
/// [`portbridge_connectivity::ConnectionFactory`]s passed to [`crate::Agent::new`]
/// rather than here.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Period between keep-alive `Ping`s on the control connection.
    /// Zero disables keep-alives.
    pub ping_interval: Duration,
    /// Read/write deadline on the control socket. Zero disables deadlines.
    pub ping_timeout: Duration,
    /// Size of the per-tunnel local-read buffer, in bytes
    /// (`buffer-size` CLI option × 1024).
    pub buffer_size_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_millis(30_000),
            ping_timeout: Duration::from_millis(45_000),
            buffer_size_bytes: 512 * 1024,
        }
    }
}

//! Connection state of the telemetry channel.
//!
//! Published by the connection kernel through a `watch` channel so the agent
//! can observe broker connectivity without polling.

use std::fmt;

/// Current state of the broker connection.
///
/// - `Connecting` -> `Connected` (CONNACK received)
/// - `Connected` -> `Reconnecting` (transient network error)
/// - any -> `Disconnected` (fatal error or shutdown)
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// CONNECT sent, waiting for CONNACK.
    Connecting,

    /// Handshake complete; publishes are delivered.
    Connected,

    /// Connection is down and the kernel is not retrying.
    Disconnected(String),

    /// Waiting the given number of seconds before the next attempt.
    Reconnecting(f64),
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnected(_) => "Disconnected",
            ConnectionState::Reconnecting(_) => "Reconnecting",
        }
    }

    pub fn details(&self) -> String {
        match self {
            ConnectionState::Connecting | ConnectionState::Connected => String::new(),
            ConnectionState::Disconnected(reason) => reason.clone(),
            ConnectionState::Reconnecting(seconds) => format!("in {seconds} seconds"),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())?;
        let details = self.details();
        if !details.is_empty() {
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "Connected");
        assert_eq!(
            ConnectionState::Reconnecting(2.0).to_string(),
            "Reconnecting (in 2 seconds)"
        );
        assert_eq!(
            ConnectionState::Disconnected("bad certificate".into()).to_string(),
            "Disconnected (bad certificate)"
        );
    }

    #[test]
    fn test_state_details() {
        assert_eq!(ConnectionState::Connecting.details(), "");
        assert_eq!(ConnectionState::Disconnected("gone".into()).details(), "gone");
    }
}

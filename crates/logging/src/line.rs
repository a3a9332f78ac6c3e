//! Session line types.

use std::time::SystemTime;

/// What a [`SessionLine`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LineKind {
    /// A command sent to the server, without its CRLF terminator.
    /// Passwords are masked by the sender before the line is logged.
    Command,
    /// A reply line received from the server.
    Reply,
    /// A connection or protocol error.
    Error,
    /// Progress and bookkeeping notes.
    Info,
}

/// One entry of a connection's session transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionLine {
    /// What the line records.
    pub kind: LineKind,
    /// Identity of the connection the line belongs to. Connections use
    /// their socket uid here, so lines from concurrent transfers stay
    /// attributable after the fact.
    pub conn: u64,
    /// The line text, without trailing line terminators.
    pub text: String,
    /// Wall-clock capture time.
    pub at: SystemTime,
}

impl SessionLine {
    /// Creates a line stamped with the current wall-clock time.
    #[must_use]
    pub fn new(kind: LineKind, conn: u64, text: impl Into<String>) -> Self {
        Self {
            kind,
            conn,
            text: text.into(),
            at: SystemTime::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_stamps_kind_and_connection() {
        let line = SessionLine::new(LineKind::Reply, 42, "230 Logged in.");
        assert_eq!(line.kind, LineKind::Reply);
        assert_eq!(line.conn, 42);
        assert_eq!(line.text, "230 Logged in.");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn line_round_trips_through_json() {
        let line = SessionLine::new(LineKind::Command, 3, "NOOP");
        let json = serde_json::to_string(&line).unwrap();
        let back: SessionLine = serde_json::from_str(&json).unwrap();
        assert_eq!(back, line);
    }
}

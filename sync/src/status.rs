use std::fmt;

/// Outcome classification for one processed message.
///
/// A status only drives logging; everything a peer can observe (rejects,
/// score, disconnects) goes through the misbehavior scoreboard and the
/// queued-reject list, so a handler can never punish twice by accident.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum StatusCode {
    /// Processed without effects worth mentioning.
    OK = 100,
    /// Deliberately not processed (wrong mode, handshake not done, dropped).
    Ignored = 101,

    /// Message violates the protocol (oversized, out of order, duplicate).
    ProtocolViolation = 400,
    /// Message could not be parsed by the connection layer.
    Malformed = 401,
    /// Data was well-formed but rejected by validation.
    InvalidData = 410,
    /// Parked for later (missing parents, unresolved payment reference).
    Transient = 420,

    /// Failed to hand a reply to the connection layer.
    Network = 500,
    /// A resource limit forced the operation to be skipped.
    ResourceLimit = 501,
}

impl StatusCode {
    pub fn with_context<S: fmt::Display>(self, context: S) -> Status {
        Status::new(self, Some(context))
    }
}

impl From<StatusCode> for Status {
    fn from(code: StatusCode) -> Self {
        Status::new::<&str>(code, None)
    }
}

/// `StatusCode` plus free-form context for the log line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    code: StatusCode,
    context: Option<String>,
}

impl Status {
    pub fn new<S: fmt::Display>(code: StatusCode, context: Option<S>) -> Self {
        Status {
            code,
            context: context.map(|c| c.to_string()),
        }
    }

    pub fn ok() -> Self {
        StatusCode::OK.into()
    }

    pub fn ignored() -> Self {
        StatusCode::Ignored.into()
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::OK
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    /// Worth a `warn!` rather than a `debug!`.
    pub fn should_warn(&self) -> bool {
        matches!(
            self.code,
            StatusCode::Network | StatusCode::ResourceLimit
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.context {
            Some(ref context) => write!(f, "{:?}({}): {}", self.code, self.code as u16, context),
            None => write!(f, "{:?}({})", self.code, self.code as u16),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let status = StatusCode::ProtocolViolation.with_context("oversized-inv: 50001");
        assert_eq!(
            status.to_string(),
            "ProtocolViolation(400): oversized-inv: 50001"
        );
        assert!(!status.is_ok());
        assert!(Status::ok().is_ok());
    }
}

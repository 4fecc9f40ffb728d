use thiserror::Error;

/// Errors from a hypervisor driver.
///
/// Every variant is either transient (worth retrying later) or permanent;
/// see [`DriverError::is_transient`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    #[error("host {host} unreachable: {reason}")]
    Unreachable { host: String, reason: String },

    #[error("{operation} timed out")]
    Timeout { operation: String },

    #[error("resource busy: {0}")]
    Busy(String),

    #[error("invalid VM spec: {0}")]
    InvalidSpec(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("no driver registered for hypervisor kind {0}")]
    NoDriver(String),

    #[error("{program} failed: {stderr}")]
    Command { program: String, stderr: String },
}

impl DriverError {
    /// Connection refused, timeouts, unreachable hosts and downstream lock
    /// contention clear up on their own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unreachable { .. } | Self::Timeout { .. } | Self::Busy(_)
        )
    }

    /// Classify a failed libvirt tool invocation from its stderr.
    ///
    /// Messages nobody recognizes stay `Command`, which is permanent.
    pub fn from_stderr(program: &str, host: &str, stderr: &str) -> Self {
        let msg = stderr.trim().to_string();
        let lower = msg.to_lowercase();
        let any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if any(&[
            "connection refused",
            "unable to connect",
            "no route to host",
            "connection reset",
            "could not resolve",
            "end of file while reading data",
        ]) {
            Self::Unreachable {
                host: host.to_string(),
                reason: msg,
            }
        } else if any(&["timed out", "timeout"]) {
            Self::Timeout {
                operation: format!("{program} on {host}"),
            }
        } else if any(&["cannot acquire state change lock", "is locked", "busy", "another migration job"]) {
            Self::Busy(msg)
        } else if any(&["authentication failed", "permission denied", "access denied", "not authorized"]) {
            Self::Unauthorized(msg)
        } else if any(&["domain not found", "no domain with matching name", "failed to get domain"]) {
            Self::NotFound(msg)
        } else if any(&["already exists", "already in use", "domain is already active"]) {
            Self::AlreadyExists(msg)
        } else if any(&["invalid", "unsupported configuration", "unknown os"]) {
            Self::InvalidSpec(msg)
        } else {
            Self::Command {
                program: program.to_string(),
                stderr: msg,
            }
        }
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(stderr: &str) -> DriverError {
        DriverError::from_stderr("virsh", "hv-1", stderr)
    }

    #[test]
    fn classifies_libvirt_messages() {
        assert!(matches!(
            classify("error: failed to connect to the hypervisor\nerror: Connection refused"),
            DriverError::Unreachable { .. }
        ));
        assert!(matches!(
            classify("error: Timed out during operation: cannot acquire state change lock"),
            DriverError::Timeout { .. }
        ));
        assert!(matches!(
            classify("error: Requested operation is not valid: another migration job is already running"),
            DriverError::Busy(_)
        ));
        assert!(matches!(
            classify("error: failed to get domain 'web-0'"),
            DriverError::NotFound(_)
        ));
        assert!(matches!(
            classify("ERROR    Guest name 'web-0' is already in use."),
            DriverError::AlreadyExists(_)
        ));
        assert!(matches!(
            classify("error: authentication failed: access denied"),
            DriverError::Unauthorized(_)
        ));
        assert!(matches!(
            classify("something odd happened"),
            DriverError::Command { .. }
        ));
    }

    #[test]
    fn transient_versus_permanent() {
        assert!(DriverError::Busy("x".into()).is_transient());
        assert!(
            DriverError::Timeout {
                operation: "create".into()
            }
            .is_transient()
        );
        assert!(!DriverError::InvalidSpec("x".into()).is_transient());
        assert!(!DriverError::NotFound("x".into()).is_transient());
        assert!(!DriverError::Unauthorized("x".into()).is_transient());
        assert!(!DriverError::NoDriver("esx".into()).is_transient());
    }
}

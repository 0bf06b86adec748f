//! Stable process exit codes for scripting.

/// Exit codes scripts can rely on across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    Success = 0,
    ConfigError = 1,
    StartFailed = 2,
    StopFailed = 3,
    RestartFailed = 4,
    PermissionDenied = 5,
    ServiceNotInstalled = 6,
    ServiceAlreadyInstalled = 7,
    AlreadyRunning = 8,
    NotRunning = 9,
    /// Status-only: the daemon is not running (informational, not a failure).
    Stopped = 10,
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(code as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(ExitCode::Success, 0)]
    #[test_case(ExitCode::ConfigError, 1)]
    #[test_case(ExitCode::StartFailed, 2)]
    #[test_case(ExitCode::StopFailed, 3)]
    #[test_case(ExitCode::RestartFailed, 4)]
    #[test_case(ExitCode::PermissionDenied, 5)]
    #[test_case(ExitCode::ServiceNotInstalled, 6)]
    #[test_case(ExitCode::ServiceAlreadyInstalled, 7)]
    #[test_case(ExitCode::AlreadyRunning, 8)]
    #[test_case(ExitCode::NotRunning, 9)]
    #[test_case(ExitCode::Stopped, 10)]
    fn codes_are_stable(code: ExitCode, value: u8) {
        assert_eq!(code as u8, value);
    }
}

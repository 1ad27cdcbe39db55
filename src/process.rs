#![allow(unsafe_code)] // Thin wrappers over libc process signaling

//! Best-effort process signaling and liveness checks.

/// Signals the framework sends to peers and stale daemons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Graceful shutdown request (POSIX SIGHUP).
    Hangup,
    /// Termination request (POSIX SIGTERM; forced exit on Windows).
    Terminate,
}

/// Send a signal to a process. Failures are reported, never fatal: the
/// target may have exited, or may never have existed (a stale PID file).
#[cfg(unix)]
pub fn signal(pid: u32, sig: Signal) -> bool {
    let signum = match sig {
        Signal::Hangup => libc::SIGHUP,
        Signal::Terminate => libc::SIGTERM,
    };
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    unsafe { libc::kill(pid, signum) == 0 }
}

#[cfg(windows)]
pub fn signal(pid: u32, _sig: Signal) -> bool {
    // No SIGHUP equivalent; both signals force-terminate.
    std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F"])
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

/// Check if a process with the given PID is running.
#[cfg(unix)]
#[must_use]
pub fn is_alive(pid: u32) -> bool {
    // kill(pid, 0) probes existence without delivering a signal.
    // EPERM means the process exists but belongs to someone else.
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    unsafe {
        if libc::kill(pid, 0) == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

#[cfg(windows)]
#[must_use]
pub fn is_alive(pid: u32) -> bool {
    std::process::Command::new("tasklist")
        .arg("/FI")
        .arg(format!("PID eq {pid}"))
        .output()
        .map(|output| String::from_utf8_lossy(&output.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn test_absent_process_is_not_alive() {
        // PID_MAX on Linux defaults to 2^22; this cannot name a live process.
        assert!(!is_alive(0x3FFF_FFFE));
    }

    #[test]
    fn test_signal_to_absent_process_reports_failure() {
        assert!(!signal(0x3FFF_FFFE, Signal::Terminate));
    }
}

//! OS keep-alive lease.
//!
//! While a loop is running the host holds a lease that stops the machine from
//! suspending underneath it. On Linux the usual mechanism is a
//! `systemd-inhibit` child process: the inhibitor lock lives exactly as long as
//! the child does, so releasing the lease means killing the child.

use std::io;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// How long a freshly spawned helper must stay up before the lease counts as held.
pub const DEFAULT_READY_WINDOW: Duration = Duration::from_millis(250);

/// Errors raised while acquiring a lease.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// The lease is already held.
    #[error("lease '{0}' is already held")]
    AlreadyHeld(String),

    /// The helper process could not be started.
    #[error("failed to start '{program}': {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The helper process exited before the lease could be used.
    #[error("'{program}' exited immediately ({status})")]
    Exited {
        /// Program that exited.
        program: String,
        /// Exit status as reported by the OS.
        status: String,
    },
}

/// A process-wide resource that keeps the host awake.
///
/// Calls are balanced by the owner: `acquire` is never called twice without an
/// intervening `release`.
#[async_trait]
pub trait KeepAliveLease: Send {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Take the lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease is already held or cannot be obtained.
    async fn acquire(&mut self) -> Result<(), LeaseError>;

    /// Give the lease back. A no-op when not held.
    async fn release(&mut self);

    /// Whether the lease is still in effect.
    ///
    /// A lease can be lost behind the owner's back, e.g. when its helper dies.
    fn is_held(&mut self) -> bool;
}

/// Lease that only tracks its own state.
///
/// For hosts where suspension is managed elsewhere (containers, mains-powered
/// boards with sleep disabled).
#[derive(Debug, Default)]
pub struct NoopLease {
    held: bool,
}

impl NoopLease {
    /// Create an unheld lease.
    #[must_use]
    pub const fn new() -> Self {
        Self { held: false }
    }
}

#[async_trait]
impl KeepAliveLease for NoopLease {
    fn name(&self) -> &str {
        "noop"
    }

    async fn acquire(&mut self) -> Result<(), LeaseError> {
        if self.held {
            return Err(LeaseError::AlreadyHeld(self.name().to_string()));
        }
        self.held = true;
        debug!("No-op keep-alive lease acquired");
        Ok(())
    }

    async fn release(&mut self) {
        if self.held {
            self.held = false;
            debug!("No-op keep-alive lease released");
        }
    }

    fn is_held(&mut self) -> bool {
        self.held
    }
}

/// Lease held by a long-running helper process.
///
/// The helper is killed when the lease is released or dropped.
#[derive(Debug)]
pub struct CommandLease {
    program: String,
    args: Vec<String>,
    ready_window: Duration,
    child: Option<Child>,
}

impl CommandLease {
    /// Lease that runs `program args...` while held.
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            ready_window: DEFAULT_READY_WINDOW,
            child: None,
        }
    }

    /// `systemd-inhibit` blocking sleep and idle for as long as the lease is held.
    #[must_use]
    pub fn systemd_inhibit(why: &str) -> Self {
        Self::new(
            "systemd-inhibit",
            [
                "--what=sleep:idle".to_string(),
                "--who=smartswitch".to_string(),
                format!("--why={why}"),
                "--mode=block".to_string(),
                "sleep".to_string(),
                "infinity".to_string(),
            ],
        )
    }

    /// Override how long the helper must survive before `acquire` succeeds.
    #[must_use]
    pub const fn with_ready_window(mut self, window: Duration) -> Self {
        self.ready_window = window;
        self
    }

    /// PID of the helper while held.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }
}

#[async_trait]
impl KeepAliveLease for CommandLease {
    fn name(&self) -> &str {
        &self.program
    }

    async fn acquire(&mut self) -> Result<(), LeaseError> {
        if self.child.is_some() {
            return Err(LeaseError::AlreadyHeld(self.program.clone()));
        }

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LeaseError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // A helper refused by polkit or logind exits within moments of starting.
        if let Ok(exited) = tokio::time::timeout(self.ready_window, child.wait()).await {
            let status = exited.map_or_else(|e| e.to_string(), |s| s.to_string());
            return Err(LeaseError::Exited {
                program: self.program.clone(),
                status,
            });
        }

        info!(program = %self.program, pid = ?child.id(), "Keep-alive lease acquired");
        self.child = Some(child);
        Ok(())
    }

    async fn release(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let pid = child.id();
        if let Err(e) = child.kill().await {
            warn!(pid = ?pid, error = %e, "Failed to stop lease helper");
        }
        info!(program = %self.program, pid = ?pid, "Keep-alive lease released");
    }

    fn is_held(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                warn!(program = %self.program, %status, "Lease helper exited, lease lost");
                self.child = None;
                false
            }
            Err(e) => {
                warn!(program = %self.program, error = %e, "Cannot poll lease helper");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_lease_balanced() {
        let mut lease = NoopLease::new();
        assert!(!lease.is_held());

        lease.acquire().await.unwrap();
        assert!(lease.is_held());
        assert!(matches!(lease.acquire().await, Err(LeaseError::AlreadyHeld(_))));

        lease.release().await;
        lease.release().await;
        assert!(!lease.is_held());
        lease.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn test_command_lease_holds_child() {
        let mut lease = CommandLease::new("sleep", ["30"]);
        lease.acquire().await.unwrap();
        assert!(lease.is_held());
        let pid = lease.pid().unwrap();
        assert!(pid > 0);

        assert!(matches!(lease.acquire().await, Err(LeaseError::AlreadyHeld(_))));
        assert_eq!(lease.pid(), Some(pid));

        lease.release().await;
        assert!(!lease.is_held());
        assert_eq!(lease.pid(), None);
    }

    #[tokio::test]
    async fn test_command_lease_missing_program() {
        let mut lease = CommandLease::new("smartswitch-definitely-not-installed", Vec::<String>::new());
        let err = lease.acquire().await.unwrap_err();
        assert!(matches!(err, LeaseError::Spawn { .. }));
        assert!(err.to_string().contains("smartswitch-definitely-not-installed"));
        assert!(!lease.is_held());
    }

    #[tokio::test]
    async fn test_helper_failing_during_ready_window_is_refused() {
        let mut lease = CommandLease::new("sh", ["-c", "sleep 0.05; exit 1"]);
        let err = lease.acquire().await.unwrap_err();
        assert!(matches!(err, LeaseError::Exited { .. }));
        assert!(err.to_string().contains("exit status: 1"));
        assert!(!lease.is_held());
        assert_eq!(lease.pid(), None);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!lease.is_held());
    }

    #[tokio::test]
    async fn test_helper_dying_after_acquire_drops_lease() {
        let mut lease = CommandLease::new("sh", ["-c", "sleep 0.2; exit 1"])
            .with_ready_window(Duration::from_millis(20));
        lease.acquire().await.unwrap();
        assert!(lease.is_held());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!lease.is_held());
        assert_eq!(lease.pid(), None);

        // Releasing a lost lease is a no-op; it can be taken again.
        lease.release().await;
        lease.acquire().await.unwrap();
        assert!(lease.is_held());
        lease.release().await;
    }

    #[test]
    fn test_systemd_inhibit_arguments() {
        let lease = CommandLease::systemd_inhibit("keeping switch awake");
        assert_eq!(lease.name(), "systemd-inhibit");
        assert_eq!(lease.ready_window, DEFAULT_READY_WINDOW);
        assert!(lease.args.contains(&"--what=sleep:idle".to_string()));
        assert!(lease.args.contains(&"--why=keeping switch awake".to_string()));
        assert_eq!(lease.args.last().map(String::as_str), Some("infinity"));
    }
}

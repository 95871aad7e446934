//! tmux server health.
//!
//! A tmux server that never reaps its children accumulates zombies until
//! forks fail. Past the threshold the user gets one warning; the restart
//! action kills the server and recreates every recorded session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::Result;
use crate::mux::ZombieSample;
use crate::orchestrator::{FleetEvent, Orchestrator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    Restarted { recreated: usize },
    AlreadyRunning,
}

pub struct MuxHealth {
    orchestrator: Arc<Orchestrator>,
    recovering: AtomicBool,
    monitor_suspended: AtomicBool,
    warned: AtomicBool,
}

/// Clears both flags when the restart flow ends, however it ends.
struct RecoveryGuard<'a>(&'a MuxHealth);

impl Drop for RecoveryGuard<'_> {
    fn drop(&mut self) {
        self.0.monitor_suspended.store(false, Ordering::SeqCst);
        self.0.recovering.store(false, Ordering::SeqCst);
    }
}

impl MuxHealth {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            recovering: AtomicBool::new(false),
            monitor_suspended: AtomicBool::new(false),
            warned: AtomicBool::new(false),
        })
    }

    /// Dead-session recreation must pause while the server is being replaced.
    pub fn monitor_suspended(&self) -> bool {
        self.monitor_suspended.load(Ordering::SeqCst)
    }

    /// Sample zombie counts and warn once when a server crosses `threshold`.
    /// Returns the offending sample.
    pub async fn check(&self, threshold: usize) -> Option<ZombieSample> {
        let samples = match self.orchestrator.mux.zombie_samples().await {
            Ok(samples) => samples,
            Err(e) => {
                warn!(
                    component = "health",
                    event = "health.sample_failed",
                    error = %e,
                    "Could not sample tmux zombies"
                );
                return None;
            }
        };
        let worst = samples
            .into_iter()
            .filter(|s| s.zombies >= threshold)
            .max_by_key(|s| s.zombies)?;

        if !self.warned.swap(true, Ordering::SeqCst) {
            warn!(
                component = "health",
                event = "health.zombies_detected",
                server_pid = worst.server_pid,
                zombies = worst.zombies,
                threshold,
                "tmux server is accumulating zombie processes; restart-mux recreates all sessions"
            );
            self.orchestrator.notify(FleetEvent::ZombieWarning {
                server_pid: worst.server_pid,
                zombies: worst.zombies,
            });
        }
        Some(worst)
    }

    /// Kill the tmux server and recreate every recorded session.
    pub async fn restart_mux(&self) -> Result<RestartOutcome> {
        if self.recovering.swap(true, Ordering::SeqCst) {
            return Ok(RestartOutcome::AlreadyRunning);
        }
        self.monitor_suspended.store(true, Ordering::SeqCst);
        let _guard = RecoveryGuard(self);

        info!(
            component = "health",
            event = "health.restart_started",
            "Restarting tmux server"
        );
        self.orchestrator.mux.restart_server().await?;

        let mut recreated = 0;
        let threads: Vec<_> = self
            .orchestrator
            .threads()
            .iter()
            .filter(|t| !t.is_archived)
            .map(|t| (t.id.clone(), t.tmux_session_names.clone()))
            .collect();
        for (thread_id, sessions) in threads {
            for session in sessions {
                match self.orchestrator.recreate_session(&thread_id, &session).await {
                    Ok(_) => recreated += 1,
                    Err(e) => warn!(
                        component = "health",
                        event = "health.recreate_failed",
                        session = %session,
                        error = %e,
                        "Session not recreated after restart"
                    ),
                }
            }
        }

        self.warned.store(false, Ordering::SeqCst);
        info!(
            component = "health",
            event = "health.restart_completed",
            recreated,
            "tmux server restarted"
        );
        self.orchestrator.notify(FleetEvent::MuxRestarted { recreated });
        Ok(RestartOutcome::Restarted { recreated })
    }
}

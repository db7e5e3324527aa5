//! Process supervision.
//!
//! The supervisor owns one OS process per configured unit: one advancer unit
//! covering every pipeline kind and one job unit per kind. Liveness is judged
//! from each unit's heartbeat row, not from the OS. A unit with no heartbeat
//! within the timeout is presumed dead: it is killed, its unfinished claims are
//! released, and it is spawned again in place.
//!
//! Graceful shutdown closes each child's stdin, which supervised units treat
//! as a stop request, then waits for exit up to the configured timeout before
//! killing survivors.

use chrono::{DateTime, TimeDelta, Utc};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::settings::Settings;
use crate::store::{ProcessIdentity, Store, StoreError};

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("failed to spawn unit '{unit}': {source}")]
    Spawn {
        unit: UnitSpec,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What a managed process runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitSpec {
    Advancer,
    Jobs { kind: String },
}

impl UnitSpec {
    /// Command-line arguments selecting this unit.
    pub fn args(&self) -> Vec<String> {
        match self {
            Self::Advancer => vec!["advancer".to_string()],
            Self::Jobs { kind } => vec!["jobs".to_string(), "--kind".to_string(), kind.clone()],
        }
    }
}

impl fmt::Display for UnitSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Advancer => f.write_str("advancer"),
            Self::Jobs { kind } => write!(f, "jobs:{kind}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Starting,
    Running,
    Crashed,
    Restarting,
    Stopping,
    Stopped,
}

/// Liveness verdict for one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Heartbeat is fresh.
    Alive,
    /// No heartbeat yet, still inside the start-up grace period.
    Starting,
    Dead,
}

/// Judge a unit from its last heartbeat.
///
/// A unit that has never beaten gets `timeout` from its spawn time to do so.
pub fn assess(
    spawned_at: DateTime<Utc>,
    last_beat: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    timeout: Duration,
) -> Liveness {
    let timeout = TimeDelta::from_std(timeout).unwrap_or(TimeDelta::MAX);
    match last_beat {
        Some(beat) if now.signed_duration_since(beat) <= timeout => Liveness::Alive,
        Some(_) => Liveness::Dead,
        None if now.signed_duration_since(spawned_at) <= timeout => Liveness::Starting,
        None => Liveness::Dead,
    }
}

struct ManagedUnit {
    spec: UnitSpec,
    state: UnitState,
    child: Option<Child>,
    pid: Option<u32>,
    spawned_at: DateTime<Utc>,
    restarts: u32,
}

/// Snapshot of one managed unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitStatus {
    pub spec: UnitSpec,
    pub state: UnitState,
    pub pid: Option<u32>,
    pub restarts: u32,
}

pub struct Supervisor {
    program: PathBuf,
    args: Vec<String>,
    store: Arc<dyn Store>,
    settings: Arc<Settings>,
    machine_id: String,
    units: Vec<ManagedUnit>,
}

impl Supervisor {
    pub fn new(
        program: impl Into<PathBuf>,
        store: Arc<dyn Store>,
        settings: Arc<Settings>,
        machine_id: impl Into<String>,
    ) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            store,
            settings,
            machine_id: machine_id.into(),
            units: Vec::new(),
        }
    }

    /// Argument placed before the unit arguments of every spawned process.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn unit(mut self, spec: UnitSpec) -> Self {
        self.units.push(ManagedUnit {
            spec,
            state: UnitState::Stopped,
            child: None,
            pid: None,
            spawned_at: Utc::now(),
            restarts: 0,
        });
        self
    }

    pub fn status(&self) -> Vec<UnitStatus> {
        self.units
            .iter()
            .map(|u| UnitStatus {
                spec: u.spec.clone(),
                state: u.state,
                pid: u.pid,
                restarts: u.restarts,
            })
            .collect()
    }

    fn identity(&self, pid: u32) -> ProcessIdentity {
        ProcessIdentity::new(pid, self.machine_id.clone())
    }

    async fn spawn(&mut self, index: usize) -> Result<(), SupervisorError> {
        let program = self.program.clone();
        let args = self.args.clone();
        let machine_id = self.machine_id.clone();
        let Some(unit) = self.units.get_mut(index) else {
            return Ok(());
        };

        let child = Command::new(&program)
            .args(&args)
            .args(unit.spec.args())
            .arg("--machine-id")
            .arg(&machine_id)
            .arg("--supervised")
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                unit: unit.spec.clone(),
                source,
            })?;

        unit.pid = child.id();
        unit.child = Some(child);
        unit.spawned_at = Utc::now();
        unit.state = UnitState::Starting;
        info!(unit = %unit.spec, pid = ?unit.pid, "unit spawned");
        Ok(())
    }

    /// Spawn every unit.
    pub async fn start_all(&mut self) -> Result<(), SupervisorError> {
        for index in 0..self.units.len() {
            self.spawn(index).await?;
        }
        Ok(())
    }

    /// One monitoring pass. Returns the number of units restarted.
    pub async fn check(&mut self) -> Result<usize, SupervisorError> {
        let timeout = Duration::from_millis(self.settings.supervisor.heartbeat_timeout_ms);
        let mut restarted = 0;

        for index in 0..self.units.len() {
            let (pid, spawned_at, state) = {
                let unit = &self.units[index];
                (unit.pid, unit.spawned_at, unit.state)
            };
            if matches!(state, UnitState::Stopping | UnitState::Stopped) {
                continue;
            }
            let Some(pid) = pid else {
                continue;
            };
            let identity = self.identity(pid);
            let beat = self.store.heartbeat(&identity).await?;

            match assess(spawned_at, beat, Utc::now(), timeout) {
                Liveness::Alive => {
                    let unit = &mut self.units[index];
                    if unit.state != UnitState::Running {
                        debug!(unit = %unit.spec, pid, "unit is running");
                    }
                    unit.state = UnitState::Running;
                }
                Liveness::Starting => {}
                Liveness::Dead => {
                    self.restart(index, &identity).await?;
                    restarted += 1;
                }
            }
        }

        Ok(restarted)
    }

    async fn restart(&mut self, index: usize, identity: &ProcessIdentity) -> Result<(), SupervisorError> {
        let unit = &mut self.units[index];
        unit.state = UnitState::Crashed;
        warn!(unit = %unit.spec, process = %identity, "unit missed its heartbeat, presumed dead");

        if let Some(mut child) = unit.child.take() {
            if let Err(e) = child.start_kill() {
                debug!(unit = %unit.spec, error = %e, "kill failed, process likely gone");
            }
            let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
        }

        let released = self.store.release_claims(identity).await?;
        self.store.remove_heartbeat(identity).await?;
        if released > 0 {
            info!(process = %identity, released, "released claims of dead unit");
        }

        let unit = &mut self.units[index];
        unit.state = UnitState::Restarting;
        unit.restarts += 1;
        self.spawn(index).await
    }

    /// Ask every unit to stop, then kill those still alive after the timeout.
    pub async fn stop_all(&mut self) {
        let timeout = Duration::from_millis(self.settings.supervisor.shutdown_timeout_ms);

        for unit in &mut self.units {
            if let Some(child) = unit.child.as_mut() {
                unit.state = UnitState::Stopping;
                // Closing stdin is the stop request.
                drop(child.stdin.take());
            }
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut running = 0;
            for unit in &mut self.units {
                let Some(child) = unit.child.as_mut() else {
                    continue;
                };
                match child.try_wait() {
                    Ok(Some(status)) => {
                        info!(unit = %unit.spec, %status, "unit exited");
                        unit.child = None;
                        unit.state = UnitState::Stopped;
                    }
                    Ok(None) => running += 1,
                    Err(e) => {
                        error!(unit = %unit.spec, error = %e, "failed to poll unit");
                        running += 1;
                    }
                }
            }
            if running == 0 || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        for unit in &mut self.units {
            if let Some(mut child) = unit.child.take() {
                warn!(unit = %unit.spec, "unit did not stop in time, killing");
                if let Err(e) = child.kill().await {
                    error!(unit = %unit.spec, error = %e, "failed to kill unit");
                }
            }
            unit.state = UnitState::Stopped;
        }
    }

    /// Spawn all units and monitor them until `shutdown` flips to `true`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), SupervisorError> {
        self.start_all().await?;
        let poll = Duration::from_millis(self.settings.supervisor.polling_interval_ms);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = tokio::time::sleep(poll) => {
                    if let Err(e) = self.check().await {
                        error!(error = %e, "supervision pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("supervisor stopping");
        self.stop_all().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_fresh_heartbeat_is_alive() {
        let verdict = assess(at(0), Some(at(25)), at(30), Duration::from_secs(10));
        assert_eq!(verdict, Liveness::Alive);
    }

    #[test]
    fn test_stale_heartbeat_is_dead() {
        let verdict = assess(at(0), Some(at(5)), at(30), Duration::from_secs(10));
        assert_eq!(verdict, Liveness::Dead);
    }

    #[test]
    fn test_grace_period_before_first_beat() {
        let timeout = Duration::from_secs(10);
        assert_eq!(assess(at(0), None, at(9), timeout), Liveness::Starting);
        assert_eq!(assess(at(0), None, at(11), timeout), Liveness::Dead);
    }

    #[test]
    fn test_unit_args() {
        assert_eq!(UnitSpec::Advancer.args(), vec!["advancer"]);
        assert_eq!(
            UnitSpec::Jobs { kind: "ingest".into() }.args(),
            vec!["jobs", "--kind", "ingest"]
        );
        assert_eq!(UnitSpec::Jobs { kind: "ingest".into() }.to_string(), "jobs:ingest");
    }
}

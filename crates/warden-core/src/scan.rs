//! Scan orchestrator.
//!
//! Turns a quick or full scan request into a background job: the protection
//! state moves to `scanning`, every regular file under the job's roots is
//! sent to the scan engine, and the job ends in `protected` (nothing found)
//! or `alert` (at least one threat). If the engine cannot be reached the
//! job ends immediately in `warning`.
//!
//! Only one job runs at a time.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use warden_config::ScanningConfig;

use crate::daemon::Daemon;
use crate::engine::Verdict;
use crate::events::{ScanEvent, ThreatEvent};
use crate::state::ProtectionState;

/// Roots walked by a full scan.
pub const FULL_SCAN_ROOTS: [&str; 3] = ["/home", "/tmp", "/var/tmp"];

/// Files discovered but not yet scanned.
const WALK_QUEUE: usize = 256;

/// Which root set a job walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanType {
    Quick,
    Full,
}

impl ScanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanType::Quick => "quick",
            ScanType::Full => "full",
        }
    }
}

impl fmt::Display for ScanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quick" => Ok(ScanType::Quick),
            "full" => Ok(ScanType::Full),
            other => Err(format!("unknown scan type: {other}")),
        }
    }
}

/// Root paths for each scan type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPolicy {
    pub quick: Vec<PathBuf>,
    pub full: Vec<PathBuf>,
}

impl ScanPolicy {
    pub fn from_config(config: &ScanningConfig) -> Self {
        Self {
            quick: config.quick_scan_paths.clone(),
            full: FULL_SCAN_ROOTS.iter().map(PathBuf::from).collect(),
        }
    }

    pub fn roots(&self, scan_type: ScanType) -> &[PathBuf] {
        match scan_type {
            ScanType::Quick => &self.quick,
            ScanType::Full => &self.full,
        }
    }
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self::from_config(&ScanningConfig::default())
    }
}

/// Errors from starting or running a scan job.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScanError {
    #[error("scan already in progress (job {0})")]
    AlreadyRunning(String),

    #[error("scan engine not available")]
    EngineUnavailable,
}

/// Counters for one finished job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub files_scanned: u64,
    pub threats_found: u64,
    pub files_skipped: u64,
}

/// A claimed job, not yet run.
#[derive(Debug)]
struct ScanJob {
    job_id: String,
    scan_type: ScanType,
    roots: Vec<PathBuf>,
    slot: JobSlot,
}

/// Holds the single active-job slot; frees it on drop, even if the job panics.
#[derive(Debug)]
struct JobSlot(Arc<Mutex<Option<String>>>);

impl Drop for JobSlot {
    fn drop(&mut self) {
        *self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }
}

#[derive(Debug)]
struct FileEntry {
    path: PathBuf,
    size: u64,
}

/// Starts scan jobs against the daemon's engine and state machine.
pub struct ScanOrchestrator {
    daemon: Arc<Daemon>,
    policy: ScanPolicy,
    active: Arc<Mutex<Option<String>>>,
}

impl ScanOrchestrator {
    pub fn new(daemon: Arc<Daemon>, policy: ScanPolicy) -> Self {
        Self {
            daemon,
            policy,
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn policy(&self) -> &ScanPolicy {
        &self.policy
    }

    /// Id of the job currently running, if any.
    pub fn active_job(&self) -> Option<String> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Start a job in the background and return its id.
    ///
    /// The state is already `scanning` when this returns. Must be called
    /// from within a tokio runtime.
    pub fn start(&self, scan_type: ScanType) -> Result<String, ScanError> {
        let job = self.claim(scan_type)?;
        let job_id = job.job_id.clone();
        let daemon = Arc::clone(&self.daemon);
        tokio::spawn(async move {
            if let Err(e) = run_job(&daemon, job).await {
                warn!(error = %e, "Scan job failed");
            }
        });
        Ok(job_id)
    }

    /// Run a job to completion on the current task.
    pub async fn run(&self, scan_type: ScanType) -> Result<ScanSummary, ScanError> {
        let job = self.claim(scan_type)?;
        run_job(&self.daemon, job).await
    }

    fn claim(&self, scan_type: ScanType) -> Result<ScanJob, ScanError> {
        let job_id = {
            let mut active = self
                .active
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(running) = active.as_ref() {
                return Err(ScanError::AlreadyRunning(running.clone()));
            }
            let job_id = new_job_id(scan_type);
            *active = Some(job_id.clone());
            job_id
        };

        self.daemon
            .transition(ProtectionState::Scanning, "scan:started");
        info!(job_id = %job_id, scan_type = %scan_type, "Scan started");

        Ok(ScanJob {
            job_id,
            scan_type,
            roots: self.policy.roots(scan_type).to_vec(),
            slot: JobSlot(Arc::clone(&self.active)),
        })
    }
}

/// `<type>-YYYYMMDD-HHMMSS`, in UTC.
fn new_job_id(scan_type: ScanType) -> String {
    format!("{scan_type}-{}", Utc::now().format("%Y%m%d-%H%M%S"))
}

async fn run_job(daemon: &Daemon, job: ScanJob) -> Result<ScanSummary, ScanError> {
    let ScanJob {
        job_id,
        scan_type,
        roots,
        slot,
    } = job;
    let event = ScanEvent::start(scan_type.as_str(), &job_id);

    if !daemon.engine().is_available().await {
        warn!(job_id = %job_id, "Scan engine not available, aborting scan");
        daemon.transition(ProtectionState::Warning, "scan:engine_unavailable");
        daemon
            .events()
            .emit(event.error(ScanError::EngineUnavailable).end());
        drop(slot);
        return Err(ScanError::EngineUnavailable);
    }

    let summary = scan_roots(daemon, roots).await;

    daemon.set_last_scan(Utc::now());
    if summary.threats_found > 0 {
        daemon.transition(ProtectionState::Alert, "scan:threats");
    } else {
        daemon.transition(ProtectionState::Protected, "scan:clean");
    }
    info!(
        job_id = %job_id,
        files_scanned = summary.files_scanned,
        threats_found = summary.threats_found,
        files_skipped = summary.files_skipped,
        "Scan finished"
    );
    daemon.events().emit(
        event
            .files_scanned(summary.files_scanned)
            .threats_found(summary.threats_found)
            .files_skipped(summary.files_skipped)
            .end(),
    );
    // Released only after the terminal transition so a follow-up job cannot
    // interleave its `scanning` with this job's outcome.
    drop(slot);
    Ok(summary)
}

async fn scan_roots(daemon: &Daemon, roots: Vec<PathBuf>) -> ScanSummary {
    let (tx, mut rx) = mpsc::channel(WALK_QUEUE);
    let walker = tokio::task::spawn_blocking(move || walk(&roots, &tx));

    let mut summary = ScanSummary::default();
    while let Some(file) = rx.recv().await {
        let result = daemon.engine().scan_file(&file.path).await;
        match result.outcome {
            Ok(Verdict::Clean) => summary.files_scanned += 1,
            Ok(Verdict::Infected { threat }) => {
                summary.files_scanned += 1;
                summary.threats_found += 1;
                warn!(path = %file.path.display(), threat = %threat, "Threat detected");
                daemon.events().emit(
                    ThreatEvent::start(&file.path, &threat)
                        .action("detected")
                        .file_size(file.size)
                        .end(),
                );
            }
            Ok(Verdict::Unrecognized { line }) => {
                summary.files_skipped += 1;
                warn!(path = %file.path.display(), reply = %line, "Unrecognized scan engine reply");
            }
            Err(e) => {
                summary.files_skipped += 1;
                debug!(path = %file.path.display(), error = %e, "Skipping file");
            }
        }
    }

    if let Err(e) = walker.await {
        warn!(error = %e, "Filesystem walk aborted");
    }
    summary
}

/// Send every regular file under `roots` to `tx`. Unreadable entries are
/// skipped; symlinks are not followed.
fn walk(roots: &[PathBuf], tx: &mpsc::Sender<FileEntry>) {
    for root in roots {
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let file = FileEntry {
                path: entry.into_path(),
                size,
            };
            if tx.blocking_send(file).is_err() {
                return;
            }
        }
    }
}

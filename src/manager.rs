use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info};

use crate::TesseraDb;

#[derive(Debug, Clone)]
pub struct SystemProfile {
    pub logical_cores: usize,
    pub worker_threads: usize,
}

impl SystemProfile {
    pub fn detect() -> Self {
        let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);

        // Single core: 1 compute + 1 I/O worker
        if cores <= 1 {
            println!("[\u{26a0}\u{fe0f}  MANAGER] Single core detected, running with 2 workers.");
            return Self { logical_cores: cores, worker_threads: 2 };
        }

        Self { logical_cores: cores, worker_threads: cores }
    }
}

/// How often the maintenance thread vacuums and snapshots. `None` disables a
/// task.
#[derive(Debug, Clone, Copy)]
pub struct MaintenancePlan {
    pub vacuum_every: Option<Duration>,
    pub snapshot_every: Option<Duration>,
}

impl MaintenancePlan {
    fn tick(&self) -> Option<Duration> {
        match (self.vacuum_every, self.snapshot_every) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Runs one maintenance pass: vacuum, then snapshot. Failures are logged and
/// the store keeps serving.
pub fn run_maintenance(db: &TesseraDb, vacuum: bool, snapshot: bool) {
    if vacuum {
        match db.collection().vacuum() {
            Ok(removed) if removed > 0 => info!(removed, "[GC] Vacuumed dead versions"),
            Ok(_) => {}
            Err(e) => error!("[GC] Vacuum failed: {}", e),
        }
    }
    if snapshot {
        if let Err(e) = db.save() {
            error!("[GC] Snapshot failed: {}", e);
        }
    }
}

/// Starts the background maintenance thread.
pub fn start_maintenance_thread(db: Arc<TesseraDb>, plan: MaintenancePlan) -> Option<thread::JoinHandle<()>> {
    let tick = plan.tick()?;

    let handle = thread::spawn(move || {
        info!("[GC] Background maintenance thread started");
        let mut last_vacuum = Instant::now();
        let mut last_snapshot = Instant::now();
        loop {
            thread::sleep(tick);

            let vacuum_due = plan.vacuum_every.is_some_and(|every| last_vacuum.elapsed() >= every);
            let snapshot_due = plan.snapshot_every.is_some_and(|every| last_snapshot.elapsed() >= every);
            run_maintenance(&db, vacuum_due, snapshot_due);

            if vacuum_due {
                last_vacuum = Instant::now();
            }
            if snapshot_due {
                last_snapshot = Instant::now();
            }
        }
    });
    Some(handle)
}

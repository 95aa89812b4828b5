//! Background flush and cold-eviction sweeps.
//!
//! Both loops wake every 250 ms, count ticks, and act every
//! `interval / 250ms` ticks; an interval of `0` disables the sweep entirely.
//! Neither observes per-set errors, since sets may be concurrently dropped
//! out from under a sweep in progress.

use std::thread;
use std::time::Duration;

use crate::manager::SetManager;

const TICK: Duration = Duration::from_millis(250);
const CHECKPOINT_EVERY: usize = 64;

/// Runs the flush sweep until [`SetManager::stop`] is called. `client_id`
/// identifies this worker in the manager's checkpoint table.
pub fn run_flush_sweep(manager: &SetManager, client_id: u64, interval_secs: u64) {
    manager.checkpoint(client_id);
    if interval_secs == 0 {
        manager.leave(client_id);
        return;
    }
    let ticks_per_sweep = (interval_secs * 1000 / TICK.as_millis() as u64).max(1);
    let mut ticks = 0u64;

    while manager.should_run() {
        thread::sleep(TICK);
        if !manager.should_run() {
            break;
        }
        ticks += 1;
        if ticks < ticks_per_sweep {
            continue;
        }
        ticks = 0;

        for (i, listing) in manager.list(b"").into_iter().enumerate() {
            if i % CHECKPOINT_EVERY == 0 {
                manager.checkpoint(client_id);
            }
            let _ = manager.flush(&listing.name);
        }
        manager.checkpoint(client_id);
    }
    manager.leave(client_id);
}

/// Runs the cold sweep until [`SetManager::stop`] is called.
pub fn run_cold_sweep(manager: &SetManager, client_id: u64, interval_secs: u64) {
    manager.checkpoint(client_id);
    if interval_secs == 0 {
        manager.leave(client_id);
        return;
    }
    let ticks_per_sweep = (interval_secs * 1000 / TICK.as_millis() as u64).max(1);
    let mut ticks = 0u64;

    while manager.should_run() {
        thread::sleep(TICK);
        if !manager.should_run() {
            break;
        }
        ticks += 1;
        if ticks < ticks_per_sweep {
            continue;
        }
        ticks = 0;

        for (i, name) in manager.list_cold().into_iter().enumerate() {
            if i % CHECKPOINT_EVERY == 0 {
                manager.checkpoint(client_id);
            }
            let _ = manager.unmap(&name);
        }
        manager.checkpoint(client_id);
    }
    manager.leave(client_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalConfig;
    use crate::manager::CreateOptions;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn zero_interval_is_a_no_op_and_returns_immediately() {
        let dir = tempdir().unwrap();
        let mut cfg = GlobalConfig::default();
        cfg.data_dir = dir.path().to_string_lossy().to_string();
        let mgr = SetManager::new(cfg);
        // Must return promptly; a nonzero interval would block this test for
        // at least one tick.
        run_flush_sweep(&mgr, 1, 0);
        run_cold_sweep(&mgr, 2, 0);
    }

    #[test]
    fn flush_sweep_flushes_dirty_sets() {
        let dir = tempdir().unwrap();
        let mut cfg = GlobalConfig::default();
        cfg.data_dir = dir.path().to_string_lossy().to_string();
        let mgr = Arc::new(SetManager::new(cfg));
        mgr.create(b"a", CreateOptions::default()).unwrap();
        mgr.add_keys(b"a", &[b"k"]).unwrap();

        let worker_mgr = mgr.clone();
        let handle = thread::spawn(move || run_flush_sweep(&worker_mgr, 10, 1));
        thread::sleep(Duration::from_millis(1500));
        mgr.stop();
        handle.join().unwrap();

        let config_path = dir.path().join("hlld.a").join("config.ini");
        assert!(config_path.exists());
    }
}

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::segments::{self, BucketKey};
use crate::task::{self, Join};

const SECS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct CleanerOptions {
    pub file_format: String,
    /// Merged files older than this are deleted
    pub retention: Duration,
    pub check_interval: Duration,
    /// Unmerged segments older than this are flagged as orphans
    pub orphan_age: Duration,
    /// Delete orphans once they are past both `retention` and `orphan_age`
    pub purge_expired_orphans: bool,
    pub join_timeout: Duration,
}

impl CleanerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            file_format: config.recording.file_format.clone(),
            retention: Duration::from_secs(u64::from(config.recording.retention_days) * SECS_PER_DAY),
            check_interval: Duration::from_secs(config.cleaner.check_interval),
            orphan_age: Duration::from_secs(config.cleaner.orphan_age_hours * 60 * 60),
            purge_expired_orphans: config.cleaner.purge_expired_orphans,
            join_timeout: Duration::from_secs(config.cleaner.join_timeout),
        }
    }

    /// Age at which an orphan may be deleted
    pub fn orphan_purge_age(&self) -> Duration {
        self.retention.max(self.orphan_age)
    }
}

impl Default for CleanerOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Per-cycle totals across all roots
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub merged_deleted: usize,
    pub segments_deleted: usize,
    pub orphans_flagged: usize,
    pub orphans_purged: usize,
    pub bytes_freed: u64,
}

impl CleanupReport {
    pub fn files_deleted(&self) -> usize {
        self.merged_deleted + self.segments_deleted + self.orphans_purged
    }
}

/// Applies the retention policy to every stream's output directory
pub struct RetentionCleaner {
    worker: Arc<Sweeper>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RetentionCleaner {
    /// `roots` are stream output directories, each holding `segments/` and
    /// `merged/`
    pub fn new(roots: Vec<PathBuf>, options: CleanerOptions) -> Self {
        Self {
            worker: Arc::new(Sweeper { roots, options }),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn start(&mut self) {
        if self.is_running() {
            tracing::warn!("cleaner already running");
            return;
        }

        self.cancel = CancellationToken::new();
        let worker = Arc::clone(&self.worker);
        let cancel = self.cancel.clone();

        self.task = Some(tokio::spawn(async move {
            let interval = worker.options.check_interval;
            tracing::info!(
                ?interval,
                retention_days = worker.options.retention.as_secs() / SECS_PER_DAY,
                "cleaner loop started"
            );
            loop {
                let sweep = Arc::clone(&worker);
                if let Err(e) = tokio::task::spawn_blocking(move || sweep.run_cycle_at(SystemTime::now())).await {
                    tracing::error!(error = %e, "cleanup cycle panicked");
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            tracing::info!("cleaner loop exited");
        }));
        tracing::info!("cleaner started");
    }

    /// Cancel the loop and wait for an in-flight sweep, up to the join
    /// timeout. A sweep that overruns keeps the cleaner marked as running.
    pub async fn stop(&mut self) {
        self.cancel.cancel();

        let timeout = self.worker.options.join_timeout;
        match task::join_bounded(&mut self.task, timeout).await {
            Join::Idle => {}
            Join::Finished => tracing::info!("cleaner stopped"),
            Join::Failed(e) => tracing::error!(error = %e, "cleaner task failed"),
            Join::TimedOut => tracing::warn!(?timeout, "cleaner did not stop in time, sweep still running"),
        }
    }

    pub fn is_running(&self) -> bool {
        task::is_running(&self.task)
    }

    /// Run one cleanup pass as if the clock read `now`. Blocking.
    pub fn run_cycle_at(&self, now: SystemTime) -> CleanupReport {
        self.worker.run_cycle_at(now)
    }
}

impl Drop for RetentionCleaner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Sweeper {
    roots: Vec<PathBuf>,
    options: CleanerOptions,
}

impl Sweeper {
    fn run_cycle_at(&self, now: SystemTime) -> CleanupReport {
        let mut report = CleanupReport::default();

        for root in &self.roots {
            if !root.is_dir() {
                tracing::warn!(dir = %root.display(), "recording directory does not exist");
                continue;
            }
            tracing::debug!(dir = %root.display(), "scanning");
            self.clean_root(root, now, &mut report);
        }

        if report.files_deleted() > 0 {
            tracing::info!(
                files = report.files_deleted(),
                merged = report.merged_deleted,
                segments = report.segments_deleted,
                orphans_purged = report.orphans_purged,
                freed = %format_bytes(report.bytes_freed),
                "cleanup completed"
            );
            for root in &self.roots {
                match DiskUsage::of(root) {
                    Ok(usage) => tracing::info!(dir = %root.display(), disk = %usage, "disk usage"),
                    Err(e) => tracing::debug!(dir = %root.display(), error = %e, "cannot read disk usage"),
                }
            }
        } else {
            tracing::debug!("no old files to clean");
        }

        if report.orphans_flagged > 0 {
            tracing::warn!(count = report.orphans_flagged, "unmerged segments past orphan cutoff");
        }

        report
    }

    fn clean_root(&self, root: &Path, now: SystemTime, report: &mut CleanupReport) {
        let merged_dir = segments::merged_dir(root);
        let segments_dir = segments::segments_dir(root);
        let format = &self.options.file_format;

        // Without a merged directory nothing has been aggregated yet, so no
        // segment can be superseded
        if !merged_dir.is_dir() {
            return;
        }

        let merged = match segments::scan_merged(&merged_dir, format) {
            Ok(merged) => merged,
            Err(e) => {
                tracing::error!(error = %e, "failed to scan merged files");
                return;
            }
        };

        let merged_keys: HashSet<BucketKey> = merged.iter().map(|m| m.key).collect();

        for file in &merged {
            if age(now, file.modified) > self.options.retention && remove(&file.path) {
                tracing::info!(
                    file = %file.path.display(),
                    size = %format_bytes(file.size_bytes),
                    "deleted old merged file"
                );
                report.merged_deleted += 1;
                report.bytes_freed += file.size_bytes;
            }
        }

        if !segments_dir.is_dir() {
            return;
        }

        let segment_files = match segments::scan_segments(&segments_dir, format) {
            Ok(files) => files,
            Err(e) => {
                tracing::error!(error = %e, "failed to scan segments");
                return;
            }
        };

        for segment in segment_files {
            if merged_keys.contains(&segment.bucket()) {
                if remove(&segment.path) {
                    tracing::debug!(file = %segment.path.display(), "deleted merged segment");
                    report.segments_deleted += 1;
                    report.bytes_freed += segment.size_bytes;
                }
                continue;
            }

            let segment_age = age(now, segment.modified);
            if segment_age <= self.options.orphan_age {
                continue;
            }

            if self.options.purge_expired_orphans && segment_age > self.options.orphan_purge_age() {
                if remove(&segment.path) {
                    tracing::warn!(
                        file = %segment.path.display(),
                        age_hours = segment_age.as_secs() / 3600,
                        "purged expired orphan segment"
                    );
                    report.orphans_purged += 1;
                    report.bytes_freed += segment.size_bytes;
                }
            } else {
                tracing::warn!(
                    file = %segment.path.display(),
                    age_hours = segment_age.as_secs() / 3600,
                    "orphan segment, no merged file for its minute"
                );
                report.orphans_flagged += 1;
            }
        }
    }
}

/// Age of a file at `now`; files from the future count as new
fn age(now: SystemTime, modified: SystemTime) -> Duration {
    now.duration_since(modified).unwrap_or(Duration::ZERO)
}

fn remove(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            tracing::error!(file = %path.display(), error = %e, "error deleting file");
            false
        }
    }
}

/// Space on the filesystem holding an output root
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl DiskUsage {
    pub fn of(path: &Path) -> Result<Self, DiskError> {
        let stat = nix::sys::statvfs::statvfs(path).map_err(|source| DiskError::Stat {
            path: path.to_path_buf(),
            source,
        })?;

        let block = stat.fragment_size() as u64;
        let usage = Self {
            total_bytes: stat.blocks() as u64 * block,
            available_bytes: stat.blocks_available() as u64 * block,
        };
        if usage.total_bytes == 0 {
            return Err(DiskError::Empty(path.to_path_buf()));
        }
        Ok(usage)
    }

    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.available_bytes)
    }

    /// Share of the filesystem not available to us, 0 to 100
    pub fn used_percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 0;
        }
        let percent = u128::from(self.used_bytes()) * 100 / u128::from(self.total_bytes);
        percent.min(100) as u8
    }
}

impl std::fmt::Display for DiskUsage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} of {} used ({}%), {} free",
            format_bytes(self.used_bytes()),
            format_bytes(self.total_bytes),
            self.used_percent(),
            format_bytes(self.available_bytes)
        )
    }
}

/// Binary-prefixed size with one decimal, e.g. `1.5 GiB`
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

#[derive(Debug, thiserror::Error)]
pub enum DiskError {
    #[error("statvfs {}: {source}", path.display())]
    Stat { path: PathBuf, source: nix::Error },
    #[error("filesystem under {} reports no blocks", .0.display())]
    Empty(PathBuf),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HOUR: Duration = Duration::from_secs(3600);
    const DAY: Duration = Duration::from_secs(SECS_PER_DAY);

    struct Root {
        dir: TempDir,
        now: SystemTime,
    }

    impl Root {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir_all(dir.path().join("segments")).unwrap();
            std::fs::create_dir_all(dir.path().join("merged")).unwrap();
            Self {
                dir,
                now: SystemTime::now(),
            }
        }

        fn write(&self, sub: &str, name: &str, size: usize, age: Duration) -> PathBuf {
            let path = self.dir.path().join(sub).join(name);
            std::fs::write(&path, vec![1u8; size]).unwrap();
            std::fs::File::options()
                .write(true)
                .open(&path)
                .unwrap()
                .set_modified(self.now - age)
                .unwrap();
            path
        }

        fn cleaner(&self, options: CleanerOptions) -> RetentionCleaner {
            RetentionCleaner::new(vec![self.dir.path().to_path_buf()], options)
        }
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(1024 * 1024), "1.0 MiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024 / 2), "1.5 GiB");
        assert_eq!(format_bytes(2048 * 1024 * 1024 * 1024 * 1024), "2048.0 TiB");
    }

    #[test]
    fn test_disk_usage_summary() {
        let usage = DiskUsage {
            total_bytes: 4 * 1024 * 1024 * 1024,
            available_bytes: 1024 * 1024 * 1024,
        };
        assert_eq!(usage.used_bytes(), 3 * 1024 * 1024 * 1024);
        assert_eq!(usage.used_percent(), 75);
        assert_eq!(usage.to_string(), "3.0 GiB of 4.0 GiB used (75%), 1.0 GiB free");

        let empty = DiskUsage {
            total_bytes: 0,
            available_bytes: 0,
        };
        assert_eq!(empty.used_percent(), 0);
    }

    #[test]
    fn test_disk_usage_of_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let usage = DiskUsage::of(dir.path()).unwrap();
        assert!(usage.total_bytes > 0);
        assert!(usage.available_bytes <= usage.total_bytes);
        assert!(usage.used_percent() <= 100);

        assert!(matches!(
            DiskUsage::of(Path::new("/nonexistent/cam")),
            Err(DiskError::Stat { .. })
        ));
    }

    #[test]
    fn test_options_from_config() {
        let options = CleanerOptions::default();
        assert_eq!(options.retention, 7 * DAY);
        assert_eq!(options.orphan_age, DAY);
        assert_eq!(options.check_interval, HOUR);
        assert_eq!(options.orphan_purge_age(), 7 * DAY);
    }

    #[test]
    fn test_expired_merged_files_deleted() {
        let root = Root::new();
        let old = root.write("merged", "20250101_1200.mp4", 4096, 8 * DAY);
        let recent = root.write("merged", "20250108_1200.mp4", 4096, 6 * DAY);

        let report = root.cleaner(CleanerOptions::default()).run_cycle_at(root.now);

        assert_eq!(report.merged_deleted, 1);
        assert_eq!(report.bytes_freed, 4096);
        assert!(!old.exists());
        assert!(recent.exists());
    }

    #[test]
    fn test_superseded_segments_deleted() {
        let root = Root::new();
        root.write("merged", "20250101_1200.mp4", 4096, HOUR);
        let covered = root.write("segments", "20250101_120030.mp4", 2048, HOUR);
        let uncovered = root.write("segments", "20250101_120100.mp4", 2048, HOUR);

        let report = root.cleaner(CleanerOptions::default()).run_cycle_at(root.now);

        assert_eq!(report.segments_deleted, 1);
        assert_eq!(report.bytes_freed, 2048);
        assert!(!covered.exists());
        assert!(uncovered.exists());
    }

    #[test]
    fn test_orphans_flagged_not_deleted() {
        let root = Root::new();
        let young = root.write("segments", "20250101_120000.mp4", 500, 2 * HOUR);
        let orphan = root.write("segments", "20250101_130000.mp4", 500, 2 * DAY);
        let older = root.write("segments", "20250101_140000.mp4", 500, 7 * DAY - HOUR);

        let report = root.cleaner(CleanerOptions::default()).run_cycle_at(root.now);

        assert_eq!(report.orphans_flagged, 2);
        assert_eq!(report.files_deleted(), 0);
        assert!(young.exists());
        assert!(orphan.exists());
        assert!(older.exists());
    }

    #[test]
    fn test_expired_orphans_purged() {
        let root = Root::new();
        let expired = root.write("segments", "20250101_120000.mp4", 500, 8 * DAY);

        let report = root.cleaner(CleanerOptions::default()).run_cycle_at(root.now);

        assert_eq!(report.orphans_purged, 1);
        assert_eq!(report.bytes_freed, 500);
        assert!(!expired.exists());
    }

    #[test]
    fn test_flag_only_policy_keeps_expired_orphans() {
        let root = Root::new();
        let expired = root.write("segments", "20250101_120000.mp4", 500, 30 * DAY);

        let options = CleanerOptions {
            purge_expired_orphans: false,
            ..Default::default()
        };
        let report = root.cleaner(options).run_cycle_at(root.now);

        assert_eq!(report.orphans_flagged, 1);
        assert_eq!(report.orphans_purged, 0);
        assert!(expired.exists());
    }

    #[test]
    fn test_segments_untouched_without_merged_dir() {
        let root = Root::new();
        std::fs::remove_dir(root.dir.path().join("merged")).unwrap();
        let segment = root.write("segments", "20250101_120000.mp4", 500, 30 * DAY);

        let report = root.cleaner(CleanerOptions::default()).run_cycle_at(root.now);

        assert_eq!(report, CleanupReport::default());
        assert!(segment.exists());
    }

    #[test]
    fn test_ignores_foreign_files() {
        let root = Root::new();
        let notes = root.write("merged", "notes.txt", 10, 30 * DAY);
        let odd = root.write("merged", "backup.mp4", 10, 30 * DAY);
        let tmp = root.write("merged", "20250101_1200.mp4.tmp", 10, 30 * DAY);

        let report = root.cleaner(CleanerOptions::default()).run_cycle_at(root.now);

        assert_eq!(report.files_deleted(), 0);
        assert!(notes.exists());
        assert!(odd.exists());
        assert!(tmp.exists());
    }

    #[test]
    fn test_missing_root_skipped() {
        let root = Root::new();
        let expired = root.write("merged", "20250101_1200.mp4", 10, 30 * DAY);
        let cleaner = RetentionCleaner::new(
            vec![PathBuf::from("/nonexistent/cam"), root.dir.path().to_path_buf()],
            CleanerOptions::default(),
        );

        let report = cleaner.run_cycle_at(root.now);

        assert_eq!(report.merged_deleted, 1);
        assert!(!expired.exists());
    }

    #[tokio::test]
    async fn test_start_stop() {
        let root = Root::new();
        let expired = root.write("merged", "20250101_1200.mp4", 10, 30 * DAY);
        let mut cleaner = root.cleaner(CleanerOptions::default());

        cleaner.start();
        assert!(cleaner.is_running());

        // First cycle runs immediately
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while expired.exists() && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!expired.exists());

        cleaner.stop().await;
        assert!(!cleaner.is_running());
        cleaner.stop().await;
    }
}

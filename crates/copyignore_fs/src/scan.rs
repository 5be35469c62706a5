//! Discovery stage: breadth-first walk feeding a pool of repository workers.
//!
//! The walk runs on the calling thread and pushes repository roots into a
//! bounded job queue. Scan workers drain it, enumerate each repository and
//! stream entries into the caller's entry queue as soon as one repository is
//! done. Bounded queues on both sides keep memory flat on large trees.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use rayon::ThreadPoolBuilder;

use crate::collect::IgnoredFileCollector;
use crate::exclude::Excluder;
use crate::locate::RepositoryLocator;
use crate::report::ReportScan;
use crate::spec::{BackupRunError, SpecDiscoveredEntry};
use crate::util::calculate_worker_limit;
use crate::vcs::IgnoreOracle;

#[derive(Debug, Default)]
struct ScanCounters {
    cnt_repositories: AtomicU64,
    cnt_entries: AtomicU64,
    repositories_failed: Mutex<Vec<(PathBuf, String)>>,
}

/// Runs repository discovery and per-repository enumeration.
pub struct ScanOrchestrator<'a> {
    oracle: &'a dyn IgnoreOracle,
    excluder: &'a dyn Excluder,
    path_dir_search: PathBuf,
    n_workers: usize,
    l_paths_skip: Vec<PathBuf>,
}

impl<'a> ScanOrchestrator<'a> {
    pub fn new(oracle: &'a dyn IgnoreOracle, excluder: &'a dyn Excluder, path_dir_search: &Path) -> Self {
        Self {
            oracle,
            excluder,
            path_dir_search: path_dir_search.to_path_buf(),
            n_workers: calculate_worker_limit(None),
            l_paths_skip: Vec::new(),
        }
    }

    /// Number of scan workers; `None` means host parallelism.
    pub fn with_workers(mut self, num_workers: Option<usize>) -> Self {
        self.n_workers = calculate_worker_limit(num_workers);
        self
    }

    /// Subtrees the walk must not enter.
    pub fn with_skipped_paths<I>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = PathBuf>,
    {
        self.l_paths_skip.extend(paths);
        self
    }

    /// Walk the search root and send every discovered entry to `tx_entries`.
    ///
    /// Returns once all workers have finished. `on_visit` is called on the
    /// calling thread for every visited directory. A closed entry queue
    /// cancels the remaining work.
    pub fn run<V>(
        &self,
        tx_entries: &Sender<SpecDiscoveredEntry>,
        on_visit: V,
    ) -> Result<ReportScan, BackupRunError>
    where
        V: FnMut(&Path),
    {
        let time_start = Instant::now();
        tracing::info!(
            search_root = %self.path_dir_search.display(),
            workers = self.n_workers,
            "Scanning for repositories"
        );

        let flag_cancel = AtomicBool::new(false);
        let counters = ScanCounters::default();
        let collector = IgnoredFileCollector::new(self.oracle, self.excluder, &self.path_dir_search);
        let locator = RepositoryLocator::new(self.oracle)
            .with_skipped_paths(self.l_paths_skip.iter().cloned())
            .with_cancel_flag(&flag_cancel);

        let res_walk = match ThreadPoolBuilder::new()
            .num_threads(self.n_workers)
            .thread_name(|idx| format!("copy-ignore-scan-{idx}"))
            .build()
        {
            Ok(pool) => {
                let (tx_jobs, rx_jobs) = bounded::<PathBuf>(self.n_workers * 2);
                thread::scope(|scope| {
                    let handle_workers = scope.spawn(|| {
                        pool.scope(|scope_pool| {
                            for _ in 0..self.n_workers {
                                scope_pool.spawn(|_| {
                                    self.drain_jobs(&rx_jobs, &collector, tx_entries, &counters, &flag_cancel)
                                });
                            }
                        })
                    });

                    let res_walk = locator.walk(&self.path_dir_search, on_visit, |path_repo| {
                        if self.accept_repository(&path_repo, &counters)
                            && tx_jobs.send(path_repo).is_err()
                        {
                            flag_cancel.store(true, Ordering::Relaxed);
                        }
                    });
                    if res_walk.is_err() {
                        flag_cancel.store(true, Ordering::Relaxed);
                    }
                    drop(tx_jobs);
                    match handle_workers.join() {
                        Ok(()) => res_walk,
                        Err(_) => Err(BackupRunError::WorkerPanicked("scan")),
                    }
                })
            }
            Err(e) => {
                tracing::warn!(error = %e, "Scan pool unavailable; falling back to serial enumeration");
                locator.walk(&self.path_dir_search, on_visit, |path_repo| {
                    if self.accept_repository(&path_repo, &counters) {
                        self.process_repository(&path_repo, &collector, tx_entries, &counters, &flag_cancel);
                    }
                })
            }
        };
        let summary_walk = res_walk?;

        let report = ReportScan {
            cnt_dirs_visited: summary_walk.cnt_dirs_visited,
            dirs_unreadable: summary_walk.dirs_unreadable,
            cnt_repositories: counters.cnt_repositories.into_inner(),
            cnt_entries: counters.cnt_entries.into_inner(),
            repositories_failed: counters.repositories_failed.into_inner(),
            duration_elapsed: time_start.elapsed(),
            if_completed: !flag_cancel.into_inner(),
        };
        tracing::info!("{report}");
        Ok(report)
    }

    fn accept_repository(&self, path_repo: &Path, counters: &ScanCounters) -> bool {
        if self.excluder.should_exclude(path_repo) {
            tracing::debug!(repo = %path_repo.display(), "Excluded repository");
            return false;
        }
        counters.cnt_repositories.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn drain_jobs(
        &self,
        rx_jobs: &Receiver<PathBuf>,
        collector: &IgnoredFileCollector<'_>,
        tx_entries: &Sender<SpecDiscoveredEntry>,
        counters: &ScanCounters,
        flag_cancel: &AtomicBool,
    ) {
        for path_repo in rx_jobs.iter() {
            // Keep draining after cancellation so the walk never blocks on a full queue.
            if flag_cancel.load(Ordering::Relaxed) {
                continue;
            }
            self.process_repository(&path_repo, collector, tx_entries, counters, flag_cancel);
        }
    }

    fn process_repository(
        &self,
        path_repo: &Path,
        collector: &IgnoredFileCollector<'_>,
        tx_entries: &Sender<SpecDiscoveredEntry>,
        counters: &ScanCounters,
        flag_cancel: &AtomicBool,
    ) {
        let time_repo = Instant::now();
        match collector.collect(path_repo) {
            Ok(l_entries) => {
                let n_entries = l_entries.len();
                for spec_entry in l_entries {
                    if tx_entries.send(spec_entry).is_err() {
                        tracing::debug!("Entry queue closed; cancelling scan");
                        flag_cancel.store(true, Ordering::Relaxed);
                        return;
                    }
                    counters.cnt_entries.fetch_add(1, Ordering::Relaxed);
                }
                tracing::info!(
                    repo = %path_repo.display(),
                    entries = n_entries,
                    elapsed_ms = time_repo.elapsed().as_millis() as u64,
                    "Repository scanned"
                );
            }
            Err(e) => {
                tracing::warn!(repo = %path_repo.display(), error = %e, "Repository enumeration failed; skipping");
                counters
                    .repositories_failed
                    .lock()
                    .push((path_repo.to_path_buf(), e.to_string()));
            }
        }
    }
}

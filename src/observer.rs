//! Watches a recording's output directory and reports finished segments and
//! manifest rewrites.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HlsEvent {
    SegmentComplete { order: u64, path: PathBuf },
    ManifestUpdated { path: PathBuf, last_segment: Option<String> },
}

pub struct SegmentObserver {
    dir: PathBuf,
    manifest: PathBuf,
    stem: String,
    completed: BTreeSet<u64>,
    manifest_stamp: Option<(SystemTime, u64)>,
}

impl SegmentObserver {
    pub fn new(manifest: impl AsRef<Path>) -> Self {
        let manifest = manifest.as_ref().to_path_buf();
        let dir = manifest
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let stem = manifest
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            dir,
            manifest,
            stem,
            completed: BTreeSet::new(),
            manifest_stamp: None,
        }
    }

    fn segment_order(&self, name: &str) -> Option<u64> {
        name.strip_prefix(&self.stem)?
            .strip_suffix(".ts")?
            .parse()
            .ok()
    }

    /// Compare the directory against the last scan. The newest segment counts as
    /// complete only when a later one exists or `final_scan` is set.
    pub fn scan(&mut self, final_scan: bool) -> anyhow::Result<Vec<HlsEvent>> {
        let mut events = Vec::new();

        let mut segments: Vec<(u64, PathBuf)> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name();
                self.segment_order(&name.to_string_lossy())
                    .map(|order| (order, entry.path()))
            })
            .collect();
        segments.sort();
        let newest = segments.last().map(|(order, _)| *order);
        for (order, path) in segments {
            if (Some(order) == newest && !final_scan) || self.completed.contains(&order) {
                continue;
            }
            self.completed.insert(order);
            events.push(HlsEvent::SegmentComplete { order, path });
        }

        if let Ok(meta) = std::fs::metadata(&self.manifest) {
            let stamp = (meta.modified()?, meta.len());
            if self.manifest_stamp != Some(stamp) {
                self.manifest_stamp = Some(stamp);
                let last_segment = std::fs::read_to_string(&self.manifest)?
                    .lines()
                    .rev()
                    .map(str::trim)
                    .find(|line| !line.is_empty() && !line.starts_with('#'))
                    .map(str::to_string);
                events.push(HlsEvent::ManifestUpdated {
                    path: self.manifest.clone(),
                    last_segment,
                });
            }
        }
        Ok(events)
    }

    /// Poll every `period` until cancelled, then scan once more with every
    /// segment treated as complete.
    pub fn spawn(
        mut self,
        period: Duration,
        cancel: CancellationToken,
    ) -> broadcast::Sender<HlsEvent> {
        let (tx, _) = broadcast::channel(64);
        let sender = tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                let final_scan = tokio::select! {
                    _ = cancel.cancelled() => true,
                    _ = interval.tick() => false,
                };
                match self.scan(final_scan) {
                    Ok(events) => {
                        for event in events {
                            let _ = sender.send(event);
                        }
                    }
                    Err(e) => log::debug!("scan {} failed: {}", self.dir.display(), e),
                }
                if final_scan {
                    break;
                }
            }
            log::info!("segment observer for {} stopped", self.manifest.display());
        });
        tx
    }
}

/// Log every event until the channel closes.
pub fn log_events(mut rx: broadcast::Receiver<HlsEvent>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(HlsEvent::SegmentComplete { order, path }) => {
                    log::info!("segment {} complete: {}", order, path.display());
                }
                Ok(HlsEvent::ManifestUpdated { path, last_segment }) => {
                    log::debug!(
                        "manifest {} updated, last segment {:?}",
                        path.display(),
                        last_segment
                    );
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("segment observer lagged, {} events skipped", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

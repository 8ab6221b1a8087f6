//! Reclaiming finished job directories from the output root.

use std::fs;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RetentionConfig;
use crate::job::JobId;
use crate::workspace::Workspace;

/// Decides whether a job directory of a given age may be deleted.
pub trait RetentionPolicy: Send + Sync {
    fn name(&self) -> &'static str;
    fn should_reclaim(&self, age: Duration) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KeepAll;

impl RetentionPolicy for KeepAll {
    fn name(&self) -> &'static str {
        "keep_all"
    }

    fn should_reclaim(&self, _age: Duration) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MaxAge(pub Duration);

impl RetentionPolicy for MaxAge {
    fn name(&self) -> &'static str {
        "max_age"
    }

    fn should_reclaim(&self, age: Duration) -> bool {
        age > self.0
    }
}

pub fn policy_from_config(config: &RetentionConfig) -> Arc<dyn RetentionPolicy> {
    match config.max_age() {
        Some(max_age) => Arc::new(MaxAge(max_age)),
        None => Arc::new(KeepAll),
    }
}

/// Delete every job directory the policy reclaims, skipping jobs for which
/// `is_active` holds and entries whose name is not a job id. Returns how many
/// directories were removed.
pub fn sweep(
    workspace: &Workspace,
    policy: &dyn RetentionPolicy,
    is_active: &dyn Fn(JobId) -> bool,
    now: SystemTime,
) -> usize {
    let entries = match fs::read_dir(workspace.output_root()) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(
                output_root = %workspace.output_root().display(),
                error = %err,
                "Failed to read output root for retention sweep"
            );
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        let Ok(id) = JobId::parse(&name) else {
            continue;
        };
        if is_active(id) {
            continue;
        }

        let modified = match entry.metadata().and_then(|meta| {
            if meta.is_dir() {
                meta.modified()
            } else {
                Err(std::io::Error::other("not a directory"))
            }
        }) {
            Ok(modified) => modified,
            Err(_) => continue,
        };
        let age = now.duration_since(modified).unwrap_or_default();
        if !policy.should_reclaim(age) {
            continue;
        }

        match fs::remove_dir_all(entry.path()) {
            Ok(()) => {
                debug!(job_id = %id, age_secs = age.as_secs(), "Reclaimed job directory");
                removed += 1;
            }
            Err(err) => warn!(job_id = %id, error = %err, "Failed to reclaim job directory"),
        }
    }
    removed
}

/// Periodically sweep the output root until `cancel` fires. Returns `None`
/// when the policy never reclaims anything.
pub fn spawn_sweeper(
    workspace: Workspace,
    config: &RetentionConfig,
    is_active: Arc<dyn Fn(JobId) -> bool + Send + Sync>,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    let max_age = config.max_age()?;
    let policy = policy_from_config(config);
    let period = config.sweep_interval();
    info!(
        policy = policy.name(),
        max_age_secs = max_age.as_secs(),
        interval_secs = period.as_secs(),
        "Starting retention sweeper"
    );

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => break,
            }

            let workspace = workspace.clone();
            let policy = Arc::clone(&policy);
            let is_active = Arc::clone(&is_active);
            let swept = tokio::task::spawn_blocking(move || {
                sweep(&workspace, policy.as_ref(), is_active.as_ref(), SystemTime::now())
            })
            .await;
            match swept {
                Ok(0) => {}
                Ok(removed) => info!(removed, "Retention sweep finished"),
                Err(err) => warn!(error = %err, "Retention sweep task failed"),
            }
        }
        debug!("Retention sweeper stopped");
    }))
}

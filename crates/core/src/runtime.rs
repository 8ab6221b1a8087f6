use std::env;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output, Stdio};
use std::time::Duration;

use tokio::process::Command;

/// Failure modes of one external tool invocation.
#[derive(thiserror::Error, Debug)]
pub enum ToolError {
    #[error("failed to launch {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{binary} timed out after {}s", .timeout.as_secs_f64())]
    TimedOut { binary: String, timeout: Duration },

    #[error("{binary} exited with {status}: {stderr}")]
    Failed {
        binary: String,
        status: ExitStatus,
        stderr: String,
    },
}

fn candidate_bin_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            dirs.push(exe_dir.to_path_buf());
            dirs.push(exe_dir.join("bin"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("bin"));
            }
        }
    }

    if let Ok(cwd) = env::current_dir() {
        let cwd_bin = cwd.join("bin");
        if !dirs.contains(&cwd_bin) {
            dirs.push(cwd_bin);
        }
    }

    dirs
}

#[cfg(unix)]
fn candidate_binary_names(binary: &str) -> Vec<String> {
    vec![binary.to_string()]
}

#[cfg(windows)]
fn candidate_binary_names(binary: &str) -> Vec<String> {
    let lower = binary.to_ascii_lowercase();
    if lower.ends_with(".exe") || lower.ends_with(".cmd") || lower.ends_with(".bat") {
        return vec![binary.to_string()];
    }

    vec![format!("{binary}.exe"), binary.to_string()]
}

fn find_binary_in_dirs(binary: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    let names = candidate_binary_names(binary);
    for dir in dirs {
        for name in &names {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Resolve a configured tool to something spawnable.
///
/// Explicit paths are used verbatim. Bare names are looked up next to the
/// executable and in nearby `bin/` directories before falling back to `PATH`.
pub fn resolve_binary(binary: &str) -> PathBuf {
    if Path::new(binary).components().count() > 1 {
        return PathBuf::from(binary);
    }
    find_binary_in_dirs(binary, &candidate_bin_dirs()).unwrap_or_else(|| PathBuf::from(binary))
}

pub fn command_for(binary: &str) -> Command {
    let mut command = Command::new(resolve_binary(binary));
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    command
}

/// Run a tool to completion under `timeout`.
///
/// A timed-out child is killed when its future is dropped. A non-zero exit is
/// reported as [`ToolError::Failed`] carrying the trimmed stderr.
pub async fn run_tool<I, S>(binary: &str, args: I, timeout: Duration) -> Result<Output, ToolError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = command_for(binary);
    command.args(args);

    let output = match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => {
            return Err(ToolError::Spawn {
                binary: binary.to_string(),
                source,
            })
        }
        Err(_) => {
            return Err(ToolError::TimedOut {
                binary: binary.to_string(),
                timeout,
            })
        }
    };

    if !output.status.success() {
        return Err(ToolError::Failed {
            binary: binary.to_string(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_bin_dirs_includes_cwd_bin() {
        let dirs = candidate_bin_dirs();
        if let Ok(cwd) = env::current_dir() {
            assert!(dirs.contains(&cwd.join("bin")));
        }
    }

    #[test]
    fn find_binary_in_dirs_prefers_first_match() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        std::fs::create_dir_all(&first).expect("first dir should be created");
        std::fs::create_dir_all(&second).expect("second dir should be created");

        #[cfg(unix)]
        let binary_name = "potrace";
        #[cfg(windows)]
        let binary_name = "potrace.exe";

        std::fs::write(first.join(binary_name), b"first").expect("first binary should exist");
        std::fs::write(second.join(binary_name), b"second").expect("second binary should exist");

        let resolved = find_binary_in_dirs("potrace", &[first.clone(), second.clone()])
            .expect("binary should be resolved");
        assert_eq!(resolved, first.join(binary_name));
    }

    #[test]
    fn explicit_paths_are_not_searched() {
        let explicit = Path::new("/opt/tools/ffmpeg");
        assert_eq!(
            resolve_binary(explicit.to_str().unwrap()),
            explicit.to_path_buf()
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_tool_reports_non_zero_exit_with_stderr() {
        let err = run_tool("sh", ["-c", "echo broken >&2; exit 3"], Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            ToolError::Failed { stderr, status, .. } => {
                assert_eq!(stderr, "broken");
                assert_eq!(status.code(), Some(3));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_tool_times_out_hung_processes() {
        let err = run_tool("sh", ["-c", "sleep 5"], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn run_tool_reports_missing_binaries() {
        let err = run_tool(
            "framevec-definitely-missing-tool",
            ["--version"],
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_tool_captures_output_on_success() {
        let output = run_tool("sh", ["-c", "printf ok"], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(output.stdout, b"ok");
    }
}

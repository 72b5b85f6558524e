//! Serialized invocation of the rpm engine: one exclusive lock, ordered
//! per-package runs, two-strike interrupt handling, config-file policy and
//! history write-back.

use crate::config::Context;
use crate::db::Database;
use crate::errors::*;
use crate::resolver::{orphans, InstallReason, Resolution, TransactionType};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

const LOCK_WAIT_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigPolicy {
    #[default]
    Keep,
    Replace,
    Ask,
}

impl ConfigPolicy {
    pub fn parse(s: &str) -> ConfigPolicy {
        match s {
            "replace" => ConfigPolicy::Replace,
            "ask" => ConfigPolicy::Ask,
            _ => ConfigPolicy::Keep,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    pub verify_signatures: bool,
    pub force: bool,
    pub test: bool,
    pub no_scripts: bool,
    pub root: Option<PathBuf>,
    pub config_policy: ConfigPolicy,
}

/// `(package, progress line)`
pub type InstallProgressFn = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Decision taken for one `.rpmnew` file under the `ask` policy.
pub type ConfigAskFn = Arc<dyn Fn(&Path) -> ConfigPolicy + Send + Sync>;

pub fn lock_path(root: Option<&Path>) -> PathBuf {
    let root = root.unwrap_or_else(|| Path::new("/"));
    root.join("var/lib/rpm/urpm.lock")
}

fn open_lock(root: Option<&Path>) -> Result<fd_lock::RwLock<std::fs::File>> {
    let path = lock_path(root);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)?;
    Ok(fd_lock::RwLock::new(file))
}

/// Arguments for one rpm invocation.
pub fn rpm_args(
    action: TransactionType,
    target: &str,
    opts: &InstallOptions,
) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    if let Some(root) = &opts.root {
        args.push("--root".to_string());
        args.push(root.display().to_string());
    }
    match action {
        TransactionType::Remove => {
            args.push("-e".to_string());
        }
        other => {
            args.push("-U".to_string());
            args.push("--percent".to_string());
            if other == TransactionType::Downgrade {
                args.push("--oldpackage".to_string());
            }
            if other == TransactionType::Reinstall {
                args.push("--replacepkgs".to_string());
            }
        }
    }
    if !opts.verify_signatures {
        args.push("--nosignature".to_string());
    }
    if opts.force {
        args.push("--force".to_string());
    }
    if opts.test {
        args.push("--test".to_string());
    }
    if opts.no_scripts {
        args.push("--noscripts".to_string());
    }
    args.push("--".to_string());
    args.push(target.to_string());
    args
}

async fn run_rpm(
    action: TransactionType,
    package: &str,
    target: &str,
    opts: &InstallOptions,
    progress: &Option<InstallProgressFn>,
) -> Result<()> {
    let args = rpm_args(action, target, opts);
    debug!("rpm {}", args.join(" "));

    let mut child = Command::new("rpm")
        .args(&args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            if let Some(cb) = progress {
                cb(package, &line);
            }
        }
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines() {
            error!("rpm: {line}");
        }
        return Err(Error::RpmExit(output.status));
    }
    Ok(())
}

/// Post-process `.rpmnew` files under `<root>/etc` according to the
/// configured policy. `replace` moves the live file aside as `.rpmold`
/// and promotes the new one; `ask` consults the callback per file.
pub async fn apply_config_policy(
    root: Option<&Path>,
    policy: ConfigPolicy,
    ask: Option<ConfigAskFn>,
) -> Result<Vec<PathBuf>> {
    let etc = root.unwrap_or_else(|| Path::new("/")).join("etc");
    let mut touched = Vec::new();
    if policy == ConfigPolicy::Keep {
        return Ok(touched);
    }

    let mut stack = vec![etc];
    while let Some(dir) = stack.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(base) = name.strip_suffix(".rpmnew") else {
                continue;
            };
            let live = path.with_file_name(base);

            let decision = match policy {
                ConfigPolicy::Keep => ConfigPolicy::Keep,
                ConfigPolicy::Replace => ConfigPolicy::Replace,
                ConfigPolicy::Ask => match &ask {
                    Some(cb) => cb(&path),
                    None => ConfigPolicy::Keep,
                },
            };

            if decision == ConfigPolicy::Replace {
                if live.exists() {
                    let old = live.with_file_name(format!("{base}.rpmold"));
                    tokio::fs::rename(&live, &old).await?;
                }
                tokio::fs::rename(&path, &live).await?;
                touched.push(live);
            }
        }
    }
    Ok(touched)
}

#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub history_id: i64,
    pub installed: usize,
    pub removed: usize,
    pub config_files_replaced: Vec<PathBuf>,
}

/// Run a resolved transaction against the rpm engine.
///
/// `files` maps rpm file names to their downloaded (or local) paths.
/// Interrupts follow a two-strike policy: the first SIGINT finishes the
/// current package and stops, the second aborts immediately.
#[allow(clippy::too_many_arguments)]
pub async fn execute(
    _ctx: &Context,
    db: &Database,
    resolution: &Resolution,
    files: &HashMap<String, PathBuf>,
    opts: &InstallOptions,
    action_kind: &str,
    command_line: Option<&str>,
    progress: Option<InstallProgressFn>,
    ask: Option<ConfigAskFn>,
) -> Result<ExecutionReport> {
    let history_id = db.begin_history(action_kind, command_line).await?;

    // exclusive install lock, waiting cooperatively on the current holder
    let mut lock = open_lock(opts.root.as_deref())?;
    let guard = {
        let mut waited = false;
        loop {
            match lock.try_write() {
                Ok(guard) => break guard,
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    if !waited {
                        info!(
                            "Waiting for the install lock at {}",
                            lock_path(opts.root.as_deref()).display()
                        );
                        waited = true;
                    }
                    if let Some(cb) = &progress {
                        cb("", "waiting for install lock");
                    }
                    tokio::time::sleep(LOCK_WAIT_INTERVAL).await;
                }
                Err(err) => {
                    db.abort_history(history_id).await?;
                    return Err(err.into());
                }
            }
        }
    };

    let interrupts = Arc::new(AtomicUsize::new(0));
    let interrupt_task = {
        let interrupts = interrupts.clone();
        tokio::spawn(async move {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    break;
                }
                let strikes = interrupts.fetch_add(1, Ordering::SeqCst) + 1;
                if strikes == 1 {
                    eprintln!("Interrupt received, finishing the current package (^C again to abort)");
                }
            }
        })
    };

    let mut report = ExecutionReport {
        history_id,
        ..Default::default()
    };
    let result = execute_steps(db, resolution, files, opts, &progress, &interrupts, history_id, &mut report).await;

    interrupt_task.abort();
    drop(guard);

    match result {
        Ok(()) => {
            report.config_files_replaced =
                apply_config_policy(opts.root.as_deref(), opts.config_policy, ask).await?;
            update_deps_tracking(opts.root.as_deref(), resolution)?;
            db.complete_history(history_id, 0).await?;
            Ok(report)
        }
        Err(err) => {
            db.abort_history(history_id).await?;
            Err(err)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn execute_steps(
    db: &Database,
    resolution: &Resolution,
    files: &HashMap<String, PathBuf>,
    opts: &InstallOptions,
    progress: &Option<InstallProgressFn>,
    interrupts: &AtomicUsize,
    history_id: i64,
    report: &mut ExecutionReport,
) -> Result<()> {
    for action in &resolution.actions {
        match interrupts.load(Ordering::SeqCst) {
            0 => (),
            _ => return Err(Error::Interrupted),
        }

        match action.action {
            TransactionType::Remove => {
                let target = format!("{}-{}", action.name, action.evr);
                run_rpm(action.action, &action.name, &target, opts, progress).await?;
                report.removed += 1;
            }
            _ => {
                let filename =
                    crate::sync::rpm_filename(&action.name, version_of(&action.evr), release_of(&action.evr), &action.arch);
                let Some(path) = files.get(&filename) else {
                    return Err(Error::PackageNotFound(filename));
                };
                run_rpm(
                    action.action,
                    &action.name,
                    &path.display().to_string(),
                    opts,
                    progress,
                )
                .await?;
                report.installed += 1;
            }
        }

        let previous = if action.from_evr.is_empty() {
            None
        } else {
            Some(format!("{}-{}.{}", action.name, action.from_evr, action.arch))
        };
        db.record_history_package(
            history_id,
            &action.nevra,
            &action.name,
            action.action.as_str(),
            action.reason.as_str(),
            previous.as_deref(),
        )
        .await?;

        if interrupts.load(Ordering::SeqCst) >= 2 {
            return Err(Error::Interrupted);
        }
    }
    Ok(())
}

fn version_of(evr: &str) -> &str {
    let vr = evr.split_once(':').map(|(_, vr)| vr).unwrap_or(evr);
    vr.split_once('-').map(|(v, _)| v).unwrap_or(vr)
}

fn release_of(evr: &str) -> &str {
    let vr = evr.split_once(':').map(|(_, vr)| vr).unwrap_or(evr);
    vr.split_once('-').map(|(_, r)| r).unwrap_or("")
}

/// After a completed transaction: dependencies join the auto-installed
/// list, explicitly requested packages leave it, removed packages are
/// dropped from it.
fn update_deps_tracking(root: Option<&Path>, resolution: &Resolution) -> Result<()> {
    let mut as_dependency = Vec::new();
    let mut as_explicit = Vec::new();
    for action in &resolution.actions {
        match action.action {
            TransactionType::Remove => as_explicit.push(action.name.clone()),
            _ => match action.reason {
                InstallReason::Explicit => as_explicit.push(action.name.clone()),
                _ => as_dependency.push(action.name.clone()),
            },
        }
    }
    if !as_dependency.is_empty() {
        orphans::mark_as_dependency(root, &as_dependency)?;
    }
    if !as_explicit.is_empty() {
        orphans::mark_as_explicit(root, &as_explicit)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpm_args_install() {
        let opts = InstallOptions {
            verify_signatures: true,
            ..Default::default()
        };
        let args = rpm_args(TransactionType::Install, "/tmp/vim.rpm", &opts);
        assert_eq!(args, vec!["-U", "--percent", "--", "/tmp/vim.rpm"]);
    }

    #[test]
    fn test_rpm_args_flags() {
        let opts = InstallOptions {
            verify_signatures: false,
            force: true,
            test: true,
            no_scripts: true,
            root: Some(PathBuf::from("/mnt/chroot")),
            config_policy: ConfigPolicy::Keep,
        };
        let args = rpm_args(TransactionType::Downgrade, "/tmp/vim.rpm", &opts);
        assert_eq!(
            args,
            vec![
                "--root",
                "/mnt/chroot",
                "-U",
                "--percent",
                "--oldpackage",
                "--nosignature",
                "--force",
                "--test",
                "--noscripts",
                "--",
                "/tmp/vim.rpm"
            ]
        );
    }

    #[test]
    fn test_rpm_args_remove() {
        let opts = InstallOptions {
            verify_signatures: true,
            ..Default::default()
        };
        let args = rpm_args(TransactionType::Remove, "vim-9.0-1.mga9", &opts);
        assert_eq!(args, vec!["-e", "--", "vim-9.0-1.mga9"]);
    }

    #[test]
    fn test_evr_split_helpers() {
        assert_eq!(version_of("9.0-1.mga9"), "9.0");
        assert_eq!(release_of("9.0-1.mga9"), "1.mga9");
        assert_eq!(version_of("3:8.4.2-1.mga9"), "8.4.2");
        assert_eq!(release_of("3:8.4.2-1.mga9"), "1.mga9");
    }

    #[tokio::test]
    async fn test_apply_config_policy_replace() {
        let root = tempfile::tempdir().unwrap();
        let etc = root.path().join("etc");
        tokio::fs::create_dir_all(&etc).await.unwrap();
        tokio::fs::write(etc.join("app.conf"), b"old settings")
            .await
            .unwrap();
        tokio::fs::write(etc.join("app.conf.rpmnew"), b"new settings")
            .await
            .unwrap();

        let touched = apply_config_policy(Some(root.path()), ConfigPolicy::Replace, None)
            .await
            .unwrap();
        assert_eq!(touched.len(), 1);
        assert_eq!(
            tokio::fs::read(etc.join("app.conf")).await.unwrap(),
            b"new settings"
        );
        assert_eq!(
            tokio::fs::read(etc.join("app.conf.rpmold")).await.unwrap(),
            b"old settings"
        );
        assert!(!etc.join("app.conf.rpmnew").exists());
    }

    #[tokio::test]
    async fn test_apply_config_policy_keep() {
        let root = tempfile::tempdir().unwrap();
        let etc = root.path().join("etc");
        tokio::fs::create_dir_all(&etc).await.unwrap();
        tokio::fs::write(etc.join("app.conf"), b"old").await.unwrap();
        tokio::fs::write(etc.join("app.conf.rpmnew"), b"new")
            .await
            .unwrap();

        let touched = apply_config_policy(Some(root.path()), ConfigPolicy::Keep, None)
            .await
            .unwrap();
        assert!(touched.is_empty());
        assert_eq!(tokio::fs::read(etc.join("app.conf")).await.unwrap(), b"old");
        assert!(etc.join("app.conf.rpmnew").exists());
    }

    #[tokio::test]
    async fn test_apply_config_policy_ask() {
        let root = tempfile::tempdir().unwrap();
        let etc = root.path().join("etc");
        tokio::fs::create_dir_all(&etc).await.unwrap();
        tokio::fs::write(etc.join("a.conf"), b"old-a").await.unwrap();
        tokio::fs::write(etc.join("a.conf.rpmnew"), b"new-a").await.unwrap();
        tokio::fs::write(etc.join("b.conf"), b"old-b").await.unwrap();
        tokio::fs::write(etc.join("b.conf.rpmnew"), b"new-b").await.unwrap();

        // replace a.conf, keep b.conf
        let ask: ConfigAskFn = Arc::new(|path: &Path| {
            if path.file_name().unwrap().to_str().unwrap().starts_with("a.") {
                ConfigPolicy::Replace
            } else {
                ConfigPolicy::Keep
            }
        });
        let touched = apply_config_policy(Some(root.path()), ConfigPolicy::Ask, Some(ask))
            .await
            .unwrap();
        assert_eq!(touched.len(), 1);
        assert_eq!(tokio::fs::read(etc.join("a.conf")).await.unwrap(), b"new-a");
        assert_eq!(tokio::fs::read(etc.join("b.conf")).await.unwrap(), b"old-b");
        assert!(etc.join("b.conf.rpmnew").exists());
    }

    #[test]
    fn test_lock_path() {
        assert_eq!(
            lock_path(None),
            PathBuf::from("/var/lib/rpm/urpm.lock")
        );
        assert_eq!(
            lock_path(Some(Path::new("/mnt/chroot"))),
            PathBuf::from("/mnt/chroot/var/lib/rpm/urpm.lock")
        );
    }
}

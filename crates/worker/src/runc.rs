//! Container invocation: per-run OCI bundle assembly and the `runc`
//! child process.

use std::path::Path;
use std::time::Duration;

use tokio::process::Command;
use tracing::warn;

/// Upper bound on a single container run.
pub const RUN_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("failed to launch runc: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("container run exceeded {0:?}")]
    TimedOut(Duration),
}

/// Captured result of a finished container.
#[derive(Debug)]
pub struct RunOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Build the OCI runtime config for one run: a rootless-ish python3
/// container whose root filesystem is the mounted `app` tree.
pub fn oci_config(script_name: &str, rootfs: &Path) -> serde_json::Value {
    let rootfs = rootfs.display().to_string();
    let lib64 = format!("{rootfs}/usr/lib64");
    serde_json::json!({
        "ociVersion": "1.2.0",
        "process": {
            "terminal": false,
            "user": { "uid": 0, "gid": 0 },
            "args": ["/usr/bin/env", "python3", format!("/{script_name}")],
            "env": [
                "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
                "TERM=xterm"
            ],
            "cwd": "/",
            "capabilities": {
                "bounding": ["CAP_AUDIT_WRITE", "CAP_KILL", "CAP_NET_BIND_SERVICE"],
                "effective": ["CAP_AUDIT_WRITE", "CAP_KILL", "CAP_NET_BIND_SERVICE"],
                "permitted": ["CAP_AUDIT_WRITE", "CAP_KILL", "CAP_NET_BIND_SERVICE"]
            },
            "rlimits": [
                { "type": "RLIMIT_NOFILE", "hard": 1024, "soft": 1024 }
            ],
            "noNewPrivileges": true
        },
        "root": { "path": rootfs, "readonly": false },
        "hostname": "lazyfs",
        "mounts": [
            { "destination": "/proc", "type": "proc", "source": "proc" },
            {
                "destination": "/lib64",
                "type": "bind",
                "source": lib64,
                "options": ["rbind", "ro"]
            },
            {
                "destination": "/dev",
                "type": "tmpfs",
                "source": "tmpfs",
                "options": ["nosuid", "strictatime", "mode=755", "size=65536k"]
            },
            {
                "destination": "/dev/pts",
                "type": "devpts",
                "source": "devpts",
                "options": [
                    "nosuid", "noexec", "newinstance",
                    "ptmxmode=0666", "mode=0620", "gid=5"
                ]
            },
            {
                "destination": "/dev/shm",
                "type": "tmpfs",
                "source": "shm",
                "options": ["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"]
            },
            {
                "destination": "/dev/mqueue",
                "type": "mqueue",
                "source": "mqueue",
                "options": ["nosuid", "noexec", "nodev"]
            },
            {
                "destination": "/sys",
                "type": "sysfs",
                "source": "sysfs",
                "options": ["nosuid", "noexec", "nodev", "ro"]
            },
            {
                "destination": "/sys/fs/cgroup",
                "type": "cgroup",
                "source": "cgroup",
                "options": ["nosuid", "noexec", "nodev", "relatime", "ro"]
            }
        ],
        "linux": {
            "resources": {
                "memory": { "limit": 1073741824u64, "swap": 1073741824u64 },
                "cpu": { "quota": 100000, "period": 100000 },
                "pids": { "limit": 128 },
                "devices": [ { "allow": false, "access": "rwm" } ]
            },
            "namespaces": [
                { "type": "pid" },
                { "type": "network" },
                { "type": "ipc" },
                { "type": "uts" },
                { "type": "mount" },
                { "type": "cgroup" }
            ],
            "maskedPaths": [
                "/proc/acpi", "/proc/asound", "/proc/kcore", "/proc/keys",
                "/proc/latency_stats", "/proc/timer_list", "/proc/timer_stats",
                "/proc/sched_debug", "/sys/firmware", "/proc/scsi"
            ],
            "readonlyPaths": [
                "/proc/bus", "/proc/fs", "/proc/irq",
                "/proc/sys", "/proc/sysrq-trigger"
            ]
        }
    })
}

/// Run `runc` against a prepared bundle, capturing output. The
/// container is deleted afterwards regardless of how the run ended.
pub async fn run_container(bundle_dir: &Path, container_id: &str) -> Result<RunOutcome, RunError> {
    let mut cmd = Command::new("sudo");
    cmd.args(["runc", "run", "--bundle"])
        .arg(bundle_dir)
        .arg(container_id);

    let output = match tokio::time::timeout(RUN_TIMEOUT, cmd.output()).await {
        Ok(result) => result?,
        Err(_) => {
            delete_container(container_id).await;
            return Err(RunError::TimedOut(RUN_TIMEOUT));
        }
    };
    delete_container(container_id).await;

    Ok(RunOutcome {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

async fn delete_container(container_id: &str) {
    let result = Command::new("sudo")
        .args(["runc", "delete", "--force", container_id])
        .output()
        .await;
    if let Err(err) = result {
        warn!(%container_id, %err, "failed to delete container");
    }
}

/// Remove ANSI escape sequences (CSI and two-byte escapes) so run logs
/// store plain text.
pub fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\x1b' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('[') => {
                chars.next();
                // parameter and intermediate bytes run until the final
                // byte in '@'..='~'
                for next in chars.by_ref() {
                    if ('@'..='~').contains(&next) {
                        break;
                    }
                }
            }
            Some(_) => {
                chars.next();
            }
            None => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_ansi_removes_color_codes() {
        assert_eq!(strip_ansi("\x1b[31mred\x1b[0m plain"), "red plain");
        assert_eq!(strip_ansi("\x1b[1;32;40mbold\x1b[m"), "bold");
        assert_eq!(strip_ansi("no escapes at all"), "no escapes at all");
        assert_eq!(strip_ansi("cursor \x1b[2J\x1b[Hhome"), "cursor home");
        // two-byte escape
        assert_eq!(strip_ansi("a\x1bMb"), "ab");
        // truncated sequence at end of input
        assert_eq!(strip_ansi("tail\x1b"), "tail");
    }

    #[test]
    fn oci_config_targets_the_script_and_rootfs() {
        let config = oci_config("alice_app.py", Path::new("/mnt/lazy/app"));

        let args = config["process"]["args"].as_array().unwrap();
        assert_eq!(args[1], "python3");
        assert_eq!(args[2], "/alice_app.py");

        assert_eq!(config["root"]["path"], "/mnt/lazy/app");

        let lib64 = config["mounts"]
            .as_array()
            .unwrap()
            .iter()
            .find(|m| m["destination"] == "/lib64")
            .unwrap();
        assert_eq!(lib64["source"], "/mnt/lazy/app/usr/lib64");
    }
}

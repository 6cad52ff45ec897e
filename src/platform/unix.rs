use tokio::process::Command;
use tracing::debug;

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;

use super::SignalOutcome;

/// No-op handle on Unix; process group cleanup uses killpg with the child PID.
pub struct ProcessGroupHandle;

pub fn configure_process_group(cmd: &mut Command) {
    cmd.process_group(0);
}

pub fn post_spawn_setup(_child_pid: Option<u32>) -> Option<ProcessGroupHandle> {
    // On Unix, process group is configured before spawn via process_group(0).
    None
}

fn send(pid: u32, group: bool, signal: Signal) -> Result<(), Errno> {
    let target = Pid::from_raw(pid as i32);
    if group {
        match killpg(target, signal) {
            // Adopted processes may not lead their own group.
            Err(Errno::ESRCH) | Err(Errno::EPERM) => kill(target, signal),
            other => other,
        }
    } else {
        kill(target, signal)
    }
}

pub fn request_graceful_exit(pid: u32, group: bool) -> SignalOutcome {
    match send(pid, group, Signal::SIGTERM) {
        Ok(()) => {
            debug!(pid, group, "sent SIGTERM");
            SignalOutcome::Sent
        }
        Err(Errno::ESRCH) => SignalOutcome::Gone,
        Err(e) => SignalOutcome::Failed(e.to_string()),
    }
}

pub fn force_kill(pid: u32, group: bool, _group_handle: Option<&ProcessGroupHandle>) {
    match send(pid, group, Signal::SIGKILL) {
        Ok(()) => debug!(pid, group, "sent SIGKILL"),
        Err(Errno::ESRCH) => debug!(pid, "process already exited"),
        Err(e) => debug!(pid, error = %e, "SIGKILL failed"),
    }
}

pub fn is_process_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

pub fn elevate_priority(pid: u32) -> std::io::Result<()> {
    // SAFETY: setpriority has no memory-safety preconditions.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, pid as libc::id_t, -5) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(target_os = "linux")]
pub fn identify_port_owner(port: u16) -> Option<String> {
    let port_hex = format!("{:04X}", port);

    let mut target_inode: Option<String> = None;
    for table in ["/proc/net/tcp", "/proc/net/udp"] {
        let Ok(content) = std::fs::read_to_string(table) else {
            continue;
        };
        for line in content.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 {
                continue;
            }
            if fields[1].split(':').nth(1) == Some(port_hex.as_str()) {
                target_inode = Some(fields[9].to_string());
                break;
            }
        }
        if target_inode.is_some() {
            break;
        }
    }

    let inode = target_inode?;
    if inode == "0" {
        return None;
    }

    let proc_dir = std::fs::read_dir("/proc").ok()?;
    for entry in proc_dir.flatten() {
        let pid_str = entry.file_name().to_string_lossy().to_string();
        if !pid_str.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let Ok(fds) = std::fs::read_dir(format!("/proc/{}/fd", pid_str)) else {
            continue;
        };
        for fd_entry in fds.flatten() {
            let Ok(link) = std::fs::read_link(fd_entry.path()) else {
                continue;
            };
            if !link
                .to_string_lossy()
                .contains(&format!("socket:[{}]", inode))
            {
                continue;
            }
            let cmdline = std::fs::read_to_string(format!("/proc/{}/cmdline", pid_str))
                .map(|c| c.replace('\0', " ").trim().to_string())
                .unwrap_or_default();
            if cmdline.is_empty() {
                return Some(format!("PID {}", pid_str));
            }
            if cmdline.chars().count() > 60 {
                let short: String = cmdline.chars().take(57).collect();
                return Some(format!("{}... (PID {})", short, pid_str));
            }
            return Some(format!("{} (PID {})", cmdline, pid_str));
        }
    }

    None
}

#[cfg(not(target_os = "linux"))]
pub fn identify_port_owner(_port: u16) -> Option<String> {
    None
}

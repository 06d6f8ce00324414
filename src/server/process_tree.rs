// src/server/process_tree.rs

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use procfs::process::{Process, all_processes};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// All live descendants of `root`, parents before children.
pub fn descendants(root: u32) -> Vec<u32> {
    let procs = match all_processes() {
        Ok(procs) => procs,
        Err(e) => {
            log::warn!("Cannot enumerate processes under {}: {}", root, e);
            return Vec::new();
        }
    };

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for stat in procs.filter_map(|p| p.ok()).filter_map(|p| p.stat().ok()) {
        if stat.pid > 0 && stat.ppid > 0 {
            children.entry(stat.ppid as u32).or_default().push(stat.pid as u32);
        }
    }

    let mut found = Vec::new();
    let mut frontier = vec![root];
    while let Some(pid) = frontier.pop() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                if !found.contains(&kid) {
                    found.push(kid);
                    frontier.push(kid);
                }
            }
        }
    }
    found
}

/// A zombie counts as dead: it holds no resources and only awaits reaping.
pub fn is_alive(pid: u32) -> bool {
    match Process::new(pid as i32).and_then(|p| p.stat()) {
        Ok(stat) => stat.state != 'Z' && stat.state != 'X',
        Err(_) => false,
    }
}

/// Sends `signal` to one process. Failures are logged and swallowed.
pub fn signal(pid: u32, signal: Signal) {
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) => log::trace!("sent {:?} to {}", signal, pid),
        Err(Errno::ESRCH) => log::trace!("{} already gone", pid),
        Err(e) => log::warn!("kill({}, {:?}) failed: {}", pid, signal, e),
    }
}

/// Sends `signal` to the whole process group led by `pgid`.
pub fn signal_group(pgid: u32, signal: Signal) {
    match killpg(Pid::from_raw(pgid as i32), signal) {
        Ok(()) => log::trace!("sent {:?} to group {}", signal, pgid),
        Err(Errno::ESRCH) => log::trace!("group {} already empty", pgid),
        Err(e) => log::warn!("killpg({}, {:?}) failed: {}", pgid, signal, e),
    }
}

/// Waits until none of `pids` is alive or `deadline` passes. Returns the survivors.
pub async fn wait_for_exit(pids: &[u32], deadline: Instant) -> Vec<u32> {
    loop {
        let alive: Vec<u32> = pids.iter().copied().filter(|p| is_alive(*p)).collect();
        if alive.is_empty() || Instant::now() >= deadline {
            return alive;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// SIGKILLs `root`'s group and every listed process without waiting.
pub fn force_kill(root: u32, tree: &[u32]) {
    for &pid in tree {
        signal(pid, Signal::SIGKILL);
    }
    signal_group(root, Signal::SIGKILL);
}

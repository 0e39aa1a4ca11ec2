//! `/proc`-driven janitor for residual process trees.
//!
//! Sessions that exec through a sidecar or nsenter can leave children behind
//! on the host after the client goes away. The janitor walks the process
//! table, collects the transitive children of a recorded parent pid, and
//! SIGTERMs them. Before signaling anything it re-confirms the parent's
//! command line still contains the expected sentinel, which guards against a
//! recycled pid pointing at an unrelated process.

use std::fs;
use std::io;
use std::time::Duration;

/// One row of the host process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Process {
    pub pid: i32,
    pub ppid: i32,
    pub name: String,
}

/// Reads `/proc/<pid>/stat` for every numeric entry and extracts pid, comm
/// and ppid (fields 0, 1 and 3; comm is parenthesized).
pub fn list_processes() -> io::Result<Vec<Process>> {
    list_processes_from("/proc")
}

fn list_processes_from(proc_dir: &str) -> io::Result<Vec<Process>> {
    let mut processes = Vec::new();

    for entry in fs::read_dir(proc_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }

        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|n| n.parse::<i32>().ok()) else {
            continue;
        };

        let stat_path = entry.path().join("stat");
        let Ok(stat) = fs::read_to_string(&stat_path) else {
            // Process exited between readdir and read; skip it.
            continue;
        };

        if let Some(process) = parse_stat(pid, &stat) {
            processes.push(process);
        }
    }

    Ok(processes)
}

fn parse_stat(pid: i32, stat: &str) -> Option<Process> {
    // comm may contain spaces but is parenthesized, so split around it.
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let name = stat.get(open + 1..close)?.to_string();

    let rest: Vec<&str> = stat.get(close + 1..)?.split_whitespace().collect();
    // rest[0] is the state, rest[1] the ppid.
    let ppid = rest.get(1)?.parse().ok()?;

    Some(Process { pid, ppid, name })
}

/// Collects all direct and transitive children of `target_ppid`, parents
/// before their own children.
pub fn find_child_processes(target_ppid: i32, processes: &[Process]) -> Vec<i32> {
    let mut pids = Vec::new();

    for process in processes {
        if process.ppid == target_ppid {
            pids.push(process.pid);
            pids.extend(find_child_processes(process.pid, processes));
        }
    }

    pids
}

/// Null-delimited command line of a live process.
pub fn process_cmdline(pid: i32) -> io::Result<Vec<String>> {
    let data = fs::read(format!("/proc/{pid}/cmdline"))?;

    Ok(data
        .split(|b| *b == 0)
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect())
}

/// Sends SIGTERM. "No such process" is not an error here: the janitor only
/// ever races processes toward exit.
pub fn kill_process(pid: i32) -> io::Result<()> {
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(err);
    }

    Ok(())
}

/// True when the process still exists (zero-signal probe). EPERM proves
/// existence just as well as success does.
fn process_alive(pid: i32) -> io::Result<bool> {
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return Ok(true);
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Ok(false),
        Some(libc::EPERM) => Ok(true),
        _ => Err(err),
    }
}

/// Terminates the children of `parent_pid`, gated on its command line still
/// containing `sentinel`. With `inverted` the collected child list is
/// reversed before signaling. A second passes between signals so a large
/// tree doesn't land as a thundering herd.
pub async fn kill_process_group(
    parent_pid: i32,
    sentinel: &str,
    inverted: bool,
) -> io::Result<()> {
    if !process_alive(parent_pid)? {
        return Ok(());
    }

    // PID-reuse guard: a replaced parent means this tree is not ours.
    let cmdline = process_cmdline(parent_pid)?;
    if !sentinel.is_empty() && !cmdline.iter().any(|part| part == sentinel) {
        return Ok(());
    }

    let processes = list_processes()?;
    let mut child_pids = find_child_processes(parent_pid, &processes);

    if inverted {
        child_pids.reverse();
    }

    for pid in child_pids {
        if let Err(err) = kill_process(pid) {
            tracing::warn!(pid, error = %err, "signal child process failed");
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Vec<Process> {
        vec![
            Process { pid: 100, ppid: 1, name: "superman.sh".into() },
            Process { pid: 101, ppid: 100, name: "sh".into() },
            Process { pid: 102, ppid: 101, name: "sleep".into() },
            Process { pid: 103, ppid: 100, name: "cat".into() },
            Process { pid: 200, ppid: 1, name: "unrelated".into() },
        ]
    }

    #[test]
    fn children_are_transitive_and_parent_first() {
        let pids = find_child_processes(100, &table());
        assert_eq!(pids, vec![101, 102, 103]);
    }

    #[test]
    fn no_children_for_leaf() {
        let pids = find_child_processes(102, &table());
        assert!(pids.is_empty());
    }

    #[test]
    fn parse_stat_handles_spaces_in_comm() {
        let process = parse_stat(42, "42 (tmux: server) S 1 42 42 0 -1").unwrap();
        assert_eq!(process.name, "tmux: server");
        assert_eq!(process.ppid, 1);
    }

    #[test]
    fn parse_stat_rejects_garbage() {
        assert!(parse_stat(42, "not a stat line").is_none());
    }

    #[test]
    fn own_process_is_listed() {
        let own = std::process::id() as i32;
        let processes = list_processes().unwrap();
        assert!(processes.iter().any(|p| p.pid == own));
    }

    #[test]
    fn own_cmdline_is_readable() {
        let own = std::process::id() as i32;
        let cmdline = process_cmdline(own).unwrap();
        assert!(!cmdline.is_empty());
    }

    #[test]
    fn probing_dead_pid_is_ok() {
        // PID near the default pid_max ceiling; almost surely unused, and if
        // used the probe still returns cleanly.
        assert!(process_alive(1).unwrap());
        kill_process(i32::MAX - 2).unwrap();
    }
}

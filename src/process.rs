//! GDB "processes": the idle process plus workgroups carved out of it,
//! each an ordered set of thread ids.

use std::collections::BTreeSet;

use crate::addr::CoreId;

/// pid reserved for the set of threads not yet claimed by a workgroup.
pub const IDLE_PID: i64 = 1;

#[derive(Debug, Clone, Default)]
pub struct Process {
    pub pid: i64,
    threads: BTreeSet<i64>,
}

impl Process {
    pub fn new(pid: i64) -> Self {
        Process {
            pid,
            threads: BTreeSet::new(),
        }
    }

    pub fn add_thread(&mut self, tid: i64) {
        self.threads.insert(tid);
    }

    pub fn erase_thread(&mut self, tid: i64) -> bool {
        self.threads.remove(&tid)
    }

    pub fn has_thread(&self, tid: i64) -> bool {
        self.threads.contains(&tid)
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn threads(&self) -> impl Iterator<Item = i64> + '_ {
        self.threads.iter().copied()
    }

    pub fn first_thread(&self) -> Option<i64> {
        self.threads.iter().next().copied()
    }
}

/// Owns every process, enforcing that the idle process initially holds
/// every enumerated thread and that the per-process sets stay a
/// partition of the whole thread population.
#[derive(Debug, Clone)]
pub struct ProcessTable {
    processes: Vec<Process>,
    next_pid: i64,
}

impl ProcessTable {
    /// Build the table with a freshly populated idle process containing
    /// every core in `cores`.
    pub fn new(cores: impl IntoIterator<Item = CoreId>) -> Self {
        let mut idle = Process::new(IDLE_PID);
        for core in cores {
            idle.add_thread(core.tid());
        }
        ProcessTable {
            processes: vec![idle],
            next_pid: IDLE_PID + 1,
        }
    }

    pub fn process(&self, pid: i64) -> Option<&Process> {
        self.processes.iter().find(|p| p.pid == pid)
    }

    pub fn process_mut(&mut self, pid: i64) -> Option<&mut Process> {
        self.processes.iter_mut().find(|p| p.pid == pid)
    }

    pub fn processes(&self) -> impl Iterator<Item = &Process> {
        self.processes.iter()
    }

    pub fn process_of(&self, tid: i64) -> Option<i64> {
        self.processes.iter().find(|p| p.has_thread(tid)).map(|p| p.pid)
    }

    /// Move every thread in the rectangle rooted at `origin` out of the
    /// idle process into a newly allocated pid. If any thread in the
    /// rectangle is not currently in the idle process, the whole
    /// operation is rolled back and `None` is returned (the caller turns
    /// that into `E01`).
    pub fn create_workgroup(&mut self, origin: CoreId, rows: u8, cols: u8) -> Option<i64> {
        let tids: Vec<i64> = (0..rows)
            .flat_map(|dr| (0..cols).map(move |dc| (dr, dc)))
            .map(|(dr, dc)| CoreId::new(origin.row + dr, origin.col + dc).tid())
            .collect();

        {
            let idle = self.process(IDLE_PID)?;
            if tids.iter().any(|tid| !idle.has_thread(*tid)) {
                return None;
            }
        }

        let pid = self.next_pid;
        self.next_pid += 1;
        let mut group = Process::new(pid);
        {
            let idle = self.process_mut(IDLE_PID).expect("idle process always exists");
            for tid in &tids {
                idle.erase_thread(*tid);
            }
        }
        for tid in tids {
            group.add_thread(tid);
        }
        self.processes.push(group);
        Some(pid)
    }

    pub fn total_thread_count(&self) -> usize {
        self.processes.iter().map(|p| p.thread_count()).sum()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn mesh(rows: u8, cols: u8) -> Vec<CoreId> {
        (0..rows)
            .flat_map(|r| (0..cols).map(move |c| CoreId::new(r, c)))
            .collect()
    }

    #[test]
    fn idle_process_starts_with_every_thread() {
        let table = ProcessTable::new(mesh(2, 2));
        assert_eq!(table.process(IDLE_PID).unwrap().thread_count(), 4);
    }

    #[test]
    fn workgroup_moves_threads_out_of_idle() {
        let mut table = ProcessTable::new(mesh(2, 2));
        let pid = table.create_workgroup(CoreId::new(0, 0), 1, 2).unwrap();
        assert_eq!(table.process(IDLE_PID).unwrap().thread_count(), 2);
        assert_eq!(table.process(pid).unwrap().thread_count(), 2);
    }

    #[test]
    fn overlapping_workgroup_is_rejected_and_rolled_back() {
        let mut table = ProcessTable::new(mesh(2, 2));
        let first = table.create_workgroup(CoreId::new(0, 0), 1, 2).unwrap();
        assert!(table.create_workgroup(CoreId::new(0, 0), 2, 2).is_none());
        // rollback: the first workgroup and idle are unaffected
        assert_eq!(table.process(first).unwrap().thread_count(), 2);
        assert_eq!(table.process(IDLE_PID).unwrap().thread_count(), 2);
    }

    #[test]
    fn processes_partition_the_thread_population() {
        let mut table = ProcessTable::new(mesh(2, 2));
        table.create_workgroup(CoreId::new(0, 0), 1, 1).unwrap();
        assert_eq!(table.total_thread_count(), 4);
    }
}

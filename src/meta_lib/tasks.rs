/// Cooperative execution of long-running recursive operations.
///
/// A submitted task becomes a Job: the original task plus everything it
/// spawns while running. Each tick the manager executes a bounded number
/// of task steps round-robin across jobs, so a recursive setgoal over a
/// huge tree never stalls the event loop.
use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;

use log::*;

use crate::meta_lib::codec::escape_name;
use crate::meta_lib::types::{FsStatus, NodeType, SMODE_RMASK, SMODE_SET, SMODE_TMASK};
use crate::meta_lib::Engine;

pub trait Task {
    /// Runs one step. New subtasks pushed to `subtasks` are executed
    /// before this task runs again.
    fn execute(&mut self, ts: u32, engine: &mut Engine, subtasks: &mut VecDeque<Box<dyn Task>>)
        -> FsStatus;

    fn is_finished(&self) -> bool;
}

type FinishCallback = Box<dyn FnMut(FsStatus)>;

pub struct Job {
    id: u32,
    description: String,
    tasks: VecDeque<Box<dyn Task>>,
    callback: Option<FinishCallback>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    pub id: u32,
    pub description: String,
}

impl Job {
    fn new(id: u32, description: String) -> Self {
        Job { id, description, tasks: VecDeque::new(), callback: None }
    }

    fn finalize(&mut self, status: FsStatus) {
        if let Some(mut callback) = self.callback.take() {
            callback(status);
        }
        self.tasks.clear();
    }

    fn is_finished(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Executes the front task once. Returns the final status when the
    /// whole job just completed or failed.
    fn process_task(&mut self, ts: u32, engine: &mut Engine) -> Option<FsStatus> {
        let mut task = self.tasks.pop_front()?;
        let mut subtasks = VecDeque::new();
        let status = task.execute(ts, engine, &mut subtasks);
        let finished = task.is_finished();
        if !finished {
            self.tasks.push_front(task);
        }
        while let Some(sub) = subtasks.pop_back() {
            self.tasks.push_front(sub);
        }
        if status != FsStatus::Ok {
            return Some(status);
        }
        if self.tasks.is_empty() {
            return Some(FsStatus::Ok);
        }
        None
    }
}

#[derive(Default)]
pub struct TaskManager {
    jobs: Vec<Job>,
    next_job_id: u32,
}

impl TaskManager {
    pub fn new() -> Self {
        TaskManager::default()
    }

    pub fn reserve_job_id(&mut self) -> u32 {
        let id = self.next_job_id;
        self.next_job_id += 1;
        id
    }

    pub fn work_available(&self) -> bool {
        !self.jobs.is_empty()
    }

    pub fn jobs_info(&self) -> Vec<JobInfo> {
        self.jobs
            .iter()
            .map(|j| JobInfo { id: j.id, description: j.description.clone() })
            .collect()
    }

    /// Cancels a job: fires its callback with NotDone and drops its tasks.
    pub fn cancel_job(&mut self, job_id: u32) -> bool {
        if let Some(pos) = self.jobs.iter().position(|j| j.id == job_id) {
            self.jobs[pos].finalize(FsStatus::NotDone);
            self.jobs.remove(pos);
            return true;
        }
        false
    }
}

impl Engine {
    /// Submits a task, running up to `initial_batch` steps synchronously.
    /// Returns the final status if the job completed within the batch,
    /// `Waiting` otherwise (the callback fires later).
    pub fn submit_task(
        &mut self,
        job_id: u32,
        ts: u32,
        initial_batch: u32,
        task: Box<dyn Task>,
        description: String,
        callback: Option<FinishCallback>,
    ) -> FsStatus {
        let mut job = Job::new(job_id, description);
        job.tasks.push_back(task);

        let done = Rc::new(Cell::new(None));
        let done_probe = Rc::clone(&done);
        job.callback = Some(Box::new(move |status| done_probe.set(Some(status))));

        for _ in 0..initial_batch {
            if let Some(status) = job.process_task(ts, self) {
                job.finalize(status);
                break;
            }
        }
        if let Some(status) = done.get() {
            return status;
        }

        job.callback = callback;
        debug!("job {} enqueued: {}", job.id, job.description);
        self.tasks.jobs.push(job);
        FsStatus::Waiting
    }

    /// Round-robin execution of up to `batch` task steps across all jobs.
    pub fn process_jobs(&mut self, ts: u32, batch: u32) {
        let mut jobs = std::mem::take(&mut self.tasks.jobs);
        let mut cursor = 0;
        for _ in 0..batch {
            if jobs.is_empty() {
                break;
            }
            if cursor >= jobs.len() {
                cursor = 0;
            }
            match jobs[cursor].process_task(ts, self) {
                Some(status) => {
                    jobs[cursor].finalize(status);
                    jobs.remove(cursor);
                }
                None => cursor += 1,
            }
        }
        // jobs submitted while processing land behind the survivors
        let submitted = std::mem::take(&mut self.tasks.jobs);
        jobs.extend(submitted);
        self.tasks.jobs = jobs;
    }
}

/// Outcome classes of one setgoal/settrashtime/seteattr visit.
pub const VISIT_CHANGED: usize = 0;
pub const VISIT_NOT_CHANGED: usize = 1;
pub const VISIT_NOT_PERMITTED: usize = 2;

pub type VisitStats = Rc<Cell<[u32; 3]>>;

pub fn new_visit_stats() -> VisitStats {
    Rc::new(Cell::new([0; 3]))
}

fn bump(stats: &VisitStats, which: usize) {
    let mut v = stats.get();
    v[which] += 1;
    stats.set(v);
}

/// Recursive goal change, one inode per step.
pub struct SetGoalTask {
    inodes: Vec<u32>,
    position: usize,
    uid: u32,
    goal: u8,
    smode: u8,
    stats: VisitStats,
}

impl SetGoalTask {
    pub fn new(inodes: Vec<u32>, uid: u32, goal: u8, smode: u8, stats: VisitStats) -> Self {
        SetGoalTask { inodes, position: 0, uid, goal, smode, stats }
    }

    pub fn describe(target: u32, goal_name: &str) -> String {
        format!("Setting goal ({}): inode {}", goal_name, target)
    }
}

impl Task for SetGoalTask {
    fn execute(&mut self, ts: u32, engine: &mut Engine, subtasks: &mut VecDeque<Box<dyn Task>>)
        -> FsStatus {
        let inode = self.inodes[self.position];
        self.position += 1;
        if engine.node(inode).is_none() {
            return FsStatus::InvalidArgument;
        }
        let result = engine.setgoal_visit(inode, self.uid, self.goal, self.smode, ts);
        if let Some(result) = result {
            if engine.node(inode).map(|n| n.is_directory()).unwrap_or(false)
                && self.smode & SMODE_RMASK != 0
            {
                let children: Vec<u32> = engine
                    .node(inode)
                    .and_then(|n| n.dir())
                    .map(|d| d.children.values().copied().collect())
                    .unwrap_or_default();
                if !children.is_empty() {
                    subtasks.push_back(Box::new(SetGoalTask::new(
                        children,
                        self.uid,
                        self.goal,
                        self.smode,
                        Rc::clone(&self.stats),
                    )));
                }
            }
            if self.smode & SMODE_RMASK == 0 && result == VISIT_NOT_PERMITTED {
                return FsStatus::NotPermitted;
            }
            bump(&self.stats, result);
            engine.emit_changelog(
                ts,
                &format!(
                    "SETGOAL({},{},{},{}):{}",
                    inode, self.uid, self.goal, self.smode, result
                ),
            );
        }
        FsStatus::Ok
    }

    fn is_finished(&self) -> bool {
        self.position >= self.inodes.len()
    }
}

/// Recursive trashtime change, one inode per step.
pub struct SetTrashtimeTask {
    inodes: Vec<u32>,
    position: usize,
    uid: u32,
    trashtime: u32,
    smode: u8,
    stats: VisitStats,
}

impl SetTrashtimeTask {
    pub fn new(inodes: Vec<u32>, uid: u32, trashtime: u32, smode: u8, stats: VisitStats) -> Self {
        SetTrashtimeTask { inodes, position: 0, uid, trashtime, smode, stats }
    }

    pub fn describe(target: u32, trashtime: u32) -> String {
        format!("Setting trashtime ({}): inode {}", trashtime, target)
    }
}

impl Task for SetTrashtimeTask {
    fn execute(&mut self, ts: u32, engine: &mut Engine, subtasks: &mut VecDeque<Box<dyn Task>>)
        -> FsStatus {
        let inode = self.inodes[self.position];
        self.position += 1;
        if engine.node(inode).is_none() {
            return FsStatus::InvalidArgument;
        }
        let result = engine.settrashtime_visit(inode, self.uid, self.trashtime, self.smode, ts);
        if let Some(result) = result {
            if engine.node(inode).map(|n| n.is_directory()).unwrap_or(false)
                && self.smode & SMODE_RMASK != 0
            {
                let children: Vec<u32> = engine
                    .node(inode)
                    .and_then(|n| n.dir())
                    .map(|d| d.children.values().copied().collect())
                    .unwrap_or_default();
                if !children.is_empty() {
                    subtasks.push_back(Box::new(SetTrashtimeTask::new(
                        children,
                        self.uid,
                        self.trashtime,
                        self.smode,
                        Rc::clone(&self.stats),
                    )));
                }
            }
            if self.smode & SMODE_RMASK == 0 && result == VISIT_NOT_PERMITTED {
                return FsStatus::NotPermitted;
            }
            bump(&self.stats, result);
            engine.emit_changelog(
                ts,
                &format!(
                    "SETTRASHTIME({},{},{},{}):{}",
                    inode, self.uid, self.trashtime, self.smode, result
                ),
            );
        }
        FsStatus::Ok
    }

    fn is_finished(&self) -> bool {
        self.position >= self.inodes.len()
    }
}

/// Snapshot: clones one inode per step, descending into directories.
pub struct SnapshotTask {
    /// (source inode, clone name) pairs still to process.
    subtasks: Vec<(u32, Vec<u8>)>,
    position: usize,
    dst_parent: u32,
    /// Forced inode for the first clone; 0 allocates.
    dst_inode: u32,
    can_overwrite: bool,
    emit_changelog: bool,
    enqueue_work: bool,
}

impl SnapshotTask {
    pub fn new(
        subtasks: Vec<(u32, Vec<u8>)>,
        dst_parent: u32,
        dst_inode: u32,
        can_overwrite: bool,
        emit_changelog: bool,
        enqueue_work: bool,
    ) -> Self {
        SnapshotTask {
            subtasks,
            position: 0,
            dst_parent,
            dst_inode,
            can_overwrite,
            emit_changelog,
            enqueue_work,
        }
    }

    pub fn describe(src: u32, dst: &[u8]) -> String {
        format!("Creating snapshot: inode {} -> {}", src, escape_name(dst))
    }
}

impl Task for SnapshotTask {
    fn execute(&mut self, ts: u32, engine: &mut Engine, subtasks: &mut VecDeque<Box<dyn Task>>)
        -> FsStatus {
        let (src_inode, name) = self.subtasks[self.position].clone();
        self.position += 1;
        let cloned = match engine.clone_node(
            ts,
            src_inode,
            self.dst_parent,
            &name,
            self.dst_inode,
            self.can_overwrite,
        ) {
            Ok(c) => c,
            Err(status) => return status,
        };
        if self.emit_changelog {
            engine.emit_changelog(
                ts,
                &format!(
                    "CLONE({},{},{},{},{})",
                    src_inode,
                    self.dst_parent,
                    cloned.dst_inode,
                    escape_name(&name),
                    u8::from(self.can_overwrite)
                ),
            );
        }
        if self.enqueue_work && !cloned.children.is_empty() {
            subtasks.push_back(Box::new(SnapshotTask::new(
                cloned.children,
                cloned.dst_inode,
                0,
                self.can_overwrite,
                self.emit_changelog,
                true,
            )));
        }
        FsStatus::Ok
    }

    fn is_finished(&self) -> bool {
        self.position >= self.subtasks.len()
    }
}

/// Shared visit logic of setgoal: returns None when the node kind takes
/// no goal, the visit class otherwise.
impl Engine {
    pub(crate) fn setgoal_visit(
        &mut self,
        inode: u32,
        uid: u32,
        goal: u8,
        smode: u8,
        ts: u32,
    ) -> Option<usize> {
        use crate::meta_lib::types::EATTR_NOOWNER;
        let node = self.node(inode)?;
        if !(node.is_file_kind() || node.is_directory()) {
            return None;
        }
        if node.eattr() & EATTR_NOOWNER == 0 && uid != 0 && node.uid != uid {
            return Some(VISIT_NOT_PERMITTED);
        }
        if smode & SMODE_TMASK != SMODE_SET || node.goal == goal {
            return Some(VISIT_NOT_CHANGED);
        }
        if node.is_directory() {
            if let Some(n) = self.node_mut(inode) {
                n.goal = goal;
            }
        } else {
            self.change_file_goal(inode, goal);
        }
        self.update_ctime(inode, ts);
        self.update_node_checksum(inode);
        Some(VISIT_CHANGED)
    }

    pub(crate) fn settrashtime_visit(
        &mut self,
        inode: u32,
        uid: u32,
        trashtime: u32,
        smode: u8,
        ts: u32,
    ) -> Option<usize> {
        use crate::meta_lib::types::{EATTR_NOOWNER, SMODE_DECREASE, SMODE_INCREASE};
        let node = self.node(inode)?;
        if !(node.is_file_kind() || node.is_directory()) {
            return None;
        }
        if node.eattr() & EATTR_NOOWNER == 0 && uid != 0 && node.uid != uid {
            return Some(VISIT_NOT_PERMITTED);
        }
        let new_value = match smode & SMODE_TMASK {
            SMODE_SET => trashtime,
            SMODE_INCREASE => node.trashtime.max(trashtime),
            SMODE_DECREASE => node.trashtime.min(trashtime),
            _ => node.trashtime,
        };
        if new_value == node.trashtime {
            return Some(VISIT_NOT_CHANGED);
        }
        // a trashed node's expiry key depends on its trashtime
        if node.node_type == NodeType::Trash {
            let old_key = crate::meta_lib::node::TrashKey::for_node(node);
            if let Some(path) = self.trash.remove(&old_key) {
                if let Some(n) = self.node_mut(inode) {
                    n.trashtime = new_value;
                }
                let new_key = crate::meta_lib::node::TrashKey::for_node(&self.nodes[&inode]);
                self.trash.insert(new_key, path);
            }
        } else if let Some(n) = self.node_mut(inode) {
            n.trashtime = new_value;
        }
        self.update_ctime(inode, ts);
        self.update_node_checksum(inode);
        Some(VISIT_CHANGED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta_lib::types::{FsContext, Personality, ROOT_INODE};

    struct CountdownTask {
        remaining: u32,
        spawn_children: u32,
    }

    impl Task for CountdownTask {
        fn execute(
            &mut self,
            _ts: u32,
            _engine: &mut Engine,
            subtasks: &mut VecDeque<Box<dyn Task>>,
        ) -> FsStatus {
            self.remaining -= 1;
            for _ in 0..self.spawn_children {
                subtasks.push_back(Box::new(CountdownTask { remaining: 1, spawn_children: 0 }));
            }
            self.spawn_children = 0;
            FsStatus::Ok
        }

        fn is_finished(&self) -> bool {
            self.remaining == 0
        }
    }

    #[test]
    fn small_job_completes_within_initial_batch() {
        let mut engine = Engine::new_in_memory(Personality::Master);
        let id = engine.tasks.reserve_job_id();
        let status = engine.submit_task(
            id,
            0,
            10,
            Box::new(CountdownTask { remaining: 3, spawn_children: 0 }),
            "countdown".into(),
            None,
        );
        assert_eq!(status, FsStatus::Ok);
        assert!(!engine.tasks.work_available());
    }

    #[test]
    fn large_job_queues_and_fires_callback() {
        let mut engine = Engine::new_in_memory(Personality::Master);
        let done = Rc::new(Cell::new(None));
        let probe = Rc::clone(&done);
        let id = engine.tasks.reserve_job_id();
        let status = engine.submit_task(
            id,
            0,
            2,
            Box::new(CountdownTask { remaining: 10, spawn_children: 0 }),
            "countdown".into(),
            Some(Box::new(move |s| probe.set(Some(s)))),
        );
        assert_eq!(status, FsStatus::Waiting);
        assert!(engine.tasks.work_available());
        engine.process_jobs(0, 100);
        assert_eq!(done.get(), Some(FsStatus::Ok));
        assert!(!engine.tasks.work_available());
    }

    #[test]
    fn subtasks_run_before_their_parent() {
        let mut engine = Engine::new_in_memory(Personality::Master);
        let id = engine.tasks.reserve_job_id();
        // parent needs 3 steps and spawns 2 children on the first one
        let status = engine.submit_task(
            id,
            0,
            1,
            Box::new(CountdownTask { remaining: 3, spawn_children: 2 }),
            "tree".into(),
            None,
        );
        assert_eq!(status, FsStatus::Waiting);
        engine.process_jobs(0, 100);
        assert!(!engine.tasks.work_available());
    }

    #[test]
    fn cancel_discards_pending_tasks() {
        let mut engine = Engine::new_in_memory(Personality::Master);
        let done = Rc::new(Cell::new(None));
        let probe = Rc::clone(&done);
        let id = engine.tasks.reserve_job_id();
        engine.submit_task(
            id,
            0,
            1,
            Box::new(CountdownTask { remaining: 100, spawn_children: 0 }),
            "long".into(),
            Some(Box::new(move |s| probe.set(Some(s)))),
        );
        assert!(engine.tasks.cancel_job(id));
        assert_eq!(done.get(), Some(FsStatus::NotDone));
        assert!(!engine.tasks.work_available());
        assert!(!engine.tasks.cancel_job(id));
    }

    #[test]
    fn round_robin_interleaves_jobs() {
        let mut engine = Engine::new_in_memory(Personality::Master);
        for _ in 0..3 {
            let id = engine.tasks.reserve_job_id();
            engine.submit_task(
                id,
                0,
                0,
                Box::new(CountdownTask { remaining: 5, spawn_children: 0 }),
                "rr".into(),
                None,
            );
        }
        assert_eq!(engine.tasks.jobs_info().len(), 3);
        // 15 steps total finish all three jobs
        engine.process_jobs(0, 15);
        assert!(!engine.tasks.work_available());
    }

    #[test]
    fn setgoal_task_descends_into_directories() {
        let mut engine = Engine::new_in_memory(Personality::Master);
        let ctx = FsContext::internal(10);
        let (dir, _) = engine.mkdir(&ctx, ROOT_INODE, b"tree", 0o755, 0).unwrap();
        let (sub, _) = engine.mkdir(&ctx, dir, b"sub", 0o755, 0).unwrap();
        let (f1, _) = engine.mknod(&ctx, dir, b"a", NodeType::File, 0o644, 0, 0).unwrap();
        let (f2, _) = engine.mknod(&ctx, sub, b"b", NodeType::File, 0o644, 0, 0).unwrap();

        let stats = new_visit_stats();
        let task = SetGoalTask::new(vec![dir], 0, 3, SMODE_SET | SMODE_RMASK, Rc::clone(&stats));
        let id = engine.tasks.reserve_job_id();
        let status = engine.submit_task(id, 20, 1000, Box::new(task), "goal".into(), None);
        assert_eq!(status, FsStatus::Ok);
        assert_eq!(engine.node(f1).unwrap().goal, 3);
        assert_eq!(engine.node(f2).unwrap().goal, 3);
        assert_eq!(engine.node(dir).unwrap().goal, 3);
        // dir, sub, two files
        assert_eq!(stats.get()[VISIT_CHANGED], 4);
    }
}

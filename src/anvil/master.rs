// Copyright (c) 2018 Jason White
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! The task master: drives the task graph to completion across a pool of
//! workers.
//!
//! The master is the only thread that touches the database. A task's
//! database mutations (new stamps, dynamic-edge reconciliation, dirty
//! clearance) are applied and committed before any of its downstream tasks
//! is released to the ready queue, so a task can never start before its
//! dependencies' effects are durable. The fast `RanTask` acknowledgment only
//! returns the worker to the pool for work that is *already* ready.

use std::cmp;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crossbeam::channel::{unbounded, Select};
use log::{debug, error, info, warn};

use crate::database::Database;
use crate::error::Error;
use crate::node::NodeId;
use crate::taskgraph::{Task, TaskGraph};
use crate::worker::{self, Assignment, Reply, TaskResult, WorkerHandle};

/// The terminal state of a build run. This is the one completion report the
/// master surfaces to the driver.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum BuildStatus {
    /// Everything that needed to run ran and succeeded.
    Ok,

    /// A task reported failure; no new work was started after it.
    Failed,

    /// A worker died while holding a task. The task's database state is
    /// untouched, so the next run retries it.
    Crashed { task_id: NodeId },
}

impl BuildStatus {
    pub fn is_ok(self) -> bool {
        self == BuildStatus::Ok
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildStatus::Ok => write!(f, "ok"),
            BuildStatus::Failed => write!(f, "failed"),
            BuildStatus::Crashed { task_id } => {
                write!(f, "crashed (task {})", task_id)
            }
        }
    }
}

pub struct TaskMaster {
    jobs: usize,
}

impl TaskMaster {
    /// `jobs = 0` auto-selects the worker count.
    pub fn new(jobs: usize) -> TaskMaster {
        TaskMaster { jobs }
    }

    /// The number of workers for a run with `tasks` pending tasks.
    ///
    /// One worker is strictly worse than an in-process build because of the
    /// message-passing overhead, so the auto-selected floor is two. There is
    /// no point spawning more workers than tasks.
    pub fn worker_count(&self, tasks: usize) -> usize {
        let n = if self.jobs == 0 {
            // One and a half workers per CPU, rounded up.
            cmp::max(2, (num_cpus::get() * 3 + 1) / 2)
        } else {
            self.jobs
        };

        cmp::max(1, cmp::min(n, tasks))
    }

    /// Runs the pending work to completion.
    pub fn run(
        &self,
        db: &mut Database,
        graph: TaskGraph,
        build_path: &Path,
    ) -> Result<BuildStatus, Error> {
        if graph.is_empty() {
            return Ok(BuildStatus::Ok);
        }

        let threads = self.worker_count(graph.len());
        info!(
            "running {} task(s) across {} worker(s)",
            graph.len(),
            threads
        );

        crossbeam::thread::scope(|scope| {
            let mut workers = Vec::with_capacity(threads);

            for id in 0..threads {
                let (task_tx, task_rx) = unbounded();
                let (reply_tx, reply_rx) = unbounded();
                let (result_tx, result_rx) = unbounded();

                scope.spawn(move |_| {
                    worker::run(id, build_path, task_rx, reply_tx, result_tx)
                });

                workers.push(WorkerHandle {
                    tasks: Some(task_tx),
                    replies: reply_rx,
                    results: result_rx,
                });
            }

            master_loop(db, graph, workers)
        })
        .expect("worker thread panicked")
    }
}

/// What the select loop saw.
enum Event {
    Reply(usize, Reply),
    Result(usize, TaskResult),
    Disconnect(usize),
}

struct MasterState {
    tasks: HashMap<NodeId, Task>,
    ready: Vec<NodeId>,

    /// Dispatched tasks that have not been acknowledged yet.
    outstanding: HashMap<NodeId, usize>,

    /// Acknowledged tasks whose result payload has not arrived yet. A run is
    /// only complete once this drains, since results carry the database
    /// updates.
    awaiting: HashMap<NodeId, usize>,

    idle: Vec<usize>,
    build_failed: bool,
    crashed: Option<NodeId>,
}

impl MasterState {
    fn done(&self) -> bool {
        self.outstanding.is_empty()
            && self.awaiting.is_empty()
            && (self.build_failed || self.ready.is_empty())
    }

    fn status(&self) -> BuildStatus {
        match self.crashed {
            Some(task_id) => BuildStatus::Crashed { task_id },
            None if self.build_failed => BuildStatus::Failed,
            None => BuildStatus::Ok,
        }
    }
}

pub(crate) fn master_loop(
    db: &mut Database,
    graph: TaskGraph,
    mut workers: Vec<WorkerHandle>,
) -> Result<BuildStatus, Error> {
    let TaskGraph { tasks, ready } = graph;

    let mut state = MasterState {
        tasks,
        ready,
        outstanding: HashMap::new(),
        awaiting: HashMap::new(),
        idle: Vec::new(),
        build_failed: false,
        crashed: None,
    };

    let mut reply_dead = vec![false; workers.len()];
    let mut result_dead = vec![false; workers.len()];

    while !state.done() {
        let event = {
            let mut sel = Select::new();
            let mut index_map = Vec::new();

            for (id, handle) in workers.iter().enumerate() {
                if !reply_dead[id] {
                    sel.recv(&handle.replies);
                    index_map.push((id, false));
                }
                if !result_dead[id] {
                    sel.recv(&handle.results);
                    index_map.push((id, true));
                }
            }

            if index_map.is_empty() {
                // Every worker is gone but work remains.
                error!("all workers exited with work remaining");
                state.build_failed = true;
                break;
            }

            let oper = sel.select();
            let (id, is_result) = index_map[oper.index()];

            if is_result {
                match oper.recv(&workers[id].results) {
                    Ok(result) => Event::Result(id, result),
                    Err(_) => {
                        result_dead[id] = true;
                        Event::Disconnect(id)
                    }
                }
            } else {
                match oper.recv(&workers[id].replies) {
                    Ok(reply) => Event::Reply(id, reply),
                    Err(_) => {
                        reply_dead[id] = true;
                        Event::Disconnect(id)
                    }
                }
            }
        };

        match event {
            Event::Reply(id, Reply::Ready) => {
                feed_worker(&mut state, &mut workers, id);
            }
            Event::Reply(id, Reply::RanTask { task_id, ok }) => {
                state.outstanding.remove(&task_id);

                if ok {
                    debug!("task {} ran on worker {}", task_id, id);
                    feed_worker(&mut state, &mut workers, id);
                } else {
                    error!("task {} failed on worker {}", task_id, id);
                    fail_build(&mut state, &mut workers);
                    workers[id].tasks = None;
                }
            }
            Event::Result(_, result) => {
                process_result(db, &mut state, &mut workers, result)?;
            }
            Event::Disconnect(id) => {
                handle_disconnect(&mut state, &mut workers, id);
            }
        }
    }

    // Closing the task channels shuts down whatever is still running.
    for handle in &mut workers {
        handle.tasks = None;
    }

    Ok(state.status())
}

/// Hands a ready task to a worker, or parks/closes the worker if there is
/// nothing for it.
fn feed_worker(
    state: &mut MasterState,
    workers: &mut [WorkerHandle],
    id: usize,
) {
    if state.build_failed {
        workers[id].tasks = None;
        return;
    }

    let task_id = match state.ready.pop() {
        Some(task_id) => task_id,
        None => {
            // Waiting on outstanding work; park the worker.
            state.idle.push(id);
            return;
        }
    };

    let task = &state.tasks[&task_id];
    let assignment = Assignment {
        task_id,
        kind: task.kind,
        data: task.data.clone(),
        folder: task.folder.clone(),
        outputs: task.outputs.clone(),
    };

    let sent = match &workers[id].tasks {
        Some(tx) => tx.send(assignment).is_ok(),
        None => false,
    };

    if sent {
        debug!("dispatched task {} to worker {}", task_id, id);
        state.outstanding.insert(task_id, id);
        state.awaiting.insert(task_id, id);
    } else {
        // The worker is gone; put the task back for someone else. The
        // disconnect event deals with the worker itself.
        state.ready.push(task_id);
        workers[id].tasks = None;
    }
}

fn fail_build(state: &mut MasterState, workers: &mut [WorkerHandle]) {
    state.build_failed = true;

    // Stop accepting new work; outstanding workers drain on their own.
    for id in state.idle.drain(..) {
        workers[id].tasks = None;
    }
}

/// Applies a task's result payload.
///
/// On success the new stamps and discovered dependencies are committed as
/// one batch, and only then are downstream tasks released.
fn process_result(
    db: &mut Database,
    state: &mut MasterState,
    workers: &mut [WorkerHandle],
    result: TaskResult,
) -> Result<(), Error> {
    if !result.stdout.is_empty() {
        print!("[{}] {}", result.worker, result.stdout);
        io::stdout().flush().ok();
    }

    if !result.stderr.is_empty() {
        eprint!("{}", result.stderr);
    }

    state.awaiting.remove(&result.task_id);

    if !result.ok {
        // The failing task stays dirty; RanTask already failed the build.
        return Ok(());
    }

    db.begin()?;

    for (path, stamp) in &result.updates {
        match db.query_path(path)? {
            Some(entry) => db.unmark_dirty(entry.id, Some(*stamp))?,
            None => {
                warn!("no node for updated output {:?}", path);
            }
        }
    }

    if let Some(deps) = &result.deps {
        reconcile_deps(db, result.task_id, deps)?;
    }

    db.unmark_dirty(result.task_id, None)?;
    db.commit()?;

    // Release downstream tasks now that this task's effects are durable.
    let outgoing = match state.tasks.get(&result.task_id) {
        Some(task) => task.outgoing.clone(),
        None => Vec::new(),
    };

    for out in outgoing {
        let task = state.tasks.get_mut(&out).expect("unknown downstream task");
        task.incoming.remove(&result.task_id);

        if task.incoming.is_empty() {
            state.ready.push(out);
        }
    }

    // Newly released work may unblock parked workers.
    while !state.ready.is_empty() && !state.idle.is_empty() {
        let id = state.idle.pop().unwrap();
        feed_worker(state, workers, id);
    }

    Ok(())
}

/// Reconciles a compile task's dynamic inputs with what it actually read.
///
/// Paths that are already strong inputs contribute nothing new. Unknown
/// absolute paths become sources; unknown relative paths are a front-end bug
/// and are skipped.
fn reconcile_deps(
    db: &mut Database,
    task_id: NodeId,
    deps: &[PathBuf],
) -> Result<(), Error> {
    let strong: HashSet<NodeId> =
        db.query_strong_inputs(task_id)?.into_iter().collect();
    let current = db.query_dynamic_inputs(task_id)?;

    let mut wanted = BTreeSet::new();

    for path in deps {
        let node = match db.query_path(path)? {
            Some(entry) => entry.id,
            None if path.is_absolute() => db.find_or_add_source(path)?,
            None => {
                warn!(
                    "discovered dependency {:?} matches no node; ignoring",
                    path
                );
                continue;
            }
        };

        if !strong.contains(&node) {
            wanted.insert(node);
        }
    }

    for &node in &current {
        if !wanted.contains(&node) {
            debug!("dropping dynamic edge {} -> {}", node, task_id);
            db.drop_dynamic_edge(node, task_id)?;
        }
    }

    let current: HashSet<NodeId> = current.into_iter().collect();
    for &node in &wanted {
        if !current.contains(&node) {
            debug!("adding dynamic edge {} -> {}", node, task_id);
            db.add_dynamic_edge(node, task_id)?;
        }
    }

    Ok(())
}

/// A worker's channel went away. Harmless after a normal shutdown; a crash
/// if the worker still held a task.
fn handle_disconnect(
    state: &mut MasterState,
    workers: &mut [WorkerHandle],
    id: usize,
) {
    state.idle.retain(|&w| w != id);
    workers[id].tasks = None;

    let held = state
        .outstanding
        .iter()
        .chain(state.awaiting.iter())
        .find(|item| *item.1 == id)
        .map(|item| *item.0);

    if let Some(task_id) = held {
        error!("worker {} crashed while running task {}", id, task_id);

        state.outstanding.remove(&task_id);
        state.awaiting.remove(&task_id);

        if state.crashed.is_none() {
            state.crashed = Some(task_id);
        }

        fail_build(state, workers);
    }
}

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

//! The in-memory projection of pending work.
//!
//! Only commands appear here. Dependencies between tasks are resolved by
//! walking each command's inputs through artifacts and groups to the
//! commands that produce them; producers outside the dirty set have nothing
//! to contribute and are dropped.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;

use crate::database::Database;
use crate::error::{EngineError, Error};
use crate::node::{CommandData, NodeId, NodeKind};

/// One schedulable command.
#[derive(Clone, Debug)]
pub struct Task {
    pub id: NodeId,
    pub kind: NodeKind,
    pub data: CommandData,

    /// Working directory relative to the build root, if any.
    pub folder: Option<PathBuf>,

    /// Paths this command produces. Unlinked before the command runs so a
    /// stale output can never be mistaken for a fresh one.
    pub outputs: Vec<PathBuf>,

    /// Tasks that must finish before this one starts.
    pub incoming: BTreeSet<NodeId>,

    /// Tasks to release when this one finishes.
    pub outgoing: Vec<NodeId>,
}

#[derive(Debug)]
pub struct TaskGraph {
    pub tasks: HashMap<NodeId, Task>,

    /// Tasks with no unfinished dependencies, used as a stack.
    pub ready: Vec<NodeId>,
}

impl TaskGraph {
    /// Projects the dirty command set into task records.
    ///
    /// Fails with a graph-invariant error if the strong + dynamic relation
    /// is not acyclic over the given commands.
    pub fn build(
        db: &mut Database,
        commands: &[NodeId],
    ) -> Result<TaskGraph, Error> {
        let set: BTreeSet<NodeId> = commands.iter().cloned().collect();
        let mut tasks = HashMap::new();

        for &id in commands {
            let entry = db.query_node(id)?;

            let data = match entry.data.clone() {
                Some(data) => data,
                None => {
                    return Err(EngineError::Invariant(format!(
                        "command {} has no payload",
                        id
                    ))
                    .into());
                }
            };

            let folder = match entry.folder {
                Some(folder) => db.query_node(folder)?.path,
                None => None,
            };

            let mut outputs = Vec::new();
            for out in db.query_strong_outgoing(id)? {
                let out = db.query_node(out)?;
                if out.is_artifact() {
                    if let Some(path) = out.path {
                        outputs.push(path);
                    }
                }
            }

            tasks.insert(
                id,
                Task {
                    id,
                    kind: entry.kind,
                    data,
                    folder,
                    outputs,
                    incoming: BTreeSet::new(),
                    outgoing: Vec::new(),
                },
            );
        }

        for &id in commands {
            let mut inputs = Vec::new();
            inputs.extend(db.query_strong_inputs(id)?);
            inputs.extend(db.query_dynamic_inputs(id)?);
            inputs.extend(db.query_weak_inputs(id)?);

            let mut producers = BTreeSet::new();
            let mut seen = HashSet::new();
            for input in inputs {
                collect_producers(db, input, &set, &mut seen, &mut producers)?;
            }

            producers.remove(&id);

            for producer in producers {
                tasks.get_mut(&producer).unwrap().outgoing.push(id);
                tasks.get_mut(&id).unwrap().incoming.insert(producer);
            }
        }

        let ready: Vec<NodeId> = commands
            .iter()
            .cloned()
            .filter(|id| tasks[id].incoming.is_empty())
            .collect();

        check_acyclic(&tasks, &ready)?;

        Ok(TaskGraph { tasks, ready })
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Walks an input node to the commands that produce it.
///
/// A command input contributes itself; artifacts contribute their producing
/// command; groups fan out to their members. Only producers inside the dirty
/// set survive. Everything else is already up to date.
fn collect_producers(
    db: &mut Database,
    node: NodeId,
    set: &BTreeSet<NodeId>,
    seen: &mut HashSet<NodeId>,
    producers: &mut BTreeSet<NodeId>,
) -> Result<(), Error> {
    if !seen.insert(node) {
        return Ok(());
    }

    let entry = db.query_node(node)?;

    if entry.is_command() {
        if set.contains(&node) {
            producers.insert(node);
        }

        return Ok(());
    }

    for input in db.query_strong_inputs(node)? {
        collect_producers(db, input, set, seen, producers)?;
    }

    Ok(())
}

/// A Kahn sweep over a copy of the counters. If it cannot consume every
/// task, the remainder forms at least one cycle.
fn check_acyclic(
    tasks: &HashMap<NodeId, Task>,
    ready: &[NodeId],
) -> Result<(), Error> {
    let mut counts: HashMap<NodeId, usize> = tasks
        .iter()
        .map(|(id, task)| (*id, task.incoming.len()))
        .collect();

    let mut queue: Vec<NodeId> = ready.to_vec();
    let mut processed = 0;

    while let Some(id) = queue.pop() {
        processed += 1;

        for &out in &tasks[&id].outgoing {
            let count = counts.get_mut(&out).unwrap();
            *count -= 1;

            if *count == 0 {
                queue.push(out);
            }
        }
    }

    if processed != tasks.len() {
        let stuck: Vec<String> = tasks
            .keys()
            .filter(|id| counts[id] > 0)
            .map(|id| format!("{}", id))
            .collect();

        return Err(EngineError::Invariant(format!(
            "cycle detected in the build graph involving node(s) {}",
            stuck.join(", ")
        ))
        .into());
    }

    Ok(())
}

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

//! Task execution.
//!
//! A worker executes one command at a time, each in an isolated subprocess,
//! and reports over two channels: a fast acknowledgment on the task channel
//! so the master can dispatch more work, then the full result on a side
//! channel. Workers never touch the database; all persistence is the
//! master's job.

pub mod gcc;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use crossbeam::channel::{Receiver, Sender};
use log::{debug, warn};

use crate::error::{display_causes, EngineError, Error, ResultExt};
use crate::node::{CommandData, NodeId, NodeKind};
use crate::util::{self, PathExt};

/// A unit of work sent to a worker.
#[derive(Clone, Debug)]
pub struct Assignment {
    pub task_id: NodeId,
    pub kind: NodeKind,
    pub data: CommandData,

    /// Working directory relative to the build root.
    pub folder: Option<PathBuf>,

    /// Declared outputs, relative to the build root. Unlinked before the
    /// command runs and stat'ed after it succeeds.
    pub outputs: Vec<PathBuf>,
}

/// Fast acknowledgments on the task channel.
#[derive(Debug)]
pub enum Reply {
    Ready,
    RanTask { task_id: NodeId, ok: bool },
}

/// The master's end of a worker's channel pair.
///
/// Dropping the task sender is the close signal: the worker finishes what it
/// has and exits.
pub struct WorkerHandle {
    pub tasks: Option<Sender<Assignment>>,
    pub replies: Receiver<Reply>,
    pub results: Receiver<TaskResult>,
}

/// The full report on the result channel.
#[derive(Debug)]
pub struct TaskResult {
    pub worker: usize,
    pub task_id: NodeId,
    pub ok: bool,
    pub stdout: String,
    pub stderr: String,

    /// Discovered input paths. Present only for compile tasks.
    pub deps: Option<Vec<PathBuf>>,

    /// New modification time for every declared output, on success.
    pub updates: Vec<(PathBuf, f64)>,
}

struct Execution {
    ok: bool,
    stdout: String,
    stderr: String,
    deps: Option<Vec<PathBuf>>,
}

/// The worker loop. Runs until the task channel closes or the master goes
/// away.
pub fn run(
    id: usize,
    build_path: &Path,
    tasks: Receiver<Assignment>,
    replies: Sender<Reply>,
    results: Sender<TaskResult>,
) {
    debug!("spawned worker {}", id);

    if replies.send(Reply::Ready).is_err() {
        return;
    }

    while let Ok(task) = tasks.recv() {
        let task_id = task.task_id;

        let (ok, stdout, stderr, deps) = match execute(build_path, &task) {
            Ok(Execution {
                ok,
                stdout,
                stderr,
                deps,
            }) => (ok, stdout, stderr, deps),
            Err(err) => {
                (false, String::new(), display_causes(&err) + "\n", None)
            }
        };

        // Acknowledge first so the master can hand out more work while the
        // result payload is still in flight.
        if replies.send(Reply::RanTask { task_id, ok }).is_err() {
            return;
        }

        let mut updates = Vec::new();
        if ok {
            for output in &task.outputs {
                match util::mtime(build_path.join(output)) {
                    Ok(stamp) => updates.push((output.clone(), stamp)),
                    Err(err) => {
                        warn!(
                            "declared output {:?} missing after task {}: {}",
                            output, task_id, err
                        );
                    }
                }
            }
        }

        let sent = results.send(TaskResult {
            worker: id,
            task_id,
            ok,
            stdout,
            stderr,
            deps,
            updates,
        });

        if sent.is_err() {
            // The master has already torn down the result channel due to
            // some failure on its end.
            return;
        }
    }

    debug!("worker {} shutting down", id);
}

fn execute(build_path: &Path, task: &Assignment) -> Result<Execution, Error> {
    // Remove stale outputs so a failed command can never leave an old file
    // masquerading as a fresh one.
    for output in &task.outputs {
        match fs::remove_file(build_path.join(output)) {
            Ok(()) => {}
            Err(ref err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|_| {
                        format!("failed removing stale output {:?}", output)
                    })
                    .map_err(Error::from);
            }
        }
    }

    let cwd = match &task.folder {
        Some(folder) => build_path.join(folder),
        None => build_path.to_path_buf(),
    };

    match task.kind {
        NodeKind::Cxx => {
            let (argv, flavor) = match &task.data {
                CommandData::Compile { argv, flavor } => (argv, flavor),
                CommandData::Argv(_) => {
                    return Err(EngineError::Invariant(format!(
                        "compile task {} has a plain payload",
                        task.task_id
                    ))
                    .into());
                }
            };

            if flavor != "gcc" {
                return Err(
                    EngineError::UnknownCompiler(flavor.clone()).into()
                );
            }

            let output = spawn(argv, &cwd)?;
            let (stderr, deps) =
                gcc::parse_deps(&String::from_utf8_lossy(&output.stderr));

            Ok(Execution {
                ok: output.status.success(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr,
                deps: Some(rebase_deps(build_path, &cwd, deps)),
            })
        }
        _ => {
            let output = spawn(task.data.argv(), &cwd)?;

            Ok(Execution {
                ok: output.status.success(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                deps: None,
            })
        }
    }
}

fn spawn(argv: &[String], cwd: &Path) -> Result<Output, Error> {
    let (program, args) = match argv.split_first() {
        Some(split) => split,
        None => {
            return Err(EngineError::Invariant(String::from(
                "task has an empty argument vector",
            ))
            .into());
        }
    };

    // The subprocess must never block on our stdin.
    let output = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .with_context(|_| format!("failed to spawn {:?}", program))?;

    Ok(output)
}

/// Rewrites discovered dependency paths for the graph.
///
/// Relative paths from the compiler are relative to the task's working
/// directory. A path inside the build root becomes build-root-relative (it
/// names a produced file); anything else stays absolute (a system or source
/// header).
fn rebase_deps(
    build_path: &Path,
    cwd: &Path,
    deps: Vec<PathBuf>,
) -> Vec<PathBuf> {
    deps.into_iter()
        .map(|dep| {
            let abs = if dep.is_absolute() {
                dep.normalize()
            } else {
                cwd.join(&dep).normalize()
            };

            match abs.relative_from(build_path) {
                Some(rel) if !rel.starts_with("..") => rel,
                _ => abs,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rebase_deps() {
        let build = Path::new("/build");
        let cwd = Path::new("/build/obj");

        let deps = vec![
            PathBuf::from("/usr/include/stdio.h"),
            PathBuf::from("gen.h"),
            PathBuf::from("../top.h"),
            PathBuf::from("/src/foo.h"),
        ];

        assert_eq!(
            rebase_deps(build, cwd, deps),
            vec![
                PathBuf::from("/usr/include/stdio.h"),
                PathBuf::from("obj/gen.h"),
                PathBuf::from("top.h"),
                PathBuf::from("/src/foo.h"),
            ]
        );
    }

    #[cfg(unix)]
    mod unix {
        use super::super::*;

        use crossbeam::channel::unbounded;
        use std::thread;
        use tempfile::TempDir;

        fn sh(script: &str) -> CommandData {
            CommandData::Argv(vec![
                String::from("/bin/sh"),
                String::from("-c"),
                String::from(script),
            ])
        }

        fn run_one(
            build_path: &Path,
            task: Assignment,
        ) -> (Vec<Reply>, TaskResult) {
            let (task_tx, task_rx) = unbounded();
            let (reply_tx, reply_rx) = unbounded();
            let (result_tx, result_rx) = unbounded();

            let build_path = build_path.to_path_buf();
            let handle = thread::spawn(move || {
                run(0, &build_path, task_rx, reply_tx, result_tx)
            });

            task_tx.send(task).unwrap();
            drop(task_tx);

            let result = result_rx.recv().unwrap();
            let replies: Vec<Reply> = reply_rx.iter().collect();
            handle.join().unwrap();

            (replies, result)
        }

        #[test]
        fn test_runs_a_command() {
            let dir = TempDir::new().unwrap();

            let (replies, result) = run_one(
                dir.path(),
                Assignment {
                    task_id: NodeId(1),
                    kind: NodeKind::Command,
                    data: sh("echo hello && echo oops >&2"),
                    folder: None,
                    outputs: vec![],
                },
            );

            assert!(matches!(replies[0], Reply::Ready));
            assert!(matches!(
                replies[1],
                Reply::RanTask {
                    task_id: NodeId(1),
                    ok: true
                }
            ));

            assert!(result.ok);
            assert_eq!(result.stdout, "hello\n");
            assert_eq!(result.stderr, "oops\n");
            assert!(result.deps.is_none());
        }

        #[test]
        fn test_failure_is_reported() {
            let dir = TempDir::new().unwrap();

            let (replies, result) = run_one(
                dir.path(),
                Assignment {
                    task_id: NodeId(2),
                    kind: NodeKind::Command,
                    data: sh("exit 3"),
                    folder: None,
                    outputs: vec![],
                },
            );

            assert!(matches!(
                replies[1],
                Reply::RanTask { ok: false, .. }
            ));
            assert!(!result.ok);
            assert!(result.updates.is_empty());
        }

        #[test]
        fn test_outputs_are_unlinked_and_stamped() {
            let dir = TempDir::new().unwrap();

            // A stale output from some previous run.
            fs::write(dir.path().join("out.txt"), "stale").unwrap();

            let (_, result) = run_one(
                dir.path(),
                Assignment {
                    task_id: NodeId(3),
                    kind: NodeKind::Command,
                    data: sh("test ! -e out.txt && echo fresh > out.txt"),
                    folder: None,
                    outputs: vec![PathBuf::from("out.txt")],
                },
            );

            // The `test ! -e` only passes if the stale file was removed
            // before the command ran.
            assert!(result.ok);
            assert_eq!(result.updates.len(), 1);
            assert_eq!(result.updates[0].0, PathBuf::from("out.txt"));
            assert_eq!(
                result.updates[0].1,
                util::mtime(dir.path().join("out.txt")).unwrap()
            );
        }

        #[test]
        fn test_runs_in_the_task_folder() {
            let dir = TempDir::new().unwrap();
            fs::create_dir(dir.path().join("sub")).unwrap();

            let (_, result) = run_one(
                dir.path(),
                Assignment {
                    task_id: NodeId(4),
                    kind: NodeKind::Command,
                    data: sh("echo made > here.txt"),
                    folder: Some(PathBuf::from("sub")),
                    outputs: vec![PathBuf::from("sub/here.txt")],
                },
            );

            assert!(result.ok);
            assert!(dir.path().join("sub/here.txt").exists());
        }

        #[test]
        fn test_unknown_compiler_flavor_fails() {
            let dir = TempDir::new().unwrap();

            let (replies, result) = run_one(
                dir.path(),
                Assignment {
                    task_id: NodeId(5),
                    kind: NodeKind::Cxx,
                    data: CommandData::Compile {
                        argv: vec![String::from("true")],
                        flavor: String::from("tcc"),
                    },
                    folder: None,
                    outputs: vec![],
                },
            );

            assert!(matches!(
                replies[1],
                Reply::RanTask { ok: false, .. }
            ));
            assert!(!result.ok);
            assert!(result.stderr.contains("unknown compiler"));
        }

        #[test]
        fn test_compile_reports_deps() {
            let dir = TempDir::new().unwrap();

            // Fake a gcc -H run: header traces on stderr.
            let (_, result) = run_one(
                dir.path(),
                Assignment {
                    task_id: NodeId(6),
                    kind: NodeKind::Cxx,
                    data: CommandData::Compile {
                        argv: vec![
                            String::from("/bin/sh"),
                            String::from("-c"),
                            String::from(
                                "echo '. /usr/include/stdio.h' >&2; \
                                 echo '. gen.h' >&2; \
                                 echo 'real diagnostic' >&2",
                            ),
                        ],
                        flavor: String::from("gcc"),
                    },
                    folder: None,
                    outputs: vec![],
                },
            );

            assert!(result.ok);
            assert_eq!(result.stderr, "real diagnostic\n");

            let deps = result.deps.unwrap();
            assert_eq!(
                deps,
                vec![
                    PathBuf::from("/usr/include/stdio.h"),
                    PathBuf::from("gen.h"),
                ]
            );
        }
    }
}

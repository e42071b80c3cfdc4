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

//! The driver surface: execute pending work, query graph state.

use std::io;
use std::path::{Path, PathBuf};

use log::info;

use crate::config;
use crate::database::Database;
use crate::dirty;
use crate::error::{Error, ResultExt};
use crate::master::{BuildStatus, TaskMaster};
use crate::taskgraph::TaskGraph;

pub struct Build {
    /// Path to the root of the build tree. The graph database lives in the
    /// cache directory underneath it.
    build_path: PathBuf,
}

impl Build {
    pub fn new<P: AsRef<Path>>(build_path: P) -> Build {
        Build {
            build_path: build_path.as_ref().to_path_buf(),
        }
    }

    fn open_database(&self) -> Result<Database, Error> {
        let path = config::cache_dir(&self.build_path).join(config::GRAPH_FILE);

        Database::open(&path, &self.build_path)
            .with_context(|_| {
                format!(
                    "failed opening the build graph at {:?}; \
                     has the build been generated?",
                    path
                )
            })
            .map_err(Error::from)
    }

    /// Executes all pending work and reports the run's terminal state.
    pub fn run(&self, jobs: usize) -> Result<BuildStatus, Error> {
        let mut db = self.open_database()?;
        self.run_with(&mut db, jobs)
    }

    /// As `run`, against an already opened store.
    pub fn run_with(
        &self,
        db: &mut Database,
        jobs: usize,
    ) -> Result<BuildStatus, Error> {
        let commands = dirty::analyze(db)?;

        if commands.is_empty() {
            info!("nothing to do");
            return Ok(BuildStatus::Ok);
        }

        let graph = TaskGraph::build(db, &commands)?;
        let status = TaskMaster::new(jobs).run(db, graph, &self.build_path)?;

        info!("build {}", status);
        Ok(status)
    }

    /// Writes a rendering of the persistent graph. This never mutates
    /// anything on disk.
    pub fn dump_graph(&self, w: &mut dyn io::Write) -> Result<(), Error> {
        let mut db = self.open_database()?;
        db.print_graph(w)
    }
}

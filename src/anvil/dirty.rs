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

//! Startup analysis: decide what must be rebuilt.
//!
//! Runs once per build invocation, before anything is scheduled. Damage
//! propagates along strong and dynamic edges only; weak edges order the
//! schedule but never dirty anything.

use std::collections::BTreeSet;
use std::fs;

use log::{debug, info};

use crate::database::Database;
use crate::error::{Error, ResultExt};
use crate::node::{Dirty, NodeId, NodeKind};
use crate::util;

/// Computes the set of commands that must run, in ascending id order.
///
/// The steps, in order:
///
///  1. Ensure every `Mkdir` node exists on disk.
///  2. Seed the dirty set with nodes the database already knows are dirty.
///  3. Stat every clean artifact; a changed or missing file upgrades to
///     known-dirty, along with the command that produces it (if any).
///  4. Propagate transitively across strong and dynamic outgoing edges,
///     persisting the dirty bit for every reached command and produced file.
///  5. Artifacts whose producing command is not going to run have served
///     their purpose once the damage is recorded; they are re-stamped and
///     unmarked so an unchanged tree analyzes to nothing next time.
pub fn analyze(db: &mut Database) -> Result<Vec<NodeId>, Error> {
    for folder in db.query_mkdir()? {
        if let Some(path) = &folder.path {
            let path = db.resolve(path);
            fs::create_dir_all(&path).with_context(|_| {
                format!("failed creating build folder {:?}", path)
            })?;
        }
    }

    db.begin()?;

    let mut dirty = BTreeSet::new();

    for entry in db.query_known_dirty()? {
        dirty.insert(entry.id);
    }

    // Artifacts whose stored stamp no longer matches the file are stale. The
    // producing command (when there is one) is seeded alongside so that a
    // deleted or corrupted output gets regenerated, not just noticed.
    for entry in db.query_maybe_dirty()? {
        let path = match &entry.path {
            Some(path) => db.resolve(path),
            None => continue,
        };

        let changed = match util::mtime(&path) {
            Ok(stamp) => stamp != entry.stamp,
            Err(_) => true,
        };

        if !changed {
            continue;
        }

        debug!("stale artifact: {}", entry.format());

        db.mark_dirty(entry.id)?;
        dirty.insert(entry.id);

        for input in db.query_strong_inputs(entry.id)? {
            if db.query_node(input)?.is_command() {
                db.mark_dirty(input)?;
                dirty.insert(input);
            }
        }
    }

    // Propagate. The worklist is in ascending id order and every adjacency
    // query is sorted, so the traversal is deterministic for a fixed
    // database state.
    let mut queue: Vec<NodeId> = dirty.iter().rev().cloned().collect();

    while let Some(node) = queue.pop() {
        for out in db.query_outgoing(node)? {
            if dirty.contains(&out) {
                continue;
            }

            let entry = db.query_node(out)?;

            match entry.kind {
                NodeKind::Group => {}
                _ => db.mark_dirty(out)?,
            }

            dirty.insert(out);
            queue.push(out);
        }
    }

    let commands: Vec<NodeId> = dirty
        .iter()
        .cloned()
        .filter(|&id| match db.query_node(id) {
            Ok(entry) => entry.is_command(),
            Err(_) => false,
        })
        .collect();

    // Re-stamp artifacts nothing is going to regenerate. Their damage is now
    // recorded on every consumer.
    for &id in &dirty {
        let entry = db.query_node(id)?;

        if !entry.is_artifact() || entry.dirty != Dirty::Known {
            continue;
        }

        let rebuilt = db
            .query_strong_inputs(id)?
            .iter()
            .any(|input| dirty.contains(input));

        if !rebuilt {
            db.unmark_dirty(id, None)?;
        }
    }

    db.commit()?;

    info!(
        "{} dirty node(s), {} command(s) to run",
        dirty.len(),
        commands.len()
    );

    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;
    use std::thread::sleep;
    use std::time::Duration;

    use tempfile::TempDir;

    use crate::node::CommandData;

    fn argv(args: &[&str]) -> CommandData {
        CommandData::Argv(args.iter().map(|s| s.to_string()).collect())
    }

    fn touch(dir: &TempDir, name: &str, contents: &str) {
        // Leave room for filesystems with coarse mtime resolution.
        sleep(Duration::from_millis(20));
        fs::write(dir.path().join(name), contents).unwrap();
    }

    /// A.c -> compile1 -> A.o -> link -> app
    /// B.c -> compile2 -> B.o -> link
    struct Chain {
        a_c: NodeId,
        compile1: NodeId,
        a_o: NodeId,
        compile2: NodeId,
        b_o: NodeId,
        link: NodeId,
        app: NodeId,
    }

    fn chain(dir: &TempDir, db: &mut Database) -> Chain {
        for name in &["A.c", "B.c", "A.o", "B.o", "app"] {
            fs::write(dir.path().join(name), name).unwrap();
        }

        let a_c = db
            .add_source(&dir.path().join("A.c"), false)
            .unwrap();
        let b_c = db
            .add_source(&dir.path().join("B.c"), false)
            .unwrap();
        let a_o = db.add_output(None, Path::new("A.o")).unwrap();
        let b_o = db.add_output(None, Path::new("B.o")).unwrap();
        let app = db.add_output(None, Path::new("app")).unwrap();

        let compile1 =
            db.add_command(NodeKind::Cxx, None, argv(&["cc", "A.c"])).unwrap();
        let compile2 =
            db.add_command(NodeKind::Cxx, None, argv(&["cc", "B.c"])).unwrap();
        let link =
            db.add_command(NodeKind::Command, None, argv(&["ld"])).unwrap();

        db.add_strong_edge(a_c, compile1).unwrap();
        db.add_strong_edge(compile1, a_o).unwrap();
        db.add_strong_edge(b_c, compile2).unwrap();
        db.add_strong_edge(compile2, b_o).unwrap();
        db.add_strong_edge(a_o, link).unwrap();
        db.add_strong_edge(b_o, link).unwrap();
        db.add_strong_edge(link, app).unwrap();

        // Pretend a build already ran: stamp everything clean.
        for &id in &[a_c, b_c, a_o, b_o, app, compile1, compile2, link] {
            db.unmark_dirty(id, None).unwrap();
        }

        Chain {
            a_c,
            compile1,
            a_o,
            compile2,
            b_o,
            link,
            app,
        }
    }

    #[test]
    fn test_clean_tree_analyzes_to_nothing() {
        let dir = TempDir::new().unwrap();
        let mut db = Database::in_memory(dir.path()).unwrap();
        chain(&dir, &mut db);

        assert!(analyze(&mut db).unwrap().is_empty());

        // And again: analysis must not dirty anything itself.
        assert!(analyze(&mut db).unwrap().is_empty());
    }

    #[test]
    fn test_touched_source_dirties_consumers_only() {
        let dir = TempDir::new().unwrap();
        let mut db = Database::in_memory(dir.path()).unwrap();
        let c = chain(&dir, &mut db);

        touch(&dir, "A.c", "edited");

        let commands = analyze(&mut db).unwrap();
        assert_eq!(commands, vec![c.compile1, c.link]);

        assert_eq!(db.query_node(c.compile2).unwrap().dirty, Dirty::Clean);
        assert_eq!(db.query_node(c.b_o).unwrap().dirty, Dirty::Clean);

        // The damage on produced files is persisted.
        assert_eq!(db.query_node(c.a_o).unwrap().dirty, Dirty::Known);
        assert_eq!(db.query_node(c.app).unwrap().dirty, Dirty::Known);

        // The source itself was re-stamped; nothing regenerates it.
        assert_eq!(db.query_node(c.a_c).unwrap().dirty, Dirty::Clean);

        // Analysis is deterministic and idempotent modulo the source
        // re-stamp: the same command set falls out a second time.
        assert_eq!(analyze(&mut db).unwrap(), vec![c.compile1, c.link]);
    }

    #[test]
    fn test_missing_output_reruns_producer() {
        let dir = TempDir::new().unwrap();
        let mut db = Database::in_memory(dir.path()).unwrap();
        let c = chain(&dir, &mut db);

        fs::remove_file(dir.path().join("B.o")).unwrap();

        let commands = analyze(&mut db).unwrap();
        assert_eq!(commands, vec![c.compile2, c.link]);

        assert_eq!(db.query_node(c.b_o).unwrap().dirty, Dirty::Known);
        assert_eq!(db.query_node(c.compile1).unwrap().dirty, Dirty::Clean);
    }

    #[test]
    fn test_weak_edges_do_not_propagate() {
        let dir = TempDir::new().unwrap();
        let mut db = Database::in_memory(dir.path()).unwrap();

        for name in &["C.c", "generated.h", "C.o"] {
            fs::write(dir.path().join(name), name).unwrap();
        }

        let c_c = db.add_source(&dir.path().join("C.c"), false).unwrap();
        let gen_h = db.add_output(None, Path::new("generated.h")).unwrap();
        let c_o = db.add_output(None, Path::new("C.o")).unwrap();

        let gen =
            db.add_command(NodeKind::Command, None, argv(&["gen"])).unwrap();
        let compile =
            db.add_command(NodeKind::Cxx, None, argv(&["cc", "C.c"])).unwrap();

        db.add_strong_edge(gen, gen_h).unwrap();
        db.add_strong_edge(c_c, compile).unwrap();
        db.add_strong_edge(compile, c_o).unwrap();

        // Ordering only: generated.h must exist before the compile runs,
        // but its changes do not damage the compile.
        db.add_weak_edge(gen_h, compile).unwrap();

        for &id in &[c_c, gen_h, c_o, gen, compile] {
            db.unmark_dirty(id, None).unwrap();
        }

        touch(&dir, "generated.h", "regenerated");

        let commands = analyze(&mut db).unwrap();

        // The generator is rerun for its stale output, but the weak edge
        // keeps the damage away from the compile.
        assert_eq!(commands, vec![gen]);
        assert_eq!(db.query_node(compile).unwrap().dirty, Dirty::Clean);

        // Dirtying only the compile's strong input leaves the generator
        // alone.
        for &id in &[gen_h, gen] {
            db.unmark_dirty(id, None).unwrap();
        }
        touch(&dir, "C.c", "edited");

        let commands = analyze(&mut db).unwrap();
        assert_eq!(commands, vec![compile]);
        assert_eq!(db.query_node(gen).unwrap().dirty, Dirty::Clean);
    }

    #[test]
    fn test_dynamic_edges_propagate() {
        let dir = TempDir::new().unwrap();
        let mut db = Database::in_memory(dir.path()).unwrap();

        fs::write(dir.path().join("A.h"), "header").unwrap();

        let a_h = db.add_source(&dir.path().join("A.h"), false).unwrap();
        let compile =
            db.add_command(NodeKind::Cxx, None, argv(&["cc", "A.c"])).unwrap();

        // As discovered from a previous run's compiler output.
        db.add_dynamic_edge(a_h, compile).unwrap();

        db.unmark_dirty(a_h, None).unwrap();
        db.unmark_dirty(compile, None).unwrap();

        assert!(analyze(&mut db).unwrap().is_empty());

        touch(&dir, "A.h", "edited");
        assert_eq!(analyze(&mut db).unwrap(), vec![compile]);
    }

    #[test]
    fn test_mkdir_nodes_are_materialized() {
        let dir = TempDir::new().unwrap();
        let mut db = Database::in_memory(dir.path()).unwrap();

        db.add_folder(None, Path::new("obj/nested")).unwrap();

        analyze(&mut db).unwrap();

        assert!(dir.path().join("obj/nested").is_dir());
    }
}

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

//! The node store: the single source of truth for the build graph, both
//! persistently and in memory.
//!
//! Nodes and the three edge relations live in SQLite with write-ahead
//! journaling, so a mid-run failure leaves the database at a committed
//! prefix of the run. Everything outside this module refers to nodes by
//! `NodeId`; the store caches entries and per-node adjacency and repopulates
//! both on demand. The caches are purely a performance measure and may be
//! flushed at any time.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{info, warn};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{EngineError, Error, ResultExt};
use crate::node::{
    CommandData, Dirty, Entry, NodeId, NodeKind, GROUP_PREFIX,
};
use crate::util::{self, PathExt};

const SCHEMA: &str = "
    create table if not exists nodes(
        id integer primary key autoincrement,
        type varchar(4) not null,
        stamp real not null default 0.0,
        dirty int not null default 0,
        generated int not null default 0,
        path text,
        folder int,
        data blob
    );

    -- Edges specified by the build scripts. This table is essentially
    -- immutable except for reconfigures.
    create table if not exists edges(
        outgoing int not null,
        incoming int not null,
        unique (outgoing, incoming)
    );

    -- Edges specified by the build scripts, but only to enforce ordering.
    -- They do not propagate damage or updates.
    create table if not exists weak_edges(
        outgoing int not null,
        incoming int not null,
        unique (outgoing, incoming)
    );

    -- Edges discovered as a result of executing a command; for example, C++
    -- #includes.
    create table if not exists dynamic_edges(
        outgoing int not null,
        incoming int not null,
        unique (outgoing, incoming)
    );

    -- Files which trigger a reconfigure when they change.
    create table if not exists reconfigure(
        stamp real not null default 0.0,
        path text unique
    );

    create index if not exists outgoing_edge on edges(outgoing);
    create index if not exists incoming_edge on edges(incoming);
    create index if not exists weak_outgoing_edge on weak_edges(outgoing);
    create index if not exists weak_incoming_edge on weak_edges(incoming);
    create index if not exists dyn_outgoing_edge on dynamic_edges(outgoing);
    create index if not exists dyn_incoming_edge on dynamic_edges(incoming);
";

const NODE_COLUMNS: &str = "id, type, stamp, dirty, generated, path, folder, data";

/// A node row as it comes off a statement, before cache import.
struct RawNode {
    id: i64,
    kind: String,
    stamp: f64,
    dirty: i64,
    generated: i64,
    path: Option<String>,
    folder: Option<i64>,
    data: Option<Vec<u8>>,
}

impl RawNode {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawNode> {
        Ok(RawNode {
            id: row.get(0)?,
            kind: row.get(1)?,
            stamp: row.get(2)?,
            dirty: row.get(3)?,
            generated: row.get(4)?,
            path: row.get(5)?,
            folder: row.get(6)?,
            data: row.get(7)?,
        })
    }

    fn into_entry(self) -> Result<Entry, Error> {
        let data = match self.data {
            Some(blob) => Some(
                CommandData::from_blob(&blob)
                    .context("failed decoding command payload")?,
            ),
            None => None,
        };

        Ok(Entry {
            id: NodeId(self.id),
            kind: NodeKind::from_tag(&self.kind)?,
            path: self.path.map(PathBuf::from),
            folder: self.folder.map(NodeId),
            data,
            stamp: self.stamp,
            dirty: Dirty::from_column(self.dirty),
            generated: self.generated != 0,
        })
    }
}

pub struct Database {
    cn: Connection,

    /// The build root. Relative node paths resolve against this for every
    /// filesystem operation the store performs.
    base: PathBuf,

    node_cache: HashMap<NodeId, Entry>,
    path_cache: HashMap<PathBuf, NodeId>,

    // Memoized adjacency. Outgoing is the union of strong and dynamic edges.
    outgoing_cache: HashMap<NodeId, Vec<NodeId>>,
    strong_in_cache: HashMap<NodeId, Vec<NodeId>>,
    weak_in_cache: HashMap<NodeId, Vec<NodeId>>,
    dynamic_in_cache: HashMap<NodeId, Vec<NodeId>>,

    in_batch: bool,
}

impl Database {
    /// Opens (creating if necessary) the graph database at `path`. `base` is
    /// the build root.
    pub fn open<P, B>(path: P, base: B) -> Result<Database, Error>
    where
        P: AsRef<Path>,
        B: AsRef<Path>,
    {
        let cn = Connection::open(path.as_ref()).with_context(|_| {
            format!("failed opening database {:?}", path.as_ref())
        })?;

        Database::init(cn, base.as_ref().to_path_buf())
    }

    /// An in-memory store. Filesystem operations still resolve against
    /// `base`.
    pub fn in_memory<B: AsRef<Path>>(base: B) -> Result<Database, Error> {
        let cn = Connection::open_in_memory()?;
        Database::init(cn, base.as_ref().to_path_buf())
    }

    fn init(cn: Connection, base: PathBuf) -> Result<Database, Error> {
        cn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        cn.execute_batch(SCHEMA)
            .context("failed creating database schema")?;

        Ok(Database {
            cn,
            base,
            node_cache: HashMap::new(),
            path_cache: HashMap::new(),
            outgoing_cache: HashMap::new(),
            strong_in_cache: HashMap::new(),
            weak_in_cache: HashMap::new(),
            dynamic_in_cache: HashMap::new(),
            in_batch: false,
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Resolves a node path against the build root. Absolute paths (sources)
    /// pass through unchanged.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        self.base.join(path)
    }

    /// Drops every cache. Correctness does not depend on cache presence.
    pub fn flush_caches(&mut self) {
        self.node_cache.clear();
        self.path_cache.clear();
        self.outgoing_cache.clear();
        self.strong_in_cache.clear();
        self.weak_in_cache.clear();
        self.dynamic_in_cache.clear();
    }

    /// Opens a write batch. Every mutation until `commit` lands atomically.
    pub fn begin(&mut self) -> Result<(), Error> {
        debug_assert!(!self.in_batch);
        self.cn.execute_batch("BEGIN DEFERRED")?;
        self.in_batch = true;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<(), Error> {
        debug_assert!(self.in_batch);
        self.cn.execute_batch("COMMIT")?;
        self.in_batch = false;
        Ok(())
    }

    fn invariant<T>(msg: String) -> Result<T, Error> {
        Err(EngineError::Invariant(msg).into())
    }

    // ------------------------------------------------------------------
    // Insertion

    fn add_file(
        &mut self,
        kind: NodeKind,
        path: PathBuf,
        generated: bool,
        folder: Option<NodeId>,
    ) -> Result<NodeId, Error> {
        if self.query_path(&path)?.is_some() {
            return Database::invariant(format!(
                "a node for path {:?} already exists",
                path
            ));
        }

        let path_str = match path.to_str() {
            Some(s) => s.to_string(),
            None => {
                return Database::invariant(format!(
                    "path {:?} is not valid UTF-8",
                    path
                ));
            }
        };

        // New file nodes start clean with a zero stamp. The maybe-dirty scan
        // observes them on the next analysis: a zero stamp never matches a
        // real modification time.
        self.cn.execute(
            "insert into nodes (type, generated, path, folder) \
             values (?1, ?2, ?3, ?4)",
            params![
                kind.tag(),
                generated as i64,
                path_str,
                folder.map(|f| f.0)
            ],
        )?;

        let id = NodeId(self.cn.last_insert_rowid());

        let entry = Entry {
            id,
            kind,
            path: Some(path.clone()),
            folder,
            data: None,
            stamp: 0.0,
            dirty: Dirty::Clean,
            generated,
        };

        self.node_cache.insert(id, entry);
        self.path_cache.insert(path, id);

        Ok(id)
    }

    /// Inserts a `Source`. The path must be absolute and not already present.
    pub fn add_source(
        &mut self,
        path: &Path,
        generated: bool,
    ) -> Result<NodeId, Error> {
        if !path.is_absolute() {
            return Database::invariant(format!(
                "source path {:?} is not absolute",
                path
            ));
        }

        self.add_file(NodeKind::Source, path.to_path_buf(), generated, None)
    }

    /// Looks up a source by path, inserting it if missing. Used when a worker
    /// reports a dependency on a file the graph has never seen.
    pub fn find_or_add_source(&mut self, path: &Path) -> Result<NodeId, Error> {
        if let Some(entry) = self.query_path(path)? {
            if entry.kind != NodeKind::Source {
                return Database::invariant(format!(
                    "path {:?} exists but is not a source",
                    path
                ));
            }

            return Ok(entry.id);
        }

        self.add_source(path, false)
    }

    /// Inserts a `Mkdir` node under an optional parent folder.
    pub fn add_folder(
        &mut self,
        parent: Option<NodeId>,
        path: &Path,
    ) -> Result<NodeId, Error> {
        if path.is_absolute() || path.normalize() != path {
            return Database::invariant(format!(
                "folder path {:?} is not relative and normalized",
                path
            ));
        }

        self.add_file(NodeKind::Mkdir, path.to_path_buf(), false, parent)
    }

    /// Inserts an `Output`. When a folder is supplied, the output must live
    /// directly inside it.
    pub fn add_output(
        &mut self,
        folder: Option<NodeId>,
        path: &Path,
    ) -> Result<NodeId, Error> {
        self.add_produced_file(NodeKind::Output, folder, path)
    }

    /// Inserts a `CopyArtifact`, a file materialized by a copy command.
    pub fn add_copy_artifact(
        &mut self,
        folder: Option<NodeId>,
        path: &Path,
    ) -> Result<NodeId, Error> {
        self.add_produced_file(NodeKind::CopyArtifact, folder, path)
    }

    fn add_produced_file(
        &mut self,
        kind: NodeKind,
        folder: Option<NodeId>,
        path: &Path,
    ) -> Result<NodeId, Error> {
        if path.is_absolute() {
            return Database::invariant(format!(
                "output path {:?} is not relative to the build root",
                path
            ));
        }

        if let Some(folder) = folder {
            let folder_entry = self.query_node(folder)?;
            let folder_path = folder_entry.path.as_deref();

            if path.parent() != folder_path {
                return Database::invariant(format!(
                    "output {:?} does not live in folder {:?}",
                    path, folder_path
                ));
            }
        }

        self.add_file(kind, path.to_path_buf(), false, folder)
    }

    /// Inserts a `Group` node under its synthetic path.
    pub fn add_group(&mut self, name: &str) -> Result<NodeId, Error> {
        let path = PathBuf::from(format!("{}{}", GROUP_PREFIX, name));
        self.add_file(NodeKind::Group, path, false, None)
    }

    pub fn find_group(&mut self, name: &str) -> Result<Option<Entry>, Error> {
        let path = PathBuf::from(format!("{}{}", GROUP_PREFIX, name));
        self.query_path(&path)
    }

    /// Inserts a new command node, marked dirty.
    pub fn add_command(
        &mut self,
        kind: NodeKind,
        folder: Option<NodeId>,
        data: CommandData,
    ) -> Result<NodeId, Error> {
        if !kind.is_command() {
            return Database::invariant(format!(
                "{} is not a command type",
                kind
            ));
        }

        let blob = data.to_blob()?;

        self.cn.execute(
            "insert into nodes (type, folder, data, dirty) \
             values (?1, ?2, ?3, 1)",
            params![kind.tag(), folder.map(|f| f.0), blob],
        )?;

        let id = NodeId(self.cn.last_insert_rowid());

        self.node_cache.insert(
            id,
            Entry {
                id,
                kind,
                path: None,
                folder,
                data: Some(data),
                stamp: 0.0,
                dirty: Dirty::Known,
                generated: false,
            },
        );

        Ok(id)
    }

    /// Brings a command node in line with its latest declaration.
    ///
    /// Returns `false` when nothing changed. Otherwise the node is updated
    /// and marked dirty. Under `refactoring`, any change is instead a fatal
    /// error carrying both renderings of the command.
    ///
    /// Payloads compare by their canonical serialization, so the check is
    /// exactly as sensitive as the stored blob.
    pub fn update_command(
        &mut self,
        id: NodeId,
        kind: NodeKind,
        folder: Option<NodeId>,
        data: CommandData,
        refactoring: bool,
    ) -> Result<bool, Error> {
        let entry = self.query_node(id)?;

        let blob = data.to_blob()?;
        let old_blob = match &entry.data {
            Some(old) => Some(old.to_blob()?),
            None => None,
        };

        if entry.kind == kind
            && entry.folder == folder
            && old_blob.as_deref() == Some(blob.as_slice())
        {
            return Ok(false);
        }

        if refactoring {
            let new = Entry {
                id,
                kind,
                path: None,
                folder,
                data: Some(data),
                stamp: 0.0,
                dirty: Dirty::Known,
                generated: false,
            };

            return Err(EngineError::Refactoring {
                old: entry.format(),
                new: new.format(),
            }
            .into());
        }

        self.cn.execute(
            "update nodes set type = ?1, folder = ?2, data = ?3, dirty = 1 \
             where id = ?4",
            params![kind.tag(), folder.map(|f| f.0), blob, id.0],
        )?;

        if let Some(cached) = self.node_cache.get_mut(&id) {
            cached.kind = kind;
            cached.folder = folder;
            cached.data = Some(data);
            cached.dirty = Dirty::Known;
        }

        Ok(true)
    }

    // ------------------------------------------------------------------
    // Edges
    //
    // `from` is the producer/earlier node (the incoming endpoint), `to` is
    // the consumer/later node (the outgoing endpoint).

    pub fn add_strong_edge(
        &mut self,
        from: NodeId,
        to: NodeId,
    ) -> Result<(), Error> {
        self.cn
            .execute(
                "insert into edges (outgoing, incoming) values (?1, ?2)",
                params![to.0, from.0],
            )
            .with_context(|_| {
                format!("failed inserting strong edge {} -> {}", from, to)
            })?;

        self.strong_in_cache.remove(&to);
        self.outgoing_cache.remove(&from);
        Ok(())
    }

    pub fn add_weak_edge(
        &mut self,
        from: NodeId,
        to: NodeId,
    ) -> Result<(), Error> {
        self.cn
            .execute(
                "insert into weak_edges (outgoing, incoming) values (?1, ?2)",
                params![to.0, from.0],
            )
            .with_context(|_| {
                format!("failed inserting weak edge {} -> {}", from, to)
            })?;

        self.weak_in_cache.remove(&to);
        Ok(())
    }

    pub fn add_dynamic_edge(
        &mut self,
        from: NodeId,
        to: NodeId,
    ) -> Result<(), Error> {
        self.cn
            .execute(
                "insert into dynamic_edges (outgoing, incoming) \
                 values (?1, ?2)",
                params![to.0, from.0],
            )
            .with_context(|_| {
                format!("failed inserting dynamic edge {} -> {}", from, to)
            })?;

        self.dynamic_in_cache.remove(&to);
        self.outgoing_cache.remove(&from);
        Ok(())
    }

    pub fn drop_strong_edge(
        &mut self,
        from: NodeId,
        to: NodeId,
    ) -> Result<(), Error> {
        self.cn.execute(
            "delete from edges where outgoing = ?1 and incoming = ?2",
            params![to.0, from.0],
        )?;

        self.strong_in_cache.remove(&to);
        self.outgoing_cache.remove(&from);
        Ok(())
    }

    pub fn drop_weak_edge(
        &mut self,
        from: NodeId,
        to: NodeId,
    ) -> Result<(), Error> {
        self.cn.execute(
            "delete from weak_edges where outgoing = ?1 and incoming = ?2",
            params![to.0, from.0],
        )?;

        self.weak_in_cache.remove(&to);
        Ok(())
    }

    pub fn drop_dynamic_edge(
        &mut self,
        from: NodeId,
        to: NodeId,
    ) -> Result<(), Error> {
        self.cn.execute(
            "delete from dynamic_edges where outgoing = ?1 and incoming = ?2",
            params![to.0, from.0],
        )?;

        self.dynamic_in_cache.remove(&to);
        self.outgoing_cache.remove(&from);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dirty bits

    pub fn mark_dirty(&mut self, id: NodeId) -> Result<(), Error> {
        self.cn
            .execute("update nodes set dirty = 1 where id = ?1", params![id.0])?;

        if let Some(entry) = self.node_cache.get_mut(&id) {
            entry.dirty = Dirty::Known;
        }

        Ok(())
    }

    /// Clears the dirty bit and updates the stamp.
    ///
    /// Without an explicit stamp, commands get 0 and artifacts get the
    /// current filesystem mtime. If sampling the mtime fails, the node is
    /// left dirty so the next run retries.
    pub fn unmark_dirty(
        &mut self,
        id: NodeId,
        stamp: Option<f64>,
    ) -> Result<(), Error> {
        let entry = self.query_node(id)?;

        let stamp = match stamp {
            Some(stamp) => stamp,
            None if entry.is_artifact() => {
                let path = match &entry.path {
                    Some(path) => self.resolve(path),
                    None => {
                        return Database::invariant(format!(
                            "artifact {} has no path",
                            id
                        ));
                    }
                };

                match util::mtime(&path) {
                    Ok(stamp) => stamp,
                    Err(err) => {
                        warn!(
                            "could not stat {:?}; leaving node dirty: {}",
                            path, err
                        );
                        return Ok(());
                    }
                }
            }
            None => 0.0,
        };

        self.cn.execute(
            "update nodes set dirty = 0, stamp = ?1 where id = ?2",
            params![stamp, id.0],
        )?;

        if let Some(entry) = self.node_cache.get_mut(&id) {
            entry.dirty = Dirty::Clean;
            entry.stamp = stamp;
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries

    fn import(&mut self, raw: RawNode) -> Result<Entry, Error> {
        let id = NodeId(raw.id);

        if let Some(entry) = self.node_cache.get(&id) {
            return Ok(entry.clone());
        }

        let entry = raw.into_entry()?;

        if let Some(path) = &entry.path {
            self.path_cache.insert(path.clone(), id);
        }

        self.node_cache.insert(id, entry.clone());
        Ok(entry)
    }

    pub fn query_node(&mut self, id: NodeId) -> Result<Entry, Error> {
        if let Some(entry) = self.node_cache.get(&id) {
            return Ok(entry.clone());
        }

        let raw = self
            .cn
            .query_row(
                &format!("select {} from nodes where id = ?1", NODE_COLUMNS),
                params![id.0],
                RawNode::from_row,
            )
            .optional()?;

        match raw {
            Some(raw) => self.import(raw),
            None => Database::invariant(format!("no node with id {}", id)),
        }
    }

    pub fn query_path(&mut self, path: &Path) -> Result<Option<Entry>, Error> {
        if let Some(id) = self.path_cache.get(path) {
            let id = *id;
            return Ok(Some(self.query_node(id)?));
        }

        let path_str = match path.to_str() {
            Some(s) => s,
            None => return Ok(None),
        };

        let raw = self
            .cn
            .query_row(
                &format!("select {} from nodes where path = ?1", NODE_COLUMNS),
                params![path_str],
                RawNode::from_row,
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(Some(self.import(raw)?)),
            None => Ok(None),
        }
    }

    fn query_ids(
        &mut self,
        sql: &str,
        id: NodeId,
    ) -> Result<Vec<NodeId>, Error> {
        let mut stmt = self.cn.prepare(sql)?;
        let rows = stmt.query_map(params![id.0], |row| row.get::<_, i64>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(NodeId(row?));
        }

        Ok(ids)
    }

    /// Nodes that depend on this node: the union of strong and dynamic
    /// outgoing edges, ascending by id.
    pub fn query_outgoing(&mut self, id: NodeId) -> Result<Vec<NodeId>, Error> {
        if let Some(ids) = self.outgoing_cache.get(&id) {
            return Ok(ids.clone());
        }

        let ids = self.query_ids(
            "select outgoing from edges where incoming = ?1 \
             union \
             select outgoing from dynamic_edges where incoming = ?1 \
             order by outgoing",
            id,
        )?;

        self.outgoing_cache.insert(id, ids.clone());
        Ok(ids)
    }

    pub fn query_strong_outgoing(
        &mut self,
        id: NodeId,
    ) -> Result<Vec<NodeId>, Error> {
        self.query_ids(
            "select outgoing from edges where incoming = ?1 \
             order by outgoing",
            id,
        )
    }

    pub fn query_strong_inputs(
        &mut self,
        id: NodeId,
    ) -> Result<Vec<NodeId>, Error> {
        if let Some(ids) = self.strong_in_cache.get(&id) {
            return Ok(ids.clone());
        }

        let ids = self.query_ids(
            "select incoming from edges where outgoing = ?1 \
             order by incoming",
            id,
        )?;

        self.strong_in_cache.insert(id, ids.clone());
        Ok(ids)
    }

    pub fn query_weak_inputs(
        &mut self,
        id: NodeId,
    ) -> Result<Vec<NodeId>, Error> {
        if let Some(ids) = self.weak_in_cache.get(&id) {
            return Ok(ids.clone());
        }

        let ids = self.query_ids(
            "select incoming from weak_edges where outgoing = ?1 \
             order by incoming",
            id,
        )?;

        self.weak_in_cache.insert(id, ids.clone());
        Ok(ids)
    }

    pub fn query_dynamic_inputs(
        &mut self,
        id: NodeId,
    ) -> Result<Vec<NodeId>, Error> {
        if let Some(ids) = self.dynamic_in_cache.get(&id) {
            return Ok(ids.clone());
        }

        let ids = self.query_ids(
            "select incoming from dynamic_edges where outgoing = ?1 \
             order by incoming",
            id,
        )?;

        self.dynamic_in_cache.insert(id, ids.clone());
        Ok(ids)
    }

    // ------------------------------------------------------------------
    // Bulk scans

    fn scan(&mut self, sql: &str) -> Result<Vec<Entry>, Error> {
        let raws = {
            let mut stmt = self.cn.prepare(sql)?;
            let rows = stmt.query_map([], RawNode::from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut entries = Vec::with_capacity(raws.len());
        for raw in raws {
            entries.push(self.import(raw)?);
        }

        Ok(entries)
    }

    /// All `Mkdir` nodes.
    pub fn query_mkdir(&mut self) -> Result<Vec<Entry>, Error> {
        self.scan(&format!(
            "select {} from nodes where type = 'mkd' order by id",
            NODE_COLUMNS
        ))
    }

    /// Nodes that are dirty per the database, excluding folders.
    pub fn query_known_dirty(&mut self) -> Result<Vec<Entry>, Error> {
        self.scan(&format!(
            "select {} from nodes where dirty = 1 and type != 'mkd' \
             order by id",
            NODE_COLUMNS
        ))
    }

    /// Clean artifacts whose modification time must be checked. Mutually
    /// exclusive with `query_known_dirty`.
    pub fn query_maybe_dirty(&mut self) -> Result<Vec<Entry>, Error> {
        self.scan(&format!(
            "select {} from nodes where dirty = 0 \
             and (type = 'src' or type = 'out' or type = 'cpa') \
             order by id",
            NODE_COLUMNS
        ))
    }

    /// Every command-category node.
    pub fn query_commands(&mut self) -> Result<Vec<Entry>, Error> {
        self.scan(&format!(
            "select {} from nodes \
             where type != 'src' and type != 'out' and type != 'grp' \
             and type != 'mkd' and type != 'cpa' \
             order by id",
            NODE_COLUMNS
        ))
    }

    pub fn query_groups(&mut self) -> Result<Vec<Entry>, Error> {
        self.scan(&format!(
            "select {} from nodes where type = 'grp' order by id",
            NODE_COLUMNS
        ))
    }

    // ------------------------------------------------------------------
    // Deletion

    /// Removes a node and every edge referencing it, in all three relations.
    pub fn drop_entry(&mut self, id: NodeId) -> Result<(), Error> {
        self.cn
            .execute("delete from nodes where id = ?1", params![id.0])?;
        self.cn.execute(
            "delete from edges where incoming = ?1 or outgoing = ?1",
            params![id.0],
        )?;
        self.cn.execute(
            "delete from dynamic_edges where incoming = ?1 or outgoing = ?1",
            params![id.0],
        )?;
        self.cn.execute(
            "delete from weak_edges where incoming = ?1 or outgoing = ?1",
            params![id.0],
        )?;

        if let Some(entry) = self.node_cache.remove(&id) {
            if let Some(path) = entry.path {
                self.path_cache.remove(&path);
            }
        }

        // Edges touching this node may be memoized on any neighbor.
        self.outgoing_cache.clear();
        self.strong_in_cache.clear();
        self.weak_in_cache.clear();
        self.dynamic_in_cache.clear();

        Ok(())
    }

    /// Drops an output node and unlinks the file it produced. A file that is
    /// already gone is fine.
    pub fn drop_output(&mut self, id: NodeId) -> Result<(), Error> {
        let entry = self.query_node(id)?;

        match entry.kind {
            NodeKind::Output | NodeKind::CopyArtifact => {}
            kind => {
                return Database::invariant(format!(
                    "node {} is a {}, not an output",
                    id, kind
                ));
            }
        }

        let path = entry.path.clone().unwrap_or_default();

        if self.resolve(&path).exists() {
            info!("removing old output: {}", path.display());
        }

        match fs::remove_file(self.resolve(&path)) {
            Ok(()) => {}
            Err(ref err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|_| {
                        format!("could not remove file {:?}", path)
                    })
                    .map_err(Error::from);
            }
        }

        self.drop_entry(id)
    }

    /// Drops a folder node and removes the directory. Fails while any node
    /// still references it as its working folder.
    pub fn drop_folder(&mut self, id: NodeId) -> Result<(), Error> {
        let entry = self.query_node(id)?;

        if entry.kind != NodeKind::Mkdir {
            return Database::invariant(format!(
                "node {} is a {}, not a folder",
                id, entry.kind
            ));
        }

        let path = entry.path.clone().unwrap_or_default();

        if self.resolve(&path).exists() {
            info!("removing old folder: {}", path.display());
        }

        match fs::remove_dir(self.resolve(&path)) {
            Ok(()) => {}
            Err(ref err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|_| {
                        format!("could not remove folder {:?}", path)
                    })
                    .map_err(Error::from);
            }
        }

        let referenced: i64 = self.cn.query_row(
            "select count(*) from nodes where folder = ?1",
            params![id.0],
            |row| row.get(0),
        )?;

        if referenced > 0 {
            return Database::invariant(format!(
                "folder {} is about to be deleted, but is still in use",
                id
            ));
        }

        self.drop_entry(id)
    }

    /// Drops a command node. Its strong outputs go first, so an orphaned
    /// output never survives its producer.
    pub fn drop_command(&mut self, id: NodeId) -> Result<(), Error> {
        for out in self.query_strong_outgoing(id)? {
            let entry = self.query_node(out)?;

            match entry.kind {
                NodeKind::Output | NodeKind::CopyArtifact => {
                    self.drop_output(out)?;
                }
                // Group membership edges die with the command itself.
                NodeKind::Group => {}
                kind => {
                    return Database::invariant(format!(
                        "command {} has a strong edge to a {} node",
                        id, kind
                    ));
                }
            }
        }

        self.drop_entry(id)
    }

    pub fn drop_group(&mut self, id: NodeId) -> Result<(), Error> {
        self.drop_entry(id)
    }

    // ------------------------------------------------------------------
    // Reconfigure scripts

    /// Records a build-script file whose change triggers a reconfigure.
    pub fn add_or_update_script(&mut self, path: &Path) -> Result<(), Error> {
        let stamp = util::mtime(self.resolve(path))
            .with_context(|_| format!("failed to stat script {:?}", path))?;

        let path_str = match path.to_str() {
            Some(s) => s,
            None => {
                return Database::invariant(format!(
                    "script path {:?} is not valid UTF-8",
                    path
                ));
            }
        };

        self.cn.execute(
            "insert or replace into reconfigure (path, stamp) \
             values (?1, ?2)",
            params![path_str, stamp],
        )?;

        Ok(())
    }

    pub fn drop_script(&mut self, path: &Path) -> Result<(), Error> {
        if let Some(path_str) = path.to_str() {
            self.cn.execute(
                "delete from reconfigure where path = ?1",
                params![path_str],
            )?;
        }

        Ok(())
    }

    pub fn query_scripts(&mut self) -> Result<Vec<(PathBuf, f64)>, Error> {
        let mut stmt = self
            .cn
            .prepare("select path, stamp from reconfigure order by path")?;

        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?;

        let mut scripts = Vec::new();
        for row in rows {
            let (path, stamp) = row?;
            scripts.push((PathBuf::from(path), stamp));
        }

        Ok(scripts)
    }

    // ------------------------------------------------------------------
    // Graph dump

    /// Writes a human-readable rendering of the graph: the folder list, then
    /// every node without strong consumers as an input tree.
    pub fn print_graph(&mut self, w: &mut dyn io::Write) -> Result<(), Error> {
        for folder in self.query_mkdir()? {
            writeln!(w, " : mkdir \"{}\"", folder.format())?;
        }

        let roots = {
            let mut stmt = self.cn.prepare(
                "select id from nodes \
                 where id not in (select incoming from edges) \
                 and type != 'mkd' order by id",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        for id in roots {
            self.print_node(w, NodeId(id), 0)?;
        }

        Ok(())
    }

    fn print_node(
        &mut self,
        w: &mut dyn io::Write,
        id: NodeId,
        indent: usize,
    ) -> Result<(), Error> {
        let entry = self.query_node(id)?;
        writeln!(w, "{} - {}", "  ".repeat(indent), entry.format())?;

        for input in self.query_strong_inputs(id)? {
            self.print_node(w, input, indent + 1)?;
        }

        for input in self.query_dynamic_inputs(id)? {
            self.print_node(w, input, indent + 1)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    fn test_db() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let db = Database::in_memory(dir.path()).unwrap();
        (dir, db)
    }

    fn argv(args: &[&str]) -> CommandData {
        CommandData::Argv(args.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_add_and_query_path() {
        let (_dir, mut db) = test_db();

        let src = db.add_source(Path::new("/src/foo.c"), false).unwrap();

        let entry = db.query_path(Path::new("/src/foo.c")).unwrap().unwrap();
        assert_eq!(entry.id, src);
        assert_eq!(entry.kind, NodeKind::Source);
        assert_eq!(entry.dirty, Dirty::Clean);
        assert_eq!(entry.stamp, 0.0);

        // A second node under the same path violates the path mapping.
        assert!(db.add_source(Path::new("/src/foo.c"), false).is_err());

        // Relative source paths are rejected.
        assert!(db.add_source(Path::new("foo.c"), false).is_err());

        db.drop_entry(src).unwrap();
        assert!(db.query_path(Path::new("/src/foo.c")).unwrap().is_none());
        assert!(db.query_node(src).is_err());
    }

    #[test]
    fn test_query_survives_cache_flush() {
        let (_dir, mut db) = test_db();

        let src = db.add_source(Path::new("/src/a.c"), true).unwrap();
        let cmd = db
            .add_command(NodeKind::Cxx, None, argv(&["gcc", "-c", "a.c"]))
            .unwrap();
        db.add_strong_edge(src, cmd).unwrap();

        db.flush_caches();

        let entry = db.query_node(src).unwrap();
        assert_eq!(entry.kind, NodeKind::Source);
        assert!(entry.generated);

        let entry = db.query_node(cmd).unwrap();
        assert_eq!(entry.kind, NodeKind::Cxx);
        assert_eq!(entry.data, Some(argv(&["gcc", "-c", "a.c"])));
        assert_eq!(entry.stamp, 0.0);

        assert_eq!(db.query_strong_inputs(cmd).unwrap(), vec![src]);
        assert_eq!(db.query_outgoing(src).unwrap(), vec![cmd]);
    }

    #[test]
    fn test_adjacency_is_inverse() {
        let (_dir, mut db) = test_db();

        let a = db.add_source(Path::new("/a"), false).unwrap();
        let b = db.add_source(Path::new("/b"), false).unwrap();
        let cmd1 = db.add_command(NodeKind::Command, None, argv(&["x"])).unwrap();
        let cmd2 = db.add_command(NodeKind::Command, None, argv(&["y"])).unwrap();

        db.add_strong_edge(a, cmd1).unwrap();
        db.add_strong_edge(a, cmd2).unwrap();
        db.add_strong_edge(b, cmd2).unwrap();
        db.add_dynamic_edge(b, cmd1).unwrap();

        // For every edge relation, incoming and outgoing must be exact
        // inverses.
        for &node in &[a, b] {
            for out in db.query_outgoing(node).unwrap() {
                let strong = db.query_strong_inputs(out).unwrap();
                let dynamic = db.query_dynamic_inputs(out).unwrap();
                assert!(
                    strong.contains(&node) || dynamic.contains(&node),
                    "outgoing edge {} -> {} has no inverse",
                    node,
                    out
                );
            }
        }

        for &cmd in &[cmd1, cmd2] {
            for input in db.query_strong_inputs(cmd).unwrap() {
                assert!(db.query_outgoing(input).unwrap().contains(&cmd));
            }
            for input in db.query_dynamic_inputs(cmd).unwrap() {
                assert!(db.query_outgoing(input).unwrap().contains(&cmd));
            }
        }

        assert_eq!(db.query_outgoing(a).unwrap(), vec![cmd1, cmd2]);
        assert_eq!(db.query_strong_inputs(cmd2).unwrap(), vec![a, b]);
        assert_eq!(db.query_dynamic_inputs(cmd1).unwrap(), vec![b]);
    }

    #[test]
    fn test_edge_drop() {
        let (_dir, mut db) = test_db();

        let a = db.add_source(Path::new("/a"), false).unwrap();
        let cmd = db.add_command(NodeKind::Command, None, argv(&["x"])).unwrap();

        db.add_dynamic_edge(a, cmd).unwrap();
        assert_eq!(db.query_dynamic_inputs(cmd).unwrap(), vec![a]);

        db.drop_dynamic_edge(a, cmd).unwrap();
        assert!(db.query_dynamic_inputs(cmd).unwrap().is_empty());
        assert!(db.query_outgoing(a).unwrap().is_empty());

        db.add_weak_edge(a, cmd).unwrap();
        assert_eq!(db.query_weak_inputs(cmd).unwrap(), vec![a]);

        // Weak edges never show up in outgoing.
        assert!(db.query_outgoing(a).unwrap().is_empty());

        db.drop_weak_edge(a, cmd).unwrap();
        assert!(db.query_weak_inputs(cmd).unwrap().is_empty());
    }

    #[test]
    fn test_update_command() {
        let (_dir, mut db) = test_db();

        let cmd = db
            .add_command(NodeKind::Command, None, argv(&["gcc", "-c"]))
            .unwrap();
        db.unmark_dirty(cmd, None).unwrap();

        // No change.
        assert!(!db
            .update_command(cmd, NodeKind::Command, None, argv(&["gcc", "-c"]), false)
            .unwrap());
        assert_eq!(db.query_node(cmd).unwrap().dirty, Dirty::Clean);

        // Changed: updated and re-marked dirty.
        assert!(db
            .update_command(cmd, NodeKind::Command, None, argv(&["gcc", "-O2"]), false)
            .unwrap());

        let entry = db.query_node(cmd).unwrap();
        assert_eq!(entry.dirty, Dirty::Known);
        assert_eq!(entry.data, Some(argv(&["gcc", "-O2"])));

        // Under refactoring, any change is fatal.
        let err = db
            .update_command(cmd, NodeKind::Command, None, argv(&["clang"]), true)
            .unwrap_err();
        assert!(format!("{}", err).contains("refactoring"));
    }

    #[test]
    fn test_unmark_dirty_stamps() {
        let (dir, mut db) = test_db();

        fs::write(dir.path().join("out.o"), b"obj").unwrap();

        let out = db.add_output(None, Path::new("out.o")).unwrap();
        db.unmark_dirty(out, None).unwrap();

        let entry = db.query_node(out).unwrap();
        assert_eq!(entry.dirty, Dirty::Clean);
        assert_eq!(
            entry.stamp,
            util::mtime(dir.path().join("out.o")).unwrap()
        );

        // Explicit stamps are taken as-is.
        db.unmark_dirty(out, Some(42.5)).unwrap();
        assert_eq!(db.query_node(out).unwrap().stamp, 42.5);

        // Stat failure leaves the node dirty.
        let gone = db.add_output(None, Path::new("missing.o")).unwrap();
        db.mark_dirty(gone).unwrap();
        db.unmark_dirty(gone, None).unwrap();
        assert_eq!(db.query_node(gone).unwrap().dirty, Dirty::Known);

        // Commands stamp at zero.
        let cmd = db.add_command(NodeKind::Command, None, argv(&["x"])).unwrap();
        db.unmark_dirty(cmd, None).unwrap();
        let entry = db.query_node(cmd).unwrap();
        assert_eq!(entry.stamp, 0.0);
        assert_eq!(entry.dirty, Dirty::Clean);
    }

    #[test]
    fn test_bulk_scans() {
        let (dir, mut db) = test_db();

        fs::write(dir.path().join("a.out"), b"x").unwrap();

        let folder = db.add_folder(None, Path::new("obj")).unwrap();
        let src = db.add_source(Path::new("/a.c"), false).unwrap();
        let out = db.add_output(None, Path::new("a.out")).unwrap();
        let cmd = db.add_command(NodeKind::Cxx, Some(folder), argv(&["x"])).unwrap();
        let grp = db.add_group("all").unwrap();

        db.unmark_dirty(src, Some(1.0)).unwrap();
        db.unmark_dirty(out, None).unwrap();

        let mkdirs: Vec<_> =
            db.query_mkdir().unwrap().iter().map(|e| e.id).collect();
        assert_eq!(mkdirs, vec![folder]);

        // Only the command is dirty; file nodes and groups start clean.
        let dirty: Vec<_> =
            db.query_known_dirty().unwrap().iter().map(|e| e.id).collect();
        assert_eq!(dirty, vec![cmd]);

        let maybe: Vec<_> =
            db.query_maybe_dirty().unwrap().iter().map(|e| e.id).collect();
        assert_eq!(maybe, vec![src, out]);

        let commands: Vec<_> =
            db.query_commands().unwrap().iter().map(|e| e.id).collect();
        assert_eq!(commands, vec![cmd]);

        let groups: Vec<_> =
            db.query_groups().unwrap().iter().map(|e| e.id).collect();
        assert_eq!(groups, vec![grp]);
    }

    #[test]
    fn test_groups() {
        let (_dir, mut db) = test_db();

        assert!(db.find_group("all").unwrap().is_none());

        let grp = db.add_group("all").unwrap();
        let found = db.find_group("all").unwrap().unwrap();
        assert_eq!(found.id, grp);
        assert_eq!(found.path.unwrap(), Path::new("//group/./all"));

        db.drop_group(grp).unwrap();
        assert!(db.find_group("all").unwrap().is_none());
    }

    #[test]
    fn test_drop_command_removes_outputs() {
        let (dir, mut db) = test_db();

        fs::write(dir.path().join("a.o"), b"obj").unwrap();

        let out = db.add_output(None, Path::new("a.o")).unwrap();
        let cmd = db.add_command(NodeKind::Cxx, None, argv(&["x"])).unwrap();
        db.add_strong_edge(cmd, out).unwrap();

        db.drop_command(cmd).unwrap();

        assert!(db.query_path(Path::new("a.o")).unwrap().is_none());
        assert!(!dir.path().join("a.o").exists());
        assert!(db.query_node(cmd).is_err());
    }

    #[test]
    fn test_drop_folder_in_use() {
        let (dir, mut db) = test_db();

        let folder = db.add_folder(None, Path::new("obj")).unwrap();
        let _out =
            db.add_output(Some(folder), Path::new("obj/a.o")).unwrap();

        fs::create_dir(dir.path().join("obj")).unwrap();

        // Still referenced by the output node.
        assert!(db.drop_folder(folder).is_err());
    }

    #[test]
    fn test_drop_folder() {
        let (dir, mut db) = test_db();

        let folder = db.add_folder(None, Path::new("obj")).unwrap();
        fs::create_dir(dir.path().join("obj")).unwrap();

        db.drop_folder(folder).unwrap();
        assert!(!dir.path().join("obj").exists());

        // Folders that are already gone are fine.
        let folder = db.add_folder(None, Path::new("other")).unwrap();
        db.drop_folder(folder).unwrap();
    }

    #[test]
    fn test_output_folder_mismatch() {
        let (_dir, mut db) = test_db();

        let folder = db.add_folder(None, Path::new("obj")).unwrap();

        assert!(db
            .add_output(Some(folder), Path::new("elsewhere/a.o"))
            .is_err());
        assert!(db.add_output(Some(folder), Path::new("obj/a.o")).is_ok());
    }

    #[test]
    fn test_reconfigure_scripts() {
        let (dir, mut db) = test_db();

        fs::write(dir.path().join("build.script"), b"rules").unwrap();

        db.add_or_update_script(Path::new("build.script")).unwrap();

        let scripts = db.query_scripts().unwrap();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].0, Path::new("build.script"));
        assert!(scripts[0].1 > 0.0);

        // Upserting the same path keeps a single row.
        db.add_or_update_script(Path::new("build.script")).unwrap();
        assert_eq!(db.query_scripts().unwrap().len(), 1);

        db.drop_script(Path::new("build.script")).unwrap();
        assert!(db.query_scripts().unwrap().is_empty());
    }

    #[test]
    fn test_find_or_add_source() {
        let (_dir, mut db) = test_db();

        let a = db.find_or_add_source(Path::new("/inc/a.h")).unwrap();
        let b = db.find_or_add_source(Path::new("/inc/a.h")).unwrap();
        assert_eq!(a, b);

        // An existing non-source under the path is a front-end bug.
        db.add_output(None, Path::new("gen.h")).unwrap();
        assert!(db.find_or_add_source(Path::new("gen.h")).is_err());
    }

    #[test]
    fn test_print_graph() {
        let (_dir, mut db) = test_db();

        let _folder = db.add_folder(None, Path::new("obj")).unwrap();
        let src = db.add_source(Path::new("/a.c"), false).unwrap();
        let out = db.add_output(None, Path::new("a.o")).unwrap();
        let cmd = db
            .add_command(NodeKind::Cxx, None, argv(&["gcc", "-c", "/a.c"]))
            .unwrap();
        db.add_strong_edge(src, cmd).unwrap();
        db.add_strong_edge(cmd, out).unwrap();

        let mut buf = Vec::new();
        db.print_graph(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();

        assert!(text.contains(" : mkdir \"obj\""));
        assert!(text.contains("a.o"));
        assert!(text.contains("gcc -c /a.c"));
        assert!(text.contains("/a.c"));
    }
}

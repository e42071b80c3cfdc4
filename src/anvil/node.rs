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

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Group nodes have no path on disk. They are identified by a synthetic path
/// under this prefix so that they can still live in the path index.
pub const GROUP_PREFIX: &str = "//group/./";

/// A stable node identifier. Assigned on first insertion and never reused,
/// even after the node is deleted.
#[derive(
    Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Serialize,
    Deserialize,
)]
pub struct NodeId(pub i64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The closed set of node types.
///
/// `Command`, `Cxx`, `Copy`, and `Symlink` are *commands*: they are executed,
/// not observed. `Source`, `Output`, `Mkdir`, and `CopyArtifact` are
/// *artifacts*: their identity is a filesystem path and their state includes
/// an observed modification time. `Group` is an aggregation node and belongs
/// to neither category.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub enum NodeKind {
    /// An external input file, identified by absolute path.
    Source,
    /// A file produced by a command, identified by a path relative to the
    /// build root.
    Output,
    /// A directory to be ensured before anything runs.
    Mkdir,
    /// A named aggregation of other nodes.
    Group,
    /// A generic external invocation.
    Command,
    /// A compile invocation. Its payload carries a compiler flavor used to
    /// interpret the process output.
    Cxx,
    /// A file copy expressed as a command.
    Copy,
    /// A symlink creation expressed as a command.
    Symlink,
    /// A file materialized by a copy command.
    CopyArtifact,
}

impl NodeKind {
    /// The short tag stored in the `type` column.
    pub fn tag(self) -> &'static str {
        match self {
            NodeKind::Source => "src",
            NodeKind::Output => "out",
            NodeKind::Mkdir => "mkd",
            NodeKind::Group => "grp",
            NodeKind::Command => "cmd",
            NodeKind::Cxx => "cxx",
            NodeKind::Copy => "cp",
            NodeKind::Symlink => "ln",
            NodeKind::CopyArtifact => "cpa",
        }
    }

    pub fn from_tag(tag: &str) -> Result<NodeKind, Error> {
        match tag {
            "src" => Ok(NodeKind::Source),
            "out" => Ok(NodeKind::Output),
            "mkd" => Ok(NodeKind::Mkdir),
            "grp" => Ok(NodeKind::Group),
            "cmd" => Ok(NodeKind::Command),
            "cxx" => Ok(NodeKind::Cxx),
            "cp" => Ok(NodeKind::Copy),
            "ln" => Ok(NodeKind::Symlink),
            "cpa" => Ok(NodeKind::CopyArtifact),
            _ => Err(failure::format_err!("unknown node type tag {:?}", tag)),
        }
    }

    pub fn is_command(self) -> bool {
        match self {
            NodeKind::Command
            | NodeKind::Cxx
            | NodeKind::Copy
            | NodeKind::Symlink => true,
            _ => false,
        }
    }

    pub fn is_artifact(self) -> bool {
        match self {
            NodeKind::Source
            | NodeKind::Output
            | NodeKind::Mkdir
            | NodeKind::CopyArtifact => true,
            _ => false,
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Rebuild state of a node.
///
/// Only `Clean` and `Known` are persisted. `Maybe` is the analyzer's
/// classification for clean artifacts whose modification time has not been
/// re-observed yet this run.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Dirty {
    Clean,
    Maybe,
    Known,
}

impl Dirty {
    pub fn from_column(dirty: i64) -> Dirty {
        if dirty == 0 {
            Dirty::Clean
        } else {
            Dirty::Known
        }
    }

    pub fn to_column(self) -> i64 {
        match self {
            Dirty::Known => 1,
            Dirty::Clean | Dirty::Maybe => 0,
        }
    }
}

/// The command-specific payload of a command node.
///
/// This is stored in the database as an opaque blob. The serialized bytes are
/// canonical: payload equality (used by the refactoring check) is bytewise
/// equality of the serialization.
#[derive(Serialize, Deserialize, Clone, Eq, PartialEq, Hash, Debug)]
pub enum CommandData {
    /// A plain argument vector. Used by `Command`, `Copy`, and `Symlink`
    /// nodes.
    Argv(Vec<String>),

    /// A compile invocation: the argument vector plus the compiler flavor
    /// that decides how its output is parsed for discovered dependencies.
    Compile { argv: Vec<String>, flavor: String },
}

impl CommandData {
    pub fn to_blob(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_blob(blob: &[u8]) -> Result<CommandData, Error> {
        Ok(serde_json::from_slice(blob)?)
    }

    pub fn argv(&self) -> &[String] {
        match self {
            CommandData::Argv(argv) => argv,
            CommandData::Compile { argv, .. } => argv,
        }
    }
}

impl fmt::Display for CommandData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandData::Argv(argv) => write!(f, "{}", argv.join(" ")),
            CommandData::Compile { argv, flavor } => {
                write!(f, "[{}] -> {}", flavor, argv.join(" "))
            }
        }
    }
}

/// A node record as held by the node store.
///
/// Everything outside the store refers to nodes by `NodeId`; an `Entry` is a
/// snapshot handed out by the store's queries.
#[derive(Clone, Debug)]
pub struct Entry {
    pub id: NodeId,
    pub kind: NodeKind,
    pub path: Option<PathBuf>,
    pub folder: Option<NodeId>,
    pub data: Option<CommandData>,
    pub stamp: f64,
    pub dirty: Dirty,
    pub generated: bool,
}

impl Entry {
    pub fn is_command(&self) -> bool {
        self.kind.is_command()
    }

    pub fn is_artifact(&self) -> bool {
        self.kind.is_artifact()
    }

    /// Human-readable rendering, used in error reports and the graph dump.
    pub fn format(&self) -> String {
        match (&self.data, &self.path) {
            (Some(data), _) => format!("{}", data),
            (None, Some(path)) => format!("{}", path.display()),
            (None, None) => format!("<node {}>", self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_round_trip() {
        let kinds = [
            NodeKind::Source,
            NodeKind::Output,
            NodeKind::Mkdir,
            NodeKind::Group,
            NodeKind::Command,
            NodeKind::Cxx,
            NodeKind::Copy,
            NodeKind::Symlink,
            NodeKind::CopyArtifact,
        ];

        for &kind in &kinds {
            assert_eq!(NodeKind::from_tag(kind.tag()).unwrap(), kind);
        }

        assert!(NodeKind::from_tag("bogus").is_err());
    }

    #[test]
    fn test_categories() {
        assert!(NodeKind::Command.is_command());
        assert!(NodeKind::Cxx.is_command());
        assert!(NodeKind::Copy.is_command());
        assert!(NodeKind::Symlink.is_command());
        assert!(!NodeKind::Source.is_command());
        assert!(!NodeKind::Group.is_command());

        assert!(NodeKind::Source.is_artifact());
        assert!(NodeKind::Output.is_artifact());
        assert!(NodeKind::Mkdir.is_artifact());
        assert!(NodeKind::CopyArtifact.is_artifact());
        assert!(!NodeKind::Cxx.is_artifact());

        // Groups are neither.
        assert!(!NodeKind::Group.is_command());
        assert!(!NodeKind::Group.is_artifact());
    }

    #[test]
    fn test_payload_blob_is_canonical() {
        let a = CommandData::Compile {
            argv: vec!["gcc".into(), "-c".into(), "foo.c".into()],
            flavor: "gcc".into(),
        };

        let blob = a.to_blob().unwrap();
        let b = CommandData::from_blob(&blob).unwrap();

        assert_eq!(a, b);
        assert_eq!(blob, b.to_blob().unwrap());
    }

    #[test]
    fn test_display() {
        let cmd = CommandData::Argv(vec!["cp".into(), "a".into(), "b".into()]);
        assert_eq!(format!("{}", cmd), "cp a b");

        let cxx = CommandData::Compile {
            argv: vec!["gcc".into(), "-c".into(), "a.c".into()],
            flavor: "gcc".into(),
        };
        assert_eq!(format!("{}", cxx), "[gcc] -> gcc -c a.c");
    }
}

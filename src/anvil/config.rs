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

//! On-disk layout of the engine's state, and the `vars` record the front-end
//! writes at generate time.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{Error, ResultExt};

/// Directory under the build root holding the graph database and vars.
pub const CACHE_DIR: &str = ".anvil";

/// The graph database file inside `CACHE_DIR`.
pub const GRAPH_FILE: &str = "graph";

/// The vars record inside `CACHE_DIR`.
pub const VARS_FILE: &str = "vars";

pub fn cache_dir(build_path: &Path) -> PathBuf {
    build_path.join(CACHE_DIR)
}

/// Paths recorded at generate time. The front-end writes this; the engine
/// and the bootstrap wrapper read it back.
#[derive(Serialize, Deserialize, Clone, Eq, PartialEq, Debug)]
pub struct Vars {
    pub source_path: PathBuf,
    pub build_path: PathBuf,
}

impl Vars {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Vars, Error> {
        let f = fs::File::open(path.as_ref()).with_context(|_| {
            format!("failed opening vars file {:?}", path.as_ref())
        })?;

        Vars::from_reader(io::BufReader::new(f))
    }

    pub fn from_reader<R: io::Read>(mut reader: R) -> Result<Vars, Error> {
        let version: String = bincode::deserialize_from(&mut reader)?;

        if version != env!("CARGO_PKG_VERSION") {
            return Err(failure::format_err!(
                "vars were written by version {}; regenerate the build",
                version
            ));
        }

        Ok(bincode::deserialize_from(reader)?)
    }

    pub fn write_to<W: io::Write>(&self, mut writer: W) -> Result<(), Error> {
        bincode::serialize_into(&mut writer, env!("CARGO_PKG_VERSION"))?;
        bincode::serialize_into(writer, self)?;
        Ok(())
    }

    /// Atomically replaces the vars file using a temporary file.
    pub fn write_to_path<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        let dir = path.parent().unwrap_or_else(|| Path::new("."));

        let mut tempfile = NamedTempFile::new_in(dir)?;
        self.write_to(io::BufWriter::new(&mut tempfile))?;
        tempfile.persist(path)?;

        Ok(())
    }
}

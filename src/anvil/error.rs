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

use failure::Fail;

pub use failure::{Error, ResultExt};

/// Fatal engine errors. Everything else trickles through `failure::Error`
/// with context attached along the way.
///
/// Command failures and worker crashes are *not* errors: they are terminal
/// build states reported through `BuildStatus`.
#[derive(Fail, Debug)]
pub enum EngineError {
    /// A command's declaration changed while the front-end asked for a
    /// conservative check that nothing did.
    Refactoring { old: String, new: String },

    /// A structural invariant of the graph was violated: duplicate path,
    /// cycle, folder still in use at drop time. Indicates a front-end bug.
    Invariant(String),

    /// A `Cxx` task named a compiler flavor the worker cannot parse output
    /// for.
    UnknownCompiler(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Refactoring { old, new } => write!(
                f,
                "refactoring error: command changed\n  old: {}\n  new: {}",
                old, new
            ),
            EngineError::Invariant(msg) => {
                write!(f, "graph invariant violated: {}", msg)
            }
            EngineError::UnknownCompiler(flavor) => {
                write!(f, "unknown compiler type {:?}", flavor)
            }
        }
    }
}

/// Renders an error with its chain of causes, one per line.
pub fn display_causes(err: &Error) -> String {
    let mut s = String::new();

    for (i, cause) in err.iter_chain().enumerate() {
        if i == 0 {
            s.push_str(&format!("{}", cause));
        } else {
            s.push_str(&format!("\n  caused by: {}", cause));
        }
    }

    s
}

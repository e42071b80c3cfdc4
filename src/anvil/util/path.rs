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

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

pub trait PathExt {
    /// Returns a normalized path. This does not touch the file system at all.
    fn normalize(&self) -> PathBuf;

    /// Returns a path relative to the given base path.
    fn relative_from(&self, base: &Path) -> Option<PathBuf>;
}

impl PathExt for Path {
    fn normalize(&self) -> PathBuf {
        // Resolve `.` and `..` against a component stack. A `..` at the root
        // stays at the root; a `..` with nothing above it is preserved.
        let mut stack: Vec<Component<'_>> = Vec::new();

        for comp in self.components() {
            match comp {
                Component::CurDir => {}
                Component::ParentDir => match stack.last() {
                    Some(Component::Normal(_)) => {
                        stack.pop();
                    }
                    Some(Component::RootDir)
                    | Some(Component::Prefix(_)) => {}
                    _ => stack.push(Component::ParentDir),
                },
                comp => stack.push(comp),
            }
        }

        if stack.is_empty() {
            return PathBuf::from(".");
        }

        stack.iter().map(|comp| comp.as_os_str()).collect()
    }

    fn relative_from(&self, base: &Path) -> Option<PathBuf> {
        if self.is_absolute() != base.is_absolute() {
            // A mixed pair only makes sense one way around: an absolute path
            // is its own answer, a relative one is unanswerable.
            return if self.is_absolute() {
                Some(self.to_path_buf())
            } else {
                None
            };
        }

        let target: Vec<Component<'_>> = self.components().collect();
        let base: Vec<Component<'_>> = base.components().collect();

        let shared = target
            .iter()
            .zip(base.iter())
            .take_while(|(a, b)| a == b)
            .count();

        // Whatever remains of the base has to be climbed back out of. A `..`
        // left in it cannot be inverted without consulting the file system.
        let mut rel = PathBuf::new();

        for comp in &base[shared..] {
            match comp {
                Component::CurDir => {}
                Component::ParentDir => return None,
                _ => rel.push(".."),
            }
        }

        for comp in &target[shared..] {
            rel.push(comp.as_os_str());
        }

        Some(rel)
    }
}

/// Samples the modification time of a file as seconds since the epoch.
///
/// The node store records stamps in this representation; comparisons against
/// stored stamps are exact.
pub fn mtime<P: AsRef<Path>>(path: P) -> io::Result<f64> {
    let modified = fs::metadata(path.as_ref())?.modified()?;

    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?
        .as_secs_f64())
}

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

//! Parsing of GCC's header-trace output.
//!
//! With `-H`, GCC writes each visited header to stderr as a line of dots
//! (one per include depth) followed by the path, and may append a "multiple
//! include guards" report at the end. Both are noise to the user but gold to
//! the engine: the dotted lines are the compile's discovered inputs.

use std::collections::HashSet;
use std::path::PathBuf;

use nom::bytes::complete::take_while1;
use nom::character::complete::char;
use nom::IResult;

static GUARD_MARKER: &str = "Multiple include guards may be useful for:";

/// One header-trace line: dots for the include depth, a space, the path.
fn dep_line(input: &str) -> IResult<&str, &str> {
    let (rest, _depth) = take_while1(|c| c == '.')(input)?;
    let (rest, _) = char(' ')(rest)?;

    Ok(("", rest.trim()))
}

/// Splits a compile's stderr into real diagnostics and discovered include
/// paths.
///
/// Returns the cleaned stderr (trace lines and the include-guard report
/// removed) and the list of unique include paths in first-seen order.
pub fn parse_deps(stderr: &str) -> (String, Vec<PathBuf>) {
    let mut cleaned = String::new();
    let mut deps = Vec::new();
    let mut seen = HashSet::new();
    let mut in_guard_list = false;

    for line in stderr.lines() {
        if in_guard_list {
            let trimmed = line.trim();

            // The guard report is a run of bare paths; the first line that
            // isn't one ends it.
            if !trimmed.is_empty() && !trimmed.contains(' ') {
                continue;
            }

            in_guard_list = false;
        }

        if line.starts_with(GUARD_MARKER) {
            in_guard_list = true;
            continue;
        }

        if let Ok((_, path)) = dep_line(line) {
            if !path.is_empty() && seen.insert(path.to_string()) {
                deps.push(PathBuf::from(path));
            }

            continue;
        }

        cleaned.push_str(line);
        cleaned.push('\n');
    }

    (cleaned, deps)
}

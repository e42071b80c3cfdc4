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

mod opts;

use std::fs;
use std::io;
use std::process::exit;

use structopt::StructOpt;

use anvil::error::display_causes;
use anvil::Build;

use crate::opts::Opts;

fn main() {
    pretty_env_logger::init();
    exit(run(Opts::from_args()))
}

fn run(opts: Opts) -> i32 {
    let build_path = match fs::canonicalize(&opts.build_path) {
        Ok(path) => path,
        Err(err) => {
            eprintln!(
                "error: invalid build path {:?}: {}",
                opts.build_path, err
            );
            return 1;
        }
    };

    let build = Build::new(&build_path);

    if opts.graph {
        return match build.dump_graph(&mut io::stdout()) {
            Ok(()) => 0,
            Err(err) => {
                eprintln!("error: {}", display_causes(&err));
                1
            }
        };
    }

    match build.run(opts.jobs) {
        Ok(status) if status.is_ok() => 0,
        Ok(status) => {
            eprintln!("build {}", status);
            1
        }
        Err(err) => {
            eprintln!("error: {}", display_causes(&err));
            1
        }
    }
}

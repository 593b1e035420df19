// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use clap::Parser;
use collcheck::report::Report;
use collcheck::{analyzer, trace};

/// Offline analyzer for collcheck traces.
///
/// Reads one trace file per rank from the given directory, aligns the
/// per-rank call sequences, and reports the first cross-rank divergence
/// per communicator. Exit code 0 means no divergence, 1 means a
/// divergence was found, 2 means one or more traces were missing or
/// corrupt (remaining ranks are still analyzed).
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory containing one trace file per rank
    trace_dir: std::path::PathBuf,

    /// Emit the machine-readable JSON report instead of text
    #[arg(long)]
    json: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

fn main() {
    let args = Args::parse();
    collcheck::install_logger(&args.log_level);

    let (traces, errors) = match trace::load_dir(&args.trace_dir) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("collcheck: cannot read {}: {}", args.trace_dir.display(), e);
            std::process::exit(2);
        }
    };

    let analysis = analyzer::analyze(&traces);
    let report = Report::new(&analysis, &errors);
    if args.json {
        println!("{}", report.to_json());
    } else {
        print!("{}", report);
    }
    std::process::exit(report.exit_code());
}

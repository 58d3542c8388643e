// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)

use st_bench::{run_sweep, small_topk_cases, SweepScope};
use st_rank::platform::executor_for_device;
use st_rank::telemetry::{init_tracing, shutdown_tracing};
use std::env;

fn main() {
    let mut json = false;
    let mut scope = SweepScope::Quick;
    let mut iterations = 10usize;
    let mut only_k: Option<usize> = None;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--json" => json = true,
            "--full" => scope = SweepScope::Full,
            "--iters" => {
                let Some(value) = args.next().and_then(|v| v.parse::<usize>().ok()) else {
                    eprintln!("topk_bench: --iters requires a positive integer");
                    std::process::exit(2);
                };
                iterations = value.max(1);
            }
            "--k" => {
                let Some(value) = args.next().and_then(|v| v.parse::<usize>().ok()) else {
                    eprintln!("topk_bench: --k requires an integer");
                    std::process::exit(2);
                };
                only_k = Some(value);
            }
            "--help" | "-h" => {
                print_help();
                return;
            }
            other => {
                eprintln!("topk_bench: unknown argument '{other}'");
                print_help();
                std::process::exit(2);
            }
        }
    }

    init_tracing();

    let mut cases = small_topk_cases(scope);
    if let Some(k) = only_k {
        cases.retain(|case| case.k == k);
        if cases.is_empty() {
            eprintln!("topk_bench: k={k} is not one of the small-k sizes");
            std::process::exit(2);
        }
    }

    let device = executor_for_device(0).unwrap_or_else(|err| {
        eprintln!("topk_bench: {err}");
        std::process::exit(1);
    });
    let report = run_sweep(&device, &cases, iterations).unwrap_or_else(|err| {
        eprintln!("topk_bench: {err}");
        std::process::exit(1);
    });

    if json {
        match report.to_json() {
            Ok(doc) => println!("{doc}"),
            Err(err) => {
                eprintln!("topk_bench: failed to encode report: {err}");
                std::process::exit(1);
            }
        }
    } else {
        print!("{}", report.render_table());
    }

    shutdown_tracing();
}

fn print_help() {
    println!(
        "Usage: topk_bench [--json] [--full] [--iters N] [--k K]\n\n\
         Times batched small-k top-k launches on device 0.\n\n\
         Options:\n  \
           --json      Print the report as JSON\n  \
           --full      Sweep batch sizes 1..1024 and rows 16Ki..1024Ki\n  \
           --iters N   Timed launches per case (default 10)\n  \
           --k K       Only run cases with this k\n  \
           -h, --help  Show this help message"
    );
}

//! Storm runner CLI.
//!
//! Runs one or every allocation storm against a fresh heap and prints a
//! JSON metrics report, one object per storm, suitable for diffing
//! across allocator changes.

use clap::Parser;
use stratheap_harness::{StormKind, StormMetrics, StormRunner};

#[derive(Parser, Debug)]
#[command(name = "storm", about = "stratheap allocation storm harness")]
struct Args {
    /// Storm to run; omit to run all of them.
    #[arg(long, value_enum)]
    storm: Option<StormKind>,

    /// Operations per storm.
    #[arg(long, default_value_t = 200_000)]
    ops: usize,

    /// PRNG seed for reproducible runs.
    #[arg(long, default_value_t = 0x5EED)]
    seed: u64,

    /// Emit one pretty-printed report instead of JSON lines.
    #[arg(long)]
    pretty: bool,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let storms: Vec<StormKind> = match args.storm {
        Some(storm) => vec![storm],
        None => StormKind::all().to_vec(),
    };

    let mut reports: Vec<StormMetrics> = Vec::new();
    for storm in storms {
        log::info!("running {} for {} ops", storm.as_str(), args.ops);
        let metrics = StormRunner::new(args.seed).run(storm, args.ops);
        if !metrics.integrity_ok {
            log::error!("{}: integrity walk failed", metrics.storm);
        }
        reports.push(metrics);
    }

    if args.pretty {
        println!(
            "{}",
            serde_json::to_string_pretty(&reports).expect("reports serialize")
        );
    } else {
        for report in &reports {
            println!(
                "{}",
                serde_json::to_string(report).expect("report serializes")
            );
        }
    }

    if reports.iter().any(|r| !r.integrity_ok || r.leaked_reserved > 0) {
        std::process::exit(1);
    }
}

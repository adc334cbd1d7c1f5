use clap::Parser;
use std::path::PathBuf;
use std::process;

use darknet_convert::convert::{self, Config};
use darknet_convert::logger;

/// Convert pre-trained Darknet YOLOv3 weights
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Input weights file
    input: PathBuf,

    /// Output checkpoint file
    output: PathBuf,

    /// Num classes
    classes: usize,

    /// Input resolution for the inference smoke test
    #[arg(long, default_value_t = 320)]
    size: usize,

    /// Debug mode
    #[arg(short = 'd', long)]
    debug: bool,
}

fn main() {
    let cli = Cli::parse();

    if let Err(err) = logger::init_log(cli.debug) {
        eprintln!("failed to initialize logging: {err}");
        process::exit(1);
    }

    let config = Config {
        input: cli.input,
        output: cli.output,
        classes: cli.classes,
        size: cli.size,
    };

    if let Err(err) = convert::run(&config) {
        log::error!("conversion failed: {err}");
        process::exit(1);
    }
}

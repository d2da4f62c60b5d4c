use clap::Parser;

use elfweave::cli::{run, Cli};

fn main() {
    let cli = Cli::parse();
    elfweave::logger::init(cli.verbose);
    if let Err(err) = run(cli) {
        eprintln!("elfweave: {:#}", err);
        std::process::exit(1);
    }
}

use clap::Parser;
use rcu_emu::cli::{self, Cli};

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    std::process::exit(cli::run(cli));
}

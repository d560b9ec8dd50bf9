mod cli;

use colored::Colorize;
use etf_optimizer::ErrorHelp;

fn main() {
    if let Err(e) = cli::run() {
        eprintln!("{} {}", "error:".red().bold(), e);
        if let Some(help) = e.help() {
            eprintln!("{} {}", "help:".yellow().bold(), help);
        }
        std::process::exit(1);
    }
}

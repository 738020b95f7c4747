//! Spocker is a lightweight container runtime: it runs a single process in
//! a sandboxed environment combining cgroup resource limits, namespace
//! isolation, a rooted filesystem view and a per-container network. It
//! requires root privileges.

mod commands;
mod observability;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "A minimal Linux container runtime")]
struct Opts {
    #[command(flatten)]
    global: GlobalOpts,
    #[command(subcommand)]
    subcmd: SubCommand,
}

#[derive(Args, Debug)]
struct GlobalOpts {
    /// change log level to debug
    #[arg(long)]
    debug: bool,
    /// write the log to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// log format: "text" (default) or "json"
    #[arg(long)]
    log_format: Option<String>,
}

#[derive(Subcommand, Debug)]
enum SubCommand {
    /// Run a command inside a fresh container
    Run(commands::run::Run),
}

fn main() {
    let opts = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(err) => {
            // clap renders its own diagnostics, including --help/--version.
            let _ = err.print();
            std::process::exit(if err.use_stderr() { 1 } else { 0 });
        }
    };

    if let Err(err) = observability::init(&opts.global) {
        eprintln!("spocker: failed to initialize logging: {err:#}");
        std::process::exit(1);
    }

    let exit_code = match opts.subcmd {
        SubCommand::Run(args) => commands::run::run(args),
    };
    std::process::exit(exit_code);
}

//! `weftd` – HTTP runner daemon for the weft runtime.

use clap::Parser;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::ExitCode;

use weft::daemon::RunnerService;
use weft::loader::Environ;

#[derive(Parser)]
#[command(name = "weftd")]
#[command(about = "HTTP runner daemon: start and stop dataflow operator instances", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:5149")]
    listen: String,

    /// Library root searched before WEFT_LIB paths
    #[arg(short, long, default_value = ".")]
    root: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let listener = match TcpListener::bind(&cli.listen) {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("cannot listen on {}: {err}", cli.listen);
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(address = %cli.listen, "runner daemon listening");

    let service = RunnerService::new(Environ::new(cli.root));
    if let Err(err) = service.serve(listener) {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

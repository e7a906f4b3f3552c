//! `weft-cli` – build, check, and run operator definitions.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use weft::loader::Environ;
use weft::runtime::typedef::Generics;
use weft::runtime::value::{Properties, Value};

#[derive(Parser)]
#[command(name = "weft-cli")]
#[command(about = "Typed dataflow runtime", long_about = None)]
struct Cli {
    /// Working directory searched first for definitions
    #[arg(short, long, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse, validate, and build a definition without running it
    Check {
        /// Definition file
        file: PathBuf,

        /// Generic bindings as JSON, e.g. '{"t": {"type": "number"}}'
        #[arg(long, default_value = "{}")]
        gens: String,

        /// Property values as JSON, e.g. '{"n": 3}'
        #[arg(long, default_value = "{}")]
        props: String,
    },

    /// Build a definition, run it on one input, and print the output
    Run {
        /// Definition file
        file: PathBuf,

        /// Generic bindings as JSON
        #[arg(long, default_value = "{}")]
        gens: String,

        /// Property values as JSON
        #[arg(long, default_value = "{}")]
        props: String,

        /// Value pushed into the main input, as JSON
        #[arg(long, default_value = "null")]
        push: String,
    },
}

fn parse_generics(text: &str) -> Result<Generics, String> {
    serde_json::from_str(text).map_err(|err| format!("invalid generics: {err}"))
}

fn parse_properties(text: &str) -> Result<Properties, String> {
    serde_json::from_str(text).map_err(|err| format!("invalid properties: {err}"))
}

fn execute(cli: Cli) -> Result<(), String> {
    let environ = Environ::new(cli.root);

    match cli.command {
        Commands::Check { file, gens, props } => {
            let generics = parse_generics(&gens)?;
            let properties = parse_properties(&props)?;
            environ
                .build_and_compile_file(&file, &generics, &properties)
                .map_err(|err| err.to_string())?;
            println!("ok");
            Ok(())
        }

        Commands::Run {
            file,
            gens,
            props,
            push,
        } => {
            let generics = parse_generics(&gens)?;
            let properties = parse_properties(&props)?;
            let input: serde_json::Value =
                serde_json::from_str(&push).map_err(|err| format!("invalid input: {err}"))?;

            let operator = environ
                .build_and_compile_file(&file, &generics, &properties)
                .map_err(|err| err.to_string())?;

            operator.main().output().bufferize();
            operator.start().map_err(|err| err.to_string())?;
            operator.main().input().push(Value::from_json(&input));

            let output = operator.main().output().pull();
            println!("{}", output.to_json());
            operator.stop();
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{message}");
            ExitCode::FAILURE
        }
    }
}

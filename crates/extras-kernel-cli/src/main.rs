use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use extras_kernel_api::{ExtrasFunction, RunRequest, FUNCTION_CONTRACT_VERSION};
use serde::Serialize;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "xk")]
#[command(about = "Extras Kernel CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one invocation of the extras function against a request file.
    Run(RunArgs),
    /// Show only the requirements the resolver would have to satisfy.
    Requirements(RunArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Request document; parsed as YAML for .yaml/.yml files, JSON otherwise.
    #[arg(long)]
    request: PathBuf,

    #[arg(long, default_value_t = false)]
    pretty: bool,
}

#[derive(Debug, Serialize)]
struct CliEnvelope<T>
where
    T: Serialize,
{
    cli_contract_version: &'static str,
    function_contract_version: &'static str,
    data: T,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => {
            let request = load_request(&args.request)?;
            let response = ExtrasFunction::new().run(&request)?;
            print_envelope(&response, args.pretty)
        }
        Command::Requirements(args) => {
            let mut request = load_request(&args.request)?;
            request.extra_resources = None;
            let response = ExtrasFunction::new().run(&request)?;
            print_envelope(&response.requirements, args.pretty)
        }
    }
}

fn load_request(path: &Path) -> Result<RunRequest> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("cannot read request file {}", path.display()))?;
    if matches!(path.extension().and_then(OsStr::to_str), Some("yaml" | "yml")) {
        serde_yaml::from_str(&raw)
            .with_context(|| format!("cannot parse YAML request {}", path.display()))
    } else {
        serde_json::from_str(&raw)
            .with_context(|| format!("cannot parse JSON request {}", path.display()))
    }
}

fn print_envelope<T>(data: &T, pretty: bool) -> Result<()>
where
    T: Serialize,
{
    let envelope = CliEnvelope {
        cli_contract_version: CLI_CONTRACT_VERSION,
        function_contract_version: FUNCTION_CONTRACT_VERSION,
        data,
    };
    let rendered = if pretty {
        serde_json::to_string_pretty(&envelope)?
    } else {
        serde_json::to_string(&envelope)?
    };
    println!("{rendered}");
    Ok(())
}

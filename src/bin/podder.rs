use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use podder::layer::{default_layer_path, Layer};
use podder::{launcher, puller};

#[derive(Parser)]
#[command(about = "Rootless, layered Linux container runtime")]
struct Cli {
    /// Path where the individual layers are stored.
    #[arg(long, global = true)]
    layerpath: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pull a set of layers from a registry.
    Pull { url: String },
    /// Start a layer.
    Start { layer: String },
    /// Execute a command inside a running layer.
    Exec {
        layer: String,
        #[arg(required = true, trailing_var_arg = true)]
        cmd: Vec<String>,
    },
    /// Create a new layer.
    Create {
        layer: String,
        #[arg(long)]
        parent: Option<String>,
    },
}

fn run(cli: Cli) -> podder::Result<()> {
    let layerpath = cli.layerpath.unwrap_or_else(default_layer_path);

    match cli.command {
        Command::Pull { url } => {
            let url = if url.contains('/') {
                url
            } else {
                let lay = Layer::open(&layerpath, &url, None)?;
                match lay.url() {
                    Some(resolved) => {
                        log::info!("resolving {url} to {resolved}");
                        resolved
                    }
                    None => url,
                }
            };
            puller::pull(&url, &layerpath)
        }
        Command::Start { layer } => {
            let lay = Layer::open(&layerpath, &layer, None)?;
            launcher::start(&lay)
        }
        Command::Exec { layer, cmd } => {
            let lay = Layer::open(&layerpath, &layer, None)?;
            launcher::exec(&lay, cmd)
        }
        Command::Create { layer, parent } => {
            let parent_layer = match parent {
                Some(p) => Some(Layer::open(&layerpath, &p, None)?),
                None => None,
            };
            let lay = Layer::open(&layerpath, &layer, parent_layer)?;
            lay.write()
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("podder: {err}");
            ExitCode::FAILURE
        }
    }
}

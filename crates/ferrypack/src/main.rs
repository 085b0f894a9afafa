use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use env_logger::Env;
use log::{debug, info};
use std::env;
use std::path::PathBuf;

use ferrypack::compiler::Compiler;
use ferrypack::config::{ConfigLoader, Mode, RawConfig};
use ferrypack::dev_server::DevServer;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (can be repeated: -v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Build mode (development or production)
    #[arg(long, global = true)]
    mode: Option<String>,

    /// Ignore user and system configuration files
    #[arg(long, global = true)]
    no_global_config: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bundle the entry point into the output directory
    Build(BuildArgs),
    /// Serve the bundle and static files over HTTP, rebuilding on change
    Serve(ServeArgs),
    /// Print the resolved configuration
    Config,
}

#[derive(Args)]
struct BuildArgs {
    /// Entry point, relative to the current directory
    #[arg(short, long)]
    entry: Option<PathBuf>,

    /// Output directory
    #[arg(short, long)]
    output_path: Option<PathBuf>,

    /// Bundle filename, may contain [name] and [contenthash]
    #[arg(short, long)]
    filename: Option<String>,
}

#[derive(Args)]
struct ServeArgs {
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to listen on
    #[arg(long)]
    host: Option<String>,

    /// Directory served as static content
    #[arg(long = "static")]
    static_content_root: Option<PathBuf>,

    /// Answer unknown routes with the entry document
    #[arg(long)]
    history_api_fallback: bool,
}

impl Cli {
    /// Command line values as the highest precedence configuration layer
    fn overrides(&self) -> anyhow::Result<RawConfig> {
        let mut layer = RawConfig {
            mode: self.mode.as_deref().map(Mode::parse).transpose()?,
            ..RawConfig::default()
        };

        match &self.command {
            Command::Build(args) => {
                layer.entry_point = args.entry.clone();
                layer.output.output_directory = args.output_path.clone();
                layer.output.bundle_filename = args.filename.clone();
            }
            Command::Serve(args) => {
                layer.dev_server.port = args.port;
                layer.dev_server.host = args.host.clone();
                layer.dev_server.static_content_root = args.static_content_root.clone();
                layer.dev_server.history_fallback_enabled =
                    args.history_api_fallback.then_some(true);
            }
            Command::Config => {}
        }
        Ok(layer)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity level
    let log_level = match cli.verbose {
        0 => "warn",  // Default: warnings and errors only
        1 => "info",  // -v: informational messages
        2 => "debug", // -vv: debug messages
        _ => "trace", // -vvv or more: trace messages
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    debug!(
        "Verbosity level: {} (log level: {})",
        cli.verbose, log_level
    );

    let cwd = env::current_dir().context("Failed to determine the current directory")?;
    let mut loader = ConfigLoader::new(cwd)
        .with_global_configs(!cli.no_global_config)
        .with_overrides(cli.overrides()?);
    if let Some(path) = &cli.config {
        loader = loader.with_config_file(path);
    }
    let config = loader.load()?;
    debug!("Configuration: {:?}", config);

    match cli.command {
        Command::Config => {
            print!("{}", config.to_toml()?);
        }
        Command::Build(_) => {
            info!("Building in {} mode", config.mode);
            let compilation = Compiler::new(config)?.run()?;
            info!(
                "Bundle {} created ({} modules, hash {})",
                compilation.bundle_filename,
                compilation.graph.len(),
                &compilation.hash[..20]
            );
        }
        Command::Serve(_) => {
            let server = DevServer::new(Compiler::new(config)?).listen()?;
            server.serve_forever()?;
        }
    }

    Ok(())
}

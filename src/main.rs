use std::{error::Error, net::SocketAddr, process, sync::Arc};

use clap::{command, Parser, Subcommand, ValueHint};
use log::{debug, error, info, warn, LevelFilter};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpListener,
    sync::mpsc,
};
use url::Url;

use tunnelplay::{
    audio::Output,
    cache::ResolutionCache,
    config::Config,
    extractor::{Extract, Extractor},
    player::{self, Player},
    refresh::{self, Refresher, RemoteRefresher},
    server, signal,
    store::Library,
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when not built release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Fallback variable for the extraction service, as used by existing
/// deployments.
const LEGACY_EXTRACTION_URL_ENV: &str = "COBALT_API_URL";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    ///
    /// TOML file with settings for all subcommands. Command line arguments
    /// and environment variables take precedence.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    config: Option<String>,

    /// Extraction service URL
    ///
    /// Falls back to `COBALT_API_URL` when not set.
    #[arg(long, value_name = "URL", value_hint = ValueHint::Url, env = "TUNNELPLAY_EXTRACTION_URL")]
    extraction_url: Option<Url>,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Serve the refresh endpoint for a track library
    ///
    /// Send SIGHUP to reload the library after editing it.
    Serve {
        /// Address to listen on
        #[arg(short, long, value_name = "ADDR")]
        listen: Option<SocketAddr>,

        /// Track library file
        #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath)]
        library: Option<String>,
    },

    /// Play tracks, reading commands from standard input
    ///
    /// Commands: `play <id>`, `toggle <id>`, `pause`, `seek <id> <ratio>`,
    /// `volume <ratio>`, `stop` and `quit`.
    Play {
        /// Refresh endpoint to resolve tracks with
        #[arg(long, value_name = "URL", value_hint = ValueHint::Url, env = "TUNNELPLAY_REFRESH_URL")]
        refresh_url: Option<Url>,

        /// Audio output device
        ///
        /// [default: system default device]
        #[arg(short, long, value_name = "NAME")]
        device: Option<String>,

        /// List audio output devices and exit
        #[arg(long, default_value_t = false)]
        list_devices: bool,
    },

    /// Resolve a source link once and print the result
    Resolve {
        /// Link on the hosting platform
        #[arg(value_hint = ValueHint::Url)]
        source_url: Url,
    },

    /// Resolve a source link and add it to the track library
    Import {
        /// Link on the hosting platform
        #[arg(value_hint = ValueHint::Url)]
        source_url: Url,

        /// Track library file
        #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath)]
        library: Option<String>,
    },
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(args: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if args.quiet || args.verbose > 0 {
        let level = match args.verbose {
            // Quiet and verbose are mutually exclusive, and `verbose` is 0
            // by default. So this arm means: quiet mode.
            0 => LevelFilter::Warn,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module("tunnelplay", level);
    }

    logger.init();
}

/// Builds the configuration from the configuration file, environment and
/// the global command line arguments.
fn load_config(args: &Args) -> Result<Config, Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    if let Some(url) = &args.extraction_url {
        config.extraction_url = url.clone();
    } else if let Ok(url) = std::env::var(LEGACY_EXTRACTION_URL_ENV) {
        match Url::parse(&url) {
            Ok(url) => config.extraction_url = url,
            Err(e) => warn!("ignoring invalid {LEGACY_EXTRACTION_URL_ENV}: {e}"),
        }
    }

    Ok(config)
}

/// Serves the refresh endpoint until a shutdown signal arrives.
async fn serve(config: &Config) -> Result<(), Box<dyn Error>> {
    let library = Arc::new(Library::open(&config.library).await?);
    info!(
        "serving {} tracks from {}",
        library.len().await,
        config.library
    );

    let extractor = Arc::new(Extractor::new(config)?);
    let refresher = Arc::new(Refresher::new(extractor, library.clone()));
    let listener = TcpListener::bind(config.listen).await?;

    let signals = signal::Handler::new()?;
    let shutdown = async move {
        signals
            .shutdown(|| {
                let library = Arc::clone(&library);
                async move {
                    if let Err(e) = library.reload().await {
                        error!("failed to reload library: {e}");
                    }
                }
            })
            .await;
    };

    server::serve(listener, refresher, shutdown).await?;
    Ok(())
}

/// Plays tracks as commanded on standard input until it closes or a
/// shutdown signal arrives.
async fn play(config: &Config, device: Option<&str>) -> Result<(), Box<dyn Error>> {
    let refresher = Arc::new(RemoteRefresher::new(config)?);
    info!("resolving tracks through {}", config.refresh_url);

    let (pipeline_tx, pipeline_rx) = mpsc::unbounded_channel();
    let output = Output::open(config, device, pipeline_tx)?;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut player = Player::new(output, refresher).with_events(event_tx);

    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            debug!("event: {event:?}");
        }
    });

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if matches!(line, "quit" | "exit") {
                break;
            }

            match line.parse::<player::Command>() {
                Ok(command) => {
                    if command_tx.send(command).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("{e}"),
            }
        }
    });

    let signals = signal::Handler::new()?;
    tokio::select! {
        result = player.run(command_rx, pipeline_rx) => result?,
        _ = signals.shutdown(|| async {}) => player.stop(),
    }

    Ok(())
}

/// Resolves `source_url` once and prints what the extraction service said.
async fn resolve(config: &Config, source_url: &Url) -> Result<(), Box<dyn Error>> {
    let extractor = Extractor::new(config)?;
    let extracted = extractor.resolve(source_url).await?;

    let now = OffsetDateTime::now_utc();
    println!("url:      {}", extracted.url);
    println!("title:    {}", extracted.title_or_default());
    println!("artist:   {}", extracted.artist_or_default());
    if let Some(artwork) = &extracted.artwork {
        println!("artwork:  {artwork}");
    }
    if let Some(duration) = extracted.duration {
        println!("duration: {duration}s");
    }
    println!("resolved: {}", now.format(&Rfc3339)?);
    println!(
        "cache to: {}",
        (now + ResolutionCache::TTL).format(&Rfc3339)?
    );

    Ok(())
}

/// Imports `source_url` as a new track and prints its identifier.
async fn import(config: &Config, source_url: Url) -> Result<(), Box<dyn Error>> {
    let library = Library::open(&config.library).await?;
    let extractor = Extractor::new(config)?;

    let track = refresh::import(&extractor, &library, source_url).await?;
    info!("imported {track}");
    println!("{}", track.id);

    Ok(())
}

/// Runs the subcommand.
///
/// # Errors
///
/// This function returns an error when the subcommand fails. This could be
/// due to invalid configuration, an unreachable service, or a missing audio
/// device.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let mut config = load_config(&args)?;
    debug!("extraction service at {}", config.extraction_url);

    match args.command {
        Command::Serve { listen, library } => {
            if let Some(listen) = listen {
                config.listen = listen;
            }
            if let Some(library) = library {
                config.library = library;
            }
            serve(&config).await
        }

        Command::Play {
            refresh_url,
            device,
            list_devices,
        } => {
            if list_devices {
                for name in Output::devices()? {
                    println!("{name}");
                }
                return Ok(());
            }

            if let Some(url) = refresh_url {
                config.refresh_url = url;
            }
            play(&config, device.as_deref()).await
        }

        Command::Resolve { source_url } => resolve(&config, &source_url).await,

        Command::Import {
            source_url,
            library,
        } => {
            if let Some(library) = library {
                config.library = library;
            }
            import(&config, source_url).await
        }
    }
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and runs the subcommand.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}

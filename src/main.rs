#[macro_use]
extern crate tracing;

use std::cell::RefCell;
use std::env;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{anyhow, Context};
use calloop::signals::{Signal, Signals};
use clap::Parser;
use directories::ProjectDirs;
use scanout::backend::tty::{PatternOptions, TtyMode};
use scanout::backend::Tty;
use scanout::cli::{Cli, RunArgs, Sub};
use scanout::state::State;
use scanout_config::{default_config_path, Config};
use smithay::reexports::calloop::timer::{TimeoutAction, Timer};
use smithay::reexports::calloop::EventLoop;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "scanout=debug,scanout_config=debug";

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let directives = env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_owned());
    let env_filter = EnvFilter::builder().parse_lossy(directives);
    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(env_filter)
        .init();

    #[cfg(feature = "profile-with-tracy-ondemand")]
    let _client = tracy_client::Client::start();

    let config_path = cli.config.or_else(|| {
        let dirs = ProjectDirs::from("", "", "scanout");
        default_config_path(dirs.map(|dirs| dirs.config_dir().to_owned()))
    });

    match cli.subcommand.unwrap_or(Sub::Run(RunArgs::default())) {
        Sub::Validate => {
            let path = config_path.context("error getting the config path")?;
            load_config(&path)?;
            info!("config is valid");
            Ok(())
        }
        Sub::Outputs { json } => list_outputs(config_path, json),
        Sub::Run(args) => run(config_path, args),
    }
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    // miette reports render their source snippet through Debug.
    Config::load(path).map_err(|err| anyhow!("{err:?}"))
}

fn load_or_default(path: Option<&Path>) -> Config {
    let Some(path) = path else {
        return Config::default();
    };
    match load_config(path) {
        Ok(config) => config,
        Err(err) => {
            warn!("{err:?}");
            warn!("using the default config");
            Config::default()
        }
    }
}

fn list_outputs(config_path: Option<PathBuf>, json: bool) -> anyhow::Result<()> {
    let config = Rc::new(RefCell::new(load_or_default(config_path.as_deref())));

    let event_loop = EventLoop::<State>::try_new().context("error creating the event loop")?;
    let mut tty = Tty::new(config, event_loop.handle(), TtyMode::Probe)?;
    tty.init();

    let outputs = tty.outputs();
    if json {
        let text = serde_json::to_string_pretty(&outputs).context("error serializing outputs")?;
        println!("{text}");
    } else if outputs.is_empty() {
        println!("No outputs connected.");
    } else {
        for output in &outputs {
            println!("{}", output.format());
        }
    }

    tty.shutdown();
    Ok(())
}

fn run(config_path: Option<PathBuf>, args: RunArgs) -> anyhow::Result<()> {
    let config = Rc::new(RefCell::new(load_or_default(config_path.as_deref())));

    let mut event_loop =
        EventLoop::<State>::try_new().context("error creating the event loop")?;
    let handle = event_loop.handle();

    let options = PatternOptions {
        cursor: args.cursor,
        gamma: args.gamma,
    };
    let tty = Tty::new(config, handle.clone(), TtyMode::Drive(options))?;
    info!("using seat {}", tty.seat_name());

    let mut state = State::new(tty, event_loop.get_signal(), config_path);
    state.tty.init();

    let signals = Signals::new(&[Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP])
        .context("error setting up signal handling")?;
    handle
        .insert_source(signals, |event, _, state| match event.signal() {
            Signal::SIGHUP => state.reload_config(),
            signal => {
                info!("got {signal:?}, quitting");
                state.stop();
            }
        })
        .unwrap();

    if let Some(period) = args.dpms_cycle {
        handle
            .insert_source(Timer::from_duration(period), move |_, _, state| {
                state.toggle_monitors();
                TimeoutAction::ToDuration(period)
            })
            .unwrap();
    }

    event_loop
        .run(None, &mut state, |_| {})
        .context("error running the event loop")?;

    state.tty.shutdown();
    Ok(())
}

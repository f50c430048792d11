//! emuscript CLI
//!
//! `run` drives Lua scripts against a flat reference memory for a fixed number
//! of frames; `types` lists what scripts may call.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use emuscript_core::api::{ClassMetadata, ScriptApi};
use emuscript_core::bridge::BridgeLimits;
use emuscript_core::config::BridgeConfig;
use emuscript_core::controller::{
    AnalogAxis, ControllerApi, ControllerState, PORT_COUNT, shared_overrides,
};
use emuscript_core::logging::{LogFormat, LogLevel, init_logging};
use emuscript_core::memory::{FlatMemory, shared_memory};
use emuscript_core::memory_api::MemoryApi;
use emuscript_core::queue::PendingSessionQueue;
use emuscript_core::runner::ScriptRunner;
use emuscript_core::session::SessionId;
use emuscript_core::value::VALID_TYPE_NAMES;
use emuscript_lua::LuaLoader;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long the runner waits for the loader thread before giving up.
const LOAD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "emuscript")]
#[command(author, version, about = "Run scripts against an emulated machine")]
struct Cli {
    /// Log level filter (overrides the config file; RUST_LOG wins over both)
    #[arg(long, global = true, env = "EMUSCRIPT_LOG_LEVEL")]
    log_level: Option<LogLevel>,

    /// Log format: pretty or json
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load scripts and run them for a number of frames
    Run {
        /// Path to a TOML config file
        #[arg(long, short = 'c', env = "EMUSCRIPT_CONFIG")]
        config: Option<PathBuf>,

        /// Number of frames to emulate
        #[arg(long, short = 'n', default_value_t = 60)]
        frames: u64,

        /// Print each port's controller input after overrides every frame
        #[arg(long)]
        show_inputs: bool,

        /// Emit the run summary as JSON on stdout
        #[arg(long)]
        json: bool,

        /// Lua scripts, loaded in order
        #[arg(required = true)]
        scripts: Vec<PathBuf>,
    },

    /// List accepted type names and API functions
    Types {
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            ref config,
            frames,
            show_inputs,
            json,
            ref scripts,
        } => {
            let config = match config {
                Some(path) => BridgeConfig::load(path)
                    .with_context(|| format!("failed to load config {}", path.display()))?,
                None => BridgeConfig::default(),
            };
            init_cli_logging(&cli, &config)?;
            let options = RunOptions {
                frames,
                show_inputs,
                json,
            };
            run(&config, scripts, options)
        }
        Commands::Types { json } => {
            print_types(json)?;
            Ok(())
        }
    }
}

fn init_cli_logging(cli: &Cli, config: &BridgeConfig) -> Result<()> {
    let mut logging = config.logging.clone();
    if let Some(level) = cli.log_level {
        logging.level = level.to_string();
    }
    if let Some(format) = cli.log_format {
        logging.format = format;
    }
    init_logging(&logging).context("failed to initialize logging")
}

#[derive(Debug, Clone, Copy)]
struct RunOptions {
    frames: u64,
    show_inputs: bool,
    json: bool,
}

#[derive(Debug, Serialize)]
struct RunSummary {
    frames: u64,
    sessions: usize,
    active: usize,
    errors: Vec<String>,
}

#[derive(Debug, Serialize)]
struct PortInput {
    frame: u64,
    port: usize,
    buttons: Vec<&'static str>,
    analog: Vec<(&'static str, u8)>,
}

impl PortInput {
    fn new(frame: u64, port: usize, state: &ControllerState) -> Self {
        Self {
            frame,
            port: port + 1,
            buttons: state.buttons.names().collect(),
            analog: AnalogAxis::ALL
                .into_iter()
                .map(|axis| (axis.name(), state.axis(axis)))
                .collect(),
        }
    }
}

impl std::fmt::Display for PortInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame {} port {}:", self.frame, self.port)?;
        if self.buttons.is_empty() {
            f.write_str(" -")?;
        }
        for button in &self.buttons {
            write!(f, " {button}")?;
        }
        for (axis, value) in &self.analog {
            write!(f, " {axis}={value}")?;
        }
        Ok(())
    }
}

fn read_script(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn load_scripts(
    loader: &LuaLoader,
    queue: &PendingSessionQueue,
    scripts: &[PathBuf],
) -> Result<usize> {
    for path in scripts {
        let source = read_script(path)?;
        let name = path.display().to_string();
        let session = loader
            .builder(SessionId::next(), &name, &source)
            .with_context(|| format!("failed to compile {name}"))?
            .print_callback(|_, text| println!("{text}"))
            .build()?;
        queue.push(session)?;
    }
    Ok(scripts.len())
}

fn run(config: &BridgeConfig, scripts: &[PathBuf], options: RunOptions) -> Result<()> {
    let memory = shared_memory(config.memory.build());
    let overrides = shared_overrides();
    let loader = LuaLoader::new(memory, overrides.clone(), config.limits);
    let queue = PendingSessionQueue::new();
    let mut runner = ScriptRunner::new(queue.clone(), config.runner);
    let mut rng = config.controller.rng();

    // Scripts are compiled off the emulation thread.
    let producer = {
        let queue = queue.clone();
        let scripts = scripts.to_vec();
        thread::Builder::new()
            .name("emuscript-loader".to_string())
            .spawn(move || {
                let result = load_scripts(&loader, &queue, &scripts);
                // Closing unblocks the runner even when a script failed.
                queue.close();
                result
            })
            .context("failed to spawn loader thread")?
    };

    loop {
        match runner.wait_for_session(LOAD_TIMEOUT) {
            Ok(true) => {}
            Ok(false) => {
                warn!("timed out waiting for scripts to load");
                break;
            }
            Err(_) => break,
        }
    }
    let loaded = match producer.join() {
        Ok(result) => result,
        Err(_) => bail!("loader thread panicked"),
    };
    let loaded = match loaded {
        Ok(count) => count,
        Err(err) => {
            runner.shutdown_all();
            return Err(err.context("failed to load scripts"));
        }
    };
    info!(scripts = loaded, frames = options.frames, "starting run");

    let mut errors = runner.take_errors();
    let mut frames = 0;
    while frames < options.frames {
        if runner.session_count() == 0 && queue.is_empty() {
            debug!(frame = frames, "no sessions left");
            break;
        }
        frames += 1;
        let report = runner.run_frame();
        errors.extend(report.errors);

        // Callbacks run before the port's input is read; overrides are only
        // locked once they have returned.
        for port in 0..PORT_COUNT {
            runner.controller_polled(port);
            let state = overrides
                .lock()
                .apply(port, ControllerState::neutral(), &mut rng);
            if options.show_inputs {
                let input = PortInput::new(frames, port, &state);
                if options.json {
                    println!("{}", serde_json::to_string(&input)?);
                } else {
                    println!("{input}");
                }
            }
        }
        overrides.lock().end_frame();
        errors.extend(runner.take_errors());
    }

    let summary = RunSummary {
        frames,
        sessions: loaded,
        active: runner.session_count(),
        errors: errors.iter().map(ToString::to_string).collect(),
    };
    runner.shutdown_all();

    if options.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        eprintln!(
            "ran {} frame(s) with {} script(s), {} error(s)",
            summary.frames,
            summary.sessions,
            summary.errors.len()
        );
        for error in &summary.errors {
            eprintln!("  {error}");
        }
    }

    if !summary.errors.is_empty() {
        bail!("{} script error(s)", summary.errors.len());
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct TypeListing {
    types: &'static [&'static str],
    classes: Vec<ClassMetadata>,
}

fn print_types(json: bool) -> Result<()> {
    let apis: [Box<dyn ScriptApi>; 2] = [
        Box::new(MemoryApi::new(
            shared_memory(FlatMemory::mem1()),
            BridgeLimits::default(),
        )),
        Box::new(ControllerApi::new(shared_overrides())),
    ];
    let listing = TypeListing {
        types: VALID_TYPE_NAMES,
        classes: apis.iter().map(|api| api.metadata()).collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    println!("Type names: {}", listing.types.join(", "));
    for class in &listing.classes {
        println!();
        println!("{} (version {})", class.name, class.version);
        for function in &class.functions {
            println!("  {:<52} {}", function.name, function.usage);
        }
    }
    Ok(())
}

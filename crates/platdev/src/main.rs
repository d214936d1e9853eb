use std::env;
use std::fmt;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::{LevelFilter, debug, info};
use serde::{Deserialize, Serialize};

use platdev::container::{ContainerRuntime, RuntimeType};
use platdev::mounts::MountStrategy;
use platdev::project::{FLAG_IGNORE_COMMITS, FLAG_NO_ROUTER, ObjectStatus};
use platdev::reporter::ConsoleReporter;
use platdev::resolver::{DEFAULT_MAX_PASSES, ResolveStrategy};
use platdev::{BatchReport, Orchestrator, OrchestratorSettings, Project};

const APP_NAME: &str = "platdev";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, command: Command) -> Result<()> {
    handle_command(&ctx, command).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
        command => async_main(ctx, command),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Platdev - local multi-service cloud project environments.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Project directory (defaults to the current directory)
    #[arg(short = 'p', long, value_name = "PATH", global = true, env = "PLATDEV_PROJECT")]
    project: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Do not change anything on disk
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Seconds a container gets to shut down gracefully
    #[arg(long = "timeout", value_name = "SECONDS", global = true)]
    timeout: Option<u64>,
    /// Override the degree of parallelism
    #[arg(long = "parallel", value_name = "N", global = true)]
    parallel: Option<usize>,
    /// Emit additional diagnostics for troubleshooting
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the project: every app, worker and service, then the router
    Start,
    /// Start the project and rerun every build hook, ignoring commits
    Build,
    /// Run the deploy hook of every app
    Deploy,
    /// Stop and remove the project's containers
    Stop {
        /// Stop every platdev container on this host, router included
        #[arg(long)]
        all: bool,
    },
    /// Stop the project and delete its volumes
    Purge {
        /// Only delete the volumes of this slot (never slot 1)
        #[arg(long, value_name = "N")]
        slot: Option<u32>,
    },
    /// Show the state of every definition
    Status,
    /// Open an interactive shell in a container
    Shell {
        /// App, worker or service name
        name: String,
        /// Command to run instead of a login shell
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Snapshot a running app so the next start skips its build
    Commit {
        name: String,
    },
    /// Delete the snapshot of a stopped app
    DeleteCommit {
        name: String,
    },
    /// Print the output of a container
    Logs {
        name: String,
        /// Number of lines from the end
        #[arg(long, value_name = "N")]
        tail: Option<u32>,
    },
    /// Manage project variables
    Var {
        #[command(subcommand)]
        command: VarCommand,
    },
    /// Manage volume slots
    Slot {
        #[command(subcommand)]
        command: SlotCommand,
    },
    /// Manage project flags
    Flag {
        #[command(subcommand)]
        command: FlagCommand,
    },
    /// Manage project options
    #[command(name = "option")]
    ProjectOption {
        #[command(subcommand)]
        command: OptionCommand,
    },
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Subcommand)]
enum VarCommand {
    /// List all variables
    List,
    /// Print one variable
    Get { key: String },
    /// Set a variable
    Set { key: String, value: String },
    /// Remove a variable
    Unset { key: String },
}

#[derive(Debug, Subcommand)]
enum SlotCommand {
    /// Show the active slot and the volumes of every slot
    Show,
    /// Switch the active slot (takes effect on the next start)
    Set { slot: u32 },
    /// Replace a slot with a copy of the active slot
    Copy { dest: u32 },
    /// Delete the volumes of a slot
    Purge { slot: u32 },
}

#[derive(Debug, Subcommand)]
enum FlagCommand {
    /// List enabled flags
    List,
    /// Enable a flag
    Set {
        #[arg(value_parser = [FLAG_IGNORE_COMMITS, FLAG_NO_ROUTER])]
        flag: String,
    },
    /// Disable a flag
    Unset { flag: String },
}

#[derive(Debug, Subcommand)]
enum OptionCommand {
    /// List options
    List,
    /// Set an option
    Set { key: String, value: String },
    /// Remove an option
    Unset { key: String },
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone(), common.project.clone())?;
        let config = load_or_init_config(&paths, &common)?;
        Ok(Self {
            common,
            paths,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}={level}")));

        // `log` records from the library are bridged into the registry on init.
        let file_layer = match self.config.logging.file.as_deref() {
            Some(file) => {
                let path = expand_str_path(file)?;
                let target = fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .with_context(|| format!("opening log file {}", path.display()))?;
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(Mutex::new(target))
                        .with_ansi(false),
                )
            }
            None => None,
        };

        let registry = tracing_subscriber::registry().with(env_filter).with(file_layer);
        if self.common.json {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                .try_init()
                .context("initializing logging")?;
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .try_init()
                .context("initializing logging")?;
        }

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Warn),
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn orchestrator(&self) -> Orchestrator {
        let runtime = &self.config.runtime;
        let driver = match (runtime.engine, runtime.binary.as_deref()) {
            (Some(engine), Some(binary)) => ContainerRuntime::with_binary(engine, binary),
            (Some(engine), None) => ContainerRuntime::with_type(engine),
            (None, _) => ContainerRuntime::new(),
        };
        debug!("using {} engine", driver.runtime_type());
        Orchestrator::new(Arc::new(driver), self.settings())
    }

    fn settings(&self) -> OrchestratorSettings {
        let cfg = &self.config;
        OrchestratorSettings {
            stop_timeout: Duration::from_secs(
                self.common.timeout.unwrap_or(cfg.runtime.stop_timeout_secs),
            ),
            open_timeout: cfg.runtime.open_timeout_secs.map(Duration::from_secs),
            parallelism: self
                .common
                .parallel
                .or(cfg.runtime.parallelism)
                .unwrap_or_else(default_parallelism),
            registry: cfg.images.registry.clone(),
            helper_image: cfg.images.helper_image.clone(),
            router_image: cfg.images.router_image.clone(),
            router_enabled: cfg.router.enabled,
            router_port: cfg.router.http_port,
            resolve_strategy: match cfg.resolver.strategy {
                ResolverKind::Graph => ResolveStrategy::Graph,
                ResolverKind::FixedPoint => ResolveStrategy::FixedPoint {
                    max_passes: cfg.resolver.max_passes,
                },
            },
            mount_strategy: cfg.mounts.strategy,
        }
    }

    fn reporter(&self) -> ConsoleReporter {
        ConsoleReporter::new(self.common.quiet || self.common.json || self.common.yaml)
    }

    fn load_project(&self) -> Result<Project> {
        Project::load(&self.paths.project_dir, self.common.dry_run).with_context(|| {
            format!("loading project at {}", self.paths.project_dir.display())
        })
    }

    fn print<T: Serialize + fmt::Debug>(&self, value: &T, plain: impl FnOnce(&T) -> String) -> Result<()> {
        let output = if self.common.json {
            serde_json::to_string_pretty(value).context("serializing output to JSON")?
        } else if self.common.yaml {
            serde_yaml::to_string(value).context("serializing output to YAML")?
        } else {
            plain(value)
        };
        println!("{output}");
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
    project_dir: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>, project: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        let project_dir = match project {
            Some(path) => expand_path(path)?,
            None => env::current_dir().context("determining current directory")?,
        };

        Ok(Self {
            config_file,
            project_dir,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    logging: LoggingConfig,
    runtime: RuntimeConfig,
    images: ImagesConfig,
    resolver: ResolverConfig,
    mounts: MountsConfig,
    router: RouterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    level: String,
    file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct RuntimeConfig {
    /// Container engine: "docker" or "podman" (auto-detected if not set)
    engine: Option<RuntimeType>,
    /// Custom path to the engine binary
    binary: Option<String>,
    parallelism: Option<usize>,
    /// Grace period for in-container shutdown before a forced stop
    stop_timeout_secs: u64,
    /// Host-side limit on the readiness wait; unset waits forever
    open_timeout_secs: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            engine: None,
            binary: None,
            parallelism: None,
            stop_timeout_secs: 10,
            open_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ImagesConfig {
    registry: String,
    helper_image: String,
    router_image: String,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        let defaults = OrchestratorSettings::default();
        Self {
            registry: defaults.registry,
            helper_image: defaults.helper_image,
            router_image: defaults.router_image,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ResolverKind {
    #[default]
    Graph,
    FixedPoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ResolverConfig {
    strategy: ResolverKind,
    /// Pass bound of the fixed_point strategy
    max_passes: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            strategy: ResolverKind::Graph,
            max_passes: DEFAULT_MAX_PASSES,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct MountsConfig {
    strategy: MountStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct RouterConfig {
    enabled: bool,
    http_port: Option<u16>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        let defaults = OrchestratorSettings::default();
        Self {
            enabled: defaults.router_enabled,
            http_port: defaults.router_port,
        }
    }
}

async fn handle_command(ctx: &RuntimeContext, command: Command) -> Result<()> {
    let orchestrator = ctx.orchestrator();
    let reporter = ctx.reporter();

    match command {
        Command::Start => {
            let mut project = ctx.load_project()?;
            orchestrator
                .start(&mut project, &reporter)
                .await
                .context("starting project")?;
            print_relationships(ctx, &project)
        }
        Command::Build => {
            let mut project = ctx.load_project()?;
            orchestrator
                .build(&mut project, &reporter)
                .await
                .context("building project")
        }
        Command::Deploy => {
            let project = ctx.load_project()?;
            orchestrator
                .deploy(&project, &reporter)
                .await
                .context("deploying project")
        }
        Command::Stop { all: true } => {
            let report = orchestrator.stop_all(&reporter).await?;
            finish_batch("stop", report)
        }
        Command::Stop { all: false } => {
            let mut project = ctx.load_project()?;
            let report = orchestrator.stop(&mut project, &reporter).await?;
            finish_batch("stop", report)
        }
        Command::Purge { slot } => {
            let mut project = ctx.load_project()?;
            let report = orchestrator.purge(&mut project, slot, &reporter).await?;
            finish_batch("purge", report)
        }
        Command::Status => {
            let project = ctx.load_project()?;
            let statuses = orchestrator.status(&project).await?;
            ctx.print(&statuses, |statuses| format_statuses(statuses))
        }
        Command::Shell { name, command } => {
            let project = ctx.load_project()?;
            let command: Vec<&str> = if command.is_empty() {
                vec!["bash", "-l"]
            } else {
                command.iter().map(String::as_str).collect()
            };
            let code = orchestrator.shell(&project, &name, &command).await?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Command::Commit { name } => {
            let mut project = ctx.load_project()?;
            orchestrator
                .commit(&mut project, &name, &reporter)
                .await
                .with_context(|| format!("committing {name}"))
        }
        Command::DeleteCommit { name } => {
            let mut project = ctx.load_project()?;
            orchestrator
                .delete_commit(&mut project, &name, &reporter)
                .await
                .with_context(|| format!("deleting commit of {name}"))
        }
        Command::Logs { name, tail } => {
            let project = ctx.load_project()?;
            let output = orchestrator.logs(&project, &name, tail).await?;
            print!("{output}");
            Ok(())
        }
        Command::Var { command } => handle_var(ctx, command),
        Command::Slot { command } => handle_slot(ctx, &orchestrator, &reporter, command).await,
        Command::Flag { command } => handle_flag(ctx, command),
        Command::ProjectOption { command } => handle_option(ctx, command),
        Command::Config { command } => handle_config(ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

fn finish_batch(operation: &str, report: BatchReport) -> Result<()> {
    let completed = report.completed.len();
    let names = report
        .into_result()
        .with_context(|| format!("{operation} did not complete"))?;
    info!("{operation}: {completed} item(s) done");
    for name in names {
        debug!("{operation}: {name}");
    }
    Ok(())
}

fn print_relationships(ctx: &RuntimeContext, project: &Project) -> Result<()> {
    if !(ctx.common.json || ctx.common.yaml) {
        return Ok(());
    }
    let resolved: std::collections::BTreeMap<_, _> = project
        .definitions()
        .iter()
        .filter_map(|d| project.relationships_for(d.name()).map(|r| (d.name(), r)))
        .collect();
    ctx.print(&resolved, |_| String::new())
}

fn format_statuses(statuses: &[ObjectStatus]) -> String {
    let mut out = String::new();
    for status in statuses {
        let mut line = format!(
            "{:<20} {:<8} {:<8}",
            status.name,
            status.kind.to_string(),
            status.state.to_string()
        );
        if let Some(ref ip) = status.ip {
            line.push_str(&format!(" {ip}"));
        }
        if status.committed {
            line.push_str(" (committed)");
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out.trim_end().to_string()
}

fn handle_var(ctx: &RuntimeContext, command: VarCommand) -> Result<()> {
    let mut project = ctx.load_project()?;
    match command {
        VarCommand::List => ctx.print(&project.state.variables, |vars| {
            vars.iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("\n")
        }),
        VarCommand::Get { key } => {
            let value = project
                .state
                .variables
                .get(&key)
                .ok_or_else(|| anyhow!("variable {key} is not set"))?;
            println!("{value}");
            Ok(())
        }
        VarCommand::Set { key, value } => {
            project.state.variables.insert(key, value);
            project.save().context("saving project state")
        }
        VarCommand::Unset { key } => {
            if project.state.variables.remove(&key).is_none() {
                bail!("variable {key} is not set");
            }
            project.save().context("saving project state")
        }
    }
}

async fn handle_slot(
    ctx: &RuntimeContext,
    orchestrator: &Orchestrator,
    reporter: &ConsoleReporter,
    command: SlotCommand,
) -> Result<()> {
    let mut project = ctx.load_project()?;
    match command {
        SlotCommand::Show => {
            let slots = orchestrator.slot_volumes(&project).await?;
            let active = project.slot();
            ctx.print(&slots, |slots| {
                let mut out = format!("active slot: {active}");
                for (slot, volumes) in slots {
                    out.push_str(&format!("\nslot {slot}: {} volume(s)", volumes.len()));
                    for volume in volumes {
                        out.push_str(&format!("\n  {volume}"));
                    }
                }
                out
            })
        }
        SlotCommand::Set { slot } => {
            project.set_slot(slot)?;
            info!("active slot is now {slot}; restart the project to use it");
            Ok(())
        }
        SlotCommand::Copy { dest } => {
            let report = orchestrator.copy_slot(&project, dest, reporter).await?;
            finish_batch("slot copy", report)
        }
        SlotCommand::Purge { slot } => {
            let report = orchestrator.purge(&mut project, Some(slot), reporter).await?;
            finish_batch("slot purge", report)
        }
    }
}

fn handle_flag(ctx: &RuntimeContext, command: FlagCommand) -> Result<()> {
    let mut project = ctx.load_project()?;
    match command {
        FlagCommand::List => ctx.print(&project.state.flags, |flags| {
            flags.iter().cloned().collect::<Vec<_>>().join("\n")
        }),
        FlagCommand::Set { flag } => {
            if project.state.set_flag(&flag, true) {
                project.save().context("saving project state")?;
            }
            Ok(())
        }
        FlagCommand::Unset { flag } => {
            if project.state.set_flag(&flag, false) {
                project.save().context("saving project state")?;
            }
            Ok(())
        }
    }
}

fn handle_option(ctx: &RuntimeContext, command: OptionCommand) -> Result<()> {
    let mut project = ctx.load_project()?;
    match command {
        OptionCommand::List => ctx.print(&project.state.options, |options| {
            options
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("\n")
        }),
        OptionCommand::Set { key, value } => {
            project.state.options.insert(key, value);
            // Reject values the next start could not use.
            project.mount_strategy(MountStrategy::default())?;
            project.save().context("saving project state")
        }
        OptionCommand::Unset { key } => {
            project.state.options.remove(&key);
            project.save().context("saving project state")
        }
    }
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => ctx.print(&ctx.config, |config| format!("{config:#?}")),
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.paths.config_file.display()
                );
                return Ok(());
            }
            write_default_config(&ctx.paths.config_file)
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

fn load_or_init_config(paths: &AppPaths, common: &CommonOpts) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        if common.dry_run {
            info!(
                "dry-run: would create default config at {}",
                paths.config_file.display()
            );
        } else {
            write_default_config(&paths.config_file)?;
        }
    }

    let env_prefix = env_prefix();
    let built = Config::builder()
        .set_default("logging.level", "warn")?
        .set_default("runtime.stop_timeout_secs", 10_i64)?
        .set_default("resolver.strategy", "graph")?
        .set_default("resolver.max_passes", DEFAULT_MAX_PASSES as i64)?
        .set_default("mounts.strategy", "volume")?
        .set_default("router.enabled", true)?
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(env_prefix.as_str()).separator("__"))
        .build()?;

    let mut config: AppConfig = built.try_deserialize()?;

    if let Some(ref file) = config.logging.file {
        let expanded = expand_str_path(file)?;
        config.logging.file = Some(expanded.display().to_string());
    }

    Ok(config)
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    format!("# Configuration for {APP_NAME}\n# File: {}\n\n", path.display())
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        let mut path = PathBuf::from(dir);
        path.push(APP_NAME);
        return Ok(path);
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config: {}, project: {}",
            self.config_file.display(),
            self.project_dir.display()
        )
    }
}

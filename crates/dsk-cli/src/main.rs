mod commands;
mod config;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::request::RequestArgs;
use commands::{CmdResult, Session};
use config::DskConfig;
use dsk_core::install_signal_handler;
use dsk_schema::{InstallScope, Operation, Ownership};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "dsk",
    version,
    about = "Deterministic, journaled installer: resolve, plan, apply, resume and roll back"
)]
struct Cli {
    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    /// Configuration file (default: ~/.config/dsk/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Keep every install and state directory under this root.
    #[arg(long, global = true)]
    sandbox: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Work with product manifests.
    Manifest {
        #[command(subcommand)]
        action: ManifestAction,
    },
    /// Write an install request.
    Request {
        /// Output file.
        #[arg(short, long, default_value = "request.dsurequest")]
        out: PathBuf,
        /// Convert a TOML request source instead of using flags.
        #[arg(long, conflicts_with_all = ["operation", "scope", "platform"])]
        from: Option<PathBuf>,
        #[arg(long)]
        operation: Option<Operation>,
        #[arg(long)]
        scope: Option<InstallScope>,
        /// Target platform triple, e.g. linux-x86_64.
        #[arg(long)]
        platform: Option<String>,
        /// Component to install (repeatable).
        #[arg(long = "component")]
        components: Vec<String>,
        /// Component to leave out (repeatable).
        #[arg(long)]
        exclude: Vec<String>,
        /// Directory holding the product payload.
        #[arg(long)]
        payload_root: Option<String>,
        /// Require a specific installer variant.
        #[arg(long)]
        splat: Option<String>,
        #[arg(long)]
        ownership: Option<Ownership>,
        /// Policy flag such as enable_shortcuts (repeatable).
        #[arg(long)]
        policy: Vec<String>,
        /// Capability the chosen splat must have (repeatable).
        #[arg(long)]
        require_cap: Vec<String>,
        /// Capability the chosen splat must not have (repeatable).
        #[arg(long)]
        prohibit_cap: Vec<String>,
    },
    /// Show splat selection and the resolved component set.
    Resolve {
        /// Compiled manifest.
        #[arg(long)]
        manifest: PathBuf,
        /// Request file (.dsurequest or .toml).
        #[arg(long)]
        request: PathBuf,
    },
    /// Build and write a plan.
    Plan {
        /// Compiled manifest.
        #[arg(long)]
        manifest: PathBuf,
        /// Request file (.dsurequest or .toml).
        #[arg(long)]
        request: PathBuf,
        /// Output file.
        #[arg(short, long, default_value = "plan.dsuplan")]
        out: PathBuf,
    },
    /// Apply a plan.
    Apply {
        plan: PathBuf,
        /// Journal every step but leave live install roots, state and audit untouched.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        #[arg(long, hide = true)]
        failpoint: Option<String>,
    },
    /// Continue an interrupted apply.
    Resume {
        plan: PathBuf,
        #[arg(long, hide = true)]
        failpoint: Option<String>,
    },
    /// Undo an interrupted apply.
    Rollback { plan: PathBuf },
    /// Check a plan file's digest and invariants.
    ValidatePlan { plan: PathBuf },
    /// Print any dsk record file as JSON.
    Dump { file: PathBuf },
    /// Verify installed files against the installed state.
    Verify {
        product_id: String,
        #[arg(long, default_value = "user")]
        scope: InstallScope,
    },
    /// Generate shell completions.
    Completions { shell: Shell },
    /// Generate man pages.
    ManPages {
        #[arg(default_value = "man")]
        dir: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
enum ManifestAction {
    /// Compile a TOML manifest source to .dsumanifest.
    Compile {
        source: PathBuf,
        /// Payload directory used to fill in missing digests and sizes.
        #[arg(long)]
        payload_root: Option<PathBuf>,
        /// Output file (default: source with .dsumanifest extension).
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

fn dispatch(cli: Cli, config: DskConfig) -> CmdResult {
    let (sandbox, json) = (cli.sandbox, cli.json);
    let session = move || Session::new(config, sandbox, json);
    match cli.command {
        Commands::Manifest {
            action:
                ManifestAction::Compile {
                    source,
                    payload_root,
                    out,
                },
        } => commands::manifest::compile(
            &session()?,
            &source,
            payload_root.as_deref(),
            out.as_deref(),
        ),
        Commands::Request {
            out,
            from,
            operation,
            scope,
            platform,
            components,
            exclude,
            payload_root,
            splat,
            ownership,
            policy,
            require_cap,
            prohibit_cap,
        } => {
            let args = RequestArgs {
                from,
                operation,
                scope,
                platform,
                components,
                exclude,
                payload_root,
                splat,
                ownership,
                policy,
                require_caps: require_cap,
                prohibit_caps: prohibit_cap,
            };
            commands::request::run(&session()?, args, &out)
        }
        Commands::Resolve { manifest, request } => {
            commands::resolve::run(&session()?, &manifest, &request)
        }
        Commands::Plan {
            manifest,
            request,
            out,
        } => commands::plan::run(&session()?, &manifest, &request, &out),
        Commands::Apply {
            plan,
            dry_run,
            failpoint,
        } => commands::apply::apply(&session()?, &plan, dry_run, failpoint.as_deref()),
        Commands::Resume { plan, failpoint } => {
            commands::apply::resume(&session()?, &plan, failpoint.as_deref())
        }
        Commands::Rollback { plan } => commands::apply::rollback(&session()?, &plan),
        Commands::ValidatePlan { plan } => commands::validate::run(&session()?, &plan),
        Commands::Dump { file } => commands::dump::run(&file),
        Commands::Verify { product_id, scope } => {
            commands::verify::run(&session()?, &product_id, scope)
        }
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
        Commands::ManPages { dir } => commands::man_pages::run::<Cli>(&dir),
    }
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let config = match DskConfig::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("error: {msg}");
            return ExitCode::from(commands::EXIT_INVALID);
        }
    };

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        config.log.as_deref().unwrap_or("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("DSK_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    install_signal_handler();

    match dispatch(cli, config) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(err.code)
        }
    }
}

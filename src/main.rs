use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jul_cli::api_client::ApiClient;
use jul_cli::checkpoint::{self, CheckpointOptions};
use jul_cli::config::{self, Settings};
use jul_cli::engine::cli::GitEngine;
use jul_cli::output;
use jul_cli::remote;
use jul_cli::restack::{self, RestackOptions};
use jul_cli::sync::{self, SyncOptions, SyncResult};
use jul_cli::trace::{self, TraceOptions};
use jul_cli::workspace::Workspace;
use std::process;

/// jul: continuous drafts, immutable checkpoints and restacking on top of git.
///
/// Every sync snapshots the working tree into a draft commit and publishes it
/// to the shared workspace ref without ever overwriting another device's work.
#[derive(Parser, Debug)]
#[command(
    name = "jul",
    version,
    about,
    after_help = "Examples:\n  jul sync\n  jul checkpoint -m \"add parser\"\n  jul restack --onto main\n  jul trace --prompt \"fix the tests\" --agent codex\n  jul ws checkout"
)]
struct Cli {
    /// Print diagnostic detail lines.
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Snapshot the working tree into a draft and publish it.
    Sync {
        /// Publish even when the draft adds secret-shaped content.
        #[arg(long)]
        allow_secrets: bool,
    },

    /// Turn the current draft into an immutable checkpoint.
    Checkpoint {
        /// Checkpoint message.
        #[arg(short, long)]
        message: String,

        /// Open the next draft under a fresh Change-Id.
        #[arg(long)]
        new_change: bool,
    },

    /// Rebuild the change's checkpoints on top of a new base.
    Restack {
        /// Branch, tag or commit to rebuild onto.
        #[arg(long)]
        onto: String,

        /// Continue in an isolated checkout left mid-merge.
        #[arg(long)]
        resume: bool,
    },

    /// Record a trace of the working tree.
    Trace {
        #[arg(long)]
        prompt: Option<String>,
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        session_id: Option<String>,
        #[arg(long)]
        turn: Option<u32>,
        /// Record even when nothing changed since the last trace.
        #[arg(long)]
        force: bool,
    },

    /// Workspace management.
    Ws {
        #[command(subcommand)]
        ws_command: WsCommand,
    },

    /// Print this device's id.
    Device,
}

#[derive(Subcommand, Debug)]
enum WsCommand {
    /// Adopt the shared workspace tip as this device's base.
    Checkout,
}

// ---------------------------------------------------------------------------
// Repository context
// ---------------------------------------------------------------------------

struct Repo {
    engine: GitEngine,
    settings: Settings,
    workspace: Workspace,
}

fn open_repo() -> Result<Repo> {
    let cwd = std::env::current_dir().context("failed to read current directory")?;
    let engine = GitEngine::open(&cwd)?;
    let git_user = engine.git().config_get("user.name")?;
    let settings = Settings::load(engine.root(), git_user)?;
    let workspace = Workspace::new(
        &settings.user,
        &settings.workspace,
        &settings.device,
        engine.state_dir(),
    );
    Ok(Repo {
        engine,
        settings,
        workspace,
    })
}

fn repo_name(ctx: &Repo) -> String {
    ctx.engine
        .root()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "repo".to_string())
}

fn short(sha: &str) -> &str {
    sha.get(..12).unwrap_or(sha)
}

fn print_warnings(warnings: &[String]) {
    for warning in warnings {
        output::note(warning);
    }
}

// ---------------------------------------------------------------------------
// Subcommand dispatch
// ---------------------------------------------------------------------------

fn run_sync(allow_secrets: bool) -> Result<()> {
    let ctx = open_repo()?;
    let mut opts = SyncOptions::from_settings(&ctx.settings, ctx.engine.state_dir())?;
    opts.allow_secrets |= allow_secrets;

    output::action("Syncing", &ctx.workspace.id());
    let mut result = sync::sync(&ctx.engine, &ctx.workspace, &opts)?;

    if result.workspace_updated
        && let Some(url) = ctx.settings.server_url.as_deref()
    {
        let client = ApiClient::new(url, ctx.settings.server_token.clone());
        if let Some(response) =
            sync::report_sync(&ctx.engine, &client, &ctx.workspace, &repo_name(&ctx), &mut result)
        {
            output::detail(&format!(
                "server change {} revision {}",
                response.change.change_id, response.revision.rev_index
            ));
        }
    }

    render_sync(&result);
    Ok(())
}

fn render_sync(result: &SyncResult) {
    if let Some(divergence) = &result.divergence {
        output::fail("Diverged", &divergence.to_string());
    } else if let Some(block) = &result.secret_block {
        output::fail("Blocked", block);
    } else {
        output::success("Synced", short(&result.draft_sha));
    }
    output::info(&format!("change {}", result.change_id));
    if let Some(problem) = &result.remote_problem {
        output::note(&problem.to_string());
    }
    if let Some(remote) = &result.remote {
        output::detail(&format!(
            "remote {remote}: draft pushed {}, workspace pushed {}",
            result.draft_pushed, result.workspace_pushed
        ));
    }
    print_warnings(&result.warnings);
}

fn run_checkpoint(message: String, start_new_change: bool) -> Result<()> {
    let ctx = open_repo()?;
    let sync_opts = SyncOptions::from_settings(&ctx.settings, ctx.engine.state_dir())?;
    let opts = CheckpointOptions {
        message,
        start_new_change,
    };

    output::action("Checkpointing", &ctx.workspace.id());
    let result = checkpoint::checkpoint(
        &ctx.engine,
        &ctx.workspace,
        &ctx.settings.traces,
        &sync_opts,
        &opts,
    )?;

    output::success("Checkpoint", short(&result.checkpoint_sha));
    output::info(&format!("change {}", result.change_id));
    output::info(&format!("keep {}", result.keep_ref));
    output::detail(&format!("new draft {}", short(&result.draft_sha)));
    if let Some(divergence) = &result.sync.divergence {
        output::note(&divergence.to_string());
    }
    if let Some(block) = &result.sync.secret_block {
        output::note(&format!("{block}; checkpoint kept local"));
    }
    if !result.pushed
        && let Some(problem) = &result.sync.remote_problem
    {
        output::note(&problem.to_string());
    }
    print_warnings(&result.warnings);
    Ok(())
}

fn run_restack(onto: String, resume: bool) -> Result<()> {
    let ctx = open_repo()?;
    let opts = RestackOptions {
        base_ref: onto,
        allow_resume: resume,
        remote: ctx.settings.remote.clone(),
    };

    output::action("Restacking", &format!("onto {}", opts.base_ref));
    let result = restack::restack(&ctx.engine, &ctx.workspace, &opts)?;

    output::success(
        "Restacked",
        &format!(
            "{} checkpoint(s) onto {}",
            result.checkpoints.len(),
            short(&result.base_sha)
        ),
    );
    for sha in &result.checkpoints {
        output::info(short(sha));
    }
    output::detail(&format!("new draft {}", short(&result.draft_sha)));
    print_warnings(&result.warnings);
    Ok(())
}

fn run_trace(opts: TraceOptions) -> Result<()> {
    let ctx = open_repo()?;
    let remote = match remote::select(&ctx.engine, ctx.settings.remote.as_deref())? {
        Ok(name) => Some(name),
        Err(problem) => {
            output::detail(&problem.to_string());
            None
        }
    };
    let result = trace::record_trace(
        &ctx.engine,
        &ctx.workspace,
        &ctx.settings.traces,
        remote.as_deref(),
        &opts,
    )?;

    if result.skipped {
        output::info("no changes since the last trace");
    } else {
        output::success("Traced", short(&result.trace_sha));
    }
    if let Some(hash) = &result.prompt_hash {
        output::detail(hash);
    }
    print_warnings(&result.warnings);
    Ok(())
}

fn run_ws(ws_command: WsCommand) -> Result<()> {
    match ws_command {
        WsCommand::Checkout => {
            let ctx = open_repo()?;
            let remote = remote::select(&ctx.engine, ctx.settings.remote.as_deref())?.ok();
            let tip = sync::checkout_workspace(&ctx.engine, &ctx.workspace, remote.as_deref())?;
            output::success("Checked out", &format!("{} at {}", ctx.workspace.id(), short(&tip)));
            Ok(())
        }
    }
}

fn run_device() -> Result<()> {
    let ctx = open_repo()?;
    println!("{}", ctx.settings.device);
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    output::set_verbose(cli.verbose || config::verbose_from_env());

    let result = match cli.command {
        Command::Sync { allow_secrets } => run_sync(allow_secrets),
        Command::Checkpoint {
            message,
            new_change,
        } => run_checkpoint(message, new_change),
        Command::Restack { onto, resume } => run_restack(onto, resume),
        Command::Trace {
            prompt,
            agent,
            session_id,
            turn,
            force,
        } => run_trace(TraceOptions {
            prompt,
            agent,
            session_id,
            turn,
            force,
            update_canonical: false,
        }),
        Command::Ws { ws_command } => run_ws(ws_command),
        Command::Device => run_device(),
    };

    if let Err(e) = result {
        eprintln!("jul: error: {e:#}");
        process::exit(1);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

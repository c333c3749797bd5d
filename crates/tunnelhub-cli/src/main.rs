use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tunnelhub_agent::{AgentConfig, AgentServer};
use tunnelhub_core::token::{AgentToken, TokenManager};
use tunnelhub_hub::{HubConfig, HubState};

#[derive(Parser)]
#[command(name = "tunnelhub", about = "Reverse-tunnel HTTP proxy: hub + agent")]
struct Cli {
	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Display the build version
	Version,
	/// Operations on the hub
	Hub {
		#[command(subcommand)]
		command: HubCommand,
	},
	/// Operations on the agent
	Agent {
		#[command(subcommand)]
		command: AgentCommand,
	},
}

#[derive(Subcommand)]
enum HubCommand {
	/// Run a hub server
	Run(HubRunArgs),
	/// Register an agent, printing a sealed agent token
	Register(HubRegisterArgs),
}

#[derive(Subcommand)]
enum AgentCommand {
	/// Run an agent server
	Run(AgentRunArgs),
}

#[derive(Args)]
struct HubRunArgs {
	/// Shared secret the agent tokens are sealed under
	#[arg(long, env = "TUNNELHUB_SECRET")]
	secret: String,
	/// Password required of application callers, via X-App-Password
	#[arg(long)]
	app_password: Option<String>,
	#[arg(long, default_value = "0.0.0.0")]
	host: String,
	#[arg(long, default_value_t = 8080)]
	port: u16,
	/// Cap on concurrent application requests in flight; 0 means unlimited
	#[arg(long, default_value_t = 0)]
	concurrent: usize,
}

#[derive(Args)]
struct HubRegisterArgs {
	#[arg(long, env = "TUNNELHUB_SECRET")]
	secret: String,
	/// The agent's label; a random two-word name is generated if omitted
	#[arg(long)]
	name: Option<String>,
	/// Token lifetime in seconds; 0 (default) never expires
	#[arg(long, default_value_t = 0)]
	age_seconds: u64,
	/// Restrict the agent to these request paths; repeatable, unset means unrestricted
	#[arg(long = "scope-path")]
	scope_paths: Vec<String>,
}

#[derive(Args)]
struct AgentRunArgs {
	#[arg(long, env = "TUNNELHUB_TOKEN")]
	token: String,
	/// The hub address, as `host:port` or a full URL
	#[arg(long)]
	hub: String,
	/// The upstream address to forward accepted requests to; repeatable
	#[arg(long = "upstream", required = true)]
	upstreams: Vec<String>,
	#[arg(long, default_value_t = 1)]
	num_worker: u32,
	#[arg(long, default_value_t = true)]
	report_hardware: bool,
	#[arg(long, default_value = "agent.id")]
	agent_id_file: PathBuf,
}

fn main() -> anyhow::Result<()> {
	tunnelhub_core::telemetry::init();
	let cli = Cli::parse();
	tokio::runtime::Runtime::new()?.block_on(dispatch(cli))
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
	match cli.command {
		Command::Version => {
			println!("{}", env!("CARGO_PKG_VERSION"));
			Ok(())
		},
		Command::Hub {
			command: HubCommand::Run(args),
		} => run_hub(args).await,
		Command::Hub {
			command: HubCommand::Register(args),
		} => register(args),
		Command::Agent {
			command: AgentCommand::Run(args),
		} => run_agent(args).await,
	}
}

async fn run_hub(args: HubRunArgs) -> anyhow::Result<()> {
	let state = Arc::new(HubState::new(HubConfig {
		secret: args.secret,
		app_password: args.app_password.filter(|p| !p.is_empty()),
		concurrency_limit: (args.concurrent > 0).then_some(args.concurrent),
	}));
	let app = tunnelhub_hub::router(state);

	let addr = format!("{}:{}", args.host, args.port);
	let listener = tokio::net::TcpListener::bind(&addr).await?;
	tracing::info!(addr, "starting hub server");
	axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
	Ok(())
}

fn register(args: HubRegisterArgs) -> anyhow::Result<()> {
	let expire_at = if args.age_seconds > 0 {
		let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
		(now + args.age_seconds) as i64
	} else {
		0
	};

	let token = AgentToken::new(args.name, expire_at, args.scope_paths);
	let mgr = TokenManager::new(args.secret.as_bytes());
	let sealed = mgr.seal(&token)?;
	println!("{sealed}");
	Ok(())
}

async fn run_agent(args: AgentRunArgs) -> anyhow::Result<()> {
	let cancel = CancellationToken::new();
	let mut tasks = tokio::task::JoinSet::new();

	for (i, upstream) in args.upstreams.iter().enumerate() {
		let server = AgentServer::new(AgentConfig {
			hub_addr: args.hub.clone(),
			upstream_addr: upstream.clone(),
			token: args.token.clone(),
			num_worker: args.num_worker,
			report_hardware: args.report_hardware,
			agent_id_file: agent_id_file_for(&args.agent_id_file, i, args.upstreams.len()),
		})?;

		let cancel = cancel.clone();
		let upstream = upstream.clone();
		tasks.spawn(async move {
			if let Err(e) = server.run(cancel).await {
				tracing::error!(upstream, error = %e, "agent server terminated");
			}
		});
	}

	tokio::select! {
		_ = shutdown_signal() => cancel.cancel(),
		_ = drain(&mut tasks) => {},
	}
	while tasks.join_next().await.is_some() {}
	Ok(())
}

async fn drain(tasks: &mut tokio::task::JoinSet<()>) {
	while tasks.join_next().await.is_some() {}
}

/// Each `--upstream` gets its own agent-id file, so running several agent
/// instances against one hub from the same directory doesn't collide on a
/// shared id base.
fn agent_id_file_for(base: &Path, index: usize, total: usize) -> PathBuf {
	if total <= 1 {
		return base.to_path_buf();
	}
	let mut name = base.as_os_str().to_os_string();
	name.push(format!(".{index}"));
	PathBuf::from(name)
}

async fn shutdown_signal() {
	let _ = tokio::signal::ctrl_c().await;
}

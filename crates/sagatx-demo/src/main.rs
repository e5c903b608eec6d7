//! Transfer-money demo.
//!
//! Moves money from `foo` to `bar` in a saga with two compensable legs. The
//! second leg fails, so the coordinator compensates the first and the
//! balances return to where they started.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use sagatx::telemetry::{self, LogFormat};
use sagatx::{AgentConfig, BoxError, ContextCarrier, SagaAgent, SagaError};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "sagatx-demo")]
#[command(about = "Run the transfer-money saga against a coordinator", long_about = None)]
struct Args {
	/// Agent configuration file (YAML); overrides the flags below
	#[arg(long)]
	config: Option<PathBuf>,

	/// Coordinator gRPC address
	#[arg(long, default_value = "127.0.0.1:8080")]
	coordinator: String,

	/// Service name reported to the coordinator
	#[arg(long, default_value = "saga-rust-demo")]
	service_name: String,

	/// Amount to transfer
	#[arg(long, default_value_t = 100)]
	amount: i64,

	/// Let the second leg succeed
	#[arg(long)]
	succeed: bool,

	/// Log filter used when RUST_LOG is unset
	#[arg(long, default_value = "info")]
	log_filter: String,

	/// Log output format: text or json
	#[arg(long, default_value = "text")]
	log_format: LogFormat,
}

type Balances = Arc<Mutex<HashMap<String, i64>>>;

fn print_balances(balances: &Balances) {
	let b = balances.lock();
	println!(
		"foo balance: {}, bar balance: {}",
		b.get("foo").copied().unwrap_or_default(),
		b.get("bar").copied().unwrap_or_default()
	);
}

#[tokio::main]
async fn main() -> Result<()> {
	let args = Args::parse();
	telemetry::init(&args.log_filter, args.log_format)?;

	let config = match &args.config {
		Some(path) => AgentConfig::from_file(path)
			.with_context(|| format!("failed to load {}", path.display()))?,
		None => AgentConfig::new(&args.service_name, &args.coordinator),
	};
	info!(service_name = %config.service_name, coordinator = %config.coordinator_address, "starting demo");

	let agent = SagaAgent::builder(config).build()?;
	agent.connect().await.context("failed to connect to coordinator")?;
	let signals = agent.spawn_signal_handler();

	let balances: Balances = Arc::new(Mutex::new(HashMap::from([
		("foo".to_string(), 500),
		("bar".to_string(), 500),
	])));

	let (b, undo) = (balances.clone(), balances.clone());
	let transfer_out = Arc::new(agent.compensable(
		"transfer_out",
		"cancel_transfer_out",
		5,
		move |_ctx: ContextCarrier, (from, amount): (String, i64)| {
			*b.lock().entry(from).or_default() -= amount;
			async { Ok::<_, BoxError>(()) }
		},
		move |_ctx: ContextCarrier, (from, amount): (String, i64)| {
			*undo.lock().entry(from).or_default() += amount;
			async { Ok::<_, BoxError>(()) }
		},
	)?);

	let succeed = args.succeed;
	let (b, undo) = (balances.clone(), balances.clone());
	let transfer_in = Arc::new(agent.compensable(
		"transfer_in",
		"cancel_transfer_in",
		5,
		move |_ctx: ContextCarrier, (to, amount): (String, i64)| {
			let b = b.clone();
			async move {
				if !succeed {
					return Err::<(), BoxError>(format!("{to} refused the deposit").into());
				}
				*b.lock().entry(to).or_default() += amount;
				Ok(())
			}
		},
		move |_ctx: ContextCarrier, (to, amount): (String, i64)| {
			*undo.lock().entry(to).or_default() -= amount;
			async { Ok::<_, BoxError>(()) }
		},
	)?);

	let transfer_money = agent.saga_start(
		"transfer_money",
		20,
		true,
		move |ctx: ContextCarrier, (amount,): (i64,)| {
			let transfer_out = transfer_out.clone();
			let transfer_in = transfer_in.clone();
			async move {
				transfer_out.call(&ctx, ("foo".to_string(), amount)).await?;
				transfer_in.call(&ctx, ("bar".to_string(), amount)).await?;
				Ok::<_, SagaError>(())
			}
		},
	)?;

	print_balances(&balances);
	match transfer_money.call(&ContextCarrier::new(), (args.amount,)).await {
		Ok(()) => info!("transfer committed"),
		Err(e) => warn!(error = %e, "transfer failed, waiting for compensation"),
	}

	let shutdown = agent.transport().shutdown_token();
	let mut ticker = tokio::time::interval(Duration::from_secs(3));
	loop {
		tokio::select! {
			_ = shutdown.cancelled() => break,
			_ = ticker.tick() => print_balances(&balances),
		}
	}
	signals.await?;
	Ok(())
}

// End-to-end saga flows against an in-process gRPC coordinator

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sagatx::context::{GLOBAL_TX_ID_HEADER, LOCAL_TX_ID_HEADER};
use sagatx::protocol::proto::GrpcCompensateCommand;
use sagatx::{
	AgentConfig, BoxError, ContextCarrier, SagaAgent, SagaError, ServiceIdentity, TxContext,
};

use super::coordinator::Coordinator;

fn agent_for(addr: std::net::SocketAddr) -> anyhow::Result<SagaAgent> {
	let config = AgentConfig::new("transfer", addr.to_string())
		.with_communicate_timeout(Duration::from_secs(2))
		.with_reconnect_delay(Duration::from_millis(200));
	Ok(
		SagaAgent::builder(config)
			.identity(ServiceIdentity::new("transfer", "transfer-127.0.0.1"))
			.build()?,
	)
}

#[tokio::test]
async fn test_transfer_money_over_grpc() -> anyhow::Result<()> {
	let coordinator = Coordinator::new();
	coordinator.abort_tx_started_for("cancel_transfer_in");
	let server = coordinator.start().await?;

	let agent = agent_for(server.addr)?;
	agent.connect().await?;
	coordinator.wait_for_subscribers(1).await;
	assert_eq!(coordinator.subscribers()[0].instance_id, "transfer-127.0.0.1");

	let balances = Arc::new(Mutex::new((1000i64, 0i64)));

	let b = balances.clone();
	let undo = balances.clone();
	let transfer_out = Arc::new(agent.compensable(
		"transfer_out",
		"cancel_transfer_out",
		0,
		move |_ctx: ContextCarrier, (_from, amount): (String, i64)| {
			b.lock().0 -= amount;
			async { Ok::<_, BoxError>(()) }
		},
		move |_ctx: ContextCarrier, (_from, amount): (String, i64)| {
			undo.lock().0 += amount;
			async { Ok::<_, BoxError>(()) }
		},
	)?);

	let b = balances.clone();
	let transfer_in = Arc::new(agent.compensable(
		"transfer_in",
		"cancel_transfer_in",
		0,
		move |_ctx: ContextCarrier, (_to, amount): (String, i64)| {
			b.lock().1 += amount;
			async { Ok::<_, BoxError>(()) }
		},
		|_ctx: ContextCarrier, (_to, _amount): (String, i64)| async { Ok::<_, BoxError>(()) },
	)?);

	let transfer_money = agent.saga_start(
		"transfer_money",
		0,
		true,
		move |ctx: ContextCarrier, (from, to, amount): (String, String, i64)| {
			let transfer_out = transfer_out.clone();
			let transfer_in = transfer_in.clone();
			async move {
				transfer_out.call(&ctx, (from, amount)).await?;
				transfer_in.call(&ctx, (to, amount)).await?;
				Ok::<_, SagaError>(())
			}
		},
	)?;

	let carrier = ContextCarrier::new();
	let err = transfer_money
		.call(&carrier, ("foo".into(), "bar".into(), 100))
		.await
		.unwrap_err();
	assert!(err.is_aborted());
	assert!(!carrier.is_active());
	assert_eq!(*balances.lock(), (900, 0));
	assert_eq!(
		coordinator.event_types(),
		vec![
			"SagaStartedEvent",
			"TxStartedEvent",
			"TxEndedEvent",
			"TxStartedEvent",
			"TxAbortedEvent"
		]
	);

	// The coordinator undoes the first leg.
	let started = coordinator.events()[1].clone();
	coordinator
		.compensate(GrpcCompensateCommand {
			global_tx_id: started.global_tx_id.clone(),
			local_tx_id: started.local_tx_id.clone(),
			parent_tx_id: started.parent_tx_id.clone(),
			compensation_method: started.compensation_method.clone(),
			payloads: started.payloads.clone(),
		})
		.await;
	let compensated = coordinator.wait_for_event("TxCompensatedEvent").await;
	assert_eq!(compensated.local_tx_id, started.local_tx_id);
	assert_eq!(compensated.compensation_method, "cancel_transfer_out");
	assert_eq!(*balances.lock(), (1000, 0));

	agent.shutdown().await;
	assert_eq!(coordinator.disconnects(), 1);
	Ok(())
}

#[tokio::test]
async fn test_successful_saga_reports_every_phase() -> anyhow::Result<()> {
	let coordinator = Coordinator::new();
	let server = coordinator.start().await?;
	let agent = agent_for(server.addr)?;
	agent.connect().await?;

	let step = Arc::new(agent.compensable(
		"reserve",
		"release",
		5,
		|_ctx: ContextCarrier, (sku, qty): (String, u32)| async move {
			Ok::<_, BoxError>(format!("{sku}x{qty}"))
		},
		|_ctx: ContextCarrier, (_sku, _qty): (String, u32)| async { Ok::<_, BoxError>(()) },
	)?);
	let order = agent.saga_start("order", 60, true, move |ctx: ContextCarrier, (sku,): (String,)| {
		let step = step.clone();
		async move { step.call(&ctx, (sku, 2)).await }
	})?;

	let reserved = order.call(&ContextCarrier::new(), ("apple".into(),)).await?;
	assert_eq!(reserved, "applex2");

	let events = coordinator.events();
	assert_eq!(
		coordinator.event_types(),
		vec![
			"SagaStartedEvent",
			"TxStartedEvent",
			"TxEndedEvent",
			"SagaEndedEvent"
		]
	);
	let global = &events[0].global_tx_id;
	assert!(events.iter().all(|e| &e.global_tx_id == global));
	assert_eq!(events[0].local_tx_id, *global);
	assert_eq!(events[0].timeout, 60);
	assert_eq!(events[1].timeout, 5);
	assert_eq!(events[1].parent_tx_id, *global);
	assert_eq!(events[1].payloads, br#"["apple",2]"#.to_vec());
	assert_eq!(events[1].service_name, "transfer");
	assert!(events.iter().all(|e| e.timestamp > 0));

	agent.shutdown().await;
	Ok(())
}

#[tokio::test]
async fn test_context_travels_through_headers() -> anyhow::Result<()> {
	let caller = ContextCarrier::with_context(TxContext::new("g1", "l7"));
	let mut headers = http::HeaderMap::new();
	caller.inject_into_headers(&mut headers);
	assert_eq!(headers.get(GLOBAL_TX_ID_HEADER).unwrap(), "g1");
	assert_eq!(headers.get(LOCAL_TX_ID_HEADER).unwrap(), "l7");

	let callee = ContextCarrier::new();
	assert!(callee.extract_from_headers(&headers));
	assert_eq!(callee.get()?, TxContext::new("g1", "l7"));
	Ok(())
}

#[tokio::test]
async fn test_connect_to_missing_coordinator_fails() -> anyhow::Result<()> {
	let addr = {
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
		listener.local_addr()?
	};
	let agent = agent_for(addr)?;
	assert!(agent.connect().await.is_err());
	assert!(!agent.transport().is_connected());
	Ok(())
}

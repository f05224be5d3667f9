//! Manager launch, restart, wait, discovery, and close semantics.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{Counter, DerivedC, DerivedD, FlakySetup, PlainA, PlainB, Ticker};
use parley::domain_types::RestartLimit;
use parley::{
    AgentError, AgentId, EntityId, LaunchOptions, LocalExchangeFactory, MailboxStatus, Manager,
    ManagerConfig, ManagerError, WorkerPool,
};

async fn local_manager(max_restarts: u32) -> (Arc<LocalExchangeFactory>, Manager) {
    let factory = Arc::new(LocalExchangeFactory::new());
    let config = ManagerConfig {
        max_restarts: RestartLimit::try_new(max_restarts).unwrap(),
        ..ManagerConfig::default()
    };
    let manager = Manager::new(Arc::clone(&factory) as _, config).await.unwrap();
    (factory, manager)
}

#[test_log::test(tokio::test)]
async fn launch_run_and_close() {
    let (_, manager) = local_manager(0).await;
    let handle = manager
        .launch(Counter::default(), LaunchOptions::default())
        .await
        .unwrap();

    handle.action("add", vec![json!(40)]).await.unwrap();
    handle.action("add", vec![json!(2)]).await.unwrap();
    assert_eq!(handle.action("count", ()).await.unwrap(), json!(42));

    manager.close().await.unwrap();

    // The manager's exchange client is gone; further calls fail
    // locally instead of hanging.
    let err = handle.action("count", ()).await.unwrap_err();
    assert!(
        !matches!(err, parley::HandleError::Remote(_)),
        "closed manager should not serve actions: {err}"
    );
}

#[test_log::test(tokio::test)]
async fn restart_recovers_from_setup_failures() {
    let (_, manager) = local_manager(2).await;
    let behavior = FlakySetup::new(2);
    let attempts = Arc::clone(&behavior.attempts);

    let handle = manager
        .launch(behavior, LaunchOptions::default())
        .await
        .unwrap();

    // First two runs fail setup; the third serves requests.
    let observed = handle
        .action("attempts", ())
        .await
        .unwrap();
    assert_eq!(observed, json!(3));
    assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);

    manager.close().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn restart_budget_exhaustion_surfaces_the_setup_error() {
    let (_, manager) = local_manager(1).await;
    let behavior = FlakySetup::new(5);
    let attempts = Arc::clone(&behavior.attempts);

    let handle = manager
        .launch(behavior, LaunchOptions::default())
        .await
        .unwrap();
    let agent_id = handle.agent_id().clone();

    let err = manager
        .wait(&agent_id, true, Some(Duration::from_secs(5)))
        .await
        .unwrap_err();
    match err {
        ManagerError::Agent(agent_err) => {
            assert!(matches!(*agent_err, AgentError::Setup(_)), "got {agent_err}");
        }
        other => panic!("unexpected error: {other}"),
    }
    // max_restarts=1 means exactly two attempts.
    assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 2);

    let err = manager.close().await.unwrap_err();
    assert!(matches!(err, ManagerError::AgentFailures(failures) if failures.len() == 1));
}

#[test_log::test(tokio::test)]
async fn wait_reports_unknown_agents_and_timeouts() {
    let (_, manager) = local_manager(0).await;

    let unknown = AgentId::new(None, vec!["Ghost".to_string()]);
    let err = manager.wait(&unknown, true, None).await.unwrap_err();
    assert!(matches!(err, ManagerError::UnknownAgent(_)));

    let handle = manager
        .launch(Ticker::default(), LaunchOptions::default())
        .await
        .unwrap();
    let err = manager
        .wait(handle.agent_id(), true, Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::Timeout(_)));

    manager
        .shutdown(handle.agent_id(), true, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    manager.close().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn agents_run_on_thread_executors() {
    let (_, manager) = local_manager(0).await;
    manager.add_executor("threads", WorkerPool::threads(2)).unwrap();

    let handle = manager
        .launch(
            Counter::default(),
            LaunchOptions {
                executor: Some("threads".to_string()),
                name: Some("threaded-counter".to_string()),
                ..LaunchOptions::default()
            },
        )
        .await
        .unwrap();

    handle.action("add", vec![json!(7)]).await.unwrap();
    assert_eq!(handle.action("count", ()).await.unwrap(), json!(7));
    assert!(handle.ping(Some(Duration::from_secs(5))).await.unwrap() > Duration::ZERO);

    manager.close().await.unwrap();

    let err = manager
        .add_executor("threads", WorkerPool::threads(1))
        .unwrap_err();
    assert!(matches!(err, ManagerError::DuplicateExecutor(_)));
}

#[test_log::test(tokio::test)]
async fn discovery_filters_by_ancestry_and_liveness() {
    let (_, manager) = local_manager(0).await;
    let client = manager.exchange_client();

    let a = manager.launch(PlainA, LaunchOptions::default()).await.unwrap();
    let b = manager.launch(PlainB, LaunchOptions::default()).await.unwrap();
    let c = manager.launch(DerivedC, LaunchOptions::default()).await.unwrap();
    let d = manager.launch(DerivedD, LaunchOptions::default()).await.unwrap();

    for handle in [&a, &b, &c, &d] {
        handle.ping(Some(Duration::from_secs(5))).await.unwrap();
    }
    manager
        .shutdown(d.agent_id(), true, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(
        manager
            .status(&EntityId::from(d.agent_id().clone()))
            .await
            .unwrap(),
        MailboxStatus::Terminated
    );

    let wide = client.discover("B", true).await.unwrap();
    assert_eq!(wide, vec![b.agent_id().clone(), c.agent_id().clone()]);

    let narrow = client.discover("B", false).await.unwrap();
    assert_eq!(narrow, vec![b.agent_id().clone()]);

    let just_a = client.discover("A", true).await.unwrap();
    assert_eq!(just_a, vec![a.agent_id().clone()]);

    manager.close().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn close_is_idempotent() {
    let (_, manager) = local_manager(0).await;
    manager
        .launch(Counter::default(), LaunchOptions::default())
        .await
        .unwrap();
    manager.close().await.unwrap();
    manager.close().await.unwrap();
}

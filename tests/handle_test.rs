//! Handle semantics against a live agent on the in-process exchange.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::task::JoinHandle;

use common::{Counter, Faulty};
use parley::{
    ActionArgs, Agent, AgentError, Behavior, EntityId, ExchangeClient, ExchangeFactory, Handle,
    HandleError, LocalExchangeFactory, MailboxStatus, ProxyHandle, RemoteHandle, RuntimeConfig,
};

async fn spawn_agent<B: Behavior>(
    factory: &LocalExchangeFactory,
    user: &ExchangeClient,
    behavior: B,
    config: RuntimeConfig,
) -> (RemoteHandle, JoinHandle<Result<(), AgentError>>) {
    let ancestry = B::behavior_types().into_names();
    let registration = user.register_agent(&ancestry, None).await.unwrap();
    let agent = Arc::new(Agent::new(
        behavior,
        config,
        Arc::new(factory.clone()) as Arc<dyn ExchangeFactory>,
        registration.clone(),
    ));
    let task = tokio::spawn(async move { agent.run().await });
    let handle = user.get_handle(&registration.agent_id).unwrap();
    (handle, task)
}

#[test_log::test(tokio::test)]
async fn ping_round_trip_and_lifecycle_status() {
    let factory = LocalExchangeFactory::new();
    let user = ExchangeClient::user(&factory, Some("tester")).await.unwrap();
    let (handle, task) = spawn_agent(&factory, &user, Counter::default(), RuntimeConfig::default()).await;
    let agent_entity = EntityId::from(handle.agent_id().clone());

    let elapsed = handle.ping(Some(Duration::from_secs(5))).await.unwrap();
    assert!(elapsed > Duration::ZERO);
    assert_eq!(
        user.status(&agent_entity).await.unwrap(),
        MailboxStatus::Active
    );

    handle.shutdown(None).await.unwrap();
    task.await.unwrap().unwrap();
    assert_eq!(
        user.status(&agent_entity).await.unwrap(),
        MailboxStatus::Terminated
    );

    // A second shutdown of a terminated agent is silently absorbed.
    handle.shutdown(None).await.unwrap();
    user.close(true).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn counter_actions_apply_in_order() {
    let factory = LocalExchangeFactory::new();
    let user = ExchangeClient::user(&factory, None).await.unwrap();
    let (handle, task) = spawn_agent(&factory, &user, Counter::default(), RuntimeConfig::default()).await;

    handle.action("add", vec![json!(1)]).await.unwrap();
    handle.action("add", vec![json!(2)]).await.unwrap();
    assert_eq!(handle.action("count", ()).await.unwrap(), json!(3));

    handle.action("add", vec![json!(-10)]).await.unwrap();
    assert_eq!(handle.action("count", ()).await.unwrap(), json!(-7));

    handle.shutdown(None).await.unwrap();
    task.await.unwrap().unwrap();
    user.close(true).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn action_error_preserves_kind_and_message() {
    let factory = LocalExchangeFactory::new();
    let user = ExchangeClient::user(&factory, None).await.unwrap();
    let (handle, task) = spawn_agent(&factory, &user, Faulty, RuntimeConfig::default()).await;

    let err = handle.action("fails", ()).await.unwrap_err();
    match err {
        HandleError::Remote(info) => {
            assert_eq!(info.class_name, "RuntimeError");
            assert_eq!(info.message, "boom");
        }
        other => panic!("unexpected error: {other}"),
    }

    let err = handle.action("no_such_action", ()).await.unwrap_err();
    match err {
        HandleError::Remote(info) => {
            assert_eq!(info.class_name, "UnknownAction");
            assert!(info.message.contains("no_such_action"));
        }
        other => panic!("unexpected error: {other}"),
    }

    handle.shutdown(None).await.unwrap();
    task.await.unwrap().unwrap();
    user.close(true).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn cancelled_action_leaves_agent_usable() {
    let factory = LocalExchangeFactory::new();
    let user = ExchangeClient::user(&factory, None).await.unwrap();
    let (handle, task) = spawn_agent(&factory, &user, Faulty, RuntimeConfig::default()).await;

    let slow = handle.action("sleep", vec![json!(5.0)]);
    let outcome = tokio::time::timeout(Duration::from_millis(50), slow).await;
    assert!(outcome.is_err(), "sleep should outlive the timeout");

    // Dropping the awaiter fired a cancel request; the agent keeps
    // serving other calls.
    assert_eq!(handle.action("quick", ()).await.unwrap(), json!("ok"));

    handle.shutdown(None).await.unwrap();
    task.await.unwrap().unwrap();
    user.close(true).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn terminating_mailbox_mid_flight_fails_fast() {
    let factory = LocalExchangeFactory::new();
    let user = ExchangeClient::user(&factory, None).await.unwrap();
    let (handle, task) = spawn_agent(&factory, &user, Faulty, RuntimeConfig::default()).await;
    let agent_entity = EntityId::from(handle.agent_id().clone());

    let in_flight = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.action("sleep", vec![json!(1.0)]).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let started = Instant::now();
    user.terminate(&agent_entity).await.unwrap();
    let err = in_flight.await.unwrap().unwrap_err();
    assert!(
        started.elapsed() < Duration::from_millis(200),
        "caller should fail fast, took {:?}",
        started.elapsed()
    );
    assert!(
        matches!(
            err,
            HandleError::AgentTerminated(_) | HandleError::Exchange(_) | HandleError::Cancelled
        ),
        "unexpected error: {err}"
    );

    let _ = task.await.unwrap();
    user.close(true).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn closing_a_handle_fails_outstanding_requests() {
    let factory = LocalExchangeFactory::new();
    let user = ExchangeClient::user(&factory, None).await.unwrap();
    let (handle, task) = spawn_agent(&factory, &user, Faulty, RuntimeConfig::default()).await;

    let slow = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.action("sleep", vec![json!(5.0)]).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    handle.close(false).await;
    let err = slow.await.unwrap().unwrap_err();
    assert!(matches!(err, HandleError::HandleClosed(_)), "got {err}");

    let err = handle.action("quick", ()).await.unwrap_err();
    assert!(matches!(err, HandleError::HandleClosed(_)));

    // The agent is still alive; a fresh handle works.
    let fresh = user.get_handle(handle.agent_id()).unwrap();
    assert_eq!(fresh.action("quick", ()).await.unwrap(), json!("ok"));

    fresh.shutdown(None).await.unwrap();
    task.await.unwrap().unwrap();
    user.close(true).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn ping_times_out_when_nobody_answers() {
    let factory = LocalExchangeFactory::new();
    let user = ExchangeClient::user(&factory, None).await.unwrap();

    // Register a mailbox but never run the agent: the ping sits in the
    // queue unanswered.
    let registration = user
        .register_agent(&["Absent".to_string()], None)
        .await
        .unwrap();
    let handle = user.get_handle(&registration.agent_id).unwrap();

    let err = handle
        .ping(Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, HandleError::Timeout(_)));

    user.close(true).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn unbound_handles_rebind_to_a_client() {
    let factory = LocalExchangeFactory::new();
    let user = ExchangeClient::user(&factory, None).await.unwrap();
    let (handle, task) = spawn_agent(&factory, &user, Counter::default(), RuntimeConfig::default()).await;

    let unbound = serde_json::from_str::<parley::UnboundRemoteHandle>(
        &serde_json::to_string(&handle.unbind()).unwrap(),
    )
    .unwrap();
    let rebound = unbound.bind(&user).unwrap();
    assert_eq!(rebound.action("count", ()).await.unwrap(), json!(0));

    handle.shutdown(None).await.unwrap();
    task.await.unwrap().unwrap();
    user.close(true).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn proxy_handle_invokes_behavior_directly() {
    let proxy = ProxyHandle::new(Counter::default());
    proxy
        .action("add", ActionArgs::positional([json!(5)]))
        .await
        .unwrap();
    assert_eq!(proxy.action("count", ActionArgs::none()).await.unwrap(), json!(5));
    assert_eq!(proxy.ping(None).await.unwrap(), Duration::ZERO);

    proxy.shutdown(None).await.unwrap();
    let err = proxy.action("count", ActionArgs::none()).await.unwrap_err();
    assert!(matches!(err, HandleError::AgentTerminated(_)));
    let err = proxy.shutdown(None).await.unwrap_err();
    assert!(matches!(err, HandleError::AgentTerminated(_)));
}

//! The HTTP exchange: server status-code mapping, auth, and a full
//! manager round trip over the wire.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use common::Counter;
use parley::backend::memory::MemoryBackendConfig;
use parley::domain_types::MaxMessageSize;
use parley::exchange::http::{ExchangeServerConfig, spawn_exchange_server};
use parley::exchange::{ExchangeFactory, ExchangeTransport};
use parley::message::{Message, RequestBody};
use parley::{
    AgentId, EntityId, ExchangeError, HttpExchangeFactory, LaunchOptions, MailboxStatus, Manager,
    ManagerConfig,
};

async fn spawn_server(config: ExchangeServerConfig) -> (parley::exchange::http::ExchangeServerHandle, HttpExchangeFactory) {
    let server = spawn_exchange_server(config).await.unwrap();
    let addr = server.addr();
    let factory = HttpExchangeFactory::new(addr.ip().to_string(), addr.port());
    (server, factory)
}

#[test_log::test(tokio::test)]
async fn messages_round_trip_through_the_server() {
    let (server, factory) = spawn_server(ExchangeServerConfig::default()).await;

    let user = factory.create_user_session(Some("http-user")).await.unwrap();
    let registration = user
        .register_agent(&["Echo".to_string()], None)
        .await
        .unwrap();
    let agent = factory.create_agent_session(&registration).await.unwrap();

    let request = Message::request(
        user.mailbox_id().clone(),
        agent.mailbox_id().clone(),
        Uuid::new_v4(),
        RequestBody::Ping,
    );
    user.send(request.clone()).await.unwrap();
    let received = agent.recv(Some(Duration::from_secs(2))).await.unwrap();
    assert_eq!(received.tag, request.tag);

    assert_eq!(
        user.status(agent.mailbox_id()).await.unwrap(),
        MailboxStatus::Active
    );
    let found = user.discover("Echo", true).await.unwrap();
    assert_eq!(found, vec![registration.agent_id.clone()]);

    server.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn unknown_destination_maps_to_bad_entity() {
    let (server, factory) = spawn_server(ExchangeServerConfig::default()).await;
    let user = factory.create_user_session(None).await.unwrap();

    let stranger = EntityId::from(AgentId::new(None, vec!["Ghost".to_string()]));
    let request = Message::request(
        user.mailbox_id().clone(),
        stranger.clone(),
        Uuid::new_v4(),
        RequestBody::Ping,
    );
    let err = user.send(request).await.unwrap_err();
    assert!(matches!(err, ExchangeError::BadEntity(id) if id == stranger));

    assert_eq!(
        user.status(&stranger).await.unwrap(),
        MailboxStatus::Missing
    );
    server.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn terminated_mailboxes_map_to_mailbox_terminated() {
    let (server, factory) = spawn_server(ExchangeServerConfig::default()).await;
    let user = factory.create_user_session(None).await.unwrap();
    let registration = user
        .register_agent(&["ShortLived".to_string()], None)
        .await
        .unwrap();
    let entity = EntityId::from(registration.agent_id.clone());

    user.terminate(&entity).await.unwrap();
    user.terminate(&entity).await.unwrap();
    assert_eq!(
        user.status(&entity).await.unwrap(),
        MailboxStatus::Terminated
    );

    let request = Message::request(
        user.mailbox_id().clone(),
        entity.clone(),
        Uuid::new_v4(),
        RequestBody::Ping,
    );
    let err = user.send(request).await.unwrap_err();
    assert!(matches!(err, ExchangeError::MailboxTerminated(_)));

    server.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn recv_times_out_with_request_timeout() {
    let (server, factory) = spawn_server(ExchangeServerConfig::default()).await;
    let user = factory.create_user_session(None).await.unwrap();

    let err = user.recv(Some(Duration::from_millis(200))).await.unwrap_err();
    assert!(matches!(err, ExchangeError::Timeout(_)));
    server.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn oversized_messages_map_to_message_too_large() {
    let config = ExchangeServerConfig {
        backend: MemoryBackendConfig {
            max_message_size: MaxMessageSize::try_new(1024).unwrap(),
            queue_capacity: None,
        },
        ..ExchangeServerConfig::default()
    };
    let (server, factory) = spawn_server(config).await;
    let user = factory.create_user_session(None).await.unwrap();
    let registration = user
        .register_agent(&["Big".to_string()], None)
        .await
        .unwrap();

    let request = Message::request(
        user.mailbox_id().clone(),
        EntityId::from(registration.agent_id.clone()),
        Uuid::new_v4(),
        RequestBody::Action {
            action: "swallow".to_string(),
            pargs: vec![json!("x".repeat(4096))],
            kargs: serde_json::Map::new(),
        },
    );
    let err = user.send(request).await.unwrap_err();
    match err {
        ExchangeError::MessageTooLarge { size, limit } => {
            assert!(size > limit);
            assert_eq!(limit, 1024);
        }
        other => panic!("unexpected error: {other}"),
    }
    server.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn missing_bearer_token_is_unauthorized() {
    let config = ExchangeServerConfig {
        auth_token: Some("sesame".to_string()),
        ..ExchangeServerConfig::default()
    };
    let server = spawn_exchange_server(config).await.unwrap();
    let addr = server.addr();

    let anonymous = HttpExchangeFactory::new(addr.ip().to_string(), addr.port());
    let err = anonymous.create_user_session(None).await.unwrap_err();
    assert!(matches!(err, ExchangeError::Unauthorized));

    let wrong = HttpExchangeFactory::new(addr.ip().to_string(), addr.port())
        .with_bearer_token("open says me");
    let err = wrong.create_user_session(None).await.unwrap_err();
    assert!(matches!(err, ExchangeError::Unauthorized));

    let trusted = HttpExchangeFactory::new(addr.ip().to_string(), addr.port())
        .with_bearer_token("sesame");
    let user = trusted.create_user_session(None).await.unwrap();
    assert_eq!(
        user.status(user.mailbox_id()).await.unwrap(),
        MailboxStatus::Active
    );

    server.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn factories_serialize_for_other_processes() {
    let (server, factory) = spawn_server(ExchangeServerConfig::default()).await;

    let encoded = serde_json::to_string(&factory).unwrap();
    let decoded: HttpExchangeFactory = serde_json::from_str(&encoded).unwrap();
    let user = decoded.create_user_session(None).await.unwrap();
    assert_eq!(
        user.status(user.mailbox_id()).await.unwrap(),
        MailboxStatus::Active
    );

    server.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn manager_runs_agents_over_http() {
    let (server, factory) = spawn_server(ExchangeServerConfig::default()).await;

    let manager = Manager::new(Arc::new(factory), ManagerConfig::default())
        .await
        .unwrap();
    let handle = manager
        .launch(Counter::default(), LaunchOptions::default())
        .await
        .unwrap();

    handle.action("add", vec![json!(10)]).await.unwrap();
    handle.action("add", vec![json!(-3)]).await.unwrap();
    assert_eq!(handle.action("count", ()).await.unwrap(), json!(7));
    assert!(handle.ping(Some(Duration::from_secs(5))).await.unwrap() > Duration::ZERO);

    manager.close().await.unwrap();
    server.stop().await.unwrap();
}

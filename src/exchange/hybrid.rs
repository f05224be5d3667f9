//! Hybrid direct-plus-broker exchange.
//!
//! Every session advertises a TCP listening address in Redis at
//! creation. Senders deliver straight over TCP when they can reach the
//! advertised address (cached locally, with cached live connections);
//! on any direct failure the cache is invalidated, the address is
//! re-read from Redis, and delivery falls back to the Redis indirection
//! queue. A background drain task moves indirect messages into the
//! same in-process queue that `recv` consumes, so the receiver never
//! sees which path a message took.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{Caller, MailboxBackend, RedisBackend, RedisBackendConfig};
use crate::error::ExchangeError;
use crate::exchange::{AgentRegistration, ExchangeFactory, ExchangeTransport};
use crate::identifier::{AgentId, EntityId, UserId};
use crate::mailbox::{MailboxStatus, MessageQueue, QueueError};
use crate::message::Message;
use crate::socket::{bind_listener, message_codec};
use crate::task::TaskGuard;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Factory for hybrid exchange sessions.
///
/// Serializable; carries the Redis configuration, the shared caller
/// identity, and the host sessions advertise for direct delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridExchangeFactory {
    redis: RedisBackendConfig,
    caller: Caller,
    advertise_host: String,
}

impl HybridExchangeFactory {
    /// Creates a factory for the given Redis URL, advertising loopback
    /// addresses for direct delivery.
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_config(RedisBackendConfig::new(url))
    }

    /// Creates a factory with a fully specified Redis configuration.
    pub fn with_config(redis: RedisBackendConfig) -> Self {
        Self {
            redis,
            caller: Caller::random(),
            advertise_host: "127.0.0.1".to_string(),
        }
    }

    /// Sets the host other sessions use to reach this one directly.
    #[must_use]
    pub fn with_advertise_host(mut self, host: impl Into<String>) -> Self {
        self.advertise_host = host.into();
        self
    }

    async fn open_session(&self, mailbox_id: EntityId) -> Result<HybridSession, ExchangeError> {
        let backend = Arc::new(RedisBackend::connect(self.redis.clone()).await?);
        let queue = Arc::new(MessageQueue::new(None));
        let cancel = CancellationToken::new();

        let (listener, addr) = bind_listener(&self.advertise_host, 0).await?;
        backend
            .set_address(mailbox_id.uid(), &addr.to_string())
            .await?;

        let accept_task = {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            TaskGuard::spawn("hybrid-accept", async move {
                loop {
                    let stream = tokio::select! {
                        _ = cancel.cancelled() => break,
                        accepted = listener.accept() => match accepted {
                            Ok((stream, _)) => stream,
                            Err(err) => {
                                warn!(error = %err, "direct listener accept failed");
                                continue;
                            }
                        },
                    };
                    let (read_half, _) = stream.into_split();
                    tokio::spawn(drain_connection(
                        read_half,
                        Arc::clone(&queue),
                        cancel.clone(),
                    ));
                }
            })
        };

        let drain_task = {
            let backend = Arc::clone(&backend);
            let queue = Arc::clone(&queue);
            let caller = self.caller.clone();
            let mailbox_id = mailbox_id.clone();
            let cancel = cancel.clone();
            TaskGuard::spawn("hybrid-redis-drain", async move {
                loop {
                    let result = tokio::select! {
                        _ = cancel.cancelled() => break,
                        result = backend.get(&caller, &mailbox_id, Some(Duration::from_secs(1))) => result,
                    };
                    match result {
                        Ok(message) => {
                            if queue.push(message).await.is_err() {
                                break;
                            }
                        }
                        Err(ExchangeError::Timeout(_)) => {}
                        Err(ExchangeError::MailboxTerminated(_))
                        | Err(ExchangeError::BadEntity(_)) => {
                            queue.close();
                            break;
                        }
                        Err(err) => {
                            warn!(error = %err, "indirect drain failed, retrying");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            })
        };

        Ok(HybridSession {
            backend,
            caller: self.caller.clone(),
            mailbox_id,
            queue,
            addrs: DashMap::new(),
            conns: DashMap::new(),
            cancel,
            _accept_task: accept_task,
            _drain_task: drain_task,
        })
    }
}

async fn drain_connection(
    read_half: OwnedReadHalf,
    queue: Arc<MessageQueue>,
    cancel: CancellationToken,
) {
    let mut frames = FramedRead::new(read_half, message_codec());
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(bytes)) => match Message::from_bytes(&bytes) {
                Ok(message) => {
                    if queue.push(message).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "dropping undecodable direct frame");
                }
            },
            Some(Err(err)) => {
                debug!(error = %err, "direct connection failed");
                break;
            }
            None => break,
        }
    }
}

type DirectConn = Arc<tokio::sync::Mutex<FramedWrite<OwnedWriteHalf, tokio_util::codec::LengthDelimitedCodec>>>;

struct HybridSession {
    backend: Arc<RedisBackend>,
    caller: Caller,
    mailbox_id: EntityId,
    queue: Arc<MessageQueue>,
    addrs: DashMap<Uuid, String>,
    conns: DashMap<Uuid, DirectConn>,
    cancel: CancellationToken,
    _accept_task: TaskGuard<()>,
    _drain_task: TaskGuard<()>,
}

impl HybridSession {
    async fn connect_direct(&self, uid: Uuid, addr: &str) -> Option<DirectConn> {
        let connect = TcpStream::connect(addr);
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                debug!(%addr, error = %err, "direct connect failed");
                return None;
            }
            Err(_) => {
                debug!(%addr, "direct connect timed out");
                return None;
            }
        };
        let (_, write_half) = stream.into_split();
        let conn: DirectConn = Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
            write_half,
            message_codec(),
        )));
        self.conns.insert(uid, Arc::clone(&conn));
        Some(conn)
    }

    async fn write_direct(&self, uid: Uuid, conn: &DirectConn, bytes: &[u8]) -> bool {
        let mut framed = conn.lock().await;
        match framed.send(Bytes::copy_from_slice(bytes)).await {
            Ok(()) => true,
            Err(err) => {
                debug!(error = %err, "direct write failed, invalidating cache");
                self.conns.remove(&uid);
                self.addrs.remove(&uid);
                false
            }
        }
    }

    /// Attempts direct delivery, refreshing the cached address from
    /// Redis once before giving up. Returns true when the frame was
    /// written to a live connection.
    async fn try_direct(&self, uid: Uuid, bytes: &[u8]) -> Result<bool, ExchangeError> {
        if let Some(conn) = self.conns.get(&uid).map(|c| Arc::clone(c.value())) {
            if self.write_direct(uid, &conn, bytes).await {
                return Ok(true);
            }
        }

        let cached = self.addrs.get(&uid).map(|a| a.value().clone());
        if let Some(addr) = cached {
            if let Some(conn) = self.connect_direct(uid, &addr).await {
                if self.write_direct(uid, &conn, bytes).await {
                    return Ok(true);
                }
            }
            // Cached address is stale: drop it and re-read from Redis.
            self.addrs.remove(&uid);
        }

        let Some(addr) = self.backend.get_address(uid).await? else {
            return Ok(false);
        };
        self.addrs.insert(uid, addr.clone());
        if let Some(conn) = self.connect_direct(uid, &addr).await {
            if self.write_direct(uid, &conn, bytes).await {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl ExchangeTransport for HybridSession {
    fn mailbox_id(&self) -> &EntityId {
        &self.mailbox_id
    }

    async fn register_agent(
        &self,
        ancestry: &[String],
        name: Option<&str>,
    ) -> Result<AgentRegistration, ExchangeError> {
        let agent_id = AgentId::new(name, ancestry.to_vec());
        self.backend
            .create_mailbox(&self.caller, &EntityId::from(agent_id.clone()), Some(ancestry))
            .await?;
        Ok(AgentRegistration { agent_id })
    }

    async fn send(&self, message: Message) -> Result<(), ExchangeError> {
        // Status and size are enforced against the broker even for
        // direct sends, so both paths reject the same messages.
        match self.backend.status(&self.caller, &message.dest).await? {
            MailboxStatus::Missing => {
                return Err(ExchangeError::BadEntity(message.dest.clone()));
            }
            MailboxStatus::Terminated => {
                return Err(ExchangeError::MailboxTerminated(message.dest.clone()));
            }
            MailboxStatus::Active => {}
        }

        let bytes = message.to_bytes()?;
        let limit = self.backend.max_message_size();
        if bytes.len() > limit {
            return Err(ExchangeError::MessageTooLarge {
                size: bytes.len(),
                limit,
            });
        }
        if self.try_direct(message.dest.uid(), &bytes).await? {
            return Ok(());
        }
        debug!(dest = %message.dest, "falling back to indirect delivery");
        self.backend.put(&self.caller, &message).await
    }

    async fn recv(&self, timeout: Option<Duration>) -> Result<Message, ExchangeError> {
        self.queue.pop(timeout).await.map_err(|err| match err {
            QueueError::Closed => ExchangeError::MailboxTerminated(self.mailbox_id.clone()),
            QueueError::Timeout => {
                ExchangeError::Timeout(timeout.unwrap_or(Duration::from_secs(0)))
            }
        })
    }

    async fn status(&self, entity_id: &EntityId) -> Result<MailboxStatus, ExchangeError> {
        self.backend.status(&self.caller, entity_id).await
    }

    async fn terminate(&self, entity_id: &EntityId) -> Result<(), ExchangeError> {
        self.backend.terminate(&self.caller, entity_id).await?;
        if *entity_id == self.mailbox_id {
            self.queue.close();
        }
        Ok(())
    }

    async fn discover(
        &self,
        behavior: &str,
        include_subclasses: bool,
    ) -> Result<Vec<AgentId>, ExchangeError> {
        self.backend
            .discover(&self.caller, behavior, include_subclasses)
            .await
    }

    async fn close(&self) -> Result<(), ExchangeError> {
        self.cancel.cancel();
        self.backend.clear_address(self.mailbox_id.uid()).await?;
        self.conns.clear();

        // Messages already pulled into the local queue but never
        // received go back to the broker so a later session (e.g. a
        // restarted agent) still sees them.
        if !self.queue.is_closed() {
            for message in self.queue.drain() {
                if let Err(err) = self.backend.put(&self.caller, &message).await {
                    warn!(error = %err, "failed to requeue undelivered message");
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ExchangeFactory for HybridExchangeFactory {
    async fn create_user_session(
        &self,
        name: Option<&str>,
    ) -> Result<Box<dyn ExchangeTransport>, ExchangeError> {
        let backend = RedisBackend::connect(self.redis.clone()).await?;
        let entity_id = EntityId::from(UserId::new(name));
        backend
            .create_mailbox(&self.caller, &entity_id, None)
            .await?;
        Ok(Box::new(self.open_session(entity_id).await?))
    }

    async fn create_agent_session(
        &self,
        registration: &AgentRegistration,
    ) -> Result<Box<dyn ExchangeTransport>, ExchangeError> {
        let entity_id = EntityId::from(registration.agent_id.clone());
        Ok(Box::new(self.open_session(entity_id).await?))
    }
}

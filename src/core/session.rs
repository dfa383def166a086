/// Per-client relay session.
///
/// Each accepted client runs one `Session` on its own task: startup frame,
/// optional SSL probe, credential validation, the proxied authentication
/// exchange, and then the serving loop that routes every query to a pooled
/// backend and drains the response back. Queries inside a client-delimited
/// block stay pinned to one backend connection; everything else draws a
/// fresh backend per query.
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use log::{debug, error, info};

use crate::config::Credentials;
use crate::core::auth;
use crate::core::connect::{self, ProxyStream};
use crate::core::pool::{BackendConnection, ConnectionPool, PoolRegistry};
use crate::core::tls::StreamUpgrader;
use crate::core::Node;
use crate::error::{ProxyError, ProxyResult};
use crate::protocol;
use crate::stats::StatsRegistry;
use crate::utils;

/// Shared services injected into every session worker.
pub struct SessionContext {
    pub registry: Arc<PoolRegistry>,
    pub stats: Arc<StatsRegistry>,
    pub credentials: Credentials,
    pub primary: Node,
    pub upgrader: Arc<dyn StreamUpgrader>,
    /// Optional deadline on backend reads during a response drain.
    pub backend_read_timeout: Option<Duration>,
}

/// A backend held by the session, together with the pool it came from.
struct Pinned {
    pool: Arc<ConnectionPool>,
    connection: BackendConnection,
}

pub struct Session {
    id: String,
    client_addr: String,
    context: Arc<SessionContext>,
    bytes_to_backend: u64,
    bytes_to_client: u64,
}

impl Session {
    pub fn new(context: Arc<SessionContext>, client_addr: String) -> Self {
        Self {
            id: utils::generate_id("session"),
            client_addr,
            context,
            bytes_to_backend: 0,
            bytes_to_client: 0,
        }
    }

    /// Drive the client connection from startup through termination.
    pub async fn run(mut self, client: ProxyStream) {
        let started = Instant::now();
        debug!("Client {}: new session {}", self.client_addr, self.id);

        match self.handle(client).await {
            Ok(()) => info!(
                "Client {}: session closed after {} ({} to backends, {} to client)",
                self.client_addr,
                utils::format_duration(started.elapsed()),
                utils::format_bytes(self.bytes_to_backend),
                utils::format_bytes(self.bytes_to_client),
            ),
            Err(err) => error!("Client {}: session failed: {}", self.client_addr, err),
        }
    }

    async fn handle(&mut self, mut client: ProxyStream) -> ProxyResult<()> {
        let mut startup = connect::receive(&mut client).await?;

        // An SSL request in place of the startup frame gets a one-byte
        // answer; the real startup frame follows on the (possibly upgraded)
        // connection. A client hanging up on the answer is a normal outcome.
        if protocol::get_version(&startup) == protocol::SSL_REQUEST_CODE {
            client = connect::answer_ssl_probe(
                client,
                &self.context.credentials.ssl,
                self.context.upgrader.as_ref(),
            )
            .await?;

            startup = match connect::receive(&mut client).await {
                Ok(message) => message,
                Err(err) if err.is_disconnect() => {
                    info!("Client {}: closed the connection", self.client_addr);
                    return Ok(());
                }
                Err(err) => return Err(err),
            };
        }

        if !auth::validate_client(&startup, &self.context.credentials) {
            let message = protocol::create_error_message(
                protocol::ERROR_SEVERITY_FATAL,
                protocol::ERROR_CODE_INVALID_AUTHORIZATION,
                "could not validate user/database",
            );
            connect::send(&mut client, &message).await?;
            return Err(ProxyError::auth("could not validate client"));
        }

        info!("Client {}: authenticating", self.client_addr);
        let exchange = auth::authenticate_client(
            &mut client,
            &startup,
            &self.context.primary,
            &self.context.credentials,
            self.context.upgrader.as_ref(),
        )
        .await;

        match exchange {
            Ok(true) => {
                debug!("Client {}: authentication successful", self.client_addr)
            }
            Ok(false) => {
                return Err(ProxyError::auth(format!(
                    "client {} failed authentication",
                    self.client_addr
                )))
            }
            Err(err) if err.is_disconnect() => return Ok(()),
            Err(err) => return Err(err),
        }

        self.serve(client).await
    }

    /// The serving loop: read client frames, route queries, drain responses.
    async fn serve(&mut self, mut client: ProxyStream) -> ProxyResult<()> {
        let mut in_block = false;
        let mut pinned: Option<Pinned> = None;

        loop {
            let message = match connect::receive(&mut client).await {
                Ok(message) => message,
                Err(err) if err.is_disconnect() => {
                    info!("Client {}: closed the connection", self.client_addr);
                    break;
                }
                Err(err) => {
                    error!(
                        "Client {}: error reading from client: {}",
                        self.client_addr, err
                    );
                    break;
                }
            };

            match protocol::get_message_type(&message) {
                protocol::TERMINATE_MESSAGE_TYPE => {
                    info!("Client {}: disconnected", self.client_addr);
                    break;
                }
                protocol::QUERY_MESSAGE_TYPE => {
                    let annotations = protocol::query_annotations(&message);

                    let mut ends_block = false;
                    if annotations.begin {
                        in_block = true;
                    } else if annotations.end {
                        ends_block = true;
                        in_block = false;
                    }
                    let read = annotations.read_only;

                    // Reuse the pinned backend only inside a block (or for
                    // the query closing it); otherwise draw a fresh one. The
                    // pool goes back into rotation as soon as the
                    // connection is drawn.
                    if pinned.is_none() || (!in_block && !ends_block) {
                        let pool = self.context.registry.acquire_pool(read).await;
                        let connection = pool.acquire().await;
                        self.context
                            .registry
                            .release_pool(Arc::clone(&pool), read)
                            .await;
                        pinned = Some(Pinned { pool, connection });
                    }

                    let Some(current) = pinned.as_mut() else {
                        return Err(ProxyError::internal("no backend pinned for query"));
                    };

                    // counted before the forward it accounts for
                    self.context.stats.increment(current.connection.node_name());
                    tracing::debug!(
                        session = %self.id,
                        node = current.connection.node_name(),
                        in_block,
                        read,
                        "relaying query"
                    );

                    self.bytes_to_backend += message.len() as u64;
                    let relayed = match connect::send(&mut current.connection.stream, &message)
                        .await
                    {
                        Ok(()) => self.drain_response(&mut client, &mut current.connection).await,
                        Err(err) => {
                            debug!(
                                "Client {}: error sending query to backend '{}': {}",
                                self.client_addr,
                                current.connection.node_name(),
                                err
                            );
                            false
                        }
                    };

                    if !relayed {
                        // a half-broken connection is dropped, never pooled
                        pinned = None;
                    } else if !in_block {
                        if let Some(Pinned { pool, connection }) = pinned.take() {
                            pool.release(connection).await;
                        }
                    }
                }
                other => {
                    tracing::debug!(
                        session = %self.id,
                        message_type = other,
                        "ignoring frame"
                    );
                }
            }
        }

        // the session owns at most one backend; give it back before closing
        if let Some(Pinned { pool, connection }) = pinned.take() {
            pool.release(connection).await;
        }

        Ok(())
    }

    /// Forward backend frames to the client until the last frame scanned in
    /// a chunk carries the ready-for-query tag. Chunks may batch several
    /// frames; a ready marker anywhere else in the batch does not terminate
    /// the drain. Returns false when the response could not be drained to
    /// completion.
    async fn drain_response(
        &mut self,
        client: &mut ProxyStream,
        backend: &mut BackendConnection,
    ) -> bool {
        loop {
            let chunk = match self.receive_from_backend(&mut backend.stream).await {
                Ok(chunk) => chunk,
                Err(err) => {
                    debug!(
                        "Client {}: error receiving response from backend '{}': {}",
                        self.client_addr,
                        backend.node_name(),
                        err
                    );
                    return false;
                }
            };

            let last = protocol::last_message_type(&chunk);
            self.bytes_to_client += chunk.len() as u64;

            if let Err(err) = connect::send(client, &chunk).await {
                debug!(
                    "Client {}: error sending response to client: {}",
                    self.client_addr, err
                );
                return false;
            }

            if last == Some(protocol::READY_FOR_QUERY_MESSAGE_TYPE) {
                return true;
            }
        }
    }

    async fn receive_from_backend(&self, stream: &mut ProxyStream) -> ProxyResult<BytesMut> {
        match self.context.backend_read_timeout {
            Some(deadline) => {
                match tokio::time::timeout(deadline, connect::receive(stream)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProxyError::timeout("backend response read")),
                }
            }
            None => connect::receive(stream).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SslConfig;
    use crate::core::tls::NoUpgrade;
    use crate::core::NodeRole;
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn test_context(registry: Arc<PoolRegistry>, stats: Arc<StatsRegistry>) -> Arc<SessionContext> {
        Arc::new(SessionContext {
            registry,
            stats,
            credentials: Credentials {
                username: "app".to_string(),
                password: "secret".to_string(),
                database: "inventory".to_string(),
                options: HashMap::new(),
                ssl: SslConfig { enable: false },
            },
            primary: Node {
                name: "primary".to_string(),
                role: NodeRole::Primary,
                host_port: "127.0.0.1:5432".to_string(),
            },
            upgrader: Arc::new(NoUpgrade),
            backend_read_timeout: None,
        })
    }

    /// Minimal backend: answers every 'Q' frame with a CommandComplete and
    /// a ReadyForQuery in one batch, tagged with this backend's label.
    async fn mock_backend(mut stream: DuplexStream, label: &'static str) {
        let mut buffer = [0u8; 4096];
        loop {
            let read = match stream.read(&mut buffer).await {
                Ok(0) | Err(_) => return,
                Ok(read) => read,
            };
            if buffer[..read][0] != protocol::QUERY_MESSAGE_TYPE {
                continue;
            }

            let mut tag = label.as_bytes().to_vec();
            tag.push(0);
            let mut response = vec![b'C'];
            response.extend_from_slice(&((tag.len() + 4) as i32).to_be_bytes());
            response.extend_from_slice(&tag);
            response.push(protocol::READY_FOR_QUERY_MESSAGE_TYPE);
            response.extend_from_slice(&5i32.to_be_bytes());
            response.push(b'I');

            if stream.write_all(&response).await.is_err() {
                return;
            }
        }
    }

    async fn seed_pool(name: &str, labels: &[&'static str]) -> Arc<ConnectionPool> {
        let pool = Arc::new(ConnectionPool::new(name.to_string(), labels.len()));
        for label in labels {
            let (near, far) = tokio::io::duplex(16 * 1024);
            tokio::spawn(mock_backend(far, label));
            pool.add(BackendConnection::new(Box::new(near), name.to_string()))
                .await;
        }
        pool
    }

    fn query_frame(sql: &str) -> Vec<u8> {
        let mut frame = vec![protocol::QUERY_MESSAGE_TYPE];
        frame.extend_from_slice(&((sql.len() + 5) as i32).to_be_bytes());
        frame.extend_from_slice(sql.as_bytes());
        frame.push(0);
        frame
    }

    fn terminate_frame() -> Vec<u8> {
        let mut frame = vec![protocol::TERMINATE_MESSAGE_TYPE];
        frame.extend_from_slice(&4i32.to_be_bytes());
        frame
    }

    /// Send one query and read the relayed response; returns the backend
    /// label extracted from the CommandComplete payload.
    async fn round_trip(client: &mut DuplexStream, sql: &str) -> String {
        client.write_all(&query_frame(sql)).await.unwrap();

        let mut buffer = [0u8; 4096];
        let read = client.read(&mut buffer).await.unwrap();
        let response = &buffer[..read];
        assert_eq!(
            protocol::last_message_type(response),
            Some(protocol::READY_FOR_QUERY_MESSAGE_TYPE)
        );

        let payload_len = protocol::get_message_length(response) as usize - 4;
        String::from_utf8_lossy(&response[5..5 + payload_len - 1]).to_string()
    }

    async fn wait_for_size(pool: &Arc<ConnectionPool>, size: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while pool.size().await != size {
            assert!(Instant::now() < deadline, "pool never reached size {}", size);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn spawn_session(
        context: Arc<SessionContext>,
    ) -> (DuplexStream, tokio::task::JoinHandle<()>) {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let handle = tokio::spawn(async move {
            let mut session = Session::new(context, "test-client".to_string());
            session
                .serve(Box::new(server))
                .await
                .expect("serve failed");
        });
        (client, handle)
    }

    #[tokio::test]
    async fn test_reads_route_to_replicas_and_writes_to_primary() {
        let registry = Arc::new(PoolRegistry::new());
        let primary = seed_pool("primary", &["p1"]).await;
        let replica = seed_pool("replica1", &["r1"]).await;
        registry
            .add_pool(NodeRole::Primary, Arc::clone(&primary))
            .await;
        registry
            .add_pool(NodeRole::Replica, Arc::clone(&replica))
            .await;

        let stats = Arc::new(StatsRegistry::new());
        let (mut client, handle) =
            spawn_session(test_context(Arc::clone(&registry), Arc::clone(&stats))).await;

        let label = round_trip(&mut client, "/* read */ SELECT 1").await;
        assert_eq!(label, "r1");

        let label = round_trip(&mut client, "UPDATE t SET x = 1").await;
        assert_eq!(label, "p1");

        assert_eq!(stats.count("replica1"), 1);
        assert_eq!(stats.count("primary"), 1);

        client.write_all(&terminate_frame()).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_backend_released_after_each_query_outside_block() {
        let registry = Arc::new(PoolRegistry::new());
        let primary = seed_pool("primary", &["p1", "p2"]).await;
        registry
            .add_pool(NodeRole::Primary, Arc::clone(&primary))
            .await;

        let stats = Arc::new(StatsRegistry::new());
        let (mut client, handle) =
            spawn_session(test_context(Arc::clone(&registry), Arc::clone(&stats))).await;

        let first = round_trip(&mut client, "SELECT 1").await;
        wait_for_size(&primary, 2).await;
        let second = round_trip(&mut client, "SELECT 2").await;
        wait_for_size(&primary, 2).await;

        // FIFO rotation over a two-connection pool alternates backends
        assert_ne!(first, second);
        assert_eq!(stats.count("primary"), 2);

        client.write_all(&terminate_frame()).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_block_pins_one_backend_until_end() {
        let registry = Arc::new(PoolRegistry::new());
        let primary = seed_pool("primary", &["p1", "p2"]).await;
        registry
            .add_pool(NodeRole::Primary, Arc::clone(&primary))
            .await;

        let stats = Arc::new(StatsRegistry::new());
        let (mut client, handle) =
            spawn_session(test_context(Arc::clone(&registry), Arc::clone(&stats))).await;

        let begin = round_trip(&mut client, "/* start */ BEGIN").await;
        // still pinned between statements
        wait_for_size(&primary, 1).await;
        let inside = round_trip(&mut client, "UPDATE t SET x = 1").await;
        let end = round_trip(&mut client, "/* end */ COMMIT").await;

        assert_eq!(begin, inside);
        assert_eq!(begin, end);
        assert_eq!(stats.count("primary"), 3);

        // released only once the block closed
        wait_for_size(&primary, 2).await;

        client.write_all(&terminate_frame()).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_non_query_frames_do_not_count_or_route() {
        let registry = Arc::new(PoolRegistry::new());
        let primary = seed_pool("primary", &["p1"]).await;
        registry
            .add_pool(NodeRole::Primary, Arc::clone(&primary))
            .await;

        let stats = Arc::new(StatsRegistry::new());
        let (mut client, handle) =
            spawn_session(test_context(Arc::clone(&registry), Arc::clone(&stats))).await;

        // a stray password frame is ignored by the serving loop
        let mut stray = vec![protocol::PASSWORD_MESSAGE_TYPE];
        stray.extend_from_slice(&9i32.to_be_bytes());
        stray.extend_from_slice(b"boop\0");
        client.write_all(&stray).await.unwrap();

        // keep the terminate frame out of the stray frame's read
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.write_all(&terminate_frame()).await.unwrap();
        handle.await.unwrap();

        assert!(stats.snapshot().is_empty());
        assert_eq!(primary.size().await, 1);
    }

    #[tokio::test]
    async fn test_broken_backend_is_discarded_not_pooled() {
        let registry = Arc::new(PoolRegistry::new());
        let primary = Arc::new(ConnectionPool::new("primary".to_string(), 2));

        // first backend dies without answering; second one works
        let (near, far) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            let mut stream = far;
            let mut buffer = [0u8; 4096];
            let _ = stream.read(&mut buffer).await;
            // hang up mid-response
        });
        primary
            .add(BackendConnection::new(Box::new(near), "primary".to_string()))
            .await;

        let (near, far) = tokio::io::duplex(16 * 1024);
        tokio::spawn(mock_backend(far, "p2"));
        primary
            .add(BackendConnection::new(Box::new(near), "primary".to_string()))
            .await;

        registry
            .add_pool(NodeRole::Primary, Arc::clone(&primary))
            .await;

        let stats = Arc::new(StatsRegistry::new());
        let (mut client, handle) =
            spawn_session(test_context(Arc::clone(&registry), Arc::clone(&stats))).await;

        // the first query hits the dying backend; no response comes back
        client.write_all(&query_frame("SELECT 1")).await.unwrap();

        // the broken connection is discarded, shrinking the pool to the
        // one healthy backend
        wait_for_size(&primary, 1).await;

        let label = round_trip(&mut client, "SELECT 2").await;
        assert_eq!(label, "p2");

        // only the healthy backend returns to the free set
        wait_for_size(&primary, 1).await;

        client.write_all(&terminate_frame()).await.unwrap();
        handle.await.unwrap();
        assert_eq!(primary.size().await, 1);
    }
}

//! TCP sensor-simulation server.
//!
//! Accepts clients and answers every `GET_DATA` line with one freshly sampled
//! four-quantity reading. Each connection is served by its own tokio task
//! with its own [`Responder`] and sensor source. A semaphore caps how many
//! connections are served at once; further clients wait in the listen backlog
//! until a slot frees up.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::Semaphore;

use sensorlink_core::responder::{RandomSensors, Responder, SensorSource};

/// Bytes read from a client per call.
pub const READ_BUFFER: usize = 1024;

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    /// Connections served concurrently.
    pub max_connections: usize,
    /// Seed for reproducible readings; each connection derives its own stream.
    pub seed: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            backlog: 10,
            max_connections: 64,
            seed: None,
        }
    }
}

/// A bound, listening server.
pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
}

impl Server {
    /// Bind with `SO_REUSEADDR` and start listening.
    pub async fn bind(config: ServerConfig) -> io::Result<Self> {
        if config.max_connections == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "max_connections must be at least 1",
            ));
        }

        let addr = tokio::net::lookup_host((config.host.as_str(), config.port))
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("no address for {}:{}", config.host, config.port),
                )
            })?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(config.backlog)?;
        info!("sensor server listening on {}", listener.local_addr()?);

        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve forever with random sensors (seeded per connection when configured).
    pub async fn run(self) -> io::Result<()> {
        let seed = self.config.seed;
        self.run_with(move |conn_id| match seed {
            Some(seed) => RandomSensors::seeded(seed.wrapping_add(conn_id)),
            None => RandomSensors::from_entropy(),
        })
        .await
    }

    /// Serve forever, building each connection's source with `make_source`.
    ///
    /// `make_source` receives a connection counter starting at 0.
    pub async fn run_with<F, S>(self, mut make_source: F) -> io::Result<()>
    where
        F: FnMut(u64) -> S,
        S: SensorSource + 'static,
    {
        let limit = Arc::new(Semaphore::new(self.config.max_connections));
        let mut next_id: u64 = 0;

        loop {
            let permit = Arc::clone(&limit)
                .acquire_owned()
                .await
                .map_err(|_| io::Error::other("connection limiter closed"))?;

            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!("set_nodelay failed for {peer}: {e}");
            }

            let conn_id = next_id;
            next_id += 1;
            info!("client {peer} connected (connection {conn_id})");

            let responder = Responder::new(make_source(conn_id));
            tokio::spawn(async move {
                let _permit = permit;
                match serve_connection(stream, responder).await {
                    Ok(replies) => info!("client {peer} disconnected after {replies} replies"),
                    Err(e) => warn!("client {peer} dropped: {e}"),
                }
            });
        }
    }
}

/// Answer requests on one connection until the client closes it.
///
/// Returns the number of readings sent.
pub async fn serve_connection<T, S>(mut stream: T, mut responder: Responder<S>) -> io::Result<u64>
where
    T: AsyncRead + AsyncWrite + Unpin,
    S: SensorSource,
{
    let mut buf = [0u8; READ_BUFFER];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let reply = responder.handle(&buf[..n]);
        if !reply.is_empty() {
            stream.write_all(&reply).await?;
        }
    }
    Ok(responder.replies())
}

/// Bind and serve with `config` until the task is dropped.
pub async fn run_server(config: ServerConfig) -> io::Result<()> {
    Server::bind(config).await?.run().await
}

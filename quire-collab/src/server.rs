//! WebSocket front end for the room registry.
//!
//! ```text
//! Client A ──┐  /room/{room_id}
//!            ├────────────────────► RoomRegistry ── Room ── SharedDocument
//! Client B ──┘  /session/{format}/{type}/{path}        │
//!                (path indexed to a file id first)      └── BroadcastGroup
//! ```
//!
//! Each connection runs in its own task and becomes one [`WsChannel`]
//! attached to one room. Adding `?access=read` to the URL gives the
//! connection read-only permissions.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

use crate::channel::WsChannel;
use crate::config::ServerConfig;
use crate::contents::FileFormat;
use crate::permissions::Permissions;
use crate::registry::RoomRegistry;

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
}

/// Where a connection wants to go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Room(String),
    Session {
        format: FileFormat,
        doc_type: String,
        path: String,
    },
}

impl Route {
    pub fn parse(path: &str) -> Option<Self> {
        if let Some(id) = path.strip_prefix("/room/") {
            return (!id.is_empty()).then(|| Route::Room(id.to_string()));
        }
        let rest = path.strip_prefix("/session/")?;
        let mut parts = rest.splitn(3, '/');
        let format = FileFormat::parse(parts.next()?)?;
        let doc_type = parts.next().filter(|t| !t.is_empty())?;
        let path = parts.next().filter(|p| !p.is_empty())?;
        Some(Route::Session {
            format,
            doc_type: doc_type.to_string(),
            path: path.to_string(),
        })
    }
}

fn permissions_for(query: Option<&str>) -> Permissions {
    let read_only = query.is_some_and(|q| {
        q.split('&').any(|pair| pair == "access=read")
    });
    if read_only {
        Permissions::read_only()
    } else {
        Permissions::unrestricted()
    }
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, registry: Arc<RoomRegistry>) -> Self {
        Self {
            config,
            registry,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Bind the configured address and serve connections forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        log::info!("Sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!("Accept failed: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<RoomRegistry>,
        stats: Arc<AtomicServerStats>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let target: Arc<Mutex<Option<(Route, Permissions)>>> = Arc::new(Mutex::new(None));
        let target_c = target.clone();
        let stats_c = stats.clone();

        let ws = accept_hdr_async(stream, move |req: &Request, resp: Response| {
            let uri = req.uri();
            match Route::parse(uri.path()) {
                Some(route) => {
                    *target_c.lock() = Some((route, permissions_for(uri.query())));
                    Ok(resp)
                }
                None => {
                    log::warn!("Rejecting connection to unknown route {}", uri.path());
                    stats_c.rejected_connections.fetch_add(1, Ordering::Relaxed);
                    let mut response = ErrorResponse::new(Some("Not Found".to_string()));
                    *response.status_mut() = StatusCode::NOT_FOUND;
                    Err(response)
                }
            }
        })
        .await?;

        let Some((route, permissions)) = target.lock().take() else {
            return Ok(());
        };
        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("WebSocket connection established from {addr}");

        let channel = WsChannel::new(addr.to_string(), ws);
        let result = Self::route(&registry, route, &channel, permissions).await;
        channel.close().await;

        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Connection closed from {addr}");
        result
    }

    async fn route(
        registry: &RoomRegistry,
        route: Route,
        channel: &WsChannel<TcpStream>,
        permissions: Permissions,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let room_id = match route {
            Route::Room(id) => id,
            Route::Session {
                format,
                doc_type,
                path,
            } => registry.open_session(&path, format, &doc_type).await?,
        };
        registry.serve(&room_id, channel, permissions).await?;
        Ok(())
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.stats.rejected_connections.load(Ordering::Relaxed),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoomConfig;
    use crate::contents::FsContents;
    use crate::protocol::{Message, SyncMessage};
    use crate::room::RoomServices;
    use futures_util::StreamExt;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    #[test]
    fn test_parse_routes() {
        assert_eq!(
            Route::parse("/room/json:notebook:abc"),
            Some(Route::Room("json:notebook:abc".into()))
        );
        assert_eq!(
            Route::parse("/session/text/file/docs/readme.md"),
            Some(Route::Session {
                format: FileFormat::Text,
                doc_type: "file".into(),
                path: "docs/readme.md".into(),
            })
        );
        assert_eq!(Route::parse("/room/"), None);
        assert_eq!(Route::parse("/session/yaml/file/a"), None);
        assert_eq!(Route::parse("/session/text//a"), None);
        assert_eq!(Route::parse("/elsewhere"), None);
    }

    #[test]
    fn test_read_only_query() {
        assert!(permissions_for(None).can_write());
        assert!(permissions_for(Some("x=1")).can_write());
        assert!(!permissions_for(Some("x=1&access=read")).can_write());
    }

    #[tokio::test]
    async fn test_client_receives_step1_over_websocket() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RoomRegistry::new(
            RoomServices::new(Arc::new(FsContents::new(dir.path()))),
            RoomConfig::for_testing(),
        );
        let server = Arc::new(SyncServer::new(ServerConfig::default(), registry.clone()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = {
            let server = server.clone();
            tokio::spawn(async move {
                let _ = server.serve(listener).await;
            })
        };

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/room/lobby"))
            .await
            .unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let WsMessage::Binary(data) = frame else {
            panic!("expected a binary frame, got {frame:?}");
        };
        assert!(matches!(
            Message::decode(&data).unwrap(),
            Message::Sync(SyncMessage::Step1(_))
        ));
        assert!(registry.get("lobby").is_some());
        assert_eq!(server.stats().active_connections, 1);

        assert!(tokio_tungstenite::connect_async(format!("ws://{addr}/nowhere"))
            .await
            .is_err());

        task.abort();
        registry.shutdown().await;
    }
}

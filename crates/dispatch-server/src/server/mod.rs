//! The app shell: wires the topology, registry, compiled pipelines, and
//! router together, owns the socket accept path, and sequences graceful
//! shutdown.

mod admission;

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use dispatch_core::transport::{CloseReason, Connection, TransportConfig, WaitGroup, WaitPermit};
use dispatch_core::{compile, CoreOptions, PermissionRegistry, Registry, TopologyStore};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tracing::{error, info, warn};

use crate::config::{ConnectionLimitSettings, Settings};
use crate::error::ServerError;
use crate::router::EventRouter;

use admission::{admit, Admission};

/// How long shutdown waits for connection tasks to drain.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// State shared with every accept task.
struct AcceptContext {
    topology: Arc<TopologyStore>,
    router: Arc<EventRouter>,
    permissions: Arc<PermissionRegistry>,
    jwt_secret: String,
    limit: ConnectionLimitSettings,
    transport: TransportConfig,
}

/// The dispatch server application.
///
/// Construction registers permissions and the core component set and
/// compiles every configured pipeline; any failure there is a startup
/// failure. [`App::run`] then accepts sockets until shutdown.
pub struct App {
    context: Arc<AcceptContext>,
    address: String,
    listener: Option<TcpListener>,
    shutdown_tx: broadcast::Sender<()>,
    wait_group: WaitGroup,
}

/// Cheap handle for requesting shutdown from another task.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(());
    }
}

impl App {
    pub fn new(settings: Settings) -> Result<Self, ServerError> {
        let read_timeout = settings
            .transport
            .read_timeout()
            .map_err(ServerError::Config)?;
        let address = crate::config::normalize_address(&settings.server.address);

        let permissions = Arc::new(PermissionRegistry::new());
        for name in &settings.permissions {
            permissions.register(name)?;
        }
        info!(total_permissions = permissions.count(), "permission registry loaded");

        let topology = Arc::new(TopologyStore::new());
        let registry = Arc::new(Registry::new());
        registry.register_core(CoreOptions {
            jwt_secret: settings.server.auth.jwt_secret.clone(),
        })?;

        let pipelines = compile(&settings.events, &registry)?;
        info!(total_pipelines = pipelines.len(), "event pipelines compiled");

        let router = Arc::new(EventRouter::new(topology.clone(), registry, pipelines));
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            context: Arc::new(AcceptContext {
                topology,
                router,
                permissions,
                jwt_secret: settings.server.auth.jwt_secret,
                limit: settings.server.connection_limit,
                transport: TransportConfig { read_timeout },
            }),
            address,
            listener: None,
            shutdown_tx,
            wait_group: WaitGroup::new(),
        })
    }

    /// Binds the listener and returns the bound address.
    pub async fn bind(&mut self) -> Result<SocketAddr, ServerError> {
        let listener = TcpListener::bind(&self.address)
            .await
            .map_err(|err| ServerError::Network(format!("bind {} failed: {err}", self.address)))?;
        let addr = listener
            .local_addr()
            .map_err(|err| ServerError::Network(err.to_string()))?;
        self.listener = Some(listener);
        info!(address = %addr, "server listening");
        Ok(addr)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Accepts connections until shutdown is requested, then runs the
    /// graceful shutdown sequence: stop accepting, close every user's
    /// transports, and wait for connection tasks under a deadline.
    pub async fn run(mut self) -> Result<(), ServerError> {
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => {
                self.bind().await?;
                self.listener.take().expect("bind stores the listener")
            }
        };

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        let context = self.context.clone();
                        let permit = self.wait_group.permit();
                        tokio::spawn(async move {
                            handle_socket(context, stream, remote_addr, permit).await;
                        });
                    }
                    Err(err) => {
                        error!(%err, "failed to accept connection");
                    }
                }
            }
        }

        // Stop accepting before tearing existing connections down.
        drop(listener);

        info!("closing all active connections");
        for user in self.context.topology.all_users() {
            for conn_id in user.connections {
                if let Some(conn) = self.context.topology.get_connection(conn_id) {
                    conn.transport.close(CloseReason::ServerShutdown);
                }
            }
        }

        match timeout(SHUTDOWN_DEADLINE, self.wait_group.wait()).await {
            Ok(()) => info!("server shut down gracefully"),
            Err(_) => warn!(
                deadline_secs = SHUTDOWN_DEADLINE.as_secs(),
                "shutdown deadline exceeded with connection tasks still running"
            ),
        }
        Ok(())
    }
}

/// Drives one accepted TCP stream through admission, upgrade, registration,
/// and pump startup.
async fn handle_socket(
    context: Arc<AcceptContext>,
    stream: TcpStream,
    remote_addr: SocketAddr,
    permit: WaitPermit,
) {
    let admission: Arc<OnceLock<Admission>> = Arc::new(OnceLock::new());

    let callback = {
        let context = context.clone();
        let admission = admission.clone();
        move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            info!(
                method = %request.method(),
                uri = %request.uri(),
                remote_addr = %remote_addr,
                "incoming upgrade request"
            );
            match admit(
                request,
                &context.topology,
                &context.permissions,
                &context.jwt_secret,
                &context.limit,
            ) {
                Ok(admitted) => {
                    let _ = admission.set(admitted);
                    Ok(response)
                }
                Err(rejection) => {
                    warn!(remote_addr = %remote_addr, %rejection, "upgrade request rejected");
                    Err(rejection.into_response())
                }
            }
        }
    };

    let ws_stream = match accept_hdr_async(stream, callback).await {
        Ok(ws_stream) => ws_stream,
        Err(err) => {
            warn!(remote_addr = %remote_addr, %err, "websocket handshake failed");
            return;
        }
    };
    let Some(admission) = admission.get().cloned() else {
        error!(remote_addr = %remote_addr, "handshake succeeded without admission metadata");
        return;
    };

    let conn = Connection::new(context.transport);
    let handle = conn.handle();

    if let Err(err) = context
        .topology
        .register_connection(handle.clone(), &remote_addr.ip().to_string())
    {
        error!(remote_addr = %remote_addr, %err, "failed to register connection");
        handle.close(CloseReason::Transport(err.to_string()));
        return;
    }
    if let Err(err) = context.topology.associate_user(
        handle.id(),
        &admission.user_id,
        admission.global_permissions,
    ) {
        error!(user_id = %admission.user_id, %err, "failed to associate user with connection");
        handle.close(CloseReason::Transport(err.to_string()));
        return;
    }

    let router = context.router.clone();
    conn.set_message_handler(Arc::new(move |conn_id, raw| {
        router.handle_message(conn_id, &raw);
    }));

    let topology = context.topology.clone();
    conn.set_close_handler(Arc::new(move |conn_id, reason| {
        info!(conn_id = %conn_id, %reason, "deregistering connection due to closure");
        topology.deregister_connection(conn_id);
    }));

    info!(user_id = %admission.user_id, conn_id = %handle.id(), remote_addr = %remote_addr,
        "user connection fully established");
    conn.spawn(ws_stream, permit);
}

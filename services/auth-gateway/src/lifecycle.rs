//! Startup and shutdown sequencing for the gateway.
//!
//! `Init -> Serving -> Draining -> Stopped`. Startup builds the token registry,
//! connects the session validator and only then binds the listener. Shutdown
//! stops accepting connections, lets open connections finish their current
//! request within a bounded grace period, aborts whatever is left and releases
//! the validator last. No handler runs once the coordinator reports `Stopped`.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::connect_info::ConnectInfo;
use axum::Router;
use common_session::{SessionValidator, ValidatorError};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::Request;
use hyper_util::rt::{TokioIo, TokioTimer};
use once_cell::sync::OnceCell;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tower::Service;

use crate::tokens::{RegistryError, Token, TokenRegistry};
use crate::{build_router, AppState};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Init,
    Serving,
    Draining,
    Stopped,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Init => "init",
            LifecycleState::Serving => "serving",
            LifecycleState::Draining => "draining",
            LifecycleState::Stopped => "stopped",
        }
    }
}

/// How the serving path ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Every open connection finished inside the grace period.
    Graceful,
    /// The grace period elapsed and remaining connections were aborted.
    Forced,
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid token configuration: {0}")]
    Registry(#[from] RegistryError),
    #[error("unable to connect to the session validator: {0}")]
    Connect(#[source] ValidatorError),
    #[error("unable to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("failed to close the session validator: {0}")]
    CloseValidator(#[source] ValidatorError),
    #[error("HTTP listener failed: {0}")]
    Serve(#[source] io::Error),
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Startup(#[from] StartupError),
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}

/// What the coordinator needs to bring the gateway up.
#[derive(Debug, Clone)]
pub struct Startup {
    pub tokens: Vec<Token>,
    pub listen_addr: SocketAddr,
    pub session_cookie: String,
}

/// Owns the validator connection and drives the lifecycle state machine.
pub struct Coordinator {
    state: watch::Sender<LifecycleState>,
    grace: Duration,
    local_addr: OnceCell<SocketAddr>,
}

impl Coordinator {
    pub fn new(grace: Duration) -> Self {
        let (state, _) = watch::channel(LifecycleState::Init);
        Self {
            state,
            grace,
            local_addr: OnceCell::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Address the listener is bound to, once serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Run the gateway until `shutdown` resolves.
    ///
    /// `connect` is only invoked once the registry is valid; the listener is
    /// only bound once `connect` succeeded. Startup failures leave the state at
    /// `Init`.
    pub async fn run<C, Fut, S>(
        &self,
        startup: Startup,
        connect: C,
        shutdown: S,
    ) -> Result<StopOutcome, LifecycleError>
    where
        C: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn SessionValidator>, ValidatorError>>,
        S: Future<Output = ()>,
    {
        let registry = TokenRegistry::build(startup.tokens).map_err(StartupError::from)?;
        if registry.is_empty() {
            tracing::warn!(
                event = "registry_empty",
                "no tokens configured, every token check will be unauthorized"
            );
        }
        tracing::info!(
            event = "registry_loaded",
            tokens = registry.len(),
            names = ?registry.names()
        );

        let validator = connect().await.map_err(StartupError::Connect)?;
        tracing::info!(event = "validator_connected");

        let listener = match TcpListener::bind(startup.listen_addr).await {
            Ok(listener) => listener,
            Err(source) => {
                close_after_failed_start(validator.as_ref()).await;
                return Err(StartupError::Bind {
                    addr: startup.listen_addr,
                    source,
                }
                .into());
            }
        };

        let state = Arc::new(AppState {
            registry: Arc::new(registry),
            validator,
            session_cookie: startup.session_cookie,
        });

        Ok(self.serve(listener, state, shutdown).await?)
    }

    /// Serve on an already bound listener until `shutdown` resolves, then
    /// drain and release the state's validator.
    pub async fn serve<S>(
        &self,
        listener: TcpListener,
        state: Arc<AppState>,
        shutdown: S,
    ) -> Result<StopOutcome, ShutdownError>
    where
        S: Future<Output = ()>,
    {
        let validator = state.validator.clone();
        let addr = listener.local_addr().map_err(ShutdownError::Serve)?;
        let _ = self.local_addr.set(addr);

        let router = build_router(state);
        let draining = CancellationToken::new();
        let mut connections = JoinSet::new();

        self.transition(LifecycleState::Serving);
        tracing::info!(event = "listener_started", listen_addr = %addr);

        accept_until(&listener, &router, &draining, &mut connections, shutdown).await;
        drop(listener);

        self.transition(LifecycleState::Draining);
        tracing::info!(
            event = "shutdown_signal",
            grace_ms = self.grace.as_millis() as u64,
            open_connections = connections.len()
        );
        draining.cancel();
        let outcome = self.drain(&mut connections).await;

        let closed = validator.close().await;
        if closed.is_ok() {
            tracing::info!(event = "validator_closed");
        }
        self.transition(LifecycleState::Stopped);

        closed.map_err(ShutdownError::CloseValidator)?;
        Ok(outcome)
    }

    /// Wait for open connections to finish; abort the rest once the grace
    /// period is over.
    async fn drain(&self, connections: &mut JoinSet<()>) -> StopOutcome {
        let drained = timeout(self.grace, async {
            while let Some(joined) = connections.join_next().await {
                reap(joined);
            }
        })
        .await;
        if drained.is_ok() {
            return StopOutcome::Graceful;
        }

        let abandoned = connections.len();
        connections.shutdown().await;
        tracing::warn!(
            event = "drain_timeout",
            grace_ms = self.grace.as_millis() as u64,
            abandoned,
            "grace period elapsed, aborted open connections"
        );
        StopOutcome::Forced
    }

    fn transition(&self, next: LifecycleState) {
        let previous = self.state.send_replace(next);
        tracing::debug!(
            event = "lifecycle_transition",
            from = previous.as_str(),
            to = next.as_str()
        );
    }
}

async fn accept_until<S>(
    listener: &TcpListener,
    router: &Router,
    draining: &CancellationToken,
    connections: &mut JoinSet<()>,
    shutdown: S,
) where
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    connections.spawn(serve_connection(
                        stream,
                        remote,
                        router.clone(),
                        draining.clone(),
                    ));
                }
                Err(err) => {
                    tracing::warn!(event = "accept_failed", error = %err);
                    sleep(ACCEPT_RETRY_DELAY).await;
                }
            },
            Some(joined) = connections.join_next() => reap(joined),
        }
    }
}

/// Serve one HTTP/1 connection until the peer closes it or draining starts,
/// in which case the current request is finished and the connection closed.
async fn serve_connection(
    stream: TcpStream,
    remote: SocketAddr,
    router: Router,
    draining: CancellationToken,
) {
    let service = hyper::service::service_fn(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(ConnectInfo(remote));
        router.clone().call(request)
    });
    let mut builder = http1::Builder::new();
    builder.timer(TokioTimer::new());
    let connection = builder.serve_connection(TokioIo::new(stream), service);
    tokio::pin!(connection);

    let cancelled = draining.cancelled();
    tokio::pin!(cancelled);
    let mut closing = false;

    loop {
        tokio::select! {
            served = connection.as_mut() => {
                if let Err(err) = served {
                    tracing::debug!(event = "connection_error", remote_addr = %remote, error = %err);
                }
                return;
            }
            _ = &mut cancelled, if !closing => {
                closing = true;
                connection.as_mut().graceful_shutdown();
            }
        }
    }
}

fn reap(joined: Result<(), JoinError>) {
    if let Err(err) = joined {
        if err.is_panic() {
            tracing::error!(event = "connection_panicked", error = %err);
        }
    }
}

async fn close_after_failed_start(validator: &dyn SessionValidator) {
    if let Err(err) = validator.close().await {
        tracing::warn!(error = %err, "failed to close session validator after startup failure");
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

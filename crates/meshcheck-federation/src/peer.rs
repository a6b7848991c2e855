use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use axum::{
    handler::Handler,
    routing::{on, MethodFilter, MethodRouter},
    Router,
};
use ed25519_dalek::SigningKey;
use meshcheck_core::{ids, HarnessConfig};
use meshcheck_events::{
    Event, EventTemplate, Room, RoomVersion, ServerIdentity, UnsignedEvent,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::client::FederationClient;
use crate::error::PeerError;
use crate::handlers::{self, directory, events, invite, join, keys, knock, transaction};
use crate::state::{Callbacks, PeerState, RoomHandle, TransactionOutcome};
use crate::tls;

/// Upper bound on how long teardown waits for in-flight requests.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

struct Route {
    method: MethodFilter,
    path: String,
    handler: MethodRouter<Arc<PeerState>>,
}

/// Accumulates the routes and callbacks of a [`FederationPeer`].
pub struct PeerBuilder {
    config: HarnessConfig,
    signing_key: Option<SigningKey>,
    strict: bool,
    shutdown_grace: Duration,
    routes: Vec<Route>,
    callbacks: Callbacks,
}

impl PeerBuilder {
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            strict: config.peer.unexpected_requests_are_errors,
            config: config.clone(),
            signing_key: None,
            shutdown_grace: SHUTDOWN_GRACE,
            routes: Vec::new(),
            callbacks: Callbacks::default(),
        }
    }

    /// Sign with a fixed key instead of a freshly generated one.
    pub fn signing_key(mut self, key: SigningKey) -> Self {
        self.signing_key = Some(key);
        self
    }

    pub fn unexpected_requests_are_errors(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// How long teardown waits for in-flight requests before dropping them.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Register `handler` for `method` on `path`. A later registration for
    /// the same method and path replaces the earlier one.
    pub fn route<H, T>(mut self, method: MethodFilter, path: impl Into<String>, handler: H) -> Self
    where
        H: Handler<T, Arc<PeerState>>,
        T: 'static,
    {
        let path = path.into();
        self.routes
            .retain(|route| !(route.method == method && route.path == path));
        self.routes.push(Route {
            method,
            path,
            handler: on(method, handler),
        });
        self
    }

    pub fn handle_key_requests(self) -> Self {
        self.route(MethodFilter::GET, keys::SERVER_KEYS_PATH, keys::get_server_keys)
    }

    pub fn handle_directory_lookups(self) -> Self {
        self.route(
            MethodFilter::GET,
            directory::QUERY_DIRECTORY_PATH,
            directory::query_directory,
        )
    }

    pub fn handle_make_send_join_requests(self) -> Self {
        self.route(MethodFilter::GET, join::MAKE_JOIN_PATH, join::make_join)
            .route(MethodFilter::PUT, join::SEND_JOIN_PATH, join::send_join)
    }

    pub fn handle_make_send_knock_requests(self) -> Self {
        self.route(MethodFilter::GET, knock::MAKE_KNOCK_PATH, knock::make_knock)
            .route(MethodFilter::PUT, knock::SEND_KNOCK_PATH, knock::send_knock)
    }

    /// Accept invites for local users. `on_invite` runs inside the request
    /// task, before the co-signed invite is returned.
    pub fn handle_invite_requests<F>(mut self, on_invite: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.callbacks.on_invite = Some(Arc::new(on_invite));
        self.route(MethodFilter::PUT, invite::INVITE_PATH, invite::receive_invite)
    }

    pub fn handle_transaction_requests(self) -> Self {
        self.route(
            MethodFilter::PUT,
            transaction::SEND_TRANSACTION_PATH,
            transaction::receive_transaction,
        )
    }

    /// Called for every PDU of an inbound transaction that parses.
    pub fn on_pdu<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.callbacks.on_pdu = Some(Arc::new(callback));
        self
    }

    /// Called for every EDU of an inbound transaction.
    pub fn on_edu<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.callbacks.on_edu = Some(Arc::new(callback));
        self
    }

    pub fn handle_event_requests(self) -> Self {
        self.route(MethodFilter::GET, events::EVENT_PATH, events::get_event)
    }

    pub fn handle_missing_events_requests(self) -> Self {
        self.route(
            MethodFilter::POST,
            events::MISSING_EVENTS_PATH,
            events::get_missing_events,
        )
    }

    /// Bind the listener so the server name is known before [`FederationPeer::listen`].
    pub fn build(self) -> Result<FederationPeer, PeerError> {
        let listener = TcpListener::bind(&self.config.peer.bind_address)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let server_name = self
            .config
            .peer
            .server_name
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.config.peer.host, local_addr.port()));

        let key_id = self.config.peer.key_id.clone();
        let identity = match self.signing_key {
            Some(key) => ServerIdentity::new(server_name, key_id, key),
            None => ServerIdentity::generate(server_name, key_id),
        };
        let client = FederationClient::new(identity.clone(), self.config.destinations.clone())?;
        let state = Arc::new(PeerState::new(identity, self.strict, self.callbacks));

        // Methods registered on a path share one method router so that a
        // wrong method reaches the same fallback as an unknown path.
        let mut by_path: BTreeMap<String, MethodRouter<Arc<PeerState>>> = BTreeMap::new();
        for route in self.routes {
            let merged = match by_path.remove(&route.path) {
                Some(existing) => existing.merge(route.handler),
                None => route.handler,
            };
            by_path.insert(route.path, merged);
        }
        let mut router = Router::new();
        for (path, methods) in by_path {
            router = router.route(&path, methods.fallback(handlers::unmatched));
        }
        let router = router
            .fallback(handlers::unmatched)
            .layer(TraceLayer::new_for_http())
            .with_state(state.clone());

        tracing::info!(
            server_name = state.server_name(),
            %local_addr,
            tls = self.config.peer.tls,
            "federation peer bound"
        );
        Ok(FederationPeer {
            state,
            router,
            client,
            listener: Some(listener),
            local_addr,
            tls: self.config.peer.tls,
            host: self.config.peer.host,
            shutdown_grace: self.shutdown_grace,
        })
    }
}

/// An emulated remote homeserver reachable over HTTP(S).
pub struct FederationPeer {
    state: Arc<PeerState>,
    router: Router,
    client: FederationClient,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    tls: bool,
    host: String,
    shutdown_grace: Duration,
}

impl FederationPeer {
    pub fn builder(config: &HarnessConfig) -> PeerBuilder {
        PeerBuilder::new(config)
    }

    pub fn server_name(&self) -> &str {
        self.state.server_name()
    }

    pub fn identity(&self) -> &ServerIdentity {
        self.state.identity()
    }

    pub fn state(&self) -> &Arc<PeerState> {
        &self.state
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Loopback url of the listener, for tests that talk to the peer directly.
    pub fn base_url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{scheme}://127.0.0.1:{}", self.local_addr.port())
    }

    /// The request router, for driving handlers without a socket.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn client(&self) -> &FederationClient {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut FederationClient {
        &mut self.client
    }

    pub fn user_id(&self, localpart: &str) -> String {
        ids::user_id(localpart, self.server_name())
    }

    /// Register `#localpart:server` for `room_id` and return the alias.
    pub fn alias(&self, room_id: &str, localpart: &str) -> String {
        let alias = ids::room_alias(localpart, self.server_name());
        self.state.insert_alias(alias.clone(), room_id.to_string());
        alias
    }

    pub fn room(&self, room_id: &str) -> Option<RoomHandle> {
        self.state.room(room_id)
    }

    pub fn unexpected_requests(&self) -> Vec<String> {
        self.state.unexpected_requests()
    }

    pub fn malformed_pdus(&self) -> Vec<Value> {
        self.state.malformed_pdus()
    }

    /// Start serving on a dedicated thread with its own runtime.
    pub fn listen(&mut self) -> Result<ListenGuard, PeerError> {
        let listener = self.listener.take().ok_or(PeerError::AlreadyListening)?;
        let token = CancellationToken::new();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), PeerError>>(1);

        let router = self.router.clone();
        let tls = self.tls;
        let grace = self.shutdown_grace;
        let host = self.host.clone();
        let server_token = token.clone();
        let thread = std::thread::Builder::new()
            .name(format!("meshcheck-peer-{}", self.local_addr.port()))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(PeerError::Io(e)));
                        return;
                    }
                };
                runtime.block_on(serve(listener, router, tls, host, server_token, grace, ready_tx));
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(PeerError::Http("peer server thread exited during startup".into()));
            }
        }
        tracing::info!(server_name = self.server_name(), url = %self.base_url(), "federation peer listening");
        Ok(ListenGuard {
            token,
            thread: Some(thread),
            state: self.state.clone(),
            checked: false,
        })
    }

    pub fn make_room(&self, version: &str, templates: &[EventTemplate]) -> Result<RoomHandle, PeerError> {
        let opaque = uuid::Uuid::new_v4().simple().to_string();
        let room_id = ids::room_id(&opaque, self.server_name());
        let room = Room::create(self.identity(), version, room_id, templates)?;
        Ok(self.state.insert_room(room))
    }

    pub fn must_make_room(&self, version: &str, templates: &[EventTemplate]) -> RoomHandle {
        self.make_room(version, templates)
            .unwrap_or_else(|e| panic!("must_make_room: {e}"))
    }

    /// Build and sign an event for `room` without adding it.
    pub async fn create_event(&self, room: &RoomHandle, template: &EventTemplate) -> Result<Event, PeerError> {
        let unsigned = room.lock().await.build_event(self.identity(), template)?;
        Ok(self.identity().sign_event(unsigned)?)
    }

    pub async fn must_create_event(&self, room: &RoomHandle, template: &EventTemplate) -> Event {
        self.create_event(room, template)
            .await
            .unwrap_or_else(|e| panic!("must_create_event: {e}"))
    }

    pub async fn handle_transaction(&self, pdus: &[Value], edus: &[Value]) -> TransactionOutcome {
        self.state.handle_transaction(pdus, edus).await
    }

    /// Join `room_id` on `destination` as `user_id` through make_join and
    /// send_join, and track the room from the returned state.
    pub async fn join_room(
        &self,
        destination: &str,
        room_id: &str,
        user_id: &str,
    ) -> Result<RoomHandle, PeerError> {
        let made = self.client.make_join(destination, room_id, user_id).await?;
        let unsigned = UnsignedEvent::from_proto(
            made.room_version,
            &made.event,
            self.server_name(),
            chrono::Utc::now().timestamp_millis(),
        )?;
        let join = self.identity().sign_event(unsigned)?;
        let sent = self.client.send_join(destination, &join).await?;

        let version: &'static RoomVersion = made.room_version;
        let parse = |events: &[Value]| -> Result<Vec<Event>, PeerError> {
            events
                .iter()
                .map(|pdu| Event::from_pdu(version, pdu).map_err(PeerError::from))
                .collect()
        };
        let state = parse(&sent.state)?;
        let auth_chain = parse(&sent.auth_chain)?;
        let join = match &sent.event {
            Some(countersigned) => Event::from_pdu(version, countersigned)?,
            None => join,
        };
        let room = Room::from_remote_join(version, room_id, state, auth_chain, join)?;
        tracing::info!(room_id, destination, user_id, version = version.id, "joined remote room");
        Ok(self.state.insert_room(room))
    }

    pub async fn must_join_room(&self, destination: &str, room_id: &str, user_id: &str) -> RoomHandle {
        self.join_room(destination, room_id, user_id)
            .await
            .unwrap_or_else(|e| panic!("must_join_room: {e}"))
    }

    /// Push PDUs and EDUs to `destination` in one transaction.
    pub async fn send_transaction(
        &self,
        destination: &str,
        pdus: &[Value],
        edus: &[Value],
    ) -> Result<TransactionOutcome, PeerError> {
        let txn_id = uuid::Uuid::new_v4().simple().to_string();
        self.client.send_transaction(destination, &txn_id, pdus, edus).await
    }
}

async fn serve(
    listener: TcpListener,
    router: Router,
    tls: bool,
    host: String,
    token: CancellationToken,
    grace: Duration,
    ready: mpsc::SyncSender<Result<(), PeerError>>,
) {
    let result = if tls {
        serve_tls(listener, router, &host, token, grace, &ready).await
    } else {
        serve_plain(listener, router, token, grace, &ready).await
    };
    if let Err(e) = result {
        tracing::error!("federation peer server stopped: {e}");
        let _ = ready.try_send(Err(e));
    }
}

async fn serve_plain(
    listener: TcpListener,
    router: Router,
    token: CancellationToken,
    grace: Duration,
    ready: &mpsc::SyncSender<Result<(), PeerError>>,
) -> Result<(), PeerError> {
    let listener = tokio::net::TcpListener::from_std(listener)?;
    let shutdown = token.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
    });
    let _ = ready.send(Ok(()));

    let joined = tokio::select! {
        joined = &mut server => joined,
        _ = token.cancelled() => match tokio::time::timeout(grace, &mut server).await {
            Ok(joined) => joined,
            Err(_) => {
                tracing::warn!(?grace, "in-flight requests outlived shutdown grace, aborting");
                server.abort();
                return Ok(());
            }
        },
    };
    joined.map_err(|e| PeerError::Http(format!("server task failed: {e}")))??;
    Ok(())
}

async fn serve_tls(
    listener: TcpListener,
    router: Router,
    host: &str,
    token: CancellationToken,
    grace: Duration,
    ready: &mpsc::SyncSender<Result<(), PeerError>>,
) -> Result<(), PeerError> {
    let config = tls::rustls_config(host).await?;
    let addr = listener.local_addr()?;
    drop(listener);

    let handle = axum_server::Handle::new();
    let shutdown = handle.clone();
    tokio::spawn(async move {
        token.cancelled().await;
        shutdown.graceful_shutdown(Some(grace));
    });
    let server = tokio::spawn(
        axum_server::bind_rustls(addr, config)
            .handle(handle.clone())
            .serve(router.into_make_service()),
    );
    if handle.listening().await.is_some() {
        let _ = ready.send(Ok(()));
    }
    server
        .await
        .map_err(|e| PeerError::Http(format!("tls server task failed: {e}")))??;
    Ok(())
}

/// Running server. Dropping it stops the server and waits for in-flight
/// requests; in strict mode it then fails the test if any request matched
/// no route.
pub struct ListenGuard {
    token: CancellationToken,
    thread: Option<JoinHandle<()>>,
    state: Arc<PeerState>,
    checked: bool,
}

impl ListenGuard {
    fn shutdown(&mut self) {
        self.token.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("federation peer server thread panicked");
            }
        }
    }

    /// Stop the server and report unexpected requests as an error instead of
    /// panicking.
    pub fn finish(mut self) -> Result<(), PeerError> {
        self.shutdown();
        self.checked = true;
        let unexpected = self.state.unexpected_requests();
        if self.state.unexpected_requests_are_errors() && !unexpected.is_empty() {
            return Err(PeerError::UnexpectedRequests(unexpected));
        }
        Ok(())
    }

    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for ListenGuard {
    fn drop(&mut self) {
        self.shutdown();
        if self.checked || !self.state.unexpected_requests_are_errors() {
            return;
        }
        let unexpected = self.state.unexpected_requests();
        if unexpected.is_empty() {
            return;
        }
        let err = PeerError::UnexpectedRequests(unexpected);
        if std::thread::panicking() {
            tracing::error!("{err}");
        } else {
            panic!("{err}");
        }
    }
}

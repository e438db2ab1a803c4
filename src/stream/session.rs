//! Session controller: owns the connect, bind and reconnect state machine and
//! drives the read loop.
//!
//! One controller keeps one logical session alive against the server and
//! multiplexes every registered subscription over it. The server may ask for
//! a rebind (`LOOP`, same session on a fresh connection) or end the session
//! (`END`, full reconnect and resubscribe). Any other failure is terminal and
//! surfaces as the error returned by [`StreamController::start`].

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::rest_api::CredentialSource;
use crate::retry::with_timeout;
use crate::stream::client::{
    drain_lines, read_handshake, StreamError, StreamOptions, StreamReader, StreamTransport,
    SubscribeOutcome,
};
use crate::stream::delta::parse_data_line;
use crate::stream::proto::{
    bind_form, classify, connect_form, resolve_control_endpoint, Frame, HandshakeMetadata,
    BIND_PATH, CONNECT_PATH,
};
use crate::stream::registry::{
    SubscriptionConfig, SubscriptionId, SubscriptionRegistry, Update,
};

/// Lifecycle of the controller, published on [`StreamController::state_watch`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Streaming,
    Rebinding,
    Reconnecting,
    /// Terminal. The controller never leaves this state.
    Failed,
}

/// Outcome of a background subscribe request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SubscriptionEvent {
    Subscribed(SubscriptionId),
    /// The control request was answered with something other than `OK`. The
    /// subscription stays unconfirmed and no error is raised.
    Rejected { id: SubscriptionId, body: String },
}

/// The live server-side session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub stream_endpoint: String,
    pub session_id: String,
    pub control_endpoint: String,
    pub metadata: HandshakeMetadata,
}

impl Session {
    /// Builds a session from connect handshake metadata.
    pub fn from_handshake(
        stream_endpoint: &str,
        metadata: HandshakeMetadata,
        control_scheme: &str,
    ) -> Result<Self, StreamError> {
        let session_id = metadata
            .session_id()
            .ok_or_else(|| StreamError::Protocol("handshake did not assign a SessionId".to_string()))?
            .to_string();
        let control_endpoint = resolve_control_endpoint(&metadata, stream_endpoint, control_scheme);

        Ok(Self {
            stream_endpoint: stream_endpoint.to_string(),
            session_id,
            control_endpoint,
            metadata,
        })
    }

    /// The same session after a bind. Keys the bind handshake repeats
    /// override those from the connect handshake; the rest carry over.
    pub fn rebound(
        &self,
        metadata: HandshakeMetadata,
        control_scheme: &str,
    ) -> Result<Self, StreamError> {
        let mut merged = self.metadata.clone();
        merged.merge(metadata);
        Self::from_handshake(&self.stream_endpoint, merged, control_scheme)
    }
}

type BoxHandler = Box<dyn FnMut(Update) -> BoxFuture<'static, ()> + Send>;

/// Server-requested recovery observed by the read loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Recovery {
    Rebind,
    Reconnect,
}

/// Subscribe-all task; aborted when dropped.
struct SubscribeTask(JoinHandle<Result<(), StreamError>>);

impl Drop for SubscribeTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Keeps one streaming session alive and feeds decoded updates to the
/// registered handler.
pub struct StreamController<C> {
    source: C,
    options: StreamOptions,
    transport: StreamTransport,
    registry: SubscriptionRegistry,
    handler: Option<BoxHandler>,
    session: Option<Session>,
    reader: Option<StreamReader>,
    subscribe_task: Option<SubscribeTask>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: mpsc::UnboundedSender<SubscriptionEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<SubscriptionEvent>>,
    started: bool,
}

impl<C> StreamController<C>
where
    C: CredentialSource,
{
    pub fn new(source: C, options: StreamOptions) -> Result<Self, StreamError> {
        let transport = StreamTransport::new(&options)?;
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            source,
            options,
            transport,
            registry: SubscriptionRegistry::new(),
            handler: None,
            session: None,
            reader: None,
            subscribe_task: None,
            state_tx,
            events_tx,
            events_rx: Some(events_rx),
            started: false,
        })
    }

    /// Registers a subscription and returns its table id.
    ///
    /// Subscriptions are only accepted before [`StreamController::start`];
    /// adding tables to a running session is not supported.
    pub fn register_subscription(
        &mut self,
        config: SubscriptionConfig,
    ) -> Result<SubscriptionId, StreamError> {
        if self.started {
            return Err(StreamError::SubscriptionsLocked);
        }
        if config.fields.is_empty() || config.items.is_empty() {
            return Err(StreamError::InvalidSubscription(
                "fields and items must not be empty".to_string(),
            ));
        }
        Ok(self.registry.register(config))
    }

    /// Installs the update handler.
    ///
    /// The handler runs on the read loop; long work should be moved off it.
    /// See [`StreamOptions::handler_timeout`] for bounding each call.
    pub fn set_handler<F, Fut>(&mut self, mut handler: F)
    where
        F: FnMut(Update) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handler = Some(Box::new(move |update| handler(update).boxed()));
    }

    /// Installs a handler forwarding updates into a bounded channel.
    pub fn update_channel(&mut self, capacity: usize) -> mpsc::Receiver<Update> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.set_handler(move |update| {
            let tx = tx.clone();
            async move {
                if tx.send(update).await.is_err() {
                    debug!(event = "update_receiver_dropped");
                }
            }
        });
        rx
    }

    /// Takes the receiver of background subscribe outcomes. Only the first
    /// call returns `Some`.
    pub fn take_subscription_events(&mut self) -> Option<mpsc::UnboundedReceiver<SubscriptionEvent>> {
        self.events_rx.take()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Connects, subscribes every registered table and runs the read loop.
    ///
    /// Only returns on a terminal failure; the controller is then `Failed`
    /// and cannot be started again.
    pub async fn start(&mut self) -> Result<(), StreamError> {
        if self.started {
            return Err(StreamError::AlreadyStarted);
        }
        if self.handler.is_none() {
            return Err(StreamError::MissingHandler);
        }
        self.started = true;

        let err = match self.run().await {
            Ok(never) => match never {},
            Err(err) => err,
        };

        error!(event = "stream_failed", error = %err);
        self.reader = None;
        self.subscribe_task = None;
        self.session = None;
        self.set_state(ConnectionState::Failed);
        Err(err)
    }

    async fn run(&mut self) -> Result<Infallible, StreamError> {
        self.set_state(ConnectionState::Connecting);
        self.connect().await?;

        loop {
            match self.read_until_recovery().await? {
                Recovery::Rebind => {
                    if !self.rebind().await {
                        self.reconnect().await?;
                    }
                }
                Recovery::Reconnect => {
                    self.set_state(ConnectionState::Reconnecting);
                    let delay = self.options.reconnect_delay;
                    if !delay.is_zero() {
                        info!(event = "stream_reconnect_backoff", delay_ms = delay.as_millis() as u64);
                        tokio::time::sleep(delay).await;
                    }
                    self.reconnect().await?;
                }
            }
        }
    }

    /// Refreshes credentials, performs the connect handshake and schedules
    /// the subscribe-all task.
    async fn connect(&mut self) -> Result<(), StreamError> {
        let credentials = self.source.credentials().await?;
        let stream_endpoint = credentials.stream_endpoint.trim_end_matches('/').to_string();
        let url = format!("{stream_endpoint}{CONNECT_PATH}");
        let form = connect_form(
            &self.options.adapter_set,
            &credentials.account_id,
            &credentials.session_token,
            &credentials.security_token,
        );

        info!(event = "stream_connect", endpoint = %stream_endpoint, account_id = %credentials.account_id);
        let (reader, metadata) = open_handshake(&self.transport, "connect", &url, &form).await?;
        let session =
            Session::from_handshake(&stream_endpoint, metadata, &self.options.control_scheme)?;
        info!(
            event = "stream_connected",
            session_id = %session.session_id,
            control_endpoint = %session.control_endpoint
        );

        self.reader = Some(reader);
        self.spawn_subscribe_all(&session);
        self.session = Some(session);
        self.set_state(ConnectionState::Streaming);
        Ok(())
    }

    /// Reattaches the current session to a new connection. Returns `false`
    /// when the caller should fall back to a full reconnect.
    ///
    /// The session stays current while the bind is in flight.
    async fn rebind(&mut self) -> bool {
        self.set_state(ConnectionState::Rebinding);
        self.reader = None;
        let Some(current) = self.session.as_ref() else {
            return false;
        };

        let url = format!("{}{}", current.control_endpoint, BIND_PATH);
        let form = bind_form(&current.session_id);
        info!(event = "stream_rebind", session_id = %current.session_id, url = %url);

        let (reader, metadata) = match open_handshake(&self.transport, "bind", &url, &form).await {
            Ok(opened) => opened,
            Err(err) => {
                warn!(event = "stream_rebind_failed", error = %err);
                return false;
            }
        };
        let session = match current.rebound(metadata, &self.options.control_scheme) {
            Ok(session) => session,
            Err(err) => {
                warn!(event = "stream_rebind_failed", error = %err);
                return false;
            }
        };

        debug!(event = "stream_rebound", session_id = %session.session_id);
        self.reader = Some(reader);
        self.session = Some(session);
        self.set_state(ConnectionState::Streaming);
        true
    }

    /// Drops the session and everything tied to it, then connects from
    /// scratch and resubscribes every table.
    async fn reconnect(&mut self) -> Result<(), StreamError> {
        self.set_state(ConnectionState::Reconnecting);
        info!(event = "stream_reconnect");
        self.reader = None;
        self.session = None;
        self.subscribe_task = None;
        self.registry.reset_all();
        self.connect().await
    }

    fn spawn_subscribe_all(&mut self, session: &Session) {
        if self.registry.is_empty() {
            return;
        }
        let task = tokio::spawn(subscribe_all(
            self.transport.clone(),
            session.control_endpoint.clone(),
            session.session_id.clone(),
            self.registry.snapshot(),
            self.events_tx.clone(),
        ));
        self.subscribe_task = Some(SubscribeTask(task));
    }

    /// Consumes lines until the server asks for a rebind or reconnect.
    async fn read_until_recovery(&mut self) -> Result<Recovery, StreamError> {
        loop {
            let reader = self.reader.as_mut().ok_or(StreamError::ReadFailure)?;
            let line = tokio::select! {
                line = reader.next_line() => line,
                outcome = wait_for_task(&mut self.subscribe_task) => {
                    outcome?;
                    continue;
                }
            };

            let Some(line) = line else {
                error!(event = "stream_read_failed");
                return Err(StreamError::ReadFailure);
            };

            match classify(&line) {
                Frame::Probe | Frame::Preamble => {}
                Frame::Ok => debug!(event = "stream_unexpected_ok"),
                Frame::Error => {
                    let body = self.drain_diagnostics(line).await;
                    error!(event = "stream_error_frame", body = %body);
                    return Err(StreamError::ServerError(body));
                }
                Frame::SyncError => {
                    let body = self.drain_diagnostics(line).await;
                    error!(event = "stream_sync_error_frame", body = %body);
                    return Err(StreamError::SyncError(body));
                }
                Frame::Loop => {
                    info!(event = "stream_loop", line = %line);
                    return Ok(Recovery::Rebind);
                }
                Frame::End => {
                    error!(event = "stream_end", line = %line);
                    return Ok(Recovery::Reconnect);
                }
                Frame::Data => {
                    let raw = parse_data_line(&line)?;
                    let update = self.registry.record_update(&raw)?;
                    self.dispatch(update).await;
                }
            }
        }
    }

    async fn dispatch(&mut self, update: Update) {
        let Some(handler) = self.handler.as_mut() else {
            return;
        };
        let subscription_id = update.subscription_id;
        let delivery = handler(update);

        match self.options.handler_timeout {
            Some(limit) => {
                if with_timeout(limit, delivery).await.is_err() {
                    warn!(
                        event = "handler_timeout",
                        subscription_id,
                        limit_ms = limit.as_millis() as u64
                    );
                }
            }
            None => delivery.await,
        }
    }

    async fn drain_diagnostics(&mut self, first: String) -> String {
        let mut lines = vec![first];
        if let Some(reader) = self.reader.as_mut() {
            lines.extend(drain_lines(reader, self.transport.diagnostic_timeout()).await);
        }
        lines.join("\n")
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }
}

async fn open_handshake(
    transport: &StreamTransport,
    operation: &'static str,
    url: &str,
    form: &[(&'static str, String)],
) -> Result<(StreamReader, HandshakeMetadata), StreamError> {
    let mut reader = transport.open(operation, url, form).await?;
    let metadata = read_handshake(&mut reader, transport.diagnostic_timeout()).await?;
    Ok((reader, metadata))
}

async fn wait_for_task(task: &mut Option<SubscribeTask>) -> Result<(), StreamError> {
    let Some(running) = task.as_mut() else {
        return std::future::pending().await;
    };
    let joined = (&mut running.0).await;
    *task = None;
    match joined {
        Ok(result) => result,
        Err(err) => Err(StreamError::TaskFailed(err.to_string())),
    }
}

/// Sends one subscribe request per table, in registration order.
///
/// Exhausted timeouts abort the remaining requests and are returned to the
/// read loop, which treats them as fatal.
async fn subscribe_all(
    transport: StreamTransport,
    control_endpoint: String,
    session_id: String,
    subscriptions: Vec<(SubscriptionId, Arc<SubscriptionConfig>)>,
    events: mpsc::UnboundedSender<SubscriptionEvent>,
) -> Result<(), StreamError> {
    for (id, config) in subscriptions {
        let event = match transport
            .subscribe(&control_endpoint, &session_id, id, &config)
            .await?
        {
            SubscribeOutcome::Confirmed => {
                debug!(event = "subscribed", subscription_id = id);
                SubscriptionEvent::Subscribed(id)
            }
            SubscribeOutcome::Rejected(body) => SubscriptionEvent::Rejected { id, body },
        };
        let _ = events.send(event);
    }
    Ok(())
}

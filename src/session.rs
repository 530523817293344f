//! The session engine: request/response correlation, handler multiplexing,
//! timeout/cancellation, debounce, dispatch, and capability hooks.
//!
//! This is `mcp-session`'s analogue of `rmcp::service`, reworked from that
//! crate's actor-with-channels event loop into the single-`Session`,
//! mutex-guarded state machine spec.md describes. See SPEC_FULL.md §2 and
//! DESIGN.md for the grounding.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tracing::{debug, info, instrument, trace, warn};

use crate::cancellation::CancellationHandle;
use crate::error::{McpError, SessionError};
use crate::model::{
    CancelledParams, InboundMessage, Meta, OutboundEnvelope, OutboundError, OutboundResponse,
    ProgressParams, ProgressToken, RequestId, METHOD_CANCELLED, METHOD_PING, METHOD_PROGRESS,
};
use crate::transport::{MessageExtras, SendOptions, Transport, TransportEvent};

/// Default per-call timeout for outbound requests (spec.md §4.2).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(60_000);

/// How long a cancelled/timed-out request's id is remembered so a late
/// response can be recognized and silently dropped rather than reported as
/// "unknown request id" (spec.md §4.2). Bounded so a long-lived session that
/// cancels many requests whose peers never answer doesn't grow this set
/// without limit.
const CANCELLED_ID_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// The capability bundle a concrete client/server layer instantiates this
/// engine with — the crate's analogue of `rmcp::service::ServiceRole`
/// (spec.md §9, "polymorphic SendReq/SendNot/SendRes → capability set").
pub trait SessionTypes: Send + Sync + 'static {
    /// The outbound request family.
    type Req: Serialize + Send + Sync + 'static;
    /// The outbound notification family.
    type Not: Serialize + Send + Sync + 'static;
    /// The result type our own request handlers produce.
    type Res: Serialize + Send + Sync + 'static;
}

/// An outbound request must be able to report its own JSON-RPC method name.
pub trait HasMethod {
    fn method(&self) -> &str;
}

/// The three capability hooks the specializing layer (client or server)
/// must supply (spec.md §4.7). Default implementations never refuse,
/// matching a session with no capability restrictions.
pub trait CapabilityHooks: Send + Sync + 'static {
    fn assert_capability_for_method(&self, _method: &str) -> Result<(), McpError> {
        Ok(())
    }
    fn assert_notification_capability(&self, _method: &str) -> Result<(), McpError> {
        Ok(())
    }
    fn assert_request_handler_capability(&self, _method: &str) -> Result<(), McpError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct PermissiveCapabilities;
impl CapabilityHooks for PermissiveCapabilities {}

/// Session-wide configuration (spec.md §3, ambient "configuration" per
/// SPEC_FULL.md).
#[derive(Clone)]
pub struct SessionOptions {
    pub strict_capabilities: bool,
    pub debounced_notification_methods: HashSet<String>,
    pub default_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            strict_capabilities: false,
            debounced_notification_methods: HashSet::new(),
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Per-call options for an outbound `request` (spec.md §4.2).
#[derive(Clone)]
pub struct RequestOptions {
    pub timeout: Duration,
    pub max_total_timeout: Option<Duration>,
    pub reset_timeout_on_progress: bool,
    pub cancel: Option<CancellationHandle>,
    pub on_progress: Option<Arc<dyn Fn(Value) + Send + Sync>>,
    pub related_request_id: Option<RequestId>,
    pub resumption_token: Option<String>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REQUEST_TIMEOUT,
            max_total_timeout: None,
            reset_timeout_on_progress: false,
            cancel: None,
            on_progress: None,
            related_request_id: None,
            resumption_token: None,
        }
    }
}

impl RequestOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
    pub fn with_max_total_timeout(mut self, timeout: Duration) -> Self {
        self.max_total_timeout = Some(timeout);
        self
    }
    pub fn with_reset_timeout_on_progress(mut self, reset: bool) -> Self {
        self.reset_timeout_on_progress = reset;
        self
    }
    pub fn with_cancel(mut self, cancel: CancellationHandle) -> Self {
        self.cancel = Some(cancel);
        self
    }
    pub fn with_on_progress(mut self, cb: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(cb));
        self
    }
}

/// Per-call options for an outbound `notification` (spec.md §4.5).
#[derive(Clone, Default)]
pub struct NotificationOptions {
    pub related_request_id: Option<RequestId>,
}

type RequestTrampoline<R> = Arc<
    dyn Fn(Value, RequestExtra<R>) -> BoxFuture<'static, Result<Value, McpError>> + Send + Sync,
>;
type NotificationTrampoline<R> =
    Arc<dyn Fn(Value, NotificationExtra<R>) -> BoxFuture<'static, Result<(), McpError>> + Send + Sync>;

/// Extras handed to a registered request handler (spec.md §4.4 step 5).
#[derive(Clone)]
pub struct RequestExtra<R: SessionTypes> {
    pub cancel: CancellationHandle,
    pub session_id: Option<String>,
    pub meta: Meta,
    pub auth_info: Option<String>,
    pub request_info: Option<String>,
    pub peer: Session<R>,
    related_request_id: RequestId,
}

impl<R: SessionTypes> RequestExtra<R>
where
    R::Req: HasMethod,
    R::Not: HasMethod,
{
    /// Send a notification tagged with this handler's inbound request id as
    /// `relatedRequestId`, so the peer can correlate it (spec.md §4.4 step 5).
    pub async fn send_notification(&self, not: R::Not) -> Result<(), SessionError> {
        self.peer
            .notify(
                not,
                NotificationOptions {
                    related_request_id: Some(self.related_request_id.clone()),
                },
            )
            .await
    }

    /// Send a request tagged with this handler's inbound request id as
    /// `relatedRequestId`, so the peer can correlate it (spec.md §4.4 step 5).
    pub async fn send_request<T>(
        &self,
        req: R::Req,
        validate: impl FnOnce(Value) -> Result<T, McpError> + Send + 'static,
        mut options: RequestOptions,
    ) -> Result<T, SessionError> {
        options.related_request_id = Some(self.related_request_id.clone());
        self.peer.request(req, validate, options).await
    }
}

/// Extras handed to a registered notification handler (spec.md §4.5).
#[derive(Clone)]
pub struct NotificationExtra<R: SessionTypes> {
    pub meta: Meta,
    pub auth_info: Option<String>,
    pub request_info: Option<String>,
    pub peer: Session<R>,
}

struct TimeoutState {
    start_time: Instant,
    per_call_timeout: Duration,
    max_total_timeout: Option<Duration>,
    reset_on_progress: bool,
    timer: tokio::task::JoinHandle<()>,
}

struct OutboundRecord {
    completer: oneshot::Sender<Result<Value, SessionError>>,
    progress: Option<Arc<dyn Fn(Value) + Send + Sync>>,
    timeout: Option<TimeoutState>,
    done: Arc<Notify>,
}

struct SendJob {
    message: Value,
    options: SendOptions,
    ack: oneshot::Sender<Result<(), crate::transport::TransportError>>,
}

struct Inner<R: SessionTypes> {
    outbound_tx: Option<mpsc::Sender<SendJob>>,
    dispatch_task: Option<tokio::task::JoinHandle<()>>,
    next_id: i64,
    outbound: HashMap<i64, OutboundRecord>,
    cancelled_ids: HashSet<i64>,
    inbound: HashMap<RequestId, CancellationHandle>,
    request_handlers: HashMap<String, RequestTrampoline<R>>,
    notification_handlers: HashMap<String, NotificationTrampoline<R>>,
    fallback_request_handler: Option<RequestTrampoline<R>>,
    fallback_notification_handler: Option<NotificationTrampoline<R>>,
    debounce_pending: HashSet<String>,
    options: SessionOptions,
    capabilities: Arc<dyn CapabilityHooks>,
    on_close: Option<Arc<dyn Fn() + Send + Sync>>,
    on_error: Option<Arc<dyn Fn(SessionError) + Send + Sync>>,
    session_id: Option<String>,
}

impl<R: SessionTypes> Inner<R> {
    /// Removes an outbound record, aborting its timer if one is armed.
    /// Shared by normal completion, cancel/timeout, and close.
    fn remove_outbound(&mut self, id: i64) -> Option<OutboundRecord> {
        let record = self.outbound.remove(&id)?;
        if let Some(t) = &record.timeout {
            t.timer.abort();
        }
        Some(record)
    }
}

/// The session engine. Cloning a `Session` is cheap (an `Arc` clone) and
/// yields another handle to the same engine — the crate's analogue of
/// `rmcp::service::Peer`.
pub struct Session<R: SessionTypes> {
    inner: Arc<Mutex<Inner<R>>>,
}

impl<R: SessionTypes> Clone for Session<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

fn ping_trampoline<R: SessionTypes>(
    _params: Value,
    _extra: RequestExtra<R>,
) -> BoxFuture<'static, Result<Value, McpError>> {
    Box::pin(async { Ok(Value::Object(serde_json::Map::new())) })
}

fn cancelled_trampoline<R: SessionTypes>(
    params: Value,
    extra: NotificationExtra<R>,
) -> BoxFuture<'static, Result<(), McpError>> {
    Box::pin(async move {
        let parsed: CancelledParams =
            serde_json::from_value(params).map_err(|e| McpError::invalid_params(e.to_string()))?;
        extra
            .peer
            .trip_inbound_cancellation(parsed.request_id, parsed.reason)
            .await;
        Ok(())
    })
}

fn progress_trampoline<R: SessionTypes>(
    params: Value,
    extra: NotificationExtra<R>,
) -> BoxFuture<'static, Result<(), McpError>> {
    Box::pin(async move {
        let parsed: ProgressParams =
            serde_json::from_value(params).map_err(|e| McpError::invalid_params(e.to_string()))?;
        extra.peer.on_progress(parsed.progress_token, parsed.fields).await;
        Ok(())
    })
}

impl<R: SessionTypes> Session<R>
where
    R::Req: HasMethod,
    R::Not: HasMethod,
{
    pub fn new(options: SessionOptions, capabilities: Arc<dyn CapabilityHooks>) -> Self {
        let mut request_handlers: HashMap<String, RequestTrampoline<R>> = HashMap::new();
        request_handlers.insert(METHOD_PING.to_owned(), Arc::new(ping_trampoline::<R>));

        let mut notification_handlers: HashMap<String, NotificationTrampoline<R>> = HashMap::new();
        notification_handlers.insert(METHOD_CANCELLED.to_owned(), Arc::new(cancelled_trampoline::<R>));
        notification_handlers.insert(METHOD_PROGRESS.to_owned(), Arc::new(progress_trampoline::<R>));

        let inner = Inner {
            outbound_tx: None,
            dispatch_task: None,
            next_id: 0,
            outbound: HashMap::new(),
            cancelled_ids: HashSet::new(),
            inbound: HashMap::new(),
            request_handlers,
            notification_handlers,
            fallback_request_handler: None,
            fallback_notification_handler: None,
            debounce_pending: HashSet::new(),
            options,
            capabilities,
            on_close: None,
            on_error: None,
            session_id: None,
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Is there a transport attached right now?
    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.outbound_tx.is_some()
    }

    pub async fn set_on_close(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.inner.lock().await.on_close = Some(Arc::new(cb));
    }

    pub async fn set_on_error(&self, cb: impl Fn(SessionError) + Send + Sync + 'static) {
        self.inner.lock().await.on_error = Some(Arc::new(cb));
    }

    pub async fn session_id(&self) -> Option<String> {
        self.inner.lock().await.session_id.clone()
    }

    fn emit_error(&self, error: SessionError) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let cb = inner.lock().await.on_error.clone();
            if let Some(cb) = cb {
                cb(error);
            } else {
                warn!(%error, "unhandled session error");
            }
        });
    }

    // ---------------------------------------------------------------
    // §4.1 connection lifecycle
    // ---------------------------------------------------------------

    /// Attach a transport and start the dispatch loop. At most one
    /// transport may be attached at a time (spec.md §3 Invariant 5).
    #[instrument(skip_all)]
    pub async fn connect(&self, mut transport: Box<dyn Transport>) -> Result<(), SessionError> {
        transport
            .start()
            .await
            .map_err(|e| SessionError::TransportSend(e.0))?;
        let session_id = transport.session_id();
        let (tx, mut rx) = mpsc::channel::<SendJob>(64);
        {
            let mut inner = self.inner.lock().await;
            inner.outbound_tx = Some(tx);
            inner.session_id = session_id;
        }
        info!("session connected");
        let session = self.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    job = rx.recv() => {
                        match job {
                            Some(job) => {
                                let result = transport.send(job.message, job.options).await;
                                let _ = job.ack.send(result);
                            }
                            None => break,
                        }
                    }
                    event = transport.recv() => {
                        match event {
                            TransportEvent::Message(msg, extras) => {
                                trace!(?msg, "received message");
                                // Routing and registry mutation happen here, in delivery
                                // order; `dispatch` spawns only the handler body so a
                                // slow handler can't stall later messages (spec.md §5).
                                session.dispatch(msg, extras).await;
                            }
                            TransportEvent::Closed => break,
                            TransportEvent::Error(err) => {
                                session.emit_error(SessionError::TransportSend(err.0));
                            }
                        }
                    }
                }
            }
            session.run_close_cascade().await;
            if let Err(e) = transport.close().await {
                warn!(%e, "failed to close transport");
            }
            info!("session dispatch loop finished");
        });
        self.inner.lock().await.dispatch_task = Some(task);
        Ok(())
    }

    /// Request the transport close and wait for the close cascade to
    /// finish (spec.md §4.1).
    pub async fn close(&self) {
        let task = {
            let mut inner = self.inner.lock().await;
            inner.outbound_tx = None;
            inner.dispatch_task.take()
        };
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// The ordered close cascade (spec.md §4.1): snapshot and clear
    /// registries, fire `on_close`, then reject every pending outbound
    /// request with `ConnectionClosed`.
    async fn run_close_cascade(&self) {
        let (snapshot, on_close) = {
            let mut inner = self.inner.lock().await;
            let snapshot: Vec<OutboundRecord> = inner.outbound.drain().map(|(_, v)| v).collect();
            inner.debounce_pending.clear();
            inner.outbound_tx = None;
            (snapshot, inner.on_close.clone())
        };
        if let Some(cb) = on_close {
            cb();
        }
        for record in snapshot {
            record.done.notify_waiters();
            let _ = record.completer.send(Err(SessionError::ConnectionClosed));
        }
    }

    // ---------------------------------------------------------------
    // raw send plumbing shared by request/response/notification/cancel
    // ---------------------------------------------------------------

    async fn send_raw(&self, message: Value, options: SendOptions) -> Result<(), SessionError> {
        let tx = {
            let inner = self.inner.lock().await;
            inner.outbound_tx.clone().ok_or(SessionError::NotConnected)?
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(SendJob {
            message,
            options,
            ack: ack_tx,
        })
        .await
        .map_err(|_| SessionError::ConnectionClosed)?;
        match ack_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SessionError::TransportSend(e.0)),
            Err(_) => Err(SessionError::ConnectionClosed),
        }
    }

    async fn send_response_raw(&self, id: RequestId, result: Value) -> Result<(), SessionError> {
        let envelope = OutboundResponse::new(id, result);
        let value = serde_json::to_value(&envelope)
            .map_err(|e| SessionError::Validation(e.to_string()))?;
        self.send_raw(value, SendOptions::default()).await
    }

    async fn send_error_raw(&self, id: RequestId, error: McpError) -> Result<(), SessionError> {
        let envelope = OutboundError::new(id, error.into_error_object());
        let value = serde_json::to_value(&envelope)
            .map_err(|e| SessionError::Validation(e.to_string()))?;
        self.send_raw(value, SendOptions::default()).await
    }

    // ---------------------------------------------------------------
    // §4.2 / §4.3 outbound request + timeout state machine
    // ---------------------------------------------------------------

    /// Send a JSON-RPC request and suspend until response, error,
    /// cancellation, timeout, or close (spec.md §4.2).
    #[instrument(skip_all, fields(method = req.method()))]
    pub async fn request<T>(
        &self,
        req: R::Req,
        validate: impl FnOnce(Value) -> Result<T, McpError> + Send + 'static,
        options: RequestOptions,
    ) -> Result<T, SessionError> {
        let method = req.method().to_owned();
        {
            let inner = self.inner.lock().await;
            if inner.outbound_tx.is_none() {
                return Err(SessionError::NotConnected);
            }
            if inner.options.strict_capabilities {
                inner
                    .capabilities
                    .assert_capability_for_method(&method)
                    .map_err(SessionError::Mcp)?;
            }
        }
        if let Some(handle) = &options.cancel {
            if handle.is_cancelled() {
                let reason = handle.reason().unwrap_or_else(|| "cancelled".to_owned());
                return Err(SessionError::Cancelled { reason: Some(reason) });
            }
        }

        let id = {
            let mut inner = self.inner.lock().await;
            let id = inner.next_id;
            inner.next_id += 1;
            id
        };

        let mut params_value =
            serde_json::to_value(&req).map_err(|e| SessionError::Validation(e.to_string()))?;
        if options.on_progress.is_some() {
            merge_progress_token(&mut params_value, RequestId::Number(id));
        }
        let params_opt = normalize_params(params_value);

        let (completer_tx, completer_rx) = oneshot::channel();
        let done = Arc::new(Notify::new());
        {
            let mut inner = self.inner.lock().await;
            inner.outbound.insert(
                id,
                OutboundRecord {
                    completer: completer_tx,
                    progress: options.on_progress.clone(),
                    timeout: None,
                    done: done.clone(),
                },
            );
        }

        if let Some(handle) = options.cancel.clone() {
            let session = self.clone();
            let done = done.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = handle.cancelled() => {
                        let reason = handle.reason().unwrap_or_else(|| "cancelled".to_owned());
                        session
                            .complete_with_error(
                                id,
                                Some(reason.clone()),
                                SessionError::Cancelled { reason: Some(reason) },
                            )
                            .await;
                    }
                    _ = done.notified() => {}
                }
            });
        }

        let per_call_timeout = options.timeout;
        let timer = {
            let session = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(per_call_timeout).await;
                session.fire_timeout(id, per_call_timeout).await;
            })
        };
        {
            let mut inner = self.inner.lock().await;
            if let Some(record) = inner.outbound.get_mut(&id) {
                record.timeout = Some(TimeoutState {
                    start_time: Instant::now(),
                    per_call_timeout,
                    max_total_timeout: options.max_total_timeout,
                    reset_on_progress: options.reset_timeout_on_progress,
                    timer,
                });
            }
        }

        let envelope = OutboundEnvelope::request(method, params_opt, RequestId::Number(id));
        let envelope_value = match serde_json::to_value(&envelope) {
            Ok(v) => v,
            Err(e) => {
                let mut inner = self.inner.lock().await;
                inner.remove_outbound(id);
                drop(inner);
                done.notify_waiters();
                return Err(SessionError::Validation(e.to_string()));
            }
        };
        let send_options = SendOptions {
            related_request_id: options.related_request_id.clone(),
            resumption_token: options.resumption_token.clone(),
        };
        if let Err(e) = self.send_raw(envelope_value, send_options).await {
            let mut inner = self.inner.lock().await;
            inner.remove_outbound(id);
            drop(inner);
            done.notify_waiters();
            return Err(e);
        }

        debug!(id, "request sent, awaiting completion");
        match completer_rx.await {
            Ok(Ok(value)) => validate(value).map_err(SessionError::Mcp),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SessionError::ConnectionClosed),
        }
    }

    /// Shared completion path for timeout, caller-cancel, and max-total
    /// breach (spec.md §4.2 "cancel path" / §4.3 "Fire"). Removes the
    /// record, best-effort sends `notifications/cancelled`, then completes
    /// the caller.
    async fn complete_with_error(
        &self,
        id: i64,
        cancelled_reason: Option<String>,
        error: SessionError,
    ) {
        let record = {
            let mut inner = self.inner.lock().await;
            let record = inner.remove_outbound(id);
            if record.is_some() {
                inner.cancelled_ids.insert(id);
            }
            record
        };
        let Some(record) = record else { return };
        // A peer that never responds (e.g. the one being cancelled/timed
        // out) would otherwise leave `id` in `cancelled_ids` forever, so
        // evict it after a bounded grace window rather than waiting on a
        // late response that may never arrive.
        let session = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(CANCELLED_ID_GRACE_PERIOD).await;
            session.inner.lock().await.cancelled_ids.remove(&id);
        });
        record.done.notify_waiters();
        if let Some(reason) = cancelled_reason {
            let params = CancelledParams {
                request_id: RequestId::Number(id),
                reason: Some(reason),
            };
            if let Ok(value) = serde_json::to_value(&params) {
                if let Err(e) = self.send_notification_envelope(METHOD_CANCELLED, Some(value)).await {
                    self.emit_error(e);
                }
            }
        }
        let _ = record.completer.send(Err(error));
    }

    async fn fire_timeout(&self, id: i64, per_call_timeout: Duration) {
        {
            let inner = self.inner.lock().await;
            if !inner.outbound.contains_key(&id) {
                return;
            }
        }
        let reason = McpError::request_timeout(per_call_timeout).message;
        self.complete_with_error(
            id,
            Some(reason),
            SessionError::Timeout { timeout: per_call_timeout },
        )
        .await;
    }

    async fn trip_inbound_cancellation(&self, request_id: RequestId, reason: Option<String>) {
        let handle = {
            let inner = self.inner.lock().await;
            inner.inbound.get(&request_id).cloned()
        };
        if let Some(handle) = handle {
            info!(%request_id, ?reason, "inbound request cancelled");
            handle.cancel(reason.unwrap_or_else(|| "cancelled".to_owned()));
        }
    }

    /// §4.6 `_on_progress`.
    async fn on_progress(&self, token: ProgressToken, fields: Value) {
        let id = match coerce_token_to_id(&token) {
            Some(id) => id,
            None => {
                self.emit_error(SessionError::Mcp(McpError::invalid_params(format!(
                    "unrecognized progress token: {token}"
                ))));
                return;
            }
        };

        enum Outcome {
            Breach(SessionError),
            Invoke(Arc<dyn Fn(Value) + Send + Sync>),
            NoHandler,
            NoSuchRequest,
        }

        let outcome = {
            let mut inner = self.inner.lock().await;
            match inner.outbound.get_mut(&id) {
                None => Outcome::NoSuchRequest,
                Some(record) => match record.progress.clone() {
                    None => Outcome::NoHandler,
                    Some(cb) => {
                        let mut breach = None;
                        if let Some(state) = record.timeout.as_mut() {
                            if state.reset_on_progress {
                                let elapsed = state.start_time.elapsed();
                                let over_ceiling = state
                                    .max_total_timeout
                                    .map(|max| elapsed >= max)
                                    .unwrap_or(false);
                                if over_ceiling {
                                    let max_total = state.max_total_timeout.unwrap();
                                    breach = Some(SessionError::Mcp(McpError::max_total_timeout(
                                        max_total, elapsed,
                                    )));
                                } else {
                                    state.timer.abort();
                                    let session = self.clone();
                                    let per_call = state.per_call_timeout;
                                    state.timer = tokio::spawn(async move {
                                        tokio::time::sleep(per_call).await;
                                        session.fire_timeout(id, per_call).await;
                                    });
                                }
                            }
                        }
                        match breach {
                            Some(err) => Outcome::Breach(err),
                            None => Outcome::Invoke(cb),
                        }
                    }
                },
            }
        };

        match outcome {
            Outcome::NoSuchRequest => {
                self.emit_error(SessionError::Mcp(McpError::invalid_params(format!(
                    "progress for unknown request id: {id}"
                ))));
            }
            Outcome::NoHandler => {
                self.emit_error(SessionError::Mcp(McpError::invalid_params(format!(
                    "no progress handler registered for request id: {id}"
                ))));
            }
            Outcome::Breach(err) => {
                self.complete_with_error(
                    id,
                    Some("maximum total timeout exceeded".to_owned()),
                    err,
                )
                .await;
            }
            Outcome::Invoke(cb) => cb(fields),
        }
    }

    // ---------------------------------------------------------------
    // §4.6 dispatcher
    // ---------------------------------------------------------------

    async fn dispatch(&self, msg: InboundMessage, extras: MessageExtras) {
        match msg {
            InboundMessage::Response { id, result } => self.on_response(id, Ok(result)).await,
            InboundMessage::Error { id, error } => {
                self.on_response(id, Err(error.into())).await
            }
            InboundMessage::Request { id, method, params } => {
                self.handle_inbound_request(id, method, params, extras).await
            }
            InboundMessage::Notification { method, params } => {
                self.handle_inbound_notification(method, params, extras).await
            }
        }
    }

    /// §4.6 `_on_response`.
    async fn on_response(&self, id: RequestId, outcome: Result<Value, McpError>) {
        let numeric_id = match &id {
            RequestId::Number(n) => *n,
            RequestId::String(_) => {
                self.emit_error(SessionError::Mcp(McpError::invalid_params(format!(
                    "response with non-numeric id: {id}"
                ))));
                return;
            }
        };
        let record = {
            let mut inner = self.inner.lock().await;
            inner.remove_outbound(numeric_id)
        };
        match record {
            Some(record) => {
                record.done.notify_waiters();
                let _ = record.completer.send(outcome.map_err(SessionError::Mcp));
            }
            None => {
                let was_cancelled = {
                    let mut inner = self.inner.lock().await;
                    inner.cancelled_ids.remove(&numeric_id)
                };
                if !was_cancelled {
                    self.emit_error(SessionError::Mcp(McpError::invalid_params(format!(
                        "response for unknown request id: {numeric_id}"
                    ))));
                }
            }
        }
    }

    // ---------------------------------------------------------------
    // §4.4 inbound requests
    // ---------------------------------------------------------------

    /// Routes and registers an inbound request, then spawns its handler
    /// body. The routing/registration step — trampoline lookup and the
    /// `inbound` insert — runs inline, in delivery order, so a
    /// `notifications/cancelled` for this id that arrives right behind it
    /// can never race the insert (spec.md §5, §4.4, S5).
    async fn handle_inbound_request(
        &self,
        id: RequestId,
        method: String,
        params: Option<Value>,
        extras: MessageExtras,
    ) {
        let trampoline = {
            let inner = self.inner.lock().await;
            inner
                .request_handlers
                .get(&method)
                .cloned()
                .or_else(|| inner.fallback_request_handler.clone())
        };
        let Some(trampoline) = trampoline else {
            let session = self.clone();
            tokio::spawn(async move {
                let err = McpError::method_not_found(&method);
                if let Err(e) = session.send_error_raw(id, err).await {
                    session.emit_error(e);
                }
            });
            return;
        };

        let cancel = CancellationHandle::new();
        {
            let mut inner = self.inner.lock().await;
            inner.inbound.insert(id.clone(), cancel.clone());
        }

        let session = self.clone();
        tokio::spawn(async move {
            session
                .run_inbound_request(id, method, params, extras, trampoline, cancel)
                .await;
        });
    }

    /// The handler-body half of an inbound request: builds the extras,
    /// invokes the trampoline, and sends the response/error — all off the
    /// read path so it can't stall later deliveries.
    async fn run_inbound_request(
        &self,
        id: RequestId,
        method: String,
        params: Option<Value>,
        extras: MessageExtras,
        trampoline: RequestTrampoline<R>,
        cancel: CancellationHandle,
    ) {
        let meta = params
            .as_ref()
            .and_then(|v| v.get("_meta"))
            .and_then(|v| v.as_object())
            .map(|m| Meta(m.clone()))
            .unwrap_or_default();
        let session_id = self.session_id().await;
        let extra = RequestExtra {
            cancel: cancel.clone(),
            session_id,
            meta,
            auth_info: extras.auth_info,
            request_info: extras.request_info,
            peer: self.clone(),
            related_request_id: id.clone(),
        };

        debug!(%id, %method, "dispatching inbound request");
        let result = trampoline(params.unwrap_or(Value::Null), extra).await;

        if !cancel.is_cancelled() {
            match result {
                Ok(value) => {
                    if let Err(e) = self.send_response_raw(id.clone(), value).await {
                        self.emit_error(e);
                    }
                }
                Err(err) => {
                    let code = if McpError::is_safe_integer_code(err.code) {
                        err.code
                    } else {
                        crate::error::error_code::INTERNAL_ERROR
                    };
                    let message = if err.message.is_empty() {
                        "Internal error".to_owned()
                    } else {
                        err.message.clone()
                    };
                    let out = McpError::new(code, message, err.data.clone());
                    if let Err(e) = self.send_error_raw(id.clone(), out).await {
                        self.emit_error(e);
                    }
                }
            }
        } else {
            info!(%id, "inbound request cancelled; suppressing response");
        }

        self.inner.lock().await.inbound.remove(&id);
    }

    // ---------------------------------------------------------------
    // §4.5 notifications (inbound dispatch + outbound send/debounce)
    // ---------------------------------------------------------------

    /// Routes an inbound notification inline (trampoline lookup only, same
    /// ordering rationale as [`Self::handle_inbound_request`]) and spawns
    /// its handler body.
    async fn handle_inbound_notification(
        &self,
        method: String,
        params: Option<Value>,
        extras: MessageExtras,
    ) {
        let trampoline = {
            let inner = self.inner.lock().await;
            inner
                .notification_handlers
                .get(&method)
                .cloned()
                .or_else(|| inner.fallback_notification_handler.clone())
        };
        let Some(trampoline) = trampoline else {
            return;
        };
        let meta = params
            .as_ref()
            .and_then(|v| v.get("_meta"))
            .and_then(|v| v.as_object())
            .map(|m| Meta(m.clone()))
            .unwrap_or_default();
        let extra = NotificationExtra {
            meta,
            auth_info: extras.auth_info,
            request_info: extras.request_info,
            peer: self.clone(),
        };
        let session = self.clone();
        tokio::spawn(async move {
            if let Err(err) = trampoline(params.unwrap_or(Value::Null), extra).await {
                session.emit_error(SessionError::Mcp(err));
            }
        });
    }

    async fn send_notification_envelope(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), SessionError> {
        let envelope = OutboundEnvelope::notification(method, params);
        let value =
            serde_json::to_value(&envelope).map_err(|e| SessionError::Validation(e.to_string()))?;
        self.send_raw(value, SendOptions::default()).await
    }

    /// Send a notification (spec.md §4.5). Debounce-eligible, param-less
    /// notifications are coalesced: only the first call in a scheduling
    /// tick actually sends.
    pub async fn notify(&self, not: R::Not, options: NotificationOptions) -> Result<(), SessionError> {
        let method = not.method().to_owned();
        {
            let inner = self.inner.lock().await;
            inner
                .capabilities
                .assert_notification_capability(&method)
                .map_err(SessionError::Mcp)?;
        }
        let params_value =
            serde_json::to_value(&not).map_err(|e| SessionError::Validation(e.to_string()))?;
        let has_params = !is_empty_params(&params_value);

        let eligible = options.related_request_id.is_none() && !has_params && {
            let inner = self.inner.lock().await;
            inner.options.debounced_notification_methods.contains(&method)
        };

        if eligible {
            let mut inner = self.inner.lock().await;
            if inner.debounce_pending.contains(&method) {
                return Ok(());
            }
            inner.debounce_pending.insert(method.clone());
            drop(inner);

            let session = self.clone();
            let flush_method = method;
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                let transport_present = {
                    let mut inner = session.inner.lock().await;
                    inner.debounce_pending.remove(&flush_method);
                    inner.outbound_tx.is_some()
                };
                if !transport_present {
                    // Open question in spec.md §9: silently drop rather
                    // than surface an error after graceful close.
                    return;
                }
                if let Err(e) = session.send_notification_envelope(&flush_method, None).await {
                    session.emit_error(e);
                }
            });
            Ok(())
        } else {
            let params = if has_params { Some(params_value) } else { None };
            let envelope = OutboundEnvelope::notification(&method, params);
            let value =
                serde_json::to_value(&envelope).map_err(|e| SessionError::Validation(e.to_string()))?;
            self.send_raw(value, SendOptions {
                related_request_id: options.related_request_id,
                resumption_token: None,
            })
            .await
        }
    }

    // ---------------------------------------------------------------
    // §4.7 handler registry
    // ---------------------------------------------------------------

    /// Install a request handler. `validate` parses the raw params into
    /// `In`; the installed trampoline runs it before `cb` (spec.md §4.7,
    /// §9 "schema validation lives in the trampoline").
    pub async fn set_request_handler<In, Out, V, F, Fut>(
        &self,
        method: impl Into<String>,
        validate: V,
        cb: F,
    ) -> Result<(), SessionError>
    where
        V: Fn(Value) -> Result<In, McpError> + Send + Sync + 'static,
        F: Fn(In, RequestExtra<R>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, McpError>> + Send + 'static,
        Out: Serialize,
    {
        let method = method.into();
        let mut inner = self.inner.lock().await;
        inner
            .capabilities
            .assert_request_handler_capability(&method)
            .map_err(SessionError::Mcp)?;
        let trampoline: RequestTrampoline<R> = Arc::new(move |value, extra| {
            let parsed = validate(value);
            let fut = match parsed {
                Ok(input) => {
                    let out = cb(input, extra);
                    Box::pin(async move {
                        out.await
                            .and_then(|r| serde_json::to_value(r).map_err(|e| McpError::internal_error(e.to_string())))
                    }) as BoxFuture<'static, Result<Value, McpError>>
                }
                Err(e) => Box::pin(async move { Err(e) }),
            };
            fut
        });
        inner.request_handlers.insert(method, trampoline);
        Ok(())
    }

    /// Fails if a handler for `method` is already installed (spec.md §4.7,
    /// used by auto-installing canonical handlers).
    pub async fn assert_can_set_request_handler(&self, method: &str) -> Result<(), SessionError> {
        let inner = self.inner.lock().await;
        if inner.request_handlers.contains_key(method) {
            Err(SessionError::Capability(format!(
                "a request handler for {method} is already registered"
            )))
        } else {
            Ok(())
        }
    }

    pub async fn remove_request_handler(&self, method: &str) {
        self.inner.lock().await.request_handlers.remove(method);
    }

    /// Install a catch-all handler invoked when no method-specific request
    /// handler matches (spec.md §4.4, "no handler" fallback path).
    pub async fn set_fallback_request_handler<F, Fut>(&self, cb: F)
    where
        F: Fn(Value, RequestExtra<R>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, McpError>> + Send + 'static,
    {
        let trampoline: RequestTrampoline<R> = Arc::new(move |value, extra| Box::pin(cb(value, extra)));
        self.inner.lock().await.fallback_request_handler = Some(trampoline);
    }

    pub async fn remove_fallback_request_handler(&self) {
        self.inner.lock().await.fallback_request_handler = None;
    }

    pub async fn set_notification_handler<In, F, Fut>(&self, method: impl Into<String>, validate: impl Fn(Value) -> Result<In, McpError> + Send + Sync + 'static, cb: F)
    where
        F: Fn(In, NotificationExtra<R>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), McpError>> + Send + 'static,
    {
        let method = method.into();
        let trampoline: NotificationTrampoline<R> = Arc::new(move |value, extra| {
            let parsed = validate(value);
            match parsed {
                Ok(input) => Box::pin(cb(input, extra)) as BoxFuture<'static, Result<(), McpError>>,
                Err(e) => Box::pin(async move { Err(e) }),
            }
        });
        self.inner.lock().await.notification_handlers.insert(method, trampoline);
    }

    pub async fn remove_notification_handler(&self, method: &str) {
        self.inner.lock().await.notification_handlers.remove(method);
    }

    /// Install a catch-all handler invoked when no method-specific
    /// notification handler matches (spec.md §4.5).
    pub async fn set_fallback_notification_handler<F, Fut>(&self, cb: F)
    where
        F: Fn(Value, NotificationExtra<R>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), McpError>> + Send + 'static,
    {
        let trampoline: NotificationTrampoline<R> =
            Arc::new(move |value, extra| Box::pin(cb(value, extra)));
        self.inner.lock().await.fallback_notification_handler = Some(trampoline);
    }

    pub async fn remove_fallback_notification_handler(&self) {
        self.inner.lock().await.fallback_notification_handler = None;
    }
}

fn coerce_token_to_id(token: &ProgressToken) -> Option<i64> {
    match token {
        RequestId::Number(n) => Some(*n),
        RequestId::String(s) => s.parse::<i64>().ok(),
    }
}

fn is_empty_params(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn normalize_params(value: Value) -> Option<Value> {
    if is_empty_params(&value) {
        None
    } else {
        Some(value)
    }
}

fn merge_progress_token(params: &mut Value, token: RequestId) {
    if !params.is_object() {
        *params = Value::Object(serde_json::Map::new());
    }
    let obj = params.as_object_mut().expect("just normalized to object");
    let mut meta = obj
        .get("_meta")
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default();
    let token_value = match token {
        RequestId::Number(n) => Value::from(n),
        RequestId::String(s) => Value::from(s),
    };
    meta.insert("progressToken".to_owned(), token_value);
    obj.insert("_meta".to_owned(), Value::Object(meta));
}

impl From<crate::model::JsonRpcErrorObject> for McpError {
    fn from(value: crate::model::JsonRpcErrorObject) -> Self {
        McpError::new(value.code, value.message, value.data)
    }
}

//! Request/response endpoint over a one-way message channel.
//!
//! Every endpoint owns an inbox. A single dispatch task drains it, so all
//! handlers of one endpoint run strictly one after another. Work handed to
//! [`Endpoint::reply_blocking`] finishes on the blocking pool instead.
//! Blocking calls tag their message with a fresh correlation id and park on
//! a oneshot until the reply carrying that id comes back through the inbox.
//!
//! Reply rules for a request:
//!
//! - `Reply::Respond(out)` is always sent to the request's `reply_to`.
//! - `Reply::Ack` sends `CALLBACK_INVOKED`, but only to a caller that waits.
//! - `Reply::Silent` sends `NO_REPLY`, again only to a caller that waits.
//!
//! Messages that are themselves replies are never answered, which keeps
//! two endpoints from acknowledging each other forever.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use protocol::Opcode;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::peer::{Inbound, Outbound, PeerHandle, PeerId};
use super::EndpointError;

/// What a handler wants sent back.
#[derive(Debug)]
pub enum Reply {
    /// Generic acknowledgement.
    Ack,
    /// A specific answer.
    Respond(Outbound),
    /// Nothing beyond releasing a blocked caller.
    Silent,
    /// The handler already answered through [`Endpoint::reply`].
    Handled,
}

/// Opcode handler. Runs on the dispatch task.
pub type Handler = Arc<dyn Fn(&mut Inbound) -> Reply + Send + Sync>;

type PeerGoneCallback = Arc<dyn Fn(PeerId) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn default_handler() -> Handler {
    Arc::new(|inbound: &mut Inbound| {
        tracing::debug!(opcode = %inbound.opcode(), "no handler registered, using default");
        if inbound.envelope.expects_reply() {
            Reply::Respond(Outbound::new(Opcode::DEFAULT_CODE))
        } else {
            Reply::Silent
        }
    })
}

struct Inner {
    name: String,
    own: PeerHandle,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    handlers: RwLock<HashMap<Opcode, Handler>>,
    default: RwLock<Handler>,
    peer_gone: RwLock<Option<PeerGoneCallback>>,
    bound: Mutex<Option<PeerHandle>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Inbound>>>,
    next_correlation: AtomicU64,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    stop: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// An RPC endpoint. Clones share the same inbox and handlers.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.inner.name)
            .field("peer", &self.inner.own.id())
            .finish()
    }
}

impl Endpoint {
    pub fn new(name: impl Into<String>) -> Self {
        let (own, inbox) = PeerHandle::channel();
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                own,
                inbox: Mutex::new(Some(inbox)),
                handlers: RwLock::new(HashMap::new()),
                default: RwLock::new(default_handler()),
                peer_gone: RwLock::new(None),
                bound: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                next_correlation: AtomicU64::new(1),
                dispatcher: Mutex::new(None),
                closed: AtomicBool::new(false),
                stop: CancellationToken::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Handle other parties use to reach this endpoint.
    pub fn handle(&self) -> PeerHandle {
        self.inner.own.clone()
    }

    /// Register `handler` for `opcode`. The first registration wins.
    pub fn add_response<F>(&self, opcode: Opcode, handler: F) -> &Self
    where
        F: Fn(&mut Inbound) -> Reply + Send + Sync + 'static,
    {
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if handlers.contains_key(&opcode) {
            tracing::warn!(endpoint = %self.inner.name, opcode = %opcode, "duplicate handler ignored");
        } else {
            handlers.insert(opcode, Arc::new(handler));
        }
        self
    }

    /// Register an opcode that is simply acknowledged.
    pub fn add_ack(&self, opcode: Opcode) -> &Self {
        self.add_response(opcode, |_| Reply::Ack)
    }

    /// Replace the handler used for unregistered opcodes.
    pub fn set_default<F>(&self, handler: F)
    where
        F: Fn(&mut Inbound) -> Reply + Send + Sync + 'static,
    {
        *self
            .inner
            .default
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Arc::new(handler);
    }

    /// Called with the id of every peer a send to which failed.
    pub fn on_peer_gone<F>(&self, callback: F)
    where
        F: Fn(PeerId) + Send + Sync + 'static,
    {
        *self
            .inner
            .peer_gone
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(callback));
    }

    /// Start the dispatch task and return this endpoint's handle.
    ///
    /// Must run inside a tokio runtime. Calling it again is a no-op.
    pub fn start(&self) -> PeerHandle {
        let mut dispatcher = lock(&self.inner.dispatcher);
        if dispatcher.is_none() {
            if let Some(inbox) = lock(&self.inner.inbox).take() {
                let weak = Arc::downgrade(&self.inner);
                let stop = self.inner.stop.clone();
                *dispatcher = Some(tokio::spawn(dispatch_loop(weak, inbox, stop)));
                tracing::debug!(endpoint = %self.inner.name, "dispatcher started");
            }
        }
        self.inner.own.clone()
    }

    pub fn is_started(&self) -> bool {
        lock(&self.inner.dispatcher).is_some()
    }

    /// Set the default peer for `send_*`.
    pub fn bind(&self, peer: PeerHandle) {
        *lock(&self.inner.bound) = Some(peer);
    }

    pub fn bound_peer(&self) -> Option<PeerHandle> {
        lock(&self.inner.bound).clone()
    }

    /// Stop dispatching. Pending callers fail with [`EndpointError::Closed`]
    /// and later inbound messages are dropped.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.stop.cancel();
        if let Some(task) = lock(&self.inner.dispatcher).as_ref() {
            task.abort();
        }
        lock(&self.inner.pending).clear();
        tracing::debug!(endpoint = %self.inner.name, "endpoint closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn bound_or_err(&self) -> Result<PeerHandle, EndpointError> {
        self.bound_peer().ok_or(EndpointError::NotBound)
    }

    /// Fire-and-forget to the bound peer.
    pub fn send_non_blocking(&self, out: Outbound) -> Result<(), EndpointError> {
        let peer = self.bound_or_err()?;
        self.send_to(&peer, out)
    }

    /// Fire-and-forget to an explicit peer.
    pub fn send_to(&self, peer: &PeerHandle, out: Outbound) -> Result<(), EndpointError> {
        if self.is_closed() {
            return Err(EndpointError::Closed);
        }
        let (envelope, attachment) = out.into_parts(None, None);
        self.inner
            .deliver(peer, envelope, attachment)
    }

    /// Answer `request` right away, from inside its handler.
    ///
    /// Lets a handler follow up with more messages that must arrive after
    /// the answer. The handler then returns [`Reply::Handled`].
    pub fn reply(&self, request: &Inbound, out: Outbound) -> Result<(), EndpointError> {
        let Some(peer) = request.reply_to.as_ref() else {
            return Ok(());
        };
        let (envelope, attachment) = out.into_parts(None, request.envelope.correlation);
        self.inner.deliver(peer, envelope, attachment)
    }

    /// Answer `request` from the blocking pool.
    ///
    /// `work` runs off the dispatch task, so slow handlers do not hold up
    /// the rest of the inbox. Returns [`Reply::Handled`] for the handler to
    /// pass on.
    pub fn reply_blocking<F>(&self, request: &Inbound, work: F) -> Reply
    where
        F: FnOnce() -> Outbound + Send + 'static,
    {
        let endpoint = self.clone();
        let request = Inbound {
            envelope: request.envelope.clone(),
            reply_to: request.reply_to.clone(),
            attachment: None,
        };
        tokio::task::spawn_blocking(move || {
            let out = work();
            let opcode = out.opcode;
            if endpoint.reply(&request, out).is_err() {
                tracing::debug!(endpoint = %endpoint.inner.name, opcode = %opcode, "reply dropped");
            }
        });
        Reply::Handled
    }

    /// Send to the bound peer and wait for the reply.
    ///
    /// Waits as long as it takes; see [`Endpoint::send_blocking_timeout`].
    pub async fn send_blocking(&self, out: Outbound) -> Result<Inbound, EndpointError> {
        self.call(out, None).await
    }

    pub async fn send_blocking_timeout(
        &self,
        out: Outbound,
        timeout: Duration,
    ) -> Result<Inbound, EndpointError> {
        self.call(out, Some(timeout)).await
    }

    async fn call(&self, out: Outbound, timeout: Option<Duration>) -> Result<Inbound, EndpointError> {
        if self.is_closed() {
            return Err(EndpointError::Closed);
        }
        if !self.is_started() {
            return Err(EndpointError::NotStarted);
        }
        let peer = self.bound_or_err()?;

        let id = self.inner.next_correlation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(id, tx);

        let opcode = out.opcode;
        let (envelope, attachment) = out.into_parts(Some(id), None);
        if let Err(e) = self.inner.deliver(&peer, envelope, attachment) {
            lock(&self.inner.pending).remove(&id);
            return Err(e);
        }
        tracing::trace!(endpoint = %self.inner.name, opcode = %opcode, correlation = id, "waiting for reply");

        let reply = match timeout {
            None => rx.await,
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    lock(&self.inner.pending).remove(&id);
                    return Err(EndpointError::Timeout(limit));
                }
            },
        };
        reply.map_err(|_| EndpointError::Closed)
    }
}

impl Inner {
    fn deliver(
        &self,
        peer: &PeerHandle,
        envelope: protocol::Envelope,
        attachment: Option<crate::pty::PtyPair>,
    ) -> Result<(), EndpointError> {
        let result = peer.deliver(envelope, Some(self.own.clone()), attachment);
        if result.is_err() {
            tracing::debug!(endpoint = %self.name, peer = %peer.id(), "peer is gone");
            self.notify_peer_gone(peer.id());
        }
        result
    }

    fn notify_peer_gone(&self, peer: PeerId) {
        let callback = self
            .peer_gone
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(callback) = callback {
            callback(peer);
        }
    }

    fn handler_for(&self, opcode: Opcode) -> Option<Handler> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&opcode)
            .cloned()
    }

    fn dispatch(&self, mut inbound: Inbound) {
        let opcode = inbound.opcode();

        if let Some(reply_id) = inbound.envelope.in_reply_to {
            if let Some(handler) = self.handler_for(opcode) {
                let _ = handler(&mut inbound);
            }
            match lock(&self.pending).remove(&reply_id) {
                Some(waiter) => {
                    let _ = waiter.send(inbound);
                }
                None => tracing::debug!(
                    endpoint = %self.name,
                    opcode = %opcode,
                    correlation = reply_id,
                    "reply without a waiting caller"
                ),
            }
            return;
        }

        let handler = match self.handler_for(opcode) {
            Some(handler) => handler,
            None if opcode.is_ack() => {
                tracing::trace!(endpoint = %self.name, opcode = %opcode, "unsolicited ack dropped");
                return;
            }
            None => self
                .default
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        };

        let reply = handler(&mut inbound);
        let correlation = inbound.envelope.correlation;
        let answer = match reply {
            Reply::Respond(out) => Some(out),
            Reply::Ack if correlation.is_some() => Some(Outbound::new(Opcode::CALLBACK_INVOKED)),
            Reply::Silent if correlation.is_some() => Some(Outbound::new(Opcode::NO_REPLY)),
            Reply::Ack | Reply::Silent | Reply::Handled => None,
        };

        let (Some(answer), Some(peer)) = (answer, inbound.reply_to.as_ref()) else {
            return;
        };
        let (envelope, attachment) = answer.into_parts(None, correlation);
        if self.deliver(peer, envelope, attachment).is_err() {
            tracing::debug!(endpoint = %self.name, opcode = %opcode, "reply dropped");
        }
    }
}

async fn dispatch_loop(
    inner: Weak<Inner>,
    mut inbox: mpsc::UnboundedReceiver<Inbound>,
    stop: CancellationToken,
) {
    loop {
        let inbound = tokio::select! {
            _ = stop.cancelled() => break,
            inbound = inbox.recv() => match inbound {
                Some(inbound) => inbound,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        inner.dispatch(inbound);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::Payload;
    use std::sync::atomic::AtomicUsize;

    fn pair() -> (Endpoint, Endpoint) {
        let server = Endpoint::new("server");
        let client = Endpoint::new("client");
        let server_handle = server.start();
        let client_handle = client.start();
        client.bind(server_handle);
        server.bind(client_handle);
        (server, client)
    }

    #[tokio::test]
    async fn test_registered_handler_answers() {
        let (server, client) = pair();
        server.add_response(Opcode::IS_SERVER_ALIVE, |_| {
            Reply::Respond(Outbound::new(Opcode::IS_SERVER_ALIVE).with_flag(true))
        });

        let reply = client
            .send_blocking(Outbound::new(Opcode::IS_SERVER_ALIVE))
            .await
            .unwrap();
        assert_eq!(reply.opcode(), Opcode::IS_SERVER_ALIVE);
        assert!(reply.envelope.flag());
        assert!(reply.envelope.is_reply());
    }

    #[tokio::test]
    async fn test_unregistered_opcode_still_releases_caller() {
        let (_server, client) = pair();
        let reply = client
            .send_blocking_timeout(Outbound::new(Opcode(4242)), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply.opcode(), Opcode::DEFAULT_CODE);
    }

    #[tokio::test]
    async fn test_ack_and_silent_handlers() {
        let (server, client) = pair();
        server.add_ack(Opcode::START_TERMINAL);
        server.add_response(Opcode::TERMINATE, |_| Reply::Silent);

        let ack = client
            .send_blocking(Outbound::new(Opcode::START_TERMINAL))
            .await
            .unwrap();
        assert_eq!(ack.opcode(), Opcode::CALLBACK_INVOKED);

        let none = client
            .send_blocking(Outbound::new(Opcode::TERMINATE))
            .await
            .unwrap();
        assert_eq!(none.opcode(), Opcode::NO_REPLY);
    }

    #[tokio::test]
    async fn test_first_registration_wins() {
        let (server, client) = pair();
        server.add_response(Opcode::LIST_SESSIONS, |_| {
            Reply::Respond(Outbound::new(Opcode::SESSION_LIST).with_args(1, 0))
        });
        server.add_response(Opcode::LIST_SESSIONS, |_| {
            Reply::Respond(Outbound::new(Opcode::SESSION_LIST).with_args(2, 0))
        });

        let reply = client
            .send_blocking(Outbound::new(Opcode::LIST_SESSIONS))
            .await
            .unwrap();
        assert_eq!(reply.envelope.arg1, 1);
    }

    #[tokio::test]
    async fn test_concurrent_calls_get_their_own_replies() {
        let (server, client) = pair();
        server.add_response(Opcode::ATTACH_SESSION, |inbound| {
            let echo = inbound.envelope.arg1;
            Reply::Respond(Outbound::new(Opcode::SESSION_ATTACHED).with_args(echo, 0))
        });

        let mut calls = Vec::new();
        for i in 0..16 {
            let client = client.clone();
            calls.push(tokio::spawn(async move {
                let reply = client
                    .send_blocking(Outbound::new(Opcode::ATTACH_SESSION).with_args(i, 0))
                    .await
                    .unwrap();
                (i, reply.envelope.arg1)
            }));
        }
        for call in calls {
            let (sent, got) = call.await.unwrap();
            assert_eq!(sent, got);
        }
    }

    #[tokio::test]
    async fn test_non_blocking_respond_is_delivered() {
        let (server, client) = pair();
        let seen = Arc::new(AtomicUsize::new(0));
        server.add_response(Opcode::REGISTER_CLIENT, |_| {
            Reply::Respond(Outbound::new(Opcode::REGISTERED_CLIENT))
        });
        let counter = Arc::clone(&seen);
        client.add_response(Opcode::REGISTERED_CLIENT, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Reply::Ack
        });

        client
            .send_non_blocking(Outbound::new(Opcode::REGISTER_CLIENT))
            .unwrap();

        for _ in 0..100 {
            if seen.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsolicited_message_gets_no_default_reply() {
        let server = Endpoint::new("server");
        server.start();
        let (observer, mut rx) = PeerHandle::channel();
        server
            .handle()
            .deliver(
                protocol::Envelope::new(Opcode(4242)),
                Some(observer),
                None,
            )
            .unwrap();

        let got = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(got.is_err(), "uncorrelated message must not be answered");
    }

    #[tokio::test]
    async fn test_dead_peer_reported() {
        let endpoint = Endpoint::new("server");
        endpoint.start();
        let gone = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&gone);
        endpoint.on_peer_gone(move |peer| lock(&sink).push(peer));

        let (dead, rx) = PeerHandle::channel();
        drop(rx);
        let err = endpoint
            .send_to(&dead, Outbound::new(Opcode::SESSIONS_CHANGED))
            .unwrap_err();
        assert!(matches!(err, EndpointError::PeerGone(_)));
        assert_eq!(*lock(&gone), vec![dead.id()]);
    }

    #[tokio::test]
    async fn test_send_without_binding() {
        let endpoint = Endpoint::new("lonely");
        endpoint.start();
        assert!(matches!(
            endpoint.send_non_blocking(Outbound::new(Opcode::START_TERMINAL)),
            Err(EndpointError::NotBound)
        ));
    }

    #[tokio::test]
    async fn test_blocking_call_requires_started_dispatcher() {
        let endpoint = Endpoint::new("idle");
        let (peer, _rx) = PeerHandle::channel();
        endpoint.bind(peer);
        let err = endpoint
            .send_blocking(Outbound::new(Opcode::IS_SERVER_ALIVE))
            .await
            .unwrap_err();
        assert!(matches!(err, EndpointError::NotStarted));
    }

    #[tokio::test]
    async fn test_timeout_on_silent_peer() {
        let client = Endpoint::new("client");
        client.start();
        let (mute, _rx) = PeerHandle::channel();
        client.bind(mute);

        let err = client
            .send_blocking_timeout(
                Outbound::new(Opcode::IS_SERVER_ALIVE),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EndpointError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_payload_reaches_handler() {
        let (server, client) = pair();
        server.add_response(Opcode::REMOVE_SESSION, |inbound| {
            let ok = matches!(
                inbound.envelope.payload,
                Payload::SessionRequest(req) if req.session_id == 11
            );
            Reply::Respond(Outbound::new(Opcode::SESSION_REMOVED).with_flag(ok))
        });

        let reply = client
            .send_blocking(
                Outbound::new(Opcode::REMOVE_SESSION).with_payload(Payload::SessionRequest(
                    protocol::SessionRequest {
                        session_id: 11,
                        cols: 0,
                        rows: 0,
                    },
                )),
            )
            .await
            .unwrap();
        assert!(reply.envelope.flag());
    }

    #[tokio::test]
    async fn test_explicit_reply_precedes_follow_up() {
        let server = Endpoint::new("server");
        server.start();
        let responder = server.clone();
        server.add_response(Opcode::REGISTER_TRACKED_PROCESS, move |inbound| {
            let _ = responder.reply(
                inbound,
                Outbound::new(Opcode::REGISTERED_TRACKED_PROCESS).with_args(1, 0),
            );
            if let Some(peer) = inbound.reply_to.clone() {
                let _ = responder.send_to(&peer, Outbound::new(Opcode::SESSIONS_CHANGED));
            }
            Reply::Handled
        });

        let (caller, mut rx) = PeerHandle::channel();
        let mut request = protocol::Envelope::new(Opcode::REGISTER_TRACKED_PROCESS);
        request.correlation = Some(77);
        server.handle().deliver(request, Some(caller), None).unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.opcode(), Opcode::REGISTERED_TRACKED_PROCESS);
        assert_eq!(first.envelope.in_reply_to, Some(77));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.opcode(), Opcode::SESSIONS_CHANGED);
        assert_eq!(second.envelope.in_reply_to, None);
        drop(server);
    }

    #[tokio::test]
    async fn test_slow_handler_does_not_hold_up_inbox() {
        let (server, client) = pair();
        let responder = server.clone();
        server.add_response(Opcode::REMOVE_SESSION, move |inbound| {
            responder.reply_blocking(inbound, || {
                std::thread::sleep(Duration::from_millis(500));
                Outbound::new(Opcode::SESSION_REMOVED)
            })
        });
        server.add_response(Opcode::IS_SERVER_ALIVE, |_| {
            Reply::Respond(Outbound::new(Opcode::IS_SERVER_ALIVE).with_flag(true))
        });

        let slow_client = client.clone();
        let slow = tokio::spawn(async move {
            slow_client
                .send_blocking_timeout(Outbound::new(Opcode::REMOVE_SESSION), Duration::from_secs(5))
                .await
                .unwrap()
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        let alive = client
            .send_blocking_timeout(Outbound::new(Opcode::IS_SERVER_ALIVE), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(alive.envelope.flag());
        assert!(started.elapsed() < Duration::from_millis(300));

        let removed = slow.await.unwrap();
        assert_eq!(removed.opcode(), Opcode::SESSION_REMOVED);
        assert!(removed.envelope.is_reply());
    }

    #[tokio::test]
    async fn test_dropped_endpoint_stops_dispatcher() {
        let endpoint = Endpoint::new("short-lived");
        let handle = endpoint.start();
        assert!(!handle.is_closed());

        drop(endpoint);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !handle.is_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_closed_endpoint_refuses_calls() {
        let (_server, client) = pair();
        client.close();
        assert!(client.is_closed());
        assert!(matches!(
            client.send_blocking(Outbound::new(Opcode::IS_SERVER_ALIVE)).await,
            Err(EndpointError::Closed)
        ));
    }
}

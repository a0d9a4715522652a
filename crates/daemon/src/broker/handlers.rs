//! Opcode handlers of the broker endpoint.

use std::sync::{Arc, Weak};

use protocol::{Failure, Opcode, Payload, SessionRequest};
use tracing::{debug, warn};

use super::{Broker, BrokerError, BrokerInner};
use crate::rpc::{Inbound, Outbound, Reply};
use crate::session::{SessionId, TerminalSession};

/// Wrap a broker handler so it only holds a weak reference.
fn route<F>(
    weak: &Weak<BrokerInner>,
    handler: F,
) -> impl Fn(&mut Inbound) -> Reply + Send + Sync + 'static
where
    F: Fn(&Broker, &mut Inbound) -> Reply + Send + Sync + 'static,
{
    let weak = weak.clone();
    move |inbound| match weak.upgrade() {
        Some(inner) => handler(&Broker { inner }, inbound),
        None => Reply::Silent,
    }
}

fn failure(opcode: Opcode, error: &BrokerError) -> Outbound {
    Outbound::new(opcode).with_payload(Payload::Failure(Failure::new(error.to_string())))
}

fn id_arg(id: u64) -> i32 {
    i32::try_from(id).unwrap_or(i32::MAX)
}

/// Session addressed by a request: the payload if present, else `arg1`.
/// Run a broker call on the blocking pool and answer from its result.
///
/// Session spawn and shutdown join threads and wait for children.
fn offload<F>(broker: &Broker, inbound: &Inbound, work: F) -> Reply
where
    F: FnOnce(&Broker) -> Outbound + Send + 'static,
{
    let owned = broker.clone();
    broker
        .endpoint()
        .reply_blocking(inbound, move || work(&owned))
}

fn session_request(inbound: &Inbound) -> Option<SessionRequest> {
    match &inbound.envelope.payload {
        Payload::SessionRequest(request) => Some(*request),
        _ if inbound.envelope.arg1 > 0 => Some(SessionRequest {
            session_id: inbound.envelope.arg1 as u64,
            cols: 0,
            rows: 0,
        }),
        _ => None,
    }
}

/// Spawn size requested with a create call, if any.
fn requested_size(inbound: &Inbound) -> Option<(u16, u16)> {
    match &inbound.envelope.payload {
        Payload::SessionRequest(SessionRequest { cols, rows, .. }) if *cols > 0 && *rows > 0 => {
            Some((*cols, *rows))
        }
        _ => None,
    }
}

fn created(result: Result<TerminalSession, BrokerError>) -> Outbound {
    match result {
        Ok(session) => Outbound::new(Opcode::SESSION_CREATED)
            .with_args(id_arg(session.id().0), 0)
            .with_payload(Payload::Session(session.summary())),
        Err(e) => {
            warn!(error = %e, "session creation failed");
            failure(Opcode::SESSION_REQUEST_FAILED, &e)
        }
    }
}

pub(super) fn install(inner: &Arc<BrokerInner>) {
    let weak = Arc::downgrade(inner);
    let endpoint = &inner.endpoint;

    endpoint.add_response(
        Opcode::REGISTER_CLIENT,
        route(&weak, |broker, inbound| {
            if let Some(peer) = inbound.reply_to.clone() {
                debug!(peer = %peer.id(), "client registered");
                broker.clients().register(peer);
            }
            Reply::Respond(Outbound::new(Opcode::REGISTERED_CLIENT))
        }),
    );

    endpoint.add_response(
        Opcode::UNREGISTER_CLIENT,
        route(&weak, |broker, inbound| {
            if let Some(peer) = inbound.reply_to.as_ref() {
                broker.clients().unregister(peer.id());
            }
            Reply::Respond(Outbound::new(Opcode::UNREGISTERED_CLIENT))
        }),
    );

    endpoint.add_response(
        Opcode::REGISTER_TRACKED_PROCESS,
        route(&weak, |broker, inbound| {
            let registration = match &inbound.envelope.payload {
                Payload::Registration(registration) => Some(registration.clone()),
                _ => None,
            };
            let result = match (registration, inbound.take_attachment()) {
                (None, _) => Err(BrokerError::MissingRegistration),
                (Some(_), None) => Err(BrokerError::MissingPtyPair),
                (Some(registration), Some(pair)) => broker.register_tracked(registration, pair),
            };

            match result {
                Ok(id) => {
                    let reply = Outbound::new(Opcode::REGISTERED_TRACKED_PROCESS)
                        .with_args(id_arg(id.0), 0);
                    if let Err(e) = broker.endpoint().reply(inbound, reply) {
                        debug!(error = %e, "registrant went away before the reply");
                    }
                    broker.broadcast_sessions_changed();
                    Reply::Handled
                }
                Err(e) => {
                    warn!(error = %e, "tracked process registration refused");
                    Reply::Respond(failure(Opcode::REGISTER_TRACKED_PROCESS_FAILED, &e))
                }
            }
        }),
    );

    endpoint.add_response(
        Opcode::START_TERMINAL,
        route(&weak, |broker, _| {
            broker.present_session_list();
            Reply::Respond(Outbound::new(Opcode::STARTED_TERMINAL))
        }),
    );

    endpoint.add_response(
        Opcode::CREATE_SHELL_SESSION,
        route(&weak, |broker, inbound| {
            let size = requested_size(inbound);
            offload(broker, inbound, move |broker| created(broker.create_shell_session(size)))
        }),
    );

    endpoint.add_response(
        Opcode::CREATE_LOGCAT_SESSION,
        route(&weak, |broker, inbound| {
            let size = requested_size(inbound);
            offload(broker, inbound, move |broker| created(broker.create_logcat_session(size)))
        }),
    );

    endpoint.add_response(
        Opcode::CREATE_LOG_SESSION,
        route(&weak, |broker, inbound| {
            let size = requested_size(inbound);
            offload(broker, inbound, move |broker| created(broker.create_log_session(size)))
        }),
    );

    endpoint.add_response(
        Opcode::ATTACH_SESSION,
        route(&weak, |broker, inbound| {
            let Some(request) = session_request(inbound) else {
                return Reply::Respond(failure(
                    Opcode::SESSION_REQUEST_FAILED,
                    &BrokerError::SessionNotFound(SessionId(0)),
                ));
            };
            offload(broker, inbound, move |broker| {
                let id = SessionId(request.session_id);
                match broker.attach_session(id, request.cols, request.rows) {
                    Ok(session) => Outbound::new(Opcode::SESSION_ATTACHED)
                        .with_args(id_arg(request.session_id), 0)
                        .with_payload(Payload::Session(session.summary())),
                    Err(e) => failure(Opcode::SESSION_REQUEST_FAILED, &e),
                }
            })
        }),
    );

    endpoint.add_response(
        Opcode::REMOVE_SESSION,
        route(&weak, |broker, inbound| {
            let Some(request) = session_request(inbound) else {
                return Reply::Respond(failure(
                    Opcode::SESSION_REQUEST_FAILED,
                    &BrokerError::SessionNotFound(SessionId(0)),
                ));
            };
            offload(broker, inbound, move |broker| {
                match broker.remove_session(SessionId(request.session_id)) {
                    Ok(()) => Outbound::new(Opcode::SESSION_REMOVED)
                        .with_args(id_arg(request.session_id), 0),
                    Err(e) => failure(Opcode::SESSION_REQUEST_FAILED, &e),
                }
            })
        }),
    );

    endpoint.add_response(
        Opcode::LIST_SESSIONS,
        route(&weak, |broker, _| {
            Reply::Respond(
                Outbound::new(Opcode::SESSION_LIST).with_payload(Payload::Sessions(broker.summaries())),
            )
        }),
    );

    endpoint.add_response(
        Opcode::IS_SERVER_ALIVE,
        route(&weak, |_, _| {
            Reply::Respond(Outbound::new(Opcode::IS_SERVER_ALIVE).with_flag(true))
        }),
    );

    endpoint.add_response(
        Opcode::ARE_SESSIONS_EMPTY,
        route(&weak, |broker, _| {
            Reply::Respond(Outbound::new(Opcode::ARE_SESSIONS_EMPTY).with_flag(broker.is_empty()))
        }),
    );

    endpoint.add_response(
        Opcode::DOES_SERVER_WANT_TO_STOP,
        route(&weak, |broker, _| {
            Reply::Respond(
                Outbound::new(Opcode::DOES_SERVER_WANT_TO_STOP).with_flag(broker.wants_to_stop()),
            )
        }),
    );

    endpoint.add_response(
        Opcode::TERMINATE,
        route(&weak, |broker, _| {
            // Session shutdown blocks; the reply goes out first.
            let broker = broker.clone();
            tokio::task::spawn_blocking(move || broker.terminate());
            Reply::Respond(Outbound::new(Opcode::TERMINATING))
        }),
    );
}

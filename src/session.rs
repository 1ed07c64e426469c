//! One live connection: the wire protocol state machine.
//!
//! A session moves through Opening → Admitted → Live → Closing. Opening
//! parses the connection URL, resolves the room, and enforces capacity;
//! Admitted sends `INIT_STATE` and announces the join; Live processes
//! inbound frames in arrival order while draining the session's bounded
//! outbound queue. Every termination cause — client close, transport
//! error, protocol violation, backpressure eviction, reaping — funnels
//! into [`finish_session`], which releases the session's leases, detaches
//! it from the hub, and removes its presence entry. The procedure is
//! idempotent, so a reaper sweep racing the session's own teardown still
//! yields at-most-once lease release and a single `USER_LEFT`.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, Uri};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::SessionQueues;
use crate::lease::{AcquireOutcome, BlockId};
use crate::presence::sanitize_nickname;
use crate::protocol::{self, close, ClientFrame, ProtocolError, ServerFrame, UserEntry};
use crate::registry::{RoomCtx, RoomRegistry};
use crate::server::ServerConfig;

/// What the client asked for in the connection URL.
#[derive(Debug, PartialEq, Eq)]
struct ConnectRequest {
    room_id: String,
    nickname: Option<String>,
}

/// Parse `/ws/workspace/{room_id}/?nickname={name}`.
fn parse_request(uri: &Uri) -> Option<ConnectRequest> {
    let rest = uri.path().strip_prefix("/ws/workspace/")?;
    let room = rest.strip_suffix('/').unwrap_or(rest);
    if room.is_empty() || room.contains('/') {
        return None;
    }
    let room_id = urlencoding::decode(room).ok()?.into_owned();
    let nickname = uri.query().and_then(|query| {
        query.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            if key == "nickname" {
                urlencoding::decode(value).ok().map(|v| v.into_owned())
            } else {
                None
            }
        })
    });
    Some(ConnectRequest { room_id, nickname })
}

/// Serve one accepted TCP connection to completion.
pub async fn run(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<RoomRegistry>,
    config: Arc<ServerConfig>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Opening: capture the request URI during the WebSocket handshake.
    let mut request_uri: Option<Uri> = None;
    let callback = |req: &Request, resp: Response| {
        if !req.uri().path().starts_with("/ws/workspace/") {
            let mut response =
                ErrorResponse::new(Some("expected /ws/workspace/{room_id}/".to_string()));
            *response.status_mut() = StatusCode::BAD_REQUEST;
            return Err(response);
        }
        request_uri = Some(req.uri().clone());
        Ok(resp)
    };
    let mut ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            log::debug!("handshake failed from {addr}: {e}");
            return Ok(());
        }
    };

    let Some(request) = request_uri.as_ref().and_then(parse_request) else {
        send_close(&mut ws, close::PROTOCOL_ERROR, "invalid workspace path").await;
        return Ok(());
    };

    let client_id = Uuid::new_v4();
    let room = match registry.get_or_create(&request.room_id).await {
        Ok(room) => room,
        Err(e) => {
            log::error!("opening failed for room {}: {e}", request.room_id);
            send_close(&mut ws, close::INTERNAL_ERROR, "room lookup failed").await;
            return Ok(());
        }
    };

    let nickname = sanitize_nickname(request.nickname.as_deref(), client_id);
    let Some(participant) = room
        .presence
        .add(client_id, nickname, room.meta.max_users)
        .await
    else {
        log::info!("room {} at capacity, refusing {addr}", room.id);
        send_close(&mut ws, close::ROOM_FULL, "room full").await;
        return Ok(());
    };
    log::info!(
        "{} ({client_id}) joined room {} from {addr}",
        participant.nickname,
        room.id
    );

    let mut queues = room.hub.attach(client_id).await;

    // Admitted: current view first, then the join announcement.
    let users = room
        .presence
        .list()
        .await
        .into_iter()
        .filter(|p| p.client_id != client_id)
        .map(|p| UserEntry {
            client_id: p.client_id,
            nickname: p.nickname,
            color: p.color,
        })
        .collect();
    let init = ServerFrame::InitState {
        client_id,
        users,
        locks: room.leases.snapshot().await,
        workspace_xml: room.snapshot.get().await,
    };
    let admitted = async {
        room.hub.send_to(client_id, &init).await?;
        room.hub
            .broadcast(
                &ServerFrame::UserJoined {
                    client_id,
                    nickname: participant.nickname.clone(),
                    color: participant.color.clone(),
                },
                Some(client_id),
            )
            .await
    }
    .await;

    let (mut ws_tx, mut ws_rx) = ws.split();
    let directive = match admitted {
        Ok(_) => live_loop(&mut ws_tx, &mut ws_rx, &room, client_id, &config, &mut queues).await,
        Err(e) => {
            log::error!("admission frames failed for {client_id}: {e}");
            Some((close::INTERNAL_ERROR, "internal error"))
        }
    };

    // Closing: leases, hub, presence — then the transport.
    finish_session(&room, client_id).await;
    if let Some((code, reason)) = directive {
        send_close(&mut ws_tx, code, reason).await;
    }
    Ok(())
}

/// Live state: pump inbound frames and the outbound queue until a
/// termination cause fires. Returns the close code to report, if the
/// server is the one closing.
async fn live_loop<T, R>(
    ws_tx: &mut T,
    ws_rx: &mut R,
    room: &RoomCtx,
    client_id: Uuid,
    config: &ServerConfig,
    queues: &mut SessionQueues,
) -> Option<(u16, &'static str)>
where
    T: Sink<Message> + Unpin,
    R: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let mut hub_detached = false;
    let directive = loop {
        tokio::select! {
            inbound = ws_rx.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    match protocol::parse_client_frame(text.as_str()) {
                        Ok(frame) => {
                            // Any well-formed frame is liveness, whether or
                            // not the tag is recognized.
                            room.presence.touch(client_id).await;
                            match frame {
                                Some(frame) => {
                                    if let Err(e) =
                                        handle_frame(room, client_id, config, frame).await
                                    {
                                        log::error!("frame handling failed for {client_id}: {e}");
                                        break Some((close::INTERNAL_ERROR, "internal error"));
                                    }
                                }
                                None => log::debug!("ignoring unknown frame from {client_id}"),
                            }
                        }
                        Err(e) => {
                            log::warn!("protocol violation from {client_id}: {e}");
                            break Some((close::PROTOCOL_ERROR, "malformed frame"));
                        }
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    log::warn!("protocol violation from {client_id}: binary frame");
                    break Some((close::PROTOCOL_ERROR, "text frames only"));
                }
                Some(Ok(Message::Ping(payload))) => {
                    if ws_tx.send(Message::Pong(payload)).await.is_err() {
                        break None;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break None,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("transport error for {client_id}: {e}");
                    break None;
                }
            },
            outbound = queues.frames.recv() => match outbound {
                Some(frame) => {
                    if ws_tx.send(Message::Text(frame.as_str().into())).await.is_err() {
                        break None;
                    }
                }
                None => {
                    hub_detached = true;
                    break None;
                }
            },
            code = queues.kick.recv() => break code.map(kick_directive),
        }
    };
    if hub_detached && directive.is_none() {
        // The hub kicks before detaching; pick up the buffered code.
        return queues.kick.try_recv().ok().map(kick_directive);
    }
    directive
}

fn kick_directive(code: u16) -> (u16, &'static str) {
    match code {
        close::TRY_AGAIN => (code, "outbound queue overflow"),
        close::NORMAL => (code, "idle timeout"),
        _ => (code, "evicted"),
    }
}

/// Handle one accepted inbound frame.
async fn handle_frame(
    room: &RoomCtx,
    client_id: Uuid,
    config: &ServerConfig,
    frame: ClientFrame,
) -> Result<(), ProtocolError> {
    match frame {
        ClientFrame::LockAcquire { block_id, also } => {
            let keys = group_keys(block_id, also);
            match room
                .leases
                .acquire_many(&keys, client_id, config.lease_ttl)
                .await
            {
                AcquireOutcome::Granted { acquired } => {
                    for key in acquired {
                        room.hub
                            .broadcast(
                                &ServerFrame::LockUpdate {
                                    block_id: key,
                                    owner: Some(client_id),
                                },
                                None,
                            )
                            .await?;
                    }
                }
                AcquireOutcome::Denied { conflicts } => {
                    if let Some(first) = conflicts.first() {
                        room.hub
                            .send_to(
                                client_id,
                                &ServerFrame::LockDenied {
                                    block_id: first.key.clone(),
                                    owner: first.owner,
                                    ttl_ms: first.remaining.as_millis() as u64,
                                },
                            )
                            .await?;
                    }
                }
            }
        }

        ClientFrame::Commit {
            block_id,
            events,
            workspace_xml,
            release_lock,
            also,
        } => {
            // Ownership gate: a lease on the block must be ours, if any.
            if let Some(owner) = room.leases.owner_of(&block_id).await {
                if owner != client_id {
                    room.hub
                        .send_to(client_id, &ServerFrame::CommitRejected { block_id, owner })
                        .await?;
                    return Ok(());
                }
            }

            // Only a stored snapshot is echoed to peers.
            let stored_xml = match workspace_xml {
                Some(xml) => match room.snapshot.put(xml.clone()).await {
                    Ok(()) => Some(xml),
                    Err(e) => {
                        log::warn!("snapshot rejected for room {}: {e}", room.id);
                        None
                    }
                },
                None => None,
            };

            room.hub
                .broadcast(
                    &ServerFrame::CommitApply {
                        block_id: block_id.clone(),
                        events,
                        by: client_id,
                        workspace_xml: stored_xml,
                    },
                    None,
                )
                .await?;

            let keys = group_keys(block_id, also);
            if release_lock {
                let released = room.leases.release_many(&keys, client_id).await;
                for key in released {
                    room.hub
                        .broadcast(
                            &ServerFrame::LockUpdate {
                                block_id: key,
                                owner: None,
                            },
                            None,
                        )
                        .await?;
                }
            } else {
                // Still editing: keep the committed group's leases alive.
                room.leases
                    .extend_by_owner(client_id, &keys, config.lease_ttl)
                    .await;
            }
        }

        ClientFrame::Heartbeat {} => {
            // last_seen was refreshed on frame acceptance; nothing else.
        }
    }
    Ok(())
}

/// The Closing procedure. Runs for every termination cause and is safe
/// to invoke concurrently with itself (session teardown racing a reaper
/// sweep): lease release and the `USER_LEFT` broadcast happen at most
/// once.
pub(crate) async fn finish_session(room: &RoomCtx, client_id: Uuid) {
    let released = room.leases.release_all(client_id).await;
    for key in released {
        if let Err(e) = room
            .hub
            .broadcast(
                &ServerFrame::LockUpdate {
                    block_id: key,
                    owner: None,
                },
                None,
            )
            .await
        {
            log::warn!("lock release broadcast failed in room {}: {e}", room.id);
        }
    }

    room.hub.detach(client_id).await;

    if let Some(participant) = room.presence.remove(client_id).await {
        log::info!(
            "{} ({client_id}) left room {}",
            participant.nickname,
            room.id
        );
        if let Err(e) = room
            .hub
            .broadcast(&ServerFrame::UserLeft { client_id }, None)
            .await
        {
            log::warn!("departure broadcast failed in room {}: {e}", room.id);
        }
    }
}

/// Primary key plus `also`, deduplicated, order preserved.
fn group_keys(primary: String, also: Vec<String>) -> Vec<BlockId> {
    let mut seen = HashSet::with_capacity(1 + also.len());
    let mut keys = Vec::with_capacity(1 + also.len());
    for key in std::iter::once(primary).chain(also) {
        if seen.insert(key.clone()) {
            keys.push(key);
        }
    }
    keys
}

async fn send_close<S>(ws: &mut S, code: u16, reason: &'static str)
where
    S: Sink<Message> + Unpin,
{
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    };
    if ws.send(Message::Close(Some(frame))).await.is_err() {
        log::debug!("close frame ({code}) not delivered");
    }
}

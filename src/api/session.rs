// =============================================================================
// Subscriber Session — one per downstream WebSocket connection
// =============================================================================
//
// The session owns the socket. Hub frames arrive on a bounded queue that the
// hub fills with try_send: a hub merge never waits on a slow socket. The
// session runs a single select loop over the outbound queue, the hub's kill
// signal, and inbound control messages; dropping out of the loop detaches
// from every attached hub and closes the socket.
// =============================================================================

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::hub::cache::{clamp_book_limit, validate_rounding, BookParams};
use crate::hub::stream_hub::{SubscriberSpec, SUBSCRIBER_QUEUE};
use crate::hub::HubKey;
use crate::symbols::SymbolMeta;
use crate::types::{error_frame, pong_frame, ControlMessage, ErrorCode, StreamKind, Timeframe};

/// Everything the dispatcher resolved before the socket upgrade.
pub struct SessionConfig {
    pub key: HubKey,
    pub meta: SymbolMeta,
    pub book_params: Option<BookParams>,
    pub container_width: Option<u32>,
    /// Liquidation sockets opt into volume frames by naming a timeframe;
    /// the session then attaches to a second hub on the same queue.
    pub volume_key: Option<HubKey>,
}

/// Send one error frame and close. Used for validation failures where no
/// session ever starts.
pub async fn reject(mut socket: WebSocket, code: ErrorCode, message: &str) {
    let frame = error_frame(code, message).to_string();
    let _ = socket.send(Message::Text(frame)).await;
    let _ = socket.send(Message::Close(None)).await;
}

/// Attach to the hub(s) and pump frames until either side closes.
pub async fn run(socket: WebSocket, state: Arc<AppState>, config: SessionConfig) {
    let session_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel::<String>(SUBSCRIBER_QUEUE);

    let (kill_tx, mut kill_rx) = oneshot::channel::<ErrorCode>();
    state.hubs.attach(
        &config.key,
        &config.meta,
        SubscriberSpec {
            id: session_id,
            tx: tx.clone(),
            kill: kill_tx,
            book_params: config.book_params,
            container_width: config.container_width,
        },
    );
    let mut primary_key = config.key.clone();

    // The placeholder sender keeps the spare kill channel silent for
    // sessions without a volume hub.
    let (volume_kill_keepalive, mut volume_kill_rx) = oneshot::channel::<ErrorCode>();
    let mut _volume_keepalive = Some(volume_kill_keepalive);
    let mut volume_key = config.volume_key.clone();
    if let Some(key) = &volume_key {
        let (vk_tx, vk_rx) = oneshot::channel();
        volume_kill_rx = vk_rx;
        _volume_keepalive = None;
        state.hubs.attach(
            key,
            &config.meta,
            SubscriberSpec {
                id: session_id,
                tx: tx.clone(),
                kill: vk_tx,
                book_params: None,
                container_width: config.container_width,
            },
        );
    }

    info!(session = %session_id, hub = %primary_key, "session opened");

    let (mut sink, mut stream) = socket.split();
    let mut close_code: Option<ErrorCode> = None;

    loop {
        tokio::select! {
            // ── Hub frames ──────────────────────────────────────────────
            frame = rx.recv() => match frame {
                Some(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        debug!(session = %session_id, "socket send failed");
                        break;
                    }
                }
                None => break,
            },

            // ── Hub evicted us ──────────────────────────────────────────
            code = &mut kill_rx => {
                close_code = Some(code.unwrap_or(ErrorCode::Internal));
                break;
            }
            code = &mut volume_kill_rx => {
                close_code = Some(code.unwrap_or(ErrorCode::Internal));
                break;
            }

            // ── Inbound control messages ────────────────────────────────
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match handle_control(
                        &state,
                        session_id,
                        &config,
                        &mut primary_key,
                        &mut volume_key,
                        &mut kill_rx,
                        &mut volume_kill_rx,
                        &tx,
                        &text,
                    )
                    .await
                    {
                        ControlOutcome::Continue => {}
                        ControlOutcome::Reply(frame) => {
                            if sink.send(Message::Text(frame)).await.is_err() {
                                break;
                            }
                        }
                        ControlOutcome::Close(code, message) => {
                            let frame = error_frame(code, &message).to_string();
                            let _ = sink.send(Message::Text(frame)).await;
                            break;
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    if sink.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(session = %session_id, "client closed");
                    break;
                }
                Some(Ok(_)) => {} // binary / pong: ignored
                Some(Err(e)) => {
                    debug!(session = %session_id, error = %e, "socket receive error");
                    break;
                }
            },
        }
    }

    // A hub-initiated close still owes the client its error frame.
    if let Some(code) = close_code {
        let message = match code {
            ErrorCode::SlowConsumer => "outbound queue overflow",
            _ => "stream terminated",
        };
        let frame = error_frame(code, message).to_string();
        let _ = sink.send(Message::Text(frame)).await;
        warn!(session = %session_id, code = %code, "session closed by hub");
    }
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;

    state.hubs.detach(&primary_key, session_id);
    if let Some(key) = &volume_key {
        state.hubs.detach(key, session_id);
    }
    info!(session = %session_id, "session closed");
}

// =============================================================================
// Control messages
// =============================================================================

enum ControlOutcome {
    Continue,
    Reply(String),
    Close(ErrorCode, String),
}

#[allow(clippy::too_many_arguments)]
async fn handle_control(
    state: &Arc<AppState>,
    session_id: Uuid,
    config: &SessionConfig,
    primary_key: &mut HubKey,
    volume_key: &mut Option<HubKey>,
    kill_rx: &mut oneshot::Receiver<ErrorCode>,
    volume_kill_rx: &mut oneshot::Receiver<ErrorCode>,
    tx: &mpsc::Sender<String>,
    text: &str,
) -> ControlOutcome {
    let message: ControlMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(_) => {
            debug!(session = %session_id, msg = %text, "ignoring unknown client message");
            return ControlOutcome::Continue;
        }
    };

    match message {
        ControlMessage::Ping => ControlOutcome::Reply(pong_frame().to_string()),

        ControlMessage::UpdateParams { limit, rounding } => {
            if primary_key.kind != StreamKind::OrderBook {
                debug!(session = %session_id, "update_params on a non-orderbook stream ignored");
                return ControlOutcome::Continue;
            }
            let Some(hub) = state.hubs.get(primary_key) else {
                return ControlOutcome::Continue;
            };
            let current = hub.params_of(session_id).unwrap_or(BookParams {
                limit: 100,
                rounding: config.meta.default_rounding,
            });
            let params = BookParams {
                limit: limit
                    .map(|l| clamp_book_limit(l, state.config.max_orderbook_limit))
                    .unwrap_or(current.limit),
                rounding: validate_rounding(rounding.or(Some(current.rounding)), &config.meta),
            };
            hub.update_params(session_id, params);
            ControlOutcome::Continue
        }

        ControlMessage::ChangeTimeframe { timeframe } => {
            let Some(tf) = Timeframe::parse(&timeframe) else {
                return ControlOutcome::Close(
                    ErrorCode::InvalidTimeframe,
                    format!("timeframe '{timeframe}' is not supported"),
                );
            };

            match primary_key.kind {
                StreamKind::Candles => {
                    if primary_key.timeframe == Some(tf) {
                        return ControlOutcome::Continue;
                    }
                    // Modelled as detach + attach on the new hub key; the new
                    // hub's initial frame resynchronises the client.
                    state.hubs.detach(primary_key, session_id);
                    let new_key =
                        HubKey::new(primary_key.symbol.clone(), StreamKind::Candles, Some(tf));
                    let (new_kill_tx, new_kill_rx) = oneshot::channel();
                    *kill_rx = new_kill_rx;
                    state.hubs.attach(
                        &new_key,
                        &config.meta,
                        SubscriberSpec {
                            id: session_id,
                            tx: tx.clone(),
                            kill: new_kill_tx,
                            book_params: None,
                            container_width: config.container_width,
                        },
                    );
                    *primary_key = new_key;
                    info!(session = %session_id, timeframe = %tf, "candle timeframe changed");
                    ControlOutcome::Continue
                }
                StreamKind::Liquidations => {
                    if volume_key.as_ref().and_then(|k| k.timeframe) == Some(tf) {
                        return ControlOutcome::Continue;
                    }
                    if let Some(old) = volume_key.take() {
                        state.hubs.detach(&old, session_id);
                    }
                    let new_key = HubKey::new(
                        primary_key.symbol.clone(),
                        StreamKind::LiquidationVolume,
                        Some(tf),
                    );
                    let (new_kill_tx, new_kill_rx) = oneshot::channel();
                    *volume_kill_rx = new_kill_rx;
                    state.hubs.attach(
                        &new_key,
                        &config.meta,
                        SubscriberSpec {
                            id: session_id,
                            tx: tx.clone(),
                            kill: new_kill_tx,
                            book_params: None,
                            container_width: config.container_width,
                        },
                    );
                    *volume_key = Some(new_key);
                    info!(session = %session_id, timeframe = %tf, "liquidation volume timeframe changed");
                    ControlOutcome::Continue
                }
                _ => {
                    debug!(session = %session_id, "change_timeframe on a fixed-timeframe stream ignored");
                    ControlOutcome::Continue
                }
            }
        }
    }
}

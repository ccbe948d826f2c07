/// com.atproto.sync.subscribeRepos: the firehose websocket.
///
/// Frames are binary `CBOR(header) ‖ CBOR(payload)`. A connection with a
/// cursor first replays stored frames, then switches to live events; the
/// live channel is registered before replay starts and deduplicated by seq,
/// so nothing sequenced during replay is lost or doubled. A cursor older
/// than retention earns an `#info OutdatedCursor` frame first.
use crate::context::AppContext;
use crate::metrics;
use crate::sequencer::frames::{encode_info_frame, InfoFrame};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct SubscribeReposParams {
    pub cursor: Option<i64>,
}

async fn subscribe_repos(
    ws: WebSocketUpgrade,
    Query(params): Query<SubscribeReposParams>,
    State(ctx): State<AppContext>,
) -> Response {
    ws.on_upgrade(move |socket| handle_subscription(socket, params, ctx))
}

async fn handle_subscription(socket: WebSocket, params: SubscribeReposParams, ctx: AppContext) {
    let (mut sender, mut receiver) = socket.split();

    // register for live events before replaying so nothing slips between
    let (mut live, _guard) = ctx.sequencer.subscribe("subscribe-repos");

    let mut last_sent: i64 = 0;

    if let Some(cursor) = params.cursor {
        let current = ctx.sequencer.persister().current_seq().await;
        // a cursor in the future starts from the present
        let cursor = cursor.min(current);

        let oldest = ctx
            .sequencer
            .persister()
            .oldest_seq()
            .await
            .ok()
            .flatten();
        if let Some(oldest) = oldest {
            if cursor >= 0 && cursor + 1 < oldest {
                let frame = encode_info_frame(&InfoFrame {
                    name: "OutdatedCursor".to_string(),
                    message: Some("Cursor is older than available events".to_string()),
                });
                if let Ok(frame) = frame {
                    if sender.send(Message::Binary(frame)).await.is_err() {
                        return;
                    }
                }
            }
        }

        let replay_from = cursor.max(0);
        let mut frames: Vec<(i64, Vec<u8>)> = Vec::new();
        let replayed = ctx
            .sequencer
            .persister()
            .playback(replay_from, |evt| {
                frames.push((evt.seq, evt.frame));
                Ok(())
            })
            .await;
        if let Err(e) = replayed {
            tracing::error!("firehose playback failed: {}", e);
            return;
        }

        for (seq, frame) in frames {
            if sender.send(Message::Binary(frame)).await.is_err() {
                return;
            }
            metrics::FIREHOSE_FRAMES_SENT
                .with_label_values(&["replay"])
                .inc();
            last_sent = seq;
        }
    }

    loop {
        tokio::select! {
            event = live.recv() => {
                match event {
                    Some(event) => {
                        // replay already covered this seq
                        if event.seq != 0 && event.seq <= last_sent {
                            continue;
                        }
                        if sender.send(Message::Binary(event.frame.clone())).await.is_err() {
                            break;
                        }
                        metrics::FIREHOSE_FRAMES_SENT
                            .with_label_values(&["live"])
                            .inc();
                        if event.seq != 0 {
                            last_sent = event.seq;
                        }
                    }
                    // channel closed: dropped for slowness or shutdown
                    None => break,
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::debug!("websocket error: {}", e);
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    // nudge relays to reconnect once a consumer is gone
    if ctx.relay.has_relays() {
        ctx.relay.request_crawl().await;
    }
}

pub fn routes() -> Router<AppContext> {
    Router::new().route("/xrpc/com.atproto.sync.subscribeRepos", get(subscribe_repos))
}

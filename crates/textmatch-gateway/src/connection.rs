use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use textmatch_types::events::{GatewayCommand, GatewayEvent};

use crate::subscription::{CallbackHandle, Subscription};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Opens the feeds of one authenticated socket.
///
/// An `Err` is the refusal reason sent back to the client.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn conversation_feed(&self, conversation_id: &str) -> Result<Subscription<GatewayEvent>, String>;

    async fn notification_feed(&self) -> Result<Subscription<GatewayEvent>, String>;
}

/// Feeds open on one socket. Dropping it cancels every feed.
#[derive(Default)]
struct Feeds {
    conversations: HashMap<String, CallbackHandle>,
    notifications: Option<CallbackHandle>,
}

/// Serves a WebSocket whose token was validated at the HTTP upgrade.
pub async fn handle_connection(
    socket: WebSocket,
    source: Arc<dyn FeedSource>,
    user_id: String,
    display_name: String,
) {
    let (mut sender, receiver) = socket.split();

    info!("{} ({}) connected to gateway", display_name, user_id);

    let ready = GatewayEvent::Ready {
        user_id: user_id.clone(),
    };
    if send_event(&mut sender, &ready).await.is_err() {
        return;
    }

    run_connection_loop(sender, receiver, source, &user_id).await;
    info!("{} ({}) disconnected from gateway", display_name, user_id);
}

async fn send_event(sender: &mut SplitSink<WebSocket, Message>, event: &GatewayEvent) -> Result<(), ()> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to encode gateway event: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    source: Arc<dyn FeedSource>,
    user_id: &str,
) {
    // Every feed of this socket funnels into one outbound queue.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<GatewayEvent>();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received;

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = out_rx.recv() => {
                    let Some(event) = event else { break };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let recv_user = user_id.to_string();
    let mut recv_task = tokio::spawn(async move {
        let mut feeds = Feeds::default();

        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(source.as_ref(), &recv_user, cmd, &mut feeds, &out_tx).await;
                    }
                    Err(e) => {
                        warn!(
                            "{} bad command: {} -- raw: {}",
                            recv_user,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }

        // Closing the socket ends every feed before the task exits.
        for (_, feed) in feeds.conversations.drain() {
            feed.unsubscribe().await;
        }
        if let Some(feed) = feeds.notifications.take() {
            feed.unsubscribe().await;
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

async fn handle_command(
    source: &dyn FeedSource,
    user_id: &str,
    cmd: GatewayCommand,
    feeds: &mut Feeds,
    out: &mpsc::UnboundedSender<GatewayEvent>,
) {
    match cmd {
        GatewayCommand::Subscribe { conversation_id } => {
            if feeds.conversations.contains_key(&conversation_id) {
                return;
            }

            let feed = match source.conversation_feed(&conversation_id).await {
                Ok(feed) => feed,
                Err(reason) => {
                    warn!("{} refused conversation {}: {}", user_id, conversation_id, reason);
                    let _ = out.send(GatewayEvent::SubscribeDenied {
                        conversation_id,
                        reason,
                    });
                    return;
                }
            };

            info!("{} subscribing to conversation {}", user_id, conversation_id);
            let tx = out.clone();
            let feed = feed.spawn_callback(move |event| {
                let _ = tx.send(event);
            });
            feeds.conversations.insert(conversation_id, feed);
        }

        GatewayCommand::Unsubscribe { conversation_id } => {
            if let Some(feed) = feeds.conversations.remove(&conversation_id) {
                feed.unsubscribe().await;
                info!("{} unsubscribed from conversation {}", user_id, conversation_id);
            }
        }

        GatewayCommand::SubscribeNotifications => {
            if feeds.notifications.is_some() {
                return;
            }
            let feed = match source.notification_feed().await {
                Ok(feed) => feed,
                Err(reason) => {
                    warn!("{} notification feed unavailable: {}", user_id, reason);
                    return;
                }
            };
            let tx = out.clone();
            feeds.notifications = Some(feed.spawn_callback(move |event| {
                let _ = tx.send(event);
            }));
        }

        GatewayCommand::UnsubscribeNotifications => {
            if let Some(feed) = feeds.notifications.take() {
                feed.unsubscribe().await;
            }
        }
    }
}

//! WebSocket transport of the sync channel.
//!
//! Accept and read tasks only translate socket traffic into [`SyncEvent`]s; the
//! device loop owns all state.

use crate::services::sync::{ObserverId, OutboundFrame, SyncEvent, SyncHandle};
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::net::SocketAddr;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// Accept observer connections until the listener fails
pub async fn serve(listener: TcpListener, events: SyncHandle) -> Result<()> {
    info!(
        "sync channel listening on {}",
        listener
            .local_addr()
            .context("failed to get sync channel address")?
    );

    let mut next_id: ObserverId = 0;

    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .context("failed to accept observer connection")?;

        next_id += 1;
        tokio::spawn(handle_connection(stream, peer, next_id, events.clone()));
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    id: ObserverId,
    events: SyncHandle,
) {
    let socket = match accept_async(stream).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("websocket handshake with {peer} failed: {e}");
            return;
        }
    };

    debug!("observer {id} connected from {peer}");

    let (mut write, mut read) = socket.split();
    let (sink, mut outbound) = mpsc::unbounded_channel();

    if !events.send(SyncEvent::Connected { id, sink }) {
        return;
    }

    let writer = async {
        while let Some(frame) = outbound.recv().await {
            match frame {
                OutboundFrame::Text(text) => {
                    if let Err(e) = write.send(Message::text(text)).await {
                        debug!("failed to send to observer {id}: {e}");
                        break;
                    }
                }
                OutboundFrame::Close => {
                    let _ = write.close().await;
                    break;
                }
            }
        }
    };

    let reader = async {
        while let Some(message) = read.next().await {
            let event = match message {
                Ok(Message::Text(text)) => SyncEvent::Text {
                    id,
                    payload: text.as_str().to_owned(),
                },
                Ok(Message::Close(_)) => break,
                Ok(other) => SyncEvent::Other {
                    id,
                    description: format!("{other:?}"),
                },
                Err(e) => {
                    debug!("observer {id} read failed: {e}");
                    break;
                }
            };

            if !events.send(event) {
                break;
            }
        }
    };

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    debug!("observer {id} from {peer} disconnected");
    events.send(SyncEvent::Disconnected { id });
}

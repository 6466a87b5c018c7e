use color_eyre::{eyre::eyre, Result};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::event::{Event, EventHandler, ReplyLine};

/// Dispatch loop of the daemon
pub struct App {
  engine: Engine,
  events: EventHandler,
}

impl App {
  pub fn new(engine: Engine, events: EventHandler) -> Self {
    Self { engine, events }
  }

  /// Handle events until the input closes, then wait for in-flight handlers
  /// and background work before returning.
  pub async fn run<W>(mut self, out: W) -> Result<()>
  where
    W: AsyncWrite + Unpin + Send + 'static,
  {
    let (reply_tx, reply_rx) = mpsc::unbounded_channel::<ReplyLine>();
    let writer = tokio::spawn(write_replies(out, reply_rx));
    let mut handlers = JoinSet::new();

    while let Some(event) = self.events.next().await {
      while let Some(done) = handlers.try_join_next() {
        if let Err(e) = done {
          warn!(error = %e, "event handler failed");
        }
      }

      let engine = self.engine.clone();
      match event {
        Event::Fetch { id, request } => {
          let reply_tx = reply_tx.clone();
          handlers.spawn(async move {
            let result = match request.into_request() {
              Ok(request) => engine.handle_request(request).await,
              Err(e) => Err(e),
            };
            if let Err(e) = &result {
              debug!(id = %id, error = %e, "request failed");
            }
            let _ = reply_tx.send(ReplyLine::from_result(id, result));
          });
        }
        Event::Message { data } => {
          handlers.spawn(async move {
            let stored = engine.handle_message(&data).await;
            debug!(stored, "handled message");
          });
        }
        Event::Sync { tag } => {
          handlers.spawn(async move {
            if let Err(e) = engine.handle_sync(&tag).await {
              warn!(tag = %tag, error = %e, "sync failed");
            }
          });
        }
        Event::PeriodicSync { tag } => {
          handlers.spawn(async move {
            if let Err(e) = engine.handle_periodic_sync(&tag).await {
              warn!(tag = %tag, error = %e, "periodic sync failed");
            }
          });
        }
        Event::Shutdown => break,
      }
    }

    while let Some(done) = handlers.join_next().await {
      if let Err(e) = done {
        warn!(error = %e, "event handler failed");
      }
    }
    self.engine.settle().await;

    drop(reply_tx);
    writer
      .await
      .map_err(|e| eyre!("Failed to join reply writer: {}", e))??;

    info!("shut down");
    Ok(())
  }
}

async fn write_replies<W>(mut out: W, mut rx: mpsc::UnboundedReceiver<ReplyLine>) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  while let Some(line) = rx.recv().await {
    let mut json =
      serde_json::to_vec(&line).map_err(|e| eyre!("Failed to encode reply: {}", e))?;
    json.push(b'\n');
    out
      .write_all(&json)
      .await
      .map_err(|e| eyre!("Failed to write reply: {}", e))?;
    out
      .flush()
      .await
      .map_err(|e| eyre!("Failed to flush reply: {}", e))?;
  }
  out
    .shutdown()
    .await
    .map_err(|e| eyre!("Failed to close output: {}", e))
}

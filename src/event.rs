//! Inbound events and the JSON-lines wire format of the daemon.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::warn;
use url::Url;

use crate::http::{Destination, Method, Request, RequestMode};
use crate::queue::SyncRegistration;
use crate::strategy::Reply;

/// Daemon events
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
  /// A request to route through the engine
  Fetch { id: String, request: WireRequest },
  /// Command channel message, e.g. `{"type":"PREFETCH","urls":[...]}`
  Message { data: serde_json::Value },
  /// Reconnect signal
  Sync { tag: String },
  PeriodicSync { tag: String },
  /// Input closed
  #[serde(skip)]
  Shutdown,
}

/// Request as it appears on the wire. The body is either text or base64.
#[derive(Debug, Deserialize)]
pub struct WireRequest {
  #[serde(default = "default_method")]
  pub method: Method,
  pub url: Url,
  #[serde(default)]
  pub mode: RequestMode,
  #[serde(default)]
  pub destination: Destination,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  pub body: Option<String>,
  pub body_base64: Option<String>,
}

fn default_method() -> Method {
  Method::Get
}

impl WireRequest {
  pub fn into_request(self) -> Result<Request> {
    let body = match (self.body, self.body_base64) {
      (Some(_), Some(_)) => return Err(eyre!("Only one of body and body_base64 may be set")),
      (Some(text), None) => Some(text.into_bytes()),
      (None, Some(encoded)) => Some(
        STANDARD
          .decode(encoded)
          .map_err(|e| eyre!("Failed to decode body_base64: {}", e))?,
      ),
      (None, None) => None,
    };

    let mut request = Request::get(self.url)
      .with_method(self.method)
      .with_mode(self.mode)
      .with_destination(self.destination);
    for (name, value) in &self.headers {
      request = request.with_header(name, value);
    }
    request.body = body;
    Ok(request)
  }
}

/// One reply line written to stdout for a `fetch` event.
#[derive(Debug, Serialize)]
pub struct ReplyLine {
  pub id: String,
  pub outcome: &'static str,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status: Option<u16>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub headers: Option<BTreeMap<String, String>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub body_base64: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl ReplyLine {
  pub fn from_result(id: String, result: Result<Reply>) -> Self {
    let mut line = Self {
      id,
      outcome: "error",
      status: None,
      headers: None,
      body_base64: None,
      error: None,
    };
    match result {
      Ok(Reply::Respond(resp)) => {
        line.outcome = "response";
        line.status = Some(resp.status);
        line.body_base64 = Some(STANDARD.encode(&resp.body));
        line.headers = Some(resp.headers);
      }
      Ok(Reply::Miss) => line.outcome = "miss",
      Ok(Reply::Ignored) => line.outcome = "ignored",
      Err(e) => line.error = Some(format!("{:#}", e)),
    }
    line
  }
}

/// Event source fed by an input stream and, optionally, a retry timer that
/// self-delivers the reconnect signal while writes are pending.
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  pub fn new<R>(input: R, sync: Arc<SyncRegistration>, retry_interval: Option<Duration>) -> Self
  where
    R: AsyncBufRead + Unpin + Send + 'static,
  {
    let (tx, rx) = mpsc::unbounded_channel();

    // Input reader
    let input_tx = tx.clone();
    tokio::spawn(async move {
      let mut lines = input.lines();
      loop {
        match lines.next_line().await {
          Ok(Some(line)) => {
            if line.trim().is_empty() {
              continue;
            }
            match serde_json::from_str::<Event>(&line) {
              Ok(event) => {
                if input_tx.send(event).is_err() {
                  break;
                }
              }
              Err(e) => warn!(error = %e, "ignoring malformed event"),
            }
          }
          Ok(None) => {
            let _ = input_tx.send(Event::Shutdown);
            break;
          }
          Err(e) => {
            warn!(error = %e, "failed to read input");
            let _ = input_tx.send(Event::Shutdown);
            break;
          }
        }
      }
    });

    // Retry timer
    if let Some(interval) = retry_interval {
      tokio::spawn(async move {
        loop {
          sync.registered().await;
          tokio::time::sleep(interval).await;
          let event = Event::Sync {
            tag: sync.tag().to_string(),
          };
          if tx.send(event).is_err() {
            break;
          }
        }
      });
    }

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

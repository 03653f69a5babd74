// twsync/src/conn_mock.rs
//! A [`Transport`] that answers from a canned script instead of a socket.
//!
//! Each submitted request is recorded, then the script's replies for that request kind are
//! re-targeted at the request id and pushed onto the event channel, in order. Feed the
//! channel to an [`EventDispatcher`](crate::dispatcher::EventDispatcher) to drive a
//! [`TradingSession`](crate::TradingSession) without TWS.
//!
//! ```json
//! {
//!   "first_valid_id": 100,
//!   "replies": {
//!     "contract_details": [
//!       { "type": "contract_details", "req_id": 0, "details": { "contract": { "symbol": "AAPL", "con_id": 265598 } } },
//!       { "type": "contract_details_end", "req_id": 0 }
//!     ]
//!   }
//! }
//! ```

use crate::base::{IBKRError, RequestId};
use crate::conn::{CancelKind, OutboundRequest, Transport};
use crate::message_parser::InboundEvent;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, trace, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Canned replies, keyed by [`OutboundRequest::kind_name`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Script {
  /// Sent as `nextValidId` by [`ScriptedTransport::ready`].
  pub first_valid_id: RequestId,
  pub replies: HashMap<String, Vec<InboundEvent>>,
  /// Request kinds whose submission fails with a transport error.
  pub reject: HashSet<String>,
}

impl Script {
  pub fn from_json_str(json: &str) -> Result<Self, IBKRError> {
    serde_json::from_str(json)
      .map_err(|e| IBKRError::ConfigurationError(format!("invalid script: {}", e)))
  }

  pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, IBKRError> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path)
      .map_err(|e| IBKRError::ConfigurationError(format!("cannot read script {}: {}", path.display(), e)))?;
    Self::from_json_str(&json)
  }

  /// Adds a reply for a request kind. Builder-style, for tests.
  pub fn reply(mut self, kind: &str, event: InboundEvent) -> Self {
    self.replies.entry(kind.to_string()).or_default().push(event);
    self
  }
}

pub struct ScriptedTransport {
  script: Script,
  sender: Sender<InboundEvent>,
  requests: Mutex<Vec<(RequestId, OutboundRequest)>>,
  cancels: Mutex<Vec<(RequestId, CancelKind)>>,
}

impl ScriptedTransport {
  /// Returns the transport and the receiving end of its event channel.
  pub fn new(script: Script) -> (Self, Receiver<InboundEvent>) {
    let (sender, receiver) = unbounded();
    let transport = ScriptedTransport {
      script,
      sender,
      requests: Mutex::new(Vec::new()),
      cancels: Mutex::new(Vec::new()),
    };
    (transport, receiver)
  }

  /// Announces the first valid order id, as TWS does right after the handshake.
  pub fn ready(&self) -> Result<(), IBKRError> {
    self.push(InboundEvent::NextValidId { order_id: self.script.first_valid_id })
  }

  /// Pushes an unsolicited event, e.g. a fill or a connectivity error.
  pub fn push(&self, event: InboundEvent) -> Result<(), IBKRError> {
    trace!("Mock: pushing {:?}", event);
    self.sender.send(event)
      .map_err(|_| IBKRError::NotConnected)
  }

  /// Requests submitted so far, in order.
  pub fn requests(&self) -> Vec<(RequestId, OutboundRequest)> {
    self.requests.lock().clone()
  }

  pub fn cancels(&self) -> Vec<(RequestId, CancelKind)> {
    self.cancels.lock().clone()
  }
}

impl Transport for ScriptedTransport {
  fn submit(&self, id: RequestId, request: OutboundRequest) -> Result<(), IBKRError> {
    let kind = request.kind_name();
    if self.script.reject.contains(kind) {
      warn!("Mock: rejecting {} request {}", kind, id);
      return Err(IBKRError::TransportError(format!("scripted rejection of {}", kind)));
    }
    debug!("Mock: {} request {}", kind, id);
    // Enumerated open orders keep their own order ids.
    let retarget = !matches!(request, OutboundRequest::OpenOrders);
    self.requests.lock().push((id, request));

    let replies = match self.script.replies.get(kind) {
      Some(r) => r,
      None => {
        trace!("Mock: no scripted reply for {}", kind);
        return Ok(());
      }
    };
    for event in replies {
      let event = if retarget { event.clone().with_request_id(id) } else { event.clone() };
      self.push(event)?;
    }
    Ok(())
  }

  fn cancel(&self, id: RequestId, kind: CancelKind) -> Result<(), IBKRError> {
    debug!("Mock: cancel {:?} {}", kind, id);
    self.cancels.lock().push((id, kind));
    Ok(())
  }
}

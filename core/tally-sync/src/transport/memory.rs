//! In-process transport for tests.
//!
//! Transports created from the same [`MemoryNetwork`] can find each other's
//! offers. The network can be taken down and restored to exercise the
//! session's reconnection logic.

use super::{LinkState, Transport, TransportEvent, TransportEvents};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

type Endpoint = mpsc::UnboundedSender<TransportEvent>;

#[derive(Default)]
struct NetworkState {
    /// Offer description -> offering endpoint.
    offers: HashMap<String, Endpoint>,
    /// Answer description -> (offer description, answering endpoint).
    answers: HashMap<String, (String, Endpoint)>,
    /// Endpoints with an established link, notified on outages.
    linked: Vec<Endpoint>,
    down: bool,
}

/// A shared switchboard for [`MemoryTransport`]s.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport attached to this network.
    pub fn transport(&self) -> MemoryTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        MemoryTransport {
            network: self.clone(),
            tx,
            rx: Some(rx),
            offer: None,
            remote: None,
            closed: false,
        }
    }

    /// Drops every link. Linked endpoints observe `state`, which should be
    /// `Disconnected` or `Failed`.
    pub fn go_down(&self, state: LinkState) {
        let mut net = self.lock();
        net.down = true;
        net.linked.retain(|endpoint| endpoint.send(TransportEvent::StateChanged(state)).is_ok());
        debug!("Memory network down ({state})");
    }

    /// Makes the network reachable again. Links come back on `restart`.
    pub fn restore(&self) {
        self.lock().down = false;
        debug!("Memory network restored");
    }

    pub fn is_down(&self) -> bool {
        self.lock().down
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        // A panic while holding the lock only happens inside a failing test.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One end of an in-process link.
pub struct MemoryTransport {
    network: MemoryNetwork,
    tx: Endpoint,
    rx: Option<TransportEvents>,
    offer: Option<String>,
    remote: Option<Endpoint>,
    closed: bool,
}

impl MemoryTransport {
    fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send(event);
    }

    fn new_description(prefix: &str) -> String {
        format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn take_events(&mut self) -> Option<TransportEvents> {
        self.rx.take()
    }

    async fn create_offer(&mut self) -> SyncResult<String> {
        let offer = Self::new_description("offer");
        self.network.lock().offers.insert(offer.clone(), self.tx.clone());
        self.offer = Some(offer.clone());
        self.emit(TransportEvent::Candidate(format!("memory:{offer}")));
        self.emit(TransportEvent::GatheringComplete);
        Ok(offer)
    }

    async fn accept_offer(&mut self, offer: &str, _candidates: &[String]) -> SyncResult<String> {
        let answer = Self::new_description("answer");
        {
            let mut net = self.network.lock();
            if net.down {
                return Err(SyncError::TransportFailure("network unreachable".into()));
            }
            let offerer = net
                .offers
                .get(offer)
                .cloned()
                .ok_or_else(|| SyncError::TransportFailure(format!("no such offer: {offer}")))?;
            net.answers.insert(answer.clone(), (offer.to_string(), self.tx.clone()));
            self.remote = Some(offerer);
        }
        self.emit(TransportEvent::Candidate(format!("memory:{answer}")));
        self.emit(TransportEvent::GatheringComplete);
        self.emit(TransportEvent::StateChanged(LinkState::Connecting));
        Ok(answer)
    }

    async fn accept_answer(&mut self, answer: &str, _candidates: &[String]) -> SyncResult<()> {
        let mut net = self.network.lock();
        if net.down {
            return Err(SyncError::TransportFailure("network unreachable".into()));
        }
        let (offer, answerer) = net
            .answers
            .get(answer)
            .cloned()
            .ok_or_else(|| SyncError::TransportFailure(format!("no such answer: {answer}")))?;
        if self.offer.as_deref() != Some(offer.as_str()) {
            return Err(SyncError::TransportFailure(
                "answer belongs to a different offer".into(),
            ));
        }

        net.linked.push(self.tx.clone());
        net.linked.push(answerer.clone());
        let _ = answerer.send(TransportEvent::StateChanged(LinkState::Connected));
        self.remote = Some(answerer);
        self.emit(TransportEvent::StateChanged(LinkState::Connected));
        Ok(())
    }

    async fn send(&mut self, frame: String) -> SyncResult<()> {
        if self.closed || self.network.is_down() {
            return Err(SyncError::TransportFailure("link is down".into()));
        }
        let remote = self
            .remote
            .as_ref()
            .ok_or_else(|| SyncError::TransportFailure("not connected".into()))?;
        remote
            .send(TransportEvent::Frame(frame))
            .map_err(|_| SyncError::TransportFailure("peer is gone".into()))
    }

    async fn restart(&mut self) -> SyncResult<()> {
        if self.closed || self.network.is_down() {
            debug!("Memory transport restart: network still down");
            return Ok(());
        }
        if let Some(remote) = &self.remote {
            let _ = remote.send(TransportEvent::StateChanged(LinkState::Connected));
            self.emit(TransportEvent::StateChanged(LinkState::Connected));
        }
        Ok(())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(remote) = self.remote.take() {
            let _ = remote.send(TransportEvent::StateChanged(LinkState::Closed));
        }
        if let Some(offer) = self.offer.take() {
            self.network.lock().offers.remove(&offer);
        }
    }
}

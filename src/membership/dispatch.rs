//! Membership message dispatch.
//!
//! A single task pulls messages off the queue and hands each one to a
//! blocking worker. Workers are bounded by the non-replication thread budget
//! so membership traffic never starves the replication threads.

use bytes::{BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::codec;
use super::manager::Core;
use super::types::{ChangeOutcome, MembershipStatus, SiteAddr};
use crate::error::{Result, RosterError};
use crate::replication::{MessageType, RosterEvent};

/// Why a join/remove request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NotMaster,
    Unavailable,
    Malformed,
    UnknownSite,
    InvalidTarget,
    StoreFailure,
    ShuttingDown,
}

impl RejectReason {
    pub fn code(self) -> u32 {
        match self {
            RejectReason::NotMaster => 1,
            RejectReason::Unavailable => 2,
            RejectReason::Malformed => 3,
            RejectReason::UnknownSite => 4,
            RejectReason::InvalidTarget => 5,
            RejectReason::StoreFailure => 6,
            RejectReason::ShuttingDown => 7,
        }
    }
}

const FORWARD_CODE: u32 = 0;

/// Answer to a join/remove/rejoin request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Marshalled membership list after the change
    Accepted(Bytes),
    Forward(SiteAddr),
    Rejected(RejectReason),
}

impl Reply {
    /// Payload sent back to a remote requester
    pub fn encode(&self) -> Bytes {
        match self {
            Reply::Accepted(list) => list.clone(),
            Reply::Forward(master) => {
                let mut out = BytesMut::new();
                out.put_u32(FORWARD_CODE);
                if let Ok(key) = codec::encode_site_key(master) {
                    out.put_slice(&key);
                }
                out.freeze()
            }
            Reply::Rejected(reason) => {
                let mut out = BytesMut::with_capacity(4);
                out.put_u32(reason.code());
                out.freeze()
            }
        }
    }
}

/// Where a reply goes
#[derive(Debug)]
pub enum Responder {
    Local(oneshot::Sender<Reply>),
    Remote(SiteAddr),
}

#[derive(Debug)]
pub enum RosterMessage {
    JoinRequest { payload: Bytes, from: Responder },
    RemoveRequest { payload: Bytes, from: Responder },
    /// A former member asking to be restored
    Rejoin { payload: Bytes, from: Responder },
    ResolveLimbo,
    ShareMembershipList { payload: Bytes },
    Shutdown,
}

impl RosterMessage {
    pub fn local_join(addr: &SiteAddr) -> Result<(Self, oneshot::Receiver<Reply>)> {
        let (tx, rx) = oneshot::channel();
        let payload = codec::encode_site_key(addr)?;
        Ok((
            RosterMessage::JoinRequest {
                payload,
                from: Responder::Local(tx),
            },
            rx,
        ))
    }

    pub fn local_remove(addr: &SiteAddr) -> Result<(Self, oneshot::Receiver<Reply>)> {
        let (tx, rx) = oneshot::channel();
        let payload = codec::encode_site_key(addr)?;
        Ok((
            RosterMessage::RemoveRequest {
                payload,
                from: Responder::Local(tx),
            },
            rx,
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Join,
    Rejoin,
    Remove,
}

/// Handle on the running dispatch loop
#[derive(Debug)]
pub struct Dispatcher {
    tx: mpsc::Sender<RosterMessage>,
    limbo_queued: Arc<AtomicBool>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub(crate) fn spawn(core: Arc<Core>) -> Self {
        let (tx, rx) = mpsc::channel(core.config.queue_capacity);
        let permits = Arc::new(Semaphore::new(core.config.max_non_replication_threads));
        let limbo_queued = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run(core, rx, permits, limbo_queued.clone()));
        Self {
            tx,
            limbo_queued,
            task: parking_lot::Mutex::new(Some(task)),
        }
    }

    pub fn sender(&self) -> mpsc::Sender<RosterMessage> {
        self.tx.clone()
    }

    pub async fn submit(&self, msg: RosterMessage) -> Result<()> {
        self.tx.send(msg).await.map_err(|_| RosterError::ShuttingDown)
    }

    /// Queue a limbo resolution unless one is already waiting. Safe to call
    /// from any thread.
    pub fn enqueue_resolve_limbo(&self) -> bool {
        if self.limbo_queued.swap(true, Ordering::SeqCst) {
            return false;
        }
        match self.tx.try_send(RosterMessage::ResolveLimbo) {
            Ok(()) => true,
            Err(e) => {
                debug!("Could not queue limbo resolution: {}", e);
                self.limbo_queued.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// Stop the loop and wait for running handlers
    pub async fn shutdown(&self) {
        let _ = self.tx.send(RosterMessage::Shutdown).await;
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Membership dispatch loop failed: {}", e);
            }
        }
    }
}

async fn run(
    core: Arc<Core>,
    mut rx: mpsc::Receiver<RosterMessage>,
    permits: Arc<Semaphore>,
    limbo_queued: Arc<AtomicBool>,
) {
    info!("Membership dispatch loop started");
    let mut workers = JoinSet::new();

    while let Some(msg) = rx.recv().await {
        if let RosterMessage::Shutdown = msg {
            break;
        }
        let permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let core = core.clone();
        let limbo_queued = limbo_queued.clone();
        workers.spawn_blocking(move || {
            let _permit = permit;
            handle_message(&core, msg, &limbo_queued);
        });
        while let Some(done) = workers.try_join_next() {
            if let Err(e) = done {
                error!("Membership handler failed: {}", e);
            }
        }
    }

    rx.close();
    while let Some(msg) = rx.recv().await {
        reject_on_shutdown(&core, msg);
    }
    while let Some(done) = workers.join_next().await {
        if let Err(e) = done {
            error!("Membership handler failed: {}", e);
        }
    }
    info!("Membership dispatch loop stopped");
}

fn handle_message(core: &Core, msg: RosterMessage, limbo_queued: &AtomicBool) {
    match msg {
        RosterMessage::JoinRequest { payload, from } => {
            let reply = handle_change(core, &payload, RequestKind::Join);
            respond(core, from, RequestKind::Join, reply);
        }
        RosterMessage::RemoveRequest { payload, from } => {
            let reply = handle_change(core, &payload, RequestKind::Remove);
            respond(core, from, RequestKind::Remove, reply);
        }
        RosterMessage::Rejoin { payload, from } => {
            let reply = handle_change(core, &payload, RequestKind::Rejoin);
            respond(core, from, RequestKind::Rejoin, reply);
        }
        RosterMessage::ResolveLimbo => {
            limbo_queued.store(false, Ordering::SeqCst);
            match core.resolve_limbo() {
                Ok(outcome) => debug!("Limbo resolution: {:?}", outcome),
                Err(e) => error!("Limbo resolution failed: {}", e),
            }
        }
        RosterMessage::ShareMembershipList { payload } => match core.apply_membership_list(&payload) {
            Ok(outcome) => debug!("Membership list: {:?}", outcome),
            Err(RosterError::SelfEvicted) => warn!("Membership list removed the local site"),
            Err(e) => warn!("Discarding membership list: {}", e),
        },
        RosterMessage::Shutdown => {}
    }
}

fn handle_change(core: &Core, payload: &[u8], kind: RequestKind) -> Reply {
    let addr = match codec::decode_site_key(payload) {
        Ok(addr) if !addr.host.is_empty() && addr.port != 0 => addr,
        Ok(addr) => {
            warn!("Rejecting {:?} for invalid address '{}'", kind, addr);
            return Reply::Rejected(RejectReason::Malformed);
        }
        Err(e) => {
            warn!("Rejecting malformed {:?} request: {}", kind, e);
            return Reply::Rejected(RejectReason::Malformed);
        }
    };

    if !core.repl.is_master() {
        return match core.repl.current_master() {
            Some(master) => Reply::Forward(master),
            None => Reply::Rejected(RejectReason::NotMaster),
        };
    }

    let known = core.state.lock().registry.find(&addr).is_some();
    if kind != RequestKind::Join && !known {
        return Reply::Rejected(RejectReason::UnknownSite);
    }

    let target = match kind {
        RequestKind::Remove => MembershipStatus::Absent,
        RequestKind::Join | RequestKind::Rejoin => MembershipStatus::Present,
    };
    let reply = match core.request_change(&addr, target) {
        Ok(ChangeOutcome::Applied) => match core.marshal_membership() {
            Ok(list) => Reply::Accepted(list),
            Err(e) => {
                error!("Failed to marshal membership list: {}", e);
                Reply::Rejected(RejectReason::StoreFailure)
            }
        },
        Ok(ChangeOutcome::Forward(master)) => Reply::Forward(master),
        Ok(ChangeOutcome::Unavailable) => Reply::Rejected(RejectReason::Unavailable),
        Err(RosterError::ShuttingDown) => Reply::Rejected(RejectReason::ShuttingDown),
        Err(RosterError::Protocol(msg)) => {
            warn!("Refusing {:?} of {}: {}", kind, addr, msg);
            Reply::Rejected(RejectReason::InvalidTarget)
        }
        Err(e) => {
            error!("{:?} of {} failed: {}", kind, addr, e);
            Reply::Rejected(RejectReason::StoreFailure)
        }
    };

    if kind != RequestKind::Remove
        && matches!(
            reply,
            Reply::Rejected(RejectReason::Unavailable | RejectReason::StoreFailure)
        )
    {
        core.repl.report_event(RosterEvent::JoinFailure(addr));
    }
    reply
}

fn respond(core: &Core, from: Responder, kind: RequestKind, reply: Reply) {
    match from {
        Responder::Local(tx) => {
            if tx.send(reply).is_err() {
                debug!("Requester for {:?} went away", kind);
            }
        }
        Responder::Remote(site) => {
            let msg_type = match (kind, &reply) {
                (RequestKind::Remove, Reply::Accepted(_)) => MessageType::RemoveSuccess,
                (RequestKind::Remove, _) => MessageType::RemoveFailure,
                (_, Reply::Accepted(_)) => MessageType::JoinSuccess,
                _ => MessageType::JoinFailure,
            };
            if let Err(e) = core.repl.send_to_site(&site, msg_type, reply.encode()) {
                warn!("Failed to reply to {}: {}", site, e);
            }
        }
    }
}

fn reject_on_shutdown(core: &Core, msg: RosterMessage) {
    let rejected = Reply::Rejected(RejectReason::ShuttingDown);
    match msg {
        RosterMessage::JoinRequest { from, .. } => respond(core, from, RequestKind::Join, rejected),
        RosterMessage::RemoveRequest { from, .. } => respond(core, from, RequestKind::Remove, rejected),
        RosterMessage::Rejoin { from, .. } => respond(core, from, RequestKind::Rejoin, rejected),
        _ => {}
    }
}

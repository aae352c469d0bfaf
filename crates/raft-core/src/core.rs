use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use prost::Message;
use rand::Rng;
use replication_log::ReplicationLog;
use sequencer_proto::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse, RequestVoteRequest,
    RequestVoteResponse, SyncRequest, SyncResponse,
};
use sequencer_types::{Batch, NodeId, NodeRole, PeerState, RaftState, RaftStateView};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, sleep_until, Duration, Instant};
use tracing::{debug, info, instrument, warn};

use crate::config::RaftConfig;
use crate::error::RaftError;
use crate::listener::{CommitListener, SnapshotApplier};
use crate::transport::{RaftRpcHandler, RaftTransport};

/// Everything the control loop needs to drive one peer's replication
/// progress — built fresh per AppendEntries attempt.
struct SnapshotAssembly {
    last_included_index: u64,
    last_included_term: u64,
    buffer: Vec<u8>,
}

enum Event {
    RequestVote(RequestVoteRequest, oneshot::Sender<RequestVoteResponse>),
    AppendEntries(AppendEntriesRequest, oneshot::Sender<AppendEntriesResponse>),
    InstallSnapshot(InstallSnapshotRequest, oneshot::Sender<InstallSnapshotResponse>),
    Sync(SyncRequest, oneshot::Sender<SyncResponse>),
    Propose(Batch, oneshot::Sender<Result<u64, RaftError>>),
    VoteResult { term_at_request: u64, peer: NodeId, granted: bool, peer_term: u64 },
    AppendResult { term_at_request: u64, peer: NodeId, prev_log_index: u64, sent_up_to: u64, outcome: Result<AppendEntriesResponse, RaftError> },
    PeerNextIndices(oneshot::Sender<Vec<(NodeId, u64)>>),
    SnapshotInstalled { peer: NodeId, last_included_index: u64 },
    Shutdown,
}

/// A cheap, cloneable handle to a running `RaftCore`. All interaction with
/// the control loop goes through this: direct field access to `RaftState`
/// from any other thread would violate §5's "exclusively owned by the
/// control thread" rule.
#[derive(Clone)]
pub struct RaftHandle {
    events: mpsc::UnboundedSender<Event>,
    view: watch::Receiver<RaftStateView>,
}

impl RaftHandle {
    pub fn state_view(&self) -> RaftStateView {
        *self.view.borrow()
    }

    pub async fn watch_state(&self) -> watch::Receiver<RaftStateView> {
        self.view.clone()
    }

    /// Leader-only. Resolves once the batch has been durably appended to
    /// this node's log *and* acknowledged by a quorum, or once
    /// `commitTimeout` elapses (§4.9 step 5/6, §4.9a `LogAppender`).
    pub async fn propose(&self, batch: Batch) -> Result<u64, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.events.send(Event::Propose(batch, tx)).map_err(|_| RaftError::Stopped)?;
        rx.await.map_err(|_| RaftError::Stopped)?
    }

    pub fn shutdown(&self) {
        let _ = self.events.send(Event::Shutdown);
    }

    /// Leader-only snapshot of each peer's current `next_index`; empty on a
    /// follower or candidate. Polled by `node-sync` to find peers whose
    /// `next_index` has fallen behind the log's retained window.
    pub async fn peer_next_indices(&self) -> Vec<(NodeId, u64)> {
        let (tx, rx) = oneshot::channel();
        if self.events.send(Event::PeerNextIndices(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Tells the control loop that `node-sync` finished pushing a full
    /// snapshot to `peer` ending at `last_included_index`: the peer's
    /// `next_index` advances past it so ordinary `AppendEntries` replication
    /// resumes from there instead of retrying indices the log no longer
    /// retains (§4.8).
    pub fn report_snapshot_installed(&self, peer: NodeId, last_included_index: u64) {
        let _ = self.events.send(Event::SnapshotInstalled { peer, last_included_index });
    }
}

#[async_trait]
impl RaftRpcHandler for RaftHandle {
    async fn handle_request_vote(&self, req: RequestVoteRequest) -> RequestVoteResponse {
        let (tx, rx) = oneshot::channel();
        if self.events.send(Event::RequestVote(req, tx)).is_err() {
            return RequestVoteResponse { term: 0, vote_granted: false };
        }
        rx.await.unwrap_or(RequestVoteResponse { term: 0, vote_granted: false })
    }

    async fn handle_append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        let (tx, rx) = oneshot::channel();
        if self.events.send(Event::AppendEntries(req, tx)).is_err() {
            return AppendEntriesResponse { term: 0, success: false, conflict_index: None, conflict_term: None };
        }
        rx.await.unwrap_or(AppendEntriesResponse { term: 0, success: false, conflict_index: None, conflict_term: None })
    }

    async fn handle_install_snapshot(&self, req: InstallSnapshotRequest) -> InstallSnapshotResponse {
        let (tx, rx) = oneshot::channel();
        if self.events.send(Event::InstallSnapshot(req, tx)).is_err() {
            return InstallSnapshotResponse { term: 0 };
        }
        rx.await.unwrap_or(InstallSnapshotResponse { term: 0 })
    }

    async fn handle_sync(&self, req: SyncRequest) -> SyncResponse {
        let (tx, rx) = oneshot::channel();
        if self.events.send(Event::Sync(req, tx)).is_err() {
            return SyncResponse { accepted: false, snapshot_available: false, from_index: 0 };
        }
        rx.await.unwrap_or(SyncResponse { accepted: false, snapshot_available: false, from_index: 0 })
    }
}

struct Inner<T: RaftTransport> {
    state: RaftState,
    log: Arc<ReplicationLog>,
    transport: Arc<T>,
    listener: Arc<dyn CommitListener>,
    snapshot_applier: Arc<dyn SnapshotApplier>,
    config: RaftConfig,
    peers: Vec<NodeId>,
    view_tx: watch::Sender<RaftStateView>,
    pending_commits: BTreeMap<u64, oneshot::Sender<Result<u64, RaftError>>>,
    snapshot_assembly: Option<SnapshotAssembly>,
}

/// Owns `RaftState` exclusively and drives the election/heartbeat/
/// replication control loop (§4.6). Construct with [`RaftCore::spawn`];
/// interact through the returned [`RaftHandle`].
pub struct RaftCore;

impl RaftCore {
    #[instrument(skip(log, transport, listener, snapshot_applier))]
    pub fn spawn<T: RaftTransport + 'static>(
        node_id: NodeId,
        peers: Vec<NodeId>,
        log: Arc<ReplicationLog>,
        transport: Arc<T>,
        listener: Arc<dyn CommitListener>,
        snapshot_applier: Arc<dyn SnapshotApplier>,
        config: RaftConfig,
    ) -> RaftHandle {
        let state = RaftState::new(node_id);
        let (view_tx, view_rx) = watch::channel(state.view());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Inner {
            state,
            log,
            transport,
            listener,
            snapshot_applier,
            config,
            peers,
            view_tx,
            pending_commits: BTreeMap::new(),
            snapshot_assembly: None,
        };

        tokio::spawn(run_loop(inner, events_tx.clone(), events_rx));

        RaftHandle { events: events_tx, view: view_rx }
    }
}

fn election_timeout(config: &RaftConfig) -> Duration {
    let min = config.election_timeout_min.as_millis() as u64;
    let max = config.election_timeout_max.as_millis().max(min as u128 + 1) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(min..=max))
}

async fn run_loop<T: RaftTransport + 'static>(
    mut inner: Inner<T>,
    self_tx: mpsc::UnboundedSender<Event>,
    mut events_rx: mpsc::UnboundedReceiver<Event>,
) {
    let mut election_deadline = Instant::now() + election_timeout(&inner.config);

    loop {
        let is_leader = matches!(inner.state.role, NodeRole::Leader { .. });

        tokio::select! {
            biased;

            maybe_event = events_rx.recv() => {
                match maybe_event {
                    Some(Event::Shutdown) | None => {
                        info!(node_id = ?inner.state.node_id, "raft control loop stopping");
                        return;
                    }
                    Some(event) => {
                        let becomes_follower_or_votes = dispatch(&mut inner, &self_tx, event).await;
                        if becomes_follower_or_votes {
                            election_deadline = Instant::now() + election_timeout(&inner.config);
                        }
                    }
                }
            }

            _ = sleep_until(election_deadline), if !is_leader => {
                start_election(&mut inner, &self_tx).await;
                election_deadline = Instant::now() + election_timeout(&inner.config);
            }

            _ = sleep(inner.config.heartbeat_interval), if is_leader => {
                send_heartbeats(&mut inner, &self_tx).await;
            }
        }
    }
}

/// Returns true when the event should reset the election timer (any valid
/// contact from a current-or-newer-term leader, or granting our own vote).
async fn dispatch<T: RaftTransport + 'static>(
    inner: &mut Inner<T>,
    self_tx: &mpsc::UnboundedSender<Event>,
    event: Event,
) -> bool {
    match event {
        Event::RequestVote(req, reply) => {
            let (resp, reset) = handle_request_vote(inner, req).await;
            let _ = reply.send(resp);
            publish_view(inner);
            reset
        }
        Event::AppendEntries(req, reply) => {
            let req_term = req.term;
            let resp = handle_append_entries(inner, req).await;
            let reset = resp.term <= req_term;
            let _ = reply.send(resp);
            publish_view(inner);
            reset
        }
        Event::InstallSnapshot(req, reply) => {
            let resp = handle_install_snapshot(inner, req).await;
            let _ = reply.send(resp);
            publish_view(inner);
            true
        }
        Event::Sync(req, reply) => {
            let resp = handle_sync(inner, req).await;
            let _ = reply.send(resp);
            false
        }
        Event::Propose(batch, reply) => {
            handle_propose(inner, self_tx, batch, reply).await;
            false
        }
        Event::VoteResult { term_at_request, peer, granted, peer_term } => {
            handle_vote_result(inner, term_at_request, peer, granted, peer_term).await;
            false
        }
        Event::AppendResult { term_at_request, peer, prev_log_index, sent_up_to, outcome } => {
            handle_append_result(inner, self_tx, term_at_request, peer, prev_log_index, sent_up_to, outcome).await;
            false
        }
        Event::PeerNextIndices(reply) => {
            let indices = match &inner.state.role {
                NodeRole::Leader { peers } => peers.values().map(|p| (p.peer_id, p.next_index)).collect(),
                _ => Vec::new(),
            };
            let _ = reply.send(indices);
            false
        }
        Event::SnapshotInstalled { peer, last_included_index } => {
            if let NodeRole::Leader { peers } = &mut inner.state.role {
                if let Some(peer_state) = peers.get_mut(&peer) {
                    peer_state.next_index = last_included_index + 1;
                    peer_state.match_index = peer_state.match_index.max(last_included_index);
                }
            }
            false
        }
        Event::Shutdown => unreachable!("handled in run_loop"),
    }
}

fn publish_view<T: RaftTransport>(inner: &Inner<T>) {
    let _ = inner.view_tx.send(inner.state.view());
}

fn step_down<T: RaftTransport>(inner: &mut Inner<T>, term: u64, leader_id: Option<NodeId>) {
    inner.state.current_term = term;
    inner.state.voted_for = None;
    inner.state.role = NodeRole::Follower { leader_id };
    let stale: Vec<u64> = inner.pending_commits.keys().copied().collect();
    for index in stale {
        if let Some(tx) = inner.pending_commits.remove(&index) {
            let _ = tx.send(Err(RaftError::NotLeader { leader_id }));
        }
    }
}

async fn handle_request_vote<T: RaftTransport>(
    inner: &mut Inner<T>,
    req: RequestVoteRequest,
) -> (RequestVoteResponse, bool) {
    let candidate = NodeId(req.candidate_id);
    if req.term < inner.state.current_term {
        return (RequestVoteResponse { term: inner.state.current_term, vote_granted: false }, false);
    }
    if req.term > inner.state.current_term {
        step_down(inner, req.term, None);
    }

    let our_last_index = inner.log.last_index().await;
    let our_last_term = inner.log.last_term().await;
    let candidate_up_to_date = (req.last_log_term, req.last_log_index) >= (our_last_term, our_last_index);

    let can_vote = inner.state.voted_for.is_none() || inner.state.voted_for == Some(candidate);
    let grant = can_vote && candidate_up_to_date;

    if grant {
        inner.state.voted_for = Some(candidate);
        debug!(candidate = ?candidate, term = req.term, "granted vote");
    }

    (RequestVoteResponse { term: inner.state.current_term, vote_granted: grant }, grant)
}

async fn handle_append_entries<T: RaftTransport>(inner: &mut Inner<T>, req: AppendEntriesRequest) -> AppendEntriesResponse {
    if req.term < inner.state.current_term {
        return AppendEntriesResponse { term: inner.state.current_term, success: false, conflict_index: None, conflict_term: None };
    }

    let leader_id = NodeId(req.leader_id);
    if req.term > inner.state.current_term || !matches!(inner.state.role, NodeRole::Follower { .. }) {
        step_down(inner, req.term, Some(leader_id));
    } else {
        inner.state.role = NodeRole::Follower { leader_id: Some(leader_id) };
    }

    if req.prev_log_index > 0 {
        match inner.log.get(req.prev_log_index).await {
            Some(entry) if entry.term == req.prev_log_term => {}
            Some(entry) => {
                return AppendEntriesResponse {
                    term: inner.state.current_term,
                    success: false,
                    conflict_index: Some(req.prev_log_index.saturating_sub(1)),
                    conflict_term: Some(entry.term),
                };
            }
            None => {
                let our_last = inner.log.last_index().await;
                return AppendEntriesResponse {
                    term: inner.state.current_term,
                    success: false,
                    conflict_index: Some(our_last),
                    conflict_term: None,
                };
            }
        }
    }

    if inner.log.last_index().await > req.prev_log_index {
        if let Err(e) = inner.log.truncate_suffix(req.prev_log_index + 1).await {
            warn!(error = %e, "failed truncating conflicting log suffix");
        }
    }

    for proto_entry in req.entries {
        let Some(proto_batch) = proto_entry.batch else { continue };
        let batch = match sequencer_types::Batch::try_from(proto_batch) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "rejecting malformed AppendEntries batch");
                return AppendEntriesResponse { term: inner.state.current_term, success: false, conflict_index: None, conflict_term: None };
            }
        };
        if let Err(e) = inner.log.append(proto_entry.term, batch).await {
            warn!(error = %e, "follower append failed");
            return AppendEntriesResponse { term: inner.state.current_term, success: false, conflict_index: None, conflict_term: None };
        }
    }

    let last_index = inner.log.last_index().await;
    let new_commit_index = req.leader_commit.min(last_index);
    apply_newly_committed(inner, new_commit_index).await;

    AppendEntriesResponse { term: inner.state.current_term, success: true, conflict_index: None, conflict_term: None }
}

async fn apply_newly_committed<T: RaftTransport>(inner: &mut Inner<T>, new_commit_index: u64) {
    if new_commit_index <= inner.state.commit_index {
        return;
    }
    let from = inner.state.commit_index + 1;
    inner.state.commit_index = new_commit_index;

    for index in from..=new_commit_index {
        if let Some(entry) = inner.log.get(index).await {
            inner.listener.on_entry_committed(&entry).await;
            inner.state.last_applied = index;
        }
        if let Some(tx) = inner.pending_commits.remove(&index) {
            let _ = tx.send(Ok(index));
        }
    }
}

async fn handle_install_snapshot<T: RaftTransport>(inner: &mut Inner<T>, req: InstallSnapshotRequest) -> InstallSnapshotResponse {
    if req.term < inner.state.current_term {
        return InstallSnapshotResponse { term: inner.state.current_term };
    }
    if req.term > inner.state.current_term {
        step_down(inner, req.term, Some(NodeId(req.leader_id)));
    }

    let assembly = inner.snapshot_assembly.get_or_insert_with(|| SnapshotAssembly {
        last_included_index: req.last_included_index,
        last_included_term: req.last_included_term,
        buffer: Vec::new(),
    });
    if assembly.buffer.len() as u64 != req.offset {
        warn!(expected = assembly.buffer.len(), got = req.offset, "out-of-order snapshot chunk, restarting assembly");
        assembly.buffer.clear();
    }
    assembly.buffer.extend_from_slice(&req.data);

    if req.done {
        let assembly = inner.snapshot_assembly.take().unwrap();
        match sequencer_proto::Snapshot::decode(assembly.buffer.as_slice()) {
            Ok(proto_snapshot) => match sequencer_types::Snapshot::try_from(proto_snapshot) {
                Ok(snapshot) => {
                    inner.snapshot_applier.install_snapshot(snapshot).await;
                    if let Err(e) = inner.log.truncate_prefix(assembly.last_included_index + 1).await {
                        warn!(error = %e, "failed truncating log prefix after snapshot install");
                    }
                    inner.state.last_applied = assembly.last_included_index;
                    inner.state.commit_index = inner.state.commit_index.max(assembly.last_included_index);
                }
                Err(e) => warn!(error = %e, "malformed snapshot payload"),
            },
            Err(e) => warn!(error = %e, "failed decoding assembled snapshot"),
        }
    }

    InstallSnapshotResponse { term: inner.state.current_term }
}

async fn handle_sync<T: RaftTransport>(inner: &Inner<T>, req: SyncRequest) -> SyncResponse {
    let last_index = inner.log.last_index().await;
    if req.from_index > 0 && inner.log.get(req.from_index).await.is_none() && req.from_index <= last_index {
        return SyncResponse { accepted: false, snapshot_available: true, from_index: last_index };
    }
    SyncResponse { accepted: true, snapshot_available: false, from_index: last_index }
}

async fn handle_propose<T: RaftTransport + 'static>(
    inner: &mut Inner<T>,
    self_tx: &mpsc::UnboundedSender<Event>,
    batch: Batch,
    reply: oneshot::Sender<Result<u64, RaftError>>,
) {
    let NodeRole::Leader { .. } = &inner.state.role else {
        let _ = reply.send(Err(RaftError::NotLeader { leader_id: inner.state.leader_id() }));
        return;
    };

    let term = inner.state.current_term;
    let index = match inner.log.append(term, batch).await {
        Ok(index) => index,
        Err(e) => {
            let _ = reply.send(Err(RaftError::Log(e)));
            return;
        }
    };
    inner.pending_commits.insert(index, reply);

    replicate_to_all_peers(inner, self_tx).await;

    let commit_timeout = inner.config.commit_timeout;
    let self_tx = self_tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(commit_timeout).await;
        let _ = self_tx.send(Event::AppendResult {
            term_at_request: term,
            peer: NodeId(u64::MAX),
            prev_log_index: 0,
            sent_up_to: index,
            outcome: Err(RaftError::Transport { peer: NodeId(u64::MAX), reason: "commit timeout".into() }),
        });
    });
}

async fn start_election<T: RaftTransport + 'static>(inner: &mut Inner<T>, self_tx: &mpsc::UnboundedSender<Event>) {
    inner.state.current_term += 1;
    inner.state.voted_for = Some(inner.state.node_id);
    inner.state.role = NodeRole::Candidate { votes: std::iter::once(inner.state.node_id).collect() };
    let term = inner.state.current_term;
    info!(term, node_id = ?inner.state.node_id, "starting election");

    if inner.peers.is_empty() {
        become_leader(inner);
        return;
    }

    let last_index = inner.log.last_index().await;
    let last_term = inner.log.last_term().await;
    let req = RequestVoteRequest { term, candidate_id: inner.state.node_id.0, last_log_index: last_index, last_log_term: last_term };

    for &peer in &inner.peers {
        let transport = inner.transport.clone();
        let self_tx = self_tx.clone();
        let req = req.clone();
        tokio::spawn(async move {
            let outcome = transport.request_vote(peer, req).await;
            let (granted, peer_term) = match outcome {
                Ok(resp) => (resp.vote_granted, resp.term),
                Err(_) => (false, term),
            };
            let _ = self_tx.send(Event::VoteResult { term_at_request: term, peer, granted, peer_term });
        });
    }
    publish_view(inner);
}

async fn handle_vote_result<T: RaftTransport>(inner: &mut Inner<T>, term_at_request: u64, peer: NodeId, granted: bool, peer_term: u64) {
    if term_at_request != inner.state.current_term {
        return; // stale response from a previous term's election
    }
    if peer_term > inner.state.current_term {
        step_down(inner, peer_term, None);
        publish_view(inner);
        return;
    }
    let NodeRole::Candidate { votes } = &mut inner.state.role else { return };
    if granted {
        votes.insert(peer);
    }
    let quorum = (inner.peers.len() + 1) / 2 + 1;
    if votes.len() >= quorum {
        become_leader(inner);
    }
    publish_view(inner);
}

fn become_leader<T: RaftTransport>(inner: &mut Inner<T>) {
    // next_index is patched to last_index+1 on the first replicate_to_all_peers call.
    let peers = inner.peers.iter().map(|&p| (p, PeerState::new(p, 0))).collect();
    inner.state.role = NodeRole::Leader { peers };
    info!(term = inner.state.current_term, node_id = ?inner.state.node_id, "became leader");
    publish_view(inner);
}

async fn send_heartbeats<T: RaftTransport + 'static>(inner: &mut Inner<T>, self_tx: &mpsc::UnboundedSender<Event>) {
    replicate_to_all_peers(inner, self_tx).await;
}

async fn replicate_to_all_peers<T: RaftTransport + 'static>(inner: &mut Inner<T>, self_tx: &mpsc::UnboundedSender<Event>) {
    let term = inner.state.current_term;
    let commit_index = inner.state.commit_index;
    let last_index = inner.log.last_index().await;

    let NodeRole::Leader { peers } = &mut inner.state.role else { return };
    for (&peer_id, peer_state) in peers.iter_mut() {
        if peer_state.next_index == 0 {
            peer_state.next_index = last_index + 1;
        }
        if peer_state.inflight {
            continue;
        }
        let prev_log_index = peer_state.next_index.saturating_sub(1);
        let prev_log_term = if prev_log_index == 0 {
            0
        } else {
            inner.log.get(prev_log_index).await.map(|e| e.term).unwrap_or(0)
        };
        let entries: Vec<sequencer_proto::LogEntry> =
            inner.log.get_entries_after(prev_log_index).await.iter().map(sequencer_proto::LogEntry::from).collect();
        let sent_up_to = last_index;

        peer_state.inflight = true;
        let req = AppendEntriesRequest {
            term,
            leader_id: inner.state.node_id.0,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: commit_index,
        };
        let transport = inner.transport.clone();
        let self_tx = self_tx.clone();
        tokio::spawn(async move {
            let outcome = transport.append_entries(peer_id, req).await;
            let _ = self_tx.send(Event::AppendResult { term_at_request: term, peer: peer_id, prev_log_index, sent_up_to, outcome });
        });
    }
}

async fn handle_append_result<T: RaftTransport + 'static>(
    inner: &mut Inner<T>,
    self_tx: &mpsc::UnboundedSender<Event>,
    term_at_request: u64,
    peer: NodeId,
    prev_log_index: u64,
    sent_up_to: u64,
    outcome: Result<AppendEntriesResponse, RaftError>,
) {
    if peer.0 == u64::MAX {
        // Synthetic commit-timeout watchdog: fail the proposal if it is
        // still pending once `commitTimeout` has elapsed.
        if let Some(tx) = inner.pending_commits.remove(&sent_up_to) {
            let _ = tx.send(Err(RaftError::Transport { peer, reason: "commit timeout".into() }));
        }
        return;
    }

    if term_at_request != inner.state.current_term {
        return;
    }

    let resp = match outcome {
        Ok(resp) => resp,
        Err(_) => {
            if let NodeRole::Leader { peers } = &mut inner.state.role {
                if let Some(p) = peers.get_mut(&peer) {
                    p.inflight = false;
                }
            }
            return;
        }
    };

    if resp.term > inner.state.current_term {
        step_down(inner, resp.term, None);
        publish_view(inner);
        return;
    }

    let NodeRole::Leader { peers } = &mut inner.state.role else { return };
    let Some(peer_state) = peers.get_mut(&peer) else { return };
    peer_state.inflight = false;

    if resp.success {
        peer_state.match_index = peer_state.match_index.max(sent_up_to);
        peer_state.next_index = sent_up_to + 1;
        advance_commit_index(inner, self_tx).await;
    } else {
        peer_state.next_index = resp.conflict_index.unwrap_or(prev_log_index.saturating_sub(1)).max(1);
    }
}

async fn advance_commit_index<T: RaftTransport + 'static>(inner: &mut Inner<T>, _self_tx: &mpsc::UnboundedSender<Event>) {
    let NodeRole::Leader { peers } = &inner.state.role else { return };
    let mut match_indices: Vec<u64> = peers.values().map(|p| p.match_index).collect();
    match_indices.push(inner.log.last_index().await); // the leader counts itself
    match_indices.sort_unstable();
    let quorum_index = match_indices[match_indices.len() / 2];

    if quorum_index <= inner.state.commit_index {
        return;
    }
    // A leader only directly commits entries from its own term (§4.6
    // safety rule); prior-term entries become committed implicitly once a
    // current-term entry at or after them is committed.
    if let Some(entry) = inner.log.get(quorum_index).await {
        if entry.term != inner.state.current_term {
            return;
        }
    }
    apply_newly_committed(inner, quorum_index).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::NoopListener;
    use crate::transport::InProcessNetwork;
    use sequencer_types::{AccountId, Priority, Transaction, TxId};
    use std::time::Duration as StdDuration;

    fn sample_batch(tag: u8) -> Batch {
        let tx = Transaction {
            id: TxId::from_tag(&[tag]),
            sender: AccountId::from_tag(b"sender"),
            recipient: AccountId::from_tag(b"recipient"),
            nonce: tag as u64,
            priority: Priority::Medium,
            submitted_at: tag as u64,
            signature: vec![tag],
            payload: vec![],
            conflict_set: Default::default(),
        }
        .with_default_conflict_set();
        Batch::new(tag as u64, vec![tx])
    }

    async fn spawn_node(
        node_id: NodeId,
        peers: Vec<NodeId>,
        network: &InProcessNetwork,
        dir: &std::path::Path,
    ) -> RaftHandle {
        let log = Arc::new(
            ReplicationLog::open(dir, replication_log::ReplicationLogConfig::default()).await.unwrap(),
        );
        let mut config = RaftConfig::default();
        // Keep scenario tests fast; still well clear of any scheduling jitter.
        config.election_timeout_min = StdDuration::from_millis(40);
        config.election_timeout_max = StdDuration::from_millis(70);
        config.heartbeat_interval = StdDuration::from_millis(10);
        let transport = Arc::new(network.transport());
        let handle = RaftCore::spawn(node_id, peers, log, transport, Arc::new(NoopListener), Arc::new(NoopListener), config);
        network.register(node_id, Arc::new(handle.clone()));
        handle
    }

    async fn wait_for_leader(handles: &[RaftHandle], timeout: StdDuration) -> Option<RaftHandle> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            for h in handles {
                if h.state_view().role == sequencer_types::RoleTag::Leader {
                    return Some(h.clone());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn single_node_becomes_leader_without_peers() {
        let dir = tempfile::tempdir().unwrap();
        let network = InProcessNetwork::new();
        let handle = spawn_node(NodeId(1), vec![], &network, dir.path()).await;

        let leader = wait_for_leader(&[handle], StdDuration::from_secs(1)).await;
        assert!(leader.is_some());
    }

    #[tokio::test]
    async fn three_node_cluster_elects_exactly_one_leader() {
        let network = InProcessNetwork::new();
        let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
        let ids = vec![NodeId(1), NodeId(2), NodeId(3)];

        let mut handles = Vec::new();
        for (i, &id) in ids.iter().enumerate() {
            let peers: Vec<NodeId> = ids.iter().copied().filter(|&p| p != id).collect();
            handles.push(spawn_node(id, peers, &network, dirs[i].path()).await);
        }

        let leader = wait_for_leader(&handles, StdDuration::from_secs(2)).await;
        assert!(leader.is_some());

        let leader_count = {
            let mut count = 0;
            for h in &handles {
                if h.state_view().role == sequencer_types::RoleTag::Leader {
                    count += 1;
                }
            }
            count
        };
        assert_eq!(leader_count, 1);
    }

    #[tokio::test]
    async fn proposed_batch_replicates_and_commits_on_quorum() {
        let network = InProcessNetwork::new();
        let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
        let ids = vec![NodeId(1), NodeId(2), NodeId(3)];

        let mut handles = Vec::new();
        for (i, &id) in ids.iter().enumerate() {
            let peers: Vec<NodeId> = ids.iter().copied().filter(|&p| p != id).collect();
            handles.push(spawn_node(id, peers, &network, dirs[i].path()).await);
        }

        let leader = wait_for_leader(&handles, StdDuration::from_secs(2)).await.expect("a leader must emerge");

        let committed_index = leader.propose(sample_batch(1)).await.expect("quorum-backed propose must succeed");
        assert_eq!(committed_index, 1);

        // Give the other replicas a couple of heartbeat rounds to catch up.
        tokio::time::sleep(StdDuration::from_millis(100)).await;
        for h in &handles {
            assert!(h.state_view().commit_index >= 1 || h.state_view().role == sequencer_types::RoleTag::Leader);
        }
    }

    #[tokio::test]
    async fn non_leader_rejects_propose() {
        let network = InProcessNetwork::new();
        let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
        let ids = vec![NodeId(1), NodeId(2), NodeId(3)];

        let mut handles = Vec::new();
        for (i, &id) in ids.iter().enumerate() {
            let peers: Vec<NodeId> = ids.iter().copied().filter(|&p| p != id).collect();
            handles.push(spawn_node(id, peers, &network, dirs[i].path()).await);
        }

        let leader = wait_for_leader(&handles, StdDuration::from_secs(2)).await.expect("a leader must emerge");
        let follower = handles.iter().find(|h| h.state_view().node_id != leader.state_view().node_id).unwrap();

        let err = follower.propose(sample_batch(9)).await.unwrap_err();
        assert!(matches!(err, RaftError::NotLeader { .. }));
    }
}

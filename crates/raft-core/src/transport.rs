//! `RaftTransport` (§4.6a) abstracts the control loop away from how an
//! AppendEntries/RequestVote/InstallSnapshot/Sync call actually reaches a
//! peer, so the loop itself is deterministic and testable without real
//! network timing.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use sequencer_proto::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse, RaftRpcClient,
    RequestVoteRequest, RequestVoteResponse, SyncRequest, SyncResponse,
};
use sequencer_types::NodeId;
use tokio::sync::Mutex as AsyncMutex;
use tonic::transport::Channel;

use crate::error::RaftError;

#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn request_vote(&self, peer: NodeId, req: RequestVoteRequest) -> Result<RequestVoteResponse, RaftError>;
    async fn append_entries(&self, peer: NodeId, req: AppendEntriesRequest) -> Result<AppendEntriesResponse, RaftError>;
    async fn install_snapshot(&self, peer: NodeId, req: InstallSnapshotRequest) -> Result<InstallSnapshotResponse, RaftError>;
    async fn sync(&self, peer: NodeId, req: SyncRequest) -> Result<SyncResponse, RaftError>;
}

/// A node's view of the in-process RPC surface other nodes dial into.
/// `RaftCore` implements this directly; `InProcessTransport` dispatches
/// straight into a peer's registered handler with no serialization, used by
/// every multi-node scenario test in §8.
#[async_trait]
pub trait RaftRpcHandler: Send + Sync {
    async fn handle_request_vote(&self, req: RequestVoteRequest) -> RequestVoteResponse;
    async fn handle_append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse;
    async fn handle_install_snapshot(&self, req: InstallSnapshotRequest) -> InstallSnapshotResponse;
    async fn handle_sync(&self, req: SyncRequest) -> SyncResponse;
}

/// Shared registry every node's `InProcessTransport` dials through. Clone
/// freely; clones share the same underlying registry.
#[derive(Clone, Default)]
pub struct InProcessNetwork {
    handlers: Arc<RwLock<HashMap<NodeId, Arc<dyn RaftRpcHandler>>>>,
}

impl InProcessNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node_id: NodeId, handler: Arc<dyn RaftRpcHandler>) {
        self.handlers.write().unwrap().insert(node_id, handler);
    }

    pub fn unregister(&self, node_id: NodeId) {
        self.handlers.write().unwrap().remove(&node_id);
    }

    pub fn transport(&self) -> InProcessTransport {
        InProcessTransport { network: self.clone() }
    }

    fn handler_for(&self, peer: NodeId) -> Result<Arc<dyn RaftRpcHandler>, RaftError> {
        self.handlers.read().unwrap().get(&peer).cloned().ok_or_else(|| RaftError::Transport {
            peer,
            reason: "no such peer registered on this in-process network".into(),
        })
    }
}

pub struct InProcessTransport {
    network: InProcessNetwork,
}

#[async_trait]
impl RaftTransport for InProcessTransport {
    async fn request_vote(&self, peer: NodeId, req: RequestVoteRequest) -> Result<RequestVoteResponse, RaftError> {
        Ok(self.network.handler_for(peer)?.handle_request_vote(req).await)
    }

    async fn append_entries(&self, peer: NodeId, req: AppendEntriesRequest) -> Result<AppendEntriesResponse, RaftError> {
        Ok(self.network.handler_for(peer)?.handle_append_entries(req).await)
    }

    async fn install_snapshot(
        &self,
        peer: NodeId,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, RaftError> {
        Ok(self.network.handler_for(peer)?.handle_install_snapshot(req).await)
    }

    async fn sync(&self, peer: NodeId, req: SyncRequest) -> Result<SyncResponse, RaftError> {
        Ok(self.network.handler_for(peer)?.handle_sync(req).await)
    }
}

/// Production transport: a `tonic` client per peer, generated from
/// `sequencer.proto` (§6a), connected lazily and cached.
pub struct GrpcTransport {
    addresses: HashMap<NodeId, String>,
    clients: AsyncMutex<HashMap<NodeId, RaftRpcClient<Channel>>>,
}

impl GrpcTransport {
    pub fn new(addresses: HashMap<NodeId, String>) -> Self {
        Self { addresses, clients: AsyncMutex::new(HashMap::new()) }
    }

    async fn client_for(&self, peer: NodeId) -> Result<RaftRpcClient<Channel>, RaftError> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&peer) {
            return Ok(client.clone());
        }
        let addr = self.addresses.get(&peer).ok_or_else(|| RaftError::Transport {
            peer,
            reason: "no address configured for peer".into(),
        })?;
        let client = RaftRpcClient::connect(addr.clone())
            .await
            .map_err(|e| RaftError::Transport { peer, reason: e.to_string() })?;
        clients.insert(peer, client.clone());
        Ok(client)
    }
}

#[async_trait]
impl RaftTransport for GrpcTransport {
    async fn request_vote(&self, peer: NodeId, req: RequestVoteRequest) -> Result<RequestVoteResponse, RaftError> {
        let mut client = self.client_for(peer).await?;
        client
            .request_vote(req)
            .await
            .map(|r| r.into_inner())
            .map_err(|e| RaftError::Transport { peer, reason: e.to_string() })
    }

    async fn append_entries(&self, peer: NodeId, req: AppendEntriesRequest) -> Result<AppendEntriesResponse, RaftError> {
        let mut client = self.client_for(peer).await?;
        client
            .append_entries(req)
            .await
            .map(|r| r.into_inner())
            .map_err(|e| RaftError::Transport { peer, reason: e.to_string() })
    }

    async fn install_snapshot(
        &self,
        peer: NodeId,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, RaftError> {
        let mut client = self.client_for(peer).await?;
        client
            .install_snapshot(req)
            .await
            .map(|r| r.into_inner())
            .map_err(|e| RaftError::Transport { peer, reason: e.to_string() })
    }

    async fn sync(&self, peer: NodeId, req: SyncRequest) -> Result<SyncResponse, RaftError> {
        let mut client = self.client_for(peer).await?;
        client.sync(req).await.map(|r| r.into_inner()).map_err(|e| RaftError::Transport { peer, reason: e.to_string() })
    }
}

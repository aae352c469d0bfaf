//! `tonic` realization of the peer-to-peer `RaftRpc` service (§6a). Every
//! handler is a thin translation from a `tonic::Request`/`Response` pair to
//! `raft-core`'s infallible `RaftRpcHandler`, which `RaftHandle` already
//! implements by forwarding into the control loop's event channel.

use raft_core::{RaftHandle, RaftRpcHandler};
use sequencer_proto::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse, RaftRpc,
    RequestVoteRequest, RequestVoteResponse, SyncRequest, SyncResponse,
};
use tonic::{Request, Response, Status};

pub struct RaftRpcService {
    handle: RaftHandle,
}

impl RaftRpcService {
    pub fn new(handle: RaftHandle) -> Self {
        Self { handle }
    }
}

#[tonic::async_trait]
impl RaftRpc for RaftRpcService {
    async fn request_vote(&self, request: Request<RequestVoteRequest>) -> Result<Response<RequestVoteResponse>, Status> {
        Ok(Response::new(self.handle.handle_request_vote(request.into_inner()).await))
    }

    async fn append_entries(
        &self,
        request: Request<AppendEntriesRequest>,
    ) -> Result<Response<AppendEntriesResponse>, Status> {
        Ok(Response::new(self.handle.handle_append_entries(request.into_inner()).await))
    }

    async fn install_snapshot(
        &self,
        request: Request<InstallSnapshotRequest>,
    ) -> Result<Response<InstallSnapshotResponse>, Status> {
        Ok(Response::new(self.handle.handle_install_snapshot(request.into_inner()).await))
    }

    async fn sync(&self, request: Request<SyncRequest>) -> Result<Response<SyncResponse>, Status> {
        Ok(Response::new(self.handle.handle_sync(request.into_inner()).await))
    }
}

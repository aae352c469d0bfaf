//! Generated message types for the peer-to-peer wire protocol (spec §6),
//! reused verbatim as the on-disk `ReplicationLog`/`Snapshot` encoding
//! (spec §4.2a, §6a). [`convert`] provides the lossless mapping to and from
//! `sequencer-types`' domain model.

#![allow(clippy::all)]

tonic::include_proto!("sequencer");

mod convert;
pub use convert::ConversionError;

pub use raft_rpc_client::RaftRpcClient;
pub use raft_rpc_server::{RaftRpc, RaftRpcServer};

use agent_relay_core::StoreError;
use agent_relay_rpc::RpcError;
use thiserror::Error;

/// Sync engine error.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),
    #[error("Invalid RPC params: {0}")]
    InvalidParams(#[from] serde_json::Error),
    #[error("Sync engine stopped")]
    EngineStopped,
}

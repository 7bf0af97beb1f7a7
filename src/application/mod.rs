// Application layer - Reconciliation and orchestration over the collaborator ports
pub mod metrics_repository;
pub mod push_channel;
pub mod reconciler;
pub mod synchronizer;

// Infrastructure layer - External dependencies and adapters
pub mod chunked_frames;
pub mod config;
pub mod http_push_channel;
pub mod http_repository;
pub mod wire;

pub mod coordinator;
pub mod executor;
pub mod fingerprint;
pub mod inference;
pub mod kv;
pub mod queue;
pub mod storage;
pub mod stores;

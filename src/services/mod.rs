//! Migration engine services.
//!
//! `state_store` owns the persisted state; `remote` is the provider seam with
//! `s3_remote` and `fixture` behind it. The phase components (`scanner`,
//! `restore`, `transfer`, `verifier`, `deleter`) are sequenced per bucket by
//! `pipeline` and across phases by `controller`.

pub mod confirm;
pub mod controller;
pub mod deleter;
pub mod destination;
pub mod fixture;
pub mod layout;
pub mod lock;
pub mod pipeline;
pub mod remote;
pub mod restore;
pub mod retry;
pub mod s3_remote;
pub mod scanner;
pub mod state_store;
pub mod transfer;
pub mod verifier;

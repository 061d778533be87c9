//! Library entrypoint for jul.
//!
//! The primary interface is the `jul` binary. This lib target exposes the
//! draft, sync, checkpoint, restack and trace machinery to integration tests
//! and to other frontends.

pub mod api_client;
pub mod change_id;
pub mod checkpoint;
pub mod config;
pub mod draft;
pub mod engine;
pub mod git;
pub mod notes;
pub mod output;
pub mod refs;
pub mod remote;
pub mod restack;
pub mod secrets;
pub mod sync;
pub mod syncignore;
pub mod trace;
pub mod workspace;

//! Replicated chat log.
//!
//! Chat messages are stored in a local `redb` database on every node and kept
//! identical across nodes by committing each write through raft first. A write
//! becomes visible on a node only once that node applies the committed entry.
//!
//! # Architecture
//!
//! - **Caller threads**: the console (or any embedder) calls the stores
//! - **Raft worker thread**: drives consensus, applies committed entries and
//!   runs the listeners that materialize them into the local store
//! - **Transport threads**: accept and send raft messages over TCP
//!
//! Threads communicate over crossbeam channels; raft state is owned by the
//! worker alone.
//!
//! # Modules
//!
//! - [`message`]: chat event types and their binary codec
//! - [`store`]: the [`ChatLogStore`](store::ChatLogStore) contract, the local
//!   store and the replicated store
//! - [`cluster`]: the [`ClusterStateMachine`](cluster::ClusterStateMachine)
//!   contract and its raft implementation
//! - [`config`]: node configuration
//! - [`protocol`]: console command parsing
//! - [`telemetry`]: logging setup

pub mod cluster;
pub mod config;
pub mod message;
pub mod protocol;
pub mod store;
pub mod telemetry;

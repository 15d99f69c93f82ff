//! Off-chain coordinator for the request/response protocol (RRP).
//!
//! Each cycle scans the configured chains for request events, calls the requested APIs through
//! an adapter, and answers on chain from the sponsor's designated wallet:
//!
//! - [`discovery`], [`verification`], [`authorization`], [`adapter`] turn logs into answered,
//!   authorized requests,
//! - [`nonces`], [`gas`], [`fulfillments`] turn those into signed transactions,
//! - [`coordinator`] chains the stages per chain and runs chains concurrently.
//!
//! Chain access goes through [`chain::RrpProvider`]; [`chain::evm::EvmProvider`] is the
//! JSON-RPC implementation.

pub mod adapter;
pub mod authorization;
pub mod chain;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod from_env;
pub mod fulfillments;
pub mod gas;
pub mod nonces;
pub mod sig_down;
pub mod state;
pub mod telemetry;
pub mod types;
pub mod verification;
pub mod wallet;

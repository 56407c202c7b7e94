//! Per-site revision probe.
//!
//! Clones one repository once, then keeps asking the remote for the tip of one branch
//! and serves the last hash it saw at `GET /`.

pub mod checker;
pub mod error;
pub mod server;

pub use checker::{find_branch_hash, repo_name_from_url, RepoChecker};
pub use error::CheckerError;
pub use server::router;

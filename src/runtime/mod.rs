//! # Runtime
//!
//! Process initialization, the kube-runtime watch loops and the error policy
//! they share.

pub mod error_policy;
pub mod initialization;
pub mod watch_loop;

pub use error_policy::*;
pub use initialization::*;
pub use watch_loop::*;

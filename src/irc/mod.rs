//! IRC-proxy protocol (§4.4, §4.8–§4.11): the largest component by share.
//!
//! Split along the same lines the design calls out: numeric/line synthesis,
//! redirection patterns, backlog replay, and the state machine itself that
//! ties them together with the client's inbound commands.

pub mod backlog;
pub mod numerics;
pub mod proxy;
pub mod redirect;

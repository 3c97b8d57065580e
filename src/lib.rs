//! golem-herder — herding golems, minions and daemons for webstrates.
//!
//! The herder manages three kinds of externally-hosted processes, each tied
//! to a collaborative document (a "webstrate"):
//!
//! - **Golems**: one long-lived headless-browser container per webstrate,
//!   acting as a programmable resident client.
//! - **Minions**: one-shot sandboxed lambdas plus ad-hoc external processes
//!   attached over websockets, brokered to their golem.
//! - **Daemons**: user-provided long-lived containers whose runtime is
//!   credit-metered against an authenticated subject.

pub mod broker;
pub mod config;
pub mod container;
pub mod daemon;
pub mod error;
pub mod golem;
pub mod ledger;
pub mod minion;
pub mod server;
pub mod token;

//! This library provides networking for `dspace`.
//!
//! Two independent pieces live here:
//!
//! - [`TcpComm`], an implementation of the core `Communicator` trait over a
//!   full mesh of TCP connections, which lets participants of a single
//!   simulation run as separate processes or on separate machines,
//! - the remote query protocol, made of [`QueryServer`] and [`QueryClient`],
//!   which exposes a published `Inspector` snapshot to external debugging
//!   and visualization tools.
//!
//! # Query protocol
//!
//! Clients send requests and block on the matching response. Supported
//! requests are snapshot locking and unlocking, point-to-owner lookup and
//! fetching the field storage of a single leaf. Leaf storage responses may
//! be lz4-compressed, see the `lz4` feature.
//!
//! Any error raised while serving a request is sent back as an error
//! response and surfaces on the client as `Error::Remote`.
//!
//! [`TcpComm`]: tcp/struct.TcpComm.html
//! [`QueryServer`]: server/struct.QueryServer.html
//! [`QueryClient`]: client/struct.QueryClient.html

#[macro_use]
extern crate serde;
#[macro_use]
extern crate log;

pub use client::QueryClient;
pub use error::{Error, Result};
pub use server::QueryServer;
pub use tcp::{TcpComm, TcpCommConfig};

pub mod client;
pub mod error;
pub mod msg;
pub mod server;
pub mod tcp;

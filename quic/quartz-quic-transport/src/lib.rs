// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The per-connection transport core: packet number spaces, loss
//! recovery, flow control, streams, connection IDs, path management,
//! the connection state machine, and the Master/Worker dispatch layer.
//!
//! Everything here is single-threaded per connection: a connection is
//! owned by exactly one worker loop and never touched from anywhere
//! else. The only cross-thread structures are the worker task queues.

pub mod buffer;
pub mod connection;
pub mod endpoint;
pub mod flow_control;
pub mod path;
pub mod recovery;
pub mod space;
pub mod stream;
pub mod transmission;

pub use connection::Connection;

// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transport datatypes and algorithms for the quartz QUIC implementation.
//!
//! This crate contains no I/O. Everything here is driven by the
//! `quartz-quic-transport` connection machinery or by the embedder.

#![cfg_attr(all(not(test), not(feature = "std")), no_std)]

#[cfg(feature = "alloc")]
extern crate alloc;

pub mod ack;
pub mod connection;
pub mod crypto;
pub mod endpoint;
#[macro_use]
pub mod frame;
pub mod inet;
pub mod interval_set;
pub mod packet;
pub mod path;
pub mod random;
pub mod recovery;
pub mod stateless_reset;
pub mod stream;
pub mod time;
pub mod token;
pub mod transmission;
pub mod transport;
pub mod varint;

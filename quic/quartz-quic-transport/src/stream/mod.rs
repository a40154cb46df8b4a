// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod manager;
pub mod recv;
pub mod send;

pub use manager::{StreamControlFrame, StreamManager};
pub use recv::{ReadOutcome, ReceiveStream};
pub use send::{SendSlice, SendStream};

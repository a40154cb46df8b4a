// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use quartz_quic_core::random;
use ring::rand::{SecureRandom, SystemRandom};

/// The system CSPRNG, shared by every endpoint-level consumer
#[derive(Clone, Debug)]
pub struct Random {
    rng: SystemRandom,
}

impl Default for Random {
    fn default() -> Self {
        Self {
            rng: SystemRandom::new(),
        }
    }
}

impl random::Generator for Random {
    fn secure_random_fill(&mut self, dest: &mut [u8]) {
        self.rng
            .fill(dest)
            .expect("the system random source is available");
    }

    fn public_random_fill(&mut self, dest: &mut [u8]) {
        self.rng
            .fill(dest)
            .expect("the system random source is available");
    }
}

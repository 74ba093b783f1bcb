// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

mod array;
mod message_accumulator;

pub use array::Array;
pub use message_accumulator::MessageAccumulator;

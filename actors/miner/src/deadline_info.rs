// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_shared::clock::ChainEpoch;
use serde::{Deserialize, Serialize};

use crate::quantize::QuantSpec;

/// Timing of one proving deadline, seen from `current_epoch`.
///
/// A deadline accepts proofs over `[open, close)`. Its challenge is drawn from the chain
/// a few epochs before it opens.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlineInfo {
    pub current_epoch: ChainEpoch,
    /// Start of the proving period this deadline belongs to.
    pub period_start: ChainEpoch,
    pub index: u64,
    pub open: ChainEpoch,
    pub close: ChainEpoch,
    pub challenge: ChainEpoch,
    /// Fault declarations for this deadline are refused from this epoch on.
    pub fault_cutoff: ChainEpoch,

    windows: WindowParams,
}

/// The policy values needed to step a deadline between proving periods.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct WindowParams {
    deadlines: u64,
    proving_period: ChainEpoch,
    challenge_window: ChainEpoch,
    challenge_lookback: ChainEpoch,
    fault_cutoff: ChainEpoch,
}

impl DeadlineInfo {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        period_start: ChainEpoch,
        deadline_idx: u64,
        current_epoch: ChainEpoch,
        w_post_period_deadlines: u64,
        w_post_proving_period: ChainEpoch,
        w_post_challenge_window: ChainEpoch,
        w_post_challenge_lookback: ChainEpoch,
        fault_declaration_cutoff: ChainEpoch,
    ) -> Self {
        let windows = WindowParams {
            deadlines: w_post_period_deadlines,
            proving_period: w_post_proving_period,
            challenge_window: w_post_challenge_window,
            challenge_lookback: w_post_challenge_lookback,
            fault_cutoff: fault_declaration_cutoff,
        };
        Self::at(period_start, deadline_idx, current_epoch, windows)
    }

    fn at(
        period_start: ChainEpoch,
        index: u64,
        current_epoch: ChainEpoch,
        windows: WindowParams,
    ) -> Self {
        // An index past the last deadline describes the empty window at the period's end.
        let (open, close, challenge, fault_cutoff) = if index < windows.deadlines {
            let open = period_start + index as ChainEpoch * windows.challenge_window;
            (
                open,
                open + windows.challenge_window,
                open - windows.challenge_lookback,
                open - windows.fault_cutoff,
            )
        } else {
            let end = period_start + windows.proving_period;
            (end, end, end, 0)
        };
        Self { current_epoch, period_start, index, open, close, challenge, fault_cutoff, windows }
    }

    pub fn period_started(&self) -> bool {
        self.current_epoch >= self.period_start
    }

    pub fn period_elapsed(&self) -> bool {
        self.current_epoch >= self.next_period_start()
    }

    pub fn period_end(&self) -> ChainEpoch {
        self.next_period_start() - 1
    }

    pub fn next_period_start(&self) -> ChainEpoch {
        self.period_start + self.windows.proving_period
    }

    pub fn is_open(&self) -> bool {
        (self.open..self.close).contains(&self.current_epoch)
    }

    pub fn has_elapsed(&self) -> bool {
        self.current_epoch >= self.close
    }

    /// Last epoch a proof is accepted.
    pub fn last(&self) -> ChainEpoch {
        self.close - 1
    }

    pub fn next_open(&self) -> ChainEpoch {
        self.close
    }

    pub fn fault_cutoff_passed(&self) -> bool {
        self.current_epoch >= self.fault_cutoff
    }

    /// The earliest occurrence of this deadline, in this or a later proving period, that
    /// is still open or yet to come.
    pub fn next_not_elapsed(self) -> Self {
        if !self.has_elapsed() {
            return self;
        }
        let periods_behind = (self.current_epoch - self.close) / self.windows.proving_period + 1;
        let period_start = self.period_start + periods_behind * self.windows.proving_period;
        Self::at(period_start, self.index, self.current_epoch, self.windows)
    }

    pub fn quant_spec(&self) -> QuantSpec {
        QuantSpec { unit: self.windows.proving_period, offset: self.last() }
    }
}

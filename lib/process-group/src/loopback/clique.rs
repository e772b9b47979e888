// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Meeting point for the communicators that share one unique id.
//!
//! Collectives are numbered per communicator in issue order. Every member
//! deposits its input under that number, waits for the full round, takes a
//! copy of all inputs in rank order and departs. The last member to depart
//! removes the round.
//!
//! Point-to-point messages go through FIFO mailboxes keyed by tag. Sends
//! complete as soon as the payload is queued.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use anyhow::{bail, ensure, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::dispatch::P2pTag;
use crate::tensor::TensorData;

struct Round {
    inputs: Vec<Option<TensorData>>,
    arrived: usize,
    departed: usize,
}

#[derive(Default)]
struct CliqueState {
    joined: Vec<bool>,
    rounds: HashMap<u64, Round>,
    mailboxes: HashMap<P2pTag, VecDeque<TensorData>>,
}

pub(crate) struct Clique {
    nranks: usize,
    state: Mutex<CliqueState>,
    cv: Condvar,
}

impl Clique {
    pub(crate) fn new(nranks: usize) -> Self {
        Self {
            nranks,
            state: Mutex::new(CliqueState {
                joined: vec![false; nranks],
                ..Default::default()
            }),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn nranks(&self) -> usize {
        self.nranks
    }

    /// Register `rank` and block until every rank has joined.
    pub(crate) fn join(&self, rank: usize, timeout: Option<Duration>) -> Result<()> {
        ensure!(
            rank < self.nranks,
            "rank {rank} out of range for {} ranks",
            self.nranks
        );
        let deadline = deadline_after(timeout);
        let mut state = self.state.lock();
        ensure!(!state.joined[rank], "rank {rank} joined twice");
        state.joined[rank] = true;
        self.cv.notify_all();

        self.wait_while(&mut state, deadline, "communicator join", |s| {
            s.joined.iter().any(|joined| !joined)
        })
    }

    /// Deposit `input` for round `seq` and return every member's input.
    pub(crate) fn exchange(
        &self,
        seq: u64,
        rank: usize,
        input: TensorData,
        timeout: Option<Duration>,
    ) -> Result<Vec<TensorData>> {
        let deadline = deadline_after(timeout);
        let nranks = self.nranks;
        let mut state = self.state.lock();

        let round = state.rounds.entry(seq).or_insert_with(|| Round {
            inputs: vec![None; nranks],
            arrived: 0,
            departed: 0,
        });
        ensure!(
            round.inputs[rank].is_none(),
            "rank {rank} entered round {seq} twice"
        );
        round.inputs[rank] = Some(input);
        round.arrived += 1;
        self.cv.notify_all();

        let what = format!("collective round {seq}");
        self.wait_while(&mut state, deadline, &what, |s| {
            s.rounds.get(&seq).is_some_and(|r| r.arrived < nranks)
        })?;

        let Some(round) = state.rounds.get_mut(&seq) else {
            bail!("collective round {seq} vanished");
        };
        let inputs = round.inputs.iter().flatten().cloned().collect::<Vec<_>>();
        round.departed += 1;
        if round.departed == nranks {
            state.rounds.remove(&seq);
        }
        Ok(inputs)
    }

    pub(crate) fn post(&self, tag: P2pTag, payload: TensorData) {
        let mut state = self.state.lock();
        state.mailboxes.entry(tag).or_default().push_back(payload);
        self.cv.notify_all();
    }

    pub(crate) fn take(&self, tag: P2pTag, timeout: Option<Duration>) -> Result<TensorData> {
        let deadline = deadline_after(timeout);
        let mut state = self.state.lock();
        let what = format!("message from rank {} to rank {}", tag.src, tag.dst);
        self.wait_while(&mut state, deadline, &what, |s| {
            s.mailboxes.get(&tag).map_or(true, VecDeque::is_empty)
        })?;

        match state.mailboxes.get_mut(&tag).and_then(VecDeque::pop_front) {
            Some(payload) => Ok(payload),
            None => bail!("{what} vanished"),
        }
    }

    fn wait_while<F>(
        &self,
        state: &mut MutexGuard<'_, CliqueState>,
        deadline: Option<Instant>,
        what: &str,
        mut blocked: F,
    ) -> Result<()>
    where
        F: FnMut(&CliqueState) -> bool,
    {
        while blocked(&**state) {
            match deadline {
                Some(deadline) => {
                    if self.cv.wait_until(state, deadline).timed_out() && blocked(&**state) {
                        bail!("timed out waiting for {what}");
                    }
                }
                None => self.cv.wait(state),
            }
        }
        Ok(())
    }
}

/// `None` waits forever, as does a timeout past the representable range.
fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.and_then(|t| Instant::now().checked_add(t))
}

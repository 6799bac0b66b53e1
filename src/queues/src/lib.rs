// Copyright 2023 Gantry Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! One-way queue fabric between a sender and a set of event-loop threads.
//! Every receiver is paired with the waker of the poll instance its thread
//! runs, so a send can interrupt the receiver's poll wait. Wakeups are
//! batched: sends mark a lane dirty and [`Dispatcher::flush`] wakes every
//! dirty lane once.
//!
//! The fabric is deliberately uni-directional; request/response patterns
//! compose two fabrics pointing opposite ways.

pub use net::Waker;

use crossbeam_queue::ArrayQueue;
use rand::distributions::Uniform;
use rand::Rng as RandRng;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use std::sync::Arc;

/// Create a fabric with one mailbox per waker. Each queue is bounded;
/// `capacity` is the maximum number of undelivered items per mailbox.
pub fn fan_out<T>(
    wakers: &[Arc<Waker>],
    capacity: usize,
) -> (Dispatcher<T>, Vec<Mailbox<T>>) {
    let mut lanes = Vec::with_capacity(wakers.len());
    let mut mailboxes = Vec::with_capacity(wakers.len());

    for waker in wakers {
        let queue = Arc::new(ArrayQueue::new(capacity));
        lanes.push(Lane {
            queue: queue.clone(),
            waker: waker.clone(),
            dirty: false,
        });
        mailboxes.push(Mailbox { queue });
    }

    let lane_count = std::cmp::max(1, lanes.len());
    let dispatcher = Dispatcher {
        lanes,
        rng: ChaCha20Rng::from_entropy(),
        distr: Uniform::new(0, lane_count),
    };

    (dispatcher, mailboxes)
}

struct Lane<T> {
    queue: Arc<ArrayQueue<T>>,
    waker: Arc<Waker>,
    dirty: bool,
}

/// The sending side of the fabric: delivers items to one lane, to any lane
/// (uniformly at random, so load spreads evenly), or to all lanes.
pub struct Dispatcher<T> {
    lanes: Vec<Lane<T>>,
    rng: ChaCha20Rng,
    distr: Uniform<usize>,
}

impl<T> Dispatcher<T> {
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Directed send. Returns the item when the lane is full.
    pub fn send_to(&mut self, lane: usize, item: T) -> Result<(), T> {
        let lane = &mut self.lanes[lane];
        lane.queue.push(item)?;
        lane.dirty = true;
        Ok(())
    }

    /// Balanced send to a uniformly random lane. Used where it does not
    /// matter which receiver handles the item.
    pub fn send_any(&mut self, item: T) -> Result<(), T> {
        let lane = self.rng.sample(self.distr);
        self.send_to(lane, item)
    }

    /// Wake every lane that received items since the last flush.
    pub fn flush(&mut self) -> Result<(), std::io::Error> {
        let mut result = Ok(());
        for lane in self.lanes.iter_mut() {
            if lane.dirty {
                match lane.waker.wake() {
                    Ok(()) => lane.dirty = false,
                    Err(e) => result = Err(e),
                }
            }
        }
        result
    }
}

impl<T: Clone> Dispatcher<T> {
    /// Broadcast a clone of the item to every lane. Reports the item back
    /// when any lane was full; the remaining lanes still receive theirs.
    pub fn send_all(&mut self, item: T) -> Result<(), T> {
        let mut rejected = false;
        for lane in 0..self.lanes.len() {
            if self.send_to(lane, item.clone()).is_err() {
                rejected = true;
            }
        }
        if rejected {
            Err(item)
        } else {
            Ok(())
        }
    }
}

/// The receiving side of one lane. Lives on the event-loop thread whose
/// waker the lane was built with.
pub struct Mailbox<T> {
    queue: Arc<ArrayQueue<T>>,
}

impl<T> Mailbox<T> {
    pub fn try_recv(&self) -> Option<T> {
        self.queue.pop()
    }

    /// Move all items pending at the time of the call into `buf`.
    pub fn drain(&self, buf: &mut Vec<T>) {
        let pending = self.queue.len();
        for _ in 0..pending {
            match self.queue.pop() {
                Some(item) => buf.push(item),
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

//! The "user-supplied context (a group-like handle)" spec.md §5 requires:
//! an abstraction over the SPMD collective/point-to-point operations the
//! [`crate::distributor::Distributor`] needs. No parallel collective file
//! I/O abstraction is provided beyond this — rank-local [`crate::FileHandle`]s
//! plus the exchanges below, exactly as the spec's Non-goals require.

/// Upper bound on any single exchange transfer count (spec.md §6, "Limits").
/// A real multi-process `CollectiveContext` implementation must chunk any
/// single transfer at this many elements; the in-process contexts here never
/// approach it, but the constant is part of the contract every implementation
/// must honor.
pub const IO_MAX: i64 = i32::MAX as i64;

/// A group-like handle giving a rank its identity plus the point-to-point
/// and collective primitives the Distributor's algorithm is built from.
/// Every method is a blocking, synchronous call (spec.md §5 — no
/// cancellation, no cooperative scheduling).
pub trait CollectiveContext {
    fn rank(&self) -> i32;
    fn num_procs(&self) -> i32;

    /// All-to-all exchange of `(sfc, size)` pairs. `outgoing[dst]` is the
    /// list this rank wants to send to rank `dst` (possibly empty);
    /// returns `incoming[src]`, the list this rank received from rank `src`.
    /// Used both for the size-table scatter (step 2) and its inverse,
    /// sending computed offsets back to their owners (step 7).
    fn exchange_pairs(&self, outgoing: Vec<Vec<(i64, i64)>>) -> Vec<Vec<(i64, i64)>>;

    /// Receives the scalar forwarded by rank `r-1` via [`Self::send_prefix`]
    /// (0 for rank 0, with no receive performed). The left half of the
    /// chained left-to-right handoff both the global prefix stitch (step 4)
    /// and the offset re-origin carry (step 6) are built from.
    fn recv_prefix(&self) -> i64;

    /// Forwards `value` to rank `r+1` (a no-op on the last rank). Always
    /// called after [`Self::recv_prefix`] so a rank can derive the outgoing
    /// value from whatever it received, rather than only from a
    /// known-upfront addend.
    fn send_prefix(&self, value: i64);

    /// Linear left-to-right chain: receives the accumulator forwarded by
    /// rank `r-1` (0 for rank 0), returns it, and forwards
    /// `received + local_contribution` to rank `r+1`. A convenience layer
    /// over [`Self::recv_prefix`]/[`Self::send_prefix`] for the common case
    /// where the forwarded value is a known-upfront addend (step 4); step 6
    /// calls the split primitives directly since its forwarded value is a
    /// function of the received one.
    fn chain_prefix(&self, local_contribution: i64) -> i64 {
        let base = self.recv_prefix();
        self.send_prefix(base + local_contribution);
        base
    }

    fn all_reduce_max_i32(&self, value: i32) -> i32;
    fn all_reduce_sum_i64(&self, value: i64) -> i64;
}

/// Single-rank identity context: the "single-rank build" spec.md §5
/// requires, where every collective primitive is a local no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalContext;

impl CollectiveContext for LocalContext {
    fn rank(&self) -> i32 {
        0
    }

    fn num_procs(&self) -> i32 {
        1
    }

    fn exchange_pairs(&self, outgoing: Vec<Vec<(i64, i64)>>) -> Vec<Vec<(i64, i64)>> {
        debug_assert_eq!(outgoing.len(), 1);
        outgoing
    }

    fn recv_prefix(&self) -> i64 {
        0
    }

    fn send_prefix(&self, _value: i64) {}

    fn all_reduce_max_i32(&self, value: i32) -> i32 {
        value
    }

    fn all_reduce_sum_i64(&self, value: i64) -> i64 {
        value
    }
}

#[cfg(feature = "testing")]
mod threaded {
    use crossbeam_channel::{Receiver, Sender, unbounded};

    use super::CollectiveContext;

    enum ChannelMsg {
        Pairs(Vec<(i64, i64)>),
        Scalar(i64),
    }

    /// In-process simulation of `num_procs` ranks as native threads
    /// connected by a full mesh of `crossbeam-channel`s. Exercises the
    /// same chained-prefix-sum and all-to-all code paths a real MPI
    /// binding would, without requiring one (S5, property 7).
    pub struct ThreadedContext {
        rank: i32,
        num_procs: i32,
        senders: Vec<Sender<ChannelMsg>>,
        receivers: Vec<Receiver<ChannelMsg>>,
    }

    impl ThreadedContext {
        /// Build one context per rank, pre-wired with a full mesh of
        /// channels. Callers typically move each element into its own
        /// `std::thread::scope` closure.
        pub fn mesh(num_procs: i32) -> Vec<ThreadedContext> {
            assert!(num_procs > 0);
            let n = num_procs as usize;
            // channels[from][to]
            let mut senders: Vec<Vec<Option<Sender<ChannelMsg>>>> =
                (0..n).map(|_| (0..n).map(|_| None).collect()).collect();
            let mut receivers: Vec<Vec<Option<Receiver<ChannelMsg>>>> =
                (0..n).map(|_| (0..n).map(|_| None).collect()).collect();
            for from in 0..n {
                for to in 0..n {
                    if from == to {
                        continue;
                    }
                    let (tx, rx) = unbounded();
                    senders[from][to] = Some(tx);
                    receivers[to][from] = Some(rx);
                }
            }
            let mut contexts = Vec::with_capacity(n);
            for r in 0..n {
                let mut row_senders = Vec::with_capacity(n);
                let mut row_receivers = Vec::with_capacity(n);
                for peer in 0..n {
                    row_senders.push(senders[r][peer].take().unwrap_or_else(|| unbounded().0));
                    row_receivers.push(receivers[r][peer].take().unwrap_or_else(|| unbounded().1));
                }
                contexts.push(ThreadedContext {
                    rank: r as i32,
                    num_procs,
                    senders: row_senders,
                    receivers: row_receivers,
                });
            }
            contexts
        }

        fn send_scalar(&self, peer: i32, value: i64) {
            self.senders[peer as usize]
                .send(ChannelMsg::Scalar(value))
                .expect("peer thread dropped its receiver");
        }

        fn recv_scalar(&self, peer: i32) -> i64 {
            match self.receivers[peer as usize].recv() {
                Ok(ChannelMsg::Scalar(v)) => v,
                Ok(ChannelMsg::Pairs(_)) => panic!("protocol mismatch: expected scalar message"),
                Err(_) => panic!("peer thread dropped its sender"),
            }
        }
    }

    impl CollectiveContext for ThreadedContext {
        fn rank(&self) -> i32 {
            self.rank
        }

        fn num_procs(&self) -> i32 {
            self.num_procs
        }

        fn exchange_pairs(&self, mut outgoing: Vec<Vec<(i64, i64)>>) -> Vec<Vec<(i64, i64)>> {
            assert_eq!(outgoing.len(), self.num_procs as usize);
            let mine = std::mem::take(&mut outgoing[self.rank as usize]);
            for (dst, pairs) in outgoing.into_iter().enumerate() {
                if dst as i32 == self.rank {
                    continue;
                }
                self.senders[dst]
                    .send(ChannelMsg::Pairs(pairs))
                    .expect("peer thread dropped its receiver");
            }
            let mut incoming = vec![Vec::new(); self.num_procs as usize];
            incoming[self.rank as usize] = mine;
            for src in 0..self.num_procs as usize {
                if src == self.rank as usize {
                    continue;
                }
                incoming[src] = match self.receivers[src].recv() {
                    Ok(ChannelMsg::Pairs(p)) => p,
                    Ok(ChannelMsg::Scalar(_)) => {
                        panic!("protocol mismatch: expected pairs message")
                    }
                    Err(_) => panic!("peer thread dropped its sender"),
                };
            }
            incoming
        }

        fn recv_prefix(&self) -> i64 {
            if self.rank == 0 {
                0
            } else {
                self.recv_scalar(self.rank - 1)
            }
        }

        fn send_prefix(&self, value: i64) {
            if self.rank + 1 < self.num_procs {
                self.send_scalar(self.rank + 1, value);
            }
        }

        fn all_reduce_max_i32(&self, value: i32) -> i32 {
            if self.rank == 0 {
                let mut acc = value;
                for r in 1..self.num_procs {
                    acc = acc.max(self.recv_scalar(r) as i32);
                }
                for r in 1..self.num_procs {
                    self.send_scalar(r, acc as i64);
                }
                acc
            } else {
                self.send_scalar(0, value as i64);
                self.recv_scalar(0) as i32
            }
        }

        fn all_reduce_sum_i64(&self, value: i64) -> i64 {
            if self.rank == 0 {
                let mut acc = value;
                for r in 1..self.num_procs {
                    acc += self.recv_scalar(r);
                }
                for r in 1..self.num_procs {
                    self.send_scalar(r, acc);
                }
                acc
            } else {
                self.send_scalar(0, value);
                self.recv_scalar(0)
            }
        }
    }
}

#[cfg(feature = "testing")]
pub use threaded::ThreadedContext;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_context_is_identity() {
        let ctx = LocalContext;
        assert_eq!(ctx.rank(), 0);
        assert_eq!(ctx.num_procs(), 1);
        assert_eq!(ctx.chain_prefix(42), 0);
        assert_eq!(ctx.all_reduce_max_i32(7), 7);
        assert_eq!(ctx.all_reduce_sum_i64(9), 9);
        let out = vec![vec![(1i64, 2i64)]];
        assert_eq!(ctx.exchange_pairs(out.clone()), out);
    }

    #[cfg(feature = "testing")]
    #[test]
    fn threaded_context_chain_prefix_accumulates() {
        let contexts = ThreadedContext::mesh(4);
        let results: Vec<i64> = std::thread::scope(|scope| {
            let handles: Vec<_> = contexts
                .into_iter()
                .map(|ctx| scope.spawn(move || ctx.chain_prefix(10)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(results, vec![0, 10, 20, 30]);
    }

    #[cfg(feature = "testing")]
    #[test]
    fn threaded_context_all_reduce_max() {
        let contexts = ThreadedContext::mesh(3);
        let inputs = [5i32, 9, 2];
        let results: Vec<i32> = std::thread::scope(|scope| {
            let handles: Vec<_> = contexts
                .into_iter()
                .zip(inputs)
                .map(|(ctx, v)| scope.spawn(move || ctx.all_reduce_max_i32(v)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(results, vec![9, 9, 9]);
    }

    #[cfg(feature = "testing")]
    #[test]
    fn threaded_context_exchange_pairs_routes_by_destination() {
        let contexts = ThreadedContext::mesh(2);
        let results: Vec<Vec<Vec<(i64, i64)>>> = std::thread::scope(|scope| {
            let handles: Vec<_> = contexts
                .into_iter()
                .enumerate()
                .map(|(r, ctx)| {
                    scope.spawn(move || {
                        let mut outgoing = vec![Vec::new(), Vec::new()];
                        outgoing[1 - r] = vec![(r as i64, 100 + r as i64)];
                        ctx.exchange_pairs(outgoing)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(results[0][1], vec![(1, 101)]);
        assert_eq!(results[1][0], vec![(0, 100)]);
    }
}

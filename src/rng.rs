//! Randomness helpers: a buffered fair coin, SplitMix64, and a background
//! block generator that moves random-number production off the hot thread.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use rand::{Error, Rng, RngCore};

/// SplitMix64 mixer; also used to derive partner candidates where no caller
/// generator is available.
#[inline]
pub fn split_mix_64(seed: u64) -> u64 {
    let mut z = seed.wrapping_add(0x9e3779b97f4a7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    z ^ (z >> 31)
}

/// Fair coin that stretches one 64-bit draw over 64 flips.
#[derive(Default)]
pub struct FairCoin {
    buf: u64,
    valid: u32,
}

impl FairCoin {
    pub fn flip<R: Rng>(&mut self, rng: &mut R) -> bool {
        if self.valid == 0 {
            self.buf = rng.next_u64();
            self.valid = 64;
        }
        let res = self.buf & 1 == 1;
        self.buf >>= 1;
        self.valid -= 1;
        res
    }
}

const ELEMENTS_PER_BLOCK: usize = 1 << 16;

struct BlockQueues {
    empty: VecDeque<Vec<u64>>,
    full: VecDeque<Vec<u64>>,
    running: bool,
}

struct Shared {
    queues: Mutex<BlockQueues>,
    ready: Condvar,
}

/// Wraps any sendable engine and pre-generates its output in fixed-size
/// blocks on one producer thread. Blocks are recycled through two queues
/// guarded by a mutex and condition variable; the consumer only parks when no
/// full block is available. Implements [`RngCore`], so every simulator
/// accepts it unchanged. Note that the produced stream differs from running
/// the inner engine inline; determinism per seed still holds.
pub struct BlockRng {
    shared: Arc<Shared>,
    producer: Option<JoinHandle<()>>,
    current: Vec<u64>,
}

impl BlockRng {
    pub fn new<E>(mut engine: E, num_blocks: usize) -> Self
    where
        E: RngCore + Send + 'static,
    {
        assert!(num_blocks >= 2, "need at least two blocks to double-buffer");

        let shared = Arc::new(Shared {
            queues: Mutex::new(BlockQueues {
                empty: (0..num_blocks)
                    .map(|_| Vec::with_capacity(ELEMENTS_PER_BLOCK))
                    .collect(),
                full: VecDeque::new(),
                running: true,
            }),
            ready: Condvar::new(),
        });

        let producer_shared = Arc::clone(&shared);
        let producer = thread::spawn(move || {
            let mut block = {
                let queues = producer_shared.queues.lock().unwrap();
                let mut queues = producer_shared
                    .ready
                    .wait_while(queues, |q| q.running && q.empty.is_empty())
                    .unwrap();
                match queues.empty.pop_front() {
                    Some(block) => block,
                    None => return,
                }
            };

            loop {
                block.clear();
                for _ in 0..ELEMENTS_PER_BLOCK {
                    block.push(engine.next_u64());
                }

                let queues = producer_shared.queues.lock().unwrap();
                let mut queues = producer_shared
                    .ready
                    .wait_while(queues, |q| q.running && q.empty.is_empty())
                    .unwrap();
                if !queues.running {
                    return;
                }
                let fresh = queues.empty.pop_front().expect("woken with an empty queue");
                queues.full.push_back(std::mem::replace(&mut block, fresh));
                drop(queues);
                producer_shared.ready.notify_one();
            }
        });

        Self {
            shared,
            producer: Some(producer),
            current: Vec::new(),
        }
    }

    fn refill(&mut self) {
        let queues = self.shared.queues.lock().unwrap();
        let mut queues = self
            .shared
            .ready
            .wait_while(queues, |q| q.full.is_empty())
            .unwrap();
        let fresh = queues.full.pop_front().expect("woken without a full block");
        queues
            .empty
            .push_back(std::mem::replace(&mut self.current, fresh));
        drop(queues);
        self.shared.ready.notify_one();
    }
}

impl RngCore for BlockRng {
    fn next_u32(&mut self) -> u32 {
        self.next_u64() as u32
    }

    fn next_u64(&mut self) -> u64 {
        if self.current.is_empty() {
            self.refill();
        }
        self.current.pop().expect("refill returned an empty block")
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        let mut chunks = dest.chunks_exact_mut(8);
        for chunk in &mut chunks {
            chunk.copy_from_slice(&self.next_u64().to_le_bytes());
        }
        let tail = chunks.into_remainder();
        if !tail.is_empty() {
            let bytes = self.next_u64().to_le_bytes();
            tail.copy_from_slice(&bytes[..tail.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl Drop for BlockRng {
    fn drop(&mut self) {
        {
            let mut queues = self.shared.queues.lock().unwrap();
            queues.running = false;
        }
        self.shared.ready.notify_all();
        if let Some(producer) = self.producer.take() {
            let _ = producer.join();
        }
    }
}

//! Shared per-connection resources handed out round-robin
//!
//! Each accepted connection picks a timer shard, a read buffer pool and a
//! write buffer pool by its accept counter, spreading lock traffic.

mod buffer;
mod timer;

pub use buffer::BufferPool;
pub use timer::{Timer, TimerCallback, TimerHandle};

use std::sync::Arc;

/// Round sizing
#[derive(Debug, Clone)]
pub struct RoundOptions {
    pub timer: usize,
    pub timer_size: usize,
    pub reader: usize,
    pub read_buf: usize,
    pub read_buf_size: usize,
    pub writer: usize,
    pub write_buf: usize,
    pub write_buf_size: usize,
}

impl Default for RoundOptions {
    fn default() -> Self {
        Self {
            timer: 32,
            timer_size: 2048,
            reader: 32,
            read_buf: 1024,
            read_buf_size: 8192,
            writer: 32,
            write_buf: 1024,
            write_buf_size: 8192,
        }
    }
}

#[derive(Debug)]
pub struct Round {
    timers: Vec<Arc<Timer>>,
    readers: Vec<Arc<BufferPool>>,
    writers: Vec<Arc<BufferPool>>,
}

impl Round {
    /// Build every shard; timers start on the current runtime
    #[must_use]
    pub fn new(options: &RoundOptions) -> Self {
        let timers = (0..options.timer.max(1))
            .map(|_| Arc::new(Timer::new(options.timer_size)))
            .collect();
        let readers = (0..options.reader.max(1))
            .map(|_| Arc::new(BufferPool::new(options.read_buf, options.read_buf_size)))
            .collect();
        let writers = (0..options.writer.max(1))
            .map(|_| Arc::new(BufferPool::new(options.write_buf, options.write_buf_size)))
            .collect();
        Self {
            timers,
            readers,
            writers,
        }
    }

    pub fn timer(&self, rn: usize) -> &Arc<Timer> {
        &self.timers[rn % self.timers.len()]
    }

    pub fn reader(&self, rn: usize) -> &Arc<BufferPool> {
        &self.readers[rn % self.readers.len()]
    }

    pub fn writer(&self, rn: usize) -> &Arc<BufferPool> {
        &self.writers[rn % self.writers.len()]
    }

    /// Buffers handed out by every pool and not yet returned
    pub fn outstanding_buffers(&self) -> isize {
        self.readers
            .iter()
            .chain(&self.writers)
            .map(|pool| pool.outstanding())
            .sum()
    }

    /// Total gets and puts across every pool
    pub fn buffer_counts(&self) -> (usize, usize) {
        self.readers
            .iter()
            .chain(&self.writers)
            .fold((0, 0), |(gets, puts), pool| {
                (gets + pool.gets(), puts + pool.puts())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_robin_selection() {
        let round = Round::new(&RoundOptions {
            timer: 2,
            timer_size: 4,
            reader: 3,
            read_buf: 1,
            read_buf_size: 16,
            writer: 3,
            write_buf: 1,
            write_buf_size: 16,
        });

        assert!(Arc::ptr_eq(round.timer(0), round.timer(2)));
        assert!(!Arc::ptr_eq(round.timer(0), round.timer(1)));
        assert!(Arc::ptr_eq(round.reader(1), round.reader(4)));
        assert!(Arc::ptr_eq(round.writer(2), round.writer(5)));

        let buf = round.reader(0).get();
        assert_eq!(round.outstanding_buffers(), 1);
        round.reader(0).put(buf);
        assert_eq!(round.outstanding_buffers(), 0);
        assert_eq!(round.buffer_counts(), (1, 1));
    }
}

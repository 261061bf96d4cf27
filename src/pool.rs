//! Partitioned fork-join execution over an injected worker pool.
//!
//! # Partitioning
//!
//! Every helper splits the index space `[0, n)` into contiguous chunks of
//! `ceil(n / threads)` indices, runs one task per chunk, and blocks until all of
//! them finish. Row-independent work therefore produces the same result on a
//! parallel pool and on [`WorkerPool::sequential`].
//!
//! # Ownership
//!
//! Mutable helpers hand each task an exclusive `&mut` slice covering only its own
//! rows, so concurrent updates of one weight matrix never need a lock.
//!
//! The pool is an explicit value shared through `Arc`, never a process-wide
//! singleton: tests can inject a sequential pool while training runs use one
//! thread per available processor.

use log::debug;
use rayon::prelude::*;
use std::num::NonZeroUsize;
use std::ops::Range;

use crate::error::{NetError, NetResult};

/// A fork-join worker pool used by nodes and optimizers.
#[derive(Debug)]
pub struct WorkerPool {
    /// Dedicated rayon pool; `None` runs every chunk on the calling thread in order.
    pool: Option<rayon::ThreadPool>,
    threads: usize,
}

impl WorkerPool {
    /// Build a pool with `threads` workers.
    ///
    /// A single worker degenerates to the sequential pool.
    ///
    /// # Errors
    /// `InvalidConfig` for zero threads, `Pool` if rayon cannot spawn its workers.
    pub fn new(threads: usize) -> NetResult<Self> {
        if threads == 0 {
            return Err(NetError::InvalidConfig(
                "worker pool needs at least one thread".to_string(),
            ));
        }
        if threads == 1 {
            return Ok(Self::sequential());
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("nodenet-worker-{i}"))
            .build()?;
        debug!("worker pool started with {threads} threads");

        Ok(Self {
            pool: Some(pool),
            threads,
        })
    }

    /// Build a pool with one worker per available processor.
    pub fn available() -> NetResult<Self> {
        let threads = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        Self::new(threads)
    }

    /// A pool that runs every chunk on the calling thread, in index order.
    pub fn sequential() -> Self {
        Self {
            pool: None,
            threads: 1,
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn is_parallel(&self) -> bool {
        self.pool.is_some()
    }

    /// Number of indices per chunk when partitioning `n` indices.
    pub fn chunk_len(&self, n: usize) -> usize {
        n.div_ceil(self.threads).max(1)
    }

    /// The contiguous chunks `[0, n)` is split into.
    pub fn ranges(&self, n: usize) -> Vec<Range<usize>> {
        let chunk = self.chunk_len(n);
        (0..n)
            .step_by(chunk)
            .map(|start| start..(start + chunk).min(n))
            .collect()
    }

    /// Run `f` once per chunk of `[0, n)` and return the results in chunk order.
    pub fn map_ranges<R, F>(&self, n: usize, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(Range<usize>) -> R + Sync,
    {
        let ranges = self.ranges(n);
        match &self.pool {
            Some(pool) => pool.install(|| ranges.into_par_iter().map(&f).collect()),
            None => ranges.into_iter().map(f).collect(),
        }
    }

    /// Run `f` for every index of `[0, n)`, partitioned by chunk, results in index order.
    pub fn map_indices<R, F>(&self, n: usize, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(usize) -> R + Sync,
    {
        self.map_ranges(n, |range| range.map(&f).collect::<Vec<R>>())
            .into_iter()
            .flatten()
            .collect()
    }

    /// Give each chunk exclusive access to its rows of `data`.
    ///
    /// `data` holds `data.len() / item_len` rows of `item_len` values; `f` receives the
    /// row range it owns and the matching sub-slice.
    ///
    /// # Panics
    /// If `item_len` is zero or does not divide `data.len()`.
    pub fn for_each_chunk_mut<T, F>(&self, data: &mut [T], item_len: usize, f: F)
    where
        T: Send,
        F: Fn(Range<usize>, &mut [T]) + Sync,
    {
        assert!(item_len > 0, "row length must be positive");
        assert_eq!(data.len() % item_len, 0, "data is not a whole number of rows");

        let rows = data.len() / item_len;
        if rows == 0 {
            return;
        }
        let chunk = self.chunk_len(rows);
        let run = |(k, slice): (usize, &mut [T])| {
            let start = k * chunk;
            f(start..start + slice.len() / item_len, slice);
        };

        match &self.pool {
            Some(pool) => pool.install(|| {
                data.par_chunks_mut(chunk * item_len)
                    .enumerate()
                    .for_each(run)
            }),
            None => data.chunks_mut(chunk * item_len).enumerate().for_each(run),
        }
    }

    /// Like [`for_each_chunk_mut`](Self::for_each_chunk_mut) over two row-aligned buffers.
    ///
    /// Row `r` of `a` spans `a_len` values and row `r` of `b` spans `b_len` values; each
    /// chunk owns the same rows of both.
    ///
    /// # Panics
    /// If either row length is zero or the buffers hold different row counts.
    pub fn zip_chunks_mut<A, B, F>(&self, a: &mut [A], a_len: usize, b: &mut [B], b_len: usize, f: F)
    where
        A: Send,
        B: Send,
        F: Fn(Range<usize>, &mut [A], &mut [B]) + Sync,
    {
        assert!(a_len > 0 && b_len > 0, "row length must be positive");
        assert_eq!(a.len() % a_len, 0, "first buffer is not a whole number of rows");
        assert_eq!(b.len() % b_len, 0, "second buffer is not a whole number of rows");

        let rows = a.len() / a_len;
        assert_eq!(rows, b.len() / b_len, "buffers hold different row counts");
        if rows == 0 {
            return;
        }
        let chunk = self.chunk_len(rows);
        let run = |(k, (ca, cb)): (usize, (&mut [A], &mut [B]))| {
            let start = k * chunk;
            f(start..start + ca.len() / a_len, ca, cb);
        };

        match &self.pool {
            Some(pool) => pool.install(|| {
                a.par_chunks_mut(chunk * a_len)
                    .zip(b.par_chunks_mut(chunk * b_len))
                    .enumerate()
                    .for_each(run)
            }),
            None => a
                .chunks_mut(chunk * a_len)
                .zip(b.chunks_mut(chunk * b_len))
                .enumerate()
                .for_each(run),
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::sequential()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_threads_rejected() {
        assert!(WorkerPool::new(0).is_err());
    }

    #[test]
    fn test_single_thread_is_sequential() {
        let pool = WorkerPool::new(1).unwrap();
        assert!(!pool.is_parallel());
        assert_eq!(pool.threads(), 1);
    }

    #[test]
    fn test_ranges_cover_index_space() {
        let pool = WorkerPool::new(4).unwrap();
        let ranges = pool.ranges(10);

        // ceil(10 / 4) = 3
        assert_eq!(ranges, vec![0..3, 3..6, 6..9, 9..10]);
        assert!(pool.ranges(0).is_empty());
    }

    #[test]
    fn test_fewer_indices_than_threads() {
        let pool = WorkerPool::new(8).unwrap();
        assert_eq!(pool.ranges(3), vec![0..1, 1..2, 2..3]);
    }

    #[test]
    fn test_map_indices_keeps_order() {
        let pool = WorkerPool::new(3).unwrap();
        let squares = pool.map_indices(11, |i| i * i);
        let expected: Vec<usize> = (0..11).map(|i| i * i).collect();
        assert_eq!(squares, expected);
    }

    #[test]
    fn test_map_ranges_sums_match() {
        let pool = WorkerPool::new(4).unwrap();
        let partial = pool.map_ranges(100, |r| r.sum::<usize>());
        assert_eq!(partial.iter().sum::<usize>(), 4950);
    }

    #[test]
    fn test_chunk_mut_parallel_matches_sequential() {
        let update = |rows: Range<usize>, chunk: &mut [f64]| {
            for (local, row) in chunk.chunks_mut(5).enumerate() {
                let r = (rows.start + local) as f64;
                for (c, v) in row.iter_mut().enumerate() {
                    *v = (*v + r * 0.37 - c as f64).sin();
                }
            }
        };

        let mut parallel: Vec<f64> = (0..85).map(|v| v as f64 * 0.1).collect();
        let mut sequential = parallel.clone();

        WorkerPool::new(4)
            .unwrap()
            .for_each_chunk_mut(&mut parallel, 5, update);
        WorkerPool::sequential().for_each_chunk_mut(&mut sequential, 5, update);

        assert_eq!(parallel, sequential);
    }

    #[test]
    fn test_zip_chunks_rows_aligned() {
        let pool = WorkerPool::new(3).unwrap();
        let mut matrix = vec![1.0f64; 7 * 2];
        let mut sums = vec![0.0f64; 7];

        pool.zip_chunks_mut(&mut matrix, 2, &mut sums, 1, |rows, m, s| {
            for (local, row) in m.chunks_mut(2).enumerate() {
                let r = (rows.start + local) as f64;
                row[1] = r;
                s[local] = row[0] + row[1];
            }
        });

        let expected: Vec<f64> = (0..7).map(|r| 1.0 + r as f64).collect();
        assert_eq!(sums, expected);
    }

    #[test]
    #[should_panic(expected = "different row counts")]
    fn test_zip_chunks_row_count_mismatch() {
        let mut a = vec![0.0f64; 6];
        let mut b = vec![0.0f64; 4];
        WorkerPool::sequential().zip_chunks_mut(&mut a, 2, &mut b, 1, |_, _, _| {});
    }
}

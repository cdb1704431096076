use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;

use rayon::{ThreadPool, ThreadPoolBuilder};
use thiserror::Error;

use crate::model::{LocalMode, Posterior};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Could not start thread pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Posterior evaluation failed in worker {worker}")]
    PosteriorFailure {
        worker: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Worker {0} did not report a result")]
    MissingResult(usize),
}

/// Split `0..n` into `workers` contiguous ranges, the last one absorbs the
/// remainder.
pub fn partition(n: usize, workers: usize) -> Vec<Range<usize>> {
    let workers = workers.max(1);
    let size = n / workers;
    (0..workers)
        .map(|worker| {
            let start = worker * size;
            let end = if worker + 1 == workers { n } else { start + size };
            start..end
        })
        .collect()
}

/// Evaluates the posterior in parallel.
///
/// Every worker owns a clone of the posterior, so no synchronization happens
/// inside the posterior itself.
pub struct WorkerPool<P: Posterior> {
    pool: ThreadPool,
    posteriors: Vec<P>,
}

impl<P: Posterior> WorkerPool<P> {
    /// Start `num_workers` workers, 0 means one per available core.
    pub fn new(posterior: &P, num_workers: usize) -> Result<Self, WorkerError> {
        let num_workers = if num_workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            num_workers
        };
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_workers)
            .thread_name(|i| format!("pmc-worker-{}", i))
            .build()?;
        Ok(Self {
            pool,
            posteriors: (0..num_workers).map(|_| posterior.clone()).collect(),
        })
    }

    pub fn num_workers(&self) -> usize {
        self.posteriors.len()
    }

    pub fn posterior(&self) -> &P {
        &self.posteriors[0]
    }

    /// Log posterior at every point, in order.
    pub fn evaluate(&mut self, points: &[&[f64]]) -> Result<Vec<f64>, WorkerError> {
        self.run(points.len(), |posterior, idx| {
            posterior.log_posterior(points[idx])
        })
    }

    /// Local optimization from every start point, in order.
    pub fn find_modes(&mut self, starts: &[Vec<f64>]) -> Result<Vec<Option<LocalMode>>, WorkerError> {
        self.run(starts.len(), |posterior, idx| posterior.find_mode(&starts[idx]))
    }

    fn run<T, F>(&mut self, n: usize, task: F) -> Result<Vec<T>, WorkerError>
    where
        T: Send,
        F: Fn(&mut P, usize) -> Result<T, P::Err> + Sync,
    {
        let workers = self.posteriors.len();
        let ranges = partition(n, workers);
        let (results_tx, results_rx) = channel();
        let abort = AtomicBool::new(false);
        let task = &task;
        let abort_ref = &abort;

        self.pool.scope(|scope| {
            for (worker, (posterior, range)) in
                self.posteriors.iter_mut().zip(ranges).enumerate()
            {
                let results = results_tx.clone();
                scope.spawn(move |_| {
                    let mut values = Vec::with_capacity(range.len());
                    for idx in range {
                        if abort_ref.load(Ordering::Relaxed) {
                            break;
                        }
                        match task(posterior, idx) {
                            Ok(value) => values.push(value),
                            Err(err) => {
                                abort_ref.store(true, Ordering::Relaxed);
                                // The receiver outlives the scope
                                let _ = results.send((worker, Err(err)));
                                return;
                            }
                        }
                    }
                    let _ = results.send((worker, Ok(values)));
                });
            }
        });
        drop(results_tx);

        let mut collected: Vec<Option<Result<Vec<T>, P::Err>>> = (0..workers).map(|_| None).collect();
        for (worker, result) in results_rx.iter() {
            collected[worker] = Some(result);
        }

        let mut failure = None;
        let mut out = Vec::with_capacity(n);
        for (worker, result) in collected.into_iter().enumerate() {
            match result {
                Some(Ok(values)) => out.extend(values),
                Some(Err(err)) => {
                    if failure.is_none() {
                        failure = Some(WorkerError::PosteriorFailure {
                            worker,
                            source: Box::new(err),
                        });
                    }
                }
                None => return Err(WorkerError::MissingResult(worker)),
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use thiserror::Error;

    use super::*;
    use crate::model::Parameter;

    #[derive(Error, Debug)]
    #[error("negative input")]
    struct Negative;

    #[derive(Clone)]
    struct Slow {
        parameters: Vec<Parameter>,
    }

    impl Posterior for Slow {
        type Err = Negative;

        fn parameters(&self) -> &[Parameter] {
            &self.parameters
        }

        fn log_posterior(&mut self, point: &[f64]) -> Result<f64, Negative> {
            if point[0] < 0.0 {
                return Err(Negative);
            }
            // Early indices finish last
            std::thread::sleep(Duration::from_micros(((100.0 - point[0]).max(0.0) * 20.0) as u64));
            Ok(2.0 * point[0])
        }
    }

    fn slow() -> Slow {
        Slow {
            parameters: vec![Parameter::new("x", -1e3, 1e3)],
        }
    }

    proptest! {
        #[test]
        fn partition_covers_everything(n in 0usize..500, workers in 1usize..17) {
            let ranges = partition(n, workers);
            prop_assert_eq!(ranges.len(), workers);
            let mut next = 0;
            for range in ranges.iter() {
                prop_assert_eq!(range.start, next);
                next = range.end;
            }
            prop_assert_eq!(next, n);
            let size = n / workers;
            for range in ranges[..workers - 1].iter() {
                prop_assert_eq!(range.len(), size);
            }
        }
    }

    #[test]
    fn results_are_ordered() {
        let mut pool = WorkerPool::new(&slow(), 4).unwrap();
        let points: Vec<Vec<f64>> = (0..103).map(|i| vec![i as f64]).collect();
        let refs: Vec<&[f64]> = points.iter().map(|p| p.as_slice()).collect();
        let values = pool.evaluate(&refs).unwrap();
        let expected: Vec<f64> = (0..103).map(|i| 2.0 * i as f64).collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn first_error_aborts() {
        let mut pool = WorkerPool::new(&slow(), 3).unwrap();
        let points: Vec<Vec<f64>> = (0..30)
            .map(|i| vec![if i == 25 { -1.0 } else { i as f64 }])
            .collect();
        let refs: Vec<&[f64]> = points.iter().map(|p| p.as_slice()).collect();
        let result = pool.evaluate(&refs);
        assert!(matches!(
            result,
            Err(WorkerError::PosteriorFailure { worker: 2, .. })
        ));
    }

    #[test]
    fn unsupported_mode_search() {
        let mut pool = WorkerPool::new(&slow(), 2).unwrap();
        let modes = pool.find_modes(&[vec![1.0], vec![2.0], vec![3.0]]).unwrap();
        assert_eq!(modes.len(), 3);
        assert!(modes.iter().all(|mode| mode.is_none()));
    }
}

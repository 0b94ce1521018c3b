use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use tracing::debug;

/// Fixed-size rayon pool that parallel work is installed into, so engine
/// parallelism never spills into the global pool shared with the host.
pub struct JobSystem {
    pool: ThreadPool,
}

impl JobSystem {
    pub fn new(num_threads: Option<usize>, name: &str) -> Result<Self, ThreadPoolBuildError> {
        let prefix = name.to_string();
        let mut builder =
            ThreadPoolBuilder::new().thread_name(move |index| format!("{prefix}-{index}"));
        if let Some(count) = num_threads {
            builder = builder.num_threads(count.max(1));
        }

        let pool = builder.build()?;
        debug!("Started job pool '{name}' with {} thread(s)", pool.current_num_threads());
        Ok(Self { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Runs `op` inside the pool; rayon parallel iterators used by `op`
    /// execute on this pool's threads.
    pub fn install<OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }
}

#[cfg(test)]
mod tests {
    use rayon::prelude::*;

    use super::JobSystem;

    #[test]
    fn install_runs_parallel_iterators_on_the_pool() {
        let jobs = JobSystem::new(Some(2), "test-jobs").expect("job pool");
        assert_eq!(jobs.threads(), 2);

        let names: Vec<String> = jobs.install(|| {
            (0..8)
                .into_par_iter()
                .map(|_| {
                    std::thread::current()
                        .name()
                        .unwrap_or_default()
                        .to_string()
                })
                .collect()
        });
        assert!(names.iter().all(|name| name.starts_with("test-jobs-")));
    }

    #[test]
    fn zero_threads_is_clamped_to_one() {
        let jobs = JobSystem::new(Some(0), "clamped").expect("job pool");
        assert_eq!(jobs.threads(), 1);
    }
}

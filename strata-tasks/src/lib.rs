//! A fixed pool of worker threads for data-parallel composition work.
//!
//! The pool runs one job at a time.  [`TaskPool::run`] hands the same
//! closure to every worker plus the calling thread, each with a distinct
//! slice index, and returns only when all of them have finished.  Workers
//! are created once and parked on a semaphore between jobs, so a run costs
//! two semaphore sweeps rather than thread creation.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use strata_wire::Rect;

/// A counting semaphore.  The go/done handshake between [`TaskPool::run`]
/// and the workers is expressed directly in posts and waits.
struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    fn new() -> Semaphore {
        Semaphore {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    fn post(&self) {
        let mut count = self.count.lock().expect("semaphore mutex poisoned");
        *count += 1;
        self.cond.notify_one();
    }

    fn wait(&self) {
        let mut count = self.count.lock().expect("semaphore mutex poisoned");
        while *count == 0 {
            count = self.cond.wait(count).expect("semaphore mutex poisoned");
        }
        *count -= 1;
    }
}

type Job = &'static (dyn Fn(usize) + Sync);

struct RunState {
    job: Option<Job>,
    /// Next slice index to hand out.  Index 0 belongs to the caller, so this
    /// is reset to 1 at the start of every run.
    next_index: usize,
    shutdown: bool,
}

struct Shared {
    go: Semaphore,
    done: Semaphore,
    state: Mutex<RunState>,
}

/// The worker pool.  Dropping it wakes and joins every worker.
pub struct TaskPool {
    shared: Arc<Shared>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl TaskPool {
    /// Creates a pool with `nr_workers` worker threads.  Total concurrency
    /// of a run is `nr_workers + 1` because the caller participates.
    pub fn new(nr_workers: usize) -> TaskPool {
        let shared = Arc::new(Shared {
            go: Semaphore::new(),
            done: Semaphore::new(),
            state: Mutex::new(RunState {
                job: None,
                next_index: 1,
                shutdown: false,
            }),
        });

        let workers = (0..nr_workers)
            .map(|nr| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("compose-{}", nr))
                    .spawn(move || worker_loop(&shared))
                    .expect("failed to spawn pool worker")
            })
            .collect();

        log::debug!("task pool ready with {} workers", nr_workers);
        TaskPool { shared, workers }
    }

    /// Total number of slices a run is divided into, caller included.
    pub fn concurrency(&self) -> usize {
        self.workers.len() + 1
    }

    /// Runs `job` on every worker and on the calling thread.  Each
    /// invocation receives a distinct slice index in
    /// `0..self.concurrency()`; the caller always gets index 0.  Returns
    /// once every invocation has completed.
    pub fn run(&self, job: &(dyn Fn(usize) + Sync)) {
        let nr = self.workers.len();
        {
            let mut state = self.shared.state.lock().expect("pool mutex poisoned");
            // Safe to erase the borrow's lifetime: the done sweep below keeps
            // this call on the stack until every worker has dropped its copy.
            state.job = Some(unsafe {
                std::mem::transmute::<&(dyn Fn(usize) + Sync), Job>(job)
            });
            state.next_index = 1;
        }
        for _ in 0..nr {
            self.shared.go.post();
        }

        job(0);

        for _ in 0..nr {
            self.shared.done.wait();
        }
        self.shared
            .state
            .lock()
            .expect("pool mutex poisoned")
            .job = None;
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().expect("pool mutex poisoned");
            state.shutdown = true;
            state.job = None;
        }
        for _ in 0..self.workers.len() {
            self.shared.go.post();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        log::debug!("task pool torn down");
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        shared.go.wait();
        let claimed = {
            let mut state = shared.state.lock().expect("pool mutex poisoned");
            if state.shutdown {
                return;
            }
            let index = state.next_index;
            state.next_index += 1;
            state.job.map(|job| (job, index))
        };
        if let Some((job, index)) = claimed {
            job(index);
        }
        shared.done.post();
    }
}

/// Largest band count [`split_rect`] supports.
pub const MAX_SPLIT_BANDS: usize = 8;

/// Splits `rect` into up to `nr` horizontal bands for parallel filling.
/// `nr` must be 1, 2, 4 or 8; anything else writes nothing.  The last band
/// absorbs the remainder of the height.  When the rectangle is shorter than
/// `nr` rows it is returned whole as a single band.  Returns the number of
/// bands written to `out`.
pub fn split_rect(rect: &Rect, nr: usize, out: &mut [Rect]) -> usize {
    if rect.is_empty() {
        return 0;
    }
    let shift = match nr {
        1 => 0,
        2 => 1,
        4 => 2,
        8 => 3,
        _ => return 0,
    };
    let band_h = rect.height() >> shift;
    if band_h == 0 {
        out[0] = *rect;
        return 1;
    }
    for (i, band) in out.iter_mut().enumerate().take(nr) {
        let top = rect.top + (i as i32) * band_h;
        let bottom = if i == nr - 1 {
            rect.bottom
        } else {
            top + band_h
        };
        *band = Rect::new(rect.left, top, rect.right, bottom);
    }
    nr
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn every_slice_index_runs_exactly_once() {
        let pool = TaskPool::new(3);
        assert_eq!(pool.concurrency(), 4);
        let hits: [AtomicUsize; 4] = std::array::from_fn(|_| AtomicUsize::new(0));
        pool.run(&|index| {
            hits[index].fetch_add(1, Ordering::SeqCst);
        });
        for hit in &hits {
            assert_eq!(hit.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn pool_is_reusable_across_runs() {
        let pool = TaskPool::new(2);
        let total = AtomicUsize::new(0);
        for _ in 0..50 {
            pool.run(&|_| {
                total.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(total.load(Ordering::SeqCst), 150);
    }

    #[test]
    fn zero_workers_runs_on_the_caller_alone() {
        let pool = TaskPool::new(0);
        let ran = AtomicUsize::new(0);
        pool.run(&|index| {
            assert_eq!(index, 0);
            ran.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn split_covers_the_rect_without_overlap() {
        let rect = Rect::new(0, 0, 640, 481);
        let mut bands = [Rect::new(0, 0, 0, 0); 8];
        let n = split_rect(&rect, 4, &mut bands);
        assert_eq!(n, 4);
        assert_eq!(bands[0].top, 0);
        for i in 1..n {
            assert_eq!(bands[i].top, bands[i - 1].bottom);
        }
        // Last band absorbs the odd row.
        assert_eq!(bands[n - 1].bottom, 481);
        assert_eq!(bands[n - 1].height(), 121);
    }

    #[test]
    fn split_of_short_rect_yields_one_band() {
        let rect = Rect::new(10, 10, 20, 13);
        let mut bands = [Rect::new(0, 0, 0, 0); 8];
        assert_eq!(split_rect(&rect, 8, &mut bands), 1);
        assert_eq!(bands[0], rect);
    }

    #[test]
    fn split_rejects_bad_counts_and_empty_rects() {
        let mut bands = [Rect::new(0, 0, 0, 0); 8];
        assert_eq!(split_rect(&Rect::new(0, 0, 100, 100), 3, &mut bands), 0);
        assert_eq!(split_rect(&Rect::new(0, 0, 0, 100), 4, &mut bands), 0);
    }
}

use std::sync::{Arc, Barrier, Mutex};

/// Collective operations over the group of processes taking part in a solve
///
/// Every process must call each collective the same number of times and in the same order;
/// a process that never arrives leaves the others waiting forever.
pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Concatenate every process's list, in rank order, on every process
    fn all_gather(&self, local: &[usize]) -> Vec<usize>;

    /// Sum a scalar over every process
    fn sum(&self, value: f64) -> f64;

    fn is_last(&self) -> bool {
        self.rank() + 1 == self.size()
    }
}

/// A single process
#[derive(Clone, Copy, Debug, Default)]
pub struct NoComm;

impl Communicator for NoComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_gather(&self, local: &[usize]) -> Vec<usize> {
        local.to_vec()
    }

    fn sum(&self, value: f64) -> f64 {
        value
    }
}

struct Exchange {
    barrier: Barrier,
    indices: Mutex<Vec<Vec<usize>>>,
    values: Mutex<Vec<f64>>,
}

/// One member of a group of threads standing in for SPMD processes
///
/// ```ignore
/// std::thread::scope(|s| {
///     for comm in ThreadComm::group(4) {
///         s.spawn(move || run_rank(comm));
///     }
/// });
/// ```
#[derive(Clone)]
pub struct ThreadComm {
    rank: usize,
    size: usize,
    exchange: Arc<Exchange>,
}

impl ThreadComm {
    /// Create the communicators of a group of `size` ranks
    pub fn group(size: usize) -> Vec<Self> {
        assert!(size > 0, "A process group needs at least one rank!");

        let exchange = Arc::new(Exchange {
            barrier: Barrier::new(size),
            indices: Mutex::new(vec![Vec::new(); size]),
            values: Mutex::new(vec![0.0; size]),
        });

        (0..size)
            .map(|rank| Self {
                rank,
                size,
                exchange: exchange.clone(),
            })
            .collect()
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn all_gather(&self, local: &[usize]) -> Vec<usize> {
        self.exchange
            .indices
            .lock()
            .expect("Process group poisoned; cannot gather!")[self.rank] = local.to_vec();
        self.exchange.barrier.wait();

        let gathered = self
            .exchange
            .indices
            .lock()
            .expect("Process group poisoned; cannot gather!")
            .concat();

        // nobody may overwrite a slot before everyone has read it
        self.exchange.barrier.wait();
        gathered
    }

    fn sum(&self, value: f64) -> f64 {
        self.exchange
            .values
            .lock()
            .expect("Process group poisoned; cannot reduce!")[self.rank] = value;
        self.exchange.barrier.wait();

        let total = self
            .exchange
            .values
            .lock()
            .expect("Process group poisoned; cannot reduce!")
            .iter()
            .sum();

        self.exchange.barrier.wait();
        total
    }
}

/// Owning process of every mesh node (supplied by an external partitioner)
#[derive(Clone, Debug)]
pub struct Partition {
    owners: Vec<usize>,
    n_processors: usize,
}

impl Partition {
    pub fn new(owners: Vec<usize>, n_processors: usize) -> Self {
        assert!(
            owners.iter().all(|p| *p < n_processors),
            "Partition references a processor outside the group!"
        );
        Self {
            owners,
            n_processors,
        }
    }

    /// Every node on one process
    pub fn serial(num_nodes: usize) -> Self {
        Self::new(vec![0; num_nodes], 1)
    }

    /// Contiguous blocks of node ids of (almost) equal size
    pub fn blocks(num_nodes: usize, n_processors: usize) -> Self {
        assert!(n_processors > 0, "A partition needs at least one processor!");
        let block = (num_nodes + n_processors - 1) / n_processors;
        let owners = (0..num_nodes).map(|n| n / block.max(1)).collect();
        Self::new(owners, n_processors)
    }

    pub fn owner(&self, node: usize) -> usize {
        self.owners[node]
    }

    pub fn n_processors(&self) -> usize {
        self.n_processors
    }

    pub fn num_nodes(&self) -> usize {
        self.owners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_group_collectives() {
        let results: Vec<(usize, Vec<usize>, f64)> = std::thread::scope(|s| {
            let handles: Vec<_> = ThreadComm::group(3)
                .into_iter()
                .map(|comm| {
                    s.spawn(move || {
                        let local: Vec<usize> = (0..=comm.rank()).map(|i| 10 * comm.rank() + i).collect();
                        let gathered = comm.all_gather(&local);
                        let total = comm.sum(comm.rank() as f64 + 1.0);
                        // a second round must not see stale data
                        let again = comm.all_gather(&[comm.rank()]);
                        assert_eq!(again, vec![0, 1, 2]);
                        (comm.rank(), gathered, total)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for (_, gathered, total) in results {
            assert_eq!(gathered, vec![0, 10, 11, 20, 21, 22]);
            assert!((total - 6.0).abs() < 1e-15);
        }
    }

    #[test]
    fn block_partition() {
        let p = Partition::blocks(10, 3);
        assert_eq!(p.owner(0), 0);
        assert_eq!(p.owner(3), 0);
        assert_eq!(p.owner(4), 1);
        assert_eq!(p.owner(9), 2);
        assert!(NoComm.is_last());
    }
}

use crate::types::{Batch, ScrapeTask, Target};

/// Split targets into contiguous batches of at most `batch_size`, in order.
///
/// Batch ids are 1-based. Every target lands in exactly one batch; only the last
/// batch may be short. A zero `batch_size` is treated as 1.
pub fn split(targets: Vec<Target>, batch_size: usize) -> Vec<Batch> {
    let batch_size = batch_size.max(1);
    let mut batches: Vec<Batch> = Vec::with_capacity(targets.len().div_ceil(batch_size));
    let mut tasks: Vec<ScrapeTask> = Vec::with_capacity(batch_size);

    for target in targets {
        let batch_id = batches.len() + 1;
        tasks.push(ScrapeTask {
            target,
            batch_id,
            attempts: 0,
        });
        if tasks.len() == batch_size {
            batches.push(Batch {
                id: batch_id,
                tasks: std::mem::take(&mut tasks),
            });
        }
    }

    if !tasks.is_empty() {
        batches.push(Batch {
            id: batches.len() + 1,
            tasks,
        });
    }

    batches
}

pub mod local_controller;
pub mod server;
pub mod worker;

use std::sync::Arc;
use std::thread::{sleep, JoinHandle};
use std::time::Duration;

use derive_builder::Builder;
use nohash_hasher::IntMap;
use tracing::info;

use crate::simulation::config::Config;
use crate::simulation::controller::worker::Worker;
use crate::simulation::error::SetupError;
use crate::simulation::logging;
use crate::simulation::messaging::communication::SimCommunicator;
use crate::simulation::network::road_network::RoadNetwork;

/// Everything a worker thread needs. The simulation itself is only built on the thread, once
/// the setup record arrives from the server.
#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct WorkerArguments<C: SimCommunicator> {
    rank: u32,
    communicator: C,
    network: Arc<RoadNetwork>,
    // Only used for the logging setup of the thread.
    config: Arc<Config>,
}

fn execute_worker<C: SimCommunicator>(args: WorkerArguments<C>) -> Result<(), SetupError> {
    let _guards = logging::init_logging(&args.config, args.rank);
    info!("Worker #{} started", args.rank);
    Worker::new(args.rank, args.communicator, args.network).run()
}

/// Have this more complicated join logic, so that threads in the back of the handle map can also
/// end the wait with their error. A panic of a thread is passed on to the caller.
fn try_join<T>(
    mut handles: IntMap<u32, JoinHandle<Result<T, SetupError>>>,
) -> Result<IntMap<u32, T>, SetupError> {
    let mut results = IntMap::default();
    while !handles.is_empty() {
        let finished: Vec<u32> = handles
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(rank, _)| *rank)
            .collect();
        if finished.is_empty() {
            sleep(Duration::from_millis(20));
            continue;
        }
        for rank in finished {
            let Some(handle) = handles.remove(&rank) else {
                continue;
            };
            match handle.join() {
                Ok(result) => {
                    results.insert(rank, result?);
                }
                Err(payload) => std::panic::resume_unwind(payload),
            }
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use std::thread;

    use nohash_hasher::IntMap;

    use crate::simulation::controller::try_join;
    use crate::simulation::error::SetupError;

    #[test]
    fn joins_all_threads() {
        let handles: IntMap<u32, _> = (0..3)
            .map(|rank| (rank, thread::spawn(move || Ok::<u32, SetupError>(rank * 2))))
            .collect();
        let results = try_join(handles).unwrap();
        assert_eq!(3, results.len());
        assert_eq!(4, results[&2]);
    }

    #[test]
    fn returns_error_of_any_thread() {
        let mut handles: IntMap<u32, _> = IntMap::default();
        handles.insert(0, thread::spawn(|| Ok::<(), SetupError>(())));
        handles.insert(1, thread::spawn(|| Err(SetupError::NoWorkers)));
        assert!(matches!(try_join(handles), Err(SetupError::NoWorkers)));
    }
}

use std::collections::{BTreeMap, VecDeque};
use std::thread::sleep;
use std::time::Duration;

use nohash_hasher::IntSet;
use tracing::{debug, info, instrument, warn};

use crate::simulation::config::SyncMode;
use crate::simulation::error::SetupError;
use crate::simulation::messaging::communication::{Address, SimCommunicator};
use crate::simulation::messaging::messages::{ControlCommand, Message, SetupRecord, StepTrigger};
use crate::simulation::report::{ReportSink, RunSummary, StepReport, TrafficReport};
use crate::simulation::traffic::VehicleCounts;

/// Protocol state of one worker as seen by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    New,
    Ready,
    SharingStarted,
    Shared,
    Simulating,
    FinishedOneStep,
}

/// How the run continues after handling messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    /// The run is over, the workers still have to be stopped.
    StopWorkers,
    /// The run is over and all workers answered with `Finished`.
    WorkersStopped,
    Kill,
}

/// Drives one run. In synchronous mode it is the barrier of every step and decides whether
/// random vehicles may be created. In partially synchronous mode it only starts the workers,
/// forwards control commands and publishes the reports in step order.
pub struct Server<C: SimCommunicator> {
    comm: C,
    setups: Vec<SetupRecord>,
    sink: Box<dyn ReportSink>,
    states: Vec<WorkerState>,
    run: u64,
    sync: SyncMode,
    max_num_steps: u64,
    targets: VehicleCounts,
    step_pause: Duration,
    pending: VecDeque<ControlCommand>,
    counts: VehicleCounts,
    summary: RunSummary,
}

impl<C: SimCommunicator> Server<C> {
    pub fn new(
        comm: C,
        mut setups: Vec<SetupRecord>,
        sink: Box<dyn ReportSink>,
    ) -> Result<Self, SetupError> {
        setups.sort_by_key(|s| s.worker);
        let first = setups.first().ok_or(SetupError::NoWorkers)?;
        if let Some(setup) = setups.iter().enumerate().find(|(i, s)| s.worker != *i as u32) {
            return Err(SetupError::UnknownWorker(setup.1.worker));
        }
        let config = &first.config;
        let run = first.run;
        let targets = VehicleCounts {
            private: config.vehicles.num_private,
            trams: config.vehicles.num_trams,
            buses: config.vehicles.num_buses,
        };
        Ok(Server {
            sync: config.simulation.sync,
            max_num_steps: config.simulation.max_num_steps,
            step_pause: Duration::from_millis(config.simulation.step_pause_millis),
            states: vec![WorkerState::New; setups.len()],
            comm,
            setups,
            sink,
            run,
            targets,
            pending: VecDeque::new(),
            counts: VehicleCounts::default(),
            summary: RunSummary {
                run,
                ..RunSummary::default()
            },
        })
    }

    /// Sets up all workers, simulates the run and shuts the workers down. Returns the summary of
    /// the last published step.
    pub fn run(mut self) -> Result<RunSummary, SetupError> {
        info!(
            "Server: starting run {} with {} workers in {:?} mode",
            self.run,
            self.states.len(),
            self.sync
        );
        let mut flow = self.setup()?;
        if flow == Flow::Continue {
            flow = match self.sync {
                SyncMode::Bsp => self.run_bsp()?,
                SyncMode::Psp => self.run_psp()?,
            };
        }
        if flow == Flow::StopWorkers {
            self.stop_workers()?;
        }
        self.kill_workers();
        info!("Server: run {} ended with {:?}", self.run, self.summary);
        Ok(self.summary)
    }

    fn setup(&mut self) -> Result<Flow, SetupError> {
        for setup in &self.setups {
            self.comm.send(
                Address::Worker(setup.worker),
                &Message::Setup(Box::new(setup.clone())),
            )?;
        }
        let ready = self.wait_for_all("ready", |m| matches!(m, Message::Ready { .. }))?;
        Ok(if ready.is_some() {
            Flow::Continue
        } else {
            Flow::Kill
        })
    }

    fn run_bsp(&mut self) -> Result<Flow, SetupError> {
        for step in 0..self.max_num_steps {
            let flow = self.bsp_step(step)?;
            if flow != Flow::Continue {
                return Ok(flow);
            }
            if !self.step_pause.is_zero() {
                sleep(self.step_pause);
            }
            let flow = self.handle_controls()?;
            if flow != Flow::Continue {
                return Ok(flow);
            }
        }
        Ok(Flow::StopWorkers)
    }

    #[instrument(level = "trace", skip(self), fields(run = self.run))]
    fn bsp_step(&mut self, step: u64) -> Result<Flow, SetupError> {
        self.set_states(WorkerState::SharingStarted);
        self.broadcast(&Message::ShareTraffic {
            run: self.run,
            step,
        })?;
        let shared = self.wait_for_all("shared", |m| {
            matches!(m, Message::Shared { step: s, .. } if *s == step)
        })?;
        if shared.is_none() {
            return Ok(Flow::Kill);
        }

        let trigger = self.trigger(step);
        self.set_states(WorkerState::Simulating);
        self.broadcast(&Message::SimulateOneStep(trigger))?;
        let Some(messages) =
            self.wait_for_all("reports", |m| matches!(m, Message::Report(r) if r.step == step))?
        else {
            return Ok(Flow::Kill);
        };
        let reports = messages
            .into_iter()
            .filter_map(|m| match m {
                Message::Report(report) => Some(*report),
                _ => None,
            })
            .collect();
        self.publish(StepReport::new(self.run, step, reports));
        Ok(Flow::Continue)
    }

    fn run_psp(&mut self) -> Result<Flow, SetupError> {
        let num_workers = self.states.len();
        self.set_states(WorkerState::Simulating);
        self.broadcast(&Message::SimulateOneStep(StepTrigger::allow_all(self.run, 0)))?;

        let mut reports: BTreeMap<u64, Vec<TrafficReport>> = BTreeMap::new();
        let mut next_step = 0;
        let mut finished: IntSet<u32> = IntSet::default();
        while finished.len() < num_workers {
            match self.comm.receive()? {
                Message::Report(report) => {
                    reports.entry(report.step).or_default().push(*report);
                    while reports
                        .get(&next_step)
                        .is_some_and(|r| r.len() == num_workers)
                    {
                        let complete = reports.remove(&next_step).unwrap_or_default();
                        self.publish(StepReport::new(self.run, next_step, complete));
                        next_step += 1;
                    }
                }
                Message::Finished { worker, step } => {
                    info!("Server: worker #{worker} finished after step {step}");
                    if let Some(state) = self.states.get_mut(worker as usize) {
                        *state = WorkerState::Ready;
                    }
                    finished.insert(worker);
                }
                Message::Control(command) => {
                    if let ControlCommand::SetStepPause { millis } = command {
                        self.step_pause = Duration::from_millis(millis);
                    }
                    self.broadcast(&Message::Control(command))?;
                }
                Message::Kill => return Ok(Flow::Kill),
                other => warn!("Server: unexpected message during free run: {other:?}"),
            }
        }
        if !reports.is_empty() {
            debug!(
                "Server: dropping incomplete reports of steps {:?}",
                reports.keys().collect::<Vec<_>>()
            );
        }
        Ok(Flow::WorkersStopped)
    }

    fn stop_workers(&mut self) -> Result<(), SetupError> {
        self.broadcast(&Message::Stop)?;
        self.wait_for_all("finished", |m| matches!(m, Message::Finished { .. }))?;
        Ok(())
    }

    /// Random vehicles of a category may be created while the active ones of the latest step
    /// are below the global target.
    fn trigger(&self, step: u64) -> StepTrigger {
        StepTrigger {
            run: self.run,
            step,
            allow_private: self.counts.private < self.targets.private,
            allow_trams: self.counts.trams < self.targets.trams,
            allow_buses: self.counts.buses < self.targets.buses,
        }
    }

    fn publish(&mut self, report: StepReport) {
        self.summary = report.summary();
        self.summary.check();
        self.counts = report.counts();
        self.sink.publish(&report);
    }

    /// Handles the commands which arrived during the step and the ones which are waiting in the
    /// inbox.
    fn handle_controls(&mut self) -> Result<Flow, SetupError> {
        while let Some(message) = self.comm.receive_timeout(Duration::ZERO)? {
            match message {
                Message::Control(command) => self.pending.push_back(command),
                Message::Kill => return Ok(Flow::Kill),
                other => warn!("Server: unexpected message between steps: {other:?}"),
            }
        }
        while let Some(command) = self.pending.pop_front() {
            let flow = self.handle_command(command)?;
            if flow != Flow::Continue {
                return Ok(flow);
            }
        }
        Ok(Flow::Continue)
    }

    fn handle_command(&mut self, command: ControlCommand) -> Result<Flow, SetupError> {
        debug!("Server: handling {command:?}");
        match command {
            ControlCommand::SetStepPause { millis } => {
                self.step_pause = Duration::from_millis(millis);
                Ok(Flow::Continue)
            }
            ControlCommand::BlockLane { .. } | ControlCommand::SetTrafficLight { .. } => {
                self.broadcast(&Message::Control(command))?;
                Ok(Flow::Continue)
            }
            ControlCommand::Pause => self.wait_for_resume(),
            ControlCommand::Resume => Ok(Flow::Continue),
            ControlCommand::Stop => Ok(Flow::StopWorkers),
        }
    }

    fn wait_for_resume(&mut self) -> Result<Flow, SetupError> {
        info!("Server: paused");
        loop {
            match self.comm.receive()? {
                Message::Control(ControlCommand::Resume) => {
                    info!("Server: resumed");
                    return Ok(Flow::Continue);
                }
                Message::Control(ControlCommand::Pause) => {}
                Message::Control(command) => {
                    let flow = self.handle_command(command)?;
                    if flow != Flow::Continue {
                        return Ok(flow);
                    }
                }
                Message::Kill => return Ok(Flow::Kill),
                other => warn!("Server: unexpected message while paused: {other:?}"),
            }
        }
    }

    /// Receives until every worker sent a message accepted by `accept`. Control commands are
    /// kept for the next step boundary. Returns `None` if the server is killed while waiting.
    fn wait_for_all(
        &mut self,
        phase: &str,
        accept: impl Fn(&Message) -> bool,
    ) -> Result<Option<Vec<Message>>, SetupError> {
        let num_workers = self.states.len();
        let mut received: Vec<Option<Message>> = vec![None; num_workers];
        let mut missing = num_workers;
        while missing > 0 {
            let message = self.comm.receive()?;
            let sender = received_state(&message).filter(|(w, _)| (*w as usize) < num_workers);
            match sender {
                Some((worker, state)) if accept(&message) => {
                    let slot = &mut received[worker as usize];
                    if slot.is_none() {
                        missing -= 1;
                    }
                    self.states[worker as usize] = state;
                    *slot = Some(message);
                }
                _ => match message {
                    Message::Control(command) => self.pending.push_back(command),
                    Message::Kill => return Ok(None),
                    other => warn!("Server: unexpected message while waiting for {phase}: {other:?}"),
                },
            }
        }
        Ok(Some(received.into_iter().flatten().collect()))
    }

    fn set_states(&mut self, state: WorkerState) {
        self.states.fill(state);
    }

    /// Workers may already be gone when the environment is killed during a free run.
    fn kill_workers(&self) {
        for worker in 0..self.states.len() as u32 {
            if self.comm.send(Address::Worker(worker), &Message::Kill).is_err() {
                debug!("Server: worker #{worker} is already gone");
            }
        }
    }

    fn broadcast(&self, message: &Message) -> Result<(), SetupError> {
        for worker in 0..self.states.len() as u32 {
            self.comm.send(Address::Worker(worker), message)?;
        }
        Ok(())
    }
}

/// The worker a message comes from and its state after sending it.
fn received_state(message: &Message) -> Option<(u32, WorkerState)> {
    match message {
        Message::Ready { worker } | Message::Finished { worker, .. } => {
            Some((*worker, WorkerState::Ready))
        }
        Message::Shared { worker, .. } => Some((*worker, WorkerState::Shared)),
        Message::Report(report) => Some((report.worker, WorkerState::FinishedOneStep)),
        _ => None,
    }
}

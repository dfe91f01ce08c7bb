use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::simulation::config::SyncMode;
use crate::simulation::error::{CommunicationError, SetupError};
use crate::simulation::messaging::communication::{Address, SimCommunicator};
use crate::simulation::messaging::message_broker::BorderTrafficBroker;
use crate::simulation::messaging::messages::{
    BorderTraffic, ControlCommand, Message, SetupRecord, StepTrigger,
};
use crate::simulation::network::road_network::RoadNetwork;
use crate::simulation::simulation::Simulation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stopped,
    Kill,
}

/// Message loop of one worker. It builds its simulation when the setup record arrives and then
/// follows the server in synchronous mode, or runs on its own and only waits for its fellows in
/// partially synchronous mode.
pub struct Worker<C: SimCommunicator> {
    rank: u32,
    comm: C,
    network: Arc<RoadNetwork>,
    simulation: Option<Simulation>,
    broker: BorderTrafficBroker,
    // server messages which arrived while waiting for fellows
    pending: VecDeque<Message>,
    step_pause: Duration,
}

impl<C: SimCommunicator> Worker<C> {
    pub fn new(rank: u32, comm: C, network: Arc<RoadNetwork>) -> Self {
        Worker {
            rank,
            comm,
            network,
            simulation: None,
            broker: BorderTrafficBroker::new(rank, 0, Vec::new()),
            pending: VecDeque::new(),
            step_pause: Duration::ZERO,
        }
    }

    /// Handles messages until the worker is killed. A fellow or the server which went away while
    /// the worker was still busy means the environment is shutting down.
    pub fn run(mut self) -> Result<(), SetupError> {
        loop {
            let flow = self.next_message().and_then(|message| self.handle(message));
            match flow {
                Ok(Flow::Kill) => {
                    info!("Worker #{}: killed", self.rank);
                    return Ok(());
                }
                Ok(_) => {}
                Err(SetupError::Communication(CommunicationError::Disconnected(address))) => {
                    info!("Worker #{}: {address:?} disconnected, shutting down", self.rank);
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn handle(&mut self, message: Message) -> Result<Flow, SetupError> {
        match message {
            Message::Setup(setup) => self.setup(*setup)?,
            Message::ShareTraffic { run, step } => self.share(run, step)?,
            Message::SimulateOneStep(trigger) => match self.sync_mode() {
                Some(SyncMode::Bsp) => self.simulate(&trigger)?,
                Some(SyncMode::Psp) => return self.free_run(trigger.run),
                None => warn!("Worker #{}: step trigger before setup", self.rank),
            },
            Message::Control(command) => return self.control(command),
            Message::Stop => {
                self.stop()?;
                return Ok(Flow::Stopped);
            }
            Message::Kill => return Ok(Flow::Kill),
            Message::BorderTraffic(record) => {
                self.broker.add(*record);
            }
            other => warn!("Worker #{}: unexpected message {other:?}", self.rank),
        }
        Ok(Flow::Continue)
    }

    fn next_message(&mut self) -> Result<Message, SetupError> {
        match self.pending.pop_front() {
            Some(message) => Ok(message),
            None => Ok(self.comm.receive()?),
        }
    }

    fn sync_mode(&self) -> Option<SyncMode> {
        self.simulation
            .as_ref()
            .map(|s| s.config().simulation.sync)
    }

    fn setup(&mut self, setup: SetupRecord) -> Result<(), SetupError> {
        let run = setup.run;
        let simulation = Simulation::new(self.network.clone(), setup)?;
        self.broker = BorderTrafficBroker::new(self.rank, run, simulation.fellow_ranks());
        self.step_pause = Duration::from_millis(simulation.config().simulation.step_pause_millis);
        self.simulation = Some(simulation);
        self.comm
            .send(Address::Server, &Message::Ready { worker: self.rank })?;
        Ok(())
    }

    /// Sends the border traffic for `step` to all fellows and waits for theirs.
    #[instrument(level = "trace", skip(self), fields(rank = self.rank))]
    fn share(&mut self, run: u64, step: u64) -> Result<(), SetupError> {
        if self.simulation.as_ref().map(Simulation::run) != Some(run) {
            warn!("Worker #{}: ignoring share request of run {run}", self.rank);
            return Ok(());
        }
        self.send_border_traffic(step)?;
        while !self.fellows_shared(step) {
            match self.comm.receive()? {
                Message::BorderTraffic(record) => {
                    self.broker.add(*record);
                }
                other => self.pending.push_back(other),
            }
        }
        self.comm.send(
            Address::Server,
            &Message::Shared {
                worker: self.rank,
                step,
            },
        )?;
        Ok(())
    }

    /// Whether traffic for `step` was sent to and received from every fellow.
    fn fellows_shared(&mut self, step: u64) -> bool {
        let senders = self.broker.received_from(step);
        self.simulation
            .as_mut()
            .map_or(true, |simulation| simulation.mark_shared_with(&senders))
    }

    fn send_border_traffic(&mut self, step: u64) -> Result<(), SetupError> {
        let Some(simulation) = self.simulation.as_mut() else {
            return Ok(());
        };
        for record in simulation.take_border_traffic(step) {
            self.comm.send(
                Address::Worker(record.receiver),
                &Message::BorderTraffic(Box::new(record)),
            )?;
        }
        Ok(())
    }

    #[instrument(level = "trace", skip(self, trigger), fields(rank = self.rank, step = trigger.step))]
    fn simulate(&mut self, trigger: &StepTrigger) -> Result<(), SetupError> {
        let records = self.broker.take_step(trigger.step).unwrap_or_else(|| {
            warn!(
                "Worker #{}: simulating step {} without the traffic of all fellows",
                self.rank, trigger.step
            );
            Vec::new()
        });
        let Some(simulation) = self.simulation.as_mut() else {
            return Ok(());
        };
        let report = simulation.run_step(trigger, records);
        self.comm
            .send(Address::Server, &Message::Report(Box::new(report)))?;
        Ok(())
    }

    /// Steps on its own until the last step is reached or the run is stopped. Every step waits
    /// only for the records of the connected fellows.
    fn free_run(&mut self, run: u64) -> Result<Flow, SetupError> {
        info!("Worker #{}: free run of run {run}", self.rank);
        loop {
            let Some(simulation) = self.simulation.as_ref() else {
                return Ok(Flow::Continue);
            };
            let step = simulation.step();
            if step >= simulation.config().simulation.max_num_steps {
                self.stop()?;
                return Ok(Flow::Stopped);
            }

            self.send_border_traffic(step)?;
            let records = match self.await_border_traffic(step)? {
                ControlFlow::Continue(records) => records,
                ControlFlow::Break(flow) => return Ok(flow),
            };
            if let Some(simulation) = self.simulation.as_mut() {
                let report = simulation.run_step(&StepTrigger::allow_all(run, step), records);
                self.comm
                    .send(Address::Server, &Message::Report(Box::new(report)))?;
            }

            if !self.step_pause.is_zero() {
                sleep(self.step_pause);
            }
            while let Some(message) = self.comm.receive_timeout(Duration::ZERO)? {
                let flow = self.handle_during_free_run(message)?;
                if flow != Flow::Continue {
                    return Ok(flow);
                }
            }
        }
    }

    fn await_border_traffic(
        &mut self,
        step: u64,
    ) -> Result<ControlFlow<Flow, Vec<BorderTraffic>>, SetupError> {
        loop {
            if self.fellows_shared(step) {
                if let Some(records) = self.broker.take_step(step) {
                    return Ok(ControlFlow::Continue(records));
                }
            }
            debug!(
                "Worker #{}: waiting for fellows in step {step}, have {:?}",
                self.rank,
                self.broker.received_from(step)
            );
            let message = self.comm.receive()?;
            let flow = self.handle_during_free_run(message)?;
            if flow != Flow::Continue {
                return Ok(ControlFlow::Break(flow));
            }
        }
    }

    fn handle_during_free_run(&mut self, message: Message) -> Result<Flow, SetupError> {
        match message {
            Message::BorderTraffic(record) => {
                self.broker.add(*record);
                Ok(Flow::Continue)
            }
            Message::Control(command) => self.control(command),
            Message::Stop => {
                self.stop()?;
                Ok(Flow::Stopped)
            }
            Message::Kill => Ok(Flow::Kill),
            other => {
                warn!("Worker #{}: unexpected message during free run {other:?}", self.rank);
                Ok(Flow::Continue)
            }
        }
    }

    fn control(&mut self, command: ControlCommand) -> Result<Flow, SetupError> {
        match command {
            ControlCommand::SetStepPause { millis } => {
                self.step_pause = Duration::from_millis(millis);
            }
            ControlCommand::Pause => return self.wait_for_resume(),
            ControlCommand::Resume => {}
            ControlCommand::Stop => {
                self.stop()?;
                return Ok(Flow::Stopped);
            }
            ControlCommand::BlockLane { .. } | ControlCommand::SetTrafficLight { .. } => {
                if let Some(simulation) = self.simulation.as_mut() {
                    simulation.apply_control(&command);
                }
            }
        }
        Ok(Flow::Continue)
    }

    /// Blocks until resumed. Records of fellows keep being cached meanwhile.
    fn wait_for_resume(&mut self) -> Result<Flow, SetupError> {
        info!("Worker #{}: paused", self.rank);
        loop {
            match self.comm.receive()? {
                Message::Control(ControlCommand::Resume) => {
                    info!("Worker #{}: resumed", self.rank);
                    return Ok(Flow::Continue);
                }
                Message::Control(ControlCommand::Pause) => {}
                message => {
                    let flow = self.handle_during_free_run(message)?;
                    if flow != Flow::Continue {
                        return Ok(flow);
                    }
                }
            }
        }
    }

    /// Resets the simulation for a new run and tells the server.
    fn stop(&mut self) -> Result<(), SetupError> {
        let Some(simulation) = self.simulation.as_mut() else {
            return Ok(());
        };
        let step = simulation.step();
        simulation.reset();
        self.broker.reset(simulation.run());
        self.comm.send(
            Address::Server,
            &Message::Finished {
                worker: self.rank,
                step,
            },
        )?;
        Ok(())
    }
}

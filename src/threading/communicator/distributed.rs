//! Distributed transport: isolated worker ranks exchanging serialized frames.
//!
//! Every rank owns a private replica of its task group and shares no memory
//! with the coordinator. The only link is a set of byte channels carrying
//! JSON frames:
//!
//! - scatter: coordinator to rank, the cycle input (or a stop request)
//! - ready: rank to coordinator, mandatory phase done
//! - finish: coordinator to rank, stop optional work
//! - gather: rank to coordinator, the cycle output

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::{check_layout, group_sizes, run_handler, Communicator, CycleControl, WorkerAssignment};
use crate::error::{Result, TwoportError};
use crate::threading::{TaskGroupData, TransferMode};

type Frame = Vec<u8>;

/// How often a blocked coordinator checks whether a rank has exited.
const RANK_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Serialize, Deserialize)]
enum Message {
    Scatter(TaskGroupData),
    Ready { rank: usize },
    Finish,
    Gather(TaskGroupData),
}

impl Message {
    fn encode(&self) -> Result<Frame> {
        serde_json::to_vec(self).map_err(|e| TwoportError::transport("encode frame", e))
    }

    fn decode(frame: &[u8]) -> Result<Self> {
        serde_json::from_slice(frame).map_err(|e| TwoportError::transport("decode frame", e))
    }
}

/// Coordinator end of one rank.
#[derive(Debug)]
struct RankLink {
    group: usize,
    worker: usize,
    scatter: Sender<Frame>,
    finish: Sender<Frame>,
    gather: Receiver<Frame>,
}

/// Rank end of the cycle state; the finish flag latches for the rest of the cycle.
struct RankControl<'a> {
    rank: usize,
    ready: &'a Sender<Frame>,
    finish: &'a Receiver<Frame>,
    finished: bool,
}

impl RankControl<'_> {
    fn accept(&mut self, frame: &[u8]) -> Result<()> {
        match Message::decode(frame)? {
            Message::Finish => {
                self.finished = true;
                Ok(())
            }
            other => Err(TwoportError::transport(
                "receive finish",
                format!("unexpected frame {:?}", other),
            )),
        }
    }

    fn wait_for_finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        let frame = self
            .finish
            .recv()
            .map_err(|e| TwoportError::transport("receive finish", e))?;
        self.accept(&frame)
    }
}

impl CycleControl for RankControl<'_> {
    fn set_ready(&mut self) -> Result<()> {
        let frame = Message::Ready { rank: self.rank }.encode()?;
        self.ready
            .send(frame)
            .map_err(|e| TwoportError::transport("send ready", e))
    }

    fn is_cycle_finished(&mut self) -> bool {
        if self.finished {
            return true;
        }
        match self.finish.try_recv() {
            Ok(frame) => {
                if let Err(e) = self.accept(&frame) {
                    warn!("Rank {}: {}", self.rank, e);
                }
                self.finished = true;
                true
            }
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Disconnected) => {
                self.finished = true;
                true
            }
        }
    }
}

/// Worker ranks with private task replicas.
///
/// Ranks are hosted on dedicated threads; nothing but the frames declared in
/// this module crosses the boundary, so every input and output is serialized.
#[derive(Debug)]
pub struct ProcessCommunicator {
    worker_count: usize,
    ranks: Vec<RankLink>,
    ready: Option<Receiver<Frame>>,
    ready_seen: usize,
    handles: Vec<JoinHandle<Result<()>>>,
    layout: Vec<usize>,
    in_cycle: bool,
    finish_sent: bool,
    started: bool,
    stopped: bool,
}

impl ProcessCommunicator {
    pub fn new(worker_count: usize) -> Self {
        Self {
            worker_count,
            ranks: Vec::new(),
            ready: None,
            ready_seen: 0,
            handles: Vec::new(),
            layout: Vec::new(),
            in_cycle: false,
            finish_sent: false,
            started: false,
            stopped: false,
        }
    }

    fn ready_channel(&self) -> Result<&Receiver<Frame>> {
        self.ready.as_ref().ok_or(TwoportError::NotInitialized { what: "worker ranks" })
    }

    fn count_ready(&mut self, frame: &[u8]) -> Result<()> {
        match Message::decode(frame)? {
            Message::Ready { rank } => {
                debug!("Rank {} ready", rank);
                self.ready_seen += 1;
                Ok(())
            }
            other => Err(TwoportError::transport(
                "receive ready",
                format!("unexpected frame {:?}", other),
            )),
        }
    }

    /// Fail if a rank left its loop while the coordinator still expects it.
    fn check_ranks_alive(&self) -> Result<()> {
        match self.handles.iter().position(JoinHandle::is_finished) {
            Some(rank) => Err(TwoportError::transport(
                "await worker rank",
                format!("rank {} exited during the cycle", rank),
            )),
            None => Ok(()),
        }
    }

    /// Release ranks that may still wait for the finish frame of an abandoned cycle.
    fn release_ranks(&self) -> Result<()> {
        let frame = Message::Finish.encode()?;
        for link in &self.ranks {
            if link.finish.send(frame.clone()).is_err() {
                debug!("Rank {}/{} already gone", link.group, link.worker);
            }
        }
        Ok(())
    }

    fn broadcast_stop(&mut self) -> Result<()> {
        let frame = Message::Scatter(TaskGroupData::stop()).encode()?;
        for link in &self.ranks {
            // A rank that already exited reports its error on join.
            if link.scatter.send(frame.clone()).is_err() {
                debug!("Rank {}/{} already gone", link.group, link.worker);
            }
        }
        Ok(())
    }
}

impl Communicator for ProcessCommunicator {
    fn worker_count(&self) -> usize {
        self.worker_count
    }

    fn transfer_mode(&self) -> TransferMode {
        TransferMode::Serialized
    }

    fn run_workers(&mut self, group_count: usize, assignments: Vec<WorkerAssignment>) -> Result<()> {
        if self.started || self.stopped {
            return Err(TwoportError::WorkersAlreadyRunning);
        }
        if assignments.len() > self.worker_count {
            return Err(TwoportError::TooManyWorkers {
                available: assignments.len(),
                maximum: self.worker_count,
            });
        }

        self.layout = group_sizes(group_count, &assignments)?;
        let (ready_tx, ready_rx) = unbounded();
        for (rank, assignment) in assignments.into_iter().enumerate() {
            let (scatter_tx, scatter_rx) = unbounded();
            let (finish_tx, finish_rx) = unbounded();
            let (gather_tx, gather_rx) = unbounded();
            self.ranks.push(RankLink {
                group: assignment.group,
                worker: assignment.worker,
                scatter: scatter_tx,
                finish: finish_tx,
                gather: gather_rx,
            });

            let endpoints = RankEndpoints {
                rank,
                scatter: scatter_rx,
                ready: ready_tx.clone(),
                finish: finish_rx,
                gather: gather_tx,
            };
            let handle = thread::Builder::new()
                .name(format!("twoport-rank-{}", rank))
                .spawn(move || rank_main(endpoints, assignment))
                .map_err(|e| TwoportError::transport("spawn worker rank", e))?;
            self.handles.push(handle);
        }

        info!("Started {} worker ranks", self.ranks.len());
        self.ready = Some(ready_rx);
        self.started = true;
        Ok(())
    }

    fn dispatch(&mut self, data: Vec<Vec<TaskGroupData>>) -> Result<()> {
        self.ready_channel()?;
        if self.stopped {
            return Err(TwoportError::misuse("dispatch after the ranks were stopped"));
        }
        check_layout(&self.layout, &data)?;
        if self.in_cycle {
            return Err(TwoportError::misuse("dispatch before the previous cycle was collected"));
        }

        let mut data: Vec<Vec<Option<TaskGroupData>>> =
            data.into_iter().map(|g| g.into_iter().map(Some).collect()).collect();
        for link in &self.ranks {
            let input = data[link.group][link.worker].take().unwrap_or_default();
            let frame = Message::Scatter(input).encode()?;
            link.scatter
                .send(frame)
                .map_err(|e| TwoportError::transport("scatter", e))?;
        }
        self.ready_seen = 0;
        self.finish_sent = false;
        self.in_cycle = true;
        Ok(())
    }

    fn is_ready(&mut self) -> Result<bool> {
        loop {
            let received = self.ready_channel()?.try_recv();
            match received {
                Ok(frame) => self.count_ready(&frame)?,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    return Err(TwoportError::transport("receive ready", "all ranks disconnected"));
                }
            }
        }
        let ready = self.ready_seen >= self.ranks.len();
        if !ready {
            self.check_ranks_alive()?;
        }
        Ok(ready)
    }

    fn finish_cycle(&mut self) -> Result<()> {
        if !self.in_cycle || self.finish_sent {
            return Ok(());
        }
        while self.ready_seen < self.ranks.len() {
            let received = self.ready_channel()?.recv_timeout(RANK_POLL_INTERVAL);
            match received {
                Ok(frame) => self.count_ready(&frame)?,
                Err(RecvTimeoutError::Timeout) => self.check_ranks_alive()?,
                Err(e @ RecvTimeoutError::Disconnected) => {
                    return Err(TwoportError::transport("receive ready", e));
                }
            }
        }
        let frame = Message::Finish.encode()?;
        for link in &self.ranks {
            link.finish
                .send(frame.clone())
                .map_err(|e| TwoportError::transport("send finish", e))?;
        }
        self.finish_sent = true;
        Ok(())
    }

    fn collect(&mut self) -> Result<Vec<Vec<TaskGroupData>>> {
        if !self.in_cycle {
            return Err(TwoportError::misuse("collect without a dispatched cycle"));
        }
        self.finish_cycle()?;

        let mut outputs: Vec<Vec<TaskGroupData>> =
            self.layout.iter().map(|&n| vec![TaskGroupData::default(); n]).collect();
        for link in &self.ranks {
            let frame = link
                .gather
                .recv()
                .map_err(|e| TwoportError::transport("gather", e))?;
            match Message::decode(&frame)? {
                Message::Gather(output) => outputs[link.group][link.worker] = output,
                other => {
                    return Err(TwoportError::transport(
                        "gather",
                        format!("unexpected frame {:?}", other),
                    ))
                }
            }
        }
        self.in_cycle = false;
        Ok(outputs)
    }

    fn request_stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        if !self.started {
            return Ok(());
        }

        if self.in_cycle {
            if let Err(e) = self.collect() {
                warn!("Discarding unfinished cycle failed: {}", e);
                self.release_ranks()?;
            }
            self.in_cycle = false;
        }
        self.broadcast_stop()?;

        let mut first_error = None;
        for handle in self.handles.drain(..) {
            let outcome = handle
                .join()
                .unwrap_or_else(|_| Err(TwoportError::transport("join worker rank", "rank panicked")));
            if let Err(e) = outcome {
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        info!("Stopped {} worker ranks", self.ranks.len());
        Ok(())
    }

    fn is_stop_requested(&self) -> bool {
        self.stopped
    }
}

impl Drop for ProcessCommunicator {
    fn drop(&mut self) {
        if let Err(e) = self.request_stop() {
            warn!("Stopping worker ranks failed: {}", e);
        }
    }
}

/// Rank end of the channels.
struct RankEndpoints {
    rank: usize,
    scatter: Receiver<Frame>,
    ready: Sender<Frame>,
    finish: Receiver<Frame>,
    gather: Sender<Frame>,
}

fn rank_main(endpoints: RankEndpoints, assignment: WorkerAssignment) -> Result<()> {
    let RankEndpoints {
        rank,
        scatter,
        ready,
        finish,
        gather,
    } = endpoints;

    loop {
        let frame = scatter
            .recv()
            .map_err(|e| TwoportError::transport("receive scatter", e))?;
        let input = match Message::decode(&frame)? {
            Message::Scatter(input) => input,
            other => {
                return Err(TwoportError::transport(
                    "receive scatter",
                    format!("unexpected frame {:?}", other),
                ))
            }
        };
        if input.stop {
            debug!("Rank {} stops", rank);
            return Ok(());
        }

        let mut control = RankControl {
            rank,
            ready: &ready,
            finish: &finish,
            finished: false,
        };
        let output = run_handler(&assignment, input, &mut control);
        control.wait_for_finish()?;

        let frame = Message::Gather(output).encode()?;
        gather
            .send(frame)
            .map_err(|e| TwoportError::transport("gather", e))?;
    }
}

//! The driver: owns every moving part and runs the todo-list.
//!
//! All control flow in the client is a task popping off the todo-list:
//! peer polls, the monitor probe, slew-restore ticks, the simulation's
//! kernel model and trace reader. Tasks are a closed enum dispatched
//! here, with mutable access to the whole context; nothing reenters, so
//! the peer -> filter -> combiner -> PLL chain needs no locks and no
//! callbacks.

use clocksteer_clock::{ClockError, UnixTimebase};
use clocksteer_proto::{
    Combiner, Generation, Params, Peak, Pll, Reject, Sleep, Slew, Timebase, Timestamp,
};
use clocksteer_udp::TimedSocket;
use tracing::debug;

use crate::peer::{self, Peer, PeerState};
use crate::peerset::{PeerId, PeerSet};
use crate::sim::SimTimebase;
use crate::simfile::SimFile;
use crate::todo::{TaskStatus, TodoHandle, TodoList};
use crate::tracer::{trace_rec, Tracer};
use crate::Error;

/// Steady-state poll timeout; the monitor probe uses a short one.
const POLL_TIMEOUT: f64 = 0.8;
const MONITOR_TIMEOUT: f64 = 0.2;
pub const MONITOR_PERIOD: f64 = 32.0;

/// Everything the scheduler can be asked to do.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskKind {
    /// Poll the next peer in rotation and reschedule at the pacing gap.
    PeerSetPoll,
    /// Poll the monitor peer (poll-server mode).
    Monitor,
    /// End a constant-rate slew window on the kernel clock.
    SlewRestore,
    /// Simulation: fold the pending adjust into the virtual frequency.
    SimKernPll,
    /// Simulation: disturb the virtual oscillator.
    SimBump { freq: f64, phase: f64 },
    /// Simulation: consume trace lines up to the next `Now` instant.
    SimReadLine,
    /// Stop the run (poll-server `-d`).
    EndRun,
}

/// The active clock, real or simulated.
pub enum ClockSource {
    Unix(UnixTimebase),
    Sim(SimTimebase),
}

impl ClockSource {
    pub fn is_sim(&self) -> bool {
        matches!(self, ClockSource::Sim(_))
    }

    pub fn sim(&self) -> Option<&SimTimebase> {
        match self {
            ClockSource::Sim(tb) => Some(tb),
            ClockSource::Unix(_) => None,
        }
    }

    pub fn sim_mut(&mut self) -> Option<&mut SimTimebase> {
        match self {
            ClockSource::Sim(tb) => Some(tb),
            ClockSource::Unix(_) => None,
        }
    }
}

impl Timebase for ClockSource {
    type Error = ClockError;

    fn now(&self) -> Timestamp {
        match self {
            ClockSource::Unix(tb) => tb.now(),
            ClockSource::Sim(tb) => tb.now(),
        }
    }

    fn sleep(&mut self, dur: f64) -> Sleep {
        match self {
            ClockSource::Unix(tb) => tb.sleep(dur),
            ClockSource::Sim(tb) => tb.sleep(dur),
        }
    }

    fn step(&mut self, offset: f64) -> Result<(), ClockError> {
        match self {
            ClockSource::Unix(tb) => tb.step(offset),
            ClockSource::Sim(tb) => tb.step(offset).map_err(|e| match e {}),
        }
    }

    fn adjust(&mut self, offset: f64, duration: f64, frequency: f64) -> Result<Slew, ClockError> {
        match self {
            ClockSource::Unix(tb) => tb.adjust(offset, duration, frequency),
            ClockSource::Sim(tb) => tb.adjust(offset, duration, frequency).map_err(|e| match e {}),
        }
    }

    fn restore_frequency(&mut self) -> Result<(), ClockError> {
        match self {
            ClockSource::Unix(tb) => tb.restore_frequency(),
            ClockSource::Sim(tb) => tb.restore_frequency().map_err(|e| match e {}),
        }
    }

    fn generation(&self) -> Generation {
        match self {
            ClockSource::Unix(tb) => tb.generation(),
            ClockSource::Sim(tb) => tb.generation(),
        }
    }

    fn bump_generation(&mut self) {
        match self {
            ClockSource::Unix(tb) => tb.bump_generation(),
            ClockSource::Sim(tb) => tb.bump_generation(),
        }
    }
}

/// What to do with an accepted poll reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollAction {
    /// Run the full filter -> combiner -> PLL chain (steering client).
    Steer,
    /// Only emit the `Poll` trace record (poll-server).
    Record,
}

pub struct Driver {
    pub todo: TodoList<TaskKind>,
    pub timebase: ClockSource,
    pub tracer: Tracer,
    pub params: Params,
    pub peers: PeerSet,
    pub combiner: Combiner,
    pub pll: Pll,
    pub socket: Option<TimedSocket>,
    pub monitor: Option<Peer>,
    pub sim_reader: Option<SimFile>,
    pub poll_action: PollAction,
    poll_task: Option<TodoHandle>,
    slew_restore: Option<TodoHandle>,
    last_frequency: f64,
}

impl Driver {
    pub fn new(timebase: ClockSource, params: Params, tracer: Tracer) -> Driver {
        Driver {
            todo: TodoList::new(),
            timebase,
            tracer,
            params,
            peers: PeerSet::new(),
            combiner: Combiner::new(),
            pll: Pll::new(),
            socket: None,
            monitor: None,
            sim_reader: None,
            poll_action: PollAction::Steer,
            poll_task: None,
            slew_restore: None,
            last_frequency: 0.0,
        }
    }

    /// Give every peer its combiner slot.
    pub fn register_sources(&mut self) {
        for np in self.peers.iter_mut() {
            np.source = Some(self.combiner.add_source());
        }
    }

    /// (Re)start the poll cycle: reset the pacing ramp and arm the first
    /// poll task, replacing any outstanding one.
    pub fn begin_polling(&mut self) {
        if let Some(handle) = self.poll_task.take() {
            self.todo.cancel(handle);
        }
        self.peers.reset_pace(self.params.poll_period);
        let now = self.timebase.now();
        self.poll_task = Some(self.todo.schedule_rel(
            now,
            0.0,
            0.0,
            TaskKind::PeerSetPoll,
            "NTP_PeerSet Poll",
        ));
    }

    /// Run tasks until the queue drains, a task stops the run, or a
    /// signal interrupts the inter-task sleep.
    pub fn run(&mut self) -> Result<TaskStatus, Error> {
        loop {
            let Some(when) = self.todo.first_when() else {
                return Ok(TaskStatus::Ok);
            };
            if self.timebase.sleep_until(&when) == Sleep::Interrupted {
                return Ok(TaskStatus::Intr);
            }

            let mut entry = self.todo.pop_first().expect("queue emptied during sleep");
            trace_rec!(self.tracer, "Now {} {}", entry.when, entry.label);

            match self.dispatch(&entry.kind)? {
                TaskStatus::Fail => return Ok(TaskStatus::Fail),
                TaskStatus::Intr => {
                    self.todo.reinsert(entry);
                    return Ok(TaskStatus::Intr);
                }
                TaskStatus::Done => {}
                TaskStatus::Ok => {
                    if entry.repeat > 0.0 {
                        entry.when.add(entry.repeat);
                        self.todo.reinsert(entry);
                    }
                }
            }
        }
    }

    fn dispatch(&mut self, kind: &TaskKind) -> Result<TaskStatus, Error> {
        match kind {
            TaskKind::PeerSetPoll => self.poll_next_peer(),

            TaskKind::Monitor => self.poll_monitor(),

            TaskKind::SlewRestore => {
                self.slew_restore = None;
                self.timebase.restore_frequency()?;
                trace_rec!(self.tracer, "KERNPLL {:.6e} 0", self.last_frequency);
                Ok(TaskStatus::Ok)
            }

            TaskKind::SimKernPll => {
                let sim = self
                    .timebase
                    .sim_mut()
                    .expect("kernel model tick on the real clock");
                let (freq, offset, duration) = sim.kern_pll_tick();
                trace_rec!(self.tracer, "SIMPLL {:.3e} {:.3e} {:.3e}", freq, offset, duration);
                Ok(TaskStatus::Ok)
            }

            TaskKind::SimBump { freq, phase } => {
                let (freq, phase) = (*freq, *phase);
                self.timebase
                    .sim_mut()
                    .expect("bump on the real clock")
                    .bump(freq, phase);
                Ok(TaskStatus::Ok)
            }

            TaskKind::SimReadLine => {
                let mut reader = self
                    .sim_reader
                    .take()
                    .expect("readline task without sim reader");
                let status = reader.read_tick(self);
                self.sim_reader = Some(reader);
                status
            }

            TaskKind::EndRun => {
                trace_rec!(self.tracer, "# Run completed");
                Ok(TaskStatus::Fail)
            }
        }
    }

    fn poll_next_peer(&mut self) -> Result<TaskStatus, Error> {
        let Some(id) = self.peers.rotate() else {
            return Ok(TaskStatus::Done);
        };

        // Schedule the next poll before doing this one, like the rest of
        // the pacing state, so a slow exchange cannot skew the cadence.
        let spacing = self.peers.next_spacing();
        let now = self.timebase.now();
        self.poll_task = Some(self.todo.schedule_rel(
            now,
            spacing,
            0.0,
            TaskKind::PeerSetPoll,
            "NTP_PeerSet",
        ));

        let usc = match &self.socket {
            Some(usc) => usc,
            None => panic!("peer poll without a socket"),
        };
        let polled = peer::poll(self.peers.get_mut(id), usc, &mut self.timebase, POLL_TIMEOUT)?;

        if !polled {
            self.peers.get_mut(id).state = PeerState::Unresponsive;
            return Ok(TaskStatus::Ok);
        }
        self.peers.get_mut(id).state = PeerState::Active;

        match self.poll_action {
            PollAction::Record => {
                let np = self.peers.get(id);
                let line = np.rx_pkt.as_ref().map(|rx| rx.trace_format());
                if let Some(line) = line {
                    let (host, ip) = (np.hostname.clone(), np.ip.clone());
                    trace_rec!(self.tracer, "Poll {} {} {}", host, ip, line);
                }
            }
            PollAction::Steer => self.run_filter_chain(id)?,
        }
        Ok(TaskStatus::Ok)
    }

    fn poll_monitor(&mut self) -> Result<TaskStatus, Error> {
        let mut mon = self.monitor.take().expect("monitor task without monitor peer");
        let usc = match &self.socket {
            Some(usc) => usc,
            None => panic!("monitor poll without a socket"),
        };
        let result = peer::poll(&mut mon, usc, &mut self.timebase, MONITOR_TIMEOUT);
        match &result {
            Ok(true) => {
                if let Some(rx) = &mon.rx_pkt {
                    trace_rec!(
                        self.tracer,
                        "Monitor {} {} {}",
                        mon.hostname,
                        mon.ip,
                        rx.trace_format()
                    );
                }
            }
            Ok(false) => {
                trace_rec!(self.tracer, "Monitor_err {} {} 0", mon.hostname, mon.ip);
            }
            Err(_) => {}
        }
        self.monitor = Some(mon);
        result.map(|_| TaskStatus::Ok)
    }

    /// Feed a freshly accepted reply through filter, combiner and PLL.
    pub(crate) fn run_filter_chain(&mut self, id: PeerId) -> Result<(), Error> {
        let generation = self.timebase.generation();

        let np = self.peers.get(id);
        let Some(rx) = np.rx_pkt else { return Ok(()) };
        let (host, ip) = (np.hostname.clone(), np.ip.clone());

        trace_rec!(self.tracer, "NTP_Packet {} {} {}", host, ip, rx.trace_format());

        let upd = match self
            .peers
            .get_mut(id)
            .filter
            .update(&rx, generation, &self.params)
        {
            Ok(upd) => upd,
            Err(reject) => {
                trace_rec!(self.tracer, "{reject}");
                if matches!(reject, Reject::LeapUnknown | Reject::BadStratum(_)) {
                    self.peers.get_mut(id).state = PeerState::Unsynchronized;
                }
                return Ok(());
            }
        };

        trace_rec!(
            self.tracer,
            "NTP_Filter {} {} {} {:.3e} {:.3e} {:.3e} {:.3e} {:.3e} {:.3e}",
            host,
            ip,
            upd.branch,
            upd.lo,
            upd.mid,
            upd.hi,
            upd.lo_lim,
            upd.amid,
            upd.hi_lim
        );

        let Some(source) = self.peers.get(id).source else {
            debug!(host = %host, "peer has no combiner slot");
            return Ok(());
        };
        self.combiner
            .publish(source, upd.trust, upd.lo, upd.mid, upd.hi, generation);

        let quorum = self.params.combine_quorum as usize;
        let peak = self.combiner.find_peak(generation, quorum);
        trace_rec!(
            self.tracer,
            "Combine {} {} {:.6} {:.6} {:.6} {:.3e} {:.3e} {:.3e}",
            host,
            ip,
            upd.lo,
            upd.mid,
            upd.hi,
            peak.offset,
            peak.weight,
            peak.weight.log10()
        );

        self.pll_apply(peak)
    }

    fn pll_apply(&mut self, peak: Peak) -> Result<(), Error> {
        let now = self.timebase.now();
        let generation = self.timebase.generation();
        let upd = self
            .pll
            .update(now, peak.offset, peak.weight, generation, &self.params);

        trace_rec!(
            self.tracer,
            "PLL {} {:.3e} {:.3e} {:.3e} {:.3e} {:.3e} {:.3e} {:.3e} {:.3e}",
            upd.mode.as_int(),
            upd.dt,
            peak.offset,
            peak.weight,
            upd.p_term,
            upd.duration,
            upd.integrator,
            upd.used_a,
            upd.used_b
        );

        if let Some(offset) = upd.step {
            if !self.timebase.is_sim() {
                trace_rec!(self.tracer, "KERNTIME_STEP {:.3e}", offset);
            }
            self.timebase.step(offset)?;
        }

        if upd.wants_adjust() {
            if let Some(handle) = self.slew_restore.take() {
                self.todo.cancel(handle);
            }
            let slew = self
                .timebase
                .adjust(upd.p_term, upd.duration, upd.integrator)?;
            self.last_frequency = upd.integrator;
            if !self.timebase.is_sim() {
                let freq = upd.integrator + upd.p_term / upd.duration;
                trace_rec!(self.tracer, "KERNPLL {:.6e} 0", freq);
            }
            if let Slew::Armed { restore_after } = slew {
                self.slew_restore = Some(self.todo.schedule_rel(
                    now,
                    restore_after,
                    0.0,
                    TaskKind::SlewRestore,
                    "KT_TICK",
                ));
            }
        }
        Ok(())
    }
}

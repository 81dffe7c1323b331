//! The machine orchestrator.
//!
//! A machine owns the cpu, the pacing clock and — once attached — the two
//! controllers. `run` drives the fetch-execute-tick loop, polling the i/o
//! controller for interrupts at the configured cadence and dispatching
//! machine-level interrupts (save, load, quit) to the registered handlers.
//!
//! Threading follows a hand-off model: when `runAsync` is enabled the whole
//! run context moves onto a worker thread and moves back on
//! `wait_for_completion`; when `saveAsync`/`loadAsync` are enabled the
//! respective handler travels to a short-lived worker and is returned over a
//! bounded channel that the loop polls between instructions.

mod state;

use std::collections::BTreeMap;
use std::thread;

use crossbeam_channel::{bounded, Receiver, TryRecvError};

use crate::clock::CpuClock;
use crate::controller::{Bus, Controller, Isr};
use crate::cpu::Intel8080;
use crate::error::Error;
use crate::opts::Options;

/// The 8080 runs at 2 MHz; one tick is 500 ns.
const I8080_SPEED_HZ: u64 = 2_000_000;

type SaveHandler = Box<dyn FnMut(&str) + Send>;
type LoadHandler = Box<dyn FnMut() -> Option<String> + Send>;

/// Everything the run loop touches, detached from the `Machine` so the whole
/// bundle can move onto a worker thread and back.
struct RunContext {
    cpu: Intel8080,
    clock: CpuClock,
    memory: Box<dyn Controller>,
    io: Box<dyn Controller>,
    on_save: Option<SaveHandler>,
    on_load: Option<LoadHandler>,
    /// Rom ranges declared by the most recent load; survives across runs.
    rom_ranges: BTreeMap<u16, u16>,
    ticks_per_isr: i64,
    save_async: bool,
    load_async: bool,
    encoder: String,
    compressor: String,
}

/// An embeddable Intel 8080 machine.
///
/// Attach a memory controller and an i/o controller, register save/load
/// handlers if snapshots are wanted, then call [`Machine::run`]. The loop
/// exits when the i/o controller returns [`Isr::Quit`];
/// [`Machine::wait_for_completion`] returns the elapsed emulated time.
pub struct Machine {
    cpu: Option<Intel8080>,
    clock: Option<CpuClock>,
    memory: Option<Box<dyn Controller>>,
    io: Option<Box<dyn Controller>>,
    on_save: Option<SaveHandler>,
    on_load: Option<LoadHandler>,
    rom_ranges: BTreeMap<u16, u16>,
    opts: Options,
    worker: Option<thread::JoinHandle<(RunContext, u64)>>,
    run_time: u64,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    pub fn new() -> Self {
        Machine {
            cpu: Some(Intel8080::new()),
            clock: Some(CpuClock::new(I8080_SPEED_HZ)),
            memory: None,
            io: None,
            on_save: None,
            on_load: None,
            rom_ranges: BTreeMap::new(),
            opts: Options::default(),
            worker: None,
            run_time: 0,
        }
    }

    fn running(&self) -> bool {
        self.worker.is_some()
    }

    /// Apply an option document (see the crate docs for the recognised keys).
    /// `None` restores the defaults. Fails with [`Error::Busy`] while running.
    pub fn set_options(&mut self, opts: Option<&str>) -> Result<(), Error> {
        if self.running() {
            return Err(Error::Busy);
        }

        self.opts.set_options(opts)
    }

    pub fn attach_memory_controller(
        &mut self,
        controller: Box<dyn Controller>,
    ) -> Result<(), Error> {
        if self.running() {
            return Err(Error::Busy);
        }

        self.memory = Some(controller);
        Ok(())
    }

    /// Hand the attached memory controller back to the caller.
    pub fn detach_memory_controller(&mut self) -> Result<Box<dyn Controller>, Error> {
        if self.running() {
            return Err(Error::Busy);
        }

        self.memory.take().ok_or(Error::MemoryController)
    }

    pub fn attach_io_controller(&mut self, controller: Box<dyn Controller>) -> Result<(), Error> {
        if self.running() {
            return Err(Error::Busy);
        }

        self.io = Some(controller);
        Ok(())
    }

    /// Hand the attached i/o controller back to the caller.
    pub fn detach_io_controller(&mut self) -> Result<Box<dyn Controller>, Error> {
        if self.running() {
            return Err(Error::Busy);
        }

        self.io.take().ok_or(Error::IoController)
    }

    /// Register the save handler. It is called with the snapshot JSON; the
    /// borrow is only valid for the duration of the call.
    pub fn on_save(&mut self, handler: impl FnMut(&str) + Send + 'static) -> Result<(), Error> {
        if self.running() {
            return Err(Error::Busy);
        }

        self.on_save = Some(Box::new(handler));
        Ok(())
    }

    /// Register the load handler. It returns the snapshot JSON to restore,
    /// or `None` when no state is available (the load is then dropped).
    pub fn on_load(
        &mut self,
        handler: impl FnMut() -> Option<String> + Send + 'static,
    ) -> Result<(), Error> {
        if self.running() {
            return Err(Error::Busy);
        }

        self.on_load = Some(Box::new(handler));
        Ok(())
    }

    /// Start the run loop. Returns when the loop exits, or immediately when
    /// `runAsync` is set (join with [`Machine::wait_for_completion`]).
    pub fn run(&mut self) -> Result<(), Error> {
        if self.running() {
            return Err(Error::Busy);
        }

        if self.memory.is_none() {
            return Err(Error::MemoryController);
        }

        if self.io.is_none() {
            return Err(Error::IoController);
        }

        let clock = self.clock.as_mut().ok_or(Error::Cpu)?;

        if let Err(err) = clock.set_sampling_frequency(self.opts.clock_sampling_freq()) {
            log::warn!("clock sampling frequency applied best-effort: {err}");
        }

        let ticks_per_isr = (self.opts.isr_freq() * clock.sampling_period_ticks() as f64) as i64;

        let mut ctx = RunContext {
            cpu: self.cpu.take().ok_or(Error::Cpu)?,
            clock: self.clock.take().ok_or(Error::Cpu)?,
            memory: self.memory.take().ok_or(Error::MemoryController)?,
            io: self.io.take().ok_or(Error::IoController)?,
            on_save: self.on_save.take(),
            on_load: self.on_load.take(),
            rom_ranges: std::mem::take(&mut self.rom_ranges),
            ticks_per_isr,
            save_async: self.opts.save_async(),
            load_async: self.opts.load_async(),
            encoder: self.opts.encoder(),
            compressor: self.opts.compressor(),
        };

        ctx.cpu.reset();
        ctx.clock.reset();
        self.run_time = 0;

        if self.opts.run_async() {
            let handle = thread::Builder::new()
                .name("meen-run".into())
                .spawn(move || {
                    let mut ctx = ctx;
                    let run_time = run_loop(&mut ctx);
                    (ctx, run_time)
                })
                .map_err(|_| Error::Async)?;

            self.worker = Some(handle);
        } else {
            let run_time = run_loop(&mut ctx);
            self.restore(ctx, run_time);
        }

        Ok(())
    }

    /// Join an asynchronous run and return the elapsed emulated nanoseconds.
    /// For a synchronous run this returns the last run's time immediately.
    pub fn wait_for_completion(&mut self) -> Result<u64, Error> {
        if let Some(worker) = self.worker.take() {
            let (ctx, run_time) = worker.join().map_err(|_| Error::Async)?;
            self.restore(ctx, run_time);
        }

        Ok(self.run_time)
    }

    fn restore(&mut self, ctx: RunContext, run_time: u64) {
        self.cpu = Some(ctx.cpu);
        self.clock = Some(ctx.clock);
        self.memory = Some(ctx.memory);
        self.io = Some(ctx.io);
        self.on_save = ctx.on_save;
        self.on_load = ctx.on_load;
        self.rom_ranges = ctx.rom_ranges;
        self.run_time = run_time;
    }
}

/// In-flight async handler invocations; the handler itself travels to the
/// worker and comes back over the channel so it can be re-registered.
struct Pending {
    load: Option<Receiver<(LoadHandler, Option<String>)>>,
    save: Option<Receiver<SaveHandler>>,
}

impl Pending {
    fn idle(&self) -> bool {
        self.load.is_none() && self.save.is_none()
    }
}

/// The main loop: poll interrupts at the isr cadence, execute one
/// instruction, feed its ticks to the clock. Returns the elapsed emulated
/// time in nanoseconds.
fn run_loop(ctx: &mut RunContext) -> u64 {
    let mut curr_time: u64 = 0;
    let mut total_ticks: i64 = 0;
    let mut last_ticks: i64 = 0;
    let mut ticks: u8 = 0;
    let mut pending = Pending {
        load: None,
        save: None,
    };

    loop {
        // A zero tick count means the cpu is halted; keep polling so an
        // interrupt can resume it.
        if total_ticks - last_ticks >= ctx.ticks_per_isr || ticks == 0 {
            last_ticks = total_ticks;

            let isr =
                ctx.io
                    .service_interrupts(curr_time, total_ticks as u64, Some(ctx.memory.as_mut()));

            match isr {
                Isr::Zero | Isr::One | Isr::Two | Isr::Three | Isr::Four | Isr::Five
                | Isr::Six | Isr::Seven => {
                    let mut bus = Bus {
                        memory: ctx.memory.as_mut(),
                        io: ctx.io.as_mut(),
                    };
                    ticks = ctx.cpu.interrupt(isr, &mut bus);
                    curr_time = ctx.clock.tick(ticks as u64);
                    total_ticks += ticks as i64;
                }
                Isr::Load => dispatch_load(ctx, &mut pending),
                Isr::Save => dispatch_save(ctx, &mut pending),
                Isr::Quit => {
                    drain_handlers(ctx, &mut pending);
                    break;
                }
                Isr::NoInterrupt => poll_handlers(ctx, &mut pending),
            }
        }

        let mut bus = Bus {
            memory: ctx.memory.as_mut(),
            io: ctx.io.as_mut(),
        };
        ticks = ctx.cpu.execute(&mut bus);
        curr_time = ctx.clock.tick(ticks as u64);
        total_ticks += ticks as i64;
    }

    curr_time
}

/// Ask the load handler for a snapshot and restore it. A load is dropped
/// while another load or save is in flight.
fn dispatch_load(ctx: &mut RunContext, pending: &mut Pending) {
    if ctx.on_load.is_none() || !pending.idle() {
        return;
    }

    if ctx.load_async {
        let mut handler = match ctx.on_load.take() {
            Some(h) => h,
            None => return,
        };
        let (tx, rx) = bounded(1);

        let spawned = thread::Builder::new().name("meen-load".into()).spawn(move || {
            let json = handler();
            let _ = tx.send((handler, json));
        });

        match spawned {
            Ok(_) => pending.load = Some(rx),
            Err(err) => log::warn!("load worker failed to start: {err}"),
        }
    } else {
        let json = match ctx.on_load.as_mut() {
            Some(handler) => handler(),
            None => return,
        };

        match json {
            Some(json) => apply_load(ctx, &json),
            None => log::warn!("load handler produced no machine state"),
        }
    }
}

/// Capture the machine state and hand it to the save handler. A save is
/// dropped while another save or load is in flight.
fn dispatch_save(ctx: &mut RunContext, pending: &mut Pending) {
    if ctx.on_save.is_none() || !pending.idle() {
        return;
    }

    let json = match state::save_state(
        &ctx.cpu,
        ctx.memory.as_mut(),
        &ctx.rom_ranges,
        &ctx.encoder,
        &ctx.compressor,
    ) {
        Ok(json) => json,
        Err(err) => {
            log::warn!("machine state save failed: {err}");
            return;
        }
    };

    if ctx.save_async {
        let mut handler = match ctx.on_save.take() {
            Some(h) => h,
            None => return,
        };
        let (tx, rx) = bounded(1);

        let spawned = thread::Builder::new().name("meen-save".into()).spawn(move || {
            handler(&json);
            let _ = tx.send(handler);
        });

        match spawned {
            Ok(_) => pending.save = Some(rx),
            Err(err) => log::warn!("save worker failed to start: {err}"),
        }
    } else if let Some(handler) = ctx.on_save.as_mut() {
        handler(&json);
    }
}

/// Collect any finished async handlers without blocking.
fn poll_handlers(ctx: &mut RunContext, pending: &mut Pending) {
    if let Some(rx) = pending.load.take() {
        match rx.try_recv() {
            Ok((handler, json)) => {
                ctx.on_load = Some(handler);

                match json {
                    Some(json) => apply_load(ctx, &json),
                    None => log::warn!("load handler produced no machine state"),
                }
            }
            Err(TryRecvError::Empty) => pending.load = Some(rx),
            Err(TryRecvError::Disconnected) => {
                log::warn!("load worker terminated without a result");
            }
        }
    }

    if let Some(rx) = pending.save.take() {
        match rx.try_recv() {
            Ok(handler) => ctx.on_save = Some(handler),
            Err(TryRecvError::Empty) => pending.save = Some(rx),
            Err(TryRecvError::Disconnected) => {
                log::warn!("save worker terminated without a result");
            }
        }
    }
}

/// Block until any in-flight handlers finish; called on quit.
fn drain_handlers(ctx: &mut RunContext, pending: &mut Pending) {
    if let Some(rx) = pending.load.take() {
        match rx.recv() {
            Ok((handler, json)) => {
                ctx.on_load = Some(handler);

                match json {
                    Some(json) => apply_load(ctx, &json),
                    None => log::warn!("load handler produced no machine state"),
                }
            }
            Err(_) => log::warn!("load worker terminated without a result"),
        }
    }

    if let Some(rx) = pending.save.take() {
        match rx.recv() {
            Ok(handler) => ctx.on_save = Some(handler),
            Err(_) => log::warn!("save worker terminated without a result"),
        }
    }
}

/// Restore a snapshot, logging and swallowing failures so the loop keeps
/// running; a failed verification leaves the machine state unchanged.
fn apply_load(ctx: &mut RunContext, json: &str) {
    if let Err(err) = state::load_state(
        json,
        &mut ctx.cpu,
        ctx.memory.as_mut(),
        ctx.io.as_mut(),
        &mut ctx.rom_ranges,
    ) {
        log::warn!("machine state load failed: {err}");
    }
}

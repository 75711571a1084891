use std::{
    sync::{
        mpsc::{self, RecvTimeoutError},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    config::DriverConfig,
    s21::{
        self, link, AcState, Command, FanSpeed, Frame, LinkError, Mode, StatusReport, Timing,
        TEMPERATURE_EPSILON,
    },
    transport::Transport,
};

/// Whether the unit has answered with a valid frame yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Disconnected,
    Connected,
}

type Callback = Arc<dyn Fn(&AcState) + Send + Sync>;

// Fields of `AcState` a setter has changed
const DIRTY_POWER: u8 = 1 << 0;
const DIRTY_MODE: u8 = 1 << 1;
const DIRTY_TARGET: u8 = 1 << 2;
const DIRTY_FAN: u8 = 1 << 3;

struct Shared {
    state: AcState,
    // Local changes not yet accepted by the unit, one DIRTY_* bit per field
    dirty: u8,
    // Bumped by every local change, tells a finished control send whether it
    // carried the latest state
    generation: u64,
    link: LinkStatus,
}

struct Inner {
    shared: Mutex<Shared>,
    callback: Mutex<Option<Callback>>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, state: &AcState) {
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(state);
        }
    }
}

/// The side of the driver used by the integration layer: setters, snapshots
/// and the change callback. Cheap to clone and safe to use from any thread
/// while the poll loop runs.
#[derive(Clone)]
pub struct AcHandle {
    inner: Arc<Inner>,
}

impl AcHandle {
    pub fn state(&self) -> AcState {
        self.inner.lock().state
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.lock().dirty != 0
    }

    pub fn link_status(&self) -> LinkStatus {
        self.inner.lock().link
    }

    /// Registers the single change sink, replacing any previous one. It is
    /// called from the poll thread with a snapshot of the new state.
    pub fn on_state_change<F>(&self, callback: F)
    where
        F: Fn(&AcState) + Send + Sync + 'static,
    {
        *self
            .inner
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    // Applies a local change to `field`; returns whether anything changed.
    fn update(&self, field: u8, apply: impl FnOnce(&mut AcState) -> bool) -> bool {
        let mut shared = self.inner.lock();
        let changed = apply(&mut shared.state);
        if changed {
            shared.dirty |= field;
            shared.generation += 1;
        }
        changed
    }

    /// The setters only touch local state; the change reaches the unit on the
    /// next poll cycle. They cannot fail.
    ///
    /// Each returns `true` when the value changed and a control write was
    /// queued, `false` when there was nothing to send because the stored value
    /// already matched.
    pub fn set_power(&self, on: bool) -> bool {
        self.update(DIRTY_POWER, |state| {
            let changed = state.power != on;
            state.power = on;
            changed
        })
    }

    pub fn set_mode(&self, mode: Mode) -> bool {
        self.update(DIRTY_MODE, |state| {
            let changed = state.mode != mode;
            state.mode = mode;
            changed
        })
    }

    /// Values are clamped to the unit's range when encoded, not here.
    /// Non-finite values are ignored and return `false`.
    pub fn set_target_temperature(&self, celsius: f32) -> bool {
        if !celsius.is_finite() {
            warn!("ignoring target temperature {}", celsius);
            return false;
        }

        self.update(DIRTY_TARGET, |state| {
            if (state.target_temperature - celsius).abs() > TEMPERATURE_EPSILON {
                state.target_temperature = celsius;
                true
            } else {
                false
            }
        })
    }

    pub fn set_fan_speed(&self, fan: FanSpeed) -> bool {
        self.update(DIRTY_FAN, |state| {
            let changed = state.fan_speed != fan;
            state.fan_speed = fan;
            changed
        })
    }
}

/// Polls the unit over `T`, keeps the believed state and pushes local
/// changes to the unit.
pub struct AcStateMachine<T> {
    transport: T,
    timing: Timing,
    handle: AcHandle,

    max_missed_cycles: u32,
    missed_cycles: u32,

    control_attempts: u32,
    failed_controls: u32,

    shutdown: Option<mpsc::Receiver<()>>,
    stopping: bool,

    // Set when any exchange of the current cycle got a response
    heard: bool,
}

impl<T: Transport> AcStateMachine<T> {
    pub fn new(transport: T, timing: Timing) -> Self {
        let defaults = DriverConfig::default();

        Self {
            transport,
            timing,
            handle: AcHandle {
                inner: Arc::new(Inner {
                    shared: Mutex::new(Shared {
                        state: AcState::default(),
                        dirty: 0,
                        generation: 0,
                        link: LinkStatus::Disconnected,
                    }),
                    callback: Mutex::new(None),
                }),
            },
            max_missed_cycles: defaults.max_missed_cycles,
            missed_cycles: 0,
            control_attempts: defaults.control_attempts,
            failed_controls: 0,
            shutdown: None,
            stopping: false,
            heard: false,
        }
    }

    pub fn from_config(transport: T, config: &DriverConfig) -> Self {
        Self::new(transport, config.timing())
            .with_max_missed_cycles(config.max_missed_cycles)
            .with_control_attempts(config.control_attempts)
    }

    /// Cycles without any response before probing again. Zero never gives up
    /// on the link.
    pub fn with_max_missed_cycles(mut self, cycles: u32) -> Self {
        self.max_missed_cycles = cycles;
        self
    }

    /// Control frames sent for one change before it is dropped. Zero retries
    /// forever.
    pub fn with_control_attempts(mut self, attempts: u32) -> Self {
        self.control_attempts = attempts;
        self
    }

    pub fn handle(&self) -> AcHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> AcState {
        self.handle.state()
    }

    pub fn link_status(&self) -> LinkStatus {
        self.handle.link_status()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Runs one complete poll cycle: control (if a change is pending), status,
    /// sensor. While disconnected only the probe and a status query go out.
    ///
    /// Errors are logged and absorbed; the next cycle is the retry.
    pub fn poll(&mut self) {
        self.heard = false;

        match self.link_status() {
            LinkStatus::Disconnected => {
                self.query(Command::PROBE);
                if !self.settle() {
                    return;
                }
                self.query(Command::STATUS_QUERY);
            }
            LinkStatus::Connected => {
                if self.is_dirty() {
                    self.send_control();
                    if !self.settle() {
                        return;
                    }
                }

                self.query(Command::STATUS_QUERY);
                if !self.settle() {
                    return;
                }
                self.query(Command::SENSOR_QUERY);
                self.settle();
            }
        }

        self.track_link();
    }

    fn is_dirty(&self) -> bool {
        self.handle.is_dirty()
    }

    fn track_link(&mut self) {
        if self.heard {
            self.missed_cycles = 0;
            return;
        }

        self.missed_cycles += 1;
        if self.max_missed_cycles == 0 || self.missed_cycles < self.max_missed_cycles {
            return;
        }

        let mut shared = self.handle.inner.lock();
        if shared.link == LinkStatus::Connected {
            warn!(
                "no response for {} cycles, probing the unit again",
                self.missed_cycles
            );
            shared.link = LinkStatus::Disconnected;
        }
    }

    fn exchange(&mut self, command: Command, payload: &[u8]) -> Result<Option<Frame>, LinkError> {
        let result = link::exchange(&mut self.transport, &self.timing, command, payload);

        match &result {
            Ok(reply) => {
                self.heard = true;
                if let Some(frame) = reply {
                    self.mark_connected();
                    self.handle_reply(frame);
                }
            }
            Err(e) => {
                if !e.is_delivery_failure() {
                    self.heard = true;
                }
                debug!("{} exchange failed: {}", command, e);
            }
        }

        result
    }

    fn query(&mut self, command: Command) {
        // Failures only leave the state stale
        let _ = self.exchange(command, &[]);
    }

    fn mark_connected(&mut self) {
        let mut shared = self.handle.inner.lock();
        if shared.link == LinkStatus::Disconnected {
            info!("unit answered, link up");
            shared.link = LinkStatus::Connected;
        }
    }

    fn send_control(&mut self) {
        let (payload, generation) = {
            let shared = self.handle.inner.lock();
            (s21::control_payload(&shared.state), shared.generation)
        };
        debug!("sending control {}", String::from_utf8_lossy(&payload));

        let result = self.exchange(Command::CONTROL, &payload);

        let mut shared = self.handle.inner.lock();
        match result {
            Err(e) if e.is_delivery_failure() => {
                self.failed_controls += 1;
                if self.control_attempts != 0 && self.failed_controls >= self.control_attempts {
                    warn!(
                        "dropping pending change after {} failed attempts: {}",
                        self.failed_controls, e
                    );
                    shared.dirty = 0;
                    self.failed_controls = 0;
                } else {
                    warn!("control not delivered, will retry: {}", e);
                }
            }
            _ => {
                // The unit saw the frame
                self.failed_controls = 0;
                if shared.generation == generation {
                    shared.dirty = 0;
                } else {
                    debug!("state changed during control send, sending again next cycle");
                }
            }
        }
    }

    fn handle_reply(&mut self, frame: &Frame) {
        match frame.command {
            Command::STATUS_REPLY | Command::STATUS_REPLY_ALT => {
                self.handle_status(&frame.payload)
            }
            Command::SENSOR_REPLY => self.handle_sensor(&frame.payload),
            other => debug!("ignoring {} reply", other),
        }
    }

    fn handle_status(&mut self, payload: &[u8]) {
        let report = match StatusReport::try_from(payload) {
            Ok(report) => report,
            Err(()) => {
                debug!("short status payload: {}", hex::encode(payload));
                return;
            }
        };

        // Fields with a local change still waiting to be sent keep the local
        // value, the rest follow the unit.
        let snapshot = {
            let mut shared = self.handle.inner.lock();
            let dirty = shared.dirty;
            if dirty != 0 {
                debug!("local change pending (fields {:#06b})", dirty);
            }

            let state = &mut shared.state;
            let mut changed = false;
            if dirty & DIRTY_POWER == 0 && state.power != report.power {
                state.power = report.power;
                changed = true;
            }
            if dirty & DIRTY_MODE == 0 && state.mode != report.mode {
                state.mode = report.mode;
                changed = true;
            }
            if dirty & DIRTY_TARGET == 0 && state.target_temperature != report.target_temperature
            {
                state.target_temperature = report.target_temperature;
                changed = true;
            }
            if !changed {
                return;
            }

            info!(
                "status changed: power {} mode {} target {:.1}",
                state.power,
                state.mode.as_ref(),
                state.target_temperature
            );
            *state
        };

        self.handle.inner.notify(&snapshot);
    }

    fn handle_sensor(&mut self, payload: &[u8]) {
        let room = match s21::decode_sensor_temperature(payload) {
            Some(room) if s21::is_plausible_room_temperature(room) => room,
            Some(room) => {
                debug!("discarding implausible room temperature {:.1}", room);
                return;
            }
            None => {
                debug!("malformed sensor payload: {}", hex::encode(payload));
                return;
            }
        };

        let snapshot = {
            let mut shared = self.handle.inner.lock();
            if (shared.state.current_temperature - room).abs() <= TEMPERATURE_EPSILON {
                return;
            }
            info!("room temperature {:.1}", room);
            shared.state.current_temperature = room;
            shared.state
        };

        self.handle.inner.notify(&snapshot);
    }

    // Waits between steps, false once shutdown has been requested.
    fn settle(&mut self) -> bool {
        self.wait(self.timing.settle)
    }

    fn wait(&mut self, duration: Duration) -> bool {
        if self.stopping {
            return false;
        }

        match &self.shutdown {
            Some(shutdown) => match shutdown.recv_timeout(duration) {
                Err(RecvTimeoutError::Timeout) => true,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    self.stopping = true;
                    false
                }
            },
            None => {
                if !duration.is_zero() {
                    thread::sleep(duration);
                }
                true
            }
        }
    }
}

impl<T: Transport + Send + 'static> AcStateMachine<T> {
    /// Moves the machine onto its own thread, polling every `interval`.
    pub fn spawn(mut self, interval: Duration) -> std::io::Result<PollTask<T>> {
        let (stop, shutdown) = mpsc::channel();
        self.shutdown = Some(shutdown);
        let handle = self.handle();

        let thread = thread::Builder::new()
            .name("s21-poll".into())
            .spawn(move || {
                info!("poll loop started");
                loop {
                    self.poll();
                    if !self.wait(interval) {
                        break;
                    }
                }
                info!("poll loop stopped");
                self.shutdown = None;
                self.stopping = false;
                self
            })?;

        Ok(PollTask {
            handle,
            stop,
            thread,
        })
    }
}

/// A running poll loop
pub struct PollTask<T> {
    handle: AcHandle,
    stop: mpsc::Sender<()>,
    thread: JoinHandle<AcStateMachine<T>>,
}

impl<T> PollTask<T> {
    pub fn handle(&self) -> AcHandle {
        self.handle.clone()
    }

    /// Signals the loop, waits for the current step to finish and hands the
    /// machine back. `None` if the poll thread panicked.
    pub fn stop(self) -> Option<AcStateMachine<T>> {
        // A closed channel stops the loop just the same
        let _ = self.stop.send(());
        self.thread.join().ok()
    }
}

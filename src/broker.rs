use std::collections::{HashMap, VecDeque};
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::Sender;

use crate::config::SerialSettings;
use crate::device_port::DevicePort;
use crate::error::BrokerError;
use crate::hook::run_reset_hook;
use crate::serial::open_device;

/// Response terminator: the literal 9-byte sentinel ending every response.
pub const TERMINATOR: &[u8] = b"\r\n#STOP\r\n";
/// Synthesized error response emitted on a command that fails due to reset.
pub const ERROR_RESPONSE: &[u8] = b"#ERROR\r\n#STOP\r\n";

/// The response timeout armed on every send and cancelled on `command_done`.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);
/// Watchdog polling interval; fine-grained enough that the 1-second timeout
/// fires within a few tens of milliseconds of its deadline.
const WATCHDOG_TICK: Duration = Duration::from_millis(50);
/// Chunk size for a single read from the device.
const READ_CHUNK: usize = 256;

pub type ConnectionId = u64;

/// Opens (or reopens) the device. Production code always installs
/// `default_opener`, which wraps `serial::open_device`; tests substitute one
/// that hands back a `UnixStream` half (or fails), so a reset's reopen step
/// is exercisable without real hardware.
type Opener = Arc<dyn Fn(&Path, &SerialSettings) -> io::Result<Box<dyn DevicePort>> + Send + Sync>;

fn default_opener() -> Opener {
    Arc::new(|path: &Path, settings: &SerialSettings| {
        open_device(path, settings).map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))
    })
}

/// A command waiting its turn on the shared device. Holds a non-owning
/// reference (by id, not pointer) to the connection that posted it — the
/// connection may already be gone by the time this is dispatched.
struct QueuedCommand {
    connection: ConnectionId,
    bytes: Vec<u8>,
}

struct ConnectionHandle {
    outbound: Sender<Bytes>,
}

/// The mutable heart of the daemon — the Rust analogue of the original's
/// `server_context_t`. A single `Mutex` around this struct stands in for
/// the original's single-threaded event loop: every state transition
/// (submit, command_done, reset, connection close) runs with the lock
/// held start to finish, so no two transitions interleave.
struct Core {
    device: Option<Box<dyn DevicePort>>,
    response_buffer: Vec<u8>,
    active: Option<ConnectionId>,
    queue: VecDeque<QueuedCommand>,
    connections: HashMap<ConnectionId, ConnectionHandle>,
    next_connection_id: ConnectionId,
    /// Armed on every `send`, cleared on every `command_done`. Its
    /// presence, not `active`, is what the response framing follows —
    /// `active` can be cleared early while a response is still in
    /// flight and must still be drained and framed.
    timeout_deadline: Option<Instant>,
    /// Bumped every time a new device handle is installed. Lets a reader
    /// thread notice it has been superseded by a reset and retire quietly.
    generation: u64,
}

/// Shared, thread-safe broker state plus the immutable configuration
/// needed to (re)open the device. One instance lives for the whole
/// daemon lifetime.
pub struct Broker {
    core: Mutex<Core>,
    device_path: PathBuf,
    settings: SerialSettings,
    hook: Option<PathBuf>,
    opener: Opener,
}

impl Broker {
    /// Opens the device once at startup (no hook invocation — the hook is
    /// a *reset* recovery action, not a boot step) and returns a broker
    /// with its watchdog and reader threads already running. Startup open
    /// failure is fatal, matching the original's `start_server`.
    pub fn open(
        device_path: PathBuf,
        settings: SerialSettings,
        hook: Option<PathBuf>,
    ) -> serialport::Result<Arc<Broker>> {
        let device = open_device(&device_path, &settings)?;
        let reader_handle = device.try_clone_device()?;

        let core = Core {
            device: Some(device),
            response_buffer: Vec::new(),
            active: None,
            queue: VecDeque::new(),
            connections: HashMap::new(),
            next_connection_id: 0,
            timeout_deadline: None,
            generation: 0,
        };

        let broker = Arc::new(Broker {
            core: Mutex::new(core),
            device_path,
            settings,
            hook,
            opener: default_opener(),
        });

        spawn_reader(Arc::clone(&broker), reader_handle, 0);
        spawn_watchdog(Arc::clone(&broker));

        Ok(broker)
    }

    /// Registers a freshly accepted connection, returning the id used to
    /// address it in the queue and connection table.
    pub fn register_connection(self: &Arc<Self>, outbound: Sender<Bytes>) -> ConnectionId {
        let mut core = self.core.lock().unwrap();
        let id = core.next_connection_id;
        core.next_connection_id += 1;
        core.connections.insert(id, ConnectionHandle { outbound });
        id
    }

    /// Tears down bookkeeping for a closed connection. Queued-but-
    /// not-yet-sent entries belonging to this id are left in the queue —
    /// they are still dispatched in order, just to nobody; see
    /// `on_chunk_locked`'s connection-table lookup.
    pub fn unregister_connection(self: &Arc<Self>, id: ConnectionId) {
        let mut core = self.core.lock().unwrap();
        core.connections.remove(&id);
        if core.active == Some(id) {
            core.active = None;
        }
    }

    /// Writes immediately if the device is idle, else enqueues behind the
    /// command already in flight.
    pub fn submit(self: &Arc<Self>, id: ConnectionId, bytes: Vec<u8>) -> Result<(), BrokerError> {
        let mut core = self.core.lock().unwrap();
        if core.active.is_none() {
            core.active = Some(id);
            self.send_locked(&mut core, &bytes);
        } else {
            core.queue.push_back(QueuedCommand {
                connection: id,
                bytes,
            });
        }
        Ok(())
    }

    /// SerialChannel.send: arm the timeout, reset-if-absent, write bytes.
    fn send_locked(self: &Arc<Self>, core: &mut Core, bytes: &[u8]) {
        core.timeout_deadline = Some(Instant::now() + RESPONSE_TIMEOUT);

        if core.device.is_none() && !self.reset_locked(core, false) {
            tracing::error!("failed to reset serial port before command, returning error");
            self.emit_error_locked(core);
            return;
        }

        let write_result = core
            .device
            .as_mut()
            .expect("device present after successful reset check")
            .write_all(bytes);

        if let Err(err) = write_result {
            tracing::warn!(%err, "serial write failed, resetting port");
            core.device = None;
            self.reset_locked(core, true);
        }
    }

    fn emit_error_locked(self: &Arc<Self>, core: &mut Core) {
        if let Some(id) = core.active {
            if let Some(handle) = core.connections.get(&id) {
                let _ = handle.outbound.send(Bytes::from_static(ERROR_RESPONSE));
            }
        }
    }

    /// Clears the in-flight response state and dispatches the next queued
    /// command, if any.
    fn command_done_locked(self: &Arc<Self>, core: &mut Core) {
        core.response_buffer.clear();
        core.timeout_deadline = None;

        if let Some(cmd) = core.queue.pop_front() {
            core.active = Some(cmd.connection);
            self.send_locked(core, &cmd.bytes);
        } else {
            core.active = None;
        }
    }

    /// Closes and reopens the device, replaying the reset hook and the
    /// framing settings. Returns whether the device is open afterwards.
    /// `command_done` is only reached on a successful reopen — a failed
    /// retry leaves `active` stale and will re-emit `#ERROR` on the next
    /// watchdog tick. Retries are unbounded and undampened by design: a
    /// device that never comes back keeps the watchdog quietly retrying
    /// rather than giving up.
    fn reset_locked(self: &Arc<Self>, core: &mut Core, fail_active: bool) -> bool {
        if fail_active {
            self.emit_error_locked(core);
        }

        core.device = None;

        if let Some(hook) = &self.hook {
            run_reset_hook(hook);
        }

        match (self.opener)(&self.device_path, &self.settings) {
            Ok(device) => match device.try_clone_device() {
                Ok(reader_handle) => {
                    core.device = Some(device);
                    core.generation += 1;
                    spawn_reader(Arc::clone(self), reader_handle, core.generation);
                }
                Err(err) => {
                    tracing::error!(%err, "failed to clone reopened device for reader thread");
                    core.timeout_deadline = Some(Instant::now() + RESPONSE_TIMEOUT);
                    return false;
                }
            },
            Err(err) => {
                tracing::error!(
                    path = %self.device_path.display(),
                    %err,
                    "failed to reopen serial device, will retry",
                );
                core.timeout_deadline = Some(Instant::now() + RESPONSE_TIMEOUT);
                return false;
            }
        }

        if fail_active {
            self.command_done_locked(core);
        }
        true
    }

    fn notify_chunk(self: &Arc<Self>, generation: u64, chunk: &[u8]) -> bool {
        let mut core = self.core.lock().unwrap();
        if core.generation != generation {
            return false;
        }
        self.on_chunk_locked(&mut core, chunk);
        true
    }

    fn on_chunk_locked(self: &Arc<Self>, core: &mut Core, chunk: &[u8]) {
        if core.timeout_deadline.is_none() {
            // No command outstanding: the device spoke without being asked.
            tracing::warn!(bytes = chunk.len(), "unsolicited device output");
            return;
        }

        core.response_buffer.extend_from_slice(chunk);

        if let Some(id) = core.active {
            if let Some(handle) = core.connections.get(&id) {
                let _ = handle.outbound.send(Bytes::copy_from_slice(chunk));
            }
        }

        let buf = &core.response_buffer;
        if buf.len() >= TERMINATOR.len() && &buf[buf.len() - TERMINATOR.len()..] == TERMINATOR {
            self.command_done_locked(core);
        }
    }

    fn notify_device_trouble(self: &Arc<Self>, generation: u64, reason: &'static str) {
        let mut core = self.core.lock().unwrap();
        if core.generation != generation {
            return;
        }
        tracing::error!(reason, "serial channel error, resetting port");
        self.reset_locked(&mut core, true);
    }

    fn still_current(self: &Arc<Self>, generation: u64) -> bool {
        self.core.lock().unwrap().generation == generation
    }

    fn tick_watchdog(self: &Arc<Self>) {
        let mut core = self.core.lock().unwrap();
        if let Some(deadline) = core.timeout_deadline {
            if Instant::now() >= deadline {
                tracing::error!("response timeout, resetting serial port");
                self.reset_locked(&mut core, true);
            }
        }
    }
}

/// Spawns the reader thread reading from `reader_handle`, tagged with the
/// generation of the device it belongs to so it can retire once superseded.
fn spawn_reader(broker: Arc<Broker>, reader_handle: Box<dyn DevicePort>, generation: u64) {
    thread::spawn(move || run_reader(broker, reader_handle, generation));
}

fn run_reader(broker: Arc<Broker>, mut reader: Box<dyn DevicePort>, generation: u64) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                broker.notify_device_trouble(generation, "device EOF");
                return;
            }
            Ok(n) => {
                if !broker.notify_chunk(generation, &buf[..n]) {
                    return;
                }
            }
            Err(err) if is_retryable_timeout(&err) => {
                if !broker.still_current(generation) {
                    return;
                }
            }
            Err(_err) => {
                broker.notify_device_trouble(generation, "device read error");
                return;
            }
        }
    }
}

fn is_retryable_timeout(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock)
}

fn spawn_watchdog(broker: Arc<Broker>) {
    thread::spawn(move || loop {
        thread::sleep(WATCHDOG_TICK);
        broker.tick_watchdog();
    });
}

use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use kcnet_dhcp::DhcpResponder;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bridge::PortReservations;
use crate::chip::{Chip, Effect, Job};
use crate::config::{AddressPlan, DeviceConfig};
use crate::error::{BridgeError, Notice};
use crate::probe::{ProbeTable, Reachability};
use crate::regs::SOCKET_COUNT;
use crate::worker;

const RUNTIME_WORKER_THREADS: usize = 2;

#[derive(Debug, Default)]
pub(crate) struct NoticeLog {
    pending: Vec<Notice>,
    permission_denied_reported: bool,
}

/// State shared between the guest-facing device and its socket workers.
pub(crate) struct Shared {
    chip: Mutex<Chip>,
    reservations: Mutex<PortReservations>,
    dhcp: Mutex<DhcpResponder>,
    probes: Mutex<ProbeTable>,
    notices: Mutex<NoticeLog>,
    pub(crate) wakes: [Notify; SOCKET_COUNT],
    pub(crate) reachability: Arc<dyn Reachability>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    pub(crate) fn chip(&self) -> MutexGuard<'_, Chip> {
        lock(&self.chip)
    }

    pub(crate) fn reservations(&self) -> MutexGuard<'_, PortReservations> {
        lock(&self.reservations)
    }

    pub(crate) fn dhcp(&self) -> MutexGuard<'_, DhcpResponder> {
        lock(&self.dhcp)
    }

    pub(crate) fn probes(&self) -> MutexGuard<'_, ProbeTable> {
        lock(&self.probes)
    }

    pub(crate) fn wake_all(&self) {
        for wake in &self.wakes {
            wake.notify_one();
        }
    }

    /// Records a failure the user should hear about. Permission problems are reported once per
    /// reset cycle.
    pub(crate) fn note_failure(&self, socket: usize, port: u16, err: &BridgeError) {
        if !err.is_permission_denied() {
            return;
        }
        let mut log = lock(&self.notices);
        if log.permission_denied_reported {
            return;
        }
        log.permission_denied_reported = true;
        let notice = Notice::PermissionDenied { socket, port };
        warn!(%notice, "host refused a network operation");
        log.pending.push(notice);
    }

    /// Forgets everything that only lives for one reset cycle.
    fn clear_transient(&self) {
        self.dhcp().clear();
        self.probes().clear();
        lock(&self.notices).permission_denied_reported = false;
    }
}

struct SocketWorkers {
    jobs: mpsc::UnboundedSender<Job>,
    control: JoinHandle<()>,
    receive: JoinHandle<()>,
}

/// Virtual W5100 network controller.
///
/// The guest side ([`read_byte`](Self::read_byte), [`write_byte`](Self::write_byte)) never blocks
/// on the network: host I/O runs on a small tokio runtime owned by the device, and results are
/// committed into the register window under a short lock.
pub struct W5100 {
    config: DeviceConfig,
    shared: Arc<Shared>,
    runtime: Option<Runtime>,
    workers: Vec<SocketWorkers>,
}

impl W5100 {
    pub fn new(config: DeviceConfig) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(RUNTIME_WORKER_THREADS)
            .thread_name("kcnet-w5100")
            .enable_all()
            .build()?;
        let plan = config.addresses();
        debug!(?plan, "creating W5100");

        let shared = Arc::new(Shared {
            chip: Mutex::new(Chip::new(plan)),
            reservations: Mutex::new(PortReservations::default()),
            dhcp: Mutex::new(DhcpResponder::new()),
            probes: Mutex::new(ProbeTable::default()),
            notices: Mutex::new(NoticeLog::default()),
            wakes: std::array::from_fn(|_| Notify::new()),
            reachability: Arc::clone(&config.reachability),
        });
        let mut device = Self {
            config,
            shared,
            runtime: Some(runtime),
            workers: Vec::with_capacity(SOCKET_COUNT),
        };
        device.spawn_workers();
        Ok(device)
    }

    /// Reads one byte of the chip window. Addresses past `0x7FFF` read as 0.
    pub fn read_byte(&self, addr: u16) -> u8 {
        self.shared.chip().read_byte(addr)
    }

    /// Writes one byte of the chip window. Addresses past `0x7FFF` are ignored.
    pub fn write_byte(&mut self, addr: u16, value: u8) {
        let mut effects = Vec::new();
        self.shared.chip().write_byte(addr, value, &mut effects);
        self.apply(effects);
    }

    /// Closes every socket and reloads the register defaults. `power_on` additionally wipes the
    /// window and re-seeds the address registers, rediscovering the host first when the config
    /// asks for it.
    pub fn reset(&mut self, power_on: bool) {
        let plan = match self.config.rediscover {
            Some(discover) if power_on => {
                self.config.host = discover();
                let plan = self.config.addresses();
                debug!(?plan, "host addresses rediscovered");
                Some(plan)
            }
            _ => None,
        };
        {
            let mut chip = self.shared.chip();
            if let Some(plan) = plan {
                chip.set_plan(plan);
            }
            chip.reset(power_on);
        }
        self.restart_workers();
    }

    /// Stops all workers and closes every host socket. Safe to call more than once.
    pub fn destroy(&mut self) {
        self.stop_workers();
        self.shared.chip().reset(false);
        self.shared.reservations().release_all();
        if let Some(runtime) = self.runtime.take() {
            debug!("shutting down W5100 runtime");
            runtime.shutdown_background();
        }
    }

    /// Binds a free UDP port and holds it until the next DISCON/CLOSE, so the guest can use it
    /// as its next local port.
    pub fn reserve_port(&self) -> Option<u16> {
        match self.shared.reservations().reserve() {
            Ok(port) => Some(port),
            Err(err) => {
                debug!(%err, "port reservation failed");
                None
            }
        }
    }

    /// True while an interrupt that `IMR` does not mask is pending in `IR`.
    pub fn irq_pending(&self) -> bool {
        self.shared.chip().interrupt_pending()
    }

    pub fn drain_notices(&self) -> Vec<Notice> {
        std::mem::take(&mut lock(&self.shared.notices).pending)
    }

    /// The addresses the chip is seeded with on a cold reset.
    pub fn addresses(&self) -> AddressPlan {
        *self.shared.chip().plan()
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Job(n, job) => {
                    if let Some(workers) = self.workers.get(n) {
                        if workers.jobs.send(job).is_err() {
                            debug!(socket = n, "control task gone, dropping job");
                        }
                    }
                }
                Effect::Wake(n) => self.shared.wakes[n].notify_one(),
                Effect::ReleaseReservations => self.shared.reservations().release_all(),
                Effect::Restart => self.restart_workers(),
            }
        }
    }

    fn spawn_workers(&mut self) {
        let Some(runtime) = self.runtime.as_ref() else {
            return;
        };
        for n in 0..SOCKET_COUNT {
            let (jobs, rx) = mpsc::unbounded_channel();
            let control = runtime.spawn(worker::control_task(Arc::clone(&self.shared), n, rx));
            let receive = runtime.spawn(worker::receive_task(Arc::clone(&self.shared), n));
            self.workers.push(SocketWorkers {
                jobs,
                control,
                receive,
            });
        }
    }

    fn stop_workers(&mut self) {
        for workers in self.workers.drain(..) {
            workers.control.abort();
            workers.receive.abort();
        }
    }

    fn restart_workers(&mut self) {
        self.stop_workers();
        self.shared.clear_transient();
        self.spawn_workers();
    }
}

impl Drop for W5100 {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for W5100 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("W5100")
            .field("running", &self.runtime.is_some())
            .finish_non_exhaustive()
    }
}

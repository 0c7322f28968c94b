use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use nix::sched::{CpuSet, sched_setaffinity};
use nix::unistd::Pid;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mvirt_iokernel::config::INGRESS_SHM_KEY;
use mvirt_iokernel::tap::TapPort;
use mvirt_iokernel::{ControlPlane, DataplaneConfig, Dispatcher, PacketPool, control_channels};

/// Control plane housekeeping period
const CONTROL_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Parser)]
#[command(name = "mvirt-iokernel")]
#[command(about = "mvirt kernel-bypass packet dispatcher")]
struct Args {
    /// TAP device to poll
    #[arg(short, long, default_value = "iok0")]
    tap: String,

    /// Number of packet buffers in the ingress pool
    #[arg(long, default_value_t = 8191)]
    pool_size: usize,

    /// Frames received per loop iteration
    #[arg(long, default_value_t = 32)]
    rx_burst: usize,

    /// Control messages handled per loop iteration
    #[arg(long, default_value_t = 8)]
    control_burst: usize,

    /// Maximum number of registered clients
    #[arg(long, default_value_t = 128)]
    max_clients: usize,

    /// SysV key of the ingress shared memory segment
    #[arg(long, default_value_t = INGRESS_SHM_KEY)]
    shm_key: i32,

    /// Do not try hugepages for the ingress segment
    #[arg(long)]
    no_hugepages: bool,

    /// NUMA node the dispatcher polls from
    #[arg(long)]
    numa_node: Option<u32>,

    /// CPU core to pin the dataplane thread to
    #[arg(long)]
    core: Option<usize>,
}

impl Args {
    fn config(&self) -> DataplaneConfig {
        DataplaneConfig {
            pool_capacity: self.pool_size,
            rx_burst: self.rx_burst,
            control_burst: self.control_burst,
            max_clients: self.max_clients,
            shm_key: self.shm_key,
            hugepages: !self.no_hugepages,
            numa_node: self.numa_node,
            ..DataplaneConfig::default()
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mvirt_iokernel=info".parse()?))
        .init();

    let args = Args::parse();
    let config = args.config();
    config.validate().context("Invalid configuration")?;

    info!(tap = %args.tap, pool_size = config.pool_capacity, "Initializing mvirt-iokernel");

    let pool = PacketPool::create(config.pool_params()).context("Failed to create ingress packet pool")?;
    let port = TapPort::open(&args.tap)
        .with_context(|| format!("Failed to open TAP device {} (root required)", args.tap))?;
    let (control, link) = control_channels(config.control_queue_size, config.max_clients)
        .context("Failed to create control channels")?;

    let mut dispatcher = Dispatcher::new(port, pool, link, config)?;

    thread::Builder::new()
        .name("iok-control".to_string())
        .spawn(move || run_control_plane(control))
        .context("Failed to spawn control plane thread")?;

    let core = args.core;
    let dataplane = thread::Builder::new()
        .name("iok-dataplane".to_string())
        .spawn(move || {
            if let Some(core) = core {
                pin_to_core(core);
            }
            dispatcher.run();
        })
        .context("Failed to spawn dataplane thread")?;

    if dataplane.join().is_err() {
        error!("Dataplane thread panicked");
        anyhow::bail!("dataplane thread panicked");
    }
    Ok(())
}

/// Drain removal acknowledgements so released clients are freed.
fn run_control_plane(mut control: ControlPlane) {
    loop {
        for client in control.poll_removals() {
            info!(pid = client.pid(), "Client resources released");
        }
        thread::sleep(CONTROL_POLL_INTERVAL);
    }
}

fn pin_to_core(core: usize) {
    let mut set = CpuSet::new();
    if let Err(e) = set.set(core) {
        warn!(core, error = %e, "Invalid CPU core for dataplane thread");
        return;
    }
    match sched_setaffinity(Pid::from_raw(0), &set) {
        Ok(()) => info!(core, "Dataplane thread pinned"),
        Err(e) => warn!(core, error = %e, "Failed to pin dataplane thread"),
    }
}

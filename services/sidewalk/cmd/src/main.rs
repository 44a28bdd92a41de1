//! Sidewalk BLE link simulator.
//!
//! Runs an end device and a gateway link interface against a loopback
//! radio. tokio timers stand in for the RTOS timer service. The device
//! advertises and the gateway connects. Each uplink is acknowledged. The
//! run ends when the link goes down, normally after the device disconnects
//! once the configured number of messages has been sent.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;
use sid_link::{
    BleLinkInterface, ChannelTimers, ChannelTransport, LinkConfig, LinkEvent, LinkResources,
    LinkState, LinkTimer, LocalAddressRegistry, OutboundMessage, RadioFrame, SystemClock,
    TimerCommand,
};
use sid_resource::ResourceManager;
use sid_storage::{open_store, KvStore, MemoryStore};
use sid_wire::{Address, AddressType, BeaconFrame, KeyId};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::SidewalkConfig;
use logging::SidLogFormatter;

/// Command class of the simulated sensor traffic
const SENSOR_CLASS: u8 = 0x02;
const SENSOR_REPORT: u16 = 0x0001;
const SENSOR_ACK: u16 = 0x8001;

type Link = BleLinkInterface<ChannelTransport, ChannelTimers>;

/// Sidewalk BLE link simulator
#[derive(Parser, Debug)]
#[command(name = "sidewalk-link", version, about = "Sidewalk BLE link simulator")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Storage mode: memory, file
    #[arg(long)]
    storage_mode: Option<String>,

    /// Data directory for file storage
    #[arg(long)]
    storage_data_dir: Option<PathBuf>,

    /// Uplinks to send before disconnecting
    #[arg(long, default_value = "5")]
    messages: u32,

    /// Interval between uplinks
    #[arg(long, default_value = "1s")]
    interval: humantime::Duration,

    /// Delay before the gateway connects
    #[arg(long, default_value = "500ms")]
    connect_delay: humantime::Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Side {
    Device,
    Gateway,
}

impl Side {
    fn name(self) -> &'static str {
        match self {
            Side::Device => "device",
            Side::Gateway => "gateway",
        }
    }
}

struct Node {
    link: Link,
    address: Address,
    pool: Arc<ResourceManager>,
    store: Arc<dyn KvStore>,
    radio: mpsc::UnboundedReceiver<RadioFrame>,
    timers: mpsc::UnboundedReceiver<TimerCommand>,
    events: mpsc::UnboundedReceiver<LinkEvent>,
}

impl Node {
    fn new(
        config: &SidewalkConfig,
        link_config: LinkConfig,
        address: Address,
        local_address: Arc<LocalAddressRegistry>,
        store: Arc<dyn KvStore>,
    ) -> anyhow::Result<Self> {
        let pool = Arc::new(ResourceManager::new(config.pool)?);
        let (transport, radio) = ChannelTransport::new();
        let (timer_service, timers) = ChannelTimers::new();

        let (mut link, events) = BleLinkInterface::new(
            link_config,
            transport,
            timer_service,
            LinkResources {
                pool: pool.clone(),
                local_address,
                store: store.clone(),
                clock: Arc::new(SystemClock),
            },
        )?;
        link.set_key(KeyId::Network, config.network_key)?;
        link.set_key(KeyId::Pan, config.network_key)?;
        link.set_key(KeyId::App, config.app_key)?;

        Ok(Self {
            link,
            address,
            pool,
            store,
            radio,
            timers,
            events,
        })
    }
}

/// Everything the driver loop reacts to
enum Input {
    Radio(Side, RadioFrame),
    Timer(Side, TimerCommand),
    Expired(Side, LinkTimer, u64),
    Event(Side, LinkEvent),
    Connect,
    Tick,
    Shutdown,
}

struct Simulator {
    device: Node,
    gateway: Node,
    generations: HashMap<(Side, LinkTimer), u64>,
    expired: mpsc::UnboundedSender<(Side, LinkTimer, u64)>,
    messages: u32,
    sent: u32,
    acked: u32,
}

impl Simulator {
    fn node(&mut self, side: Side) -> &mut Node {
        match side {
            Side::Device => &mut self.device,
            Side::Gateway => &mut self.gateway,
        }
    }

    fn peer(&mut self, side: Side) -> &mut Node {
        match side {
            Side::Device => &mut self.gateway,
            Side::Gateway => &mut self.device,
        }
    }

    /// Returns false once the run is over
    fn handle(&mut self, input: Input) -> anyhow::Result<bool> {
        match input {
            Input::Radio(side, frame) => return self.on_radio(side, frame),
            Input::Timer(side, command) => self.on_timer_command(side, command),
            Input::Expired(side, timer, generation) => {
                if self.generations.get(&(side, timer)) == Some(&generation) {
                    component_debug!(side.name(), "{:?} timer expired", timer);
                    if let Err(e) = self.node(side).link.on_timer_expired(timer) {
                        component_warn!(side.name(), "Timer {:?} handling failed: {}", timer, e);
                    }
                }
            }
            Input::Event(side, event) => match event {
                LinkEvent::Error(kind) => component_warn!(side.name(), "Link error: {:?}", kind),
                other => component_info!(side.name(), "{:?}", other),
            },
            Input::Connect => self.connect()?,
            Input::Tick => self.on_tick()?,
            Input::Shutdown => {
                info!("Shutdown requested");
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn on_timer_command(&mut self, side: Side, command: TimerCommand) {
        match command {
            TimerCommand::Arm(timer, after) => {
                let generation = self.generations.entry((side, timer)).or_default();
                *generation += 1;
                let generation = *generation;
                let expired = self.expired.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    let _ = expired.send((side, timer, generation));
                });
            }
            TimerCommand::Disarm(timer) => {
                *self.generations.entry((side, timer)).or_default() += 1;
            }
        }
    }

    fn connect(&mut self) -> anyhow::Result<()> {
        let (device_addr, gateway_addr) = (self.device.address, self.gateway.address);

        self.device.link.connect_initiated()?;
        self.gateway.link.connect_initiated()?;
        self.device.link.on_connection_event(true, Some(gateway_addr))?;
        self.gateway.link.on_connection_event(true, Some(device_addr))?;
        Ok(())
    }

    fn on_radio(&mut self, side: Side, frame: RadioFrame) -> anyhow::Result<bool> {
        match frame {
            RadioFrame::Data(data) => self.deliver(side, data)?,
            RadioFrame::AdvData(data) => match BeaconFrame::decode(&data) {
                Ok(beacon) => component_debug!(
                    side.name(),
                    "Beacon: app {:#04x}, {:?}, {:?}",
                    beacon.application_id,
                    beacon.state.device_mode,
                    beacon.tx_id
                ),
                Err(e) => component_warn!(side.name(), "Undecodable beacon: {}", e),
            },
            RadioFrame::AdvStarted(interval) => {
                component_debug!(side.name(), "Advertising every {:?}", interval)
            }
            RadioFrame::AdvStopped => component_debug!(side.name(), "Advertising stopped"),
            RadioFrame::Disconnect => {
                for side in [Side::Device, Side::Gateway] {
                    if let Err(e) = self.node(side).link.on_connection_event(false, None) {
                        component_debug!(side.name(), "Disconnect ignored: {}", e);
                    }
                }
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn deliver(&mut self, from: Side, data: Bytes) -> anyhow::Result<()> {
        let to = match from {
            Side::Device => Side::Gateway,
            Side::Gateway => Side::Device,
        };
        let mut acked = 0;
        let node = self.peer(from);
        if let Err(e) = node.link.on_receive(data) {
            component_warn!(to.name(), "Frame dropped: {}", e);
            return Ok(());
        }

        while let Some(msg) = node.link.recv_message()? {
            component_info!(
                to.name(),
                "Received cmd {:#04x}/{:#06x} from {:02x?}: {:?}",
                msg.cmd_class,
                msg.cmd_id,
                msg.src.as_raw(),
                String::from_utf8_lossy(&msg.payload)
            );

            if to == Side::Gateway && msg.cmd_id == SENSOR_REPORT {
                let ack = OutboundMessage::new(msg.src, SENSOR_CLASS, SENSOR_ACK, msg.payload.clone());
                node.link.send(ack)?;
            } else if msg.cmd_id == SENSOR_ACK {
                acked += 1;
            }
        }
        self.acked += acked;
        Ok(())
    }

    fn on_tick(&mut self) -> anyhow::Result<()> {
        if self.device.link.state() != LinkState::Connected {
            return Ok(());
        }

        if self.sent == self.messages {
            info!("All {} uplinks sent, disconnecting", self.messages);
            self.device.link.disconnect()?;
            return Ok(());
        }

        let payload = format!("temp={}.{}", 20 + self.sent % 5, self.sent);
        let report = OutboundMessage::new(
            self.gateway.address,
            SENSOR_CLASS,
            SENSOR_REPORT,
            payload.into_bytes(),
        );
        let seq = self.device.link.send(report)?;
        self.sent += 1;
        component_debug!("device", "Uplink {} sent with seqn {}", self.sent, seq.ll_seqn);
        Ok(())
    }

    fn shutdown(&self) {
        for (side, node) in [(Side::Device, &self.device), (Side::Gateway, &self.gateway)] {
            component_info!(side.name(), "Link stats: {:?}", node.link.stats());
            component_info!(side.name(), "Pool stats: {:?}", node.pool.stats());
            if let Err(e) = node.store.flush() {
                component_warn!(side.name(), "Failed to flush store: {}", e);
            }
        }
        info!("Uplinks sent {}, acknowledged {}", self.sent, self.acked);
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("sidewalk_link={}", args.log_level).parse()?)
        .add_directive(format!("sid_link={}", args.log_level).parse()?)
        .add_directive(format!("sid_resource={}", args.log_level).parse()?)
        .add_directive(format!("sid_storage={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .event_format(SidLogFormatter::new("sidewalk"))
        .init();

    info!("Starting Sidewalk link simulator v{}", env!("CARGO_PKG_VERSION"));

    let mut config = SidewalkConfig::load_from_file(&args.config)?;
    if let Some(dir) = &args.storage_data_dir {
        config.apply_value("storage.data_dir", &dir.to_string_lossy())?;
    }
    if let Some(mode) = &args.storage_mode {
        config.apply_value("storage.mode", mode)?;
    }

    let device_addr = Address::new(AddressType::Device, &config.device_id)?;
    let gateway_addr = Address::new(AddressType::Device, &config.gateway_id)?;

    // The device persists its records, the gateway keeps them in memory
    let device_store = open_store(config.storage.clone())?;
    let device_registry = sid_link::init_global(device_store.clone());
    device_registry.set_local(Some(&device_addr), true)?;

    let gateway_store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let gateway_registry = Arc::new(LocalAddressRegistry::new(gateway_store.clone()));
    gateway_registry.set_local(Some(&gateway_addr), false)?;

    let link_config = config.link_config();
    let (expired, mut expired_rx) = mpsc::unbounded_channel();
    let mut sim = Simulator {
        device: Node::new(&config, link_config.clone(), device_addr, device_registry, device_store)?,
        gateway: Node::new(&config, link_config, gateway_addr, gateway_registry, gateway_store)?,
        generations: HashMap::new(),
        expired,
        messages: args.messages,
        sent: 0,
        acked: 0,
    };

    sim.device.link.start_advertising()?;

    let connect = tokio::time::sleep(args.connect_delay.into());
    tokio::pin!(connect);
    let mut connect_pending = true;
    let mut uplink = tokio::time::interval(args.interval.into());

    loop {
        let input = tokio::select! {
            Some(frame) = sim.device.radio.recv() => Input::Radio(Side::Device, frame),
            Some(frame) = sim.gateway.radio.recv() => Input::Radio(Side::Gateway, frame),
            Some(command) = sim.device.timers.recv() => Input::Timer(Side::Device, command),
            Some(command) = sim.gateway.timers.recv() => Input::Timer(Side::Gateway, command),
            Some(event) = sim.device.events.recv() => Input::Event(Side::Device, event),
            Some(event) = sim.gateway.events.recv() => Input::Event(Side::Gateway, event),
            Some((side, timer, generation)) = expired_rx.recv() => Input::Expired(side, timer, generation),
            _ = &mut connect, if connect_pending => {
                connect_pending = false;
                Input::Connect
            }
            _ = uplink.tick() => Input::Tick,
            _ = tokio::signal::ctrl_c() => Input::Shutdown,
        };

        match sim.handle(input) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => warn!("Simulation step failed: {:#}", e),
        }
    }

    sim.shutdown();
    sid_link::deinit_global();
    debug!("Simulator stopped");
    Ok(())
}

//! BLE link interface: connection state, advertising, TX/RX sequencing and
//! dispatch through the crypt-mask table.
//!
//! The interface owns no threads. The radio and timer service drive it by
//! calling [`BleLinkInterface::on_receive`], [`BleLinkInterface::on_connection_event`]
//! and [`BleLinkInterface::on_timer_expired`]; everything it wants done goes
//! out through the [`Transport`] and [`TimerService`] seams.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use critical_section::Mutex;
use sid_resource::{Message, Priority, ResourceError, ResourceManager};
use sid_storage::KvStore;
use sid_wire::crypt_mask::{self, CryptMaskHandle, CryptStrategy};
use sid_wire::{
    address_match, Address, BatteryLevel, BeaconFrame, BeaconState, CryptParams, DataPdu,
    DeviceMode, KeyId, PduHeader, TxId, TxIdFormat, KEY_SIZE, MAX_BEACON_PAYLOAD, MAX_PDU_SIZE,
    MAX_TX_ID_SIZE,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::LinkConfig;
use crate::dedicated::{DedicatedLink, DedicatedLinkParams, TempKeyType};
use crate::keys::{KeyStore, KeyView};
use crate::local_address::LocalAddressRegistry;
use crate::replay::{CounterLayer, ReplayGuard, RxSequence};
use crate::sequencer::{TxSequence, TxSequencer};
use crate::state::{LinkInput, LinkState};
use crate::stats::{BleErrorType, LinkEvent, LinkStats};
use crate::transport::{Clock, LinkTimer, TimerService, Transport};
use crate::LinkError;

/// Shared collaborators of a link interface
#[derive(Clone)]
pub struct LinkResources {
    /// Message pool for TX and RX buffers
    pub pool: Arc<ResourceManager>,
    /// Local address source
    pub local_address: Arc<LocalAddressRegistry>,
    /// Store for persisted receive counters
    pub store: Arc<dyn KvStore>,
    /// Wall clock for time-based crypt masks
    pub clock: Arc<dyn Clock>,
}

/// Application message to send over the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Destination
    pub dst: Address,
    /// Command class
    pub cmd_class: u8,
    /// Command id
    pub cmd_id: u16,
    /// Security requirement; the configured default when unset
    pub crypt_mask: Option<u8>,
    /// Pool priority; the configured TX priority when unset
    pub priority: Option<Priority>,
    /// Application payload
    pub payload: Bytes,
}

impl OutboundMessage {
    /// Message with the default crypt mask and priority
    pub fn new(dst: Address, cmd_class: u8, cmd_id: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            dst,
            cmd_class,
            cmd_id,
            crypt_mask: None,
            priority: None,
            payload: payload.into(),
        }
    }

    /// Use `mask` instead of the default
    pub fn with_crypt_mask(mut self, mask: u8) -> Self {
        self.crypt_mask = Some(mask);
        self
    }

    /// Allocate at `priority`
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Message delivered to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Sender
    pub src: Address,
    /// Destination as carried in the frame
    pub dst: Address,
    /// Command class
    pub cmd_class: u8,
    /// Command id
    pub cmd_id: u16,
    /// Crypt mask the frame used
    pub crypt_mask: u8,
    /// Sender link sequence
    pub ll_seqn: u32,
    /// Decrypted payload
    pub payload: Bytes,
}

struct PendingInbound {
    header: PduHeader,
    msg: Message,
}

type InboundQueue = Arc<Mutex<RefCell<VecDeque<PendingInbound>>>>;

/// Free the oldest queued inbound message with the lowest priority below `priority`
fn evict_lower_priority(
    queue: &InboundQueue,
    pool: &ResourceManager,
    size: usize,
    priority: Priority,
) {
    let victim = critical_section::with(|cs| {
        let mut queue = queue.borrow_ref_mut(cs);
        let index = queue
            .iter()
            .enumerate()
            .filter(|(_, pending)| pending.msg.priority() < priority)
            .min_by_key(|(_, pending)| pending.msg.priority())
            .map(|(index, _)| index)?;
        queue.remove(index)
    });

    match victim {
        Some(victim) => {
            warn!(
                "Evicting queued {:?} message from {:02x?} for a {} byte {:?} request",
                victim.msg.priority(),
                victim.header.src.as_raw(),
                size,
                priority
            );
            if let Err(e) = pool.free(victim.msg) {
                error!("Failed to free evicted message: {}", e);
            }
        }
        None => debug!("Nothing to evict below {:?}", priority),
    }
}

/// BLE network interface
pub struct BleLinkInterface<T: Transport, S: TimerService> {
    config: LinkConfig,
    transport: T,
    timers: S,
    state: LinkState,
    sequencer: TxSequencer,
    keys: KeyStore,
    dedicated: DedicatedLink,
    replay: ReplayGuard,
    pool: Arc<ResourceManager>,
    local_address: Arc<LocalAddressRegistry>,
    clock: Arc<dyn Clock>,
    events: mpsc::UnboundedSender<LinkEvent>,
    stats: LinkStats,
    inbound: InboundQueue,
    beacon_state: BeaconState,
    beacon_payload: Bytes,
    rotation: u8,
    remote: Option<Address>,
}

impl<T: Transport, S: TimerService> BleLinkInterface<T, S> {
    /// Create a disconnected interface and the receiver for its events.
    ///
    /// The interface installs itself as the pool's no-memory callback, so
    /// each interface should own its pool.
    pub fn new(
        config: LinkConfig,
        transport: T,
        timers: S,
        resources: LinkResources,
    ) -> Result<(Self, mpsc::UnboundedReceiver<LinkEvent>), LinkError> {
        let default_handle = crypt_mask::lookup(config.default_crypt_mask)?;
        check_nonce_source(default_handle, config.tx_id_format)?;
        if config.rx_queue_depth == 0 {
            return Err(LinkError::InvalidArgs("rx queue depth must be positive"));
        }

        let (events, events_rx) = mpsc::unbounded_channel();

        let inbound: InboundQueue = Arc::new(Mutex::new(RefCell::new(VecDeque::new())));
        let queue = inbound.clone();
        resources
            .pool
            .set_no_memory_callback(move |pool, size, priority| {
                evict_lower_priority(&queue, pool, size, priority)
            });

        info!(
            "Link interface created: app id {:#04x}, tx id {:?}, default mask {:#04x}, mtu {}",
            config.application_id, config.tx_id_format, config.default_crypt_mask, config.mtu
        );

        let link = Self {
            sequencer: TxSequencer::new(config.tx_id_format),
            replay: ReplayGuard::new(resources.store, config.time_window),
            beacon_state: BeaconState {
                device_type: config.device_type,
                ..BeaconState::default()
            },
            config,
            transport,
            timers,
            state: LinkState::Disconnected,
            keys: KeyStore::new(),
            dedicated: DedicatedLink::new(),
            pool: resources.pool,
            local_address: resources.local_address,
            clock: resources.clock,
            events,
            stats: LinkStats::default(),
            inbound,
            beacon_payload: Bytes::new(),
            rotation: 0,
            remote: None,
        };
        Ok((link, events_rx))
    }

    /// Current link state
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Link counters
    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    /// Configuration in force
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Largest PDU handed to the radio
    pub fn mtu(&self) -> usize {
        self.config.mtu.min(MAX_PDU_SIZE)
    }

    /// Connected peer, if any
    pub fn remote(&self) -> Option<&Address> {
        self.remote.as_ref()
    }

    /// Transmit sequencing state
    pub fn sequencer(&self) -> &TxSequencer {
        &self.sequencer
    }

    /// Dedicated link state
    pub fn dedicated(&self) -> &DedicatedLink {
        &self.dedicated
    }

    /// Inbound messages waiting for [`recv_message`](Self::recv_message)
    pub fn pending_messages(&self) -> usize {
        critical_section::with(|cs| self.inbound.borrow_ref(cs).len())
    }

    fn emit(&self, event: LinkEvent) {
        if self.events.send(event).is_err() {
            debug!("Link event receiver dropped");
        }
    }

    fn enter(&mut self, to: LinkState) {
        let from = self.state;
        self.state = to;
        info!("Link state {:?} -> {:?}", from, to);
        self.emit(LinkEvent::StateChanged { from, to });
    }

    fn release(&self, msg: Message) {
        if let Err(e) = self.pool.free(msg) {
            error!("Failed to release message: {}", e);
        }
    }

    // ---- advertising ----

    fn beacon(&self) -> Result<Bytes, LinkError> {
        let tx_id = match self.config.tx_id_format {
            TxIdFormat::TimeSync => TxId::TimeSync {
                ll_seqn: self.sequencer.ll_seqn(),
                epoch_lo: self.clock.now_secs() as u16,
            },
            TxIdFormat::Counter => TxId::Counter {
                counter: self.sequencer.counter(),
                rotation: self.rotation,
            },
            TxIdFormat::Smsn => {
                let mut id = [0u8; MAX_TX_ID_SIZE];
                if let Ok(local) = self.local_address.get_local() {
                    let raw = local.as_raw();
                    let n = raw.len().min(MAX_TX_ID_SIZE);
                    id[..n].copy_from_slice(&raw[..n]);
                }
                TxId::Smsn { id }
            }
        };

        let frame = BeaconFrame::new(self.config.application_id, self.beacon_state, tx_id)
            .with_payload(self.beacon_payload.clone());
        Ok(frame.encode()?)
    }

    fn push_adv_data(&mut self) -> Result<(), LinkError> {
        let data = self.beacon()?;
        self.transport.set_adv_data(&data)?;
        Ok(())
    }

    fn refresh_adv_data(&mut self) -> Result<(), LinkError> {
        if self.state == LinkState::Advertising {
            self.push_adv_data()?;
        }
        Ok(())
    }

    fn disarm_adv_timers(&mut self) {
        self.timers.disarm(LinkTimer::FastAdv);
        self.timers.disarm(LinkTimer::AdvRotation);
    }

    fn arm_inactivity(&mut self) {
        if self.state.is_connected() && !self.config.disable_inactivity_timer {
            self.timers
                .arm(LinkTimer::Inactivity, self.config.inactivity_timeout);
        }
    }

    /// Put the beacon on air at the fast interval
    pub fn start_advertising(&mut self) -> Result<(), LinkError> {
        let to = self.state.next(LinkInput::StartAdvertising)?;

        self.push_adv_data()?;
        self.transport.start_adv(self.config.fast_adv_interval)?;
        self.timers
            .arm(LinkTimer::FastAdv, self.config.fast_adv_timeout);
        self.timers
            .arm(LinkTimer::AdvRotation, self.config.adv_rotation_timeout);

        self.enter(to);
        Ok(())
    }

    /// Take the beacon off air
    pub fn stop_advertising(&mut self) -> Result<(), LinkError> {
        let to = self.state.next(LinkInput::StopAdvertising)?;

        self.transport.stop_adv()?;
        self.disarm_adv_timers();

        self.enter(to);
        Ok(())
    }

    /// Replace the beacon payload, updating the air data while advertising
    pub fn set_beacon_payload(&mut self, payload: impl Into<Bytes>) -> Result<(), LinkError> {
        let payload = payload.into();
        if payload.len() > MAX_BEACON_PAYLOAD {
            return Err(LinkError::InvalidArgs("beacon payload too large"));
        }

        self.beacon_payload = payload;
        self.refresh_adv_data()
    }

    /// Report a new battery level in the beacon
    pub fn set_battery_level(&mut self, level: BatteryLevel) -> Result<(), LinkError> {
        self.beacon_state.battery_level = level;
        self.refresh_adv_data()
    }

    /// Report a new device mode in the beacon
    pub fn set_device_mode(&mut self, mode: DeviceMode) -> Result<(), LinkError> {
        self.beacon_state.device_mode = mode;
        self.refresh_adv_data()
    }

    // ---- connection ----

    /// The radio started connecting to a central
    pub fn connect_initiated(&mut self) -> Result<(), LinkError> {
        let to = self.state.next(LinkInput::ConnectInitiated)?;
        self.disarm_adv_timers();
        self.enter(to);
        Ok(())
    }

    /// The radio reported the link up (`connected`) or down
    pub fn on_connection_event(
        &mut self,
        connected: bool,
        peer: Option<Address>,
    ) -> Result<(), LinkError> {
        let from = self.state;

        if connected {
            let to = from.next(LinkInput::Connected)?;
            self.disarm_adv_timers();
            self.remote = peer;
            self.stats.connection_success += 1;
            self.enter(to);
            self.arm_inactivity();
        } else {
            let to = from.next(LinkInput::Disconnected)?;
            if from == LinkState::Connecting {
                self.stats.connection_fail += 1;
                warn!("Connection attempt failed");
            }
            self.timers.disarm(LinkTimer::Inactivity);
            self.remote = None;
            if self.dedicated.params().is_some() {
                self.dedicated.terminate();
            }
            self.enter(to);
        }
        Ok(())
    }

    /// Ask the radio to drop the connection
    pub fn disconnect(&mut self) -> Result<(), LinkError> {
        let to = self.state.next(LinkInput::DisconnectRequested)?;

        self.transport.disconnect()?;
        self.timers.disarm(LinkTimer::Inactivity);

        self.enter(to);
        Ok(())
    }

    /// Keep idle connections open
    pub fn set_disable_inactivity_timer(&mut self, disable: bool) {
        self.config.disable_inactivity_timer = disable;
        if disable {
            self.timers.disarm(LinkTimer::Inactivity);
        } else {
            self.arm_inactivity();
        }
    }

    /// Handle an expired timer
    pub fn on_timer_expired(&mut self, timer: LinkTimer) -> Result<(), LinkError> {
        match timer {
            LinkTimer::AdvRotation => {
                if self.state != LinkState::Advertising {
                    debug!("Adv rotation timer ignored in {:?}", self.state);
                    return Ok(());
                }

                self.rotation = self.rotation.wrapping_add(1);
                self.timers
                    .arm(LinkTimer::AdvRotation, self.config.adv_rotation_timeout);
                self.push_adv_data()?;
                self.stats.adv_rotations += 1;
                debug!("Beacon rotated to {}", self.rotation);
                self.emit(LinkEvent::AdvertisementRotated {
                    rotation: self.rotation,
                });
            }
            LinkTimer::FastAdv => {
                if self.state == LinkState::Advertising {
                    debug!("Fast advertising window over");
                    self.transport.start_adv(self.config.slow_adv_interval)?;
                }
            }
            LinkTimer::Inactivity => {
                if !self.state.is_connected() || self.config.disable_inactivity_timer {
                    return Ok(());
                }

                let to = self.state.next(LinkInput::InactivityTimeout)?;
                self.transport.disconnect()?;
                self.stats.inactivity_disconnects += 1;
                info!(
                    "No traffic for {:?}, disconnecting",
                    self.config.inactivity_timeout
                );
                self.enter(to);
            }
        }
        Ok(())
    }

    // ---- keys ----

    /// Install a long-term key
    pub fn set_key(&mut self, id: KeyId, key: [u8; KEY_SIZE]) -> Result<(), LinkError> {
        if !self.keys.set_key(id, key) {
            return Err(LinkError::InvalidArgs("not a long-term key id"));
        }
        Ok(())
    }

    /// Request a dedicated link
    pub fn set_dedicated_link_params(
        &mut self,
        params: DedicatedLinkParams,
    ) -> Result<(), LinkError> {
        self.dedicated.set_params(params)
    }

    /// Install a dedicated-link temporary key
    pub fn set_temp_key(&mut self, kind: TempKeyType, key: [u8; KEY_SIZE]) -> Result<(), LinkError> {
        self.dedicated.set_temp_key(kind, key)
    }

    /// Drop the dedicated link
    pub fn terminate_dedicated_link(&mut self) {
        self.dedicated.terminate();
    }

    // ---- data path ----

    /// Seal and send an application message, returning the sequence it used
    pub fn send(&mut self, msg: OutboundMessage) -> Result<TxSequence, LinkError> {
        if !self.state.is_connected() {
            return Err(LinkError::NotConnected);
        }

        let mask = msg.crypt_mask.unwrap_or(self.config.default_crypt_mask);
        let handle = crypt_mask::lookup(mask)?;
        check_nonce_source(handle, self.config.tx_id_format)?;
        let src = self.local_address.get_local()?;

        let seq = self.sequencer.next();
        let nonce_counter = if crypt_mask::is_counter_set(mask) {
            seq.counter
        } else {
            self.clock.now_secs()
        };
        let header = PduHeader {
            crypt_mask: mask,
            ll_seqn: seq.ll_seqn,
            nonce_counter,
            cmd_class: msg.cmd_class,
            cmd_id: msg.cmd_id,
            dst: msg.dst,
            src,
        };
        let mut header_bytes = BytesMut::with_capacity(header.encoded_len());
        header.encode(&mut header_bytes)?;

        let total = header_bytes.len() + msg.payload.len() + handle.overhead();
        if total > self.mtu() {
            self.stats.tx_fail += 1;
            warn!("Message of {} bytes exceeds mtu {}", total, self.mtu());
            return Err(LinkError::InvalidArgs("message exceeds mtu"));
        }

        let priority = msg.priority.unwrap_or(self.config.tx_priority);
        let block = match self.pool.get_with_priority(total, priority) {
            Ok(block) => block,
            Err(e) => {
                self.stats.tx_fail += 1;
                return Err(e.into());
            }
        };

        let frame = match self.seal_into(handle, &header, &header_bytes, &msg.payload, &block) {
            Ok(()) => self.pool.to_vec(&block).map_err(LinkError::from),
            Err(e) => Err(e),
        };
        self.release(block);

        let sent = frame.and_then(|frame| Ok(self.transport.send(&frame)?));
        if let Err(e) = sent {
            self.stats.tx_fail += 1;
            error!("Send of cmd {:#04x}/{:#06x} failed: {}", msg.cmd_class, msg.cmd_id, e);
            return Err(e);
        }

        self.stats.tx += 1;
        debug!(
            "Sent cmd {:#04x}/{:#06x} to {:02x?}: {} bytes, mask {:#04x}, seqn {}, counter {}",
            msg.cmd_class,
            msg.cmd_id,
            msg.dst.as_raw(),
            total,
            mask,
            seq.ll_seqn,
            seq.counter
        );
        self.arm_inactivity();
        Ok(seq)
    }

    fn seal_into(
        &self,
        handle: &CryptMaskHandle,
        header: &PduHeader,
        header_bytes: &[u8],
        payload: &[u8],
        block: &Message,
    ) -> Result<(), LinkError> {
        let keys = KeyView::new(&self.keys, &self.dedicated);
        let mut params = CryptParams::new(header_bytes, &header.src, &header.dst)
            .with_sequence(header.ll_seqn, header.nonce_counter)
            .with_app_seqn(header.ll_seqn)
            .with_command(header.cmd_class, header.cmd_id)
            .with_app_offset(self.config.app_offset);

        let header_len = header_bytes.len();
        let written = self.pool.with_data_mut(block, |buf| {
            buf[..header_len].copy_from_slice(header_bytes);
            handle.encrypt(&keys, &mut params, payload, &mut buf[header_len..])
        })??;
        debug_assert_eq!(header_len + written, block.len());
        Ok(())
    }

    fn open_into(
        &self,
        handle: &CryptMaskHandle,
        pdu: &DataPdu,
        block: &Message,
    ) -> Result<usize, LinkError> {
        let header = &pdu.header;
        let keys = KeyView::new(&self.keys, &self.dedicated);
        let mut params = CryptParams::new(&pdu.header_bytes, &header.src, &header.dst)
            .with_sequence(header.ll_seqn, header.nonce_counter)
            .with_app_seqn(header.ll_seqn)
            .with_command(header.cmd_class, header.cmd_id)
            .with_app_offset(self.config.app_offset);

        let len = self.pool.with_data_mut(block, |buf| {
            handle.decrypt(&keys, &mut params, &pdu.body, buf)
        })??;
        Ok(len)
    }

    fn drop_invalid(&mut self, error: BleErrorType) {
        match error {
            BleErrorType::Replay => self.stats.duplicates += 1,
            _ => self.stats.rx_fail += 1,
        }
        self.emit(LinkEvent::Error(error));
    }

    /// Handle a frame from the radio.
    ///
    /// Rejected frames are counted and dropped; the returned error says why.
    pub fn on_receive(&mut self, frame: Bytes) -> Result<(), LinkError> {
        if !self.state.is_connected() {
            self.stats.rx_fail += 1;
            debug!("Frame dropped in {:?}", self.state);
            return Err(LinkError::NotConnected);
        }

        let pdu = match DataPdu::decode(frame) {
            Ok(pdu) => pdu,
            Err(e) => {
                self.stats.malformed += 1;
                warn!("Dropping malformed frame: {}", e);
                return Err(e.into());
            }
        };
        let header = pdu.header;

        // Without a local address every destination is accepted
        match self.local_address.get_local() {
            Ok(local) if !address_match(&header.dst, &local) => {
                self.stats.rx_fail += 1;
                debug!("Frame for {:02x?} is not for us", header.dst.as_raw());
                return Err(LinkError::NotFound("destination"));
            }
            Ok(_) | Err(LinkError::NotFound(_)) => {}
            Err(e) => {
                self.stats.rx_fail += 1;
                error!("Local address unavailable: {}", e);
                return Err(e);
            }
        }

        let handle = match crypt_mask::lookup(header.crypt_mask) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Dropping frame with unknown crypt mask {:#04x}", header.crypt_mask);
                self.drop_invalid(BleErrorType::DataInvalid);
                return Err(e.into());
            }
        };

        if handle.strategy != CryptStrategy::Plain && !crypt_mask::is_counter_set(handle.mask) {
            if let Err(e) = self.replay.check_time(header.nonce_counter, self.clock.now_secs()) {
                self.drop_invalid(BleErrorType::Replay);
                return Err(e);
            }
        }

        let mut block = match self.pool.get_with_offset_and_priority(
            pdu.body.len(),
            0,
            self.config.rx_priority,
        ) {
            Ok(block) => block,
            Err(e) => {
                self.drop_invalid(BleErrorType::ResourceExhausted);
                return Err(e.into());
            }
        };

        let plain_len = match self.open_into(handle, &pdu, &block) {
            Ok(len) => len,
            Err(e) => {
                self.release(block);
                warn!(
                    "Dropping frame from {:02x?}: {}",
                    header.src.as_raw(),
                    e
                );
                self.drop_invalid(BleErrorType::DataInvalid);
                return Err(e);
            }
        };
        if let Err(e) = self.pool.truncate(&mut block, plain_len) {
            self.release(block);
            return Err(e.into());
        }

        let layer = if handle.save_explicit_counter() {
            CounterLayer::App
        } else {
            CounterLayer::Link
        };
        let rx_seq = RxSequence {
            counter: header.nonce_counter,
            ll_seqn: header.ll_seqn,
        };
        if handle.check_replay() {
            if let Err(e) = self.replay.check(&header.src, layer, rx_seq) {
                self.release(block);
                let kind = match e {
                    LinkError::ReplayDetected { .. } => BleErrorType::Replay,
                    _ => BleErrorType::DataInvalid,
                };
                self.drop_invalid(kind);
                return Err(e);
            }
        }
        if handle.save_counter() || handle.save_explicit_counter() {
            if let Err(e) =
                self.replay
                    .accept(&header.src, layer, rx_seq, handle.save_counter_online())
            {
                error!("Failed to save receive counter: {}", e);
            }
        }

        let depth = self.config.rx_queue_depth;
        let queued = critical_section::with(|cs| {
            let mut queue = self.inbound.borrow_ref_mut(cs);
            if queue.len() >= depth {
                return Err(block);
            }
            queue.push_back(PendingInbound { header, msg: block });
            Ok(())
        });
        if let Err(block) = queued {
            self.release(block);
            warn!("Inbound queue full, dropping message");
            self.drop_invalid(BleErrorType::ResourceExhausted);
            return Err(ResourceError::OutOfMemory { size: plain_len }.into());
        }

        self.stats.rx += 1;
        debug!(
            "Received cmd {:#04x}/{:#06x} from {:02x?}: {} bytes",
            header.cmd_class,
            header.cmd_id,
            header.src.as_raw(),
            plain_len
        );
        self.emit(LinkEvent::MessageReceived {
            src: header.src,
            cmd_class: header.cmd_class,
            cmd_id: header.cmd_id,
            len: plain_len,
        });
        self.arm_inactivity();
        Ok(())
    }

    /// Take the oldest inbound message, releasing its buffer
    pub fn recv_message(&mut self) -> Result<Option<InboundMessage>, LinkError> {
        let Some(pending) =
            critical_section::with(|cs| self.inbound.borrow_ref_mut(cs).pop_front())
        else {
            return Ok(None);
        };

        let payload = self.pool.to_vec(&pending.msg);
        self.pool.free(pending.msg).map_err(ResourceError::from)?;
        let header = pending.header;

        Ok(Some(InboundMessage {
            src: header.src,
            dst: header.dst,
            cmd_class: header.cmd_class,
            cmd_id: header.cmd_id,
            crypt_mask: header.crypt_mask,
            ll_seqn: header.ll_seqn,
            payload: Bytes::from(payload?),
        }))
    }
}

impl<T: Transport, S: TimerService> Drop for BleLinkInterface<T, S> {
    fn drop(&mut self) {
        self.pool.clear_no_memory_callback();
        let pending: Vec<PendingInbound> =
            critical_section::with(|cs| self.inbound.borrow_ref_mut(cs).drain(..).collect());
        for entry in pending {
            self.release(entry.msg);
        }
    }
}

/// Time-based masks put the clock in the nonce, so the link sequence has to
/// advance per message to keep nonces unique within a second.
fn check_nonce_source(handle: &CryptMaskHandle, format: TxIdFormat) -> Result<(), LinkError> {
    if handle.strategy != CryptStrategy::Plain
        && !crypt_mask::is_counter_set(handle.mask)
        && format == TxIdFormat::Counter
    {
        return Err(LinkError::InvalidArgs(
            "time-based crypt mask needs a link sequence tx id",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedicated::DedicatedRole;
    use crate::transport::{
        ChannelTimers, ChannelTransport, FixedClock, RadioFrame, TimerCommand,
    };
    use sid_resource::ResourceManagerConfig;
    use sid_storage::{MemoryStore, RecordKey, StorageError};
    use sid_wire::crypt_mask::{NW_APP_WAN_CNT_AUTH, NW_WAN_TIME_AUTH, PLAIN};
    use sid_wire::{AddressType, WireError};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    const NOW: u32 = 1_700_000_000;

    struct Harness {
        link: BleLinkInterface<ChannelTransport, ChannelTimers>,
        radio: UnboundedReceiver<RadioFrame>,
        timers: UnboundedReceiver<TimerCommand>,
        events: UnboundedReceiver<LinkEvent>,
        pool: Arc<ResourceManager>,
    }

    impl Harness {
        fn radio(&mut self) -> Vec<RadioFrame> {
            std::iter::from_fn(|| self.radio.try_recv().ok()).collect()
        }

        fn data_frames(&mut self) -> Vec<Bytes> {
            self.radio()
                .into_iter()
                .filter_map(|frame| match frame {
                    RadioFrame::Data(data) => Some(data),
                    _ => None,
                })
                .collect()
        }

        fn timers(&mut self) -> Vec<TimerCommand> {
            std::iter::from_fn(|| self.timers.try_recv().ok()).collect()
        }

        fn events(&mut self) -> Vec<LinkEvent> {
            std::iter::from_fn(|| self.events.try_recv().ok()).collect()
        }

        fn connect(&mut self) {
            self.link.start_advertising().unwrap();
            self.link.on_connection_event(true, Some(device(0xEE))).unwrap();
            self.radio();
            self.timers();
            self.events();
        }

        fn send(&mut self, msg: OutboundMessage) -> Bytes {
            self.link.send(msg).unwrap();
            let mut frames = self.data_frames();
            assert_eq!(frames.len(), 1);
            frames.remove(0)
        }
    }

    fn device(last: u8) -> Address {
        Address::new(AddressType::Device, &[0xA0, 0x00, 0x00, 0x10, last]).unwrap()
    }

    fn harness_with(config: LinkConfig, local: Address, blocks: u16, now: u32) -> Harness {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let registry = Arc::new(LocalAddressRegistry::new(store.clone()));
        registry.set_local(Some(&local), false).unwrap();
        harness_on(config, store, registry, blocks, now)
    }

    fn harness_on(
        config: LinkConfig,
        store: Arc<dyn KvStore>,
        registry: Arc<LocalAddressRegistry>,
        blocks: u16,
        now: u32,
    ) -> Harness {
        let pool = Arc::new(
            ResourceManager::new(ResourceManagerConfig {
                block_count: blocks,
                ..ResourceManagerConfig::default()
            })
            .unwrap(),
        );

        let (transport, radio) = ChannelTransport::new();
        let (timer_service, timers) = ChannelTimers::new();
        let (mut link, events) = BleLinkInterface::new(
            config,
            transport,
            timer_service,
            LinkResources {
                pool: pool.clone(),
                local_address: registry,
                store,
                clock: Arc::new(FixedClock(now)),
            },
        )
        .unwrap();

        link.set_key(KeyId::Network, [0x11; KEY_SIZE]).unwrap();
        link.set_key(KeyId::Pan, [0x22; KEY_SIZE]).unwrap();
        link.set_key(KeyId::App, [0x33; KEY_SIZE]).unwrap();

        Harness {
            link,
            radio,
            timers,
            events,
            pool,
        }
    }

    fn harness(local: Address) -> Harness {
        harness_with(LinkConfig::default(), local, 16, NOW)
    }

    fn pair() -> (Harness, Harness) {
        let mut a = harness(device(1));
        let mut b = harness(device(2));
        a.connect();
        b.connect();
        (a, b)
    }

    #[test]
    fn test_advertising_pushes_beacon_and_arms_timers() {
        let mut h = harness(device(1));
        h.link.start_advertising().unwrap();

        let radio = h.radio();
        assert_eq!(radio.len(), 2);
        match &radio[0] {
            RadioFrame::AdvData(data) => {
                let beacon = BeaconFrame::decode(data).unwrap();
                assert_eq!(beacon.application_id, 0x01);
                assert_eq!(beacon.tx_id.format(), TxIdFormat::TimeSync);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(radio[1], RadioFrame::AdvStarted(Duration::from_millis(160)));

        assert_eq!(
            h.timers(),
            vec![
                TimerCommand::Arm(LinkTimer::FastAdv, Duration::from_secs(30)),
                TimerCommand::Arm(LinkTimer::AdvRotation, Duration::from_secs(900)),
            ]
        );
        assert_eq!(
            h.events(),
            vec![LinkEvent::StateChanged {
                from: LinkState::Disconnected,
                to: LinkState::Advertising
            }]
        );
    }

    #[test]
    fn test_fast_adv_switches_to_slow_interval() {
        let mut h = harness(device(1));
        h.link.start_advertising().unwrap();
        h.radio();

        h.link.on_timer_expired(LinkTimer::FastAdv).unwrap();
        assert_eq!(
            h.radio(),
            vec![RadioFrame::AdvStarted(Duration::from_millis(1000))]
        );
    }

    #[test]
    fn test_adv_rotation_updates_beacon() {
        let config = LinkConfig::default().with_tx_id_format(TxIdFormat::Counter);
        let mut h = harness_with(config, device(1), 16, NOW);

        // ignored while not advertising
        h.link.on_timer_expired(LinkTimer::AdvRotation).unwrap();
        assert_eq!(h.link.stats().adv_rotations, 0);

        h.link.start_advertising().unwrap();
        h.radio();
        h.timers();
        h.events();

        h.link.on_timer_expired(LinkTimer::AdvRotation).unwrap();
        match h.radio().as_slice() {
            [RadioFrame::AdvData(data)] => {
                let beacon = BeaconFrame::decode(data).unwrap();
                assert_eq!(beacon.tx_id, TxId::Counter { counter: 0, rotation: 1 });
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            h.timers(),
            vec![TimerCommand::Arm(LinkTimer::AdvRotation, Duration::from_secs(900))]
        );
        assert_eq!(h.events(), vec![LinkEvent::AdvertisementRotated { rotation: 1 }]);
        assert_eq!(h.link.stats().adv_rotations, 1);
        assert_eq!(h.link.state(), LinkState::Advertising);
    }

    #[test]
    fn test_beacon_payload_and_state_setters() {
        let mut h = harness(device(1));
        assert!(matches!(
            h.link.set_beacon_payload(vec![0u8; MAX_BEACON_PAYLOAD + 1]),
            Err(LinkError::InvalidArgs(_))
        ));

        // stored while idle, pushed once advertising
        h.link.set_beacon_payload(&b"hi"[..]).unwrap();
        assert!(h.radio().is_empty());

        h.link.start_advertising().unwrap();
        h.radio();
        h.link.set_battery_level(BatteryLevel::Low).unwrap();
        match h.radio().as_slice() {
            [RadioFrame::AdvData(data)] => {
                let beacon = BeaconFrame::decode(data).unwrap();
                assert_eq!(beacon.payload, Bytes::from_static(b"hi"));
                assert_eq!(beacon.state.battery_level, BatteryLevel::Low);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_send_requires_connection() {
        let mut h = harness(device(1));
        let msg = OutboundMessage::new(device(2), 0x02, 0x0001, &b"x"[..]);
        assert!(matches!(h.link.send(msg), Err(LinkError::NotConnected)));
    }

    #[test]
    fn test_send_receive_round_trip() {
        let (mut a, mut b) = pair();

        let frame = a.send(OutboundMessage::new(device(2), 0x02, 0x0105, &b"hello"[..]));
        b.link.on_receive(frame).unwrap();

        assert_eq!(
            b.events(),
            vec![LinkEvent::MessageReceived {
                src: device(1),
                cmd_class: 0x02,
                cmd_id: 0x0105,
                len: 5
            }]
        );
        let msg = b.link.recv_message().unwrap().unwrap();
        assert_eq!(msg.payload, Bytes::from_static(b"hello"));
        assert_eq!(msg.src, device(1));
        assert_eq!(msg.crypt_mask, crypt_mask::NW_WAN_CNT_AUTH);
        assert!(b.link.recv_message().unwrap().is_none());

        assert_eq!(a.link.stats().tx, 1);
        assert_eq!(b.link.stats().rx, 1);
        assert_eq!(a.pool.stats().in_use, 0);
        assert_eq!(b.pool.stats().in_use, 0);
    }

    #[test]
    fn test_layered_mask_round_trip() {
        let (mut a, mut b) = pair();

        for i in 0..3u8 {
            let msg = OutboundMessage::new(device(2), 0x03, 0x0010, vec![i; 24])
                .with_crypt_mask(NW_APP_WAN_CNT_AUTH);
            let frame = a.send(msg);
            b.link.on_receive(frame).unwrap();
        }

        for i in 0..3u8 {
            let msg = b.link.recv_message().unwrap().unwrap();
            assert_eq!(msg.payload, Bytes::from(vec![i; 24]));
            assert_eq!(msg.ll_seqn, i as u32);
        }
    }

    #[test]
    fn test_replayed_frame_is_dropped() {
        let (mut a, mut b) = pair();

        let frame = a.send(OutboundMessage::new(device(2), 0x02, 0x0001, &b"once"[..]));
        b.link.on_receive(frame.clone()).unwrap();
        b.events();

        assert!(matches!(
            b.link.on_receive(frame),
            Err(LinkError::ReplayDetected { .. })
        ));
        assert_eq!(b.events(), vec![LinkEvent::Error(BleErrorType::Replay)]);
        assert_eq!(b.link.stats().duplicates, 1);
        assert_eq!(b.link.pending_messages(), 1);
        assert_eq!(b.pool.stats().in_use, 1);
    }

    #[test]
    fn test_unknown_crypt_mask_raises_one_error_event() {
        let (mut a, mut b) = pair();

        let frame = a.send(OutboundMessage::new(device(2), 0x02, 0x0001, &b"data"[..]));
        let mut raw = frame.to_vec();
        raw[0] = 0x02;

        assert!(matches!(
            b.link.on_receive(Bytes::from(raw)),
            Err(LinkError::Wire(WireError::NotFound(0x02)))
        ));
        assert_eq!(b.events(), vec![LinkEvent::Error(BleErrorType::DataInvalid)]);
        assert_eq!(b.link.stats().rx_fail, 1);
        assert_eq!(b.link.state(), LinkState::Connected);
    }

    #[test]
    fn test_tampered_frame_raises_data_invalid() {
        let (mut a, mut b) = pair();

        let frame = a.send(OutboundMessage::new(device(2), 0x02, 0x0001, &b"data"[..]));
        let mut raw = frame.to_vec();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;

        assert!(b.link.on_receive(Bytes::from(raw)).is_err());
        assert_eq!(b.events(), vec![LinkEvent::Error(BleErrorType::DataInvalid)]);
        assert_eq!(b.link.pending_messages(), 0);
        assert_eq!(b.pool.stats().in_use, 0);
    }

    #[test]
    fn test_malformed_frame_is_counted() {
        let (_, mut b) = pair();

        assert!(b
            .link
            .on_receive(Bytes::from_static(&[0x17, 0x00]))
            .is_err());
        assert_eq!(b.link.stats().malformed, 1);
        assert!(b.events().is_empty());
        assert_eq!(b.link.state(), LinkState::Connected);
    }

    /// Store whose reads always fail
    struct BrokenStore;

    impl KvStore for BrokenStore {
        fn put(&self, _: &RecordKey, _: &[u8]) -> Result<(), StorageError> {
            Ok(())
        }

        fn get(&self, _: &RecordKey) -> Result<Option<Vec<u8>>, StorageError> {
            Err(StorageError::Corruption("checksum mismatch".to_string()))
        }

        fn delete(&self, _: &RecordKey) -> Result<(), StorageError> {
            Ok(())
        }

        fn flush(&self) -> Result<(), StorageError> {
            Ok(())
        }
    }

    #[test]
    fn test_unset_local_address_accepts_any_destination() {
        let mut a = harness(device(1));
        a.connect();

        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let registry = Arc::new(LocalAddressRegistry::new(store.clone()));
        let mut b = harness_on(LinkConfig::default(), store, registry, 16, NOW);
        b.connect();

        let frame = a.send(OutboundMessage::new(device(9), 0x02, 0x0001, &b"data"[..]));
        b.link.on_receive(frame).unwrap();
        assert_eq!(b.link.recv_message().unwrap().unwrap().payload, &b"data"[..]);
    }

    #[test]
    fn test_local_address_read_failure_drops_frame() {
        let mut a = harness(device(1));
        a.connect();

        let store: Arc<dyn KvStore> = Arc::new(BrokenStore);
        let registry = Arc::new(LocalAddressRegistry::new(store.clone()));
        let mut b = harness_on(LinkConfig::default(), store, registry, 16, NOW);
        b.connect();

        let frame = a.send(OutboundMessage::new(device(2), 0x02, 0x0001, &b"data"[..]));
        assert!(matches!(
            b.link.on_receive(frame),
            Err(LinkError::Storage(StorageError::Corruption(_)))
        ));
        assert_eq!(b.link.stats().rx_fail, 1);
        assert!(b.link.recv_message().unwrap().is_none());
        assert_eq!(b.pool.stats().in_use, 0);
    }

    #[test]
    fn test_frame_for_other_device_is_ignored() {
        let (mut a, mut b) = pair();

        let frame = a.send(OutboundMessage::new(device(9), 0x02, 0x0001, &b"data"[..]));
        assert!(matches!(
            b.link.on_receive(frame),
            Err(LinkError::NotFound("destination"))
        ));
        assert!(b.events().is_empty());
    }

    #[test]
    fn test_time_mask_round_trip_and_staleness() {
        let (mut a, mut b) = pair();
        let msg = OutboundMessage::new(device(2), 0x02, 0x0001, &b"now"[..])
            .with_crypt_mask(NW_WAN_TIME_AUTH);
        let frame = a.send(msg.clone());
        b.link.on_receive(frame).unwrap();

        // receiver clock ten minutes ahead
        let mut late = harness_with(LinkConfig::default(), device(2), 16, NOW + 600);
        late.connect();
        let frame = a.send(msg);
        assert!(matches!(
            late.link.on_receive(frame),
            Err(LinkError::ReplayDetected { .. })
        ));
        assert_eq!(late.events(), vec![LinkEvent::Error(BleErrorType::Replay)]);
    }

    #[test]
    fn test_time_mask_requires_link_sequence() {
        let config = LinkConfig::default().with_tx_id_format(TxIdFormat::Counter);
        let mut h = harness_with(config.clone(), device(1), 16, NOW);
        h.connect();

        let msg = OutboundMessage::new(device(2), 0x02, 0x0001, &b"x"[..])
            .with_crypt_mask(NW_WAN_TIME_AUTH);
        assert!(matches!(h.link.send(msg), Err(LinkError::InvalidArgs(_))));

        // plain frames carry no nonce
        let msg = OutboundMessage::new(device(2), 0x02, 0x0001, &b"x"[..]).with_crypt_mask(PLAIN);
        h.link.send(msg).unwrap();

        let (transport, _radio) = ChannelTransport::new();
        let (timers, _timers) = ChannelTimers::new();
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let result = BleLinkInterface::new(
            config.with_default_crypt_mask(NW_WAN_TIME_AUTH),
            transport,
            timers,
            LinkResources {
                pool: Arc::new(ResourceManager::new(ResourceManagerConfig::default()).unwrap()),
                local_address: Arc::new(LocalAddressRegistry::new(store.clone())),
                store,
                clock: Arc::new(FixedClock(NOW)),
            },
        );
        assert!(matches!(result, Err(LinkError::InvalidArgs(_))));
    }

    #[test]
    fn test_counter_format_advances_send_counter() {
        let config = LinkConfig::default().with_tx_id_format(TxIdFormat::Counter);
        let mut h = harness_with(config, device(1), 16, NOW);
        h.connect();

        for expected in 0..3 {
            let seq = h
                .link
                .send(OutboundMessage::new(device(2), 0x02, 0x0001, &b"x"[..]))
                .unwrap();
            assert_eq!(seq.counter, expected);
            assert_eq!(seq.ll_seqn, 0);
        }
        assert_eq!(h.link.sequencer().counter(), 3);
    }

    #[test]
    fn test_mtu_limit() {
        let mut h = harness(device(1));
        h.connect();

        let msg = OutboundMessage::new(device(2), 0x02, 0x0001, vec![0u8; 300]);
        assert!(matches!(h.link.send(msg), Err(LinkError::InvalidArgs(_))));
        assert_eq!(h.link.stats().tx_fail, 1);
        assert_eq!(h.link.mtu(), 247);
    }

    #[test]
    fn test_out_of_memory_backpressures_sender() {
        let mut h = harness_with(LinkConfig::default(), device(1), 1, NOW);
        h.connect();

        let held = h.pool.get_with_priority(8, Priority::Critical).unwrap();
        let msg = OutboundMessage::new(device(2), 0x02, 0x0001, &b"x"[..]);
        assert!(matches!(
            h.link.send(msg.clone()),
            Err(LinkError::Resource(ResourceError::OutOfMemory { .. }))
        ));
        assert_eq!(h.link.stats().tx_fail, 1);

        h.pool.free(held).unwrap();
        h.link.send(msg).unwrap();
    }

    #[test]
    fn test_eviction_frees_low_priority_inbound() {
        let mut a = harness(device(1));
        let mut b = harness_with(LinkConfig::default(), device(2), 2, NOW);
        a.connect();
        b.connect();

        for _ in 0..2 {
            let frame = a.send(OutboundMessage::new(device(2), 0x02, 0x0001, &b"queued"[..]));
            b.link.on_receive(frame).unwrap();
        }
        assert_eq!(b.pool.available(), 0);

        b.link
            .send(OutboundMessage::new(device(1), 0x02, 0x0002, &b"reply"[..]))
            .unwrap();
        assert_eq!(b.link.pending_messages(), 1);
        assert_eq!(b.pool.stats().no_memory_callbacks, 1);

        // equal priority never evicts
        let frame = a.send(OutboundMessage::new(device(2), 0x02, 0x0001, &b"more"[..]));
        b.link.on_receive(frame).unwrap();
        let frame = a.send(OutboundMessage::new(device(2), 0x02, 0x0001, &b"lost"[..]));
        assert!(b.link.on_receive(frame).is_err());
        assert_eq!(b.link.pending_messages(), 2);
    }

    #[test]
    fn test_inactivity_timeout_disconnects() {
        let mut h = harness(device(1));
        h.link.start_advertising().unwrap();
        h.link.on_connection_event(true, Some(device(9))).unwrap();
        assert_eq!(h.link.remote(), Some(&device(9)));
        assert!(h
            .timers()
            .contains(&TimerCommand::Arm(LinkTimer::Inactivity, Duration::from_secs(30))));
        h.radio();

        h.link.on_timer_expired(LinkTimer::Inactivity).unwrap();
        assert_eq!(h.link.state(), LinkState::Disconnecting);
        assert_eq!(h.radio(), vec![RadioFrame::Disconnect]);
        assert_eq!(h.link.stats().inactivity_disconnects, 1);

        h.link.on_connection_event(false, None).unwrap();
        assert_eq!(h.link.state(), LinkState::Disconnected);
        assert!(h.link.remote().is_none());
    }

    #[test]
    fn test_disabled_inactivity_timer_keeps_link() {
        let mut h = harness(device(1));
        h.connect();

        h.link.set_disable_inactivity_timer(true);
        assert_eq!(h.timers(), vec![TimerCommand::Disarm(LinkTimer::Inactivity)]);

        h.link.on_timer_expired(LinkTimer::Inactivity).unwrap();
        assert_eq!(h.link.state(), LinkState::Connected);
        assert!(h.radio().is_empty());
    }

    #[test]
    fn test_connection_failure_is_counted() {
        let mut h = harness(device(1));
        h.link.start_advertising().unwrap();
        h.link.connect_initiated().unwrap();
        h.link.on_connection_event(false, None).unwrap();

        let stats = h.link.stats();
        assert_eq!(stats.connection_fail, 1);
        assert_eq!(stats.connection_success, 0);
        assert_eq!(h.link.state(), LinkState::Disconnected);
    }

    #[test]
    fn test_requested_disconnect() {
        let mut h = harness(device(1));
        assert!(matches!(
            h.link.disconnect(),
            Err(LinkError::InvalidState { from: LinkState::Disconnected, .. })
        ));

        h.connect();
        h.link.disconnect().unwrap();
        assert_eq!(h.radio(), vec![RadioFrame::Disconnect]);
        assert_eq!(h.link.state(), LinkState::Disconnecting);
    }

    #[test]
    fn test_dedicated_link_keys() {
        let (mut a, mut b) = pair();
        let params = DedicatedLinkParams {
            role: DedicatedRole::ClientDev,
            peer_dev_id: [0xA0, 0x00, 0x00, 0x10, 0x02],
            channel: 3,
        };
        a.link.set_dedicated_link_params(params).unwrap();
        a.link.set_temp_key(TempKeyType::Unicast, [0x44; KEY_SIZE]).unwrap();
        a.link.set_temp_key(TempKeyType::App, [0x55; KEY_SIZE]).unwrap();
        assert!(a.link.dedicated().is_established());

        let msg = OutboundMessage::new(device(2), 0x04, 0x0001, &b"secret"[..])
            .with_crypt_mask(NW_APP_WAN_CNT_AUTH);

        // peer still on long-term keys
        let frame = a.send(msg.clone());
        assert!(b.link.on_receive(frame).is_err());
        assert_eq!(b.events(), vec![LinkEvent::Error(BleErrorType::DataInvalid)]);

        b.link
            .set_dedicated_link_params(DedicatedLinkParams {
                role: DedicatedRole::AssistingDev,
                ..params
            })
            .unwrap();
        b.link.set_temp_key(TempKeyType::Unicast, [0x44; KEY_SIZE]).unwrap();
        b.link.set_temp_key(TempKeyType::App, [0x55; KEY_SIZE]).unwrap();

        let frame = a.send(msg);
        b.link.on_receive(frame).unwrap();
        assert_eq!(
            b.link.recv_message().unwrap().unwrap().payload,
            Bytes::from_static(b"secret")
        );

        b.link.disconnect().unwrap();
        b.link.on_connection_event(false, None).unwrap();
        assert!(!b.link.dedicated().is_established());
    }

    #[test]
    fn test_drop_releases_queued_messages() {
        let (mut a, mut b) = pair();
        let frame = a.send(OutboundMessage::new(device(2), 0x02, 0x0001, &b"x"[..]));
        b.link.on_receive(frame).unwrap();

        let pool = b.pool.clone();
        assert_eq!(pool.stats().in_use, 1);
        drop(b);
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test]
    async fn test_events_delivered_to_async_receiver() {
        let mut h = harness(device(1));
        h.link.start_advertising().unwrap();
        h.link.connect_initiated().unwrap();

        let first = h.events.recv().await.unwrap();
        let second = h.events.recv().await.unwrap();
        assert_eq!(
            first,
            LinkEvent::StateChanged {
                from: LinkState::Disconnected,
                to: LinkState::Advertising
            }
        );
        assert_eq!(
            second,
            LinkEvent::StateChanged {
                from: LinkState::Advertising,
                to: LinkState::Connecting
            }
        );
    }
}

//! Seams to the radio, the timer service and the clock.
//!
//! The link interface never blocks. It pushes frames and timer requests out
//! through these traits and is driven back through its `on_*` methods.
//! [`ChannelTransport`] and [`ChannelTimers`] forward everything over tokio
//! channels so an async driver (or a test) can play the radio and the RTOS.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// Radio errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Radio refused the operation
    #[error("radio error: {0}")]
    Radio(String),
    /// Peer side of the radio is gone
    #[error("radio closed")]
    Closed,
}

/// BLE radio operations used by the link
pub trait Transport: Send {
    /// Send one data PDU over the connection
    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Replace the advertisement manufacturer data
    fn set_adv_data(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Start advertising at `interval`
    fn start_adv(&mut self, interval: Duration) -> Result<(), TransportError>;

    /// Stop advertising
    fn stop_adv(&mut self) -> Result<(), TransportError>;

    /// Tear down the connection
    fn disconnect(&mut self) -> Result<(), TransportError>;
}

/// Timers owned by the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkTimer {
    /// Beacon payload rotation
    AdvRotation,
    /// End of the fast advertising window
    FastAdv,
    /// Connection inactivity
    Inactivity,
}

/// One-shot timer service
pub trait TimerService: Send {
    /// (Re)arm `timer` to fire once after `after`
    fn arm(&mut self, timer: LinkTimer, after: Duration);

    /// Cancel `timer` if armed
    fn disarm(&mut self, timer: LinkTimer);
}

/// Wall clock
pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch
    fn now_secs(&self) -> u32;
}

/// Clock backed by the system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u32 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0)
    }
}

/// Clock frozen at a given time
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub u32);

impl Clock for FixedClock {
    fn now_secs(&self) -> u32 {
        self.0
    }
}

/// Everything a [`ChannelTransport`] hands to the radio side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioFrame {
    /// Data PDU
    Data(Bytes),
    /// New advertisement data
    AdvData(Bytes),
    /// Advertising started at the given interval
    AdvStarted(Duration),
    /// Advertising stopped
    AdvStopped,
    /// Connection teardown requested
    Disconnect,
}

/// Transport that forwards radio operations over a channel
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<RadioFrame>,
}

impl ChannelTransport {
    /// Create a transport and the receiving end for the radio side
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RadioFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, frame: RadioFrame) -> Result<(), TransportError> {
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.forward(RadioFrame::Data(Bytes::copy_from_slice(frame)))
    }

    fn set_adv_data(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.forward(RadioFrame::AdvData(Bytes::copy_from_slice(data)))
    }

    fn start_adv(&mut self, interval: Duration) -> Result<(), TransportError> {
        self.forward(RadioFrame::AdvStarted(interval))
    }

    fn stop_adv(&mut self) -> Result<(), TransportError> {
        self.forward(RadioFrame::AdvStopped)
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.forward(RadioFrame::Disconnect)
    }
}

/// Timer request emitted by [`ChannelTimers`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCommand {
    /// Fire `timer` after the duration
    Arm(LinkTimer, Duration),
    /// Cancel `timer`
    Disarm(LinkTimer),
}

/// Timer service that forwards requests over a channel
#[derive(Debug, Clone)]
pub struct ChannelTimers {
    tx: mpsc::UnboundedSender<TimerCommand>,
}

impl ChannelTimers {
    /// Create a timer service and the receiving end for the driver
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TimerService for ChannelTimers {
    fn arm(&mut self, timer: LinkTimer, after: Duration) {
        // A dropped driver means nobody is waiting on the timer
        let _ = self.tx.send(TimerCommand::Arm(timer, after));
    }

    fn disarm(&mut self, timer: LinkTimer) {
        let _ = self.tx.send(TimerCommand::Disarm(timer));
    }
}

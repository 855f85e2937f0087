use anyhow::bail;
use std::time::Duration;

/// All tuning knobs of a CAP socket. There is no environment-based configuration - every
///  parameter is set through [crate::socket::CapSocket::set_opt] before the connection
///  is established, or left at its default.
#[derive(Debug, Clone)]
pub struct CapConfig {
    /// Maximum number of unacknowledged segments in flight ('W'). The send buffer holds
    ///  at most this many slots, so every buffered slot is inside the window by
    ///  construction.
    pub window: usize,

    /// Per-segment payload cap. Segmentation cuts messages into chunks of exactly this
    ///  size; a shorter (possibly empty) final segment marks end-of-message.
    pub payload_max: usize,

    /// RTO before the first RTT sample is available.
    pub rto_initial: Duration,
    pub rto_min: Duration,
    pub rto_max: Duration,

    /// Upper bound on retransmissions per segment. Exceeding it mid-session tears the
    ///  connection down with [crate::error::CapError::PeerUnreachable].
    pub max_retries: u32,

    /// Upper bound on handshake (and FIN) retransmissions.
    pub handshake_retries: u32,

    /// How long the active closer lingers in TIME_WAIT before releasing the connection.
    pub time_wait: Duration,

    /// When set, operations that would suspend return
    ///  [crate::error::CapError::WouldBlock] instead.
    pub nonblocking: bool,
}

impl Default for CapConfig {
    fn default() -> Self {
        CapConfig {
            window: 32,
            payload_max: 1024,
            rto_initial: Duration::from_secs(1),
            rto_min: Duration::from_millis(200),
            rto_max: Duration::from_secs(60),
            max_retries: 8,
            handshake_retries: 5,
            time_wait: Duration::from_secs(2),
            nonblocking: false,
        }
    }
}

impl CapConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.window == 0 {
            bail!("send window must hold at least one segment");
        }
        if self.window > (u32::MAX / 4) as usize {
            bail!("send window too large for wrap-aware sequence arithmetic");
        }
        if self.payload_max == 0 {
            bail!("payload size must be at least one byte");
        }
        if self.rto_min > self.rto_max {
            bail!("RTO clamp range is inverted");
        }
        Ok(())
    }

    pub fn apply(&mut self, opt: SockOpt) {
        match opt {
            SockOpt::Window(v) => self.window = v,
            SockOpt::PayloadMax(v) => self.payload_max = v,
            SockOpt::RtoInitial(v) => self.rto_initial = v,
            SockOpt::RtoMin(v) => self.rto_min = v,
            SockOpt::RtoMax(v) => self.rto_max = v,
            SockOpt::MaxRetries(v) => self.max_retries = v,
            SockOpt::HandshakeRetries(v) => self.handshake_retries = v,
            SockOpt::TimeWait(v) => self.time_wait = v,
            SockOpt::Nonblock(v) => self.nonblocking = v,
        }
    }

    pub fn get(&self, key: SockOptKey) -> SockOpt {
        match key {
            SockOptKey::Window => SockOpt::Window(self.window),
            SockOptKey::PayloadMax => SockOpt::PayloadMax(self.payload_max),
            SockOptKey::RtoInitial => SockOpt::RtoInitial(self.rto_initial),
            SockOptKey::RtoMin => SockOpt::RtoMin(self.rto_min),
            SockOptKey::RtoMax => SockOpt::RtoMax(self.rto_max),
            SockOptKey::MaxRetries => SockOpt::MaxRetries(self.max_retries),
            SockOptKey::HandshakeRetries => SockOpt::HandshakeRetries(self.handshake_retries),
            SockOptKey::TimeWait => SockOpt::TimeWait(self.time_wait),
            SockOptKey::Nonblock => SockOpt::Nonblock(self.nonblocking),
        }
    }
}

/// A socket option together with its value, for `set_opt` and as the result of `get_opt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockOpt {
    Window(usize),
    PayloadMax(usize),
    RtoInitial(Duration),
    RtoMin(Duration),
    RtoMax(Duration),
    MaxRetries(u32),
    HandshakeRetries(u32),
    TimeWait(Duration),
    Nonblock(bool),
}

impl SockOpt {
    pub fn key(&self) -> SockOptKey {
        match self {
            SockOpt::Window(_) => SockOptKey::Window,
            SockOpt::PayloadMax(_) => SockOptKey::PayloadMax,
            SockOpt::RtoInitial(_) => SockOptKey::RtoInitial,
            SockOpt::RtoMin(_) => SockOptKey::RtoMin,
            SockOpt::RtoMax(_) => SockOptKey::RtoMax,
            SockOpt::MaxRetries(_) => SockOptKey::MaxRetries,
            SockOpt::HandshakeRetries(_) => SockOptKey::HandshakeRetries,
            SockOpt::TimeWait(_) => SockOptKey::TimeWait,
            SockOpt::Nonblock(_) => SockOptKey::Nonblock,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockOptKey {
    Window,
    PayloadMax,
    RtoInitial,
    RtoMin,
    RtoMax,
    MaxRetries,
    HandshakeRetries,
    TimeWait,
    Nonblock,
}

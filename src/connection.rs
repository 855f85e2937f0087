use crate::config::{CapConfig, SockOpt, SockOptKey};
use crate::error::CapError;
use crate::isn;
use crate::recv_buffer::{DataOutcome, ReceiveBuffer};
use crate::rtt::RttEstimator;
use crate::segment::Segment;
use crate::send_buffer::{AckOutcome, SendBuffer};
use crate::seq::SeqNo;
use crate::timer::{TimerId, TimerKind, TimerWheel};
use crate::transport::SendPipeline;
use bytes::Bytes;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait,
    CloseWait,
    TimeWait,
}

/// A message handed to `sendto` whose chunks have not all entered the send window yet.
///  The application call completes once the last chunk is buffered.
struct PendingSend {
    chunks: VecDeque<Bytes>,
    done: oneshot::Sender<Result<(), CapError>>,
}

/// The per-connection protocol engine: state machine, buffers, timers and RTT estimate,
///  owned exclusively by the connection's event loop. Application calls arrive as
///  parked `oneshot` completions and are resolved as the protocol makes progress.
///
/// Inbound segments that are malformed or not admissible in the current state are
///  dropped with a debug log entry - the network is the fault domain, not the caller.
pub struct Connection {
    config: CapConfig,
    send_pipeline: Arc<SendPipeline>,
    state: ConnectionState,
    peer_addr: Option<SocketAddr>,

    iss_local: SeqNo,
    send_buffer: SendBuffer,
    recv_buffer: ReceiveBuffer,
    timers: TimerWheel,
    rtt: RttEstimator,

    handshake_retries_left: u32,
    handshake_timer: Option<TimerId>,

    /// replayed on duplicate SYN in SYN_RCVD / ESTABLISHED
    cached_syn_ack: Option<Segment>,
    /// replayed on duplicate SYN_ACK in ESTABLISHED (the peer missed our handshake ack)
    cached_handshake_ack: Option<Segment>,
    /// replayed on duplicate FIN in CLOSE_WAIT
    cached_fin_ack: Option<Segment>,
    /// replayed on stray FIN / FIN_ACK in TIME_WAIT; gone once the connection is released
    cached_final_ack: Option<Segment>,
    fin_seq: Option<SeqNo>,

    /// why the connection was torn down - reported by application calls arriving after
    ///  the fact
    last_error: Option<CapError>,

    connect_waiter: Option<oneshot::Sender<Result<(), CapError>>>,
    accept_waiter: Option<oneshot::Sender<Result<SocketAddr, CapError>>>,
    recv_waiters: VecDeque<oneshot::Sender<Result<Vec<u8>, CapError>>>,
    close_waiter: Option<oneshot::Sender<Result<(), CapError>>>,
    pending_sends: VecDeque<PendingSend>,

    isn_source: fn() -> SeqNo,
}

impl Connection {
    pub fn new(config: CapConfig, send_pipeline: Arc<SendPipeline>) -> Connection {
        let send_buffer = SendBuffer::new(config.window, config.payload_max);
        let recv_buffer = ReceiveBuffer::new(config.payload_max);
        let rtt = RttEstimator::new(config.rto_initial, config.rto_min, config.rto_max);

        Connection {
            config,
            send_pipeline,
            state: ConnectionState::Closed,
            peer_addr: None,
            iss_local: SeqNo::ZERO,
            send_buffer,
            recv_buffer,
            timers: TimerWheel::new(),
            rtt,
            handshake_retries_left: 0,
            handshake_timer: None,
            cached_syn_ack: None,
            cached_handshake_ack: None,
            cached_fin_ack: None,
            cached_final_ack: None,
            fin_seq: None,
            last_error: None,
            connect_waiter: None,
            accept_waiter: None,
            recv_waiters: VecDeque::new(),
            close_waiter: None,
            pending_sends: VecDeque::new(),
            isn_source: isn::random_isn,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn next_timer_deadline(&mut self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn set_opt(&mut self, opt: SockOpt) -> Result<(), CapError> {
        let mut candidate = self.config.clone();
        candidate.apply(opt);
        candidate.validate().map_err(|e| CapError::Transport(e.to_string()))?;
        self.config = candidate;
        Ok(())
    }

    pub fn get_opt(&self, key: SockOptKey) -> SockOpt {
        self.config.get(key)
    }

    // ------------------------------------------------------------------------------
    // application intents
    // ------------------------------------------------------------------------------

    pub async fn start_connect(&mut self, peer: SocketAddr, reply: oneshot::Sender<Result<(), CapError>>) {
        if self.state != ConnectionState::Closed {
            let _ = reply.send(Err(CapError::AlreadyConnected));
            return;
        }

        self.reset_protocol_state();
        self.peer_addr = Some(peer);
        self.iss_local = (self.isn_source)();
        self.state = ConnectionState::SynSent;
        self.handshake_retries_left = self.config.handshake_retries;
        self.connect_waiter = Some(reply);

        debug!("connecting to {:?} with ISS {:?}: CLOSED -> SYN_SENT", peer, self.iss_local);

        self.send_to_peer(&Segment::syn(self.iss_local)).await;
        self.arm_handshake_timer();
    }

    pub fn start_listen(&mut self) {
        match self.state {
            ConnectionState::Closed => {
                self.reset_protocol_state();
                self.state = ConnectionState::Listen;
                debug!("CLOSED -> LISTEN");
            }
            ConnectionState::Listen => {} // idempotent
            other => warn!("listen() in state {:?} - ignoring", other),
        }
    }

    pub fn register_accept(&mut self, reply: oneshot::Sender<Result<SocketAddr, CapError>>) {
        if self.state == ConnectionState::Established {
            let peer = self.peer_addr.expect("established connection has a peer");
            let _ = reply.send(Ok(peer));
            return;
        }
        self.accept_waiter = Some(reply);
    }

    pub async fn enqueue_send(&mut self, data: Vec<u8>, reply: oneshot::Sender<Result<(), CapError>>) {
        if self.state != ConnectionState::Established {
            let err = self.last_error.clone().unwrap_or(CapError::NotConnected);
            let _ = reply.send(Err(err));
            return;
        }

        let chunks = self.send_buffer.fragment(&data);

        if self.config.nonblocking {
            let free = self.config.window - self.send_buffer.in_flight();
            if !self.pending_sends.is_empty() || chunks.len() > free {
                let _ = reply.send(Err(CapError::WouldBlock));
                return;
            }
        }

        trace!("queueing message of {} bytes as {} segments", data.len(), chunks.len());
        self.pending_sends.push_back(PendingSend { chunks, done: reply });
        self.pump_sends().await;
    }

    pub fn register_recv(&mut self, reply: oneshot::Sender<Result<Vec<u8>, CapError>>) {
        if let Some(message) = self.recv_buffer.pop_message() {
            let _ = reply.send(Ok(message));
            return;
        }
        if self.recv_buffer.is_eof() {
            let _ = reply.send(Err(CapError::ConnectionClosed));
            return;
        }
        if self.state == ConnectionState::Closed {
            let err = self.last_error.clone().unwrap_or(CapError::NotConnected);
            let _ = reply.send(Err(err));
            return;
        }
        if self.config.nonblocking {
            let _ = reply.send(Err(CapError::WouldBlock));
            return;
        }
        self.recv_waiters.push_back(reply);
    }

    pub async fn start_close(&mut self, reply: oneshot::Sender<Result<(), CapError>>) {
        match self.state {
            ConnectionState::Established => {
                // sendto calls that have not entered the window are cancelled
                self.fail_pending_sends(CapError::ConnectionClosed);

                if !self.send_buffer.is_empty() {
                    debug!("closing with {} segments still in flight", self.send_buffer.in_flight());
                }

                let fin_seq = self.send_buffer.snd_nxt();
                self.fin_seq = Some(fin_seq);
                self.state = ConnectionState::FinWait;
                self.handshake_retries_left = self.config.handshake_retries;
                self.close_waiter = Some(reply);

                debug!("closing, sending FIN {:?}: ESTABLISHED -> FIN_WAIT", fin_seq);

                self.send_to_peer(&Segment::fin(fin_seq)).await;
                self.arm_handshake_timer();
            }
            ConnectionState::CloseWait => {
                debug!("closing: CLOSE_WAIT -> CLOSED");
                self.release();
                let _ = reply.send(Ok(()));
            }
            ConnectionState::SynSent => {
                debug!("close during connect: SYN_SENT -> CLOSED");
                self.teardown(CapError::ConnectionClosed);
                let _ = reply.send(Ok(()));
            }
            ConnectionState::Listen | ConnectionState::SynRcvd | ConnectionState::Closed => {
                self.release();
                let _ = reply.send(Ok(()));
            }
            ConnectionState::FinWait | ConnectionState::TimeWait => {
                // teardown already under way
                let _ = reply.send(Ok(()));
            }
        }
    }

    // ------------------------------------------------------------------------------
    // inbound segments
    // ------------------------------------------------------------------------------

    pub async fn on_datagram(&mut self, from: SocketAddr, buf: &[u8]) {
        let segment = match Segment::deser(buf) {
            Ok(segment) => segment,
            Err(e) => {
                debug!("dropping undecodable datagram from {:?}: {}", from, e);
                return;
            }
        };

        // only the connection's peer may speak; in LISTEN the first SYN picks the peer
        if let Some(peer) = self.peer_addr {
            if peer != from {
                debug!("datagram from {:?} does not belong to connection with {:?} - dropping", from, peer);
                return;
            }
        }
        else if self.state != ConnectionState::Listen {
            debug!("datagram from {:?} without a connection - dropping", from);
            return;
        }

        trace!("received {:?} in state {:?}", segment, self.state);

        use crate::segment::SegmentKind::*;
        use ConnectionState::*;

        match (self.state, segment.kind) {
            (Listen, Syn) => self.on_syn_in_listen(from, segment).await,
            (SynSent, SynAck) => self.on_syn_ack(segment).await,
            (SynRcvd, Syn) | (Established, Syn) => self.replay(self.cached_syn_ack.clone()).await,
            (SynRcvd, DataAck) => self.on_handshake_ack(segment).await,
            (Established, SynAck) | (FinWait, SynAck) => self.replay(self.cached_handshake_ack.clone()).await,
            (Established, Data) => self.on_data(segment).await,
            (Established, DataAck) | (FinWait, DataAck) => self.on_data_ack(segment).await,
            (Established, Fin) => self.on_fin(segment).await,
            (FinWait, FinAck) => self.on_fin_ack(segment).await,
            (CloseWait, Fin) => self.replay(self.cached_fin_ack.clone()).await,
            // a data retransmission whose earlier acks got lost; the cached FIN_ACK
            //  acknowledges everything up to and including the FIN
            (CloseWait, Data) => self.replay(self.cached_fin_ack.clone()).await,
            (TimeWait, Fin) | (TimeWait, FinAck) => self.replay(self.cached_final_ack.clone()).await,
            (state, kind) => debug!("dropping {:?} not admissible in state {:?}", kind, state),
        }
    }

    async fn on_syn_in_listen(&mut self, from: SocketAddr, segment: Segment) {
        self.peer_addr = Some(from);
        self.iss_local = (self.isn_source)();
        self.reset_buffers();
        self.recv_buffer.init(segment.seq.next());

        let syn_ack = Segment::syn_ack(self.iss_local, self.recv_buffer.ack_value());
        self.cached_syn_ack = Some(syn_ack.clone());
        self.state = ConnectionState::SynRcvd;
        self.handshake_retries_left = self.config.handshake_retries;

        debug!("received SYN from {:?}, replying with ISS {:?}: LISTEN -> SYN_RCVD", from, self.iss_local);

        self.send_to_peer(&syn_ack).await;
        self.arm_handshake_timer();
    }

    async fn on_syn_ack(&mut self, segment: Segment) {
        if segment.ack != self.iss_local.next() {
            debug!("SYN_ACK acks {:?}, expected {:?} - dropping", segment.ack, self.iss_local.next());
            return;
        }

        self.send_buffer.init(self.iss_local.next());
        self.recv_buffer.init(segment.seq.next());
        self.cancel_handshake_timer();

        let ack = Segment::data_ack(self.recv_buffer.ack_value());
        self.cached_handshake_ack = Some(ack.clone());
        self.state = ConnectionState::Established;

        debug!("received SYN_ACK: SYN_SENT -> ESTABLISHED");

        self.send_to_peer(&ack).await;

        if let Some(waiter) = self.connect_waiter.take() {
            let _ = waiter.send(Ok(()));
        }
    }

    async fn on_handshake_ack(&mut self, segment: Segment) {
        if segment.ack != self.iss_local.next() {
            debug!("handshake ack {:?} does not match ISS {:?} - dropping", segment.ack, self.iss_local);
            return;
        }

        self.send_buffer.init(self.iss_local.next());
        self.cancel_handshake_timer();
        self.state = ConnectionState::Established;

        debug!("handshake complete: SYN_RCVD -> ESTABLISHED");

        if let Some(waiter) = self.accept_waiter.take() {
            let peer = self.peer_addr.expect("peer address is set in SYN_RCVD");
            let _ = waiter.send(Ok(peer));
        }
    }

    async fn on_data(&mut self, segment: Segment) {
        match self.recv_buffer.on_data(segment.seq, &segment.payload) {
            DataOutcome::Accepted { message_complete } => {
                trace!("accepted {:?}, rcv_nxt now {:?}", segment, self.recv_buffer.ack_value());
                if message_complete {
                    self.wake_recv_waiters();
                }
            }
            DataOutcome::Duplicate | DataOutcome::OutOfOrder => {}
        }

        // every received DATA elicits a cumulative ack, duplicates included - the ack
        //  itself may have been the datagram that got lost
        self.send_to_peer(&Segment::data_ack(self.recv_buffer.ack_value())).await;
    }

    async fn on_data_ack(&mut self, segment: Segment) {
        match self.send_buffer.on_ack(segment.ack, Instant::now()) {
            AckOutcome::Advanced { cancelled_timers, rtt_sample } => {
                for timer in cancelled_timers {
                    self.timers.cancel(timer);
                }
                if let Some(sample) = rtt_sample {
                    self.rtt.on_sample(sample);
                }
                trace!("cumulative ack {:?} advanced snd_una, RTO now {:?}", segment.ack, self.rtt.rto());
                self.pump_sends().await;
            }
            AckOutcome::Duplicate => {
                trace!("duplicate ack {:?} ({} so far)", segment.ack, self.send_buffer.dup_acks());
            }
            AckOutcome::Invalid => {
                debug!("ignoring ack {:?} outside ({:?}, {:?}]", segment.ack, self.send_buffer.snd_una(), self.send_buffer.snd_nxt());
            }
        }
    }

    async fn on_fin(&mut self, segment: Segment) {
        if !self.recv_buffer.on_fin(segment.seq) {
            debug!("FIN {:?} does not match rcv_nxt {:?} - dropping", segment.seq, self.recv_buffer.ack_value());
            return;
        }

        let fin_ack = Segment::fin_ack(self.recv_buffer.ack_value());
        self.cached_fin_ack = Some(fin_ack.clone());
        self.state = ConnectionState::CloseWait;

        debug!("received FIN: ESTABLISHED -> CLOSE_WAIT");

        self.send_to_peer(&fin_ack).await;
        self.wake_recv_waiters();
    }

    async fn on_fin_ack(&mut self, segment: Segment) {
        let fin_seq = self.fin_seq.expect("FIN_WAIT implies a sent FIN");
        if segment.ack != fin_seq.next() {
            debug!("FIN_ACK acks {:?}, expected {:?} - dropping", segment.ack, fin_seq.next());
            return;
        }

        // the peer accepts a FIN only once all data before it arrived, so any
        //  retransmission timers still pending are for segments the peer already has
        self.timers.cancel_all();
        self.handshake_timer = None;

        let final_ack = Segment::data_ack(self.recv_buffer.ack_value());
        self.cached_final_ack = Some(final_ack.clone());
        self.state = ConnectionState::TimeWait;

        debug!("received FIN_ACK: FIN_WAIT -> TIME_WAIT for {:?}", self.config.time_wait);

        self.send_to_peer(&final_ack).await;
        self.timers.arm(TimerKind::TimeWait, self.config.time_wait);

        if let Some(waiter) = self.close_waiter.take() {
            let _ = waiter.send(Ok(()));
        }
    }

    // ------------------------------------------------------------------------------
    // timers
    // ------------------------------------------------------------------------------

    pub async fn poll_timers(&mut self) {
        for kind in self.timers.poll_expired(Instant::now()) {
            match kind {
                TimerKind::Retransmit(seq) => self.on_retransmit_timer(seq).await,
                TimerKind::HandshakeRetry => self.on_handshake_retry().await,
                TimerKind::TimeWait => self.on_time_wait_expired(),
            }
        }
    }

    async fn on_retransmit_timer(&mut self, seq: SeqNo) {
        if !matches!(self.state, ConnectionState::Established | ConnectionState::FinWait) {
            return;
        }

        let exhausted = match self.send_buffer.slot_mut(seq) {
            None => return, // acknowledged in the meantime
            Some(slot) => slot.retries >= self.config.max_retries,
        };
        if exhausted {
            warn!("segment {:?} unacknowledged after {} retries - peer unreachable", seq, self.config.max_retries);
            self.teardown(CapError::PeerUnreachable);
            return;
        }

        let payload = {
            let slot = self.send_buffer.slot_mut(seq).expect("slot presence checked above");
            slot.retries += 1;
            slot.retransmitted = true;
            slot.payload.clone()
        };

        self.rtt.backoff();
        debug!("retransmitting {:?}, RTO backed off to {:?}", seq, self.rtt.rto());

        self.send_to_peer(&Segment::data(seq, payload)).await;
        let timer = self.timers.arm(TimerKind::Retransmit(seq), self.rtt.rto());
        self.send_buffer.mark_sent(seq, Instant::now(), timer);
    }

    async fn on_handshake_retry(&mut self) {
        match self.state {
            ConnectionState::SynSent => {
                if self.handshake_retries_left == 0 {
                    warn!("handshake retries exhausted - connect timed out");
                    self.teardown(CapError::ConnectTimeout);
                    return;
                }
                self.handshake_retries_left -= 1;
                self.rtt.backoff();
                debug!("re-sending SYN, {} retries left", self.handshake_retries_left);
                self.send_to_peer(&Segment::syn(self.iss_local)).await;
                self.arm_handshake_timer();
            }
            ConnectionState::SynRcvd => {
                if self.handshake_retries_left == 0 {
                    warn!("SYN_ACK retries exhausted - dropping half-open connection");
                    self.reset_protocol_state();
                    self.state = ConnectionState::Listen;
                    return;
                }
                self.handshake_retries_left -= 1;
                self.rtt.backoff();
                debug!("re-sending SYN_ACK, {} retries left", self.handshake_retries_left);
                self.replay(self.cached_syn_ack.clone()).await;
                self.arm_handshake_timer();
            }
            ConnectionState::FinWait => {
                if self.handshake_retries_left == 0 {
                    warn!("FIN retries exhausted - peer unreachable");
                    self.teardown(CapError::PeerUnreachable);
                    return;
                }
                self.handshake_retries_left -= 1;
                self.rtt.backoff();
                let fin_seq = self.fin_seq.expect("FIN_WAIT implies a sent FIN");
                debug!("re-sending FIN {:?}, {} retries left", fin_seq, self.handshake_retries_left);
                self.send_to_peer(&Segment::fin(fin_seq)).await;
                self.arm_handshake_timer();
            }
            _ => {}
        }
    }

    fn on_time_wait_expired(&mut self) {
        if self.state != ConnectionState::TimeWait {
            return;
        }
        debug!("TIME_WAIT elapsed: releasing connection");
        self.release();
    }

    // ------------------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------------------

    /// Move queued chunks into freshly freed window slots, complete `sendto` calls whose
    ///  last chunk entered the buffer, and transmit everything not yet on the wire.
    async fn pump_sends(&mut self) {
        while let Some(front) = self.pending_sends.front_mut() {
            while self.send_buffer.has_capacity() {
                match front.chunks.pop_front() {
                    Some(chunk) => {
                        self.send_buffer.push_chunk(chunk);
                    }
                    None => break,
                }
            }
            if front.chunks.is_empty() {
                let pending = self.pending_sends.pop_front().expect("checked by front_mut()");
                let _ = pending.done.send(Ok(()));
            }
            else {
                break; // window full, resume on the next ack
            }
        }

        self.transmit_unsent().await;
    }

    async fn transmit_unsent(&mut self) {
        for (seq, payload) in self.send_buffer.unsent() {
            self.send_to_peer(&Segment::data(seq, payload)).await;
            let timer = self.timers.arm(TimerKind::Retransmit(seq), self.rtt.rto());
            self.send_buffer.mark_sent(seq, Instant::now(), timer);
        }
    }

    fn wake_recv_waiters(&mut self) {
        while !self.recv_waiters.is_empty() && self.recv_buffer.has_message() {
            let waiter = self.recv_waiters.pop_front().expect("checked non-empty");
            let message = self.recv_buffer.pop_message().expect("checked has_message");
            let _ = waiter.send(Ok(message));
        }

        if self.recv_buffer.is_eof() {
            while let Some(waiter) = self.recv_waiters.pop_front() {
                let _ = waiter.send(Err(CapError::ConnectionClosed));
            }
        }
    }

    async fn replay(&mut self, cached: Option<Segment>) {
        if let Some(segment) = cached {
            debug!("replaying cached {:?} in state {:?}", segment, self.state);
            self.send_to_peer(&segment).await;
        }
    }

    async fn send_to_peer(&self, segment: &Segment) {
        let peer = self.peer_addr.expect("connection has no peer address");
        self.send_pipeline.send_segment(peer, segment).await;
    }

    fn arm_handshake_timer(&mut self) {
        if let Some(id) = self.handshake_timer.take() {
            self.timers.cancel(id);
        }
        self.handshake_timer = Some(self.timers.arm(TimerKind::HandshakeRetry, self.rtt.rto()));
    }

    fn cancel_handshake_timer(&mut self) {
        if let Some(id) = self.handshake_timer.take() {
            self.timers.cancel(id);
        }
    }

    fn fail_pending_sends(&mut self, err: CapError) {
        while let Some(pending) = self.pending_sends.pop_front() {
            let _ = pending.done.send(Err(err.clone()));
        }
    }

    /// Abnormal end of the connection: everything stops, all parked application calls
    ///  learn the reason.
    fn teardown(&mut self, err: CapError) {
        warn!("connection torn down: {}", err);

        self.last_error = Some(err.clone());

        if let Some(waiter) = self.connect_waiter.take() {
            let _ = waiter.send(Err(err.clone()));
        }
        if let Some(waiter) = self.accept_waiter.take() {
            let _ = waiter.send(Err(err.clone()));
        }
        if let Some(waiter) = self.close_waiter.take() {
            let _ = waiter.send(Err(err.clone()));
        }
        self.fail_pending_sends(err.clone());
        while let Some(waiter) = self.recv_waiters.pop_front() {
            let _ = waiter.send(Err(err.clone()));
        }

        self.release();
    }

    /// Orderly release: no timers remain, the connection record is reset to CLOSED.
    fn release(&mut self) {
        self.timers.cancel_all();
        debug_assert!(self.timers.is_empty());
        self.handshake_timer = None;
        self.state = ConnectionState::Closed;
        self.peer_addr = None;
        self.cached_syn_ack = None;
        self.cached_handshake_ack = None;
        self.cached_fin_ack = None;
        self.cached_final_ack = None;
        self.fin_seq = None;
    }

    fn reset_protocol_state(&mut self) {
        self.reset_buffers();
        self.last_error = None;
        self.peer_addr = None;
        self.fin_seq = None;
        self.cached_syn_ack = None;
        self.cached_handshake_ack = None;
        self.cached_fin_ack = None;
        self.cached_final_ack = None;
    }

    /// Buffers and the RTT estimate are rebuilt from the current config so that options
    ///  set after `bind` take effect for the next incarnation of the connection.
    fn reset_buffers(&mut self) {
        self.send_buffer = SendBuffer::new(self.config.window, self.config.payload_max);
        self.recv_buffer = ReceiveBuffer::new(self.config.payload_max);
        self.rtt = RttEstimator::new(self.config.rto_initial, self.config.rto_min, self.config.rto_max);
        self.timers.cancel_all();
        self.handshake_timer = None;
    }
}

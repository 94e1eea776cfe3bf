//! Live UDP event listener.
//!
//! A receive thread classifies each datagram: command packets feed the
//! running scale total, data packets are decoded into an [`EventBuffer`].
//! The buffer is flushed to the output channel when the next packet would
//! overflow it, when it passes the near-full threshold, or when a timer
//! thread sees no flush for `idle_flush`.

use crate::buffer::{EventBuffer, DEFAULT_BUFFER_CAPACITY, DEFAULT_NEAR_FULL_FRACTION};
use crate::{Error, Result};
use qspace_core::RawEventBatch;
use qspace_instrument::{DataPacket, Packet, PacketCodec};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Default UDP port of the live event feed.
pub const DEFAULT_PORT: u16 = 8002;
/// Largest datagram accepted.
const MAX_DATAGRAM: usize = 65_536;

/// Listener settings.
#[derive(Clone, Debug)]
pub struct ListenerConfig {
    pub bind_address: String,
    pub port: u16,
    pub buffer_capacity: usize,
    pub near_full_fraction: f64,
    /// Longest time buffered events wait before being flushed.
    pub idle_flush: Duration,
    /// Socket read timeout; bounds how long shutdown takes to be noticed.
    pub read_timeout: Duration,
    pub codec: PacketCodec,
    /// Emit `1 / total` after every command packet.
    pub scaling: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            near_full_fraction: DEFAULT_NEAR_FULL_FRACTION,
            idle_flush: Duration::from_secs(1),
            read_timeout: Duration::from_millis(100),
            codec: PacketCodec::default(),
            scaling: true,
        }
    }
}

impl ListenerConfig {
    #[must_use]
    pub fn with_bind_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = address.into();
        self
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_near_full_fraction(mut self, fraction: f64) -> Self {
        self.near_full_fraction = fraction;
        self
    }

    #[must_use]
    pub fn with_idle_flush(mut self, idle: Duration) -> Self {
        self.idle_flush = idle;
        self
    }

    #[must_use]
    pub fn with_codec(mut self, codec: PacketCodec) -> Self {
        self.codec = codec;
        self
    }

    #[must_use]
    pub fn with_scaling(mut self, scaling: bool) -> Self {
        self.scaling = scaling;
        self
    }
}

/// Output of the listener.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    Events(RawEventBatch),
    /// Reciprocal of the accumulated scale total.
    ScaleFactor(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Waiting for the first data packet.
    Listening,
    Active,
    /// Dropping every packet until resumed.
    Paused,
}

/// Running counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub packets: u64,
    pub events: u64,
    pub dropped_packets: u64,
    pub dropped_records: u64,
    pub batches: u64,
}

#[derive(Default)]
struct Counters {
    packets: AtomicU64,
    events: AtomicU64,
    dropped_packets: AtomicU64,
    dropped_records: AtomicU64,
    batches: AtomicU64,
}

struct Staging {
    buffer: EventBuffer,
    last_flush: Instant,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Packet handling shared by the receive and timer threads.
///
/// Usable on its own to replay captured datagrams without a socket.
pub struct PacketProcessor {
    codec: PacketCodec,
    scaling: bool,
    idle_flush: Duration,
    staging: Mutex<Staging>,
    scale_total: Mutex<f64>,
    paused: AtomicBool,
    state: Mutex<ListenerState>,
    counters: Counters,
    sender: Sender<ListenerEvent>,
}

impl PacketProcessor {
    #[must_use]
    pub fn new(config: &ListenerConfig, sender: Sender<ListenerEvent>) -> Self {
        Self {
            codec: config.codec,
            scaling: config.scaling,
            idle_flush: config.idle_flush,
            staging: Mutex::new(Staging {
                buffer: EventBuffer::new(config.buffer_capacity, config.near_full_fraction),
                last_flush: Instant::now(),
            }),
            scale_total: Mutex::new(0.0),
            paused: AtomicBool::new(false),
            state: Mutex::new(ListenerState::Listening),
            counters: Counters::default(),
            sender,
        }
    }

    #[must_use]
    pub fn state(&self) -> ListenerState {
        *lock(&self.state)
    }

    /// Handles one datagram.
    pub fn process_packet(&self, bytes: &[u8]) {
        if self.paused.load(Ordering::SeqCst) {
            return;
        }
        self.counters.packets.fetch_add(1, Ordering::Relaxed);
        match self.codec.classify(bytes) {
            Err(err) => {
                self.counters.dropped_packets.fetch_add(1, Ordering::Relaxed);
                log::debug!("dropping packet: {err}");
            }
            Ok(Packet::Command { scale }) => self.add_scale(scale),
            Ok(Packet::Data(packet)) => self.stage(&packet),
        }
    }

    /// Appends a data packet's records, flushing around the append as the
    /// buffer requires.
    fn stage(&self, packet: &DataPacket<'_>) {
        let mut staging = lock(&self.staging);
        // a pause between the check in `process_packet` and here wins
        if self.paused.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut state = lock(&self.state);
            if *state == ListenerState::Listening {
                *state = ListenerState::Active;
            }
        }
        if staging.buffer.would_overflow(packet.num_records()) {
            self.flush_locked(&mut staging);
        }
        let dropped = staging.buffer.append_packet(packet);
        self.counters
            .events
            .fetch_add((packet.num_records() - dropped) as u64, Ordering::Relaxed);
        self.counters
            .dropped_records
            .fetch_add(dropped as u64, Ordering::Relaxed);
        if staging.buffer.is_near_full() {
            self.flush_locked(&mut staging);
        }
    }

    fn add_scale(&self, scale: f64) {
        let mut total = lock(&self.scale_total);
        *total += scale;
        if self.scaling
            && *total != 0.0
            && self.sender.send(ListenerEvent::ScaleFactor(1.0 / *total)).is_err()
        {
            log::debug!("event receiver gone; scale factor discarded");
        }
    }

    /// Accumulated scale total.
    #[must_use]
    pub fn scale_total(&self) -> f64 {
        *lock(&self.scale_total)
    }

    /// Emits buffered events as one batch; an empty buffer emits nothing.
    pub fn flush(&self) {
        let mut staging = lock(&self.staging);
        self.flush_locked(&mut staging);
    }

    /// Flushes if no flush happened for the idle interval.
    pub fn flush_if_idle(&self) {
        let mut staging = lock(&self.staging);
        if self.paused.load(Ordering::SeqCst) {
            return;
        }
        if staging.last_flush.elapsed() >= self.idle_flush {
            self.flush_locked(&mut staging);
        }
    }

    fn flush_locked(&self, staging: &mut Staging) {
        staging.last_flush = Instant::now();
        if staging.buffer.is_empty() {
            return;
        }
        let batch = staging.buffer.take();
        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        if self.sender.send(ListenerEvent::Events(batch)).is_err() {
            log::debug!("event receiver gone; batch discarded");
        }
    }

    /// Discards buffered events and drops all packets until [`Self::resume`].
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        lock(&self.staging).buffer.reset();
        *lock(&self.state) = ListenerState::Paused;
        log::info!("listener paused");
    }

    pub fn resume(&self) {
        *lock(&self.state) = ListenerState::Listening;
        self.paused.store(false, Ordering::SeqCst);
        log::info!("listener resumed");
    }

    #[must_use]
    pub fn stats(&self) -> ListenerStats {
        ListenerStats {
            packets: self.counters.packets.load(Ordering::Relaxed),
            events: self.counters.events.load(Ordering::Relaxed),
            dropped_packets: self.counters.dropped_packets.load(Ordering::Relaxed),
            dropped_records: self.counters.dropped_records.load(Ordering::Relaxed),
            batches: self.counters.batches.load(Ordering::Relaxed),
        }
    }
}

/// UDP listener with a receive thread and an idle-flush timer thread.
pub struct SocketEventListener {
    processor: Arc<PacketProcessor>,
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl SocketEventListener {
    /// Binds the socket and starts listening.
    ///
    /// # Errors
    /// Returns an I/O error if the socket cannot be bound or configured,
    /// or a configuration error for a zero idle interval.
    pub fn bind(config: &ListenerConfig, sender: Sender<ListenerEvent>) -> Result<Self> {
        if config.idle_flush.is_zero() {
            return Err(Error::InvalidConfig("idle_flush must be positive".to_string()));
        }
        let socket = UdpSocket::bind((config.bind_address.as_str(), config.port))?;
        socket.set_read_timeout(Some(config.read_timeout))?;
        let local_addr = socket.local_addr()?;
        log::info!("listening for events on {local_addr}");

        let processor = Arc::new(PacketProcessor::new(config, sender));
        let shutdown = Arc::new(AtomicBool::new(false));

        let receive = {
            let processor = Arc::clone(&processor);
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("qspace-udp-receive".to_string())
                .spawn(move || receive_loop(&socket, &processor, &shutdown))?
        };
        let timer = {
            let processor = Arc::clone(&processor);
            let shutdown = Arc::clone(&shutdown);
            let period = config.idle_flush / 4;
            thread::Builder::new()
                .name("qspace-udp-flush".to_string())
                .spawn(move || {
                    while !shutdown.load(Ordering::SeqCst) {
                        thread::sleep(period);
                        processor.flush_if_idle();
                    }
                })?
        };

        Ok(Self {
            processor,
            local_addr,
            shutdown,
            threads: vec![receive, timer],
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn processor(&self) -> &PacketProcessor {
        &self.processor
    }

    pub fn process_packet(&self, bytes: &[u8]) {
        self.processor.process_packet(bytes);
    }

    pub fn pause(&self) {
        self.processor.pause();
    }

    pub fn resume(&self) {
        self.processor.resume();
    }

    #[must_use]
    pub fn state(&self) -> ListenerState {
        self.processor.state()
    }

    /// Stops both threads and flushes what is left in the buffer.
    pub fn shutdown(mut self) -> ListenerStats {
        self.stop();
        self.processor.stats()
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                log::error!("listener thread panicked");
            }
        }
        self.processor.flush();
    }
}

impl Drop for SocketEventListener {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.stop();
        }
    }
}

fn receive_loop(socket: &UdpSocket, processor: &PacketProcessor, shutdown: &AtomicBool) {
    let mut datagram = vec![0u8; MAX_DATAGRAM];
    while !shutdown.load(Ordering::SeqCst) {
        match socket.recv_from(&mut datagram) {
            Ok((len, _)) => processor.process_packet(&datagram[..len]),
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(err) => {
                log::warn!("UDP receive failed: {err}");
            }
        }
    }
    log::info!("receive thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use qspace_instrument::packet::encode_data_packet;
    use std::sync::mpsc::{self, Receiver};

    fn processor(capacity: usize) -> (PacketProcessor, Receiver<ListenerEvent>) {
        let (tx, rx) = mpsc::channel();
        let config = ListenerConfig::default()
            .with_buffer_capacity(capacity)
            .with_idle_flush(Duration::from_secs(3600));
        (PacketProcessor::new(&config, tx), rx)
    }

    fn batch_sizes(rx: &Receiver<ListenerEvent>) -> Vec<usize> {
        rx.try_iter()
            .filter_map(|event| match event {
                ListenerEvent::Events(batch) => Some(batch.len()),
                ListenerEvent::ScaleFactor(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_record_count_from_length() {
        let (processor, rx) = processor(1000);
        let mut bytes = encode_data_packet(&[(10, 1), (20, 2), (30, 3)]);
        bytes.extend_from_slice(&[1, 2, 3]);
        processor.process_packet(&bytes);
        assert_eq!(processor.state(), ListenerState::Active);
        processor.flush();
        assert_eq!(batch_sizes(&rx), vec![3]);
        processor.flush();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_overflow_and_near_full_flush() {
        let (processor, rx) = processor(10);
        processor.process_packet(&encode_data_packet(&[(1, 1); 6]));
        // 6 + 6 would overflow: the first six go out before the append
        processor.process_packet(&encode_data_packet(&[(1, 1); 6]));
        assert_eq!(batch_sizes(&rx), vec![6]);
        // 6 + 3 = 9 reaches the near-full mark
        processor.process_packet(&encode_data_packet(&[(1, 1); 3]));
        assert_eq!(batch_sizes(&rx), vec![9]);
    }

    #[test]
    fn test_pause_semantics() {
        let (processor, rx) = processor(1000);
        processor.process_packet(&encode_data_packet(&[(1, 1); 4]));
        processor.pause();
        assert_eq!(processor.state(), ListenerState::Paused);
        processor.process_packet(&encode_data_packet(&[(1, 1); 5]));
        processor.process_packet(&PacketCodec::default().encode_command(2.0));
        processor.flush();
        assert!(rx.try_recv().is_err());
        assert_relative_eq!(processor.scale_total(), 0.0);

        processor.resume();
        processor.process_packet(&encode_data_packet(&[(1, 1); 2]));
        processor.flush();
        assert_eq!(batch_sizes(&rx), vec![2]);
    }

    #[test]
    fn test_pause_wins_over_packet_in_flight() {
        let (tx, rx) = mpsc::channel();
        let config = ListenerConfig::default().with_idle_flush(Duration::ZERO);
        let processor = PacketProcessor::new(&config, tx);
        let bytes = encode_data_packet(&[(1, 1); 4]);
        let Ok(Packet::Data(packet)) = PacketCodec::default().classify(&bytes) else {
            panic!("not a data packet");
        };

        // the packet passed the entry check just before the pause
        processor.pause();
        processor.stage(&packet);
        processor.flush_if_idle();
        assert!(rx.try_recv().is_err());
        assert_eq!(processor.stats().events, 0);
        assert_eq!(processor.state(), ListenerState::Paused);

        processor.resume();
        processor.stage(&packet);
        processor.flush_if_idle();
        assert_eq!(batch_sizes(&rx), vec![4]);
    }

    #[test]
    fn test_scale_factor_without_receiver() {
        let (tx, rx) = mpsc::channel();
        let processor = PacketProcessor::new(&ListenerConfig::default().with_scaling(true), tx);
        drop(rx);
        processor.process_packet(&PacketCodec::default().encode_command(2.0));
        assert_relative_eq!(processor.scale_total(), 2.0);
    }

    #[test]
    fn test_scale_accumulation() {
        let (processor, rx) = processor(1000);
        let codec = PacketCodec::default();
        processor.process_packet(&codec.encode_command(2.0));
        processor.process_packet(&codec.encode_command(-2.0));
        processor.process_packet(&codec.encode_command(4.0));
        let factors: Vec<f64> = rx
            .try_iter()
            .filter_map(|event| match event {
                ListenerEvent::ScaleFactor(f) => Some(f),
                ListenerEvent::Events(_) => None,
            })
            .collect();
        assert_eq!(factors, vec![0.5, 0.25]);
    }

    #[test]
    fn test_short_packets_dropped() {
        let (processor, rx) = processor(1000);
        processor.process_packet(&[0u8; 20]);
        let mut command = PacketCodec::default().encode_command(1.0);
        command.truncate(40);
        processor.process_packet(&command);
        processor.flush();
        assert!(rx.try_recv().is_err());
        assert_eq!(processor.stats().dropped_packets, 2);
    }
}

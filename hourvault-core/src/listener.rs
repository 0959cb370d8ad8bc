//! UDP listener - datagrams into log records

use crate::config::{LISTENER_POLL_TIMEOUT, MAX_DATAGRAM_SIZE, RECV_BUFFER_SIZE};
use crate::queue::QueueProducer;
use crate::{Clock, LogRecord, Result, VaultError};
use bytes::Bytes;
use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Listener configuration
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address and port to bind
    pub bind_addr: SocketAddr,
    /// Requested SO_RCVBUF; best effort
    pub recv_buffer_size: usize,
    /// Readability wait before re-checking cancellation
    pub poll_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, crate::config::UNPRIVILEGED_PORT)),
            recv_buffer_size: RECV_BUFFER_SIZE,
            poll_timeout: LISTENER_POLL_TIMEOUT,
        }
    }
}

/// Listener counters, returned when the listener exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ListenerStats {
    pub received: u64,
    pub dropped: u64,
    pub recv_errors: u64,
}

const ERROR_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ERROR_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Delay and warning throttle for consecutive receive errors
#[derive(Debug, Default)]
struct ErrorBackoff {
    streak: u32,
}

impl ErrorBackoff {
    /// Register one failure; returns the pause before the next receive
    /// and whether this failure should be logged at warn level
    fn fail(&mut self) -> (Duration, bool) {
        self.streak = self.streak.saturating_add(1);
        let delay = ERROR_BACKOFF_MIN
            .saturating_mul(1 << (self.streak - 1).min(7))
            .min(ERROR_BACKOFF_MAX);
        (delay, self.streak.is_power_of_two())
    }

    fn reset(&mut self) {
        self.streak = 0;
    }
}

/// Source host as stored, with IPv4-mapped IPv6 peers in dotted form
fn peer_host(peer: SocketAddr) -> String {
    peer.ip().to_canonical().to_string()
}

/// Bound datagram socket
#[derive(Debug)]
pub struct Listener {
    socket: UdpSocket,
    clock: Arc<dyn Clock>,
}

impl Listener {
    /// Bind the socket, enlarging its receive buffer first
    pub fn bind(config: &ListenerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let addr = config.bind_addr;
        let bind_err = move |source: std::io::Error| VaultError::Bind { addr, source };

        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
            .map_err(bind_err)?;

        if let Err(e) = socket.set_recv_buffer_size(config.recv_buffer_size) {
            warn!(
                requested = config.recv_buffer_size,
                error = %e,
                "Failed to enlarge socket receive buffer"
            );
        }

        socket.bind(&addr.into()).map_err(bind_err)?;

        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(config.poll_timeout))?;

        Ok(Self { socket, clock })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Wait up to the poll timeout for one datagram
    ///
    /// Returns `Ok(None)` when nothing arrived.
    pub fn receive_once(&self, buf: &mut [u8]) -> Result<Option<LogRecord>> {
        match self.socket.recv_from(buf) {
            Ok((len, peer)) => {
                let record = LogRecord::new(
                    self.clock.now(),
                    peer_host(peer),
                    Bytes::copy_from_slice(&buf[..len]),
                );
                Ok(Some(record))
            }
            Err(e) if is_timeout(e.kind()) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Receive until cancelled, handing records to the queue
    ///
    /// The producer is dropped on return, which lets the writer drain
    /// what is left and stop.
    pub fn run(self, producer: QueueProducer, token: CancellationToken) -> ListenerStats {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut stats = ListenerStats::default();
        let mut backoff = ErrorBackoff::default();

        if let Ok(addr) = self.local_addr() {
            info!(%addr, "Listening for datagrams");
        }

        while !token.is_cancelled() {
            match self.receive_once(&mut buf) {
                Ok(Some(record)) => {
                    backoff.reset();
                    stats.received += 1;
                    if !producer.enqueue(record) {
                        stats.dropped += 1;
                        warn!(
                            pending = producer.len(),
                            dropped = stats.dropped,
                            "Queue is full, dropping message"
                        );
                    }
                }
                Ok(None) => backoff.reset(),
                Err(e) => {
                    stats.recv_errors += 1;
                    let (delay, loud) = backoff.fail();
                    if loud {
                        warn!(error = %e, errors = stats.recv_errors, "Receive failed");
                    } else {
                        debug!(error = %e, "Receive failed");
                    }
                    std::thread::sleep(delay);
                }
            }
        }

        debug!(
            received = stats.received,
            dropped = stats.dropped,
            recv_errors = stats.recv_errors,
            "Listener stopped"
        );
        stats
    }
}

fn is_timeout(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
    )
}

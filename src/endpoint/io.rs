//! Socket plumbing for endpoints.
//!
//! An endpoint never awaits while it is borrowed. Instead it describes what it waits for as a
//!  [WaitTarget] holding shared handles to its sockets, the connection awaits that target with a
//!  slice of the caller's timeout, and the resulting [IoEvent] is fed back into the endpoint, which
//!  then does all actual reading and writing with non-blocking `try_*` calls.

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::Interest;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, warn};

use crate::error::BusError;

pub(crate) type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>>>>;

/// A TCP connect in flight. It survives several `service()` calls if need be.
pub(crate) struct PendingConnect {
    pub addr: SocketAddr,
    pub fut: ConnectFuture,
    pub deadline: Instant,
}

impl PendingConnect {
    pub fn start(addr: SocketAddr, connect_timeout: Duration) -> PendingConnect {
        PendingConnect {
            addr,
            fut: Box::pin(TcpStream::connect(addr)),
            deadline: Instant::now() + connect_timeout,
        }
    }
}

/// "please call me back", sent by a client to a server's well-known UDP port
pub(crate) struct RendezvousRequest {
    pub udp: Rc<UdpSocket>,
    pub payload: Bytes,
}

pub(crate) enum WaitTarget {
    Idle,
    Accept {
        listener: Rc<TcpListener>,
        request: Option<RendezvousRequest>,
    },
    Connect(PendingConnect),
    Stream {
        tcp: Rc<TcpStream>,
        udp_in: Option<Rc<UdpSocket>>,
        /// only present if there is a datagram waiting to be sent
        udp_out: Option<Rc<UdpSocket>>,
        want_write: bool,
    },
}

pub(crate) enum IoEvent {
    Accepted(TcpStream),
    Connected(TcpStream),
    ConnectPending(PendingConnect),
    ConnectFailed(SocketAddr, io::Error),
    Ready,
    TimedOut,
}

impl WaitTarget {
    pub async fn wait(self, budget: Duration) -> IoEvent {
        let deadline = Instant::now() + budget;

        match self {
            WaitTarget::Idle => {
                sleep(budget).await;
                IoEvent::TimedOut
            }
            WaitTarget::Accept { listener, request } => {
                if let Some(request) = request {
                    match timeout_at(deadline, request.udp.send(&request.payload)).await {
                        Ok(Ok(_)) => debug!("sent rendezvous request {:?}", String::from_utf8_lossy(&request.payload)),
                        Ok(Err(e)) => warn!("could not send rendezvous request: {}", e),
                        Err(_) => debug!("timed out sending rendezvous request"),
                    }
                }
                match timeout_at(deadline, listener.accept()).await {
                    Ok(Ok((stream, peer))) => {
                        debug!("accepted call back from {}", peer);
                        IoEvent::Accepted(stream)
                    }
                    Ok(Err(e)) => {
                        warn!("error accepting call back: {}", e);
                        IoEvent::TimedOut
                    }
                    Err(_) => IoEvent::TimedOut,
                }
            }
            WaitTarget::Connect(mut pending) => {
                let wait_until = deadline.min(pending.deadline);
                match timeout_at(wait_until, &mut pending.fut).await {
                    Ok(Ok(stream)) => IoEvent::Connected(stream),
                    Ok(Err(e)) => IoEvent::ConnectFailed(pending.addr, e),
                    Err(_) if Instant::now() >= pending.deadline => {
                        IoEvent::ConnectFailed(pending.addr, io::ErrorKind::TimedOut.into())
                    }
                    Err(_) => IoEvent::ConnectPending(pending),
                }
            }
            WaitTarget::Stream { tcp, udp_in, udp_out, want_write } => {
                let interest = if want_write {
                    Interest::READABLE | Interest::WRITABLE
                }
                else {
                    Interest::READABLE
                };

                let udp_readable = async {
                    match &udp_in {
                        Some(udp) => udp.readable().await,
                        None => std::future::pending().await,
                    }
                };
                let udp_writable = async {
                    match &udp_out {
                        Some(udp) => udp.writable().await,
                        None => std::future::pending().await,
                    }
                };

                tokio::select! {
                    // errors show up again when the endpoint actually reads or writes
                    _ = tcp.ready(interest) => IoEvent::Ready,
                    _ = udp_readable => IoEvent::Ready,
                    _ = udp_writable => IoEvent::Ready,
                    _ = sleep(budget) => IoEvent::TimedOut,
                }
            }
        }
    }
}

pub(crate) fn bind_udp(ip: IpAddr) -> io::Result<UdpSocket> {
    let socket = std::net::UdpSocket::bind(SocketAddr::new(ip, 0))?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket)
}

/// a UDP socket that sends to `remote` only, bound to the local interface `ip`
pub(crate) fn connect_udp(ip: IpAddr, remote: SocketAddr) -> io::Result<UdpSocket> {
    let socket = std::net::UdpSocket::bind(SocketAddr::new(ip, 0))?;
    socket.connect(remote)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket)
}

pub(crate) fn bind_tcp_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let listener = std::net::TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    TcpListener::from_std(listener)
}

/// the local interface address a socket uses to reach `remote`
pub(crate) fn local_ip_towards(remote: SocketAddr) -> io::Result<IpAddr> {
    let unspecified: IpAddr = match remote {
        SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    };
    let route = std::net::UdpSocket::bind(SocketAddr::new(unspecified, 0))?;
    route.connect(remote)?;
    Ok(route.local_addr()?.ip())
}

/// A rendezvous request is the ASCII text `"<host> <port>"`, NUL terminated
pub fn rendezvous_request(callback: SocketAddr) -> Bytes {
    Bytes::from(format!("{} {}\0", callback.ip(), callback.port()))
}

pub fn parse_rendezvous_request(buf: &[u8]) -> Result<(String, u16), BusError> {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let text = std::str::from_utf8(&buf[..end])
        .map_err(|_| BusError::Framing("rendezvous request is not ASCII".to_string()))?;

    let mut parts = text.split_whitespace();
    let (Some(host), Some(port), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(BusError::Framing(format!("malformed rendezvous request {:?}", text)));
    };
    let port = port.parse::<u16>()
        .map_err(|_| BusError::Framing(format!("invalid port in rendezvous request {:?}", text)))?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_rendezvous_request() {
        let payload = rendezvous_request("192.168.1.7:40000".parse().unwrap());
        assert_eq!(payload.as_ref(), b"192.168.1.7 40000\0");
        assert_eq!(parse_rendezvous_request(&payload).unwrap(), ("192.168.1.7".to_string(), 40000));
    }

    #[rstest]
    #[case::hostname(b"tracker-host 3883\0", Some(("tracker-host", 3883)))]
    #[case::no_nul(b"10.0.0.1 1", Some(("10.0.0.1", 1)))]
    #[case::missing_port(b"10.0.0.1\0", None)]
    #[case::bad_port(b"10.0.0.1 70000\0", None)]
    #[case::extra(b"10.0.0.1 1 2\0", None)]
    fn test_parse_rendezvous_request(#[case] buf: &[u8], #[case] expected: Option<(&str, u16)>) {
        let actual = parse_rendezvous_request(buf).ok();
        assert_eq!(actual.as_ref().map(|(h, p)| (h.as_str(), *p)), expected);
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let listener = bind_tcp_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut event = WaitTarget::Connect(PendingConnect::start(addr, Duration::from_secs(2)))
            .wait(Duration::from_secs(1))
            .await;
        while let IoEvent::ConnectPending(pending) = event {
            event = WaitTarget::Connect(pending).wait(Duration::from_secs(1)).await;
        }
        assert!(matches!(event, IoEvent::ConnectFailed(a, _) if a == addr));
    }
}

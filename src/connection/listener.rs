use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::time::Duration;

use tokio::net::{lookup_host, TcpListener, TcpStream, UdpSocket};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::config::TransportMode;
use crate::endpoint::io::{bind_tcp_listener, parse_rendezvous_request};
use crate::error::BusError;

const MAX_REQUEST_LEN: usize = 512;

pub(crate) enum ListenerEvent {
    Accepted(TcpStream),
    CallbackRequested(SocketAddr),
    Idle,
}

/// A server's well-known port: TCP for clients connecting directly, and UDP for clients asking
///  to be called back
pub(crate) struct Listener {
    tcp: Rc<TcpListener>,
    udp: Option<Rc<UdpSocket>>,
}

impl Listener {
    pub fn bind(addr: SocketAddr, transport: TransportMode) -> Result<Listener, BusError> {
        let tcp = bind_tcp_listener(addr)?;
        let udp = match transport {
            TransportMode::TcpOnly => None,
            TransportMode::UdpRendezvous => {
                let socket = std::net::UdpSocket::bind(tcp.local_addr()?)?;
                socket.set_nonblocking(true)?;
                Some(Rc::new(UdpSocket::from_std(socket)?))
            }
        };
        debug!("listening on {:?}", tcp.local_addr());

        Ok(Listener {
            tcp: Rc::new(tcp),
            udp,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BusError> {
        Ok(self.tcp.local_addr()?)
    }

    pub async fn wait(&self, budget: Duration) -> ListenerEvent {
        let request = async {
            let Some(udp) = &self.udp else {
                return std::future::pending().await;
            };
            let mut buf = vec![0u8; MAX_REQUEST_LEN];
            let (len, from) = udp.recv_from(&mut buf).await?;
            buf.truncate(len);
            Ok::<_, std::io::Error>((buf, from))
        };

        let deadline = tokio::time::Instant::now() + budget;
        tokio::select! {
            r = self.tcp.accept() => match r {
                Ok((stream, peer)) => {
                    debug!("accepted connection from {}", peer);
                    ListenerEvent::Accepted(stream)
                }
                Err(e) => {
                    warn!("error accepting connection: {}", e);
                    ListenerEvent::Idle
                }
            },
            r = request => match r {
                Ok((buf, from)) => {
                    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                    Self::on_request(&buf, from, remaining).await
                }
                Err(e) => {
                    debug!("error receiving rendezvous request: {}", e);
                    ListenerEvent::Idle
                }
            },
            _ = sleep(budget) => ListenerEvent::Idle,
        }
    }

    async fn on_request(buf: &[u8], from: SocketAddr, budget: Duration) -> ListenerEvent {
        let (host, port) = match parse_rendezvous_request(buf) {
            Ok(r) => r,
            Err(e) => {
                warn!("ignoring rendezvous request from {}: {}", from, e);
                return ListenerEvent::Idle;
            }
        };

        if let Ok(ip) = host.parse::<IpAddr>() {
            return ListenerEvent::CallbackRequested(SocketAddr::new(ip, port));
        }

        let resolved = timeout(budget, lookup_host((host.as_str(), port))).await;
        match resolved {
            Ok(Ok(mut addrs)) => match addrs.next() {
                Some(addr) => ListenerEvent::CallbackRequested(addr),
                None => {
                    warn!("rendezvous request from {}: {:?} does not resolve", from, host);
                    ListenerEvent::Idle
                }
            },
            Ok(Err(e)) => {
                warn!("rendezvous request from {}: could not resolve {:?}: {}", from, host, e);
                ListenerEvent::Idle
            }
            Err(_) => {
                warn!("rendezvous request from {}: timed out resolving {:?}", from, host);
                ListenerEvent::Idle
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::endpoint::io::rendezvous_request;

    #[tokio::test]
    async fn test_rendezvous_request_is_reported() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), TransportMode::UdpRendezvous).unwrap();
        let server = listener.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let callback: SocketAddr = "127.0.0.1:40404".parse().unwrap();
        client.send_to(&rendezvous_request(callback), server).await.unwrap();

        let mut event = ListenerEvent::Idle;
        for _ in 0..100 {
            event = listener.wait(Duration::from_millis(20)).await;
            if !matches!(event, ListenerEvent::Idle) {
                break;
            }
        }
        assert!(matches!(event, ListenerEvent::CallbackRequested(addr) if addr == callback));
    }

    #[tokio::test]
    async fn test_rendezvous_request_with_host_name() {
        let event = Listener::on_request(b"localhost 40405\0", "127.0.0.1:1".parse().unwrap(), Duration::from_secs(5)).await;
        assert!(matches!(event, ListenerEvent::CallbackRequested(addr) if addr.port() == 40405 && addr.ip().is_loopback()));

        let event = Listener::on_request(b"localhost\0", "127.0.0.1:1".parse().unwrap(), Duration::from_secs(5)).await;
        assert!(matches!(event, ListenerEvent::Idle));
    }

    #[tokio::test]
    async fn test_accept() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), TransportMode::TcpOnly).unwrap();
        let server = listener.local_addr().unwrap();

        let (stream, event) = tokio::join!(TcpStream::connect(server), listener.wait(Duration::from_secs(5)));
        let stream = stream.unwrap();
        match event {
            ListenerEvent::Accepted(accepted) => assert_eq!(accepted.peer_addr().unwrap(), stream.local_addr().unwrap()),
            _ => panic!("expected an accepted connection"),
        }
    }
}

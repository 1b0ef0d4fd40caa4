//! Control-channel accept loop.
//!
//! The dispatcher owns the control listener and the data-port pool. Each
//! accepted connection moves into its own session worker thread; workers
//! share nothing but the pool. Session failures never take the dispatcher
//! down.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::sync::Arc;

use crate::clock;
use crate::constants::{BASE_PORT, NUM_PORTS};
use crate::error::Result;
use crate::net;
use crate::port_pool::PortPool;
use crate::session::{self, SessionOptions};

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Control port to listen on.
    pub port: u16,
    /// First data port (the pool spans `num_ports` from here).
    pub base_port: u16,
    pub num_ports: usize,
    /// Per-session data dumps, if set.
    pub log_dir: Option<std::path::PathBuf>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            port: 0,
            base_port: BASE_PORT,
            num_ports: NUM_PORTS,
            log_dir: None,
        }
    }
}

pub struct Dispatcher {
    listener: TcpListener,
    pool: Arc<PortPool>,
    session_options: SessionOptions,
}

impl Dispatcher {
    pub fn bind(options: &ServerOptions) -> Result<Dispatcher> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), options.port);
        let listener = net::tcp_listener(addr)?;
        let local = listener.local_addr()?;
        tracing::info!(
            addr = %local,
            data_port_base = options.base_port,
            data_port_count = options.num_ports,
            "listening"
        );
        Ok(Dispatcher {
            listener,
            pool: PortPool::new(options.base_port, options.num_ports),
            session_options: SessionOptions {
                log_dir: options.log_dir.clone(),
            },
        })
    }

    /// The bound control address (useful when `port` was 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept forever. Each control connection gets one worker thread that
    /// takes ownership of the socket.
    pub fn run(&self) -> Result<()> {
        clock::ignore_sigpipe();
        let mut session_no: u64 = 0;
        loop {
            let (control, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };
            session_no += 1;
            tracing::info!(%peer, session_no, "control connection");

            let pool = Arc::clone(&self.pool);
            let options = self.session_options.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("mbm-session-{session_no}"))
                .spawn(move || session::handle_session(control, peer, pool, options));
            if let Err(e) = spawned {
                tracing::error!(error = %e, "failed to spawn session worker");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{run_once, ClientOptions};
    use crate::config::{SocketType, TestConfig};
    use crate::verdict::Verdict;

    /// Spin up a dispatcher on an ephemeral control port with its own data
    /// port range, detached.
    fn start_server(base_port: u16, num_ports: usize) -> SocketAddr {
        let dispatcher = Dispatcher::bind(&ServerOptions {
            port: 0,
            base_port,
            num_ports,
            log_dir: None,
        })
        .unwrap();
        let addr = dispatcher.local_addr().unwrap();
        std::thread::spawn(move || dispatcher.run());
        addr
    }

    fn client_options(addr: SocketAddr) -> ClientOptions {
        ClientOptions {
            server: "127.0.0.1".into(),
            port: addr.port(),
            log_dir: None,
        }
    }

    #[test]
    fn test_tcp_loopback_pass() {
        let addr = start_server(21345, 10);
        let options = client_options(addr);

        // Loopback comfortably sustains 10 Mb/s; the SPRT should decide
        // PASS at an early sampling boundary.
        let config = TestConfig::new(SocketType::Tcp, 10_000, 10, 1460, 0);
        let report = run_once(&options, &config).unwrap();

        assert_eq!(report.verdict, Verdict::Pass);
        assert!(report.packets_received > 0);
        assert_eq!(report.bytes_per_chunk, 1460);
        // The client should have seen nearly everything the server paced out.
        assert!(report.bytes_received >= report.packets_received * 1460);
    }

    // Full-length UDP run: no kernel sampler, so the SPRT only fires at the
    // end of the 30-second budget. Slow; run with --ignored.
    #[test]
    #[ignore]
    fn test_udp_loopback_pass() {
        let addr = start_server(21385, 10);
        let options = client_options(addr);

        let config = TestConfig::new(SocketType::Udp, 600, 200, 1460, 0);
        let report = run_once(&options, &config).unwrap();

        assert_eq!(report.verdict, Verdict::Pass);
        assert!(report.packets_received > 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let addr = start_server(21360, 10);
        let options = client_options(addr);

        // Zero rate is sent to the server untouched; rejection is its call.
        let config = TestConfig::new(SocketType::Tcp, 0, 10, 1460, 0);
        let report = run_once(&options, &config).unwrap();

        assert_eq!(report.verdict, Verdict::Error);
        assert_eq!(report.packets_received, 0);
    }

    #[test]
    fn test_pool_exhaustion_rejected() {
        use crate::protocol;
        use std::net::TcpStream;

        // A single-slot pool: the first session pins the slot by stalling
        // in its handshake, the second must be turned away.
        let addr = start_server(21375, 1);

        let config = TestConfig::new(SocketType::Tcp, 600, 10, 1460, 0);
        let mut first = TcpStream::connect(addr).unwrap();
        protocol::send_config(&mut first, &config).unwrap();
        let first_port = protocol::recv_port(&mut first).unwrap();
        assert_ne!(first_port, 0);

        let mut second = TcpStream::connect(addr).unwrap();
        protocol::send_config(&mut second, &config).unwrap();
        assert_eq!(protocol::recv_port(&mut second).unwrap(), 0);
        assert_eq!(
            protocol::recv_verdict(&mut second).unwrap(),
            Verdict::Error
        );
    }
}

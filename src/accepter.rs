use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use anyhow::{anyhow, bail};
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::MessengerConfig;
use crate::messenger::Messenger;
use crate::node_addr::NodeAddr;
use crate::safe_converter::PrecheckedCast;

/// Consecutive accept failures after which the worker gives up. The boundary is exact:
///  the fourth straight failure ends the loop, there is no fifth attempt.
const MAX_ACCEPT_ERRORS: u32 = 4;

/// The single listening socket: binds a requested port (or scans the configured range),
///  publishes the effective address, and hands every accepted socket to the messenger as a
///  server-side pipe.
pub(crate) struct Accepter {
    msgr: Weak<Messenger>,
    config: Arc<MessengerConfig>,
    listener: StdMutex<Option<Arc<TcpListener>>>,
    shutdown: StdMutex<Option<watch::Sender<bool>>>,
    worker: StdMutex<Option<JoinHandle<()>>>,
}

impl Accepter {
    pub fn new(msgr: &Arc<Messenger>) -> Arc<Accepter> {
        Arc::new(Accepter {
            msgr: Arc::downgrade(msgr),
            config: msgr.config().clone(),
            listener: StdMutex::new(None),
            shutdown: StdMutex::new(None),
            worker: StdMutex::new(None),
        })
    }

    fn make_socket(&self, addr: SocketAddr) -> anyhow::Result<TcpSocket> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if self.config.tcp_rcvbuf > 0 {
            // accepted sockets inherit the listener's receive buffer
            socket.set_recv_buffer_size(self.config.tcp_rcvbuf.prechecked_cast())?;
        }
        Ok(socket)
    }

    /// Bind `bind_addr`. A zero port scans `[bind_port_min, bind_port_max]`, skipping the
    ///  avoid ports. Publishes the effective address to the messenger and returns it.
    pub async fn bind(
        &self,
        bind_addr: SocketAddr,
        avoid_port1: u16,
        avoid_port2: u16,
    ) -> anyhow::Result<NodeAddr> {
        debug!("accepter binding to {:?}", bind_addr);

        let listener = if bind_addr.port() != 0 {
            let socket = self.make_socket(bind_addr)?;
            // reuse addr+port when possible
            socket.set_reuseaddr(true)?;
            socket
                .bind(bind_addr)
                .map_err(|e| anyhow!("unable to bind to {}: {}", bind_addr, e))?;
            socket.listen(128)?
        } else {
            let mut bound = None;
            for port in self.config.bind_port_min..=self.config.bind_port_max {
                if port == avoid_port1 || port == avoid_port2 {
                    continue;
                }
                let candidate = SocketAddr::new(bind_addr.ip(), port);
                let socket = self.make_socket(candidate)?;
                if socket.bind(candidate).is_ok() {
                    bound = Some(socket.listen(128)?);
                    break;
                }
            }
            match bound {
                Some(listener) => {
                    trace!("accepter bound on a scanned port");
                    listener
                }
                None => bail!(
                    "unable to bind to {} on any port in range {}-{}",
                    bind_addr.ip(),
                    self.config.bind_port_min,
                    self.config.bind_port_max
                ),
            }
        };

        // what port did we get?
        let effective = listener.local_addr()?;
        info!("accepter bound to {:?}", effective);

        let msgr = self
            .msgr
            .upgrade()
            .ok_or_else(|| anyhow!("messenger is gone"))?;
        // keep the requested IP (possibly a wildcard the peers will fill in) but adopt the
        // effective port
        msgr.set_bound_addr(SocketAddr::new(bind_addr.ip(), effective.port()));

        *self.listener.lock().unwrap() = Some(Arc::new(listener));
        Ok(msgr.my_addr())
    }

    pub fn start(&self) {
        let listener = self
            .listener
            .lock()
            .unwrap()
            .clone()
            .expect("start() requires a bound listener");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown.lock().unwrap() = Some(shutdown_tx);

        let msgr = self.msgr.clone();
        let worker = tokio::spawn(Self::accept_loop(msgr, listener, shutdown_rx));
        *self.worker.lock().unwrap() = Some(worker);
    }

    /// Unblock the worker, join it, then drop the listening socket.
    pub async fn stop(&self) {
        debug!("stopping accepter");
        if let Some(shutdown) = self.shutdown.lock().unwrap().take() {
            let _ = shutdown.send(true);
        }
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        *self.listener.lock().unwrap() = None;
    }

    /// Stop, forget the learned address, and bind again with the old port avoided.
    pub async fn rebind(&self, avoid_port: u16) -> anyhow::Result<NodeAddr> {
        debug!("accepter rebinding, avoiding port {}", avoid_port);
        self.stop().await;

        let msgr = self
            .msgr
            .upgrade()
            .ok_or_else(|| anyhow!("messenger is gone"))?;
        msgr.unlearn_addr();

        let old = msgr.my_addr();
        let old_port = old.port();
        let addr = SocketAddr::new(old.socket_addr.ip(), 0);

        let bound = self.bind(addr, old_port, avoid_port).await?;
        self.start();
        Ok(bound)
    }

    async fn accept_loop(
        msgr: Weak<Messenger>,
        listener: Arc<TcpListener>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!("accepter starting");
        let mut errors: u32 = 0;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            errors = 0;
                            debug!("accepted incoming connection from {:?}", addr);
                            let Some(msgr) = msgr.upgrade() else { break; };
                            msgr.add_accept_pipe(stream).await;
                        }
                        Err(e) => {
                            warn!("accept error: {}", e);
                            errors += 1;
                            if errors >= MAX_ACCEPT_ERRORS {
                                warn!("{} consecutive accept errors, accepter giving up", errors);
                                break;
                            }
                        }
                    }
                }
            }
        }
        debug!("accepter stopping");
    }
}

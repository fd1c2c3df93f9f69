use std::{net::SocketAddr, sync::Mutex};

use tokio::net::{TcpSocket, TcpStream};
use tracing::debug;

use crate::{
    address::Protocol,
    client::ClientInner,
    connection::{next_id, Connection, Transport},
    error::{Error, TimeoutError},
    event::Events,
    h1::proto::H1Stream,
    h2::connection::{H2Config, H2Connection},
    http::StatusCode,
    route::Route,
    timeout::timed,
    tls::stream::BoxedIo,
    tunnel::{self, Tunnel},
};

impl ClientInner {
    /// Establish a connection over one route: tcp, optional CONNECT tunnel, optional tls and the
    /// protocol handshake.
    pub(crate) async fn connect(&self, route: &Route, events: &Events) -> Result<Connection, Error> {
        events.connect_start(route);

        match self.connect_inner(route, events).await {
            Ok(conn) => {
                debug!("connection {} to {route} established with {:?}", conn.id(), conn.protocol());
                events.connect_end(route, conn.protocol());
                Ok(conn)
            }
            Err(e) => {
                debug!("connect to {route} failed: {e}");
                events.connect_failed(route, &e);
                Err(e)
            }
        }
    }

    async fn connect_inner(&self, route: &Route, events: &Events) -> Result<Connection, Error> {
        let address = route.address();

        let io = if route.requires_tunnel() {
            self.make_tunnel(route).await?
        } else {
            Box::new(self.make_tcp(route.socket_addr()).await?) as BoxedIo
        };

        let (io, protocol, handshake) = if address.is_tls() {
            events.secure_connect_start();

            let (io, handshake) = timed(
                self.connector.connect(address.host(), address.protocols(), io),
                self.timeout_config.tls_connect_timeout,
                TimeoutError::TlsHandshake,
            )
            .await?;

            events.secure_connect_end(handshake.protocol);

            let protocol = handshake.protocol.unwrap_or(Protocol::Http11);
            (io, protocol, Some(handshake))
        } else if address.is_prior_knowledge() && route.proxy().is_direct() {
            (io, Protocol::H2PriorKnowledge, None)
        } else {
            (io, Protocol::Http11, None)
        };

        let id = next_id();

        let (transport, queue) = if protocol.is_multiplexed() {
            let config = H2Config {
                initial_window_size: self.h2_initial_window_size,
                read_timeout: self.timeout_config.read_timeout,
                write_timeout: self.timeout_config.write_timeout,
            };

            let h2 = H2Connection::handshake(io, &config, self.pool.shutdown_hook(id)).await?;

            let queue = self.h2_ping_interval.map(|interval| {
                let queue = self.runner.queue(format!("h2 ping {id}"));
                h2.keepalive(&queue, interval);
                queue
            });

            (Transport::H2(h2), queue)
        } else {
            (Transport::H1(Mutex::new(Some(H1Stream::new(io)))), None)
        };

        Ok(Connection::new(id, route.clone(), protocol, handshake, transport, queue))
    }

    async fn make_tunnel(&self, route: &Route) -> Result<BoxedIo, Error> {
        let mut req = tunnel::request(route.address())?;
        let mut authenticated = false;
        let mut io = Box::new(self.make_tcp(route.socket_addr()).await?) as BoxedIo;

        loop {
            match tunnel::open(io, &req, &self.timeout_config).await? {
                Tunnel::Ready(io) => return Ok(io),
                Tunnel::Challenge { response, io: reusable } => {
                    if authenticated {
                        return Err(Error::Tunnel(StatusCode::PROXY_AUTHENTICATION_REQUIRED));
                    }
                    authenticated = true;

                    req = self
                        .proxy_authenticator
                        .as_ref()
                        .and_then(|auth| auth.authenticate(Some(route), &response, &req))
                        .ok_or(Error::Tunnel(StatusCode::PROXY_AUTHENTICATION_REQUIRED))?;

                    io = match reusable {
                        Some(io) => io,
                        None => Box::new(self.make_tcp(route.socket_addr()).await?),
                    };
                }
            }
        }
    }

    async fn make_tcp(&self, addr: SocketAddr) -> Result<TcpStream, Error> {
        let stream = timed(
            self.maybe_connect_with_local_addr(addr),
            self.timeout_config.connect_timeout,
            TimeoutError::Connect,
        )
        .await?;

        let _ = stream.set_nodelay(true);

        Ok(stream)
    }

    async fn maybe_connect_with_local_addr(&self, addr: SocketAddr) -> Result<TcpStream, Error> {
        match self.local_addr {
            Some(local_addr) => {
                let socket = match local_addr {
                    SocketAddr::V4(_) => TcpSocket::new_v4()?,
                    SocketAddr::V6(_) => TcpSocket::new_v6()?,
                };
                socket.bind(local_addr)?;
                socket.connect(addr).await.map_err(Into::into)
            }
            None => TcpStream::connect(addr).await.map_err(Into::into),
        }
    }
}

//! Transports that sessions run over
use futures::prelude::*;

/// A reliable byte stream with address metadata.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Name of the network, for example `"tcp"`.
    fn network(&self) -> &'static str;

    fn local_address(&self) -> Option<String>;

    fn peer_address(&self) -> Option<String>;
}

pub type BoxConnection = Box<dyn Connection>;

impl Connection for async_std::net::TcpStream {
    fn network(&self) -> &'static str {
        "tcp"
    }

    fn local_address(&self) -> Option<String> {
        self.local_addr().ok().map(|address| address.to_string())
    }

    fn peer_address(&self) -> Option<String> {
        self.peer_addr().ok().map(|address| address.to_string())
    }
}

impl Connection for async_std::os::unix::net::UnixStream {
    fn network(&self) -> &'static str {
        "unix"
    }

    fn local_address(&self) -> Option<String> {
        self.local_addr().ok().map(|address| format!("{:?}", address))
    }

    fn peer_address(&self) -> Option<String> {
        self.peer_addr().ok().map(|address| format!("{:?}", address))
    }
}

impl Connection for BoxConnection {
    fn network(&self) -> &'static str {
        (**self).network()
    }

    fn local_address(&self) -> Option<String> {
        (**self).local_address()
    }

    fn peer_address(&self) -> Option<String> {
        (**self).peer_address()
    }
}

/// Opens new connections. Used by [crate::Client::dial] and the share pool.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, network: &str, address: &str) -> std::io::Result<BoxConnection>;
}

/// Dials TCP connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait::async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, network: &str, address: &str) -> std::io::Result<BoxConnection> {
        match network {
            "tcp" | "tcp4" | "tcp6" => {
                let stream = async_std::net::TcpStream::connect(address).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            "unix" => {
                let stream = async_std::os::unix::net::UnixStream::connect(address).await?;
                Ok(Box::new(stream))
            }
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unsupported network {:?}", network),
            )),
        }
    }
}

/// Accepts incoming connections for [crate::Server::serve].
#[async_trait::async_trait]
pub trait Listener: Send + Sync {
    async fn accept(&self) -> std::io::Result<BoxConnection>;
}

#[async_trait::async_trait]
impl Listener for async_std::net::TcpListener {
    async fn accept(&self) -> std::io::Result<BoxConnection> {
        let (stream, _) = async_std::net::TcpListener::accept(self).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

#[async_trait::async_trait]
impl Listener for async_std::os::unix::net::UnixListener {
    async fn accept(&self) -> std::io::Result<BoxConnection> {
        let (stream, _) = async_std::os::unix::net::UnixListener::accept(self).await?;
        Ok(Box::new(stream))
    }
}

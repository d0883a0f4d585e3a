use crate::config::ServerConfig;
use crate::error::eof_error;
use crate::network::stream::{Stream, TlsStream};
use parking_lot::RwLock;
use socket2::SockRef;
use std::fs::File;
use std::io::{self, BufReader};
use std::net::{Shutdown, SocketAddr, TcpListener, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;

/// Low-level interface used by the server to accept connections.
pub trait Listener: Send + Sync {
    /// Start listening. Non-blocking.
    fn listen(&self) -> io::Result<()>;

    /// Pull a connection from the queue, blocking until one is available.
    /// After `close`, returns a broken-pipe class error.
    fn accept(&self) -> io::Result<Arc<dyn Stream>>;

    /// Local address the listener is bound to, when the transport has one.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Stop listening. Idempotent.
    fn close(&self) -> io::Result<()>;
}

#[derive(Clone)]
enum ListenerKind {
    Tcp(Arc<TcpListener>),
    #[cfg(unix)]
    Unix(Arc<std::os::unix::net::UnixListener>),
}

/// Default listener covering the `tcp`, `tcp4`, `tcp6` and `unix` networks,
/// with TLS mode enabled when the configuration carries both a certificate
/// and a key.
pub struct NetListener {
    address: String,
    config: ServerConfig,
    inner: RwLock<Option<ListenerKind>>,
    tls: RwLock<Option<Arc<rustls::ServerConfig>>>,
}

impl NetListener {
    pub fn new(address: impl Into<String>, config: ServerConfig) -> Self {
        Self {
            address: address.into(),
            config,
            inner: RwLock::new(None),
            tls: RwLock::new(None),
        }
    }
}

impl Listener for NetListener {
    fn listen(&self) -> io::Result<()> {
        let mut guard = self.inner.write();

        if let (Some(cert), Some(key)) = (&self.config.tls_cert, &self.config.tls_key) {
            let tls_config = match &self.config.tls_config {
                Some(config) => Arc::clone(config),
                None => load_tls_config(cert, key)?,
            };
            *self.tls.write() = Some(tls_config);
        }

        let kind = match self.config.network.as_str() {
            "tcp" => ListenerKind::Tcp(Arc::new(TcpListener::bind(&self.address)?)),
            "tcp4" | "tcp6" => {
                let want_v4 = self.config.network == "tcp4";
                let addrs: Vec<SocketAddr> = self
                    .address
                    .to_socket_addrs()?
                    .filter(|addr| addr.is_ipv4() == want_v4)
                    .collect();
                ListenerKind::Tcp(Arc::new(TcpListener::bind(&addrs[..])?))
            }
            #[cfg(unix)]
            "unix" => ListenerKind::Unix(Arc::new(std::os::unix::net::UnixListener::bind(
                &self.address,
            )?)),
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unsupported network {other:?}"),
                ))
            }
        };

        *guard = Some(kind);
        Ok(())
    }

    fn accept(&self) -> io::Result<Arc<dyn Stream>> {
        let kind = match self.inner.read().as_ref() {
            Some(kind) => kind.clone(),
            None => return Err(eof_error()),
        };

        let result: io::Result<Arc<dyn Stream>> = match kind {
            ListenerKind::Tcp(listener) => listener.accept().and_then(|(stream, _)| {
                match self.tls.read().clone() {
                    Some(config) => {
                        Ok(Arc::new(TlsStream::server(stream, config)?) as Arc<dyn Stream>)
                    }
                    None => Ok(Arc::new(stream) as Arc<dyn Stream>),
                }
            }),
            #[cfg(unix)]
            ListenerKind::Unix(listener) => listener
                .accept()
                .map(|(stream, _)| Arc::new(stream) as Arc<dyn Stream>),
        };

        match result {
            // a close() racing with accept surfaces as a platform-specific
            // error; report it as a clean shutdown instead
            Err(_) if self.inner.read().is_none() => Err(eof_error()),
            other => other,
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match self.inner.read().as_ref() {
            Some(ListenerKind::Tcp(listener)) => listener.local_addr().ok(),
            #[cfg(unix)]
            Some(ListenerKind::Unix(_)) => None,
            None => None,
        }
    }

    fn close(&self) -> io::Result<()> {
        let mut guard = self.inner.write();

        match guard.take() {
            None => Ok(()),
            Some(ListenerKind::Tcp(listener)) => {
                // forces a pending accept() to return
                let _ = SockRef::from(&*listener).shutdown(Shutdown::Both);
                Ok(())
            }
            #[cfg(unix)]
            Some(ListenerKind::Unix(listener)) => {
                let _ = SockRef::from(&*listener).shutdown(Shutdown::Both);
                let _ = std::fs::remove_file(&self.address);
                Ok(())
            }
        }
    }
}

fn load_tls_config(cert: &Path, key: &Path) -> io::Result<Arc<rustls::ServerConfig>> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert)?))
        .collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "no certificates in certificate file",
        ));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key)?))?.ok_or_else(
        || io::Error::new(io::ErrorKind::InvalidInput, "no private key in key file"),
    )?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

    Ok(Arc::new(config))
}

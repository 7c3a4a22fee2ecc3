use std::str::FromStr;
use std::{
    fmt, fs, io,
    net::{AddrParseError, SocketAddr, ToSocketAddrs},
    path::{Path, PathBuf},
    pin::Pin,
    task::*,
    time::Duration,
};

use log::*;
use nix::errno::Errno;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::{TcpListener, TcpStream, UnixListener, UnixStream},
    time::timeout,
};

/// Any bidirectional byte stream a connection can be served on. The hijack
/// path feeds plain sockets through here after the HTTP handshake.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

/// Unify behavior of tcp & unix addr
pub enum UnifyAddr {
    Socket(SocketAddr),
    Path(PathBuf),
}

impl fmt::Display for UnifyAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Socket(s) => write!(f, "{}", s),
            Self::Path(p) => write!(f, "{}", p.display()),
        }
    }
}

impl fmt::Debug for UnifyAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Clone for UnifyAddr {
    fn clone(&self) -> Self {
        match self {
            Self::Socket(s) => UnifyAddr::Socket(s.clone()),
            Self::Path(p) => UnifyAddr::Path(p.clone()),
        }
    }
}

impl FromStr for UnifyAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with('/') {
            return Ok(Self::Path(PathBuf::from(s)));
        }
        match s.parse::<SocketAddr>() {
            Ok(a) => Ok(Self::Socket(a)),
            // Can't directly parse the IP, try to resolve it as a domain name.
            // If multiple addresses are resolved, only the first result is taken
            Err(e) => match s.to_socket_addrs() {
                Ok(mut _v) => match _v.next() {
                    Some(a) => Ok(Self::Socket(a)),
                    None => Err(e),
                },
                Err(_) => Err(e),
            },
        }
    }
}

impl UnifyAddr {
    /// Parse an address for the given network name ("tcp" or "unix").
    pub fn parse(network: &str, addr: &str) -> io::Result<Self> {
        match network {
            "unix" => Ok(Self::Path(PathBuf::from(addr))),
            "tcp" => match Self::from_str(addr) {
                Ok(a @ Self::Socket(_)) => Ok(a),
                _ => {
                    error!("fail to parse tcp addr {:?}", addr);
                    Err(Errno::EFAULT.into())
                }
            },
            _ => {
                error!("unsupported network {:?}", network);
                Err(Errno::EPFNOSUPPORT.into())
            }
        }
    }
}

const ZERO_TIME: Duration = Duration::from_secs(0);

/// Unify behavior of tcp & unix listener
pub enum UnifyListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl UnifyListener {
    pub async fn bind(addr: &UnifyAddr) -> Result<Self, io::Error> {
        match addr {
            UnifyAddr::Socket(socket) => TcpListener::bind(socket).await.map(Self::Tcp),
            UnifyAddr::Path(path) => {
                // a stale socket file from a previous run would fail the bind
                if path.exists() {
                    fs::remove_file(path)?;
                }
                UnixListener::bind(path).map(Self::Unix)
            }
        }
    }

    #[inline]
    pub async fn accept(&mut self) -> Result<UnifyStream, io::Error> {
        match self {
            Self::Tcp(l) => l.accept().await.map(|(stream, _)| UnifyStream::Tcp(stream)),
            Self::Unix(l) => l.accept().await.map(|(stream, _)| UnifyStream::Unix(stream)),
        }
    }

    /// The bound address, in the form `UnifyAddr::from_str` accepts.
    pub fn local_addr(&self) -> Option<String> {
        match self {
            UnifyListener::Tcp(l) => l.local_addr().ok().map(|a| a.to_string()),
            UnifyListener::Unix(l) => l
                .local_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| p.display().to_string())),
        }
    }
}

impl fmt::Display for UnifyListener {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Tcp(l) => match l.local_addr() {
                Ok(addr) => write!(f, "listener {}", addr),
                Err(_) => write!(f, "tcp listener unknown"),
            },
            Self::Unix(l) => match l.local_addr() {
                Ok(addr) => {
                    write!(f, "listener {}", addr.as_pathname().unwrap_or(Path::new("")).display())
                }
                Err(_) => write!(f, "unix listener unknown"),
            },
        }
    }
}

/// Unify behavior of tcp & unix stream
pub enum UnifyStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl UnifyStream {
    #[inline(always)]
    pub async fn connect(addr: &UnifyAddr) -> Result<Self, io::Error> {
        match addr {
            UnifyAddr::Socket(socket) => TcpStream::connect(socket).await.map(Self::Tcp),
            UnifyAddr::Path(path) => UnixStream::connect(path).await.map(Self::Unix),
        }
    }

    #[inline(always)]
    pub async fn connect_timeout(
        addr: &UnifyAddr, connect_timeout: Duration,
    ) -> Result<Self, io::Error> {
        if connect_timeout == ZERO_TIME {
            UnifyStream::connect(addr).await
        } else {
            match timeout(connect_timeout, UnifyStream::connect(addr)).await {
                Ok(connect_result) => connect_result,
                Err(e) => Err(e.into()),
            }
        }
    }

    pub async fn close(&mut self) -> std::io::Result<()> {
        match self {
            UnifyStream::Tcp(l) => l.shutdown().await,
            UnifyStream::Unix(l) => l.shutdown().await,
        }
    }
}

impl fmt::Display for UnifyStream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Tcp(l) => match l.peer_addr() {
                Ok(addr) => write!(f, "conn {}", addr),
                Err(_) => write!(f, "tcp conn unknown"),
            },
            Self::Unix(l) => match l.peer_addr() {
                Ok(addr) => {
                    write!(f, "conn {}", addr.as_pathname().unwrap_or(Path::new("")).display())
                }
                Err(_) => write!(f, "unix conn unknown"),
            },
        }
    }
}

impl AsyncRead for UnifyStream {
    #[inline(always)]
    fn poll_read(
        self: Pin<&mut Self>, cx: &mut Context, buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match Pin::get_mut(self) {
            UnifyStream::Tcp(l) => Pin::new(l).poll_read(cx, buf),
            UnifyStream::Unix(l) => Pin::new(l).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UnifyStream {
    #[inline(always)]
    fn poll_write(
        self: Pin<&mut Self>, cx: &mut Context, buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        match Pin::get_mut(self) {
            UnifyStream::Tcp(l) => Pin::new(l).poll_write(cx, buf),
            UnifyStream::Unix(l) => Pin::new(l).poll_write(cx, buf),
        }
    }

    #[inline(always)]
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), io::Error>> {
        match Pin::get_mut(self) {
            UnifyStream::Tcp(l) => Pin::new(l).poll_flush(cx),
            UnifyStream::Unix(l) => Pin::new(l).poll_flush(cx),
        }
    }

    #[inline(always)]
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), io::Error>> {
        match Pin::get_mut(self) {
            UnifyStream::Tcp(l) => Pin::new(l).poll_shutdown(cx),
            UnifyStream::Unix(l) => Pin::new(l).poll_shutdown(cx),
        }
    }
}

pub async fn listen_on_addr(addr: &str) -> std::io::Result<UnifyListener> {
    match UnifyAddr::from_str(addr) {
        Err(_) => {
            error!("fail to parse addr {:?}", addr);
            return Err(Errno::EFAULT.into());
        }
        Ok(listen_addr) => match UnifyListener::bind(&listen_addr).await {
            Ok(listener) => {
                info!("listen on {:?}", addr);
                return Ok(listener);
            }
            Err(e) => {
                error!("fail to bind on addr {:?}: {:?}", listen_addr, e);
                return Err(e);
            }
        },
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_addr_parse() {
        match UnifyAddr::from_str("127.0.0.1:18555").expect("parse address error") {
            UnifyAddr::Socket(s) => assert_eq!(s.port(), 18555),
            UnifyAddr::Path(_) => panic!("expect socket addr"),
        }
        match UnifyAddr::from_str("/tmp/test.sock").expect("parse address error") {
            UnifyAddr::Path(p) => assert_eq!(p, PathBuf::from("/tmp/test.sock")),
            UnifyAddr::Socket(_) => panic!("expect path addr"),
        }
    }

    #[test]
    fn test_addr_parse_network() {
        assert!(UnifyAddr::parse("tcp", "127.0.0.1:0").is_ok());
        assert!(UnifyAddr::parse("unix", "/tmp/x.sock").is_ok());
        assert!(UnifyAddr::parse("udp", "127.0.0.1:0").is_err());
    }
}

use lazy_static::lazy_static;
use std::{
    fs::File,
    io,
    io::BufReader,
    net::SocketAddr,
    path::Path,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

lazy_static! {
    static ref TLS_CONNECTOR: tokio_rustls::TlsConnector = {
        let mut roots = RootCertStore::empty();
        if let Ok(certs) = rustls_native_certs::load_native_certs() {
            for cert in certs {
                let _ = roots.add(cert);
            }
        }
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        tokio_rustls::TlsConnector::from(Arc::new(config))
    };
}

// We box the fields to reduce type size; there's a large size difference
// between the variants when using rustls.
#[derive(Debug)]
pub(crate) enum Stream {
    Tcp(Box<TcpStream>),
    Tls(Box<TlsStream<TcpStream>>),
}

pub(crate) type TlsError = tokio_rustls::rustls::Error;

#[derive(Debug)]
pub(crate) enum StreamError {
    Tls(TlsError),
    Io(io::Error),
}

impl From<TlsError> for StreamError {
    fn from(err: TlsError) -> Self {
        StreamError::Tls(err)
    }
}

impl From<io::Error> for StreamError {
    fn from(err: io::Error) -> Self {
        StreamError::Io(err)
    }
}

impl Stream {
    pub(crate) async fn new_tcp(addr: SocketAddr) -> Result<Stream, StreamError> {
        Ok(Stream::Tcp(TcpStream::connect(addr).await?.into()))
    }

    pub(crate) async fn new_tls(
        addr: SocketAddr,
        host_name: &str,
        ca_file: Option<&Path>,
    ) -> Result<Stream, StreamError> {
        let tcp_stream = TcpStream::connect(addr).await?;
        let name = ServerName::try_from(host_name.to_owned())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let tls_stream = match ca_file {
            None => TLS_CONNECTOR.connect(name, tcp_stream).await?,
            Some(ca_file) => {
                ca_connector(ca_file)?.connect(name, tcp_stream).await?
            }
        };
        Ok(Stream::Tls(tls_stream.into()))
    }
}

/// A connector trusting only the certificates in the given PEM bundle.
fn ca_connector(ca_file: &Path) -> Result<tokio_rustls::TlsConnector, StreamError> {
    let mut roots = RootCertStore::empty();
    let mut reader = BufReader::new(File::open(ca_file)?);
    for cert in rustls_pemfile::certs(&mut reader) {
        let _ = roots.add(cert?);
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(tokio_rustls::TlsConnector::from(Arc::new(config)))
}

//
// Boilerplate
//

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut ReadBuf,
    ) -> Poll<Result<(), io::Error>> {
        match *self {
            Stream::Tcp(ref mut tcp_stream) => Pin::new(tcp_stream).poll_read(cx, buf),
            Stream::Tls(ref mut tls_stream) => Pin::new(tls_stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        match *self {
            Stream::Tcp(ref mut tcp_stream) => Pin::new(tcp_stream).poll_write(cx, buf),
            Stream::Tls(ref mut tls_stream) => Pin::new(tls_stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), io::Error>> {
        match *self {
            Stream::Tcp(ref mut tcp_stream) => Pin::new(tcp_stream).poll_flush(cx),
            Stream::Tls(ref mut tls_stream) => Pin::new(tls_stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), io::Error>> {
        match *self {
            Stream::Tcp(ref mut tcp_stream) => Pin::new(tcp_stream).poll_shutdown(cx),
            Stream::Tls(ref mut tls_stream) => Pin::new(tls_stream).poll_shutdown(cx),
        }
    }
}

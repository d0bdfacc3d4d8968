// Copyright 2020 Replset Developers

//! A [`Transport`](../replset/connection/trait.Transport.html) over a plain
//! `std::net::TcpStream`.

use std::io::{Error as IOError, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use replset::address::NodeAddress;
use replset::connection::Transport;

#[derive(Debug)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
    addr: SocketAddr,
}

impl TcpTransport {
    pub fn new(address: &NodeAddress) -> Self {
        TcpTransport {
            stream: None,
            addr: address.resolved,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn stream(&mut self) -> Result<&mut TcpStream, IOError> {
        self.stream
            .as_mut()
            .ok_or_else(|| IOError::new(ErrorKind::NotConnected, "not connected"))
    }
}

impl Transport for TcpTransport {
    type Error = IOError;

    fn connect(&mut self, timeout: Duration) -> Result<(), Self::Error> {
        let stream = TcpStream::connect_timeout(&self.addr, timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        self.stream = Some(stream);
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        self.stream()?.write_all(bytes)
    }

    fn read(&mut self, n: usize) -> Result<Vec<u8>, Self::Error> {
        let mut buf = vec![0; n];
        self.stream()?.read_exact(&mut buf)?;
        Ok(buf)
    }

    // A readable socket with nothing to read is alive; one that reads end
    // of stream or errors is not. Unsolicited bytes mean the stream is out
    // of step, which is treated as dead too.
    fn is_alive(&self) -> bool {
        let stream = match &self.stream {
            Some(stream) => stream,
            None => return false,
        };
        if stream.set_nonblocking(true).is_err() {
            return false;
        }
        let mut buf = [0; 1];
        let alive = match stream.peek(&mut buf) {
            Ok(_) => false,
            Err(e) => e.kind() == ErrorKind::WouldBlock,
        };
        stream.set_nonblocking(false).is_ok() && alive
    }

    fn disconnect(&mut self) -> Result<(), Self::Error> {
        match self.stream.take() {
            Some(stream) => match stream.shutdown(Shutdown::Both) {
                Err(e) if e.kind() != ErrorKind::NotConnected => Err(e),
                _ => Ok(()),
            },
            None => Ok(()),
        }
    }
}

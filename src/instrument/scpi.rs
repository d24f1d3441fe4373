//! Line-based SCPI link over a TCP socket.
//!
//! Bus instruments (supply, multimeter, signal generator) speak a
//! newline-terminated request/response protocol over an addressable socket
//! resource. Writes are fire-and-forget; queries write a command and read
//! one response line.

use log::debug;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::error::{RigError, RigResult};

/// One TCP-attached SCPI endpoint.
pub struct ScpiLink {
    address: String,
    stream: Option<BufReader<TcpStream>>,
}

impl ScpiLink {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            stream: None,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Opens the socket. One attempt, no retry.
    pub async fn open(&mut self) -> RigResult<()> {
        let stream = TcpStream::connect(&self.address).await.map_err(|err| {
            RigError::Connection(format!("failed to connect to '{}': {}", self.address, err))
        })?;
        self.stream = Some(BufReader::new(stream));
        Ok(())
    }

    pub fn close(&mut self) {
        self.stream = None;
    }

    fn stream_mut(&mut self) -> RigResult<&mut BufReader<TcpStream>> {
        self.stream.as_mut().ok_or_else(|| {
            RigError::Connection(format!("SCPI link to '{}' is not open", self.address))
        })
    }

    /// Sends one command line.
    pub async fn write_line(&mut self, command: &str) -> RigResult<()> {
        debug!("scpi [{}] >> {}", self.address, command);
        let stream = self.stream_mut()?;
        stream
            .get_mut()
            .write_all(command.as_bytes())
            .await
            .map_err(|err| RigError::Measurement(format!("write '{}' failed: {}", command, err)))?;
        stream
            .get_mut()
            .write_all(b"\n")
            .await
            .map_err(|err| RigError::Measurement(format!("write '{}' failed: {}", command, err)))?;
        Ok(())
    }

    /// Sends one command line and reads one response line.
    pub async fn query(&mut self, command: &str) -> RigResult<String> {
        self.write_line(command).await?;
        let stream = self.stream_mut()?;
        let mut line = String::new();
        let read = stream.read_line(&mut line).await.map_err(|err| {
            RigError::Measurement(format!("read after '{}' failed: {}", command, err))
        })?;
        if read == 0 {
            return Err(RigError::Measurement(format!(
                "connection to '{}' closed mid-query",
                self.address
            )));
        }
        let response = line.trim().to_string();
        debug!("scpi [{}] << {}", self.address, response);
        Ok(response)
    }

    /// Queries and parses a single float response.
    pub async fn query_f64(&mut self, command: &str) -> RigResult<f64> {
        let response = self.query(command).await?;
        response.parse::<f64>().map_err(|_| {
            RigError::Measurement(format!(
                "expected numeric response to '{}', got '{}'",
                command, response
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_query_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = sock.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b":MEASure:VOLTage:DC?\n");
            sock.write_all(b"1.2345\n").await.unwrap();
        });

        let mut link = ScpiLink::new(addr.to_string());
        link.open().await.unwrap();
        let value = link.query_f64(":MEASure:VOLTage:DC?").await.unwrap();
        assert_eq!(value, 1.2345);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_write_without_open_is_connection_error() {
        let mut link = ScpiLink::new("127.0.0.1:1");
        let err = link.write_line("*RST").await.unwrap_err();
        assert!(matches!(err, RigError::Connection(_)));
    }
}

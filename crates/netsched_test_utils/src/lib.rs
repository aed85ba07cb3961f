//! Test helpers shared by the NetSched integration suites.

use anyhow::{Context, Result};
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::time::Duration;

/// Grab an ephemeral TCP port by binding and dropping a listener.
///
/// Racy in principle; fine for tests that bind again immediately.
pub fn free_tcp_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

/// Bind a UDP socket on an ephemeral port for receiving notifications.
pub fn udp_receiver() -> (UdpSocket, u16) {
    let socket = UdpSocket::bind("127.0.0.1:0").expect("bind ephemeral udp port");
    socket
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("set udp timeout");
    let port = socket.local_addr().expect("local addr").port();
    (socket, port)
}

/// Receive one datagram as a string, or None on timeout.
pub fn recv_datagram(socket: &UdpSocket) -> Option<String> {
    let mut buf = [0u8; 2048];
    match socket.recv_from(&mut buf) {
        Ok((len, _)) => Some(String::from_utf8_lossy(&buf[..len]).into_owned()),
        Err(_) => None,
    }
}

/// Blocking line-protocol client for exercising a running server.
pub struct LineClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl LineClient {
    /// Connect and perform the two-line handshake: an identification line
    /// and the queue name.
    pub fn connect(addr: SocketAddr, node: &str, session: &str, queue: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).context("connect to server")?;
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .context("set read timeout")?;
        let reader = BufReader::new(stream.try_clone().context("clone stream")?);
        let mut client = Self {
            reader,
            writer: stream,
        };
        client.send_line(&format!(
            "netsched_test client_node={} client_session={}",
            node, session
        ))?;
        client.send_line(queue)?;
        Ok(client)
    }

    pub fn send_line(&mut self, line: &str) -> Result<()> {
        self.writer
            .write_all(line.as_bytes())
            .and_then(|_| self.writer.write_all(b"\n"))
            .context("write line")
    }

    pub fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        self.reader.read_line(&mut line).context("read line")?;
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Send a command and read the single-line response.
    pub fn request(&mut self, command: &str) -> Result<String> {
        self.send_line(command)?;
        self.read_line()
    }

    /// Read response lines until `OK:END`.
    pub fn read_multiline(&mut self) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            if line == "OK:END" {
                return Ok(lines);
            }
            lines.push(line);
        }
    }
}

/// Extract and URL-decode a `key=value` field from an `OK:`-style
/// `&`-joined payload.
pub fn response_field(response: &str, field: &str) -> Option<String> {
    let payload = response.strip_prefix("OK:")?;
    url::form_urlencoded::parse(payload.as_bytes())
        .find(|(name, _)| name == field)
        .map(|(_, value)| value.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_ports_are_distinct_enough() {
        let a = free_tcp_port();
        let b = free_tcp_port();
        assert!(a > 0);
        assert!(b > 0);
    }

    #[test]
    fn test_response_field_extraction() {
        let resp = "OK:job_key=NSID_1_9100_h&auth_token=abc&msg=stage+2+of+5";
        assert_eq!(response_field(resp, "job_key").unwrap(), "NSID_1_9100_h");
        assert_eq!(response_field(resp, "auth_token").unwrap(), "abc");
        assert_eq!(response_field(resp, "msg").unwrap(), "stage 2 of 5");
        assert!(response_field(resp, "missing").is_none());
        assert!(response_field("ERR:eJobNotFound:", "job_key").is_none());
    }
}

//! UDP notifier: the single owner of the outbound notification socket.
//!
//! Queue code never touches the network; it enqueues datagrams onto an
//! mpsc channel. This thread drains the channel and fires them off.
//! Delivery is best effort: send errors are logged and dropped.

use netsched_queue::Datagram;
use std::net::UdpSocket;
use std::sync::mpsc::Receiver;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace};

/// Spawn the notifier thread. It exits when every sender half of the
/// channel is dropped.
pub fn spawn_notifier(rx: Receiver<Datagram>) -> std::io::Result<JoinHandle<()>> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    let handle = thread::Builder::new()
        .name("ns-notifier".to_string())
        .spawn(move || {
            debug!("Notifier thread started");
            while let Ok(datagram) = rx.recv() {
                let target = (datagram.host.as_str(), datagram.port);
                match socket.send_to(datagram.payload.as_bytes(), target) {
                    Ok(_) => {
                        trace!(
                            host = %datagram.host,
                            port = datagram.port,
                            "Notification sent"
                        );
                    }
                    Err(e) => {
                        error!(
                            host = %datagram.host,
                            port = datagram.port,
                            error = %e,
                            "Failed to send notification"
                        );
                    }
                }
            }
            debug!("Notifier thread stopped");
        })?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_notifier_delivers_datagrams() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let port = receiver.local_addr().unwrap().port();

        let (tx, rx) = mpsc::channel();
        let handle = spawn_notifier(rx).unwrap();

        tx.send(Datagram {
            host: "127.0.0.1".to_string(),
            port,
            payload: "reason=get&ns_node=n1&queue=q1".to_string(),
        })
        .unwrap();

        let mut buf = [0u8; 512];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"reason=get&ns_node=n1&queue=q1");

        drop(tx);
        handle.join().unwrap();
    }
}

use std::io::{Read, Write};
use std::os::unix::net::{Shutdown, UnixStream};
use std::sync::Arc;
use std::thread;

use bytes::Bytes;

use crate::broker::Broker;

/// Maximum pending-command length, newline included.
const MAX_LINE: usize = 64;
const READ_CHUNK: usize = 256;

/// Accepts ownership of a freshly accepted client socket, registers it with
/// the broker, and spawns its reader/writer threads. Returns immediately;
/// the connection tears itself down when the client disconnects or
/// violates the protocol.
pub fn spawn(stream: UnixStream, broker: Arc<Broker>) {
    let reader_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(err) => {
            tracing::warn!(%err, "failed to clone accepted connection, dropping it");
            return;
        }
    };
    let writer_stream = stream;

    let (outbound_tx, outbound_rx) = crossbeam_channel::unbounded::<Bytes>();
    let id = broker.register_connection(outbound_tx);

    thread::spawn(move || {
        let mut writer_stream = writer_stream;
        while let Ok(bytes) = outbound_rx.recv() {
            if let Err(err) = writer_stream.write_all(&bytes) {
                tracing::warn!(id, %err, "write to client failed");
                break;
            }
        }
        let _ = writer_stream.shutdown(Shutdown::Both);
    });

    thread::spawn(move || {
        run_reader(reader_stream, &broker, id);
        broker.unregister_connection(id);
    });
}

fn run_reader(mut stream: UnixStream, broker: &Arc<Broker>, id: u64) {
    let mut pending: Vec<u8> = Vec::with_capacity(MAX_LINE);
    let mut buf = [0u8; READ_CHUNK];

    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => {
                tracing::info!(id, "client disconnected");
                return;
            }
            Ok(n) => n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::info!(id, %err, "connection read error");
                return;
            }
        };

        for &byte in &buf[..n] {
            pending.push(byte);

            if pending.len() == MAX_LINE {
                if pending.last() == Some(&b'\n') {
                    if !submit_line(broker, id, &mut pending) {
                        let _ = stream.shutdown(Shutdown::Both);
                        return;
                    }
                } else {
                    tracing::warn!(id, "protocol violation: command exceeds 64 bytes");
                    let _ = stream.shutdown(Shutdown::Both);
                    return;
                }
            } else if byte == b'\n' {
                if !submit_line(broker, id, &mut pending) {
                    let _ = stream.shutdown(Shutdown::Both);
                    return;
                }
            }
        }
    }
}

/// Submits a completed line to the broker. Returns false if the broker
/// rejected it, in which case the caller must stop reading from this
/// connection.
fn submit_line(broker: &Arc<Broker>, id: u64, pending: &mut Vec<u8>) -> bool {
    let line = std::mem::replace(pending, Vec::with_capacity(MAX_LINE));
    match broker.submit(id, line) {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(id, %err, "failed to submit command, dropping connection");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::test_broker;
    use std::io::Read as _;
    use std::time::Duration;

    #[test]
    fn single_command_round_trip() {
        let (broker, mut device_side) = test_broker();
        let (client_side, server_side) = UnixStream::pair().unwrap();
        client_side
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        spawn(server_side, broker);

        let mut client_side = client_side;
        client_side.write_all(b"A 4\n").unwrap();

        let mut buf = [0u8; 16];
        let n = device_side.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"A 4\n");

        device_side.write_all(b"x:1\r\n#STOP\r\n").unwrap();

        let mut response = [0u8; 32];
        let n = client_side.read(&mut response).unwrap();
        assert_eq!(&response[..n], b"x:1\r\n#STOP\r\n");
    }

    #[test]
    fn oversize_line_closes_the_connection() {
        let (broker, _device_side) = test_broker();
        let (client_side, server_side) = UnixStream::pair().unwrap();
        client_side
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        spawn(server_side, broker);

        let mut client_side = client_side;
        client_side.write_all(&[b'x'; MAX_LINE]).unwrap();

        let mut buf = [0u8; 4];
        let n = client_side.read(&mut buf).unwrap();
        assert_eq!(n, 0, "connection closed after a 64-byte non-newline run");
    }

    #[test]
    fn disconnect_mid_response_does_not_stall_the_queue() {
        let (broker, mut device_side) = test_broker();

        let (client1, server1) = UnixStream::pair().unwrap();
        spawn(server1, Arc::clone(&broker));
        let mut client1 = client1;
        client1.write_all(b"Q\n").unwrap();

        let mut buf = [0u8; 16];
        let n = device_side.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"Q\n");

        drop(client1);
        thread::sleep(Duration::from_millis(100));

        // device still emits a (now unsolicited-to-anyone) response; the
        // broker must drain it and advance the queue without crashing.
        device_side.write_all(b"stale\r\n#STOP\r\n").unwrap();
        thread::sleep(Duration::from_millis(100));

        let (client2, server2) = UnixStream::pair().unwrap();
        client2
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        spawn(server2, broker);
        let mut client2 = client2;
        client2.write_all(b"A 4\n").unwrap();

        let n = device_side.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"A 4\n");
        device_side.write_all(b"ok\r\n#STOP\r\n").unwrap();

        let mut response = [0u8; 32];
        let n = client2.read(&mut response).unwrap();
        assert_eq!(&response[..n], b"ok\r\n#STOP\r\n");
    }
}

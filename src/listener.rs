use std::fs;
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::sync::Arc;

use crate::broker::Broker;
use crate::connection;

/// Binds the client-facing Unix domain socket and accepts connections until
/// the process is killed. Never returns on success.
///
/// Removes any stale socket node left behind by a previous run before
/// binding; `bind` otherwise fails with `AddrInUse` on a leftover node
/// from an unclean exit.
pub fn run(socket_path: &Path, broker: Arc<Broker>) -> std::io::Result<()> {
    match fs::remove_file(socket_path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(path = %socket_path.display(), %err, "failed to remove stale socket");
        }
    }

    let listener = UnixListener::bind(socket_path)?;
    tracing::info!(path = %socket_path.display(), "listening for connections");

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                connection::spawn(stream, Arc::clone(&broker));
            }
            Err(err) => {
                tracing::warn!(%err, "failed to accept connection");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::test_broker;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn binding_removes_a_stale_socket_node() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.sock");
        // leftover node from an unclean previous exit
        std::fs::write(&path, b"not a socket").unwrap();

        let (broker, _device_side) = test_broker();
        let path_clone = path.clone();
        thread::spawn(move || run(&path_clone, broker));
        thread::sleep(Duration::from_millis(100));

        UnixStream::connect(&path).expect("socket should be bindable and connectable");
    }

    #[test]
    fn two_clients_are_served_in_submission_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.sock");

        let (broker, mut device_side) = test_broker();
        let path_clone = path.clone();
        thread::spawn(move || run(&path_clone, broker));
        thread::sleep(Duration::from_millis(100));

        let mut client1 = UnixStream::connect(&path).unwrap();
        client1
            .set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();
        client1.write_all(b"C1\n").unwrap();
        thread::sleep(Duration::from_millis(50));

        let mut client2 = UnixStream::connect(&path).unwrap();
        client2
            .set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();
        client2.write_all(b"C2\n").unwrap();

        let mut buf = [0u8; 16];
        let n = device_side.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"C1\n");
        device_side.write_all(b"ok1\r\n#STOP\r\n").unwrap();

        let mut response = [0u8; 32];
        let n = client1.read(&mut response).unwrap();
        assert_eq!(&response[..n], b"ok1\r\n#STOP\r\n");

        let n = device_side.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"C2\n");
        device_side.write_all(b"ok2\r\n#STOP\r\n").unwrap();

        let n = client2.read(&mut response).unwrap();
        assert_eq!(&response[..n], b"ok2\r\n#STOP\r\n");
    }
}

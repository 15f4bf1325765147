//! Loopback fake device used by the async tests.

use std::future::Future;
use std::net::Ipv4Addr;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;

use crate::device::{DeviceDescriptor, DeviceType};

const STEP: Duration = Duration::from_secs(5);

pub(crate) struct FakeDevice {
    listener: TcpListener,
}

impl FakeDevice {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        FakeDevice { listener }
    }

    /// Listen on a specific loopback port, e.g. one a session already targets.
    pub async fn bind_port(port: u16) -> Self {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await.unwrap();
        FakeDevice { listener }
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    pub fn descriptor(&self, serial: &str, device_type: Option<DeviceType>) -> DeviceDescriptor {
        let descriptor = DeviceDescriptor::new(serial, Ipv4Addr::LOCALHOST).with_port(self.port());
        match device_type {
            Some(device_type) => descriptor.with_device_type(device_type),
            None => descriptor,
        }
    }

    pub async fn accept(&self) -> FakeConnection {
        self.try_accept(STEP).await.expect("no connection attempt")
    }

    pub async fn try_accept(&self, within: Duration) -> Option<FakeConnection> {
        let (stream, _) = tokio::time::timeout(within, self.listener.accept())
            .await
            .ok()?
            .unwrap();
        let (reader, writer) = stream.into_split();
        Some(FakeConnection {
            reader: BufReader::new(reader),
            writer,
        })
    }
}

pub(crate) struct FakeConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl FakeConnection {
    /// Next request line from the host, parsed.
    pub async fn next_request(&mut self) -> Value {
        let mut line = String::new();
        let read = tokio::time::timeout(STEP, self.reader.read_line(&mut line))
            .await
            .expect("no request from host")
            .unwrap();
        assert!(read > 0, "host closed the connection");
        assert!(line.ends_with("\r\n"), "request not CRLF terminated: {line:?}");
        serde_json::from_str(line.trim_end()).unwrap()
    }

    /// Skip requests until one with the given command code arrives.
    pub async fn expect_command(&mut self, cmd: u64) -> Value {
        loop {
            let request = self.next_request().await;
            if request["cmd"] == json!(cmd) {
                return request;
            }
        }
    }

    /// Wait for the host to close the connection, skipping any requests.
    pub async fn expect_closed(&mut self) {
        let mut line = String::new();
        loop {
            line.clear();
            let read = tokio::time::timeout(STEP, self.reader.read_line(&mut line))
                .await
                .expect("host kept the connection open")
                .unwrap_or(0);
            if read == 0 {
                return;
            }
        }
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    pub async fn send_json(&mut self, value: Value) {
        let mut bytes = serde_json::to_vec(&value).unwrap();
        bytes.extend_from_slice(b"\r\n");
        self.send_raw(&bytes).await;
    }

    pub async fn send_info(&mut self, serial: &str, dtp: &str) {
        self.send_json(json!({
            "cmd": 0,
            "pv": 0,
            "sn": "1",
            "res": 0,
            "msg": {"did": serial, "dtp": dtp, "pid": "test", "sv": "1.0.0"},
        }))
        .await;
    }

    pub async fn push(&mut self, data: Value) {
        let attr: Vec<u16> = data
            .as_object()
            .map(|map| map.keys().filter_map(|k| k.parse().ok()).collect())
            .unwrap_or_default();
        self.send_json(json!({
            "cmd": 10,
            "pv": 0,
            "sn": "2",
            "res": 0,
            "msg": {"attr": attr, "data": data},
        }))
        .await;
    }
}

/// Descriptor for a loopback port nothing listens on.
pub(crate) fn refused_descriptor(serial: &str) -> DeviceDescriptor {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    DeviceDescriptor::new(serial, Ipv4Addr::LOCALHOST).with_port(port)
}

/// Poll `condition` until it holds or a few seconds pass.
pub(crate) async fn wait_for(condition: impl Fn() -> bool) -> bool {
    wait_until(condition, STEP).await
}

pub(crate) async fn wait_until(condition: impl Fn() -> bool, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Run `future` with the standard test deadline.
pub(crate) async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(STEP, future).await.expect("timed out")
}

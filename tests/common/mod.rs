//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::ffi::OsString;
use std::io::{self, Write};
use std::net::TcpStream;
use std::os::fd::{OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::Dispatch;
use tracing_subscriber::fmt::MakeWriter;

use handoff::config::EngineConfig;
use handoff::lifecycle::{ProcessIdentity, SignalSet};
use handoff::net::OsSockets;
use handoff::upgrade::{MarkerSource, ProcessLauncher, SpawnPlan, UpgraderParts};

/// Ask the OS for a port that is free right now.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Loopback config on `port`.
pub fn engine_config(port: u16) -> EngineConfig {
    EngineConfig {
        host: "127.0.0.1".into(),
        port,
        ..Default::default()
    }
}

/// Poll until something accepts connections on `port`.
pub async fn wait_until_serving(port: u16) {
    for _ in 0..500 {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("nothing listening on port {port}");
}

/// Poll until nothing accepts connections on `port` any more.
pub async fn wait_until_closed(port: u16) {
    for _ in 0..500 {
        if TcpStream::connect(("127.0.0.1", port)).is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("port {port} still accepting");
}

/// GET `path` on a fresh client; returns status and body.
pub async fn get(port: u16, path: &str) -> (u16, String) {
    let client = reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .build()
        .unwrap();
    let response = client
        .get(format!("http://127.0.0.1:{port}{path}"))
        .send()
        .await
        .unwrap();
    let status = response.status().as_u16();
    (status, response.text().await.unwrap())
}

/// Captures formatted log output in memory.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn dispatch(&self) -> Dispatch {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        Dispatch::new(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// What the spawner handed to the OS for one launch.
#[derive(Debug)]
pub struct Launch {
    pub env: Vec<(OsString, OsString)>,
    pub slots: Vec<RawFd>,
    /// Copies of the descriptors the child would have owned, in slot order
    /// from 3 upwards.
    pub inherited: Vec<OwnedFd>,
}

impl Launch {
    pub fn env_value(&self, key: &str) -> Option<String> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.to_string_lossy().into_owned())
    }
}

/// `ProcessLauncher` that records launches instead of starting processes.
#[derive(Default)]
pub struct RecordingLauncher {
    pub launches: Mutex<Vec<Launch>>,
    pub terminated: Mutex<Vec<u32>>,
}

impl RecordingLauncher {
    pub fn launch_count(&self) -> usize {
        self.launches.lock().unwrap().len()
    }

    /// Act as the latest child: write the readiness token on slot 4.
    pub fn report_ready(&self) {
        let launches = self.launches.lock().unwrap();
        let pipe = launches.last().unwrap().inherited[1].try_clone().unwrap();
        UnixStream::from(pipe)
            .write_all(handoff::upgrade::readiness::READY_TOKEN)
            .unwrap();
    }

    /// The listener the latest child would have found on slot 3.
    pub fn inherited_listener(&self) -> std::net::TcpListener {
        let launches = self.launches.lock().unwrap();
        let fd = launches.last().unwrap().inherited[0].try_clone().unwrap();
        std::net::TcpListener::from(fd)
    }
}

impl ProcessLauncher for RecordingLauncher {
    fn launch(&self, plan: &SpawnPlan) -> io::Result<u32> {
        let inherited = plan
            .inherited
            .iter()
            .map(OwnedFd::try_clone)
            .collect::<io::Result<Vec<_>>>()?;
        let mut launches = self.launches.lock().unwrap();
        launches.push(Launch {
            env: plan.env.clone(),
            slots: plan.descriptor_slots(),
            inherited,
        });
        Ok(50_000 + launches.len() as u32)
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        self.terminated.lock().unwrap().push(pid);
        Ok(())
    }
}

/// Real sockets, recorded launches, no OS signals, fresh bind.
pub fn parts(launcher: Arc<RecordingLauncher>) -> UpgraderParts {
    UpgraderParts {
        sockets: Arc::new(OsSockets),
        launcher,
        marker: MarkerSource::Fixed(false),
        signals: SignalSet::none(),
        identity: ProcessIdentity::current(),
    }
}

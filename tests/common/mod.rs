//! Shared fixtures: an in-memory desktop and a recording injector

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use lamco_x11_rdp_server::backend::DesktopBackend;
use lamco_x11_rdp_server::capture::{CaptureError, CaptureSource};
use lamco_x11_rdp_server::config::Config;
use lamco_x11_rdp_server::encoder::EncodingMode;
use lamco_x11_rdp_server::frame::Frame;
use lamco_x11_rdp_server::input::{InputError, InputInjector};

pub const PASSWORD: &str = "secret";

/// One injected action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Injected {
    Key(u8, bool),
    Keysym(u32, bool),
    Motion(u16, u16),
    Button(u8, bool),
}

/// Injector that appends every action to a shared log
#[derive(Default)]
pub struct RecordingInjector {
    log: Mutex<Vec<Injected>>,
}

impl RecordingInjector {
    pub fn actions(&self) -> Vec<Injected> {
        self.log.lock().clone()
    }

    pub fn motions(&self) -> Vec<(u16, u16)> {
        self.log
            .lock()
            .iter()
            .filter_map(|a| match a {
                Injected::Motion(x, y) => Some((*x, *y)),
                _ => None,
            })
            .collect()
    }
}

impl InputInjector for RecordingInjector {
    fn key(&self, keycode: u8, pressed: bool) -> Result<(), InputError> {
        self.log.lock().push(Injected::Key(keycode, pressed));
        Ok(())
    }

    fn keysym(&self, keysym: u32, pressed: bool) -> Result<(), InputError> {
        self.log.lock().push(Injected::Keysym(keysym, pressed));
        Ok(())
    }

    fn pointer_motion(&self, x: u16, y: u16) -> Result<(), InputError> {
        self.log.lock().push(Injected::Motion(x, y));
        Ok(())
    }

    fn pointer_button(&self, button: u8, pressed: bool) -> Result<(), InputError> {
        self.log.lock().push(Injected::Button(button, pressed));
        Ok(())
    }
}

/// Source producing a solid frame; the colour can be changed from the test
struct SolidSource {
    geometry: (u32, u32),
    colour: Arc<Mutex<[u8; 4]>>,
}

impl CaptureSource for SolidSource {
    fn geometry(&self) -> (u32, u32) {
        self.geometry
    }

    fn reconfigure(&mut self, width: u32, height: u32) -> Result<(u32, u32), CaptureError> {
        self.geometry = (width, height);
        Ok(self.geometry)
    }

    fn grab(&mut self, frame: &mut Frame) -> Result<(), CaptureError> {
        let (width, height) = self.geometry;
        frame.configure(width, height, width * 4, Instant::now())?;
        frame.fill(*self.colour.lock());
        Ok(())
    }
}

/// Desktop backed by memory
pub struct FakeDesktop {
    size: (u32, u32),
    colour: Arc<Mutex<[u8; 4]>>,
    injector: Arc<RecordingInjector>,
}

impl FakeDesktop {
    pub fn new(width: u32, height: u32) -> Arc<Self> {
        Arc::new(Self {
            size: (width, height),
            colour: Arc::new(Mutex::new([0x20, 0x40, 0x60, 0xFF])),
            injector: Arc::new(RecordingInjector::default()),
        })
    }

    pub fn injector(&self) -> &Arc<RecordingInjector> {
        &self.injector
    }

    pub fn set_colour(&self, bgra: [u8; 4]) {
        *self.colour.lock() = bgra;
    }
}

impl DesktopBackend for FakeDesktop {
    fn name(&self) -> &str {
        "fake"
    }

    fn desktop_size(&self) -> (u32, u32) {
        self.size
    }

    fn open_capture(
        &self,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn CaptureSource>, CaptureError> {
        Ok(Box::new(SolidSource {
            geometry: (width, height),
            colour: Arc::clone(&self.colour),
        }))
    }

    fn open_injector(&self) -> Result<Arc<dyn InputInjector>, InputError> {
        let injector: Arc<dyn InputInjector> = self.injector.clone();
        Ok(injector)
    }
}

/// Plain-TCP config on an ephemeral loopback port with state under `dir`
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default_config();
    config.server.listen_addr = "127.0.0.1:0".to_string();
    config.server.max_connections = 4;
    config.server.handshake_timeout_secs = 5;
    config.security.enable_tls = false;
    config.security.password = Some(PASSWORD.to_string());
    config.security.credential_dir = dir.join("credentials");
    config.capture.width = 320;
    config.capture.height = 240;
    config.capture.target_fps = 60;
    config.encoding.mode = EncodingMode::Raw;
    config.encoding.frame_diff = true;
    config.handover.socket_path = dir.join("handover.sock");
    config
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

//! Sync server
//!
//! Owns device discovery and the per-session lifecycle:
//!
//! ```text
//! DISCOVERED -> OPENED -> CLAIMED -> CONFIGURED -> HANDSHAKING
//!            -> SYNCING -> ENDING -> CLOSED -> WAIT-DISCONNECT -> ...
//! ```
//!
//! One device is serviced at a time; the discovery loop is single-flighted
//! and exits at its next poll tick once `stop()` has been called. An
//! in-flight session is allowed to complete.

use super::conduit::{self, Conduit};
use super::session::{self, SessionOutcome};
use crate::config::{Config, Mode};
use crate::error::{Error, Result};
use crate::protocol::{MessageLink, NetSyncEndpoint, PadpConfig, PadpEndpoint, StackKind, cmp};
use crate::recorder::{Recorder, RecordingTransport};
use crate::storage::Storage;
use crate::transport::usb::{self, UsbConnection};
use crate::transport::{NetListener, SerialTransport};
use crossbeam_channel::Sender;
use rusb::Context;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Lifecycle notifications for embedders (the daemon just logs them)
#[derive(Debug, Clone)]
pub enum SyncEvent {
    DeviceConnected { label: String },
    SyncCompleted { outcome: SessionOutcome },
    SessionFailed { reason: String },
    DeviceRemoved,
}

/// Clonable handle for stopping a running server
#[derive(Clone)]
pub struct ServerController {
    shutdown: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl ServerController {
    /// Request shutdown; idempotent, and a no-op when no server is running
    pub fn stop(&self) {
        if !self.running.load(Ordering::SeqCst) {
            log::debug!("stop() without a running server; ignoring");
            return;
        }
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            log::info!("Shutdown requested");
        }
    }
}

pub struct SyncServer {
    config: Config,
    storage: Arc<dyn Storage>,
    conduits: Vec<Box<dyn Conduit>>,
    events: Option<Sender<SyncEvent>>,
    padp: PadpConfig,
    shutdown: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl SyncServer {
    pub fn new(config: Config, storage: Arc<dyn Storage>) -> Self {
        SyncServer {
            config,
            storage,
            conduits: conduit::default_pipeline(),
            events: None,
            padp: PadpConfig::default(),
            shutdown: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace the default conduit pipeline
    pub fn with_conduits(mut self, conduits: Vec<Box<dyn Conduit>>) -> Self {
        self.conduits = conduits;
        self
    }

    /// Receive lifecycle events on a channel
    pub fn with_events(mut self, sender: Sender<SyncEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn controller(&self) -> ServerController {
        ServerController {
            shutdown: Arc::clone(&self.shutdown),
            running: Arc::clone(&self.running),
        }
    }

    fn emit(&self, event: SyncEvent) {
        if let Some(sender) = &self.events
            && sender.send(event).is_err()
        {
            log::debug!("Event receiver dropped");
        }
    }

    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Run the discovery loop until stopped
    pub fn run(&mut self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        let result = match self.config.mode() {
            Mode::Usb => self.run_usb(),
            Mode::Network => self.run_network(),
            Mode::Serial => self.run_serial(),
        };
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.store(false, Ordering::SeqCst);
        result
    }

    // ========================================================================
    // USB
    // ========================================================================

    fn run_usb(&mut self) -> Result<()> {
        let ctx = Context::new()?;
        log::info!("Watching the USB bus for handhelds");

        while !self.stopping() {
            let Some((device, spec)) = usb::poll_for_device(&ctx, &self.shutdown)? else {
                break;
            };
            self.emit(SyncEvent::DeviceConnected {
                label: spec.label.to_string(),
            });

            match self.service_usb_device(&device, spec) {
                Ok(outcome) => {
                    log::info!(
                        "Sync with \"{}\" finished ({} sync, {} conduit failures)",
                        outcome.user,
                        outcome.sync_type,
                        outcome.conduit_failures
                    );
                    self.emit(SyncEvent::SyncCompleted { outcome });
                }
                Err(Error::DeviceBusy(reason)) => {
                    log::warn!("{} busy, skipping: {}", spec.label, reason);
                    self.emit(SyncEvent::SessionFailed { reason });
                }
                Err(e) => {
                    log::error!("Session with {} failed: {}", spec.label, e);
                    self.emit(SyncEvent::SessionFailed {
                        reason: e.to_string(),
                    });
                }
            }

            log::info!("Waiting for {} to disconnect", spec.label);
            usb::wait_for_disconnect(&ctx, spec.vendor_id, spec.product_id, &self.shutdown)?;
            self.emit(SyncEvent::DeviceRemoved);
        }
        Ok(())
    }

    fn service_usb_device(
        &mut self,
        device: &rusb::Device<Context>,
        spec: &'static crate::transport::devices::UsbDeviceSpec,
    ) -> Result<SessionOutcome> {
        let connection = UsbConnection::open(device, spec)?;
        let recorder = Recorder::new();
        let transport = RecordingTransport::new(connection.into_transport(), recorder.clone());

        let outcome = match spec.stack {
            StackKind::PadpSerial => {
                let mut endpoint = PadpEndpoint::new(transport, self.padp.clone());
                let wakeup = cmp::handshake(&mut endpoint)?;
                // Over USB the negotiated rate is nominal; nothing to reopen
                log::debug!("CMP accepted (nominal baud {})", wakeup.baud);
                self.run_session(Box::new(endpoint), StackKind::PadpSerial, recorder.clone())
            }
            StackKind::NetSync => {
                let mut endpoint = NetSyncEndpoint::new(transport);
                endpoint.handshake()?;
                self.run_session(Box::new(endpoint), StackKind::NetSync, recorder.clone())
            }
        };

        self.dump_capture(&recorder);
        outcome
    }

    // ========================================================================
    // Network (NetSync over TCP)
    // ========================================================================

    fn run_network(&mut self) -> Result<()> {
        let bind_address = self.config.bind_address();
        let listener = NetListener::bind(&bind_address)?;

        while !self.stopping() {
            let Some(transport) = listener.poll_accept()? else {
                thread::sleep(Duration::from_millis(100));
                continue;
            };

            let peer = transport.peer().to_string();
            self.emit(SyncEvent::DeviceConnected {
                label: peer.clone(),
            });

            let recorder = Recorder::new();
            let transport = RecordingTransport::new(transport, recorder.clone());
            let mut endpoint = NetSyncEndpoint::new(transport);

            let result = match endpoint.handshake() {
                Ok(()) => {
                    self.run_session(Box::new(endpoint), StackKind::NetSync, recorder.clone())
                }
                Err(e) => Err(e),
            };
            self.dump_capture(&recorder);

            match result {
                Ok(outcome) => {
                    log::info!(
                        "Sync with \"{}\" over TCP finished ({} sync)",
                        outcome.user,
                        outcome.sync_type
                    );
                    self.emit(SyncEvent::SyncCompleted { outcome });
                }
                Err(e) => {
                    log::error!("NetSync session with {} failed: {}", peer, e);
                    self.emit(SyncEvent::SessionFailed {
                        reason: e.to_string(),
                    });
                }
            }
            // Dropping the connection is the TCP analogue of unplugging
            self.emit(SyncEvent::DeviceRemoved);
        }
        Ok(())
    }

    // ========================================================================
    // Serial cradle
    // ========================================================================

    fn run_serial(&mut self) -> Result<()> {
        let serial = self.config.serial_settings()?.clone();
        log::info!(
            "Listening on {} at {} baud for a HotSync button press",
            serial.port,
            serial.initial_baud
        );

        while !self.stopping() {
            let recorder = Recorder::new();
            let transport = RecordingTransport::new(
                SerialTransport::open(&serial.port, serial.initial_baud)?,
                recorder.clone(),
            );
            let mut endpoint = PadpEndpoint::new(transport, self.padp.clone());

            let wakeup = match cmp::handshake(&mut endpoint) {
                Ok(wakeup) => wakeup,
                Err(Error::Timeout(_)) => continue, // nobody pressed the button yet
                Err(e) => {
                    log::error!("CMP handshake failed: {}", e);
                    continue;
                }
            };

            // The device proposed a rate in its wakeup; reopen there
            let endpoint = if wakeup.baud != 0 && wakeup.baud != serial.initial_baud {
                drop(endpoint);
                thread::sleep(Duration::from_millis(50));
                log::info!("Switching {} to {} baud", serial.port, wakeup.baud);
                let transport = RecordingTransport::new(
                    SerialTransport::open(&serial.port, wakeup.baud)?,
                    recorder.clone(),
                );
                PadpEndpoint::new(transport, self.padp.clone())
            } else {
                endpoint
            };

            let result =
                self.run_session(Box::new(endpoint), StackKind::PadpSerial, recorder.clone());
            self.dump_capture(&recorder);

            match result {
                Ok(outcome) => {
                    log::info!("Serial sync with \"{}\" finished", outcome.user);
                    self.emit(SyncEvent::SyncCompleted { outcome });
                }
                Err(e) => {
                    log::error!("Serial session failed: {}", e);
                    self.emit(SyncEvent::SessionFailed {
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Shared session driving
    // ========================================================================

    fn run_session(
        &mut self,
        link: Box<dyn MessageLink>,
        stack: StackKind,
        recorder: Recorder,
    ) -> Result<SessionOutcome> {
        let mut dlp = crate::dlp::DlpConnection::new(link);
        session::service(&mut dlp, stack, recorder, &*self.storage, &self.conduits)
    }

    fn dump_capture(&self, recorder: &Recorder) {
        let Some(dir) = self.config.capture_dir() else {
            return;
        };
        if recorder.is_empty() {
            return;
        }
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let path = std::path::Path::new(&dir).join(format!("session-{}.capture", stamp));
        if let Err(e) = std::fs::create_dir_all(&dir) {
            log::warn!("Could not create capture dir {}: {}", dir, e);
            return;
        }
        match recorder.dump(&path) {
            Ok(()) => log::info!("Session capture written to {}", path.display()),
            Err(e) => log::warn!("Could not write capture {}: {}", path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn test_server() -> SyncServer {
        let config = Config::parse(
            r#"
            [server]
            mode = "network"

            [storage]
            root = "/tmp/palmsync-test"
            "#,
        )
        .unwrap();
        SyncServer::new(config, Arc::new(MemoryStorage::new()))
    }

    #[test]
    fn test_stop_before_run_is_noop() {
        let server = test_server();
        let controller = server.controller();
        controller.stop();
        assert!(!server.shutdown.load(Ordering::SeqCst));
    }

    #[test]
    fn test_stop_twice_is_idempotent() {
        let server = test_server();
        server.running.store(true, Ordering::SeqCst);
        let controller = server.controller();
        controller.stop();
        controller.stop();
        assert!(server.shutdown.load(Ordering::SeqCst));
    }
}

//! USB transport
//!
//! The most involved adapter. Responsibilities:
//!
//! 1. Poll the bus every 200 ms for a device from the built-in table
//! 2. Open and claim interface 0, detaching a kernel driver (the Linux
//!    "visor" module commonly holds it) where the platform supports it
//! 3. Run the device's initialization dialect to learn the HotSync
//!    endpoints, falling back to descriptor inference (a bulk pair with
//!    64-byte packets)
//! 4. Expose the bulk pipe as a [`Transport`]
//! 5. After the session, poll until the device is physically unplugged so
//!    a still-attached device is not immediately re-serviced
//!
//! The vendor-request parsing and the endpoint inference are factored over
//! plain data so they are testable without hardware.

use super::Transport;
use super::devices::{self, InitDialect, UsbDeviceSpec};
use crate::error::{Error, Result};
use rusb::{Context, Device, DeviceHandle, Direction, Recipient, RequestType, TransferType, UsbContext};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Bus poll cadence for discovery and disconnect waits
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// HotSync bulk endpoints always use 64-byte packets
pub const BULK_PACKET_SIZE: u16 = 64;

const CONTROL_TIMEOUT: Duration = Duration::from_millis(500);
const BULK_READ_TIMEOUT: Duration = Duration::from_millis(100);
const BULK_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

// Vendor control requests understood by the HotSync port
const GET_NUM_BYTES_AVAILABLE: u8 = 0x01;
const GET_CONNECTION_INFO: u8 = 0x03;
const GET_EXT_CONNECTION_INFO: u8 = 0x04;

// Standard requests used by the early-Clié dialect
const GET_CONFIGURATION: u8 = 0x08;
const GET_INTERFACE: u8 = 0x0A;

/// Port function id for HotSync in GET_CONNECTION_INFO replies
const PORT_FUNCTION_HOTSYNC: u8 = 0x02;

/// Port type tag for HotSync in GET_EXT_CONNECTION_INFO replies
const EXT_PORT_TYPE_HOTSYNC: &[u8; 4] = b"cnys";

/// Resolved endpoint numbers of the HotSync bulk pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointPair {
    pub ep_in: u8,
    pub ep_out: u8,
}

/// Issues vendor control-in requests; the real implementation wraps the
/// device handle, tests substitute canned replies
pub trait ControlSource {
    /// Returns the number of reply bytes, or an error if the device stalls
    fn vendor_request(&mut self, request: u8, endpoint: u8, buf: &mut [u8]) -> Result<usize>;
}

/// A bulk endpoint as seen in the interface descriptors
#[derive(Debug, Clone, Copy)]
pub struct EndpointDesc {
    pub address: u8,
    pub bulk: bool,
    pub max_packet_size: u16,
}

// ============================================================================
// Dialect resolution (pure parsing, hardware-free)
// ============================================================================

/// GET_EXT_CONNECTION_INFO reply:
/// `[num_ports][has_different_endpoints][pad:2]` then per port
/// `[type:4][port_number][endpoint_info][pad:2]`
fn parse_ext_connection_info(data: &[u8]) -> Option<EndpointPair> {
    if data.len() < 4 {
        return None;
    }
    let num_ports = data[0] as usize;
    let has_different_endpoints = data[1] != 0;

    for i in 0..num_ports {
        let off = 4 + i * 8;
        if data.len() < off + 8 {
            return None;
        }
        if &data[off..off + 4] != EXT_PORT_TYPE_HOTSYNC {
            continue;
        }
        let port_number = data[off + 4];
        let endpoint_info = data[off + 5];
        return Some(if has_different_endpoints {
            EndpointPair {
                ep_in: endpoint_info >> 4,
                ep_out: endpoint_info & 0x0F,
            }
        } else {
            EndpointPair {
                ep_in: port_number,
                ep_out: port_number,
            }
        });
    }
    None
}

/// GET_CONNECTION_INFO reply:
/// `[num_ports][pad]` then per port `[function][port]`
fn parse_connection_info(data: &[u8]) -> Option<u8> {
    if data.len() < 2 {
        return None;
    }
    let num_ports = data[0] as usize;
    for i in 0..num_ports {
        let off = 2 + i * 2;
        if data.len() < off + 2 {
            return None;
        }
        if data[off] == PORT_FUNCTION_HOTSYNC {
            return Some(data[off + 1]);
        }
    }
    None
}

/// Try one vendor request against every OUT endpoint; first success wins
fn try_each_endpoint(
    source: &mut dyn ControlSource,
    request: u8,
    out_endpoints: &[u8],
    buf: &mut [u8],
) -> Option<usize> {
    for &ep in out_endpoints {
        match source.vendor_request(request, ep, buf) {
            Ok(n) => return Some(n),
            Err(e) => {
                log::debug!(
                    "Vendor request 0x{:02X} on endpoint {} failed: {}",
                    request,
                    ep,
                    e
                );
            }
        }
    }
    None
}

/// The generic dialect: extended connection info first, then the older
/// connection info plus the priming byte-count query some devices need
pub fn resolve_generic(
    source: &mut dyn ControlSource,
    out_endpoints: &[u8],
) -> Option<EndpointPair> {
    let mut buf = [0u8; 64];

    if let Some(n) = try_each_endpoint(source, GET_EXT_CONNECTION_INFO, out_endpoints, &mut buf) {
        if let Some(pair) = parse_ext_connection_info(&buf[..n]) {
            log::debug!("HotSync port via ext connection info: {:?}", pair);
            return Some(pair);
        }
        log::debug!("Ext connection info lists no HotSync port");
    }

    if let Some(n) = try_each_endpoint(source, GET_CONNECTION_INFO, out_endpoints, &mut buf) {
        if let Some(port) = parse_connection_info(&buf[..n]) {
            // Older devices require this query before bulk transfers work;
            // the reply itself is meaningless.
            let mut scratch = [0u8; 2];
            let _ = try_each_endpoint(
                source,
                GET_NUM_BYTES_AVAILABLE,
                out_endpoints,
                &mut scratch,
            );
            log::debug!("HotSync port via connection info: {}", port);
            return Some(EndpointPair {
                ep_in: port,
                ep_out: port,
            });
        }
    }

    None
}

/// Fallback: first bulk IN / bulk OUT pair with 64-byte packets
pub fn infer_bulk_pair(endpoints: &[EndpointDesc]) -> Option<EndpointPair> {
    let mut ep_in = None;
    let mut ep_out = None;

    for ep in endpoints {
        if !ep.bulk || ep.max_packet_size != BULK_PACKET_SIZE {
            continue;
        }
        if ep.address & 0x80 != 0 {
            ep_in.get_or_insert(ep.address & 0x0F);
        } else {
            ep_out.get_or_insert(ep.address & 0x0F);
        }
    }

    Some(EndpointPair {
        ep_in: ep_in?,
        ep_out: ep_out?,
    })
}

// ============================================================================
// Discovery
// ============================================================================

/// Scan the bus once for a device from the table
pub fn find_device(ctx: &Context) -> Result<Option<(Device<Context>, &'static UsbDeviceSpec)>> {
    for device in ctx.devices()?.iter() {
        let Ok(desc) = device.device_descriptor() else {
            continue;
        };
        if let Some(spec) = devices::lookup(desc.vendor_id(), desc.product_id()) {
            return Ok(Some((device, spec)));
        }
    }
    Ok(None)
}

/// Poll until a known device appears or shutdown is requested
pub fn poll_for_device(
    ctx: &Context,
    shutdown: &AtomicBool,
) -> Result<Option<(Device<Context>, &'static UsbDeviceSpec)>> {
    while !shutdown.load(Ordering::Relaxed) {
        if let Some(found) = find_device(ctx)? {
            log::info!("Found {} on the bus", found.1.label);
            return Ok(Some(found));
        }
        thread::sleep(POLL_INTERVAL);
    }
    Ok(None)
}

/// Block until the device disappears from the bus
pub fn wait_for_disconnect(
    ctx: &Context,
    vendor_id: u16,
    product_id: u16,
    shutdown: &AtomicBool,
) -> Result<()> {
    while !shutdown.load(Ordering::Relaxed) {
        let mut present = false;
        for device in ctx.devices()?.iter() {
            if let Ok(desc) = device.device_descriptor()
                && desc.vendor_id() == vendor_id
                && desc.product_id() == product_id
            {
                present = true;
                break;
            }
        }
        if !present {
            log::info!("Device {:04x}:{:04x} removed", vendor_id, product_id);
            return Ok(());
        }
        thread::sleep(POLL_INTERVAL);
    }
    Ok(())
}

// ============================================================================
// Open / claim / configure
// ============================================================================

struct HandleControlSource<'a> {
    handle: &'a DeviceHandle<Context>,
}

impl ControlSource for HandleControlSource<'_> {
    fn vendor_request(&mut self, request: u8, endpoint: u8, buf: &mut [u8]) -> Result<usize> {
        let request_type = rusb::request_type(Direction::In, RequestType::Vendor, Recipient::Endpoint);
        Ok(self.handle.read_control(
            request_type,
            request,
            0,
            endpoint as u16,
            buf,
            CONTROL_TIMEOUT,
        )?)
    }
}

/// An opened, claimed, endpoint-configured device
pub struct UsbConnection {
    handle: DeviceHandle<Context>,
    spec: &'static UsbDeviceSpec,
    endpoints: EndpointPair,
}

fn map_open_error(e: rusb::Error) -> Error {
    match e {
        rusb::Error::Access | rusb::Error::Busy => Error::DeviceBusy(e.to_string()),
        other => other.into(),
    }
}

impl UsbConnection {
    /// Open a discovered device and resolve its HotSync endpoints
    pub fn open(device: &Device<Context>, spec: &'static UsbDeviceSpec) -> Result<Self> {
        let mut handle = device.open().map_err(map_open_error)?;

        match handle.kernel_driver_active(0) {
            Ok(true) => {
                if let Err(e) = handle.detach_kernel_driver(0) {
                    log::warn!("Failed to detach kernel driver: {}", e);
                }
            }
            Ok(false) => {}
            Err(rusb::Error::NotSupported) => {}
            Err(e) => log::debug!("Kernel driver query failed: {}", e),
        }

        handle.claim_interface(0).map_err(map_open_error)?;
        log::debug!("Claimed interface 0 of {}", spec.label);

        let (descriptor_endpoints, out_endpoints) = scan_endpoints(device)?;

        let resolved = match spec.init {
            InitDialect::None => None,
            InitDialect::Generic => {
                let mut source = HandleControlSource { handle: &handle };
                resolve_generic(&mut source, &out_endpoints)
            }
            InitDialect::EarlySonyClie => {
                sony_clie_init(&handle);
                None
            }
        };

        let endpoints = match resolved.or_else(|| infer_bulk_pair(&descriptor_endpoints)) {
            Some(pair) => pair,
            None => {
                let _ = handle.release_interface(0);
                return Err(Error::Protocol(format!(
                    "{}: no HotSync bulk endpoint pair",
                    spec.label
                )));
            }
        };

        log::info!(
            "{} configured: bulk in {} / out {}",
            spec.label,
            endpoints.ep_in,
            endpoints.ep_out
        );

        Ok(UsbConnection {
            handle,
            spec,
            endpoints,
        })
    }

    pub fn spec(&self) -> &'static UsbDeviceSpec {
        self.spec
    }

    pub fn endpoints(&self) -> EndpointPair {
        self.endpoints
    }

    pub fn into_transport(self) -> UsbTransport {
        UsbTransport {
            handle: self.handle,
            endpoints: self.endpoints,
            closing: AtomicBool::new(false),
        }
    }
}

/// Walk interface 0's descriptors; returns (all endpoints, OUT addresses)
fn scan_endpoints(device: &Device<Context>) -> Result<(Vec<EndpointDesc>, Vec<u8>)> {
    let config = device.active_config_descriptor().or_else(|_| device.config_descriptor(0))?;
    let mut all = Vec::new();
    let mut outs = Vec::new();

    for interface in config.interfaces() {
        if interface.number() != 0 {
            continue;
        }
        let Some(descriptor) = interface.descriptors().next() else {
            continue;
        };
        for endpoint in descriptor.endpoint_descriptors() {
            let desc = EndpointDesc {
                address: endpoint.address(),
                bulk: endpoint.transfer_type() == TransferType::Bulk,
                max_packet_size: endpoint.max_packet_size(),
            };
            all.push(desc);
            if endpoint.direction() == Direction::Out {
                outs.push(endpoint.address() & 0x0F);
            }
        }
    }
    Ok((all, outs))
}

/// First-generation Cliés refuse bulk traffic until they have seen these
/// two standard control-ins; no endpoint info comes back.
fn sony_clie_init(handle: &DeviceHandle<Context>) {
    let mut byte = [0u8; 1];

    let device_in = rusb::request_type(Direction::In, RequestType::Standard, Recipient::Device);
    if let Err(e) = handle.read_control(device_in, GET_CONFIGURATION, 0, 0, &mut byte, CONTROL_TIMEOUT)
    {
        log::warn!("Clié GET_CONFIGURATION failed: {}", e);
    }

    let interface_in = rusb::request_type(Direction::In, RequestType::Standard, Recipient::Interface);
    if let Err(e) = handle.read_control(interface_in, GET_INTERFACE, 0, 0, &mut byte, CONTROL_TIMEOUT)
    {
        log::warn!("Clié GET_INTERFACE failed: {}", e);
    }
}

// ============================================================================
// Bulk transport
// ============================================================================

/// Byte-duplex over the HotSync bulk pipe
pub struct UsbTransport {
    handle: DeviceHandle<Context>,
    endpoints: EndpointPair,
    closing: AtomicBool,
}

impl UsbTransport {
    /// Mark the transport as closing so a pending read failure during
    /// deliberate teardown is swallowed instead of surfacing an error
    pub fn begin_close(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }
}

impl Transport for UsbTransport {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let len = buffer.len().min(BULK_PACKET_SIZE as usize);
        let address = 0x80 | self.endpoints.ep_in;
        match self.handle.read_bulk(address, &mut buffer[..len], BULK_READ_TIMEOUT) {
            Ok(n) => Ok(n),
            Err(rusb::Error::Timeout) => Ok(0),
            Err(e) if self.closing.load(Ordering::SeqCst) => {
                log::debug!("Ignoring read error during close: {}", e);
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        Ok(self
            .handle
            .write_bulk(self.endpoints.ep_out, data, BULK_WRITE_TIMEOUT)?)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        self.begin_close();
        // Some drivers fail the release with a pending request; tolerated.
        if let Err(e) = self.handle.release_interface(0) {
            log::warn!("Interface release failed (ignored): {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Canned control-request responder
    struct FakeControlSource {
        ext_info: Option<Vec<u8>>,
        conn_info: Option<Vec<u8>>,
        /// Endpoints that stall every request
        dead_endpoints: Vec<u8>,
        requests: Vec<(u8, u8)>,
    }

    impl FakeControlSource {
        fn new(ext_info: Option<Vec<u8>>, conn_info: Option<Vec<u8>>) -> Self {
            FakeControlSource {
                ext_info,
                conn_info,
                dead_endpoints: Vec::new(),
                requests: Vec::new(),
            }
        }
    }

    impl ControlSource for FakeControlSource {
        fn vendor_request(&mut self, request: u8, endpoint: u8, buf: &mut [u8]) -> Result<usize> {
            self.requests.push((request, endpoint));
            if self.dead_endpoints.contains(&endpoint) {
                return Err(Error::Usb(rusb::Error::Pipe));
            }
            let reply = match request {
                GET_EXT_CONNECTION_INFO => self.ext_info.as_ref(),
                GET_CONNECTION_INFO => self.conn_info.as_ref(),
                GET_NUM_BYTES_AVAILABLE => return Ok(2),
                _ => None,
            };
            match reply {
                Some(bytes) => {
                    buf[..bytes.len()].copy_from_slice(bytes);
                    Ok(bytes.len())
                }
                None => Err(Error::Usb(rusb::Error::Pipe)),
            }
        }
    }

    fn ext_info_with_hotsync(port: u8) -> Vec<u8> {
        let mut data = vec![1, 0, 0, 0];
        data.extend_from_slice(EXT_PORT_TYPE_HOTSYNC);
        data.extend_from_slice(&[port, 0, 0, 0]);
        data
    }

    #[test]
    fn test_m500_discovery_dialect() {
        // vid 0x0830 pid 0x0060 is in the table with the generic dialect;
        // its ext connection info names HotSync port 2 with shared endpoints
        let spec = devices::lookup(0x0830, 0x0060).unwrap();
        assert_eq!(spec.init, InitDialect::Generic);

        let mut source = FakeControlSource::new(Some(ext_info_with_hotsync(2)), None);
        let pair = resolve_generic(&mut source, &[2]).unwrap();
        assert_eq!(pair, EndpointPair { ep_in: 2, ep_out: 2 });
    }

    #[test]
    fn test_ext_info_different_endpoints() {
        let mut data = vec![2, 1, 0, 0];
        // first port is not HotSync
        data.extend_from_slice(b"_ppp");
        data.extend_from_slice(&[1, 0x11, 0, 0]);
        data.extend_from_slice(EXT_PORT_TYPE_HOTSYNC);
        data.extend_from_slice(&[0, 0x34, 0, 0]);

        let pair = parse_ext_connection_info(&data).unwrap();
        assert_eq!(pair, EndpointPair { ep_in: 3, ep_out: 4 });
    }

    #[test]
    fn test_connection_info_fallback_with_priming() {
        // No ext info; connection info reports HotSync on port 1
        let conn = vec![2, 0, 0x01, 0x05, PORT_FUNCTION_HOTSYNC, 0x01];
        let mut source = FakeControlSource::new(None, Some(conn));

        let pair = resolve_generic(&mut source, &[1]).unwrap();
        assert_eq!(pair, EndpointPair { ep_in: 1, ep_out: 1 });

        // The priming GET_NUM_BYTES_AVAILABLE must have been issued
        assert!(
            source
                .requests
                .iter()
                .any(|&(req, _)| req == GET_NUM_BYTES_AVAILABLE)
        );
    }

    #[test]
    fn test_vendor_request_tries_each_out_endpoint() {
        let mut source = FakeControlSource::new(Some(ext_info_with_hotsync(2)), None);
        source.dead_endpoints.push(1);

        let pair = resolve_generic(&mut source, &[1, 2]).unwrap();
        assert_eq!(pair, EndpointPair { ep_in: 2, ep_out: 2 });
        // Endpoint 1 was tried first and stalled
        assert_eq!(source.requests[0], (GET_EXT_CONNECTION_INFO, 1));
        assert_eq!(source.requests[1], (GET_EXT_CONNECTION_INFO, 2));
    }

    #[test]
    fn test_no_dialect_match_yields_none() {
        let mut source = FakeControlSource::new(None, None);
        assert!(resolve_generic(&mut source, &[1, 2]).is_none());
    }

    #[test]
    fn test_infer_bulk_pair() {
        let endpoints = [
            EndpointDesc {
                address: 0x81,
                bulk: false,
                max_packet_size: 8,
            },
            EndpointDesc {
                address: 0x82,
                bulk: true,
                max_packet_size: 64,
            },
            EndpointDesc {
                address: 0x02,
                bulk: true,
                max_packet_size: 64,
            },
        ];
        let pair = infer_bulk_pair(&endpoints).unwrap();
        assert_eq!(pair, EndpointPair { ep_in: 2, ep_out: 2 });
    }

    #[test]
    fn test_infer_rejects_wrong_packet_size() {
        let endpoints = [
            EndpointDesc {
                address: 0x81,
                bulk: true,
                max_packet_size: 512,
            },
            EndpointDesc {
                address: 0x01,
                bulk: true,
                max_packet_size: 512,
            },
        ];
        assert!(infer_bulk_pair(&endpoints).is_none());
    }

    #[test]
    fn test_infer_requires_both_directions() {
        let endpoints = [EndpointDesc {
            address: 0x81,
            bulk: true,
            max_packet_size: 64,
        }];
        assert!(infer_bulk_pair(&endpoints).is_none());
    }
}

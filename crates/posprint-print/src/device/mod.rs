// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Device session manager.
//
// Owns the connection to physical printers: one cached low-level USB context
// shared by all sessions, a per-address lock so only one job talks to a
// printer at a time, and the recovery policy for stale contexts (discard the
// context and retry the open exactly once).
//
// A session walks an explicit state machine:
//
//   Closed --open--> Open --acquire_endpoint--> Claimed
//     ^                |                           |
//     +----close/drop--+-----------close/drop------+
//
// Acquired layers (configuration, interface, endpoint) are always released
// in reverse order, whether on a failed acquisition, on close or on drop.

pub mod hid;
#[cfg(feature = "usb")]
pub mod libusb;

#[cfg(test)]
pub(crate) mod fake;

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use posprint_core::config::DeviceConfig;
use posprint_core::error::{PosPrintError, Result};
use posprint_core::types::{DeviceAddress, LabelGap, LabelSpec};
use tracing::{debug, info, instrument, warn};

use crate::tspl;

pub use hid::{HidBackend, HidDevice, HidSession};

/// Configuration value selected before claiming the interface.
pub const CONFIGURATION: u8 = 1;
pub const INTERFACE: u8 = 0;
pub const ALT_SETTING: u8 = 0;
/// Bulk OUT endpoint carrying print data.
pub const OUT_ENDPOINT: u8 = 0x01;

// ---------------------------------------------------------------------------
// Backend seams
// ---------------------------------------------------------------------------

/// Creates low-level USB contexts.
pub trait UsbBackend: Send + Sync {
    fn new_context(&self) -> Result<Box<dyn UsbContext>>;
}

/// A low-level USB context (a libusb session).
pub trait UsbContext: Send {
    /// Open the first device matching `address`; `Ok(None)` when none does.
    fn open(&self, address: DeviceAddress) -> Result<Option<Box<dyn UsbDevice>>>;

    fn close(self: Box<Self>) -> Result<()>;
}

/// An opened USB device handle.
pub trait UsbDevice: Send {
    fn set_configuration(&mut self, configuration: u8) -> Result<()>;
    fn release_configuration(&mut self) -> Result<()>;
    fn claim_interface(&mut self, interface: u8, alt_setting: u8) -> Result<()>;
    fn release_interface(&mut self, interface: u8) -> Result<()>;
    fn open_out_endpoint(&mut self, endpoint: u8) -> Result<()>;
    fn release_endpoint(&mut self, endpoint: u8) -> Result<()>;

    /// One bulk transfer; returns the number of bytes actually written.
    fn write(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize>;

    fn close(self: Box<Self>) -> Result<()>;
}

/// Backend used when no USB transport is compiled in.
pub struct UnavailableBackend;

impl UsbBackend for UnavailableBackend {
    fn new_context(&self) -> Result<Box<dyn UsbContext>> {
        Err(PosPrintError::Unsupported(
            "USB transport not compiled in (enable the `usb` feature)".into(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Per-address locking
// ---------------------------------------------------------------------------

/// Set of addresses currently held by a session.
#[derive(Default)]
pub(crate) struct AddressLocks {
    busy: Mutex<HashSet<DeviceAddress>>,
    released: Condvar,
}

impl AddressLocks {
    /// Block until `address` is free, then hold it until the guard drops.
    pub(crate) fn acquire(self: &Arc<Self>, address: DeviceAddress) -> AddressGuard {
        let mut busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        while busy.contains(&address) {
            debug!(%address, "waiting for device lock");
            busy = self
                .released
                .wait(busy)
                .unwrap_or_else(PoisonError::into_inner);
        }
        busy.insert(address);
        AddressGuard {
            locks: Arc::clone(self),
            address,
        }
    }
}

pub(crate) struct AddressGuard {
    locks: Arc<AddressLocks>,
    address: DeviceAddress,
}

impl Drop for AddressGuard {
    fn drop(&mut self) {
        let mut busy = self
            .locks
            .busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        busy.remove(&self.address);
        self.locks.released.notify_all();
    }
}

// ---------------------------------------------------------------------------
// DeviceManager
// ---------------------------------------------------------------------------

/// Owns the cached USB context and hands out device sessions.
pub struct DeviceManager {
    backend: Box<dyn UsbBackend>,
    context: Mutex<Option<Box<dyn UsbContext>>>,
    locks: Arc<AddressLocks>,
    hid: Option<Box<dyn HidBackend>>,
    config: DeviceConfig,
}

impl DeviceManager {
    pub fn new(backend: Box<dyn UsbBackend>, config: DeviceConfig) -> Self {
        Self {
            backend,
            context: Mutex::new(None),
            locks: Arc::new(AddressLocks::default()),
            hid: None,
            config,
        }
    }

    /// Attach a HID transport for raster printing.
    pub fn with_hid(mut self, hid: Box<dyn HidBackend>) -> Self {
        self.hid = Some(hid);
        self
    }

    /// Manager over the transports compiled into this build.
    pub fn system(config: DeviceConfig) -> Self {
        #[cfg(feature = "usb")]
        let manager = Self::new(Box::new(libusb::LibusbBackend), config);
        #[cfg(not(feature = "usb"))]
        let manager = Self::new(Box::new(UnavailableBackend), config);

        #[cfg(feature = "hid")]
        let manager = manager.with_hid(Box::new(hid::HidApiBackend));

        manager
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    fn lock_context(&self) -> MutexGuard<'_, Option<Box<dyn UsbContext>>> {
        self.context.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a low-level context is currently cached.
    pub fn is_ready(&self) -> bool {
        self.lock_context().is_some()
    }

    /// Probe for `address` using a throwaway context. Nothing stays open
    /// afterwards, whatever the outcome.
    #[instrument(skip(self), fields(address = %address))]
    pub fn check_presence(&self, address: DeviceAddress) -> Result<()> {
        let context = self.backend.new_context().map_err(into_open_failed)?;

        let outcome = match context.open(address) {
            Ok(Some(device)) => {
                if let Err(e) = device.close() {
                    warn!(error = %e, "failed to close probed device");
                }
                Ok(())
            }
            Ok(None) => Err(PosPrintError::DeviceNotFound { address }),
            Err(e) => Err(into_open_failed(e)),
        };

        if let Err(e) = context.close() {
            warn!(error = %e, "failed to close probe context");
        }
        debug!(present = outcome.is_ok(), "presence check finished");
        outcome
    }

    /// Open a session on `address`, waiting for any other session on the
    /// same address to finish first.
    ///
    /// An open error discards the cached context and retries once with a
    /// fresh one. A missing device is reported immediately.
    #[instrument(skip(self), fields(address = %address))]
    pub fn open(&self, address: DeviceAddress) -> Result<DeviceSession> {
        let guard = self.locks.acquire(address);

        let device = {
            let mut slot = self.lock_context();
            match self.open_with(&mut slot, address) {
                Ok(device) => device,
                Err(e @ PosPrintError::DeviceNotFound { .. }) => return Err(e),
                Err(first) => {
                    warn!(error = %first, "open failed, resetting context and retrying once");
                    discard_context(&mut slot);
                    self.open_with(&mut slot, address).map_err(|e| match e {
                        PosPrintError::DeviceNotFound { .. } => e,
                        other => into_open_failed(other),
                    })?
                }
            }
        };

        debug!("device opened");
        Ok(DeviceSession::new(address, device, &self.config, guard))
    }

    fn open_with(
        &self,
        slot: &mut Option<Box<dyn UsbContext>>,
        address: DeviceAddress,
    ) -> Result<Box<dyn UsbDevice>> {
        let context = match slot.take() {
            Some(context) => context,
            None => {
                debug!("creating device context");
                self.backend.new_context()?
            }
        };
        let opened = context.open(address);
        *slot = Some(context);
        opened?.ok_or(PosPrintError::DeviceNotFound { address })
    }

    /// Discard the cached context; the next open starts from scratch.
    pub fn reset(&self) {
        let mut slot = self.lock_context();
        if slot.is_some() {
            discard_context(&mut slot);
            info!("device context reset");
        }
    }

    /// Shutdown hook: release the cached context.
    pub fn cleanup(&self) {
        self.reset();
        debug!("device manager cleaned up");
    }

    /// Print one label: open, claim, negotiate the gap, encode, send, close.
    #[instrument(skip(self, label), fields(address = %address, copies = label.copies))]
    pub fn print_label(&self, address: DeviceAddress, label: &LabelSpec) -> Result<()> {
        let mut session = self.open(address)?;
        session.acquire_endpoint()?;

        let gap = session.negotiate_gap(label.gap);
        let commands = tspl::encode_label(label, gap)?;
        session.send(commands.as_bytes())?;

        // The label is already printing; a teardown hiccup must not cause a reprint.
        if let Err(e) = session.close() {
            warn!(error = %e, "error while closing device after successful send");
        }
        info!(bytes = commands.len(), "label sent");
        Ok(())
    }

    /// Open the HID channel of `address` for raster output.
    #[instrument(skip(self), fields(address = %address))]
    pub fn open_hid(&self, address: DeviceAddress) -> Result<HidSession> {
        let backend = self
            .hid
            .as_ref()
            .ok_or_else(|| PosPrintError::Unsupported("HID transport not configured".into()))?;

        let guard = self.locks.acquire(address);
        let device = backend
            .open(address)?
            .ok_or(PosPrintError::DeviceNotFound { address })?;
        Ok(HidSession::new(device, &self.config, guard))
    }

    /// Send a raster stream over HID.
    pub fn print_raster(&self, address: DeviceAddress, data: &[u8]) -> Result<()> {
        let mut session = self.open_hid(address)?;
        let reports = session.send(data)?;
        info!(%address, bytes = data.len(), reports, "raster sent");
        Ok(())
    }
}

fn discard_context(slot: &mut Option<Box<dyn UsbContext>>) {
    if let Some(context) = slot.take() {
        if let Err(e) = context.close() {
            warn!(error = %e, "failed to close device context");
        }
    }
}

fn into_open_failed(err: PosPrintError) -> PosPrintError {
    match err {
        PosPrintError::OpenFailed(_) | PosPrintError::Unsupported(_) => err,
        other => PosPrintError::OpenFailed(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// DeviceSession
// ---------------------------------------------------------------------------

/// Lifecycle of a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Torn down; no handle held.
    Closed,
    /// Device handle open, nothing claimed.
    Open,
    /// Configuration, interface and OUT endpoint claimed; ready to write.
    Claimed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layer {
    Configuration,
    Interface,
    Endpoint,
}

/// One job's exclusive handle on a printer.
pub struct DeviceSession {
    address: DeviceAddress,
    device: Option<Box<dyn UsbDevice>>,
    /// Acquired layers, innermost last.
    layers: Vec<Layer>,
    state: SessionState,
    write_timeout: Duration,
    autodetect_settle: Duration,
    fallback_gap: LabelGap,
    _guard: AddressGuard,
}

impl DeviceSession {
    fn new(
        address: DeviceAddress,
        device: Box<dyn UsbDevice>,
        config: &DeviceConfig,
        guard: AddressGuard,
    ) -> Self {
        Self {
            address,
            device: Some(device),
            layers: Vec::with_capacity(3),
            state: SessionState::Open,
            write_timeout: config.write_timeout(),
            autodetect_settle: config.autodetect_settle(),
            fallback_gap: config.fallback_gap(),
            _guard: guard,
        }
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Claim configuration 1, interface 0 (alt 0) and OUT endpoint 1. On any
    /// failure the layers already claimed are released before returning.
    pub fn acquire_endpoint(&mut self) -> Result<()> {
        match self.state {
            SessionState::Claimed => return Ok(()),
            SessionState::Closed => {
                return Err(PosPrintError::OpenFailed("session is closed".into()));
            }
            SessionState::Open => {}
        }

        for layer in [Layer::Configuration, Layer::Interface, Layer::Endpoint] {
            if let Err(e) = self.acquire(layer) {
                warn!(address = %self.address, ?layer, error = %e, "claim failed, releasing");
                if let Some(release_err) = self.release_layers() {
                    warn!(error = %release_err, "release after failed claim also failed");
                }
                return Err(into_open_failed(e));
            }
            self.layers.push(layer);
        }

        self.state = SessionState::Claimed;
        debug!(address = %self.address, "endpoint acquired");
        Ok(())
    }

    fn acquire(&mut self, layer: Layer) -> Result<()> {
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| PosPrintError::OpenFailed("session is closed".into()))?;
        match layer {
            Layer::Configuration => device.set_configuration(CONFIGURATION),
            Layer::Interface => device.claim_interface(INTERFACE, ALT_SETTING),
            Layer::Endpoint => device.open_out_endpoint(OUT_ENDPOINT),
        }
    }

    /// Release claimed layers innermost first. Every layer is attempted;
    /// the first error is returned.
    fn release_layers(&mut self) -> Option<PosPrintError> {
        let mut first_error = None;
        while let Some(layer) = self.layers.pop() {
            let Some(device) = self.device.as_mut() else {
                break;
            };
            let released = match layer {
                Layer::Endpoint => device.release_endpoint(OUT_ENDPOINT),
                Layer::Interface => device.release_interface(INTERFACE),
                Layer::Configuration => device.release_configuration(),
            };
            if let Err(e) = released {
                warn!(address = %self.address, ?layer, error = %e, "release failed");
                first_error.get_or_insert(e);
            }
        }
        if self.state == SessionState::Claimed {
            self.state = SessionState::Open;
        }
        first_error
    }

    /// Write `data` in a single bulk transfer. Anything short of the full
    /// buffer is an error.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.state != SessionState::Claimed {
            return Err(PosPrintError::TransportWrite(format!(
                "endpoint not acquired (session {:?})",
                self.state
            )));
        }
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| PosPrintError::TransportWrite("session is closed".into()))?;

        let written = device.write(OUT_ENDPOINT, data, self.write_timeout)?;
        if written != data.len() {
            return Err(PosPrintError::TransportWrite(format!(
                "short write: {written} of {} bytes",
                data.len()
            )));
        }
        debug!(address = %self.address, bytes = written, "bulk write complete");
        Ok(())
    }

    /// Resolve the gap to print with.
    ///
    /// An explicit gap is returned unchanged. A zero gap sends `AUTODETECT`
    /// and waits for the printer to settle, returning the zero gap so the
    /// encoder omits the `GAP` command; if that write fails the configured
    /// fallback gap is used instead.
    pub fn negotiate_gap(&mut self, gap: LabelGap) -> LabelGap {
        if !gap.is_auto() {
            return gap;
        }
        match self.send(tspl::AUTODETECT.as_bytes()) {
            Ok(()) => {
                debug!(settle_ms = self.autodetect_settle.as_millis() as u64, "gap autodetect sent");
                std::thread::sleep(self.autodetect_settle);
                gap
            }
            Err(e) => {
                warn!(
                    address = %self.address,
                    error = %e,
                    fallback_mm = self.fallback_gap.length_mm,
                    "gap autodetect failed, using fallback gap"
                );
                self.fallback_gap
            }
        }
    }

    /// Release endpoint, interface, configuration and finally the device.
    /// Every step runs even if an earlier one fails; the first error is
    /// returned.
    pub fn close(mut self) -> Result<()> {
        match self.teardown() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn teardown(&mut self) -> Option<PosPrintError> {
        let mut first_error = self.release_layers();
        if let Some(device) = self.device.take() {
            if let Err(e) = device.close() {
                warn!(address = %self.address, error = %e, "device close failed");
                first_error.get_or_insert(e);
            }
        }
        self.state = SessionState::Closed;
        debug!(address = %self.address, "session closed");
        first_error
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        if self.state != SessionState::Closed {
            if let Some(e) = self.teardown() {
                warn!(address = %self.address, error = %e, "teardown on drop failed");
            }
        }
    }
}

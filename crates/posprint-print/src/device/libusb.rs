// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// libusb backend (via `rusb`).

use std::time::Duration;

use posprint_core::error::{PosPrintError, Result};
use posprint_core::types::DeviceAddress;
use rusb::{Context, DeviceHandle, Direction, UsbContext as _};
use tracing::{debug, trace};

use super::{UsbBackend, UsbContext, UsbDevice};

/// Creates one libusb context per call.
pub struct LibusbBackend;

impl UsbBackend for LibusbBackend {
    fn new_context(&self) -> Result<Box<dyn UsbContext>> {
        let context = Context::new()
            .map_err(|e| PosPrintError::OpenFailed(format!("libusb init: {e}")))?;
        Ok(Box::new(LibusbContext { context }))
    }
}

struct LibusbContext {
    context: Context,
}

impl UsbContext for LibusbContext {
    fn open(&self, address: DeviceAddress) -> Result<Option<Box<dyn UsbDevice>>> {
        let devices = self
            .context
            .devices()
            .map_err(|e| PosPrintError::OpenFailed(format!("enumerate devices: {e}")))?;

        for device in devices.iter() {
            let Ok(descriptor) = device.device_descriptor() else {
                continue;
            };
            if descriptor.vendor_id() != address.vendor_id
                || descriptor.product_id() != address.product_id
            {
                continue;
            }

            trace!(bus = device.bus_number(), port = device.address(), "matching device");
            let handle = device
                .open()
                .map_err(|e| PosPrintError::OpenFailed(format!("open {address}: {e}")))?;
            return Ok(Some(Box::new(LibusbDevice { handle })));
        }
        Ok(None)
    }

    fn close(self: Box<Self>) -> Result<()> {
        // libusb_exit runs once the last handle referencing the context drops.
        drop(self.context);
        Ok(())
    }
}

struct LibusbDevice {
    handle: DeviceHandle<Context>,
}

impl UsbDevice for LibusbDevice {
    fn set_configuration(&mut self, configuration: u8) -> Result<()> {
        // Not supported on every platform; claiming still works without it.
        let _ = self.handle.set_auto_detach_kernel_driver(true);

        if self.handle.active_configuration().ok() == Some(configuration) {
            return Ok(());
        }
        self.handle
            .set_active_configuration(configuration)
            .map_err(|e| PosPrintError::OpenFailed(format!("set configuration {configuration}: {e}")))
    }

    fn release_configuration(&mut self) -> Result<()> {
        Ok(())
    }

    fn claim_interface(&mut self, interface: u8, alt_setting: u8) -> Result<()> {
        self.handle
            .claim_interface(interface)
            .map_err(|e| PosPrintError::OpenFailed(format!("claim interface {interface}: {e}")))?;

        if let Err(e) = self.handle.set_alternate_setting(interface, alt_setting) {
            let _ = self.handle.release_interface(interface);
            return Err(PosPrintError::OpenFailed(format!(
                "interface {interface} alt setting {alt_setting}: {e}"
            )));
        }
        Ok(())
    }

    fn release_interface(&mut self, interface: u8) -> Result<()> {
        self.handle
            .release_interface(interface)
            .map_err(|e| PosPrintError::TransportWrite(format!("release interface {interface}: {e}")))
    }

    fn open_out_endpoint(&mut self, endpoint: u8) -> Result<()> {
        let config = self
            .handle
            .device()
            .active_config_descriptor()
            .map_err(|e| PosPrintError::OpenFailed(format!("read config descriptor: {e}")))?;

        let mut found = false;
        for interface in config.interfaces() {
            for descriptor in interface.descriptors() {
                found |= descriptor
                    .endpoint_descriptors()
                    .any(|ep| ep.address() == endpoint && ep.direction() == Direction::Out);
            }
        }

        if !found {
            return Err(PosPrintError::OpenFailed(format!(
                "OUT endpoint {endpoint:#04x} not present"
            )));
        }
        debug!(endpoint, "OUT endpoint ready");
        Ok(())
    }

    fn release_endpoint(&mut self, _endpoint: u8) -> Result<()> {
        Ok(())
    }

    fn write(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize> {
        self.handle
            .write_bulk(endpoint, data, timeout)
            .map_err(|e| PosPrintError::TransportWrite(format!("bulk write: {e}")))
    }

    fn close(self: Box<Self>) -> Result<()> {
        drop(self.handle);
        Ok(())
    }
}

// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// HID transport for raster printers that expose only a HID interface.
//
// The byte stream is cut into fixed 64-byte output reports (one report-ID
// byte followed by 63 payload bytes, zero padded). The cut is pure byte
// chunking and ignores command boundaries. Reports are paced because some
// printers silently drop back-to-back writes.

use std::time::Duration;

use posprint_core::config::DeviceConfig;
use posprint_core::error::{PosPrintError, Result};
use posprint_core::types::DeviceAddress;
use tracing::debug;

use super::AddressGuard;

/// Size of one output report including the report-ID byte.
pub const REPORT_SIZE: usize = 64;
/// Payload bytes per report.
pub const REPORT_PAYLOAD: usize = REPORT_SIZE - 1;

/// Split `data` into padded output reports.
pub fn chunk_reports(data: &[u8], report_id: u8) -> impl Iterator<Item = [u8; REPORT_SIZE]> + '_ {
    data.chunks(REPORT_PAYLOAD).map(move |chunk| {
        let mut report = [0u8; REPORT_SIZE];
        report[0] = report_id;
        report[1..=chunk.len()].copy_from_slice(chunk);
        report
    })
}

/// Opens HID devices by vendor/product id.
pub trait HidBackend: Send + Sync {
    /// `Ok(None)` when no matching device is attached.
    fn open(&self, address: DeviceAddress) -> Result<Option<Box<dyn HidDevice>>>;
}

pub trait HidDevice: Send {
    /// Write one output report; returns the bytes accepted.
    fn write_report(&mut self, report: &[u8]) -> Result<usize>;
}

/// An open HID channel holding the printer's address lock.
pub struct HidSession {
    device: Box<dyn HidDevice>,
    report_id: u8,
    packet_delay: Duration,
    _guard: AddressGuard,
}

impl HidSession {
    pub(crate) fn new(device: Box<dyn HidDevice>, config: &DeviceConfig, guard: AddressGuard) -> Self {
        Self {
            device,
            report_id: config.hid_report_id,
            packet_delay: config.hid_packet_delay(),
            _guard: guard,
        }
    }

    /// Send `data` as a paced sequence of reports. Returns the number of
    /// reports written.
    pub fn send(&mut self, data: &[u8]) -> Result<usize> {
        let mut sent = 0;
        for report in chunk_reports(data, self.report_id) {
            if sent > 0 && !self.packet_delay.is_zero() {
                std::thread::sleep(self.packet_delay);
            }
            let written = self.device.write_report(&report)?;
            if written < REPORT_SIZE {
                return Err(PosPrintError::TransportWrite(format!(
                    "short HID write: {written} of {REPORT_SIZE} bytes in report {sent}"
                )));
            }
            sent += 1;
        }
        debug!(reports = sent, bytes = data.len(), "HID stream written");
        Ok(sent)
    }
}

// ---------------------------------------------------------------------------
// hidapi backend
// ---------------------------------------------------------------------------

#[cfg(feature = "hid")]
pub use self::hidapi_backend::HidApiBackend;

#[cfg(feature = "hid")]
mod hidapi_backend {
    use hidapi::HidApi;
    use posprint_core::error::{PosPrintError, Result};
    use posprint_core::types::DeviceAddress;
    use tracing::debug;

    use super::{HidBackend, HidDevice};

    /// HID access through the system hidapi library.
    pub struct HidApiBackend;

    impl HidBackend for HidApiBackend {
        fn open(&self, address: DeviceAddress) -> Result<Option<Box<dyn HidDevice>>> {
            let api = HidApi::new()
                .map_err(|e| PosPrintError::OpenFailed(format!("hidapi init: {e}")))?;

            let present = api.device_list().any(|info| {
                info.vendor_id() == address.vendor_id && info.product_id() == address.product_id
            });
            if !present {
                return Ok(None);
            }

            let device = api
                .open(address.vendor_id, address.product_id)
                .map_err(|e| PosPrintError::OpenFailed(format!("open HID {address}: {e}")))?;
            debug!(%address, "HID device opened");
            Ok(Some(Box::new(HidApiDevice { device })))
        }
    }

    struct HidApiDevice {
        device: hidapi::HidDevice,
    }

    impl HidDevice for HidApiDevice {
        fn write_report(&mut self, report: &[u8]) -> Result<usize> {
            self.device
                .write(report)
                .map_err(|e| PosPrintError::TransportWrite(format!("HID write: {e}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    use crate::device::{DeviceManager, UnavailableBackend};

    const PRINTER: DeviceAddress = DeviceAddress {
        vendor_id: 0x0483,
        product_id: 0x5743,
    };

    #[derive(Clone, Default)]
    struct FakeHid {
        reports: Arc<Mutex<Vec<Vec<u8>>>>,
        sent_at: Arc<Mutex<Vec<Instant>>>,
        accept: Option<usize>,
    }

    impl HidBackend for FakeHid {
        fn open(&self, address: DeviceAddress) -> Result<Option<Box<dyn HidDevice>>> {
            if address != PRINTER {
                return Ok(None);
            }
            Ok(Some(Box::new(self.clone())))
        }
    }

    impl HidDevice for FakeHid {
        fn write_report(&mut self, report: &[u8]) -> Result<usize> {
            self.reports.lock().expect("reports lock").push(report.to_vec());
            self.sent_at.lock().expect("times lock").push(Instant::now());
            Ok(self.accept.unwrap_or(report.len()))
        }
    }

    fn manager(hid: FakeHid) -> DeviceManager {
        paced_manager(hid, 0)
    }

    fn paced_manager(hid: FakeHid, delay_ms: u64) -> DeviceManager {
        let config = DeviceConfig {
            hid_packet_delay_ms: delay_ms,
            ..DeviceConfig::default()
        };
        DeviceManager::new(Box::new(UnavailableBackend), config).with_hid(Box::new(hid))
    }

    #[test]
    fn stream_is_cut_into_padded_reports() {
        let data: Vec<u8> = (0..130u8).collect();
        let reports: Vec<_> = chunk_reports(&data, 0x00).collect();

        assert_eq!(reports.len(), 3);
        assert_eq!(reports[0][0], 0x00);
        assert_eq!(&reports[0][1..], &data[..63]);
        assert_eq!(&reports[1][1..], &data[63..126]);
        assert_eq!(&reports[2][1..5], &data[126..]);
        assert!(reports[2][5..].iter().all(|b| *b == 0));
    }

    #[test]
    fn report_id_leads_every_report() {
        let reports: Vec<_> = chunk_reports(&[0xAA; 100], 0x02).collect();
        assert!(reports.iter().all(|r| r[0] == 0x02));
        assert_eq!(chunk_reports(&[], 0x02).count(), 0);
    }

    #[test]
    fn raster_is_sent_over_hid() {
        let hid = FakeHid::default();
        let devices = manager(hid.clone());

        devices.print_raster(PRINTER, &[0x1B; 200]).expect("print");
        let reports = hid.reports.lock().expect("reports lock");
        assert_eq!(reports.len(), 4);
        assert!(reports.iter().all(|r| r.len() == REPORT_SIZE));
    }

    #[test]
    fn reports_are_paced() {
        let hid = FakeHid::default();
        let devices = paced_manager(hid.clone(), 5);
        let delay = Duration::from_millis(5);

        // 200 bytes -> 4 reports -> 3 pauses.
        let started = Instant::now();
        devices.print_raster(PRINTER, &[0x1B; 200]).expect("print");
        assert!(started.elapsed() >= delay * 3);

        let times = hid.sent_at.lock().expect("times lock");
        assert_eq!(times.len(), 4);
        for pair in times.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= delay);
        }
    }

    #[test]
    fn short_report_write_fails() {
        let hid = FakeHid {
            accept: Some(10),
            ..FakeHid::default()
        };
        let devices = manager(hid);
        let err = devices.print_raster(PRINTER, &[0x00; 10]).expect_err("short");
        assert!(matches!(err, PosPrintError::TransportWrite(_)));
    }

    #[test]
    fn missing_hid_device_is_not_found() {
        let devices = manager(FakeHid::default());
        let other = DeviceAddress::new(0x1234, 0x5678);
        assert!(matches!(
            devices.open_hid(other).err(),
            Some(PosPrintError::DeviceNotFound { .. })
        ));
    }
}

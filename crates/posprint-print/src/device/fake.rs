// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// In-memory USB backend for tests: scripted failures plus counters for every
// context and handle it hands out, so leaks show up as non-zero balances.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use posprint_core::error::{PosPrintError, Result};
use posprint_core::types::DeviceAddress;

use super::{UsbBackend, UsbContext, UsbDevice};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Configuration,
    Interface,
    Endpoint,
}

#[derive(Default)]
struct State {
    present: Mutex<HashSet<DeviceAddress>>,
    contexts_created: AtomicUsize,
    contexts_closed: AtomicUsize,
    devices_opened: AtomicUsize,
    devices_closed: AtomicUsize,
    open_attempts: AtomicUsize,
    failing_opens: AtomicUsize,
    failing_writes: AtomicUsize,
    short_writes: AtomicBool,
    fail_claim: Mutex<Option<Step>>,
    fail_release: Mutex<Option<Step>>,
    log: Mutex<Vec<String>>,
    writes: Mutex<Vec<(Instant, Vec<u8>)>>,
}

/// Cloning shares state, so a test keeps one handle and gives another to
/// the manager.
#[derive(Clone, Default)]
pub(crate) struct FakeUsb {
    state: Arc<State>,
}

impl FakeUsb {
    pub(crate) fn with_device(address: DeviceAddress) -> Self {
        let fake = Self::default();
        fake.state
            .present
            .lock()
            .expect("present lock")
            .insert(address);
        fake
    }

    pub(crate) fn fail_next_opens(&self, count: usize) {
        self.state.failing_opens.store(count, Ordering::SeqCst);
    }

    pub(crate) fn fail_next_writes(&self, count: usize) {
        self.state.failing_writes.store(count, Ordering::SeqCst);
    }

    pub(crate) fn short_writes(&self, enabled: bool) {
        self.state.short_writes.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn fail_at(&self, step: Step) {
        *self.state.fail_claim.lock().expect("claim lock") = Some(step);
    }

    pub(crate) fn fail_release(&self, step: Step) {
        *self.state.fail_release.lock().expect("release lock") = Some(step);
    }

    pub(crate) fn contexts_created(&self) -> usize {
        self.state.contexts_created.load(Ordering::SeqCst)
    }

    pub(crate) fn contexts_closed(&self) -> usize {
        self.state.contexts_closed.load(Ordering::SeqCst)
    }

    pub(crate) fn open_attempts(&self) -> usize {
        self.state.open_attempts.load(Ordering::SeqCst)
    }

    /// Device handles opened and not yet closed.
    pub(crate) fn open_handles(&self) -> usize {
        self.state.devices_opened.load(Ordering::SeqCst)
            - self.state.devices_closed.load(Ordering::SeqCst)
    }

    pub(crate) fn log(&self) -> Vec<String> {
        self.state.log.lock().expect("log lock").clone()
    }

    pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
        self.timed_writes().into_iter().map(|(_, data)| data).collect()
    }

    /// Accepted writes with the moment each one arrived.
    pub(crate) fn timed_writes(&self) -> Vec<(Instant, Vec<u8>)> {
        self.state.writes.lock().expect("writes lock").clone()
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl UsbBackend for FakeUsb {
    fn new_context(&self) -> Result<Box<dyn UsbContext>> {
        self.state.contexts_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeContext {
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeContext {
    state: Arc<State>,
}

impl UsbContext for FakeContext {
    fn open(&self, address: DeviceAddress) -> Result<Option<Box<dyn UsbDevice>>> {
        self.state.open_attempts.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.state.failing_opens) {
            return Err(PosPrintError::OpenFailed("resource busy".into()));
        }
        if !self.state.present.lock().expect("present lock").contains(&address) {
            return Ok(None);
        }
        self.state.devices_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Box::new(FakeDevice {
            state: Arc::clone(&self.state),
        })))
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.state.contexts_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeDevice {
    state: Arc<State>,
}

impl FakeDevice {
    fn record(&self, entry: String) {
        self.state.log.lock().expect("log lock").push(entry);
    }

    fn claim(&self, step: Step, entry: String) -> Result<()> {
        if *self.state.fail_claim.lock().expect("claim lock") == Some(step) {
            return Err(PosPrintError::OpenFailed(format!("{step:?} busy")));
        }
        self.record(entry);
        Ok(())
    }

    fn release(&self, step: Step, entry: String) -> Result<()> {
        self.record(entry);
        if *self.state.fail_release.lock().expect("release lock") == Some(step) {
            return Err(PosPrintError::TransportWrite(format!("{step:?} release failed")));
        }
        Ok(())
    }
}

impl UsbDevice for FakeDevice {
    fn set_configuration(&mut self, configuration: u8) -> Result<()> {
        self.claim(Step::Configuration, format!("set configuration {configuration}"))
    }

    fn release_configuration(&mut self) -> Result<()> {
        self.release(Step::Configuration, "release configuration".into())
    }

    fn claim_interface(&mut self, interface: u8, alt_setting: u8) -> Result<()> {
        self.claim(Step::Interface, format!("claim interface {interface}/{alt_setting}"))
    }

    fn release_interface(&mut self, interface: u8) -> Result<()> {
        self.release(Step::Interface, format!("release interface {interface}"))
    }

    fn open_out_endpoint(&mut self, endpoint: u8) -> Result<()> {
        self.claim(Step::Endpoint, format!("open endpoint {endpoint}"))
    }

    fn release_endpoint(&mut self, endpoint: u8) -> Result<()> {
        self.release(Step::Endpoint, format!("release endpoint {endpoint}"))
    }

    fn write(&mut self, _endpoint: u8, data: &[u8], _timeout: Duration) -> Result<usize> {
        if take_one(&self.state.failing_writes) {
            return Err(PosPrintError::TransportWrite("pipe error".into()));
        }
        if self.state.short_writes.load(Ordering::SeqCst) {
            return Ok(data.len() / 2);
        }
        self.state
            .writes
            .lock()
            .expect("writes lock")
            .push((Instant::now(), data.to_vec()));
        Ok(data.len())
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.record("close device".into());
        self.state.devices_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

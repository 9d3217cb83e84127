//! Mock register transport for testing
//!
//! Simulates a controller's register bank in memory. It provides:
//! - Plain register storage shared between clones
//! - Scripted read sequences per register (popped one value per read)
//! - Controllable failure injection for open, close and register operations
//! - Call logging for test verification
//!
//! Clones share state, so a test can keep one handle while the session owns
//! another.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{RegisterTransport, TransportError};

#[derive(Default)]
struct Bank {
    registers: HashMap<u16, u16>,
    scripted: HashMap<u16, VecDeque<u16>>,
    call_log: Vec<String>,
    latency: Duration,
}

/// In-memory register bank implementing [`RegisterTransport`].
///
/// # Example
///
/// ```
/// use gefran_pid::transport::MockTransport;
///
/// let mock = MockTransport::new().with_register(136, 1).with_register(55, 1855);
/// assert_eq!(mock.register(55), 1855);
/// ```
#[derive(Clone, Default)]
pub struct MockTransport {
    bank: Arc<Mutex<Bank>>,
    open: Arc<AtomicBool>,
    fail_open: Arc<AtomicBool>,
    fail_close: Arc<AtomicBool>,
    fail_next_op: Arc<AtomicBool>,
}

impl MockTransport {
    /// Create a closed mock with an empty register bank.
    pub fn new() -> Self {
        Self::default()
    }

    fn bank(&self) -> MutexGuard<'_, Bank> {
        self.bank.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Builder form of [`MockTransport::set_register`].
    pub fn with_register(self, address: u16, value: u16) -> Self {
        self.set_register(address, value);
        self
    }

    /// Simulated latency applied to every register operation.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.bank().latency = latency;
        self
    }

    /// Set the stored value of a register.
    pub fn set_register(&self, address: u16, value: u16) {
        self.bank().registers.insert(address, value);
    }

    /// Current stored value of a register (0 if never written).
    pub fn register(&self, address: u16) -> u16 {
        self.bank().registers.get(&address).copied().unwrap_or(0)
    }

    /// Queue values returned by successive reads of `address`.
    ///
    /// Each read pops one value and also stores it, so once the script runs
    /// out the register keeps reporting the last scripted value.
    pub fn script_register(&self, address: u16, values: impl IntoIterator<Item = u16>) {
        self.bank()
            .scripted
            .entry(address)
            .or_default()
            .extend(values);
    }

    /// Make the next `open()` fail.
    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Make every `close()` fail.
    pub fn fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Inject a failure for the next register operation.
    pub fn inject_next_failure(&self) {
        self.fail_next_op.store(true, Ordering::SeqCst);
    }

    /// Recorded calls, e.g. `"read 1 136 1"` or `"write 1 55 [1855]"`.
    pub fn call_log(&self) -> Vec<String> {
        self.bank().call_log.clone()
    }

    /// Number of reads issued against one register.
    pub fn read_count(&self, address: u16) -> usize {
        let address = address.to_string();
        self.bank()
            .call_log
            .iter()
            .filter(|call| {
                let fields: Vec<&str> = call.split_whitespace().collect();
                fields.first() == Some(&"read") && fields.get(2) == Some(&address.as_str())
            })
            .count()
    }

    fn log_call(&self, call: String) {
        self.bank().call_log.push(call);
    }

    async fn begin_op(&self) -> Result<(), TransportError> {
        let latency = self.bank().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        if self.fail_next_op.swap(false, Ordering::SeqCst) {
            return Err(TransportError::Timeout(Duration::from_millis(1500)));
        }
        Ok(())
    }
}

#[async_trait]
impl RegisterTransport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        self.log_call("open".to_string());
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(TransportError::Open("injected open failure".to_string()));
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.log_call("close".to_string());
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(TransportError::Close("injected close failure".to_string()));
        }
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn read_input_registers(
        &mut self,
        device_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        self.begin_op().await?;
        let mut bank = self.bank();
        bank.call_log
            .push(format!("read {device_id} {address} {count}"));
        let mut words = Vec::with_capacity(count as usize);
        for offset in 0..count {
            let reg = address.wrapping_add(offset);
            let next = bank.scripted.get_mut(&reg).and_then(VecDeque::pop_front);
            if let Some(value) = next {
                bank.registers.insert(reg, value);
            }
            words.push(bank.registers.get(&reg).copied().unwrap_or(0));
        }
        Ok(words)
    }

    async fn write_multiple_registers(
        &mut self,
        device_id: u8,
        address: u16,
        values: &[u16],
    ) -> Result<(), TransportError> {
        self.begin_op().await?;
        let mut bank = self.bank();
        bank.call_log
            .push(format!("write {device_id} {address} {values:?}"));
        for (offset, value) in values.iter().enumerate() {
            bank.registers
                .insert(address.wrapping_add(offset as u16), *value);
        }
        Ok(())
    }
}

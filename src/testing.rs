//! In-memory stand-ins for the host engine, used by the unit tests.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::intercept::{CallId, CallListener, Interceptor, Invocation};
use crate::site::ModuleResolver;
use crate::CopyAddress;

#[derive(Default)]
pub struct FakeModules {
    bases: HashMap<String, usize>,
    exports: HashMap<(String, String), usize>,
}

impl FakeModules {
    pub fn library(mut self, name: &str, base: usize) -> Self {
        self.bases.insert(name.to_string(), base);
        self
    }

    pub fn export(mut self, library: &str, symbol: &str, address: usize) -> Self {
        self.exports.insert((library.to_string(), symbol.to_string()), address);
        self
    }
}

impl ModuleResolver for FakeModules {
    fn base_address(&self, library: &str) -> Result<Option<usize>> {
        Ok(self.bases.get(library).copied())
    }

    fn export_address(&self, library: &str, symbol: &str) -> Result<Option<usize>> {
        if !self.bases.contains_key(library) {
            return Ok(None);
        }
        Ok(self.exports.get(&(library.to_string(), symbol.to_string())).copied())
    }
}

/// Sparse target memory made of independent regions.
#[derive(Default)]
pub struct FakeMemory {
    regions: Mutex<BTreeMap<usize, Vec<u8>>>,
}

impl FakeMemory {
    pub fn map(&self, address: usize, bytes: &[u8]) {
        self.regions.lock().unwrap().insert(address, bytes.to_vec());
    }

    pub fn unmap(&self, address: usize) {
        self.regions.lock().unwrap().remove(&address);
    }
}

impl CopyAddress for FakeMemory {
    fn copy_address(&self, addr: usize, buf: &mut [u8]) -> io::Result<()> {
        let regions = self.regions.lock().unwrap();
        let (start, bytes) = regions
            .range(..=addr)
            .next_back()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unmapped"))?;
        let offset = addr - start;
        match bytes.get(offset..offset + buf.len()) {
            Some(src) => {
                buf.copy_from_slice(src);
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::InvalidInput, "unmapped")),
        }
    }
}

pub struct FakeCall {
    pub id: CallId,
    pub args: Vec<usize>,
}

impl FakeCall {
    pub fn new(id: u64, args: &[usize]) -> FakeCall {
        FakeCall { id: CallId(id), args: args.to_vec() }
    }
}

impl Invocation for FakeCall {
    fn call_id(&self) -> CallId {
        self.id
    }

    fn argument(&self, index: usize) -> usize {
        self.args.get(index).copied().unwrap_or(0)
    }
}

/// Keeps attached listeners so a test can fire entry/exit events by hand.
#[derive(Default)]
pub struct RecordingInterceptor {
    pub refuse: bool,
    pub hooks: Vec<(usize, Arc<dyn CallListener>)>,
}

impl RecordingInterceptor {
    pub fn enter(&self, address: usize, call: &FakeCall) {
        for (_, listener) in self.hooks.iter().filter(|(a, _)| *a == address) {
            listener.on_enter(call);
        }
    }

    pub fn leave(&self, address: usize, call: &FakeCall) {
        for (_, listener) in self.hooks.iter().filter(|(a, _)| *a == address) {
            listener.on_leave(call);
        }
    }
}

impl Interceptor for RecordingInterceptor {
    fn attach(&mut self, address: usize, listener: Arc<dyn CallListener>) -> Result<()> {
        if self.refuse {
            return Err(Error::Attach(format!("address {:#x} is not executable", address)));
        }
        self.hooks.push((address, listener));
        Ok(())
    }
}

/// A cloneable `Write` sink so the test can inspect what the session printed.
#[derive(Clone, Default)]
pub struct SharedOutput(Arc<Mutex<Vec<u8>>>);

impl SharedOutput {
    pub fn lines(&self) -> Vec<String> {
        let bytes = self.0.lock().unwrap();
        String::from_utf8(bytes.clone())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

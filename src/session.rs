use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use crate::config::CaptureConfig;
use crate::error::{Error, Result};
use crate::hex;
use crate::intercept::{CallId, CallListener, Interceptor, Invocation};
use crate::site::{self, InterceptSite, ModuleResolver};
use crate::{copy_address_raw, CopyAddress};

/// What a single call had in its argument list at entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallContext {
    pub pointer: usize,
    /// Low 32 bits of the length argument, read as a signed value.
    pub length: i32,
}

/// One rendered capture, `<label>: <hex>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputLine {
    pub label: String,
    pub hex: String,
}

impl fmt::Display for OutputLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.label, self.hex)
    }
}

/// Watches one function and prints the buffer it fills on every call.
///
/// `M` reads the target's memory and `W` receives the output lines. Contexts
/// of calls that are in flight live in a map keyed by [`CallId`]: entry
/// inserts, exit removes. Nothing is shared between two calls, so overlapping
/// and re-entrant calls are safe as long as the engine hands out distinct ids.
///
/// The buffer is read when the call returns, so the callee must leave it in
/// place until then.
pub struct CaptureSession<M, W> {
    config: CaptureConfig,
    site: InterceptSite,
    memory: M,
    output: Mutex<W>,
    in_flight: DashMap<CallId, CallContext>,
}

impl<M, W> CaptureSession<M, W>
    where M: CopyAddress, W: Write
{
    pub fn new(config: CaptureConfig, site: InterceptSite, memory: M, output: W) -> CaptureSession<M, W> {
        CaptureSession {
            config,
            site,
            memory,
            output: Mutex::new(output),
            in_flight: DashMap::new(),
        }
    }

    /// Resolve the configured site and attach to it.
    ///
    /// Fails with [`Error::SiteNotFound`] if the library or export is not
    /// there; in that case nothing is attached and nothing is ever printed.
    pub fn start<R, I>(config: CaptureConfig, resolver: &R, interceptor: &mut I, memory: M, output: W)
        -> Result<Arc<CaptureSession<M, W>>>
        where R: ModuleResolver + ?Sized,
              I: Interceptor + ?Sized,
              M: Send + Sync + 'static,
              W: Send + 'static
    {
        let site = site::resolve(resolver, &config.site)?;
        let address = site.address;
        let session = Arc::new(CaptureSession::new(config, site, memory, output));
        interceptor.attach(address, session.clone())?;
        info!("capturing {} at {:#x}", session.config.site, address);
        Ok(session)
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn site(&self) -> &InterceptSite {
        &self.site
    }

    /// Number of calls that have entered but not yet returned.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Capture the pointer and length arguments of `call`.
    pub fn on_entry(&self, call: &dyn Invocation) -> CallContext {
        CallContext {
            pointer: call.argument(self.config.pointer_arg),
            length: call.argument(self.config.length_arg) as u32 as i32,
        }
    }

    /// Read the buffer described by `context` and render it.
    pub fn on_exit(&self, call: &dyn Invocation, context: CallContext) -> Result<OutputLine> {
        if context.length < 0 {
            return Err(Error::NegativeLength { length: context.length });
        }
        let length = context.length as usize;
        debug!("call {}: reading {} bytes at {:#x}", call.call_id(), length, context.pointer);

        let bytes = copy_address_raw(context.pointer, length, &self.memory)
            .map_err(|source| Error::ReadFailure { address: context.pointer, length, source })?;

        Ok(OutputLine {
            label: self.config.label.clone(),
            hex: hex::encode(&bytes),
        })
    }

    /// Entry half of the hook: remember this call's context.
    pub fn enter(&self, call: &dyn Invocation) {
        let context = self.on_entry(call);
        debug!("call {} entered: {:?}", call.call_id(), context);
        if self.in_flight.insert(call.call_id(), context).is_some() {
            warn!("call {} entered twice without returning", call.call_id());
        }
    }

    /// Exit half of the hook: render and print the buffer captured at entry.
    /// On error nothing is printed for this call.
    pub fn leave(&self, call: &dyn Invocation) -> Result<OutputLine> {
        let (_, context) = self
            .in_flight
            .remove(&call.call_id())
            .ok_or(Error::UnmatchedExit { call: call.call_id() })?;
        let line = self.on_exit(call, context)?;
        self.emit(&line)?;
        Ok(line)
    }

    fn emit(&self, line: &OutputLine) -> Result<()> {
        let mut output = self.output.lock().unwrap_or_else(|e| e.into_inner());
        writeln!(output, "{}", line)?;
        output.flush()?;
        Ok(())
    }
}

impl<M, W> CallListener for CaptureSession<M, W>
    where M: CopyAddress + Send + Sync, W: Write + Send
{
    fn on_enter(&self, call: &dyn Invocation) {
        self.enter(call);
    }

    fn on_leave(&self, call: &dyn Invocation) {
        if let Err(e) = self.leave(call) {
            warn!("call {}: no capture: {}", call.call_id(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::SiteDescriptor;
    use crate::testing::{FakeCall, FakeMemory, FakeModules, RecordingInterceptor, SharedOutput};
    use std::sync::Barrier;
    use std::thread;

    const LIB: &str = "libSmartGlassCore.so";
    const KDF: usize = 0x7104_2000;

    fn modules() -> FakeModules {
        FakeModules::default()
            .library(LIB, 0x7100_0000)
            .export(LIB, "xCryptLibKDF_Interop", KDF)
    }

    fn started(memory: Arc<FakeMemory>) -> (Arc<CaptureSession<Arc<FakeMemory>, SharedOutput>>, RecordingInterceptor, SharedOutput) {
        let _ = env_logger::builder().is_test(true).try_init();
        let output = SharedOutput::default();
        let mut interceptor = RecordingInterceptor::default();
        let session = CaptureSession::start(
            CaptureConfig::smartglass_android(),
            &modules(),
            &mut interceptor,
            memory,
            output.clone(),
        ).unwrap();
        (session, interceptor, output)
    }

    #[test]
    fn prints_buffer_filled_by_the_call() {
        let memory = Arc::new(FakeMemory::default());
        let (session, interceptor, output) = started(memory.clone());
        assert_eq!(session.site().address, KDF);

        let call = FakeCall::new(1, &[0, 0x5000, 4]);
        interceptor.enter(KDF, &call);
        // The callee fills the buffer before returning.
        memory.map(0x5000, &[0xde, 0xad, 0xbe, 0xef]);
        interceptor.leave(KDF, &call);

        assert_eq!(output.lines(), vec!["Shared Secret: deadbeef"]);
        assert_eq!(session.in_flight(), 0);
    }

    #[test]
    fn zero_length_prints_empty_payload() {
        let (_session, interceptor, output) = started(Arc::new(FakeMemory::default()));
        let call = FakeCall::new(7, &[0, 0xdead_0000, 0]);
        interceptor.enter(KDF, &call);
        interceptor.leave(KDF, &call);
        assert_eq!(output.lines(), vec!["Shared Secret: "]);
    }

    #[test]
    fn missing_export_never_starts() {
        let output = SharedOutput::default();
        let mut interceptor = RecordingInterceptor::default();
        let config = CaptureConfig::new(SiteDescriptor::export(LIB, "xCryptLibKDF_Missing"), 1, 2, "Shared Secret");
        let result = CaptureSession::start(config, &modules(), &mut interceptor, FakeMemory::default(), output.clone());
        assert!(matches!(result, Err(Error::SiteNotFound { .. })));
        assert!(interceptor.hooks.is_empty());
        assert!(output.lines().is_empty());
    }

    #[test]
    fn refused_attach_is_fatal() {
        let mut interceptor = RecordingInterceptor { refuse: true, ..Default::default() };
        let result = CaptureSession::start(
            CaptureConfig::smartglass_android(),
            &modules(),
            &mut interceptor,
            FakeMemory::default(),
            SharedOutput::default(),
        );
        assert!(matches!(result, Err(Error::Attach(_))));
    }

    #[test]
    fn unreadable_buffer_skips_only_that_call() {
        let memory = Arc::new(FakeMemory::default());
        let (session, interceptor, output) = started(memory.clone());

        let bad = FakeCall::new(1, &[0, 0x9000, 16]);
        interceptor.enter(KDF, &bad);
        interceptor.leave(KDF, &bad);

        memory.map(0x6000, &[0x01, 0x02]);
        let good = FakeCall::new(2, &[0, 0x6000, 2]);
        interceptor.enter(KDF, &good);
        interceptor.leave(KDF, &good);

        assert_eq!(output.lines(), vec!["Shared Secret: 0102"]);
        assert_eq!(session.in_flight(), 0);
    }

    #[test]
    fn read_failure_reports_address_and_length() {
        let memory = Arc::new(FakeMemory::default());
        let (session, _interceptor, _output) = started(memory.clone());
        let call = FakeCall::new(3, &[0, 0x9000, 16]);
        session.enter(&call);
        match session.leave(&call) {
            Err(Error::ReadFailure { address, length, .. }) => {
                assert_eq!(address, 0x9000);
                assert_eq!(length, 16);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn buffer_freed_before_return_is_a_read_failure() {
        let memory = Arc::new(FakeMemory::default());
        let (session, _interceptor, output) = started(memory.clone());
        memory.map(0x7000, &[0xaa; 8]);
        let call = FakeCall::new(4, &[0, 0x7000, 8]);
        session.enter(&call);
        memory.unmap(0x7000);
        assert!(matches!(session.leave(&call), Err(Error::ReadFailure { .. })));
        assert!(output.lines().is_empty());
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn length_uses_low_32_bits() {
        let memory = Arc::new(FakeMemory::default());
        let (session, _interceptor, _output) = started(memory);
        let call = FakeCall::new(5, &[0, 0x1000, 0xffff_ffff_0000_0003]);
        assert_eq!(session.on_entry(&call), CallContext { pointer: 0x1000, length: 3 });
    }

    #[test]
    fn negative_length_is_rejected() {
        let memory = Arc::new(FakeMemory::default());
        let (session, _interceptor, output) = started(memory);
        let call = FakeCall::new(6, &[0, 0x1000, 0x8000_0000]);
        session.enter(&call);
        assert!(matches!(session.leave(&call), Err(Error::NegativeLength { length: i32::MIN })));
        assert!(output.lines().is_empty());
    }

    #[test]
    fn exit_without_entry_is_unmatched() {
        let (session, _interceptor, output) = started(Arc::new(FakeMemory::default()));
        let call = FakeCall::new(9, &[0, 0x1000, 1]);
        assert!(matches!(session.leave(&call), Err(Error::UnmatchedExit { call: CallId(9) })));
        assert!(output.lines().is_empty());
    }

    #[test]
    fn abandoned_call_stays_in_flight() {
        let memory = Arc::new(FakeMemory::default());
        let (session, interceptor, output) = started(memory.clone());

        // Unwound past the hook: the exit never comes.
        interceptor.enter(KDF, &FakeCall::new(1, &[0, 0x1000, 4]));

        memory.map(0x2000, &[0x42]);
        let call = FakeCall::new(2, &[0, 0x2000, 1]);
        interceptor.enter(KDF, &call);
        interceptor.leave(KDF, &call);

        assert_eq!(output.lines(), vec!["Shared Secret: 42"]);
        assert_eq!(session.in_flight(), 1);
    }

    #[test]
    fn interleaved_calls_keep_their_own_buffers() {
        let memory = Arc::new(FakeMemory::default());
        let (_session, interceptor, output) = started(memory.clone());

        let a = FakeCall::new(0xa, &[0, 0x1000, 2]);
        let b = FakeCall::new(0xb, &[0, 0x2000, 3]);
        interceptor.enter(KDF, &a);
        interceptor.enter(KDF, &b);
        memory.map(0x1000, &[0xaa, 0xaa]);
        memory.map(0x2000, &[0xbb, 0xbb, 0xbb]);
        interceptor.leave(KDF, &b);
        interceptor.leave(KDF, &a);

        assert_eq!(output.lines(), vec!["Shared Secret: bbbbbb", "Shared Secret: aaaa"]);
    }

    #[test]
    fn concurrent_calls_do_not_cross_contaminate() {
        const THREADS: usize = 8;
        let memory = Arc::new(FakeMemory::default());
        let (session, _interceptor, output) = started(memory.clone());
        for i in 0..THREADS {
            memory.map(0x10_0000 * (i + 1), &vec![i as u8; i + 1]);
        }

        let barrier = Arc::new(Barrier::new(THREADS));
        let workers = (0..THREADS)
            .map(|i| {
                let session = session.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let call = FakeCall::new(i as u64, &[0, 0x10_0000 * (i + 1), i + 1]);
                    session.enter(&call);
                    // Every call is in flight before any of them returns.
                    barrier.wait();
                    session.leave(&call).unwrap()
                })
            })
            .collect::<Vec<_>>();

        for (i, worker) in workers.into_iter().enumerate() {
            let line = worker.join().unwrap();
            assert_eq!(line.hex, hex::encode(&vec![i as u8; i + 1]));
        }
        assert_eq!(output.lines().len(), THREADS);
        assert_eq!(session.in_flight(), 0);
    }
}

use std::sync::Arc;

use log::{debug, info};

use crate::cancel::CancellationBroker;
use crate::config::CaptureOptions;
use crate::decoder::EventDecoder;
use crate::enablement::ProviderEnablement;
use crate::error::{CaptureError, Result};
use crate::interfaces::InterfaceResolver;
use crate::pcapng::PcapNgWriter;
use crate::service::{ServiceManager, ensure_running};
use crate::session::{CaptureSession, SessionState, TraceBackend};

/// 一次捕获用到的系统服务
pub struct Platform {
    pub interfaces: Box<dyn InterfaceResolver>,
    pub services: Box<dyn ServiceManager>,
    pub enablement: ProviderEnablement,
    pub tracing: Arc<dyn TraceBackend>,
    pub interrupts: Arc<CancellationBroker>,
}

impl Platform {
    #[cfg(windows)]
    pub fn native() -> Result<Self> {
        use crate::sys::windows as sys;

        Ok(Self {
            interfaces: Box::new(sys::IfTable),
            services: Box::new(sys::ServiceControl),
            enablement: ProviderEnablement::new(
                Box::new(sys::RegistryCounter::ndiscap()),
                Box::new(sys::NetCfgStore::new()?),
            ),
            tracing: Arc::new(sys::EtwBackend::new()),
            interrupts: CancellationBroker::new(Box::new(sys::ConsoleInterrupt)),
        })
    }

    #[cfg(not(windows))]
    pub fn native() -> Result<Self> {
        Err(crate::error::CaptureError::Unsupported(
            "the NDIS packet capture provider is only available on Windows",
        ))
    }
}

/// 本机网卡表
pub fn native_interfaces() -> Result<Box<dyn InterfaceResolver>> {
    #[cfg(windows)]
    {
        Ok(Box::new(crate::sys::windows::IfTable))
    }
    #[cfg(not(windows))]
    {
        Err(crate::error::CaptureError::Unsupported(
            "interface listing uses the Windows IP Helper API",
        ))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSummary {
    pub packets: u64,
    pub dropped: u64,
    pub ignored: u64,
    pub interfaces: usize,
}

pub struct Capturer {
    options: CaptureOptions,
}

impl Capturer {
    pub fn new(options: CaptureOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &CaptureOptions {
        &self.options
    }

    /// 执行一次捕获，直到被中断或出现致命错误。
    ///
    /// 这里获取的绑定引用在任何退出路径上都会归还。从获取引用之前到归还之后，
    /// Ctrl-C 都由本次捕获处理。
    pub fn capture(&self, platform: &Platform) -> Result<CaptureSummary> {
        if !self.options.filter.is_empty() {
            debug!(
                "Filter expression \"{}\" is accepted but not applied",
                self.options.filter
            );
        }

        ensure_running(platform.services.as_ref(), &self.options.service_name)?;

        let session = CaptureSession::new(
            Arc::clone(&platform.tracing),
            self.options.session_name.as_str(),
        );
        let stop = session.stop_handle();
        let interrupt = platform.interrupts.register(move || stop.stop())?;

        let binding = platform.enablement.acquire()?;
        let outcome = self.run_session(platform, &session);
        drop(session);
        let released = binding.release();
        drop(interrupt);

        let summary = outcome?;
        released?;

        info!(
            "Capture completed: {} packets on {} interfaces saved to {} ({} dropped)",
            summary.packets,
            summary.interfaces,
            self.options.output.display(),
            summary.dropped
        );
        Ok(summary)
    }

    fn run_session(&self, platform: &Platform, session: &CaptureSession) -> Result<CaptureSummary> {
        match session.start(&self.options.buffers) {
            Ok(()) => {}
            Err(CaptureError::SessionState(SessionState::Closed)) => {
                info!("Capture interrupted before the trace session started");
                return Ok(CaptureSummary::default());
            }
            Err(e) => return Err(e),
        }

        let writer = PcapNgWriter::create(&self.options.output)?;
        info!("Saving to file: {}", self.options.output.display());

        let mut decoder = EventDecoder::new(
            writer,
            platform.interfaces.as_ref(),
            self.options.snaplen,
        );

        let processed = session.process(&mut decoder);
        session.stop();

        let interfaces = decoder.interface_count();
        // 出错前已写入的数据包保留在文件中
        let finished = decoder.finish();
        processed?;
        let (_, stats) = finished?;

        Ok(CaptureSummary {
            packets: stats.packets,
            dropped: stats.dropped,
            ignored: stats.ignored,
            interfaces,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::tests::FakeInterrupts;
    use crate::decoder::tests::{TICKS_2023, fragment_payload};
    use crate::enablement::tests::{FakeNetCfg, MemoryCounter};
    use crate::error::CaptureError;
    use crate::interfaces::tests::{FakeInterfaces, row};
    use crate::pcapng::tests::{blocks, packet_fields};
    use crate::service::ServiceState;
    use crate::service::tests::FakeServices;
    use crate::session::SessionStartError;
    use crate::session::tests::{FakeBackend, OwnedEvent};
    use std::thread;
    use std::time::Duration;

    struct Harness {
        platform: Platform,
        counter: MemoryCounter,
        netcfg: FakeNetCfg,
        backend: Arc<FakeBackend>,
        interrupts: FakeInterrupts,
    }

    fn harness(backend: FakeBackend) -> Harness {
        let counter = MemoryCounter::default();
        let netcfg = FakeNetCfg::new();
        let backend = Arc::new(backend);
        let interrupts = FakeInterrupts::default();
        let platform = Platform {
            interfaces: Box::new(FakeInterfaces::new(vec![
                row(7, 6, "ethernet_32769", "Intel(R) Ethernet Connection"),
                row(12, 71, "wireless_32768", "Intel(R) Wi-Fi 6"),
            ])),
            services: Box::new(FakeServices::new(&[
                ServiceState::Stopped,
                ServiceState::Running,
            ])),
            enablement: ProviderEnablement::new(
                Box::new(counter.clone()),
                Box::new(netcfg.clone()),
            ),
            tracing: backend.clone(),
            interrupts: CancellationBroker::new(Box::new(interrupts.clone())),
        };
        Harness {
            platform,
            counter,
            netcfg,
            backend,
            interrupts,
        }
    }

    fn options(dir: &tempfile::TempDir, snaplen: u32) -> CaptureOptions {
        CaptureOptions {
            output: dir.path().join("capture.pcapng"),
            snaplen,
            filter: "tcp port 443".to_string(),
            ..CaptureOptions::default()
        }
    }

    /// 捕获开始消费事件后按下 Ctrl-C
    fn interrupt_when_consuming(
        backend: Arc<FakeBackend>,
        interrupts: FakeInterrupts,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            while !backend.calls().iter().any(|c| c.starts_with("consume")) {
                thread::sleep(Duration::from_millis(5));
            }
            assert_eq!(interrupts.fire(), Some(true));
        })
    }

    #[test]
    fn test_capture_until_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(FakeBackend::new());

        let frame: Vec<u8> = (0..200u8).collect();
        h.backend
            .deliver(OwnedEvent::packet(fragment_payload(7, 200, &frame), TICKS_2023));
        h.backend
            .deliver(OwnedEvent::packet(fragment_payload(12, 3, &[1, 2, 3]), TICKS_2023 + 10));
        h.backend
            .deliver(OwnedEvent::packet(fragment_payload(99, 1, &[1]), TICKS_2023 + 20));

        let pressed = interrupt_when_consuming(h.backend.clone(), h.interrupts.clone());
        let capturer = Capturer::new(options(&dir, 128));
        let summary = capturer.capture(&h.platform).unwrap();
        pressed.join().unwrap();

        assert_eq!(
            summary,
            CaptureSummary {
                packets: 2,
                dropped: 1,
                ignored: 0,
                interfaces: 2,
            }
        );

        let bytes = std::fs::read(&capturer.options().output).unwrap();
        let all = blocks(&bytes);
        let types: Vec<u32> = all.iter().map(|(t, _)| *t).collect();
        assert_eq!(types, vec![0x0A0D_0D0A, 1, 6, 1, 6]);

        let (id, ts, captured, original, data) = packet_fields(all[2].1);
        assert_eq!((id, captured, original), (0, 128, 200));
        assert_eq!(ts, 1_700_000_000_000_000);
        assert_eq!(data, &frame[..128]);
        let (id, ts, captured, original, _) = packet_fields(all[4].1);
        assert_eq!((id, captured, original), (1, 3, 3));
        assert_eq!(ts, 1_700_000_000_000_001);

        assert_eq!(h.counter.0.get(), 0);
        assert_eq!(h.netcfg.bindings_enabled(), vec![false, false]);
        assert!(!h.interrupts.subscribed());
        assert_eq!(h.backend.calls().last().unwrap(), "stop wncap");
    }

    #[test]
    fn test_interrupt_during_session_start_releases_binding() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new();
        let interrupts = FakeInterrupts::default();
        let pressed = interrupts.clone();
        *backend.on_start.lock().unwrap() = Some(Box::new(move || {
            assert_eq!(pressed.fire(), Some(true));
        }));
        let mut h = harness(backend);
        h.platform.interrupts = CancellationBroker::new(Box::new(interrupts.clone()));

        let summary = Capturer::new(options(&dir, 262144))
            .capture(&h.platform)
            .unwrap();

        assert_eq!(summary.packets, 0);
        assert_eq!(h.counter.0.get(), 0);
        assert_eq!(h.netcfg.bindings_enabled(), vec![false, false]);
        assert!(!interrupts.subscribed());
        let calls = h.backend.calls();
        assert_eq!(calls.iter().filter(|c| *c == "stop wncap").count(), 1);
        assert!(!calls.iter().any(|c| c.starts_with("consume")));
    }

    #[test]
    fn test_interrupt_before_session_start_skips_capture() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(FakeBackend::new());
        h.netcfg.0.borrow_mut().on_apply = Some(Box::new({
            let interrupts = h.interrupts.clone();
            move || {
                interrupts.fire();
            }
        }));

        let capturer = Capturer::new(options(&dir, 262144));
        let summary = capturer.capture(&h.platform).unwrap();

        assert_eq!(summary, CaptureSummary::default());
        assert!(!capturer.options().output.exists());
        assert!(h.backend.calls().is_empty());
        assert_eq!(h.counter.0.get(), 0);
        assert_eq!(h.netcfg.bindings_enabled(), vec![false, false]);
    }

    #[test]
    fn test_malformed_event_ends_run_and_keeps_earlier_packets() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(FakeBackend::new());

        h.backend
            .deliver(OwnedEvent::packet(fragment_payload(7, 4, &[1, 2, 3, 4]), TICKS_2023));
        h.backend
            .deliver(OwnedEvent::packet(fragment_payload(7, 4096, &[0; 8]), TICKS_2023));
        h.backend
            .deliver(OwnedEvent::packet(fragment_payload(7, 4, &[5, 6, 7, 8]), TICKS_2023));

        let capturer = Capturer::new(options(&dir, 262144));
        let err = capturer.capture(&h.platform).unwrap_err();
        assert!(matches!(err, CaptureError::ProtocolError(_)));
        assert_eq!(err.exit_code(), 1);

        let bytes = std::fs::read(&capturer.options().output).unwrap();
        let types: Vec<u32> = blocks(&bytes).iter().map(|(t, _)| *t).collect();
        assert_eq!(types, vec![0x0A0D_0D0A, 1, 6]);

        assert_eq!(h.counter.0.get(), 0);
        assert_eq!(h.netcfg.bindings_enabled(), vec![false, false]);
        assert!(!h.interrupts.subscribed());
    }

    #[test]
    fn test_trace_start_failure_releases_binding() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new();
        backend
            .start_results
            .lock()
            .unwrap()
            .push_back(Err(SessionStartError::Failed(1450)));
        let h = harness(backend);

        let capturer = Capturer::new(options(&dir, 262144));
        let err = capturer.capture(&h.platform).unwrap_err();
        assert_eq!(err.exit_code(), 1450);

        assert!(!capturer.options().output.exists(), "no file without a session");
        assert_eq!(h.counter.0.get(), 0);
        assert_eq!(
            h.netcfg.log(),
            vec![
                "lock ndisdump",
                "apply [true, true]",
                "unlock",
                "lock ndisdump",
                "apply [false, false]",
                "unlock",
            ]
        );
    }

    #[test]
    fn test_unwritable_output_stops_session() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(FakeBackend::new());

        let mut opts = options(&dir, 262144);
        opts.output = dir.path().join("missing").join("capture.pcapng");
        let err = Capturer::new(opts).capture(&h.platform).unwrap_err();

        assert!(matches!(err, CaptureError::IoError(_)));
        assert_eq!(h.backend.calls().last().unwrap(), "stop wncap");
        assert_eq!(h.counter.0.get(), 0);
    }
}

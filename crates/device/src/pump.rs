use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use app_core::ids::DeviceId;
use settings::BridgeSettings;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use transport_usb::{EndpointInfo, TransportError, UsbConnection};

use crate::events::{EventSink, HidEvent};

const STOP_CHECK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct PumpConfig {
    pub poll_timeout: Duration,
    pub retry_delay: Duration,
    pub max_consecutive_errors: u32,
    pub heartbeat_interval: Duration,
}

impl From<&BridgeSettings> for PumpConfig {
    fn from(s: &BridgeSettings) -> Self {
        Self {
            poll_timeout: s.poll_timeout(),
            retry_delay: s.retry_delay(),
            max_consecutive_errors: s.max_consecutive_errors.max(1),
            heartbeat_interval: s.heartbeat_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// The run flag was cleared.
    Stopped,
    /// The transport reported the device gone.
    Disconnected,
    Failed { consecutive_errors: u32 },
}

/// Background reader for one session's interrupt IN endpoint.
pub(crate) struct InputReportPump {
    running: Arc<AtomicBool>,
    exited: oneshot::Receiver<PumpExit>,
}

impl InputReportPump {
    pub(crate) fn start(
        device: DeviceId,
        connection: Arc<dyn UsbConnection>,
        endpoint: &EndpointInfo,
        running: Arc<AtomicBool>,
        events: EventSink,
        config: PumpConfig,
    ) -> std::io::Result<Self> {
        let (exit_tx, exit_rx) = oneshot::channel();
        let address = endpoint.address;
        let buf_len = usize::from(endpoint.max_packet_size).max(1);
        let flag = running.clone();

        thread::Builder::new()
            .name("hid-input-pump".into())
            .spawn(move || {
                let exit = run_pump(
                    &device,
                    connection.as_ref(),
                    address,
                    buf_len,
                    &flag,
                    &events,
                    &config,
                );
                let _ = exit_tx.send(exit);
            })?;

        Ok(Self {
            running,
            exited: exit_rx,
        })
    }

    /// Clear the run flag and wait up to `grace` for the thread to finish.
    ///
    /// `None` means the pump did not report back in time.
    pub(crate) async fn stop(&mut self, grace: Duration) -> Option<PumpExit> {
        self.running.store(false, Ordering::SeqCst);
        match tokio::time::timeout(grace, &mut self.exited).await {
            Ok(Ok(exit)) => Some(exit),
            Ok(Err(_)) => {
                warn!("input pump ended without reporting (panicked?)");
                None
            }
            Err(_) => {
                warn!(?grace, "input pump still running after grace period");
                None
            }
        }
    }
}

impl Drop for InputReportPump {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

pub(crate) fn run_pump(
    device: &DeviceId,
    connection: &dyn UsbConnection,
    endpoint: u8,
    buf_len: usize,
    running: &AtomicBool,
    events: &EventSink,
    config: &PumpConfig,
) -> PumpExit {
    let mut buf = vec![0u8; buf_len.max(1)];
    let mut consecutive_errors = 0u32;
    let mut reads = 0u64;
    let mut last_heartbeat = Instant::now();

    info!(%device, endpoint, buffer = buf.len(), "input pump running");

    let exit = loop {
        if !running.load(Ordering::SeqCst) {
            break PumpExit::Stopped;
        }

        match connection.read_interrupt(endpoint, &mut buf, config.poll_timeout) {
            Ok(n) if n > 0 => {
                reads += 1;
                consecutive_errors = 0;
                debug!(%device, len = n, "input report");
                events.emit(HidEvent::InputReport {
                    device: device.clone(),
                    data: buf[..n].to_vec(),
                });
            }
            Ok(_) | Err(TransportError::Timeout) => {
                reads += 1;
                consecutive_errors = 0;
            }
            Err(TransportError::Disconnected) => {
                if running.load(Ordering::SeqCst) {
                    info!(%device, "device went away, input pump exiting");
                    events.emit(HidEvent::PumpDisconnected {
                        device: device.clone(),
                    });
                }
                break PumpExit::Disconnected;
            }
            Err(err) => {
                consecutive_errors += 1;
                if running.load(Ordering::SeqCst) {
                    warn!(%device, ?err, attempt = consecutive_errors, "input read failed");
                }
                if consecutive_errors >= config.max_consecutive_errors {
                    error!(%device, consecutive_errors, "too many consecutive read errors, stopping input pump");
                    events.emit(HidEvent::PumpFailed {
                        device: device.clone(),
                        consecutive_errors,
                    });
                    break PumpExit::Failed { consecutive_errors };
                }
                pause(running, config.retry_delay);
            }
        }

        if last_heartbeat.elapsed() >= config.heartbeat_interval {
            debug!(%device, reads, "input pump heartbeat");
            last_heartbeat = Instant::now();
        }
    };

    info!(%device, ?exit, reads, "input pump stopped");
    exit
}

/// Sleep for `total`, waking early once `running` is cleared.
fn pause(running: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(STOP_CHECK));
    }
}

#[cfg(test)]
mod tests {
    use transport_usb::fake::{FakeConnection, ReadStep};

    use super::*;
    use crate::events::EventStream;

    fn config() -> PumpConfig {
        PumpConfig {
            poll_timeout: Duration::from_millis(5),
            retry_delay: Duration::from_millis(1),
            max_consecutive_errors: 10,
            heartbeat_interval: Duration::from_secs(30),
        }
    }

    fn drain(rx: &mut EventStream) -> Vec<HidEvent> {
        let mut out = vec![];
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn reports(events: &[HidEvent]) -> Vec<Vec<u8>> {
        events
            .iter()
            .filter_map(|e| match e {
                HidEvent::InputReport { data, .. } => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn ten_consecutive_errors_terminate_the_pump() {
        let mut steps = vec![ReadStep::Error; 10];
        steps.push(ReadStep::Data(vec![0xaa]));
        let conn = FakeConnection::scripted(steps);
        let (sink, mut rx) = EventSink::channel();
        let running = AtomicBool::new(true);

        let exit = run_pump(&DeviceId::from("dev"), &conn, 0x81, 64, &running, &sink, &config());

        assert_eq!(exit, PumpExit::Failed { consecutive_errors: 10 });
        assert_eq!(conn.read_attempts(), 10);
        let events = drain(&mut rx);
        assert!(reports(&events).is_empty());
        assert!(matches!(
            events.last(),
            Some(HidEvent::PumpFailed { consecutive_errors: 10, .. })
        ));
    }

    #[test]
    fn successful_read_resets_error_counter() {
        let mut steps = vec![ReadStep::Error; 9];
        steps.push(ReadStep::Data(vec![0x01]));
        steps.extend(vec![ReadStep::Error; 9]);
        steps.push(ReadStep::Data(vec![0x02]));
        let conn = Arc::new(FakeConnection::scripted(steps));
        let (sink, mut rx) = EventSink::channel();
        let running = Arc::new(AtomicBool::new(true));

        let pump = {
            let conn = conn.clone();
            let running = running.clone();
            thread::spawn(move || {
                run_pump(&DeviceId::from("dev"), conn.as_ref(), 0x81, 64, &running, &sink, &config())
            })
        };

        // All 20 scripted steps consumed, then the pump idles on empty reads.
        while conn.read_attempts() < 22 {
            thread::sleep(Duration::from_millis(1));
        }
        running.store(false, Ordering::SeqCst);
        let exit = pump.join().unwrap();

        assert_eq!(exit, PumpExit::Stopped);
        let events = drain(&mut rx);
        assert_eq!(reports(&events), vec![vec![0x01], vec![0x02]]);
        assert!(!events.iter().any(|e| matches!(e, HidEvent::PumpFailed { .. })));
    }

    #[test]
    fn idle_polls_break_an_error_run() {
        let mut steps = vec![];
        for _ in 0..10 {
            steps.push(ReadStep::Error);
            steps.push(ReadStep::Empty);
        }
        steps.push(ReadStep::Data(vec![0x7f]));
        steps.push(ReadStep::Disconnect);
        let conn = FakeConnection::scripted(steps);
        let (sink, mut rx) = EventSink::channel();
        let running = AtomicBool::new(true);

        let exit = run_pump(&DeviceId::from("dev"), &conn, 0x81, 64, &running, &sink, &config());

        assert_eq!(exit, PumpExit::Disconnected);
        let events = drain(&mut rx);
        assert_eq!(reports(&events), vec![vec![0x7f]]);
        assert!(!events.iter().any(|e| matches!(e, HidEvent::PumpFailed { .. })));
    }

    #[test]
    fn lost_device_is_announced() {
        let conn = FakeConnection::scripted(vec![ReadStep::Empty, ReadStep::Disconnect]);
        let (sink, mut rx) = EventSink::channel();
        let running = AtomicBool::new(true);

        let exit = run_pump(&DeviceId::from("dev"), &conn, 0x81, 64, &running, &sink, &config());

        assert_eq!(exit, PumpExit::Disconnected);
        assert_eq!(
            drain(&mut rx),
            vec![HidEvent::PumpDisconnected {
                device: DeviceId::from("dev")
            }]
        );
    }

    #[test]
    fn report_is_truncated_to_bytes_read() {
        let conn = FakeConnection::scripted(vec![
            ReadStep::Empty,
            ReadStep::Data(vec![0x01, 0x02, 0x03]),
            ReadStep::Disconnect,
        ]);
        let (sink, mut rx) = EventSink::channel();
        let running = AtomicBool::new(true);

        let exit = run_pump(&DeviceId::from("dev"), &conn, 0x81, 64, &running, &sink, &config());

        assert_eq!(exit, PumpExit::Disconnected);
        assert_eq!(reports(&drain(&mut rx)), vec![vec![0x01, 0x02, 0x03]]);
    }

    #[test]
    fn cleared_flag_stops_before_reading() {
        let conn = FakeConnection::scripted(vec![ReadStep::Data(vec![1])]);
        let (sink, mut rx) = EventSink::channel();
        let running = AtomicBool::new(false);

        let exit = run_pump(&DeviceId::from("dev"), &conn, 0x81, 64, &running, &sink, &config());

        assert_eq!(exit, PumpExit::Stopped);
        assert_eq!(conn.read_attempts(), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn stop_waits_for_thread_exit() {
        let conn: Arc<dyn UsbConnection> = Arc::new(FakeConnection::scripted(vec![]));
        let (sink, _rx) = EventSink::channel();
        let endpoint = EndpointInfo {
            address: 0x81,
            direction: transport_usb::Direction::In,
            transfer_type: transport_usb::TransferType::Interrupt,
            max_packet_size: 8,
        };
        let running = Arc::new(AtomicBool::new(true));
        let mut pump = InputReportPump::start(
            DeviceId::from("dev"),
            conn,
            &endpoint,
            running.clone(),
            sink,
            config(),
        )
        .unwrap();

        let exit = pump.stop(Duration::from_secs(1)).await;
        assert_eq!(exit, Some(PumpExit::Stopped));
        assert!(!running.load(Ordering::SeqCst));
    }
}

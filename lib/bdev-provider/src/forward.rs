// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Forwarding of privileged requests to a helper binary.
//!
//! An unprivileged provider cannot bind drivers or touch devices, so it
//! serializes each request and hands it to the helper, which executes it
//! against its own backend. The helper is invoked with the method name as
//! its sole argument, reads the request as JSON on stdin and writes a
//! [HelperReply] as JSON on stdout.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};

use bdev_types::{Fault, FaultCode};
use serde::de::DeserializeOwned;
use serde_derive::{Deserialize, Serialize};
use slog::{debug, Logger};

use crate::backend::*;
use crate::Error;

/// Method names understood by the helper.
pub mod method {
    pub const BDEV_SCAN: &str = "BdevScan";
    pub const BDEV_PREPARE: &str = "BdevPrepare";
    pub const BDEV_FORMAT: &str = "BdevFormat";
    pub const BDEV_WRITE_CONFIG: &str = "BdevWriteConfig";
    pub const BDEV_READ_CONFIG: &str = "BdevReadConfig";
    pub const NVME_FIRMWARE_QUERY: &str = "NvmeFirmwareQuery";
    pub const NVME_FIRMWARE_UPDATE: &str = "NvmeFirmwareUpdate";
}

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("request has already been forwarded")]
    AlreadyForwarded,

    #[error("privileged helper {} is not installed", .0.display())]
    HelperUnavailable(PathBuf),

    #[error("{method}: encoding request: {err}")]
    Encode { method: String, err: serde_json::Error },

    #[error("{method}: decoding helper reply: {err}")]
    Decode { method: String, err: serde_json::Error },

    #[error("{method}: helper transport: {reason}")]
    Transport { method: String, reason: String },

    #[error("{method} failed in privileged helper: {fault}")]
    Remote { method: String, fault: Fault },

    #[error("unknown method {0:?}")]
    UnknownMethod(String),
}

impl ForwardError {
    pub fn to_fault(&self) -> Fault {
        match self {
            ForwardError::AlreadyForwarded => Fault::new(
                FaultCode::AlreadyForwarded,
                self.to_string(),
                "the helper must execute forwarded requests itself",
            ),
            ForwardError::HelperUnavailable(_) => Fault::new(
                FaultCode::PrivilegedHelperUnavailable,
                self.to_string(),
                "install the privileged helper or run the server as root",
            ),
            ForwardError::Remote { fault, .. } => fault.clone(),
            _ => Fault::new(
                FaultCode::ForwardFailure,
                self.to_string(),
                "check the privileged helper's installation and logs",
            ),
        }
    }
}

/// What the helper writes back for every request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HelperReply {
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub fault: Option<Fault>,
}

/// One request/reply exchange with the helper.
pub trait HelperChannel: Send {
    fn exchange(
        &mut self,
        method: &str,
        request: &[u8],
    ) -> Result<Vec<u8>, ForwardError>;
}

/// Runs the helper binary once per request.
pub struct ProcessChannel {
    helper: PathBuf,
}

impl ProcessChannel {
    pub fn new(helper: impl Into<PathBuf>) -> Self {
        Self { helper: helper.into() }
    }
}

impl HelperChannel for ProcessChannel {
    fn exchange(
        &mut self,
        method: &str,
        request: &[u8],
    ) -> Result<Vec<u8>, ForwardError> {
        let transport = |reason: String| ForwardError::Transport {
            method: method.to_string(),
            reason,
        };

        let mut child = Command::new(&self.helper)
            .arg(method)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                transport(format!("spawning {}: {e}", self.helper.display()))
            })?;
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(request) {
                // Reap the helper rather than leave it behind.
                let _ = child.kill();
                let _ = child.wait();
                return Err(transport(format!("writing request: {e}")));
            }
        }
        let out = child
            .wait_with_output()
            .map_err(|e| transport(format!("waiting for helper: {e}")))?;
        if !out.status.success() {
            return Err(transport(format!(
                "helper exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(out.stdout)
    }
}

pub struct Forwarder {
    log: Logger,
    helper_path: PathBuf,
    channel: Mutex<Box<dyn HelperChannel>>,
}

impl Forwarder {
    pub fn new(helper_path: impl Into<PathBuf>, log: Logger) -> Self {
        let helper_path = helper_path.into();
        let channel = Box::new(ProcessChannel::new(&helper_path));
        Self::with_channel(helper_path, channel, log)
    }

    pub fn with_channel(
        helper_path: impl Into<PathBuf>,
        channel: Box<dyn HelperChannel>,
        log: Logger,
    ) -> Self {
        Self {
            log,
            helper_path: helper_path.into(),
            channel: Mutex::new(channel),
        }
    }

    pub fn helper_path(&self) -> &Path {
        &self.helper_path
    }

    /// Whether the helper is installed. Optional capabilities must check
    /// this before forwarding.
    pub fn can_forward(&self) -> bool {
        self.helper_path.is_file()
    }

    /// Sends `req` to the helper and decodes its reply.
    pub fn forward<Req, Resp>(
        &self,
        method: &str,
        mut req: Req,
    ) -> Result<Resp, ForwardError>
    where
        Req: Forwardable + serde::Serialize,
        Resp: DeserializeOwned,
    {
        if req.forwarded() {
            return Err(ForwardError::AlreadyForwarded);
        }
        req.set_forwarded();

        let body = serde_json::to_vec(&req).map_err(|err| {
            ForwardError::Encode { method: method.to_string(), err }
        })?;
        debug!(self.log, "forwarding request";
            "method" => method, "helper" => %self.helper_path.display());

        let raw = self
            .channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .exchange(method, &body)?;

        let decode =
            |err| ForwardError::Decode { method: method.to_string(), err };
        let reply: HelperReply = serde_json::from_slice(&raw).map_err(decode)?;
        if let Some(fault) = reply.fault {
            return Err(ForwardError::Remote {
                method: method.to_string(),
                fault,
            });
        }
        serde_json::from_value(reply.payload.unwrap_or_default())
            .map_err(decode)
    }
}

/// Backend that executes every operation in the privileged helper.
pub struct ForwardingBackend {
    forwarder: Arc<Forwarder>,
}

impl ForwardingBackend {
    pub fn new(forwarder: Arc<Forwarder>) -> Self {
        Self { forwarder }
    }

    fn require_helper(&self) -> Result<(), Error> {
        if self.forwarder.can_forward() {
            Ok(())
        } else {
            Err(ForwardError::HelperUnavailable(
                self.forwarder.helper_path().to_path_buf(),
            )
            .into())
        }
    }

    pub fn query_firmware(
        &self,
        req: FirmwareQueryRequest,
    ) -> Result<FirmwareQueryResponse, Error> {
        self.require_helper()?;
        Ok(self.forwarder.forward(method::NVME_FIRMWARE_QUERY, req)?)
    }
}

impl Backend for ForwardingBackend {
    fn scan(&self, req: ScanRequest) -> Result<ScanResponse, Error> {
        Ok(self.forwarder.forward(method::BDEV_SCAN, req)?)
    }

    fn format(&self, req: FormatRequest) -> Result<FormatResponse, Error> {
        Ok(self.forwarder.forward(method::BDEV_FORMAT, req)?)
    }

    fn prepare(&self, req: PrepareRequest) -> Result<PrepareResponse, Error> {
        Ok(self.forwarder.forward(method::BDEV_PREPARE, req)?)
    }

    fn reset(&self, req: PrepareRequest) -> Result<(), Error> {
        let req = PrepareRequest { reset: true, ..req };
        self.forwarder
            .forward::<_, PrepareResponse>(method::BDEV_PREPARE, req)?;
        Ok(())
    }

    fn write_config(
        &self,
        req: WriteConfigRequest,
    ) -> Result<WriteConfigResponse, Error> {
        Ok(self.forwarder.forward(method::BDEV_WRITE_CONFIG, req)?)
    }

    fn read_config(
        &self,
        req: ReadConfigRequest,
    ) -> Result<ReadConfigResponse, Error> {
        Ok(self.forwarder.forward(method::BDEV_READ_CONFIG, req)?)
    }

    fn update_firmware(&self, req: FirmwareUpdateRequest) -> Result<(), Error> {
        self.require_helper()?;
        Ok(self.forwarder.forward(method::NVME_FIRMWARE_UPDATE, req)?)
    }
}

fn decode<T: DeserializeOwned>(method: &str, body: &[u8]) -> Result<T, Error> {
    serde_json::from_slice(body).map_err(|err| {
        ForwardError::Decode { method: method.to_string(), err }.into()
    })
}

fn encode<T: serde::Serialize>(
    method: &str,
    resp: T,
) -> Result<serde_json::Value, Error> {
    serde_json::to_value(resp).map_err(|err| {
        ForwardError::Encode { method: method.to_string(), err }.into()
    })
}

fn dispatch(
    backend: &dyn Backend,
    name: &str,
    body: &[u8],
) -> Result<serde_json::Value, Error> {
    match name {
        method::BDEV_SCAN => encode(name, backend.scan(decode(name, body)?)?),
        method::BDEV_PREPARE => {
            let req: PrepareRequest = decode(name, body)?;
            if req.reset {
                backend.reset(req)?;
                encode(name, PrepareResponse::default())
            } else {
                encode(name, backend.prepare(req)?)
            }
        }
        method::BDEV_FORMAT => {
            encode(name, backend.format(decode(name, body)?)?)
        }
        method::BDEV_WRITE_CONFIG => {
            encode(name, backend.write_config(decode(name, body)?)?)
        }
        method::BDEV_READ_CONFIG => {
            encode(name, backend.read_config(decode(name, body)?)?)
        }
        method::NVME_FIRMWARE_QUERY => {
            let req: FirmwareQueryRequest = decode(name, body)?;
            let scan = backend.scan(ScanRequest {
                forwarded: true,
                vmd_enabled: req.vmd_enabled,
                device_list: req.device_list,
            })?;
            let devices =
                scan.controllers.iter().map(FirmwareInfo::from).collect();
            encode(name, FirmwareQueryResponse { devices })
        }
        method::NVME_FIRMWARE_UPDATE => {
            encode(name, backend.update_firmware(decode(name, body)?)?)
        }
        other => Err(ForwardError::UnknownMethod(other.to_string()).into()),
    }
}

/// Executes a forwarded request on the helper side.
///
/// Failures are reported in the reply rather than returned, so the caller
/// always has something to write back.
pub fn serve_request(
    log: &Logger,
    backend: &dyn Backend,
    method: &str,
    body: &[u8],
) -> HelperReply {
    match dispatch(backend, method, body) {
        Ok(payload) => HelperReply { payload: Some(payload), fault: None },
        Err(e) => {
            debug!(log, "forwarded request failed";
                "method" => method, "error" => %e);
            HelperReply { payload: None, fault: Some(e.to_fault()) }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::controller::{Controller, Controllers};
    use crate::mock::{MockBackend, MockBackendConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    fn log() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    /// Serves requests in-process against a backend.
    struct Loopback {
        backend: Arc<MockBackend>,
        methods: Arc<Mutex<Vec<String>>>,
    }

    impl HelperChannel for Loopback {
        fn exchange(
            &mut self,
            method: &str,
            request: &[u8],
        ) -> Result<Vec<u8>, ForwardError> {
            self.methods.lock().unwrap().push(method.to_string());
            let reply =
                serve_request(&log(), self.backend.as_ref(), method, request);
            Ok(serde_json::to_vec(&reply).unwrap())
        }
    }

    struct Harness {
        helper: tempfile::NamedTempFile,
        backend: Arc<MockBackend>,
        methods: Arc<Mutex<Vec<String>>>,
    }

    impl Harness {
        fn new(cfg: MockBackendConfig) -> Self {
            Self {
                helper: tempfile::NamedTempFile::new().unwrap(),
                backend: Arc::new(MockBackend::new(log(), cfg)),
                methods: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn forwarder(&self, helper: &Path) -> Arc<Forwarder> {
            let chan = Loopback {
                backend: self.backend.clone(),
                methods: self.methods.clone(),
            };
            Arc::new(Forwarder::with_channel(helper, Box::new(chan), log()))
        }

        fn forwarding(&self) -> ForwardingBackend {
            ForwardingBackend::new(self.forwarder(self.helper.path()))
        }
    }

    fn inventory() -> MockBackendConfig {
        let mut ctrlr = Controller::new("0000:81:00.0".parse().unwrap());
        ctrlr.model = "PM1733".to_string();
        ctrlr.fw_rev = "EPK9".to_string();
        MockBackendConfig {
            controllers: Controllers::from_iter([ctrlr]),
            ..Default::default()
        }
    }

    #[test]
    fn requests_round_trip_through_helper() {
        let h = Harness::new(inventory());
        let fwd = h.forwarding();

        let scan = fwd.scan(ScanRequest::default()).unwrap();
        assert_eq!(scan.controllers.len(), 1);

        fwd.reset(PrepareRequest::default()).unwrap();
        assert_eq!(h.backend.reset_calls().len(), 1);
        assert!(h.backend.reset_calls()[0].forwarded);

        let fw = fwd.query_firmware(FirmwareQueryRequest::default()).unwrap();
        assert_eq!(fw.devices[0].fw_rev, "EPK9");

        fwd.update_firmware(FirmwareUpdateRequest {
            address: "0000:81:00.0".to_string(),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(
            *h.methods.lock().unwrap(),
            [
                method::BDEV_SCAN,
                method::BDEV_PREPARE,
                method::NVME_FIRMWARE_QUERY,
                method::NVME_FIRMWARE_UPDATE,
            ]
        );
    }

    #[test]
    fn forwarded_requests_are_not_forwarded_again() {
        let h = Harness::new(inventory());
        let fwd = h.forwarding();
        let err = fwd
            .scan(ScanRequest { forwarded: true, ..Default::default() })
            .unwrap_err();
        assert_eq!(err.to_fault().code, FaultCode::AlreadyForwarded);
        assert!(h.methods.lock().unwrap().is_empty());
    }

    #[test]
    fn helper_faults_come_back_intact() {
        let h = Harness::new(MockBackendConfig {
            scan_err: Some(Fault::new(
                FaultCode::BdevNotFound,
                "nothing here",
                "look elsewhere",
            )),
            ..Default::default()
        });
        let err = h.forwarding().scan(ScanRequest::default()).unwrap_err();
        let fault = err.to_fault();
        assert_eq!(fault.code, FaultCode::BdevNotFound);
        assert_eq!(fault.description, "nothing here");
    }

    #[test]
    fn firmware_needs_installed_helper() {
        let h = Harness::new(inventory());
        let missing = h.helper.path().with_extension("missing");
        let fwd = ForwardingBackend::new(h.forwarder(&missing));

        let err = fwd
            .update_firmware(FirmwareUpdateRequest {
                address: "0000:81:00.0".to_string(),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.to_fault().code, FaultCode::PrivilegedHelperUnavailable);
        assert!(h.methods.lock().unwrap().is_empty());

        // Required operations are attempted regardless.
        assert!(fwd.scan(ScanRequest::default()).is_ok());
    }

    #[test]
    fn unknown_method_is_reported() {
        let backend = MockBackend::new(log(), MockBackendConfig::default());
        let reply = serve_request(&log(), &backend, "BdevExplode", b"{}");
        assert_eq!(reply.payload, None);
        assert_eq!(reply.fault.unwrap().code, FaultCode::ForwardFailure);

        let reply = serve_request(&log(), &backend, method::BDEV_SCAN, b"[");
        assert_eq!(reply.fault.unwrap().code, FaultCode::ForwardFailure);
    }

    /// Holds every exchange until the test releases it.
    struct Gate {
        entered: mpsc::Sender<()>,
        release: mpsc::Receiver<()>,
        in_flight: Arc<AtomicUsize>,
        most_in_flight: Arc<AtomicUsize>,
    }

    impl HelperChannel for Gate {
        fn exchange(
            &mut self,
            _method: &str,
            _request: &[u8],
        ) -> Result<Vec<u8>, ForwardError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.most_in_flight.fetch_max(now, Ordering::SeqCst);
            self.entered.send(()).unwrap();
            self.release.recv().unwrap();
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let reply = HelperReply {
                payload: Some(serde_json::json!({
                    "controllers": [],
                    "vmd_enabled": false,
                })),
                fault: None,
            };
            Ok(serde_json::to_vec(&reply).unwrap())
        }
    }

    #[test]
    fn one_call_in_flight_per_forwarder() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let most_in_flight = Arc::new(AtomicUsize::new(0));
        let gate = Gate {
            entered: entered_tx,
            release: release_rx,
            in_flight: Arc::new(AtomicUsize::new(0)),
            most_in_flight: most_in_flight.clone(),
        };
        let fwd = Arc::new(Forwarder::with_channel(
            "/nonexistent/helper",
            Box::new(gate),
            log(),
        ));

        let calls: Vec<_> = (0..2)
            .map(|_| {
                let fwd = fwd.clone();
                std::thread::spawn(move || {
                    fwd.forward::<_, ScanResponse>(
                        method::BDEV_SCAN,
                        ScanRequest::default(),
                    )
                })
            })
            .collect();

        // The first call is in the channel; the second must wait for it.
        entered_rx.recv().unwrap();
        assert_eq!(
            entered_rx.recv_timeout(Duration::from_millis(200)),
            Err(mpsc::RecvTimeoutError::Timeout)
        );

        release_tx.send(()).unwrap();
        entered_rx.recv().unwrap();
        release_tx.send(()).unwrap();

        for call in calls {
            assert!(call.join().unwrap().is_ok());
        }
        assert_eq!(most_in_flight.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn helper_is_reaped_when_request_cannot_be_written() {
        // A helper that never reads stdin, and a request larger than any
        // pipe buffer, so the write outlives the helper.
        let request = vec![b' '; 8 << 20];
        let err = ProcessChannel::new("true")
            .exchange(method::BDEV_SCAN, &request)
            .unwrap_err();
        match err {
            ForwardError::Transport { reason, .. } => {
                assert!(reason.starts_with("writing request"), "{reason}")
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn process_channel_speaks_json_over_stdio() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let helper = dir.path().join("helper");
        std::fs::write(
            &helper,
            "#!/bin/sh\n[ \"$1\" = BdevScan ] || exit 9\ncat >/dev/null\n\
             echo '{\"payload\":{\"controllers\":[],\"vmd_enabled\":true}}'\n",
        )
        .unwrap();
        let mode = std::fs::Permissions::from_mode(0o755);
        std::fs::set_permissions(&helper, mode).unwrap();

        let fwd = Forwarder::new(&helper, log());
        assert!(fwd.can_forward());
        let resp: ScanResponse =
            fwd.forward(method::BDEV_SCAN, ScanRequest::default()).unwrap();
        assert!(resp.vmd_enabled);

        let err = fwd
            .forward::<_, ScanResponse>(
                method::BDEV_FORMAT,
                FormatRequest::default(),
            )
            .unwrap_err();
        assert!(matches!(err, ForwardError::Transport { .. }));
        assert_eq!(err.to_fault().code, FaultCode::ForwardFailure);
    }
}

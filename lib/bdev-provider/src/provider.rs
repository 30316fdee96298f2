// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Entry point used by the control plane.
//!
//! The provider remembers whether VMD was set up by the last successful
//! prepare and applies that to every later operation.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use bdev_config::{EngineStorageConfig, ProviderConfig};
use bdev_types::{BusRange, Fault, FaultCode, PciAddressSet};
use slog::{debug, info, o, warn, Logger};

use crate::backend::*;
use crate::controller::Controllers;
use crate::forward::{ForwardingBackend, Forwarder};
use crate::native::Nvme;
use crate::script::SetupScript;
use crate::spdk::SpdkBackend;
use crate::spdk_config::{SpdkConfig, SpdkConfigError};
use crate::sysfs;
use crate::Error;

/// Whether requests should go through the privileged helper.
pub fn should_forward(
    cfg: &ProviderConfig,
    euid: u32,
    helper_installed: bool,
) -> bool {
    euid != 0 && helper_installed && !cfg.disable_forwarding
}

pub struct Provider {
    log: Logger,
    backend: Arc<dyn Backend>,
    forwarding: Option<Arc<ForwardingBackend>>,
    sysfs_root: PathBuf,
    vmd_enabled: RwLock<bool>,
}

impl Provider {
    pub fn new(log: Logger, backend: Arc<dyn Backend>) -> Self {
        Self {
            log,
            backend,
            forwarding: None,
            sysfs_root: ProviderConfig::default().sysfs_root,
            vmd_enabled: RwLock::new(false),
        }
    }

    /// A provider executing everything through the privileged helper.
    pub fn forwarding(log: Logger, backend: Arc<ForwardingBackend>) -> Self {
        let mut provider = Self::new(log, backend.clone());
        provider.forwarding = Some(backend);
        provider
    }

    pub fn with_sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = root.into();
        self
    }

    /// Builds the backend suited to the current process: the privileged
    /// helper when running unprivileged with the helper installed,
    /// otherwise the native library directly.
    pub fn from_config(
        log: Logger,
        cfg: &ProviderConfig,
        nvme: Arc<dyn Nvme>,
    ) -> Self {
        let forwarder = Forwarder::new(
            &cfg.helper_path,
            log.new(o!("component" => "forwarder")),
        );
        // SAFETY: no preconditions.
        let euid = unsafe { libc::geteuid() };

        let provider = if should_forward(cfg, euid, forwarder.can_forward()) {
            info!(log, "forwarding bdev requests to privileged helper";
                "helper" => %cfg.helper_path.display());
            let backend = Arc::new(ForwardingBackend::new(Arc::new(forwarder)));
            Self::forwarding(log, backend)
        } else {
            let script = SetupScript::new(
                &cfg.setup_script,
                log.new(o!("component" => "setup_script")),
            );
            let backend = SpdkBackend::new(
                log.new(o!("component" => "spdk")),
                nvme,
                Box::new(script),
                cfg,
            );
            Self::new(log, Arc::new(backend))
        };
        provider.with_sysfs_root(&cfg.sysfs_root)
    }

    pub fn is_forwarding(&self) -> bool {
        self.forwarding.is_some()
    }

    pub fn is_vmd_enabled(&self) -> bool {
        *self.vmd_enabled.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Discovers controllers; an empty list means all.
    pub fn scan(
        &self,
        device_list: PciAddressSet,
    ) -> Result<Controllers, Error> {
        let req = ScanRequest {
            forwarded: false,
            device_list,
            vmd_enabled: self.is_vmd_enabled(),
        };
        Ok(self.backend.scan(req)?.controllers)
    }

    /// Prepares devices for the engines, remembering whether VMD is now in
    /// use.
    pub fn prepare(
        &self,
        req: PrepareRequest,
    ) -> Result<PrepareResponse, Error> {
        if req.reset {
            self.reset(req)?;
            return Ok(PrepareResponse::default());
        }
        let binds = !req.clean_hugepages_only;
        let resp = self.backend.prepare(req)?;
        if binds {
            let mut vmd = self
                .vmd_enabled
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            *vmd = resp.vmd_prepared;
        }
        info!(self.log, "bdev prepare complete";
            "hugepages_removed" => resp.hugepages_removed,
            "vmd" => resp.vmd_prepared);
        Ok(resp)
    }

    pub fn reset(&self, req: PrepareRequest) -> Result<(), Error> {
        self.backend.reset(req)
    }

    /// Formats one tier's devices. Emulated backing files are created owned
    /// by `uid` and `gid`.
    pub fn format(
        &self,
        properties: TierProperties,
        uid: u32,
        gid: u32,
    ) -> Result<FormatResponse, Error> {
        let req = FormatRequest {
            forwarded: false,
            properties,
            owner_uid: uid,
            owner_gid: gid,
            vmd_enabled: self.is_vmd_enabled(),
        };
        let resp = self.backend.format(req)?;
        for (dev, fault) in resp.failures() {
            warn!(self.log, "device format failed";
                "device" => dev, "fault" => %fault);
        }
        Ok(resp)
    }

    /// Formats every bdev tier of an engine.
    pub fn format_engine(
        &self,
        engine: &EngineStorageConfig,
        uid: u32,
        gid: u32,
    ) -> Result<FormatResponse, Error> {
        let mut all = FormatResponse::default();
        for tier in engine.tiers.bdev_configs() {
            let resp = self.format(TierProperties::from(tier), uid, gid)?;
            all.devices.extend(resp.devices);
        }
        Ok(all)
    }

    /// Host bus span of the engine's NUMA node, needed only when hotplug
    /// is on and VMD does not already cover every bus.
    fn numa_bus_range(
        &self,
        engine: &EngineStorageConfig,
    ) -> Option<BusRange> {
        if !engine.enable_hotplug || self.is_vmd_enabled() {
            return None;
        }
        match sysfs::numa_topology(&self.sysfs_root) {
            Ok(topo) => topo.bus_range(engine.numa_node),
            Err(e) => {
                warn!(self.log, "unable to read PCI topology";
                    "root" => %self.sysfs_root.display(), "error" => %e);
                None
            }
        }
    }

    /// Writes the engine's device configuration document. Returns where it
    /// was written, or `None` when the engine has no bdev tiers.
    pub fn write_config(
        &self,
        engine: &EngineStorageConfig,
    ) -> Result<Option<PathBuf>, Error> {
        let req = WriteConfigRequest {
            forwarded: false,
            engine: engine.clone(),
            vmd_enabled: self.is_vmd_enabled(),
            numa_bus_range: self.numa_bus_range(engine),
        };
        Ok(self.backend.write_config(req)?.path)
    }

    pub fn read_config(&self, path: &Path) -> Result<SpdkConfig, Error> {
        let req =
            ReadConfigRequest { forwarded: false, path: path.to_path_buf() };
        Ok(self.backend.read_config(req)?.config)
    }

    /// Makes sure a usable device configuration exists for the engine,
    /// regenerating it when the existing one is missing or unreadable.
    /// Returns whether a new document was written.
    pub fn ensure_config(
        &self,
        engine: &EngineStorageConfig,
    ) -> Result<bool, Error> {
        if !engine.tiers.have_bdevs() {
            return Ok(false);
        }
        let path = engine
            .config_output_path
            .as_deref()
            .ok_or(SpdkConfigError::NoOutputPath(engine.engine_idx))?;

        match self.read_config(path) {
            Ok(_) => {
                debug!(self.log, "device config present";
                    "path" => %path.display());
                Ok(false)
            }
            Err(e) => {
                info!(self.log, "regenerating device config";
                    "path" => %path.display(), "reason" => %e);
                self.write_config(engine)?;
                Ok(true)
            }
        }
    }

    pub fn update_firmware(
        &self,
        address: &str,
        image_path: &Path,
        slot: u32,
    ) -> Result<(), Error> {
        if address.trim().is_empty() {
            return Err(Fault::new(
                FaultCode::BdevNoAddress,
                "firmware update names no controller",
                "specify the PCI address of the controller to update",
            )
            .into());
        }
        let req = FirmwareUpdateRequest {
            forwarded: false,
            address: address.to_string(),
            image_path: image_path.to_path_buf(),
            slot,
        };
        self.backend.update_firmware(req)
    }

    /// Firmware details of the controllers in `device_list`; an empty list
    /// means all.
    pub fn query_firmware(
        &self,
        device_list: PciAddressSet,
    ) -> Result<Vec<FirmwareInfo>, Error> {
        if let Some(fwd) = &self.forwarding {
            let req = FirmwareQueryRequest {
                forwarded: false,
                device_list,
                vmd_enabled: self.is_vmd_enabled(),
            };
            return Ok(fwd.query_firmware(req)?.devices);
        }
        let controllers = self.scan(device_list)?;
        Ok(controllers.iter().map(FirmwareInfo::from).collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::controller::Controller;
    use crate::forward::{serve_request, ForwardError, HelperChannel};
    use crate::mock::{MockBackend, MockBackendConfig};
    use crate::sysfs::test::add_device;
    use bdev_config::{Class, TierConfig};

    fn log() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn provider(cfg: MockBackendConfig) -> (Provider, Arc<MockBackend>) {
        let mock = Arc::new(MockBackend::new(log(), cfg));
        (Provider::new(log(), mock.clone()), mock)
    }

    fn inventory(addrs: &[&str]) -> MockBackendConfig {
        MockBackendConfig {
            controllers: addrs
                .iter()
                .map(|a| Controller::new(a.parse().unwrap()))
                .collect(),
            ..Default::default()
        }
    }

    fn engine(md: &Path, hotplug: bool) -> EngineStorageConfig {
        let mut engine = EngineStorageConfig::new(0, "host-a")
            .with_tiers(vec![
                TierConfig::new(Class::Ram).with_scm_mount("/mnt/daos0"),
                TierConfig::new(Class::Nvme)
                    .with_bdev_devices(["0000:81:00.0"])
                    .unwrap(),
            ])
            .with_control_metadata(md);
        engine.enable_hotplug = hotplug;
        engine.validate().unwrap();
        engine
    }

    #[test]
    fn forwarding_decision() {
        let cfg = ProviderConfig::default();
        assert!(should_forward(&cfg, 1000, true));
        assert!(!should_forward(&cfg, 0, true));
        assert!(!should_forward(&cfg, 1000, false));
        let cfg = ProviderConfig { disable_forwarding: true, ..cfg };
        assert!(!should_forward(&cfg, 1000, true));
    }

    #[test]
    fn prepare_records_vmd_state() {
        let (p, _) = provider(MockBackendConfig {
            prepare_resp: PrepareResponse {
                hugepages_removed: 0,
                vmd_prepared: true,
            },
            ..inventory(&["5d0505:01:00.0"])
        });
        assert!(!p.is_vmd_enabled());

        p.prepare(PrepareRequest {
            clean_hugepages_only: true,
            ..Default::default()
        })
        .unwrap();
        assert!(!p.is_vmd_enabled());

        p.prepare(PrepareRequest { enable_vmd: true, ..Default::default() })
            .unwrap();
        assert!(p.is_vmd_enabled());

        // Endpoints in scans are expanded now that VMD is on.
        let found = p.scan("0000:5d:05.5".parse().unwrap()).unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn failed_prepare_keeps_vmd_state() {
        let (p, mock) = provider(MockBackendConfig {
            prepare_err: Some(Fault::unknown("script failed")),
            ..Default::default()
        });
        assert!(p.prepare(PrepareRequest::default()).is_err());
        assert!(!p.is_vmd_enabled());

        p.prepare(PrepareRequest { reset: true, ..Default::default() })
            .unwrap();
        assert_eq!(mock.reset_calls().len(), 1);
    }

    #[test]
    fn format_passes_vmd_state_and_owner() {
        let (p, mock) = provider(inventory(&["0000:81:00.0"]));
        let md = tempfile::tempdir().unwrap();
        let resp =
            p.format_engine(&engine(md.path(), false), 1000, 1000).unwrap();
        assert!(resp.all_formatted());

        let calls = mock.format_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].owner_uid, 1000);
        assert!(!calls[0].vmd_enabled);
        assert!(!calls[0].forwarded);
    }

    #[test]
    fn write_config_uses_numa_bus_span() {
        let sys = tempfile::tempdir().unwrap();
        add_device(sys.path(), "0000:80:00.0", "0x8086", "0x0a54", "1");
        add_device(sys.path(), "0000:9a:00.0", "0x8086", "0x0a54", "1");
        add_device(sys.path(), "0000:17:00.0", "0x8086", "0x0a54", "0");

        let (p, mock) = provider(MockBackendConfig::default());
        let p = p.with_sysfs_root(sys.path());
        let md = tempfile::tempdir().unwrap();
        let mut engine = engine(md.path(), true);
        engine.numa_node = 1;

        let path = p.write_config(&engine).unwrap().unwrap();
        let doc = &mock.written_configs()[&path];
        let range = doc.daos_data.config.iter().find_map(|d| match d {
            crate::spdk_config::Directive::HotplugBusidRange(r) => {
                Some(BusRange::new(r.begin, r.end).unwrap())
            }
            _ => None,
        });
        assert_eq!(range, Some(BusRange::new(0x80, 0x9a).unwrap()));
    }

    #[test]
    fn ensure_config_regenerates_missing_document() {
        let (p, mock) = provider(MockBackendConfig::default());
        let md = tempfile::tempdir().unwrap();
        let engine = engine(md.path(), false);

        assert!(p.ensure_config(&engine).unwrap());
        assert!(!p.ensure_config(&engine).unwrap());
        assert_eq!(mock.written_configs().len(), 1);
    }

    #[test]
    fn firmware_operations() {
        let (p, mock) = provider(inventory(&["0000:81:00.0", "0000:82:00.0"]));

        let err = p.update_firmware("", Path::new("/fw.bin"), 1).unwrap_err();
        assert_eq!(err.to_fault().code, FaultCode::BdevNoAddress);
        assert!(mock.firmware_updates().is_empty());

        p.update_firmware("0000:82:00.0", Path::new("/fw.bin"), 1).unwrap();
        assert_eq!(mock.firmware_updates()[0].slot, 1);

        let info = p.query_firmware("0000:81:00.0".parse().unwrap()).unwrap();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].address.to_string(), "0000:81:00.0");
    }

    /// Serves forwarded requests in-process against a backend.
    struct InProcess(Arc<MockBackend>);

    impl HelperChannel for InProcess {
        fn exchange(
            &mut self,
            method: &str,
            request: &[u8],
        ) -> Result<Vec<u8>, ForwardError> {
            let reply = serve_request(&log(), self.0.as_ref(), method, request);
            Ok(serde_json::to_vec(&reply).unwrap())
        }
    }

    #[test]
    fn forwarded_firmware_query_follows_vmd_state() {
        let helper = tempfile::NamedTempFile::new().unwrap();
        let mock = Arc::new(MockBackend::new(
            log(),
            MockBackendConfig {
                prepare_resp: PrepareResponse {
                    hugepages_removed: 0,
                    vmd_prepared: true,
                },
                ..inventory(&["5d0505:01:00.0", "5d0505:03:00.0"])
            },
        ));
        let fwd = Forwarder::with_channel(
            helper.path(),
            Box::new(InProcess(mock.clone())),
            log(),
        );
        let p = Provider::forwarding(
            log(),
            Arc::new(ForwardingBackend::new(Arc::new(fwd))),
        );
        assert!(p.is_forwarding());

        // Without VMD the endpoint itself is not a known controller.
        let err =
            p.query_firmware("0000:5d:05.5".parse().unwrap()).unwrap_err();
        assert_eq!(err.to_fault().code, FaultCode::BdevNotFound);

        p.prepare(PrepareRequest { enable_vmd: true, ..Default::default() })
            .unwrap();
        assert!(p.is_vmd_enabled());

        let info = p.query_firmware("0000:5d:05.5".parse().unwrap()).unwrap();
        let addrs: Vec<_> =
            info.iter().map(|i| i.address.to_string()).collect();
        assert_eq!(addrs, ["5d0505:01:00.0", "5d0505:03:00.0"]);
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory backend for exercising callers without hardware.
//!
//! Behavior is fixed by a [MockBackendConfig]; every mutating request is
//! recorded for later inspection.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use bdev_config::{BdevClass, DeviceList};
use bdev_types::{Fault, FaultCode};
use slog::{debug, Logger};

use crate::backend::*;
use crate::controller::Controllers;
use crate::spdk_config::{self, ConfigInput, SpdkConfig, SpdkConfigError};
use crate::vmd;
use crate::Error;

#[derive(Clone, Debug, Default)]
pub struct MockBackendConfig {
    /// Controllers reported by discovery.
    pub controllers: Controllers,
    pub scan_err: Option<Fault>,
    pub prepare_resp: PrepareResponse,
    pub prepare_err: Option<Fault>,
    pub reset_err: Option<Fault>,
    pub format_err: Option<Fault>,
    /// Per-device failures reported by format, keyed as in the response.
    pub format_failures: BTreeMap<String, Fault>,
    pub write_config_err: Option<Fault>,
    pub firmware_err: Option<Fault>,
}

#[derive(Default)]
struct Recorded {
    prepares: Vec<PrepareRequest>,
    resets: Vec<PrepareRequest>,
    formats: Vec<FormatRequest>,
    firmware_updates: Vec<FirmwareUpdateRequest>,
    configs: BTreeMap<PathBuf, SpdkConfig>,
}

pub struct MockBackend {
    log: Logger,
    cfg: MockBackendConfig,
    recorded: Mutex<Recorded>,
}

impl MockBackend {
    pub fn new(log: Logger, cfg: MockBackendConfig) -> Self {
        Self { log, cfg, recorded: Mutex::new(Recorded::default()) }
    }

    fn recorded(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn prepare_calls(&self) -> Vec<PrepareRequest> {
        self.recorded().prepares.clone()
    }

    pub fn reset_calls(&self) -> Vec<PrepareRequest> {
        self.recorded().resets.clone()
    }

    pub fn format_calls(&self) -> Vec<FormatRequest> {
        self.recorded().formats.clone()
    }

    pub fn firmware_updates(&self) -> Vec<FirmwareUpdateRequest> {
        self.recorded().firmware_updates.clone()
    }

    /// Documents written so far, by output path.
    pub fn written_configs(&self) -> BTreeMap<PathBuf, SpdkConfig> {
        self.recorded().configs.clone()
    }

    fn device_result(&self, device: &str) -> DeviceFormatResult {
        match self.cfg.format_failures.get(device) {
            Some(fault) => DeviceFormatResult::failed(fault.clone()),
            None => DeviceFormatResult::ok(),
        }
    }
}

fn injected(err: &Option<Fault>) -> Result<(), Error> {
    match err {
        Some(fault) => Err(fault.clone().into()),
        None => Ok(()),
    }
}

impl Backend for MockBackend {
    fn scan(&self, req: ScanRequest) -> Result<ScanResponse, Error> {
        injected(&self.cfg.scan_err)?;
        let controllers = vmd::groom_discovered(
            &req.device_list,
            self.cfg.controllers.clone(),
            req.vmd_enabled,
        )?;
        Ok(ScanResponse { controllers, vmd_enabled: req.vmd_enabled })
    }

    fn format(&self, req: FormatRequest) -> Result<FormatResponse, Error> {
        self.recorded().formats.push(req.clone());
        injected(&self.cfg.format_err)?;

        let props = &req.properties;
        let devices: Vec<String> = match (&props.class, &props.device_list) {
            (BdevClass::None, _) => {
                return Err(unknown_class_fault(props.tier).into())
            }
            (BdevClass::Nvme, DeviceList::Pci(requested))
                if req.vmd_enabled =>
            {
                vmd::substitute_vmd_addresses(
                    requested,
                    &self.cfg.controllers.addresses(),
                )
                .strings()
            }
            (_, list) => list.strings(),
        };
        Ok(FormatResponse {
            devices: devices
                .into_iter()
                .map(|d| {
                    let result = self.device_result(&d);
                    (d, result)
                })
                .collect(),
        })
    }

    fn prepare(&self, req: PrepareRequest) -> Result<PrepareResponse, Error> {
        if req.reset {
            self.reset(req)?;
            return Ok(PrepareResponse::default());
        }
        self.recorded().prepares.push(req);
        injected(&self.cfg.prepare_err)?;
        Ok(self.cfg.prepare_resp.clone())
    }

    fn reset(&self, req: PrepareRequest) -> Result<(), Error> {
        self.recorded().resets.push(req);
        injected(&self.cfg.reset_err)
    }

    fn write_config(
        &self,
        req: WriteConfigRequest,
    ) -> Result<WriteConfigResponse, Error> {
        injected(&self.cfg.write_config_err)?;
        let engine = &req.engine;
        if !engine.tiers.have_bdevs() {
            return Ok(WriteConfigResponse { path: None });
        }
        let path = engine
            .config_output_path
            .clone()
            .ok_or(SpdkConfigError::NoOutputPath(engine.engine_idx))?;

        let input = ConfigInput {
            engine,
            vmd_enabled: req.vmd_enabled,
            numa_bus_range: req.numa_bus_range,
        };
        let doc = spdk_config::generate(&self.log, &input)?;
        debug!(self.log, "mock wrote device config";
            "path" => %path.display());
        self.recorded().configs.insert(path.clone(), doc);
        Ok(WriteConfigResponse { path: Some(path) })
    }

    fn read_config(
        &self,
        req: ReadConfigRequest,
    ) -> Result<ReadConfigResponse, Error> {
        match self.recorded().configs.get(&req.path) {
            Some(doc) => Ok(ReadConfigResponse { config: doc.clone() }),
            None => Err(SpdkConfigError::Io {
                path: req.path,
                source: std::io::ErrorKind::NotFound.into(),
            }
            .into()),
        }
    }

    fn update_firmware(&self, req: FirmwareUpdateRequest) -> Result<(), Error> {
        let addr = firmware_address(&req.address)?;
        if self.cfg.controllers.get(&addr).is_none() {
            return Err(Fault::new(
                FaultCode::BdevNotFound,
                format!("controller {addr} not found"),
                "check the address against the scan output",
            )
            .into());
        }
        self.recorded().firmware_updates.push(req);
        injected(&self.cfg.firmware_err)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::controller::Controller;
    use bdev_config::{Class, EngineStorageConfig, TierConfig};

    fn log() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn backend(cfg: MockBackendConfig) -> MockBackend {
        MockBackend::new(log(), cfg)
    }

    fn controllers(addrs: &[&str]) -> Controllers {
        addrs.iter().map(|a| Controller::new(a.parse().unwrap())).collect()
    }

    #[test]
    fn scan_and_format_follow_inventory() {
        let mut cfg = MockBackendConfig {
            controllers: controllers(&["5d0505:01:00.0", "5d0505:03:00.0"]),
            ..Default::default()
        };
        cfg.format_failures.insert(
            "5d0505:03:00.0".to_string(),
            Fault::unknown("injected"),
        );
        let mock = backend(cfg);

        let resp = mock
            .scan(ScanRequest {
                device_list: "0000:5d:05.5".parse().unwrap(),
                vmd_enabled: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(resp.controllers.len(), 2);

        let resp = mock
            .format(FormatRequest {
                properties: TierProperties {
                    class: BdevClass::Nvme,
                    device_list: DeviceList::Pci(
                        "0000:5d:05.5".parse().unwrap(),
                    ),
                    ..Default::default()
                },
                vmd_enabled: true,
                ..Default::default()
            })
            .unwrap();
        assert!(resp.devices["5d0505:01:00.0"].formatted);
        assert!(!resp.devices["5d0505:03:00.0"].formatted);
        assert_eq!(mock.format_calls().len(), 1);
    }

    #[test]
    fn injected_errors_surface() {
        let mock = backend(MockBackendConfig {
            prepare_err: Some(Fault::new(
                FaultCode::BdevPrepareFailure,
                "no vfio",
                "load vfio-pci",
            )),
            ..Default::default()
        });
        let err = mock.prepare(PrepareRequest::default()).unwrap_err();
        assert_eq!(err.to_fault().code, FaultCode::BdevPrepareFailure);
        assert_eq!(mock.prepare_calls().len(), 1);

        mock.prepare(PrepareRequest { reset: true, ..Default::default() })
            .unwrap();
        assert_eq!(mock.reset_calls().len(), 1);
        assert_eq!(mock.prepare_calls().len(), 1);
    }

    #[test]
    fn configs_round_trip_in_memory() {
        let mock = backend(MockBackendConfig::default());
        let mut engine = EngineStorageConfig::new(3, "host-c")
            .with_tiers(vec![
                TierConfig::new(Class::Ram).with_scm_mount("/mnt/daos3"),
                TierConfig::new(Class::Nvme)
                    .with_bdev_devices(["0000:81:00.0"])
                    .unwrap(),
            ])
            .with_control_metadata("/var/daos/md");
        engine.validate().unwrap();

        let path = mock
            .write_config(WriteConfigRequest { engine, ..Default::default() })
            .unwrap()
            .path
            .unwrap();
        let doc = mock
            .read_config(ReadConfigRequest {
                path: path.clone(),
                ..Default::default()
            })
            .unwrap()
            .config;
        assert_eq!(mock.written_configs()[&path], doc);

        let err = mock
            .read_config(ReadConfigRequest {
                path: "/nowhere".into(),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.to_fault().code, FaultCode::BdevConfigReadFailure);
    }

    #[test]
    fn firmware_update_checks_inventory() {
        let mock = backend(MockBackendConfig {
            controllers: controllers(&["0000:81:00.0"]),
            ..Default::default()
        });
        let req = |addr: &str| FirmwareUpdateRequest {
            address: addr.to_string(),
            ..Default::default()
        };
        mock.update_firmware(req("0000:81:00.0")).unwrap();
        let err = mock.update_firmware(req("0000:82:00.0")).unwrap_err();
        assert_eq!(err.to_fault().code, FaultCode::BdevNotFound);
        assert_eq!(
            mock.update_firmware(req(" ")).unwrap_err().to_fault().code,
            FaultCode::BdevNoAddress
        );
        assert_eq!(mock.firmware_updates().len(), 1);
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Backend driving real devices through the native acceleration library
//! and its setup script.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bdev_config::{BdevClass, DeviceList, ProviderConfig};
use bdev_types::{Fault, FaultCode, PciAddress, PciAddressSet};
use slog::{debug, info, warn, Logger};

use crate::backend::*;
use crate::controller::Controllers;
use crate::hugepages::{self, HUGEPAGE_PREFIX};
use crate::native::{EnvGuard, EnvOptions, NamespaceFormat, Nvme};
use crate::script::{Script, ScriptEnv, DRIVER_NONE, DRIVER_UIO};
use crate::spdk_config::{self, ConfigInput, SpdkConfig, SpdkConfigError};
use crate::sysfs;
use crate::vmd::{self, VmdError};
use crate::{Error, NativeOp};

const GIB: u64 = 1 << 30;

pub struct SpdkBackend {
    log: Logger,
    nvme: Arc<dyn Nvme>,
    script: Box<dyn Script>,
    hugepage_dir: PathBuf,
    lockfile_dir: PathBuf,
    sysfs_root: PathBuf,
}

impl SpdkBackend {
    pub fn new(
        log: Logger,
        nvme: Arc<dyn Nvme>,
        script: Box<dyn Script>,
        cfg: &ProviderConfig,
    ) -> Self {
        Self {
            log,
            nvme,
            script,
            hugepage_dir: cfg.hugepage_dir.clone(),
            lockfile_dir: cfg.lockfile_dir.clone(),
            sysfs_root: cfg.sysfs_root.clone(),
        }
    }

    /// Runs discovery inside a scoped library environment.
    fn discover(&self, opts: &EnvOptions) -> Result<Controllers, Error> {
        let target = if opts.pci_allowlist.is_empty() {
            "all devices".to_string()
        } else {
            opts.pci_allowlist.to_string()
        };
        let _env = EnvGuard::init(self.nvme.as_ref(), opts)
            .map_err(|e| Error::native(NativeOp::Init, &target, e))?;
        let found = self
            .nvme
            .discover()
            .map_err(|e| Error::native(NativeOp::Discover, &target, e))?;
        debug!(self.log, "discovered controllers";
            "target" => &target, "count" => found.len());
        Ok(found.into_iter().collect())
    }

    /// Addresses of everything currently visible behind the VMD endpoints
    /// among `targets`.
    fn vmd_inventory(
        &self,
        targets: &PciAddressSet,
    ) -> Result<PciAddressSet, Error> {
        let opts = EnvOptions {
            pci_allowlist: targets.backing_to_vmd_addresses(),
            enable_vmd: true,
        };
        Ok(self.discover(&opts)?.addresses())
    }

    /// Expands VMD endpoints in `targets`. Endpoints known to the host
    /// with nothing discovered behind them fail the whole request.
    fn expand_vmd(
        &self,
        targets: &PciAddressSet,
    ) -> Result<PciAddressSet, Error> {
        let inventory = self.vmd_inventory(targets)?;
        let expanded = vmd::substitute_vmd_addresses(targets, &inventory);

        let endpoints = match sysfs::vmd_endpoints(&self.sysfs_root) {
            Ok(eps) => eps,
            Err(e) => {
                warn!(self.log, "unable to list VMD endpoints";
                    "error" => %e);
                PciAddressSet::new()
            }
        };
        let empty = expanded.intersection(&endpoints);
        if !empty.is_empty() {
            return Err(VmdError::NoBackingDevices(empty).into());
        }
        Ok(expanded)
    }

    fn format_nvme(
        &self,
        req: &FormatRequest,
    ) -> Result<FormatResponse, Error> {
        let props = &req.properties;
        let DeviceList::Pci(requested) = &props.device_list else {
            return Err(Fault::new(
                FaultCode::BdevFormatFailure,
                format!("tier {} lists non-PCI devices", props.tier),
                "nvme tiers must list controller PCI addresses",
            )
            .into());
        };

        let targets = if req.vmd_enabled {
            self.expand_vmd(requested)?
        } else {
            requested.clone()
        };
        info!(self.log, "formatting nvme controllers";
            "tier" => props.tier, "targets" => %targets);

        let results = {
            let opts = EnvOptions {
                pci_allowlist: targets.backing_to_vmd_addresses(),
                enable_vmd: req.vmd_enabled,
            };
            let _env = EnvGuard::init(self.nvme.as_ref(), &opts)
                .map_err(|e| Error::native(NativeOp::Init, &targets, e))?;
            self.nvme
                .format(&targets)
                .map_err(|e| Error::native(NativeOp::Format, &targets, e))?
        };
        let resp = aggregate_namespace_results(&targets, results);

        // The library leaves a lockfile per claimed controller. Those of
        // controllers that failed to format are kept for the next attempt.
        let (removed, res) = hugepages::clean_lockfiles(
            &self.log,
            &self.lockfile_dir,
            &targets,
            |addr| {
                resp.devices
                    .get(&addr.to_string())
                    .is_some_and(|r| r.formatted)
            },
        );
        if let Err(e) = res {
            warn!(self.log, "lockfiles left behind after format";
                "error" => %e);
        }
        debug!(self.log, "removed lockfiles"; "count" => removed.len());

        Ok(resp)
    }

    fn format_files(&self, req: &FormatRequest) -> FormatResponse {
        let props = &req.properties;
        let mut resp = FormatResponse::default();
        for path in props.device_list.paths() {
            let res = create_backing_file(
                Path::new(path),
                props.file_size,
                req.owner_uid,
                req.owner_gid,
            );
            let result = match res {
                Ok(()) => DeviceFormatResult::ok(),
                Err(e) => {
                    warn!(self.log, "failed to create backing file";
                        "path" => path, "error" => %e);
                    DeviceFormatResult::failed(Fault::new(
                        FaultCode::BdevFormatFailure,
                        format!("creating {path}: {e}"),
                        "check that the parent directory exists and has \
                         free space",
                    ))
                }
            };
            resp.devices.insert(path.clone(), result);
        }
        resp
    }

    /// Environment for a script run. With VMD requested, backing addresses
    /// in either list stand for their endpoints, which is what the script
    /// binds.
    fn script_env(req: &PrepareRequest) -> ScriptEnv {
        let for_script = |list: &PciAddressSet| {
            if req.enable_vmd {
                list.backing_to_vmd_addresses()
            } else {
                list.clone()
            }
        };
        ScriptEnv {
            nr_hugepages: req.hugepage_count,
            huge_node: req.huge_nodes.clone(),
            target_user: req.target_user.clone(),
            pci_allowed: for_script(&req.pci_allowlist),
            pci_blocked: for_script(&req.pci_blocklist),
            driver_override: req
                .disable_vfio
                .then(|| DRIVER_UIO.to_string()),
        }
    }

    /// VMD endpoints the request may use; empty when VMD is off or nothing
    /// survives the allow and block lists.
    fn vmd_endpoints(
        &self,
        req: &PrepareRequest,
    ) -> Result<PciAddressSet, Error> {
        if !req.enable_vmd {
            return Ok(PciAddressSet::new());
        }
        let candidates =
            sysfs::vmd_endpoints(&self.sysfs_root).map_err(|e| {
                Fault::new(
                    FaultCode::BdevPrepareFailure,
                    format!(
                        "listing PCI devices under {}: {e}",
                        self.sysfs_root.display()
                    ),
                    "check that sysfs is mounted",
                )
            })?;
        let endpoints = vmd::filter_vmd_candidates(
            &candidates,
            &req.pci_allowlist,
            &req.pci_blocklist,
        );
        if endpoints.is_empty() {
            info!(self.log, "no usable VMD endpoints, VMD disabled";
                "candidates" => %candidates);
        }
        Ok(endpoints)
    }
}

/// Allows endpoints through a non-empty allow list; an empty list already
/// allows everything.
fn allow_endpoints(env: &mut ScriptEnv, endpoints: &PciAddressSet) {
    if !env.pci_allowed.is_empty() {
        env.pci_allowed = env.pci_allowed.union(endpoints);
    }
}

fn create_backing_file(
    path: &Path,
    size_gib: u64,
    uid: u32,
    gid: u32,
) -> io::Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    file.set_len(size_gib * GIB)?;
    std::os::unix::fs::chown(path, Some(uid), Some(gid))
}

fn controller_result(
    addr: &PciAddress,
    namespaces: Option<Vec<NamespaceFormat>>,
) -> DeviceFormatResult {
    let Some(namespaces) = namespaces else {
        return DeviceFormatResult::failed(Fault::new(
            FaultCode::BdevNotFound,
            format!("no format results returned for {addr}"),
            "check that the controller is bound to a user-space driver",
        ));
    };
    let failed: Vec<&NamespaceFormat> =
        namespaces.iter().filter(|ns| ns.error.is_some()).collect();
    let Some(first) = failed.first() else {
        return DeviceFormatResult::ok();
    };
    let ids: Vec<u32> = failed.iter().map(|ns| ns.ns_id).collect();
    DeviceFormatResult::failed(Fault::new(
        FaultCode::BdevFormatFailure,
        format!(
            "failed to format namespaces {ids:?} of {addr}: {}",
            first.error.as_deref().unwrap_or_default()
        ),
        "check the controller's health and retry the format",
    ))
}

/// Folds per-namespace results into one result per controller.
///
/// A controller is formatted only when every namespace was. Targets the
/// library reported nothing for are failures.
pub fn aggregate_namespace_results(
    targets: &PciAddressSet,
    results: Vec<NamespaceFormat>,
) -> FormatResponse {
    let mut by_ctrlr: BTreeMap<PciAddress, Vec<NamespaceFormat>> =
        BTreeMap::new();
    for ns in results {
        by_ctrlr.entry(ns.ctrlr).or_default().push(ns);
    }

    let mut resp = FormatResponse::default();
    for addr in targets {
        let result = controller_result(addr, by_ctrlr.remove(addr));
        resp.devices.insert(addr.to_string(), result);
    }
    for (addr, namespaces) in by_ctrlr {
        let result = controller_result(&addr, Some(namespaces));
        resp.devices.insert(addr.to_string(), result);
    }
    resp
}

impl Backend for SpdkBackend {
    fn scan(&self, req: ScanRequest) -> Result<ScanResponse, Error> {
        let opts = EnvOptions {
            pci_allowlist: req.device_list.backing_to_vmd_addresses(),
            enable_vmd: req.vmd_enabled,
        };
        let found = self.discover(&opts)?;
        let controllers =
            vmd::groom_discovered(&req.device_list, found, req.vmd_enabled)?;
        Ok(ScanResponse { controllers, vmd_enabled: req.vmd_enabled })
    }

    fn format(&self, req: FormatRequest) -> Result<FormatResponse, Error> {
        let props = &req.properties;
        match props.class {
            BdevClass::None => Err(unknown_class_fault(props.tier).into()),
            BdevClass::Kdev => Ok(FormatResponse {
                devices: props
                    .device_list
                    .paths()
                    .iter()
                    .map(|p| (p.clone(), DeviceFormatResult::ok()))
                    .collect(),
            }),
            BdevClass::File => Ok(self.format_files(&req)),
            BdevClass::Nvme => self.format_nvme(&req),
        }
    }

    fn prepare(&self, req: PrepareRequest) -> Result<PrepareResponse, Error> {
        if req.reset {
            self.reset(req)?;
            return Ok(PrepareResponse::default());
        }

        let hugepages_removed = hugepages::clean_hugepages(
            &self.log,
            &self.hugepage_dir,
            HUGEPAGE_PREFIX,
            hugepages::process_alive,
        )?;
        if req.clean_hugepages_only {
            return Ok(PrepareResponse {
                hugepages_removed,
                vmd_prepared: false,
            });
        }

        let endpoints = self.vmd_endpoints(&req)?;
        let mut env = Self::script_env(&req);
        if endpoints.is_empty() {
            self.script.reset(&env)?;
        } else {
            // Rebinding VMD endpoints in place is slow; unbind them first.
            let unbind = ScriptEnv {
                pci_allowed: endpoints.clone(),
                driver_override: Some(DRIVER_NONE.to_string()),
                ..env.clone()
            };
            self.script.prepare(&unbind)?;
            allow_endpoints(&mut env, &endpoints);
        }
        self.script.prepare(&env)?;

        info!(self.log, "devices prepared";
            "hugepages" => req.hugepage_count,
            "vmd_endpoints" => %endpoints);
        Ok(PrepareResponse {
            hugepages_removed,
            vmd_prepared: !endpoints.is_empty(),
        })
    }

    fn reset(&self, req: PrepareRequest) -> Result<(), Error> {
        let endpoints = self.vmd_endpoints(&req)?;
        let mut env = ScriptEnv { nr_hugepages: 0, ..Self::script_env(&req) };
        allow_endpoints(&mut env, &endpoints);
        self.script.reset(&env)?;
        info!(self.log, "devices returned to kernel drivers");
        Ok(())
    }

    fn write_config(
        &self,
        req: WriteConfigRequest,
    ) -> Result<WriteConfigResponse, Error> {
        let mut engine = req.engine;
        if !engine.tiers.have_bdevs() {
            debug!(self.log, "engine has no bdevs, no device config";
                "engine" => engine.engine_idx);
            return Ok(WriteConfigResponse { path: None });
        }
        let path = engine
            .config_output_path
            .clone()
            .ok_or(SpdkConfigError::NoOutputPath(engine.engine_idx))?;

        if req.vmd_enabled && engine.tiers.have_real_nvme() {
            for tier in engine.tiers.iter_mut() {
                if tier.class.bdev_class() != BdevClass::Nvme {
                    continue;
                }
                if let DeviceList::Pci(set) = &tier.bdev.device_list {
                    let expanded = self.expand_vmd(set)?;
                    tier.bdev.device_list = DeviceList::Pci(expanded);
                }
            }
        }

        let input = ConfigInput {
            engine: &engine,
            vmd_enabled: req.vmd_enabled,
            numa_bus_range: req.numa_bus_range,
        };
        let doc = spdk_config::generate(&self.log, &input)?;
        doc.write(&path)?;
        info!(self.log, "wrote device config";
            "engine" => engine.engine_idx, "path" => %path.display());
        Ok(WriteConfigResponse { path: Some(path) })
    }

    fn read_config(
        &self,
        req: ReadConfigRequest,
    ) -> Result<ReadConfigResponse, Error> {
        Ok(ReadConfigResponse { config: SpdkConfig::read(&req.path)? })
    }

    fn update_firmware(&self, req: FirmwareUpdateRequest) -> Result<(), Error> {
        let addr = firmware_address(&req.address)?;
        let target: PciAddressSet = [addr].into_iter().collect();
        let opts = EnvOptions {
            pci_allowlist: target.backing_to_vmd_addresses(),
            enable_vmd: addr.is_vmd_backing_address(),
        };
        let _env = EnvGuard::init(self.nvme.as_ref(), &opts)
            .map_err(|e| Error::native(NativeOp::Init, addr, e))?;
        self.nvme
            .update(&addr, &req.image_path, req.slot)
            .map_err(|e| Error::native(NativeOp::FirmwareUpdate, addr, e))?;
        info!(self.log, "firmware updated";
            "ctrlr" => %addr, "slot" => req.slot);
        Ok(())
    }
}

// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! The Advanced Firmware Update object (33629): one firmware state machine
//! per partition, with linked and conflicting instances resolved across
//! them.

use super::package::{MAGIC_APP, MAGIC_BOOT, MAGIC_MODEM, MAGIC_TEE};
use super::persist::StateStore;
use super::sink::PackageSink;
use super::*;
use crate::lwm2m::exec_args;

/// Cancel (executable).
pub const AFU_CANCEL: u16 = 10;
/// Severity.
pub const AFU_SEVERITY: u16 = 11;
/// Last State Change Time.
pub const AFU_LAST_STATE_CHANGE: u16 = 12;
/// Maximum Defer Period.
pub const AFU_MAX_DEFER_PERIOD: u16 = 13;
/// Component Name.
pub const AFU_COMPONENT_NAME: u16 = 14;
/// Current Version.
pub const AFU_CURRENT_VERSION: u16 = 15;
/// Linked Instances.
pub const AFU_LINKED_INSTANCES: u16 = 16;
/// Conflicting Instances.
pub const AFU_CONFLICTING_INSTANCES: u16 = 17;

const AFU_RESOURCES: &[u16] = &[
    FW_PACKAGE,
    FW_PACKAGE_URI,
    FW_UPDATE,
    FW_STATE,
    FW_RESULT,
    FW_PKG_NAME,
    FW_PKG_VERSION,
    FW_PROTOCOL_SUPPORT,
    FW_DELIVERY_METHOD,
    AFU_CANCEL,
    AFU_SEVERITY,
    AFU_LAST_STATE_CHANGE,
    AFU_MAX_DEFER_PERIOD,
    AFU_COMPONENT_NAME,
    AFU_CURRENT_VERSION,
    AFU_LINKED_INSTANCES,
    AFU_CONFLICTING_INSTANCES,
];

/// Names and package magics of the usual four partitions, by instance id.
pub const DEFAULT_PARTITIONS: [(&str, [u8; 8]); 4] = [
    ("application", MAGIC_APP),
    ("tee", MAGIC_TEE),
    ("bootloader", MAGIC_BOOT),
    ("modem", MAGIC_MODEM),
];

/// One updatable partition.
#[derive(Debug)]
pub struct Partition {
    /// Component Name.
    pub name: String,
    /// Magic of packages for this partition.
    pub magic: [u8; 8],
    /// Version of the running image.
    pub current_version: String,
    /// Where its packages are stored.
    pub sink: Box<dyn PackageSink>,
    /// Where its state is persisted.
    pub store: Box<dyn StateStore>,
}

#[derive(Debug)]
struct Slot {
    name: String,
    current_version: String,
    fw: FwInstance,
}

/// The Advanced Firmware Update object.
#[derive(Debug)]
pub struct AdvancedFirmwareUpdate {
    slots: Vec<Slot>,
    handler: Box<dyn UpdateHandler>,
    restart_requested: bool,
}

impl AdvancedFirmwareUpdate {
    /// Creates one instance per partition, restoring persisted state.
    /// Instance 0 also accepts multi-packages.
    pub fn new(partitions: Vec<Partition>, handler: Box<dyn UpdateHandler>) -> Self {
        let slots = partitions
            .into_iter()
            .enumerate()
            .map(|(iid, p)| Slot {
                name: p.name,
                current_version: p.current_version,
                fw: FwInstance::open(
                    OID_ADVANCED_FIRMWARE_UPDATE,
                    iid as u16,
                    p.magic,
                    p.sink,
                    p.store,
                )
                .accept_multi(iid == 0),
            })
            .collect();
        let mut afu = AdvancedFirmwareUpdate {
            slots,
            handler,
            restart_requested: false,
        };
        afu.refresh_conflicts();
        afu
    }

    /// The state machine of instance `iid`.
    pub fn instance(&self, iid: u16) -> Option<&FwInstance> {
        self.slots.get(iid as usize).map(|s| &s.fw)
    }

    fn slot(&self, iid: u16) -> Result<&Slot, ResponseError> {
        self.slots.get(iid as usize).ok_or(ResponseError::NotFound)
    }

    fn fw_mut(&mut self, iid: u16) -> Result<&mut FwInstance, ResponseError> {
        self.slots
            .get_mut(iid as usize)
            .map(|s| &mut s.fw)
            .ok_or(ResponseError::NotFound)
    }

    fn families_match(&self, a: u16, b: u16) -> bool {
        match (self.instance(a), self.instance(b)) {
            (Some(a), Some(b)) => a.version_family() == b.version_family(),
            _ => false,
        }
    }

    fn is_ready_for(&self, iid: u16, waiter: u16) -> bool {
        self.instance(iid)
            .map(|fw| fw.state() == FwState::Downloaded)
            .unwrap_or(false)
            && self.families_match(iid, waiter)
    }

    /// Drops instances that became ready from every conflicting set.
    fn refresh_conflicts(&mut self) {
        for waiter in 0..self.slots.len() as u16 {
            let current = self.slots[waiter as usize].fw.conflicting().to_vec();
            if current.is_empty() {
                continue;
            }
            let remaining: Vec<u16> = current
                .iter()
                .copied()
                .filter(|c| !self.is_ready_for(*c, waiter))
                .collect();
            if remaining != current {
                debug!(
                    "/{}/{}: conflicting instances now {:?}",
                    OID_ADVANCED_FIRMWARE_UPDATE, waiter, remaining
                );
                self.slots[waiter as usize].fw.set_conflicting(remaining);
            }
        }
    }

    /// Hands out the parts of a multi-package that arrived at `iid`.
    fn distribute_multi(&mut self, iid: u16) {
        let parts = match self.slots.get_mut(iid as usize).and_then(|s| s.fw.take_multi()) {
            Some(parts) => parts,
            None => return,
        };

        let mut delivered_here = false;
        let mut delivered_any = false;
        for part in parts {
            let target = self
                .slots
                .iter()
                .position(|s| part.len() >= 8 && s.fw.magic()[..] == part[..8]);
            match target {
                Some(target) => {
                    info!(
                        "/{}/{}: sub-package of {} bytes",
                        OID_ADVANCED_FIRMWARE_UPDATE,
                        target,
                        part.len()
                    );
                    delivered_any = true;
                    delivered_here |= target == iid as usize;
                    if let Err(e) = self.slots[target].fw.accept_package(&part) {
                        warn!(
                            "/{}/{}: sub-package refused: {}",
                            OID_ADVANCED_FIRMWARE_UPDATE, target, e
                        );
                    }
                }
                None => warn!("multi-package part for no known partition"),
            }
        }

        if !delivered_here {
            let fw = &mut self.slots[iid as usize].fw;
            fw.reset_package(if delivered_any {
                FwResult::Initial
            } else {
                FwResult::UnsupportedPackageType
            });
        }
    }

    fn after_transfer(&mut self, iid: u16) {
        self.distribute_multi(iid);
        self.refresh_conflicts();
    }

    fn execute_update(
        &mut self,
        now: Instant,
        iid: u16,
        args: &[u8],
    ) -> Result<(), ResponseError> {
        let args = exec_args::parse(args)?;
        let mut targets = vec![iid];
        if let Some(arg) = exec_args::find(&args, 0) {
            let value = arg.value.as_deref().ok_or(ResponseError::BadRequest)?;
            for path in exec_args::parse_link_targets(value)? {
                match (path.len(), path.oid(), path.iid()) {
                    (2, Some(OID_ADVANCED_FIRMWARE_UPDATE), Some(target))
                        if (target as usize) < self.slots.len() =>
                    {
                        if !targets.contains(&target) {
                            targets.push(target);
                        }
                    }
                    _ => return Err(ResponseError::BadRequest),
                }
            }
        }

        if self.slot(iid)?.fw.state() != FwState::Downloaded {
            return Err(ResponseError::MethodNotAllowed);
        }

        let not_ready: Vec<u16> = targets
            .iter()
            .copied()
            .filter(|t| self.slots[*t as usize].fw.state() != FwState::Downloaded)
            .collect();
        if !not_ready.is_empty() {
            info!("update targets not downloaded: {:?}", not_ready);
            let fw = &mut self.slots[iid as usize].fw;
            fw.set_conflicting(not_ready);
            fw.latch_result(FwResult::ConflictingState);
            return Ok(());
        }

        // Linked instances join the update.
        let mut group = targets;
        let mut unmet = Vec::new();
        let mut i = 0;
        while i < group.len() {
            let member = group[i];
            for linked in self.slots[member as usize].fw.linked() {
                if !self.is_ready_for(linked, member) {
                    if !unmet.contains(&linked) {
                        unmet.push(linked);
                    }
                } else if !group.contains(&linked) {
                    group.push(linked);
                }
            }
            i += 1;
        }
        if !unmet.is_empty() {
            info!("linked instances not ready: {:?}", unmet);
            let fw = &mut self.slots[iid as usize].fw;
            fw.set_conflicting(unmet);
            fw.latch_result(FwResult::DependencyError);
            return Ok(());
        }

        let mut outcomes = Vec::with_capacity(group.len());
        for member in group.iter().copied() {
            let outcome = self.slots[member as usize]
                .fw
                .upgrade(now, self.handler.as_mut())?;
            outcomes.push((member, outcome));
        }

        if outcomes.iter().any(|(_, o)| *o == UpgradeOutcome::Failed) {
            for (member, outcome) in outcomes {
                if outcome == UpgradeOutcome::Failed {
                    self.slots[member as usize].fw.roll_back(FwResult::Failed);
                }
            }
            return Ok(());
        }

        for (member, outcome) in outcomes {
            let slot = &mut self.slots[member as usize];
            if outcome == UpgradeOutcome::Finished(true) {
                if let Some(version) = slot.fw.header().and_then(|h| h.package_version.clone()) {
                    slot.current_version = version;
                }
            }
            slot.fw.set_conflicting(Vec::new());
            slot.fw.apply_upgrade(now, outcome);
        }
        Ok(())
    }

    fn links(ids: &[u16]) -> ResourceValue {
        ResourceValue::Multiple(
            ids.iter()
                .enumerate()
                .map(|(riid, iid)| {
                    (
                        riid as u16,
                        Value::ObjLink(OID_ADVANCED_FIRMWARE_UPDATE, *iid),
                    )
                })
                .collect(),
        )
    }
}

impl UpdateObject for AdvancedFirmwareUpdate {
    fn oid(&self) -> u16 {
        OID_ADVANCED_FIRMWARE_UPDATE
    }

    fn instances(&self) -> Vec<u16> {
        (0..self.slots.len() as u16).collect()
    }

    fn resources(&self, _iid: u16) -> Vec<u16> {
        AFU_RESOURCES.to_vec()
    }

    fn kind(&self, rid: u16) -> Result<ValueKind, ResponseError> {
        match rid {
            FW_PACKAGE => Ok(ValueKind::Opaque),
            FW_PACKAGE_URI => Ok(ValueKind::String),
            AFU_SEVERITY => Ok(ValueKind::Integer),
            AFU_MAX_DEFER_PERIOD => Ok(ValueKind::Unsigned),
            x if AFU_RESOURCES.contains(&x) => Err(ResponseError::MethodNotAllowed),
            _ => Err(ResponseError::NotFound),
        }
    }

    fn is_executable(&self, rid: u16) -> bool {
        rid == FW_UPDATE || rid == AFU_CANCEL
    }

    fn package_rid(&self) -> u16 {
        FW_PACKAGE
    }

    fn read(&self, iid: u16, rid: u16) -> Result<ResourceValue, ResponseError> {
        let slot = self.slot(iid)?;
        Ok(match rid {
            AFU_CANCEL => return Err(ResponseError::MethodNotAllowed),
            AFU_SEVERITY => Value::Integer(slot.fw.severity().as_i64()).into(),
            AFU_LAST_STATE_CHANGE => Value::Time(slot.fw.last_state_change()).into(),
            AFU_MAX_DEFER_PERIOD => Value::Unsigned(slot.fw.max_defer_period().into()).into(),
            AFU_COMPONENT_NAME => Value::from(slot.name.as_str()).into(),
            AFU_CURRENT_VERSION => Value::from(slot.current_version.as_str()).into(),
            AFU_LINKED_INSTANCES => Self::links(&slot.fw.linked()),
            AFU_CONFLICTING_INSTANCES => Self::links(slot.fw.conflicting()),
            _ => return slot.fw.read(rid),
        })
    }

    fn write(
        &mut self,
        _now: Instant,
        iid: u16,
        rid: u16,
        value: &Value,
    ) -> Result<(), ResponseError> {
        let fw = self.fw_mut(iid)?;
        match (rid, value) {
            (FW_PACKAGE_URI, Value::String(uri)) => fw.write_uri(uri)?,
            (FW_PACKAGE, Value::Opaque(bytes)) => fw.write_package(0, bytes, true)?,
            (AFU_SEVERITY, Value::Integer(x)) => {
                fw.set_severity(Severity::from_i64(*x).ok_or(ResponseError::BadRequest)?)
            }
            (AFU_MAX_DEFER_PERIOD, Value::Unsigned(x)) => {
                fw.set_max_defer_period(u32::try_from(*x).map_err(|_| ResponseError::BadRequest)?)
            }
            (AFU_MAX_DEFER_PERIOD, Value::Integer(x)) => {
                fw.set_max_defer_period(u32::try_from(*x).map_err(|_| ResponseError::BadRequest)?)
            }
            (FW_PACKAGE_URI, _)
            | (FW_PACKAGE, _)
            | (AFU_SEVERITY, _)
            | (AFU_MAX_DEFER_PERIOD, _) => return Err(ResponseError::BadRequest),
            _ => return self.kind(rid).map(|_| ()),
        }
        self.after_transfer(iid);
        Ok(())
    }

    fn write_package(
        &mut self,
        _now: Instant,
        iid: u16,
        offset: usize,
        chunk: &[u8],
        last: bool,
    ) -> Result<(), ResponseError> {
        let result = self.fw_mut(iid)?.write_package(offset, chunk, last);
        self.after_transfer(iid);
        result
    }

    fn execute(
        &mut self,
        now: Instant,
        iid: u16,
        rid: u16,
        args: &[u8],
    ) -> Result<(), ResponseError> {
        self.slot(iid)?;
        match rid {
            FW_UPDATE => self.execute_update(now, iid, args),
            AFU_CANCEL => {
                self.fw_mut(iid)?.cancel()?;
                self.refresh_conflicts();
                Ok(())
            }
            x if AFU_RESOURCES.contains(&x) => Err(ResponseError::MethodNotAllowed),
            _ => Err(ResponseError::NotFound),
        }
    }

    fn download_event(
        &mut self,
        _now: Instant,
        iid: u16,
        session: DownloadSession,
        event: DownloadEvent,
    ) {
        if let Ok(fw) = self.fw_mut(iid) {
            fw.download_event(session, event);
            self.after_transfer(iid);
        }
    }

    fn suspend_download(&mut self, iid: u16) -> bool {
        self.fw_mut(iid).map(|fw| fw.suspend_download()).unwrap_or(false)
    }

    fn resume_download(&mut self, iid: u16) -> bool {
        self.fw_mut(iid).map(|fw| fw.resume_download()).unwrap_or(false)
    }

    fn download_offset(&self, iid: u16) -> Option<u64> {
        self.instance(iid).map(FwInstance::offset)
    }

    fn update_deadline(&self, iid: u16) -> Option<Instant> {
        self.instance(iid).and_then(FwInstance::deadline)
    }

    fn relocate_package(&mut self, iid: u16, path: &std::path::Path) -> bool {
        match self.slots.get_mut(iid as usize) {
            Some(slot) => slot.fw.relocate_package(path),
            None => false,
        }
    }

    fn enter_offline(&mut self) {
        self.slots.iter_mut().for_each(|s| s.fw.enter_offline());
    }

    fn exit_offline(&mut self) {
        self.slots.iter_mut().for_each(|s| s.fw.exit_offline());
    }

    fn on_registered(&mut self, now: Instant) {
        self.slots.iter_mut().for_each(|s| s.fw.on_registered(now));
    }

    fn reset(&mut self, _now: Instant) {
        self.slots
            .iter_mut()
            .for_each(|s| s.fw.reset_package(FwResult::Initial));
    }

    fn poll_action(&mut self) -> Option<UpdateAction> {
        for slot in self.slots.iter_mut() {
            while let Some(action) = slot.fw.poll_action() {
                if action == UpdateAction::Restart {
                    if self.restart_requested {
                        continue;
                    }
                    self.restart_requested = true;
                }
                return Some(action);
            }
        }
        None
    }

    fn poll_timeout(&self) -> Option<Instant> {
        self.slots.iter().filter_map(|s| s.fw.poll_timeout()).min()
    }

    fn handle_timeout(&mut self, now: Instant) {
        self.slots.iter_mut().for_each(|s| s.fw.handle_timeout(now));
        self.refresh_conflicts();
    }
}

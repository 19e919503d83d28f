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

//! The set of objects the client serves, and the encodings of reads and
//! writes that span several resources.

use super::*;
use crate::lwm2m::tlv::{self, TlvEntry, TlvKind};
use crate::lwm2m::{senml, ObjectEntry};
use crate::observe::{DataModel, ReadValue};

/// The Device object plus the update objects, keyed by object id.
#[derive(Debug)]
pub struct Objects {
    device: Device,
    updates: Vec<Box<dyn UpdateObject>>,
}

fn is_single_format(format: ContentFormat) -> bool {
    matches!(
        format.canonical(),
        ContentFormat::TEXT_PLAIN | ContentFormat::APPLICATION_OCTET_STREAM
    )
}

/// Converts a value decoded without type information, as SenML yields, to
/// the declared kind of the resource.
fn coerce(value: Value, kind: ValueKind) -> Result<Value, ResponseError> {
    if value.kind() == kind {
        return Ok(value);
    }
    match value.to_text() {
        Some(text) => Value::from_text(kind, &text),
        None => Err(ResponseError::BadRequest),
    }
}

impl Objects {
    /// Creates the set with only the Device object.
    pub fn new(device: Device) -> Objects {
        Objects {
            device,
            updates: Vec::new(),
        }
    }

    /// Adds an update object, replacing one with the same object id.
    pub fn with_object(mut self, object: Box<dyn UpdateObject>) -> Objects {
        self.updates.retain(|o| o.oid() != object.oid());
        self.updates.push(object);
        self.updates.sort_by_key(|o| o.oid());
        self
    }

    /// The Device object.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The Device object, mutably.
    pub fn device_mut(&mut self) -> &mut Device {
        &mut self.device
    }

    /// The update object with id `oid`.
    pub fn update(&self, oid: u16) -> Option<&dyn UpdateObject> {
        self.updates
            .iter()
            .find(|o| o.oid() == oid)
            .map(|o| o.as_ref())
    }

    /// The update object with id `oid`, mutably.
    pub fn update_mut(&mut self, oid: u16) -> Option<&mut Box<dyn UpdateObject>> {
        self.updates.iter_mut().find(|o| o.oid() == oid)
    }

    /// Every update object.
    pub fn updates_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn UpdateObject>> {
        self.updates.iter_mut()
    }

    /// Every update object.
    pub fn updates(&self) -> impl Iterator<Item = &dyn UpdateObject> {
        self.updates.iter().map(|o| o.as_ref())
    }

    /// Object ids, ascending.
    pub fn oids(&self) -> Vec<u16> {
        let mut oids: Vec<u16> = self.updates.iter().map(|o| o.oid()).collect();
        oids.push(OID_DEVICE);
        oids.sort_unstable();
        oids
    }

    /// The Register inventory.
    pub fn entries(&self) -> Vec<ObjectEntry> {
        self.oids()
            .into_iter()
            .map(|oid| ObjectEntry {
                oid,
                version: None,
                instances: self.instances(oid).unwrap_or_default(),
            })
            .collect()
    }

    /// Instance ids of object `oid`.
    pub fn instances(&self, oid: u16) -> Option<Vec<u16>> {
        if oid == OID_DEVICE {
            return Some(vec![0]);
        }
        self.update(oid).map(|o| o.instances())
    }

    /// Resource ids of `/oid/iid`.
    pub fn resources(&self, oid: u16, iid: u16) -> Result<Vec<u16>, ResponseError> {
        let instances = self.instances(oid).ok_or(ResponseError::NotFound)?;
        if !instances.contains(&iid) {
            return Err(ResponseError::NotFound);
        }
        if oid == OID_DEVICE {
            return Ok(self.device.resources());
        }
        self.update(oid)
            .map(|o| o.resources(iid))
            .ok_or(ResponseError::NotFound)
    }

    /// True if `path` names an existing object, instance or resource.
    pub fn exists(&self, path: &Lwm2mPath) -> bool {
        match (path.oid(), path.iid(), path.rid()) {
            (None, ..) => true,
            (Some(oid), None, _) => self.instances(oid).is_some(),
            (Some(oid), Some(iid), None) => self.resources(oid, iid).is_ok(),
            (Some(oid), Some(iid), Some(rid)) => self
                .resources(oid, iid)
                .map(|r| r.contains(&rid))
                .unwrap_or(false),
        }
    }

    /// Declared kind of a writable resource.
    pub fn kind(&self, oid: u16, rid: u16) -> Result<ValueKind, ResponseError> {
        if oid == OID_DEVICE {
            return self.device.kind(rid);
        }
        self.update(oid)
            .ok_or(ResponseError::NotFound)?
            .kind(rid)
    }

    /// True for executable resources.
    pub fn is_executable(&self, oid: u16, rid: u16) -> bool {
        if oid == OID_DEVICE {
            return self.device.is_executable(rid);
        }
        self.update(oid)
            .map(|o| o.is_executable(rid))
            .unwrap_or(false)
    }

    /// The package resource of update object `oid`.
    pub fn package_rid(&self, oid: u16) -> Option<u16> {
        self.update(oid).map(|o| o.package_rid())
    }

    /// Reads one resource.
    pub fn read_resource(
        &self,
        oid: u16,
        iid: u16,
        rid: u16,
    ) -> Result<ResourceValue, ResponseError> {
        if !self.resources(oid, iid)?.contains(&rid) {
            return Err(ResponseError::NotFound);
        }
        if oid == OID_DEVICE {
            return self.device.read(rid);
        }
        self.update(oid)
            .ok_or(ResponseError::NotFound)?
            .read(iid, rid)
    }

    fn readable(&self, oid: u16, iid: u16) -> Result<Vec<(u16, ResourceValue)>, ResponseError> {
        let mut out = Vec::new();
        for rid in self.resources(oid, iid)? {
            match self.read_resource(oid, iid, rid) {
                Ok(value) => out.push((rid, value)),
                Err(ResponseError::MethodNotAllowed) | Err(ResponseError::NotFound) => (),
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Reads every value under `path`, each with its full path.
    pub fn read_values(&self, path: &Lwm2mPath) -> Result<Vec<(Lwm2mPath, Value)>, ResponseError> {
        let oid = path.oid().ok_or(ResponseError::MethodNotAllowed)?;
        let iids = match path.iid() {
            Some(iid) => vec![iid],
            None => self.instances(oid).ok_or(ResponseError::NotFound)?,
        };

        let mut out = Vec::new();
        for iid in iids {
            let resources = match path.rid() {
                Some(rid) => vec![(rid, self.read_resource(oid, iid, rid)?)],
                None => self.readable(oid, iid)?,
            };
            for (rid, value) in resources {
                match value {
                    ResourceValue::Single(value) => {
                        if path.riid().is_some() {
                            return Err(ResponseError::BadRequest);
                        }
                        out.push((Lwm2mPath::resource(oid, iid, rid), value));
                    }
                    ResourceValue::Multiple(values) => {
                        for (riid, value) in values {
                            if path.riid().map(|x| x == riid).unwrap_or(true) {
                                out.push((Lwm2mPath::resource_instance(oid, iid, rid, riid), value));
                            }
                        }
                    }
                }
            }
        }

        if path.riid().is_some() && out.is_empty() {
            return Err(ResponseError::NotFound);
        }
        Ok(out)
    }

    fn resource_tlv(rid: u16, value: &ResourceValue) -> TlvEntry {
        match value {
            ResourceValue::Single(value) => TlvEntry::resource(rid, value),
            ResourceValue::Multiple(values) => {
                let children: Vec<TlvEntry> = values
                    .iter()
                    .map(|(riid, value)| TlvEntry {
                        kind: TlvKind::ResourceInstance,
                        id: *riid,
                        payload: tlv::encode_value(value),
                    })
                    .collect();
                TlvEntry::container(TlvKind::MultipleResource, rid, &children)
            }
        }
    }

    fn read_tlv(&self, path: &Lwm2mPath) -> Result<Vec<TlvEntry>, ResponseError> {
        let oid = path.oid().ok_or(ResponseError::MethodNotAllowed)?;
        let instance_entries = |iid: u16| -> Result<Vec<TlvEntry>, ResponseError> {
            Ok(self
                .readable(oid, iid)?
                .iter()
                .map(|(rid, value)| Self::resource_tlv(*rid, value))
                .collect())
        };

        match (path.iid(), path.rid(), path.riid()) {
            (None, ..) => self
                .instances(oid)
                .ok_or(ResponseError::NotFound)?
                .into_iter()
                .map(|iid| {
                    Ok(TlvEntry::container(
                        TlvKind::ObjectInstance,
                        iid,
                        &instance_entries(iid)?,
                    ))
                })
                .collect(),
            (Some(iid), None, _) => instance_entries(iid),
            (Some(iid), Some(rid), None) => {
                Ok(vec![Self::resource_tlv(rid, &self.read_resource(oid, iid, rid)?)])
            }
            (Some(_), Some(_), Some(riid)) => {
                let values = self.read_values(path)?;
                Ok(values
                    .iter()
                    .map(|(_, value)| TlvEntry {
                        kind: TlvKind::ResourceInstance,
                        id: riid,
                        payload: tlv::encode_value(value),
                    })
                    .collect())
            }
        }
    }

    /// Reads `path` encoded as `accept`, or in the natural format of the
    /// path: plain text (octet stream for opaque values) for one value, TLV
    /// otherwise.
    pub fn read_encoded(
        &self,
        path: &Lwm2mPath,
        accept: Option<ContentFormat>,
    ) -> Result<ReadValue, ResponseError> {
        let values = self.read_values(path)?;
        let single = match values.as_slice() {
            [(p, value)] if p.len() == path.len() => Some(value),
            _ => None,
        };

        let format = match (accept, single) {
            (Some(format), _) => format,
            (None, Some(Value::Opaque(_))) => ContentFormat::APPLICATION_OCTET_STREAM,
            (None, Some(_)) => ContentFormat::TEXT_PLAIN,
            (None, None) => ContentFormat::LWM2M_TLV,
        };

        let payload = match format.canonical() {
            f if is_single_format(f) => single.ok_or(ResponseError::NotAcceptable)?.to_payload(f)?,
            ContentFormat::LWM2M_TLV => tlv::encode(&self.read_tlv(path)?),
            ContentFormat::APPLICATION_SENML_JSON => {
                senml::encode_json(&senml::records_for(*path, &values, None))
            }
            ContentFormat::APPLICATION_SENML_CBOR => {
                senml::encode_cbor(&senml::records_for(*path, &values, None))?
            }
            _ => return Err(ResponseError::NotAcceptable),
        };

        Ok(ReadValue {
            format,
            payload,
            numeric: single.and_then(Value::as_f64),
        })
    }

    /// Writes one resource other than a package.
    pub fn write_resource(
        &mut self,
        now: Instant,
        oid: u16,
        iid: u16,
        rid: u16,
        value: &Value,
    ) -> Result<(), ResponseError> {
        if !self.resources(oid, iid)?.contains(&rid) {
            return Err(ResponseError::NotFound);
        }
        if oid == OID_DEVICE {
            return self.device.write(rid, value);
        }
        self.update_mut(oid)
            .ok_or(ResponseError::NotFound)?
            .write(now, iid, rid, value)
    }

    /// Writes a whole package in one piece.
    pub fn write_package(
        &mut self,
        now: Instant,
        oid: u16,
        iid: u16,
        offset: usize,
        chunk: &[u8],
        last: bool,
    ) -> Result<(), ResponseError> {
        self.update_mut(oid)
            .ok_or(ResponseError::MethodNotAllowed)?
            .write_package(now, iid, offset, chunk, last)
    }

    fn write_value(
        &mut self,
        now: Instant,
        oid: u16,
        iid: u16,
        rid: u16,
        value: Value,
    ) -> Result<(), ResponseError> {
        if self.package_rid(oid) == Some(rid) {
            return match value {
                Value::Opaque(bytes) => self.write_package(now, oid, iid, 0, &bytes, true),
                _ => Err(ResponseError::BadRequest),
            };
        }
        let value = coerce(value, self.kind(oid, rid)?)?;
        self.write_resource(now, oid, iid, rid, &value)
    }

    /// Writes a payload that may carry several resources to `path`, an
    /// instance or a resource.
    pub fn write_payload(
        &mut self,
        now: Instant,
        path: &Lwm2mPath,
        format: ContentFormat,
        payload: &[u8],
    ) -> Result<(), ResponseError> {
        let (oid, iid) = match (path.oid(), path.iid()) {
            (Some(oid), Some(iid)) => (oid, iid),
            _ => return Err(ResponseError::MethodNotAllowed),
        };
        self.resources(oid, iid)?;

        match format.canonical() {
            ContentFormat::LWM2M_TLV => {
                let mut entries = tlv::decode(payload)?;
                if let [entry] = entries.as_slice() {
                    if entry.kind == TlvKind::ObjectInstance {
                        if entry.id != iid {
                            return Err(ResponseError::BadRequest);
                        }
                        entries = entry.children()?;
                    }
                }
                for entry in entries {
                    if entry.kind != TlvKind::Resource || path.rid().map(|r| r != entry.id).unwrap_or(false) {
                        return Err(ResponseError::BadRequest);
                    }
                    let value = if self.package_rid(oid) == Some(entry.id) {
                        Value::Opaque(entry.payload)
                    } else {
                        tlv::decode_value(self.kind(oid, entry.id)?, &entry.payload)?
                    };
                    self.write_value(now, oid, iid, entry.id, value)?;
                }
                Ok(())
            }
            ContentFormat::APPLICATION_SENML_JSON | ContentFormat::APPLICATION_SENML_CBOR => {
                let records = if format.canonical() == ContentFormat::APPLICATION_SENML_JSON {
                    senml::decode_json(payload)?
                } else {
                    senml::decode_cbor(payload)?
                };
                for record in senml::resolve(&records)? {
                    let rid = match record.path.rid() {
                        Some(rid) if path.is_prefix_of(&record.path) => rid,
                        _ => return Err(ResponseError::BadRequest),
                    };
                    let value = record.value.ok_or(ResponseError::BadRequest)?;
                    self.write_value(now, oid, iid, rid, value)?;
                }
                Ok(())
            }
            _ => {
                let rid = path.rid().ok_or(ResponseError::UnsupportedContentFormat)?;
                let kind = if self.package_rid(oid) == Some(rid) {
                    ValueKind::Opaque
                } else {
                    self.kind(oid, rid)?
                };
                let value = Value::from_payload(kind, format, payload)?;
                self.write_value(now, oid, iid, rid, value)
            }
        }
    }

    /// Executes a resource.
    pub fn execute(
        &mut self,
        now: Instant,
        oid: u16,
        iid: u16,
        rid: u16,
        args: &[u8],
    ) -> Result<(), ResponseError> {
        if !self.resources(oid, iid)?.contains(&rid) {
            return Err(ResponseError::NotFound);
        }
        if !self.is_executable(oid, rid) {
            return Err(ResponseError::MethodNotAllowed);
        }
        if oid == OID_DEVICE {
            return self.device.execute(rid);
        }
        self.update_mut(oid)
            .ok_or(ResponseError::NotFound)?
            .execute(now, iid, rid, args)
    }
}

impl DataModel for Objects {
    fn read(
        &self,
        path: &Lwm2mPath,
        accept: Option<ContentFormat>,
    ) -> Result<ReadValue, ResponseError> {
        self.read_encoded(path, accept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceInfo;
    use crate::update::persist::MemoryStore;
    use crate::update::sink::MemorySink;
    use crate::update::{FirmwareUpdate, PackageInstaller};

    fn objects() -> Objects {
        Objects::new(Device::new(DeviceInfo::default(), "U")).with_object(Box::new(
            FirmwareUpdate::new(
                Box::new(MemorySink::new()),
                Box::new(MemoryStore::new()),
                Box::new(PackageInstaller::new()),
            ),
        ))
    }

    #[test]
    fn single_resource_formats() {
        let objects = objects();
        let path = Lwm2mPath::resource(3, 0, 0);

        let text = objects.read_encoded(&path, None).unwrap();
        assert_eq!(ContentFormat::TEXT_PLAIN, text.format);
        assert_eq!(b"0023C7".to_vec(), text.payload);

        let tlv = objects
            .read_encoded(&path, Some(ContentFormat::LWM2M_TLV))
            .unwrap();
        assert_eq!(
            vec![0xC6, 0x00, b'0', b'0', b'2', b'3', b'C', b'7'],
            tlv.payload
        );

        assert_eq!(
            Err(ResponseError::NotAcceptable),
            objects.read_encoded(&path, Some(ContentFormat::APPLICATION_LINK_FORMAT))
        );
    }

    #[test]
    fn multiple_resource_reads() {
        let objects = objects();
        let voltage = Lwm2mPath::resource(3, 0, 7);

        let read = objects.read_encoded(&voltage, None).unwrap();
        assert_eq!(ContentFormat::LWM2M_TLV, read.format);
        assert_eq!(vec![0x84, 0x07, 0x42, 0x00, 0x0E, 0xD8], read.payload);
        assert_eq!(None, read.numeric);

        let one = objects
            .read_encoded(&Lwm2mPath::resource_instance(3, 0, 7, 0), None)
            .unwrap();
        assert_eq!(b"3800".to_vec(), one.payload);
        assert_eq!(Some(3800.0), one.numeric);

        assert_eq!(
            Err(ResponseError::NotFound),
            objects.read_encoded(&Lwm2mPath::resource_instance(3, 0, 7, 9), None)
        );
    }

    #[test]
    fn instance_read_as_senml() {
        let objects = objects();
        let read = objects
            .read_encoded(
                &Lwm2mPath::instance(5, 0),
                Some(ContentFormat::APPLICATION_SENML_JSON),
            )
            .unwrap();
        let records = senml::resolve(&senml::decode_json(&read.payload).unwrap()).unwrap();
        let state = records
            .iter()
            .find(|r| r.path == Lwm2mPath::resource(5, 0, 3))
            .unwrap();
        assert_eq!(Some(Value::Integer(0)), state.value);
        assert!(records.iter().all(|r| r.path.rid() != Some(0)));
    }

    #[test]
    fn writes() {
        let mut objects = objects();
        let now = Instant::now();

        objects
            .write_payload(
                now,
                &Lwm2mPath::resource(3, 0, 13),
                ContentFormat::TEXT_PLAIN,
                b"1000000000",
            )
            .unwrap();
        assert_eq!(
            Err(ResponseError::MethodNotAllowed),
            objects.write_payload(
                now,
                &Lwm2mPath::resource(3, 0, 0),
                ContentFormat::TEXT_PLAIN,
                b"x"
            )
        );
        assert_eq!(
            Err(ResponseError::NotFound),
            objects.write_payload(
                now,
                &Lwm2mPath::resource(3, 1, 13),
                ContentFormat::TEXT_PLAIN,
                b"0"
            )
        );

        let payload = tlv::encode(&[TlvEntry::resource(1, &Value::from("coap://[::1]:5683/fw"))]);
        objects
            .write_payload(now, &Lwm2mPath::instance(5, 0), ContentFormat::LWM2M_TLV, &payload)
            .unwrap();
        assert_eq!(
            ResourceValue::Single(Value::from("coap://[::1]:5683/fw")),
            objects.read_resource(5, 0, 1).unwrap()
        );
    }

    #[test]
    fn execute_checks() {
        let mut objects = objects();
        let now = Instant::now();
        assert_eq!(
            Err(ResponseError::MethodNotAllowed),
            objects.execute(now, 3, 0, 0, b"")
        );
        assert_eq!(Err(ResponseError::NotFound), objects.execute(now, 4, 0, 0, b""));
        objects.execute(now, 3, 0, 4, b"").unwrap();
        assert!(objects.device_mut().take_reboot());
    }

    #[test]
    fn inventory() {
        let entries = objects().entries();
        assert_eq!(vec![3, 5], entries.iter().map(|e| e.oid).collect::<Vec<_>>());
        assert_eq!(vec![0], entries[1].instances);
    }
}

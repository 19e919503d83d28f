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

//! The Device object, `/3/0`.

use super::*;
use crate::config::DeviceInfo;
use crate::update::unix_now;

/// Manufacturer.
pub const DEV_MANUFACTURER: u16 = 0;
/// Model number.
pub const DEV_MODEL_NUMBER: u16 = 1;
/// Serial number.
pub const DEV_SERIAL_NUMBER: u16 = 2;
/// Firmware version.
pub const DEV_FIRMWARE_VERSION: u16 = 3;
/// Reboot.
pub const DEV_REBOOT: u16 = 4;
/// Available power sources.
pub const DEV_POWER_SOURCES: u16 = 6;
/// Power source voltage.
pub const DEV_POWER_SOURCE_VOLTAGE: u16 = 7;
/// Error code.
pub const DEV_ERROR_CODE: u16 = 11;
/// Current time.
pub const DEV_CURRENT_TIME: u16 = 13;
/// Supported binding and modes.
pub const DEV_SUPPORTED_BINDING: u16 = 16;

const DEV_RESOURCES: &[u16] = &[
    DEV_MANUFACTURER,
    DEV_MODEL_NUMBER,
    DEV_SERIAL_NUMBER,
    DEV_FIRMWARE_VERSION,
    DEV_REBOOT,
    DEV_POWER_SOURCES,
    DEV_POWER_SOURCE_VOLTAGE,
    DEV_ERROR_CODE,
    DEV_CURRENT_TIME,
    DEV_SUPPORTED_BINDING,
];

/// The Device object. Values are fixed at construction, except the
/// current time, which follows the system clock shifted by whatever the
/// server last wrote.
#[derive(Debug, Clone)]
pub struct Device {
    info: DeviceInfo,
    binding: String,
    time_offset: i64,
    reboot_requested: bool,
}

impl Device {
    /// Creates the object.
    pub fn new(info: DeviceInfo, binding: &str) -> Device {
        Device {
            info,
            binding: binding.to_string(),
            time_offset: 0,
            reboot_requested: false,
        }
    }

    /// Changes a power source voltage, as a sensor would.
    pub fn set_voltage(&mut self, riid: usize, millivolts: i64) -> Option<Lwm2mPath> {
        let slot = self.info.power_source_voltage.get_mut(riid)?;
        if *slot == millivolts {
            return None;
        }
        *slot = millivolts;
        Some(Lwm2mPath::resource(OID_DEVICE, 0, DEV_POWER_SOURCE_VOLTAGE))
    }

    /// True once after the Reboot resource was executed.
    pub fn take_reboot(&mut self) -> bool {
        std::mem::replace(&mut self.reboot_requested, false)
    }

    pub(crate) fn resources(&self) -> Vec<u16> {
        DEV_RESOURCES.to_vec()
    }

    pub(crate) fn is_executable(&self, rid: u16) -> bool {
        rid == DEV_REBOOT
    }

    pub(crate) fn kind(&self, rid: u16) -> Result<ValueKind, ResponseError> {
        match rid {
            DEV_CURRENT_TIME => Ok(ValueKind::Time),
            rid if DEV_RESOURCES.contains(&rid) => Err(ResponseError::MethodNotAllowed),
            _ => Err(ResponseError::NotFound),
        }
    }

    pub(crate) fn read(&self, rid: u16) -> Result<ResourceValue, ResponseError> {
        let multiple = |values: &[i64]| {
            ResourceValue::Multiple(
                values
                    .iter()
                    .enumerate()
                    .map(|(riid, x)| (riid as u16, Value::Integer(*x)))
                    .collect(),
            )
        };
        Ok(match rid {
            DEV_MANUFACTURER => Value::from(self.info.manufacturer.as_str()).into(),
            DEV_MODEL_NUMBER => Value::from(self.info.model_number.as_str()).into(),
            DEV_SERIAL_NUMBER => Value::from(self.info.serial_number.as_str()).into(),
            DEV_FIRMWARE_VERSION => Value::from(self.info.firmware_version.as_str()).into(),
            // DC power.
            DEV_POWER_SOURCES => multiple(&vec![0; self.info.power_source_voltage.len()][..]),
            DEV_POWER_SOURCE_VOLTAGE => multiple(&self.info.power_source_voltage[..]),
            DEV_ERROR_CODE => multiple(&[0][..]),
            DEV_CURRENT_TIME => Value::Time(unix_now() + self.time_offset).into(),
            DEV_SUPPORTED_BINDING => Value::from(self.binding.as_str()).into(),
            DEV_REBOOT => return Err(ResponseError::MethodNotAllowed),
            _ => return Err(ResponseError::NotFound),
        })
    }

    pub(crate) fn write(&mut self, rid: u16, value: &Value) -> Result<(), ResponseError> {
        match (rid, value) {
            (DEV_CURRENT_TIME, Value::Time(t)) | (DEV_CURRENT_TIME, Value::Integer(t)) => {
                self.time_offset = t - unix_now();
                Ok(())
            }
            _ => Err(self.kind(rid).err().unwrap_or(ResponseError::BadRequest)),
        }
    }

    pub(crate) fn execute(&mut self, rid: u16) -> Result<(), ResponseError> {
        match rid {
            DEV_REBOOT => {
                info!("reboot requested");
                self.reboot_requested = true;
                Ok(())
            }
            rid if DEV_RESOURCES.contains(&rid) => Err(ResponseError::MethodNotAllowed),
            _ => Err(ResponseError::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device::new(DeviceInfo::default(), "U")
    }

    #[test]
    fn reads() {
        let dev = device();
        assert_eq!(
            ResourceValue::Single(Value::from("0023C7")),
            dev.read(DEV_MANUFACTURER).unwrap()
        );
        assert_eq!(
            ResourceValue::Multiple(vec![(0, Value::Integer(3800))]),
            dev.read(DEV_POWER_SOURCE_VOLTAGE).unwrap()
        );
        assert_eq!(Err(ResponseError::MethodNotAllowed), dev.read(DEV_REBOOT));
        assert_eq!(Err(ResponseError::NotFound), dev.read(5));
    }

    #[test]
    fn current_time_write() {
        let mut dev = device();
        dev.write(DEV_CURRENT_TIME, &Value::Time(1_000_000_000)).unwrap();
        match dev.read(DEV_CURRENT_TIME).unwrap() {
            ResourceValue::Single(Value::Time(t)) => assert!((1_000_000_000..1_000_000_010).contains(&t)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            Err(ResponseError::MethodNotAllowed),
            dev.write(DEV_MANUFACTURER, &Value::from("x"))
        );
    }

    #[test]
    fn reboot_and_voltage() {
        let mut dev = device();
        assert_eq!(Err(ResponseError::MethodNotAllowed), dev.execute(DEV_MANUFACTURER));
        dev.execute(DEV_REBOOT).unwrap();
        assert!(dev.take_reboot());
        assert!(!dev.take_reboot());

        assert_eq!(None, dev.set_voltage(0, 3800));
        assert_eq!(
            Some(Lwm2mPath::resource(3, 0, 7)),
            dev.set_voltage(0, 3700)
        );
        assert_eq!(None, dev.set_voltage(5, 3700));
    }
}

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

use super::*;
use std::collections::HashMap;
use std::str::FromStr;

/// Notification attributes attached to one path.
///
/// Every field is optional; an absent field inherits from the enclosing
/// path, and finally from the observer's [`NotificationDefaults`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Attributes {
    /// Minimum period between notifications, in seconds.
    pub pmin: Option<u32>,
    /// Maximum period between notifications, in seconds.
    pub pmax: Option<u32>,
    /// Minimum evaluation period, in seconds.
    pub epmin: Option<u32>,
    /// Maximum evaluation period, in seconds.
    pub epmax: Option<u32>,
    /// Less-than threshold.
    pub lt: Option<f64>,
    /// Greater-than threshold.
    pub gt: Option<f64>,
    /// Step.
    pub st: Option<f64>,
    /// Confirmable notifications.
    pub con: Option<bool>,
}

impl Attributes {
    /// Fills every absent field from `parent`.
    pub fn inherit(self, parent: &Attributes) -> Attributes {
        Attributes {
            pmin: self.pmin.or(parent.pmin),
            pmax: self.pmax.or(parent.pmax),
            epmin: self.epmin.or(parent.epmin),
            epmax: self.epmax.or(parent.epmax),
            lt: self.lt.or(parent.lt),
            gt: self.gt.or(parent.gt),
            st: self.st.or(parent.st),
            con: self.con.or(parent.con),
        }
    }

    /// True if no field is set.
    pub fn is_empty(&self) -> bool {
        *self == Attributes::default()
    }

    /// Checks the numeric attributes for consistency.
    pub fn validate(&self) -> Result<(), ResponseError> {
        if let Some(st) = self.st {
            if st < 0.0 {
                return Err(ResponseError::BadRequest);
            }
        }
        if let (Some(lt), Some(gt)) = (self.lt, self.gt) {
            if lt >= gt {
                return Err(ResponseError::BadRequest);
            }
            if let Some(st) = self.st {
                if lt + 2.0 * st >= gt {
                    return Err(ResponseError::BadRequest);
                }
            }
        }
        Ok(())
    }

    /// The pmax that schedules notifications, if any. Zero, or a pmax below
    /// pmin, schedules none.
    pub fn scheduled_pmax(&self) -> Option<u32> {
        match self.pmax {
            Some(0) | None => None,
            Some(pmax) if pmax < self.pmin.unwrap_or(0) => None,
            pmax => pmax,
        }
    }

    /// True if moving from `last` to `current` satisfies the `lt`, `gt` and
    /// `st` conditions. With none of them set every change qualifies.
    pub fn threshold_crossed(&self, last: Option<f64>, current: f64) -> bool {
        if self.lt.is_none() && self.gt.is_none() && self.st.is_none() {
            return true;
        }
        let last = match last {
            Some(last) => last,
            None => return true,
        };

        if let Some(lt) = self.lt {
            if (last < lt) != (current < lt) {
                return true;
            }
        }
        if let Some(gt) = self.gt {
            if (last > gt) != (current > gt) {
                return true;
            }
        }
        if let Some(st) = self.st {
            if (current - last).abs() >= st {
                return true;
            }
        }
        false
    }
}

/// Server-level defaults, from the Server object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationDefaults {
    /// Default minimum period.
    pub pmin: u32,
    /// Default maximum period; `None` schedules nothing.
    pub pmax: Option<u32>,
    /// Whether notifications are stored while offline.
    pub storing: bool,
}

impl Default for NotificationDefaults {
    fn default() -> Self {
        NotificationDefaults {
            pmin: 0,
            pmax: None,
            storing: true,
        }
    }
}

impl NotificationDefaults {
    fn as_attributes(&self) -> Attributes {
        Attributes {
            pmin: Some(self.pmin),
            pmax: self.pmax,
            ..Default::default()
        }
    }
}

/// A Write-Attributes request. For each field, `None` leaves the current
/// value alone, `Some(None)` clears it and `Some(Some(x))` sets it.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AttributeWrite {
    /// `pmin`
    pub pmin: Option<Option<u32>>,
    /// `pmax`
    pub pmax: Option<Option<u32>>,
    /// `epmin`
    pub epmin: Option<Option<u32>>,
    /// `epmax`
    pub epmax: Option<Option<u32>>,
    /// `lt`
    pub lt: Option<Option<f64>>,
    /// `gt`
    pub gt: Option<Option<f64>>,
    /// `st`
    pub st: Option<Option<f64>>,
    /// `con`
    pub con: Option<Option<bool>>,
}

fn parse_field<T: FromStr>(value: Option<&str>) -> Result<Option<Option<T>>, ResponseError> {
    match value {
        None => Ok(Some(None)),
        Some(text) => text
            .parse()
            .map(|x| Some(Some(x)))
            .map_err(|_| ResponseError::BadOption),
    }
}

impl AttributeWrite {
    /// Parses the Uri-Query segments of a Write-Attributes request.
    ///
    /// An unknown attribute is a `BadRequest`; an unparsable value is a
    /// `BadOption`.
    pub fn parse_query<S: AsRef<str>>(queries: &[S]) -> Result<AttributeWrite, ResponseError> {
        let mut write = AttributeWrite::default();

        for query in queries {
            let (key, value) = match query.as_ref().split_once('=') {
                Some((key, value)) => (key, Some(value)),
                None => (query.as_ref(), None),
            };
            match key {
                "pmin" => write.pmin = parse_field(value)?,
                "pmax" => write.pmax = parse_field(value)?,
                "epmin" => write.epmin = parse_field(value)?,
                "epmax" => write.epmax = parse_field(value)?,
                "lt" => write.lt = parse_field(value)?,
                "gt" => write.gt = parse_field(value)?,
                "st" => write.st = parse_field(value)?,
                "con" => {
                    write.con = match value {
                        None => Some(None),
                        Some("0") => Some(Some(false)),
                        Some("1") => Some(Some(true)),
                        Some(_) => return Err(ResponseError::BadOption),
                    }
                }
                _ => return Err(ResponseError::BadRequest),
            }
        }

        Ok(write)
    }

    /// True if this write touches `lt`, `gt` or `st`, which only apply to
    /// resources.
    pub fn has_thresholds(&self) -> bool {
        self.lt.is_some() || self.gt.is_some() || self.st.is_some()
    }

    /// Applies this write to `attrs`.
    pub fn apply(&self, attrs: &Attributes) -> Attributes {
        fn merge<T: Copy>(write: Option<Option<T>>, current: Option<T>) -> Option<T> {
            match write {
                None => current,
                Some(new) => new,
            }
        }

        Attributes {
            pmin: merge(self.pmin, attrs.pmin),
            pmax: merge(self.pmax, attrs.pmax),
            epmin: merge(self.epmin, attrs.epmin),
            epmax: merge(self.epmax, attrs.epmax),
            lt: merge(self.lt, attrs.lt),
            gt: merge(self.gt, attrs.gt),
            st: merge(self.st, attrs.st),
            con: merge(self.con, attrs.con),
        }
    }
}

/// Identifies an observer: the Short Server ID of a LwM2M server.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(pub u16);

impl std::fmt::Display for ObserverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ssid:{}", self.0)
    }
}

/// Attributes per observer and path, plus per-observer defaults.
#[derive(Debug, Clone, Default)]
pub struct AttributeStore {
    attrs: HashMap<(ObserverId, Lwm2mPath), Attributes>,
    defaults: HashMap<ObserverId, NotificationDefaults>,
}

impl AttributeStore {
    /// Creates an empty store.
    pub fn new() -> AttributeStore {
        Default::default()
    }

    /// Sets the defaults of `observer`.
    pub fn set_defaults(&mut self, observer: ObserverId, defaults: NotificationDefaults) {
        self.defaults.insert(observer, defaults);
    }

    /// Defaults of `observer`.
    pub fn defaults(&self, observer: ObserverId) -> NotificationDefaults {
        self.defaults.get(&observer).copied().unwrap_or_default()
    }

    /// Attributes set directly on `path`.
    pub fn get(&self, observer: ObserverId, path: &Lwm2mPath) -> Attributes {
        self.attrs
            .get(&(observer, *path))
            .copied()
            .unwrap_or_default()
    }

    /// Applies a Write-Attributes to `path`. Nothing changes on error.
    pub fn write(
        &mut self,
        observer: ObserverId,
        path: &Lwm2mPath,
        write: &AttributeWrite,
    ) -> Result<(), ResponseError> {
        if path.is_root() {
            return Err(ResponseError::MethodNotAllowed);
        }
        if write.has_thresholds() && path.rid().is_none() {
            return Err(ResponseError::BadRequest);
        }

        let updated = write.apply(&self.get(observer, path));
        updated.validate()?;

        if updated.is_empty() {
            self.attrs.remove(&(observer, *path));
        } else {
            self.attrs.insert((observer, *path), updated);
        }
        Ok(())
    }

    /// The attributes in effect at `path`: each field from the most
    /// specific level that sets it, then the observer's defaults.
    pub fn effective(&self, observer: ObserverId, path: &Lwm2mPath) -> Attributes {
        let mut attrs = Attributes::default();
        let mut level = *path;
        loop {
            attrs = attrs.inherit(&self.get(observer, &level));
            if level.len() <= 1 {
                break;
            }
            level = level.parent();
        }
        attrs.inherit(&self.defaults(observer).as_attributes())
    }

    /// Forgets everything about `observer`.
    pub fn remove_observer(&mut self, observer: ObserverId) {
        self.attrs.retain(|(o, _), _| *o != observer);
        self.defaults.remove(&observer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER: ObserverId = ObserverId(1);

    #[test]
    fn parse_and_clear() {
        let write = AttributeWrite::parse_query(&["pmin=10", "pmax", "con=1"]).unwrap();
        assert_eq!(Some(Some(10)), write.pmin);
        assert_eq!(Some(None), write.pmax);
        assert_eq!(Some(Some(true)), write.con);
        assert_eq!(None, write.lt);

        assert_eq!(
            Err(ResponseError::BadOption),
            AttributeWrite::parse_query(&["pmin=abc"])
        );
        assert_eq!(
            Err(ResponseError::BadRequest),
            AttributeWrite::parse_query(&["foo=1"])
        );
    }

    #[test]
    fn invalid_thresholds() {
        let mut store = AttributeStore::new();
        let path = Lwm2mPath::resource(3, 0, 7);
        for query in [&["st=-1"][..], &["lt=10", "gt=10"][..], &["lt=1", "gt=5", "st=2"][..]] {
            let write = AttributeWrite::parse_query(query).unwrap();
            assert_eq!(Err(ResponseError::BadRequest), store.write(SERVER, &path, &write));
        }
        assert!(store.get(SERVER, &path).is_empty());

        let write = AttributeWrite::parse_query(&["lt=1", "gt=6", "st=2"]).unwrap();
        store.write(SERVER, &path, &write).unwrap();
        let before = store.get(SERVER, &path);
        store.write(SERVER, &path, &write).unwrap();
        assert_eq!(before, store.get(SERVER, &path));

        let write = AttributeWrite::parse_query(&["gt=5"]).unwrap();
        assert_eq!(
            Err(ResponseError::BadRequest),
            store.write(SERVER, &Lwm2mPath::instance(3, 0), &write)
        );
    }

    #[test]
    fn hierarchy() {
        let mut store = AttributeStore::new();
        store.set_defaults(
            SERVER,
            NotificationDefaults {
                pmin: 1,
                pmax: Some(60),
                storing: true,
            },
        );
        let object = AttributeWrite::parse_query(&["pmin=5", "pmax=30"]).unwrap();
        store.write(SERVER, &Lwm2mPath::object(3), &object).unwrap();
        let resource = AttributeWrite::parse_query(&["pmin=2"]).unwrap();
        store.write(SERVER, &Lwm2mPath::resource(3, 0, 7), &resource).unwrap();

        let attrs = store.effective(SERVER, &Lwm2mPath::resource(3, 0, 7));
        assert_eq!(Some(2), attrs.pmin);
        assert_eq!(Some(30), attrs.pmax);

        let other = store.effective(ObserverId(2), &Lwm2mPath::resource(3, 0, 7));
        assert_eq!(Some(0), other.pmin);
        assert_eq!(None, other.pmax);
    }

    #[test]
    fn pmax_scheduling() {
        let attrs = |pmin, pmax| Attributes {
            pmin: Some(pmin),
            pmax: Some(pmax),
            ..Default::default()
        };
        assert_eq!(None, attrs(0, 0).scheduled_pmax());
        assert_eq!(None, attrs(10, 5).scheduled_pmax());
        assert_eq!(Some(2), attrs(0, 2).scheduled_pmax());
    }

    #[test]
    fn thresholds() {
        let attrs = Attributes {
            lt: Some(10.0),
            gt: Some(20.0),
            st: Some(4.0),
            ..Default::default()
        };
        assert!(attrs.threshold_crossed(Some(11.0), 9.0));
        assert!(attrs.threshold_crossed(Some(19.0), 21.0));
        assert!(attrs.threshold_crossed(Some(12.0), 16.0));
        assert!(!attrs.threshold_crossed(Some(12.0), 15.0));
        assert!(Attributes::default().threshold_crossed(Some(1.0), 1.0));
    }
}

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
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// A LwM2M data model path: `/oid/iid/rid/riid`, any suffix of which may be
/// absent. The root path `/` has no components.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Lwm2mPath {
    ids: [u16; 4],
    len: u8,
}

impl Lwm2mPath {
    /// The root path.
    pub const ROOT: Lwm2mPath = Lwm2mPath {
        ids: [0; 4],
        len: 0,
    };

    /// Object path `/oid`.
    pub const fn object(oid: u16) -> Lwm2mPath {
        Lwm2mPath {
            ids: [oid, 0, 0, 0],
            len: 1,
        }
    }

    /// Instance path `/oid/iid`.
    pub const fn instance(oid: u16, iid: u16) -> Lwm2mPath {
        Lwm2mPath {
            ids: [oid, iid, 0, 0],
            len: 2,
        }
    }

    /// Resource path `/oid/iid/rid`.
    pub const fn resource(oid: u16, iid: u16, rid: u16) -> Lwm2mPath {
        Lwm2mPath {
            ids: [oid, iid, rid, 0],
            len: 3,
        }
    }

    /// Resource instance path `/oid/iid/rid/riid`.
    pub const fn resource_instance(oid: u16, iid: u16, rid: u16, riid: u16) -> Lwm2mPath {
        Lwm2mPath {
            ids: [oid, iid, rid, riid],
            len: 4,
        }
    }

    /// Parses CoAP Uri-Path segments. An empty list, or a single empty
    /// segment, is the root. Fails on non-numeric segments, on the reserved
    /// id 65535 and on more than four segments.
    pub fn from_segments<S: AsRef<str>>(segments: &[S]) -> Result<Lwm2mPath, ResponseError> {
        let segments: Vec<&str> = segments
            .iter()
            .map(|s| s.as_ref())
            .filter(|s| !s.is_empty())
            .collect();

        if segments.len() > 4 {
            return Err(ResponseError::NotFound);
        }

        let mut path = Lwm2mPath::ROOT;
        for segment in segments {
            let id: u16 = segment.parse().map_err(|_| ResponseError::NotFound)?;
            if id == u16::MAX {
                return Err(ResponseError::BadRequest);
            }
            path.ids[path.len as usize] = id;
            path.len += 1;
        }
        Ok(path)
    }

    /// Number of components, 0 through 4.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// True for the root path.
    pub fn is_root(&self) -> bool {
        self.len == 0
    }

    /// Object id.
    pub fn oid(&self) -> Option<u16> {
        self.get(0)
    }

    /// Object instance id.
    pub fn iid(&self) -> Option<u16> {
        self.get(1)
    }

    /// Resource id.
    pub fn rid(&self) -> Option<u16> {
        self.get(2)
    }

    /// Resource instance id.
    pub fn riid(&self) -> Option<u16> {
        self.get(3)
    }

    fn get(&self, i: usize) -> Option<u16> {
        if i < self.len as usize {
            Some(self.ids[i])
        } else {
            None
        }
    }

    /// The components as a slice.
    pub fn ids(&self) -> &[u16] {
        &self.ids[..self.len as usize]
    }

    /// The path one level up; the root stays the root.
    pub fn parent(&self) -> Lwm2mPath {
        let mut parent = *self;
        if parent.len > 0 {
            parent.len -= 1;
            parent.ids[parent.len as usize] = 0;
        }
        parent
    }

    /// Appends a component.
    pub fn child(&self, id: u16) -> Option<Lwm2mPath> {
        if self.len >= 4 {
            return None;
        }
        let mut child = *self;
        child.ids[child.len as usize] = id;
        child.len += 1;
        Some(child)
    }

    /// True if `self` equals `other` or contains it.
    pub fn is_prefix_of(&self, other: &Lwm2mPath) -> bool {
        self.len <= other.len && self.ids() == &other.ids[..self.len as usize]
    }

    /// True if one of the two paths contains the other.
    pub fn overlaps(&self, other: &Lwm2mPath) -> bool {
        self.is_prefix_of(other) || other.is_prefix_of(self)
    }

    /// The Uri-Path segments of this path.
    pub fn segments(&self) -> Vec<String> {
        self.ids().iter().map(|id| id.to_string()).collect()
    }
}

impl Display for Lwm2mPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_root() {
            return f.write_str("/");
        }
        for id in self.ids() {
            write!(f, "/{}", id)?;
        }
        Ok(())
    }
}

impl FromStr for Lwm2mPath {
    type Err = ResponseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments: Vec<&str> = s.trim_start_matches('/').split('/').collect();
        Lwm2mPath::from_segments(&segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let path: Lwm2mPath = "/5/0/3".parse().unwrap();
        assert_eq!(Lwm2mPath::resource(5, 0, 3), path);
        assert_eq!("/5/0/3", path.to_string());
        assert_eq!("/", Lwm2mPath::ROOT.to_string());
        assert_eq!(Ok(Lwm2mPath::ROOT), "/".parse());
        assert_eq!(Err(ResponseError::NotFound), "/5/x".parse::<Lwm2mPath>());
        assert_eq!(Err(ResponseError::NotFound), "/1/2/3/4/5".parse::<Lwm2mPath>());
    }

    #[test]
    fn hierarchy() {
        let object = Lwm2mPath::object(3);
        let resource = Lwm2mPath::resource(3, 0, 7);
        assert!(object.is_prefix_of(&resource));
        assert!(!resource.is_prefix_of(&object));
        assert!(resource.overlaps(&object));
        assert!(!Lwm2mPath::object(5).overlaps(&resource));
        assert_eq!(Lwm2mPath::instance(3, 0), resource.parent());
        assert_eq!(Some(resource), Lwm2mPath::instance(3, 0).child(7));
    }
}

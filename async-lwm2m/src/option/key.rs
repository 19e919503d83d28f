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

/// An option number paired with the Rust type of its value, so that
/// [`CoapMessage::option`](crate::message::CoapMessage::option) and friends
/// decode and encode without the caller naming a format.
#[derive(Hash, PartialEq, Eq, Ord, PartialOrd)]
pub struct OptionKey<T>(pub OptionNumber, core::marker::PhantomData<fn() -> T>);

impl<T> OptionKey<T> {
    /// Wraps `n`.
    pub const fn new(n: OptionNumber) -> OptionKey<T> {
        OptionKey(n, core::marker::PhantomData)
    }
}

impl<T> Copy for OptionKey<T> {}

impl<T> Clone for OptionKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> core::fmt::Debug for OptionKey<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl<T> core::ops::Deref for OptionKey<T> {
    type Target = OptionNumber;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

macro_rules! typed_keys {
    ($($(#[$doc:meta])* $name:ident: $ty:ty;)*) => {
        $(
            $(#[$doc])*
            pub const $name: OptionKey<$ty> = OptionKey::new(OptionNumber::$name);
        )*
    };
}

typed_keys! {
    /// If-Match; sent when resuming a download.
    IF_MATCH: ETag;
    /// ETag of a representation.
    ETAG: ETag;
    /// Observe sequence number, or 0 and 1 to register and deregister.
    OBSERVE: u32;
    /// One segment of the location of a created resource.
    LOCATION_PATH: String;
    /// One segment of the target path.
    URI_PATH: String;
    /// Payload format.
    CONTENT_FORMAT: ContentFormat;
    /// One query item.
    URI_QUERY: String;
    /// Format the client wants back.
    ACCEPT: ContentFormat;
    /// Block of a response payload.
    BLOCK2: BlockInfo;
    /// Block of a request payload.
    BLOCK1: BlockInfo;
    /// Total size of a response payload.
    SIZE2: u32;
    /// Total size of a request payload, or the largest size acceptable.
    SIZE1: u32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_carry_numbers() {
        assert_eq!(OptionNumber(27), *BLOCK1);
        assert_eq!(OptionNumber::LOCATION_PATH, LOCATION_PATH.0);
        assert_eq!("4(ETag)", format!("{:?}", ETAG));
    }
}

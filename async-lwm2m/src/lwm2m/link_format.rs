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

//! Writer and parser for [IETF-RFC6690 CoAP link-formats], as carried by
//! the Register and Update bodies and by Discover responses.
//!
//! [IETF-RFC6690 CoAP link-formats]: https://tools.ietf.org/html/rfc6690

use std::fmt::Display;

/// Object version.
pub const LINK_ATTR_OBJECT_VERSION: &str = "ver";

/// Content format of the root resource.
pub const LINK_ATTR_CONTENT_FORMAT: &str = "ct";

/// Resource type.
pub const LINK_ATTR_RESOURCE_TYPE: &str = "rt";

/// Minimum notification period.
pub const LINK_ATTR_PMIN: &str = "pmin";

/// Maximum notification period.
pub const LINK_ATTR_PMAX: &str = "pmax";

/// Number of resource instances, for Discover.
pub const LINK_ATTR_DIM: &str = "dim";

const QUOTE_ESCAPE_CHAR: char = '\\';
const ATTR_SEPARATOR_CHAR: char = ';';
const LINK_SEPARATOR_CHAR: char = ',';

/// Error type for parsing a link format.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ErrorLinkFormat {
    /// A link did not start with `<` or was not terminated by `>`.
    #[error("malformed link-format")]
    ParseError,
}

/// One parsed link.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Link {
    /// The target between the angle brackets.
    pub target: String,

    /// Attributes in order of appearance; flag attributes have no value.
    pub attrs: Vec<(String, Option<String>)>,
}

impl Link {
    /// The unquoted value of the first attribute named `key`.
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_deref())
    }
}

fn unquote(value: &str) -> String {
    let inner = match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(inner) => inner,
        None => return value.to_string(),
    };

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == QUOTE_ESCAPE_CHAR {
            if let Some(escaped) = chars.next() {
                out.push(escaped);
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn split_outside_quotes(s: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    let mut escaped = false;

    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            QUOTE_ESCAPE_CHAR if quoted => escaped = true,
            '"' => quoted = !quoted,
            c if c == separator && !quoted => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => (),
        }
    }
    parts.push(&s[start..]);
    parts
}

/// Parses a link-format document.
pub fn parse(input: &str) -> Result<Vec<Link>, ErrorLinkFormat> {
    let mut links = Vec::new();

    for item in split_outside_quotes(input, LINK_SEPARATOR_CHAR) {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }

        let rest = item.strip_prefix('<').ok_or(ErrorLinkFormat::ParseError)?;
        let end = rest.find('>').ok_or(ErrorLinkFormat::ParseError)?;
        let target = rest[..end].to_string();

        let attrs = split_outside_quotes(&rest[end + 1..], ATTR_SEPARATOR_CHAR)
            .into_iter()
            .map(str::trim)
            .filter(|attr| !attr.is_empty())
            .map(|attr| match attr.split_once('=') {
                Some((key, value)) => (key.to_string(), Some(unquote(value))),
                None => (attr.to_string(), None),
            })
            .collect();

        links.push(Link { target, attrs });
    }

    Ok(links)
}

/// Builds a link-format document in memory.
///
/// ```
/// use async_lwm2m::lwm2m::link_format::*;
///
/// let mut links = LinkWriter::new();
/// links.link("/5/0");
/// links.link("/33629").quoted(LINK_ATTR_OBJECT_VERSION, "1.1");
///
/// assert_eq!(links.into_string(), r#"</5/0>,</33629>;ver="1.1""#);
/// ```
#[derive(Debug, Default, Clone)]
pub struct LinkWriter {
    buffer: String,
}

impl LinkWriter {
    /// Creates an empty document.
    pub fn new() -> LinkWriter {
        LinkWriter::default()
    }

    /// Appends `<target>` and returns a handle for its attributes.
    pub fn link(&mut self, target: impl Display) -> LinkAttrs<'_> {
        if !self.buffer.is_empty() {
            self.buffer.push(LINK_SEPARATOR_CHAR);
        }
        self.buffer.push('<');
        self.buffer.push_str(&target.to_string());
        self.buffer.push('>');
        LinkAttrs(&mut self.buffer)
    }

    /// True if no link was written yet.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// The finished document.
    pub fn into_string(self) -> String {
        self.buffer
    }
}

/// Attributes of the link most recently added to a [`LinkWriter`].
#[derive(Debug)]
pub struct LinkAttrs<'a>(&'a mut String);

impl<'a> LinkAttrs<'a> {
    fn key(&mut self, key: &str) {
        debug_assert!(!key.contains(|c: char| c.is_ascii_whitespace() || c == '='));
        self.0.push(ATTR_SEPARATOR_CHAR);
        self.0.push_str(key);
        self.0.push('=');
    }

    /// Adds `key="value"`, escaping quotes and backslashes.
    pub fn quoted(mut self, key: &str, value: &str) -> Self {
        self.key(key);
        self.0.push('"');
        for c in value.chars() {
            if c == '"' || c == QUOTE_ESCAPE_CHAR {
                self.0.push(QUOTE_ESCAPE_CHAR);
            }
            self.0.push(c);
        }
        self.0.push('"');
        self
    }

    /// Adds `key=value` for numbers and other bare tokens.
    pub fn value(mut self, key: &str, value: impl Display) -> Self {
        self.key(key);
        self.0.push_str(&value.to_string());
        self
    }

    /// Like [`value`](LinkAttrs::value), skipping `None`.
    pub fn value_opt(self, key: &str, value: Option<impl Display>) -> Self {
        match value {
            Some(value) => self.value(key, value),
            None => self,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_parse() {
        let mut write = LinkWriter::new();
        write
            .link("/")
            .quoted(LINK_ATTR_RESOURCE_TYPE, "oma.lwm2m")
            .value(LINK_ATTR_CONTENT_FORMAT, 11543);
        write.link("/3/0").value_opt(LINK_ATTR_DIM, None::<u32>);
        write
            .link("/33629/1")
            .quoted(LINK_ATTR_OBJECT_VERSION, "a\"b,c");
        let buffer = write.into_string();

        assert_eq!(
            r#"</>;rt="oma.lwm2m";ct=11543,</3/0>,</33629/1>;ver="a\"b,c""#,
            buffer
        );

        let links = parse(&buffer).unwrap();
        assert_eq!(3, links.len());
        assert_eq!(Some("oma.lwm2m"), links[0].attr("rt"));
        assert_eq!(Some("11543"), links[0].attr("ct"));
        assert_eq!("/3/0", links[1].target);
        assert_eq!(Some("a\"b,c"), links[2].attr("ver"));
    }

    #[test]
    fn flags_and_errors() {
        let links = parse("</1/0>;obs;pmin=5").unwrap();
        assert_eq!(vec![("obs".to_string(), None), ("pmin".to_string(), Some("5".to_string()))], links[0].attrs);
        assert_eq!(Err(ErrorLinkFormat::ParseError), parse("/1/0"));
        assert_eq!(Err(ErrorLinkFormat::ParseError), parse("</1/0"));
    }
}

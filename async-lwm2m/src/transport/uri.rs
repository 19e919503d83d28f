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
use std::net::IpAddr;

/// A CoAP URI split into what a client needs to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapUri {
    /// Transport selected by the scheme.
    pub kind: TransportKind,
    /// Host name or address literal, without brackets.
    pub host: String,
    /// Port, or the default port of `kind`.
    pub port: u16,
    /// Path segments as they appear in the URI.
    pub path: Vec<String>,
    /// Query items, undecoded.
    pub query: Vec<String>,
}

impl CoapUri {
    /// Fails with [`Error::UnsupportedUriScheme`] for anything but the four
    /// CoAP schemes.
    pub fn parse(uri: &str) -> Result<CoapUri, Error> {
        let url = url::Url::parse(uri).map_err(|_| Error::InvalidArgument)?;
        let kind = TransportKind::from_scheme(url.scheme()).ok_or(Error::UnsupportedUriScheme)?;
        let host = match url.host() {
            Some(url::Host::Ipv6(addr)) => addr.to_string(),
            Some(host) => host.to_string(),
            None => return Err(Error::InvalidArgument),
        };
        let port = url.port().unwrap_or_else(|| kind.default_port());

        let path = url
            .path_segments()
            .map(|segments| segments.filter(|s| !s.is_empty()).map(str::to_string).collect())
            .unwrap_or_default();
        let query = url
            .query()
            .map(|q| q.split('&').filter(|s| !s.is_empty()).map(str::to_string).collect())
            .unwrap_or_default();

        Ok(CoapUri {
            kind,
            host,
            port,
            path,
            query,
        })
    }

    /// The socket address, when the host is an address literal.
    pub fn literal_addr(&self) -> Option<SocketAddr> {
        let ip: IpAddr = self.host.parse().ok()?;
        Some(SocketAddr::new(ip, self.port))
    }

    /// Adds Uri-Path and Uri-Query options naming this resource.
    pub fn add_to(&self, msg: &mut CoapMessage) {
        for segment in &self.path {
            msg.add_raw_option(OptionNumber::URI_PATH, segment.as_bytes().to_vec());
        }
        for query in &self.query {
            msg.add_uri_query(query);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_literal_and_named_hosts() {
        let uri = CoapUri::parse("coap://127.0.0.1:5683/fw/image?v=2").unwrap();
        assert_eq!(TransportKind::Udp, uri.kind);
        assert_eq!(vec!["fw", "image"], uri.path);
        assert_eq!(vec!["v=2"], uri.query);
        assert_eq!(Some("127.0.0.1:5683".parse().unwrap()), uri.literal_addr());

        let uri = CoapUri::parse("coap+tcp://[::1]/pkg").unwrap();
        assert_eq!(TransportKind::Tcp, uri.kind);
        assert_eq!("::1", uri.host);
        assert_eq!(DEFAULT_PORT_COAP_TCP, uri.port);
        assert_eq!(Some(SocketAddr::new("::1".parse().unwrap(), uri.port)), uri.literal_addr());

        let uri = CoapUri::parse("coaps://updates.example.com/pkg").unwrap();
        assert_eq!(TransportKind::Dtls, uri.kind);
        assert_eq!(None, uri.literal_addr());
    }

    #[test]
    fn parse_rejects_other_schemes() {
        assert_eq!(
            Err(Error::UnsupportedUriScheme),
            CoapUri::parse("http://127.0.0.1/fw")
        );
        assert_eq!(Err(Error::InvalidArgument), CoapUri::parse("not a uri"));
    }

    #[test]
    fn options_name_the_resource() {
        let uri = CoapUri::parse("coap://127.0.0.1/fw/image?v=2").unwrap();
        let mut msg = CoapMessage::request(MsgCode::GET);
        uri.add_to(&mut msg);
        assert_eq!(vec!["fw", "image"], msg.uri_path());
        assert_eq!(vec!["v=2"], msg.uri_queries());
    }
}

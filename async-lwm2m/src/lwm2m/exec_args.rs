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

//! Execute argument lists: `0='</33629/1>,</33629/2>',1`.

use super::*;

/// One execute argument: a digit and an optional single-quoted value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecArg {
    /// Argument number, 0 through 9.
    pub id: u8,
    /// Value between the quotes.
    pub value: Option<String>,
}

/// Parses an execute payload. An empty payload has no arguments.
pub fn parse(payload: &[u8]) -> Result<Vec<ExecArg>, ResponseError> {
    let bad = ResponseError::BadRequest;
    let text = std::str::from_utf8(payload).map_err(|_| bad)?;
    let mut chars = text.chars().peekable();
    let mut args = Vec::new();

    while chars.peek().is_some() {
        let id = chars
            .next()
            .and_then(|c| c.to_digit(10))
            .ok_or(bad)? as u8;

        let value = if chars.peek() == Some(&'=') {
            chars.next();
            if chars.next() != Some('\'') {
                return Err(bad);
            }
            let mut value = String::new();
            loop {
                match chars.next() {
                    Some('\'') => break,
                    Some(c) => value.push(c),
                    None => return Err(bad),
                }
            }
            Some(value)
        } else {
            None
        };

        args.push(ExecArg { id, value });

        match chars.next() {
            None => break,
            Some(',') if chars.peek().is_some() => (),
            Some(_) => return Err(bad),
        }
    }

    Ok(args)
}

/// The value of argument `id`, if present.
pub fn find(args: &[ExecArg], id: u8) -> Option<&ExecArg> {
    args.iter().find(|arg| arg.id == id)
}

/// Parses a list of link targets such as `</33629/1>,</33629/2>`.
pub fn parse_link_targets(value: &str) -> Result<Vec<Lwm2mPath>, ResponseError> {
    link_format::parse(value)
        .map_err(|_| ResponseError::BadRequest)?
        .into_iter()
        .map(|link| link.target.parse().map_err(|_| ResponseError::BadRequest))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_and_flag() {
        let args = parse(b"0='</33629/1>,</33629/2>',1").unwrap();
        assert_eq!(2, args.len());
        assert_eq!(Some("</33629/1>,</33629/2>"), args[0].value.as_deref());
        assert_eq!(ExecArg { id: 1, value: None }, args[1]);
        assert_eq!(
            vec![Lwm2mPath::instance(33629, 1), Lwm2mPath::instance(33629, 2)],
            parse_link_targets(args[0].value.as_deref().unwrap()).unwrap()
        );
        assert!(find(&args, 1).is_some());
        assert!(find(&args, 2).is_none());
    }

    #[test]
    fn malformed() {
        assert_eq!(Ok(vec![]), parse(b""));
        assert_eq!(Err(ResponseError::BadRequest), parse(b"x"));
        assert_eq!(Err(ResponseError::BadRequest), parse(b"0='open"));
        assert_eq!(Err(ResponseError::BadRequest), parse(b"0,"));
        assert_eq!(Err(ResponseError::BadRequest), parse(b"01"));
    }
}

//! Structured session descriptions (RFC 4566 text form).
//!
//! The direct media engine exchanges [`SessionSpec`] values; the server
//! speaks SDP text. Parsing keeps every line, including ones this module
//! does not model, so `to_sdp` reproduces all fields of the input in
//! canonical line order.

use std::fmt;
use std::str::FromStr;

use mediasession_common::Direction;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SdpError {
    #[error("line {line}: expected '<type>=<value>', got '{text}'")]
    Syntax { line: usize, text: String },

    #[error("line {line}: invalid {field}: '{value}'")]
    InvalidField {
        line: usize,
        field: &'static str,
        value: String,
    },

    #[error("description does not start with a version line")]
    MissingVersion,

    #[error("description has no session name")]
    MissingSessionName,
}

/// `o=` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub username: String,
    pub session_id: String,
    pub session_version: String,
    pub net_type: String,
    pub addr_type: String,
    pub address: String,
}

/// `c=` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub net_type: String,
    pub addr_type: String,
    pub address: String,
}

/// `t=` line with the `r=` repeat lines that follow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timing {
    pub start: u64,
    pub stop: u64,
    pub repeats: Vec<String>,
}

impl Timing {
    pub fn new(start: u64, stop: u64) -> Self {
        Self {
            start,
            stop,
            repeats: Vec::new(),
        }
    }
}

/// `a=name` or `a=name:value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub value: Option<String>,
}

impl Attribute {
    pub fn flag(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }

    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }
}

/// A line kept verbatim because it has no dedicated field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub kind: char,
    pub value: String,
}

/// One `m=` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSpec {
    pub kind: String,
    pub port: u16,
    pub port_count: Option<u16>,
    pub protocol: String,
    pub formats: Vec<String>,
    pub connections: Vec<Connection>,
    pub bandwidth: Vec<String>,
    pub attributes: Vec<Attribute>,
    pub extra: Vec<Line>,
}

impl MediaSpec {
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Direction attribute of this section, if any.
    pub fn direction(&self) -> Option<Direction> {
        self.attributes
            .iter()
            .filter(|a| a.value.is_none())
            .find_map(|a| Direction::from_sdp_attribute(&a.name))
    }

    /// Replace (or add) the direction attribute.
    pub fn set_direction(&mut self, direction: Direction) {
        self.attributes
            .retain(|a| a.value.is_some() || Direction::from_sdp_attribute(&a.name).is_none());
        self.attributes.push(Attribute::flag(direction.sdp_attribute()));
    }
}

/// A whole session description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSpec {
    pub version: u32,
    pub origin: Option<Origin>,
    pub session_name: String,
    pub connection: Option<Connection>,
    pub timing: Vec<Timing>,
    pub attributes: Vec<Attribute>,
    pub extra: Vec<Line>,
    pub media: Vec<MediaSpec>,
}

impl SessionSpec {
    pub fn parse(text: &str) -> Result<Self, SdpError> {
        let mut lines = text
            .lines()
            .map(|l| l.trim_end_matches('\r'))
            .enumerate()
            .filter(|(_, l)| !l.trim().is_empty())
            .map(|(i, l)| split_line(i + 1, l));

        let (line_no, kind, value) = lines.next().ok_or(SdpError::MissingVersion)??;
        if kind != 'v' {
            return Err(SdpError::MissingVersion);
        }
        let version = parse_num(line_no, "version", value)?;

        let mut spec = SessionSpec {
            version,
            origin: None,
            session_name: String::new(),
            connection: None,
            timing: Vec::new(),
            attributes: Vec::new(),
            extra: Vec::new(),
            media: Vec::new(),
        };
        let mut has_name = false;

        for item in lines {
            let (line_no, kind, value) = item?;
            if let Some(media) = spec.media.last_mut() {
                if kind != 'm' {
                    match kind {
                        'c' => media.connections.push(parse_connection(line_no, value)?),
                        'b' => media.bandwidth.push(value.to_string()),
                        'a' => media.attributes.push(parse_attribute(value)),
                        _ => media.extra.push(Line {
                            kind,
                            value: value.to_string(),
                        }),
                    }
                    continue;
                }
            }
            match kind {
                'o' => spec.origin = Some(parse_origin(line_no, value)?),
                's' => {
                    spec.session_name = value.to_string();
                    has_name = true;
                }
                'c' => spec.connection = Some(parse_connection(line_no, value)?),
                't' => spec.timing.push(parse_timing(line_no, value)?),
                'r' => match spec.timing.last_mut() {
                    Some(timing) => timing.repeats.push(value.to_string()),
                    None => spec.extra.push(Line {
                        kind,
                        value: value.to_string(),
                    }),
                },
                'a' => spec.attributes.push(parse_attribute(value)),
                'm' => spec.media.push(parse_media(line_no, value)?),
                _ => spec.extra.push(Line {
                    kind,
                    value: value.to_string(),
                }),
            }
        }

        if !has_name {
            return Err(SdpError::MissingSessionName);
        }
        Ok(spec)
    }

    /// Serialize with CRLF line endings.
    pub fn to_sdp(&self) -> String {
        self.to_string()
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn media_of_kind(&self, kind: &str) -> Option<&MediaSpec> {
        self.media.iter().find(|m| m.kind == kind)
    }
}

impl FromStr for SessionSpec {
    type Err = SdpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// Session-level extra lines are split around the modelled ones so the
// output follows the RFC 4566 ordering.
const BEFORE_CONNECTION: &[char] = &['i', 'u', 'e', 'p'];
const BEFORE_TIMING: &[char] = &['b'];

impl fmt::Display for SessionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v={}\r\n", self.version)?;
        if let Some(o) = &self.origin {
            write!(
                f,
                "o={} {} {} {} {} {}\r\n",
                o.username, o.session_id, o.session_version, o.net_type, o.addr_type, o.address
            )?;
        }
        write!(f, "s={}\r\n", self.session_name)?;
        write_extra(f, &self.extra, |k| BEFORE_CONNECTION.contains(&k))?;
        if let Some(c) = &self.connection {
            write_connection(f, c)?;
        }
        write_extra(f, &self.extra, |k| BEFORE_TIMING.contains(&k))?;
        for t in &self.timing {
            write!(f, "t={} {}\r\n", t.start, t.stop)?;
            for r in &t.repeats {
                write!(f, "r={r}\r\n")?;
            }
        }
        write_extra(f, &self.extra, |k| {
            !BEFORE_CONNECTION.contains(&k) && !BEFORE_TIMING.contains(&k)
        })?;
        for a in &self.attributes {
            write_attribute(f, a)?;
        }

        for m in &self.media {
            write!(f, "m={} {}", m.kind, m.port)?;
            if let Some(count) = m.port_count {
                write!(f, "/{count}")?;
            }
            write!(f, " {}", m.protocol)?;
            for fmt_id in &m.formats {
                write!(f, " {fmt_id}")?;
            }
            f.write_str("\r\n")?;
            write_extra(f, &m.extra, |k| k == 'i')?;
            for c in &m.connections {
                write_connection(f, c)?;
            }
            for b in &m.bandwidth {
                write!(f, "b={b}\r\n")?;
            }
            write_extra(f, &m.extra, |k| k != 'i')?;
            for a in &m.attributes {
                write_attribute(f, a)?;
            }
        }
        Ok(())
    }
}

fn write_extra(
    f: &mut fmt::Formatter<'_>,
    lines: &[Line],
    pick: impl Fn(char) -> bool,
) -> fmt::Result {
    for line in lines.iter().filter(|l| pick(l.kind)) {
        write!(f, "{}={}\r\n", line.kind, line.value)?;
    }
    Ok(())
}

fn write_connection(f: &mut fmt::Formatter<'_>, c: &Connection) -> fmt::Result {
    write!(f, "c={} {} {}\r\n", c.net_type, c.addr_type, c.address)
}

fn write_attribute(f: &mut fmt::Formatter<'_>, a: &Attribute) -> fmt::Result {
    match &a.value {
        Some(value) => write!(f, "a={}:{}\r\n", a.name, value),
        None => write!(f, "a={}\r\n", a.name),
    }
}

fn split_line(line: usize, text: &str) -> Result<(usize, char, &str), SdpError> {
    let mut chars = text.chars();
    match (chars.next(), chars.next()) {
        (Some(kind), Some('=')) if kind.is_ascii_lowercase() => Ok((line, kind, &text[2..])),
        _ => Err(SdpError::Syntax {
            line,
            text: text.to_string(),
        }),
    }
}

fn parse_num<T: FromStr>(line: usize, field: &'static str, value: &str) -> Result<T, SdpError> {
    value.trim().parse().map_err(|_| SdpError::InvalidField {
        line,
        field,
        value: value.to_string(),
    })
}

fn fields<'a, const N: usize>(
    line: usize,
    field: &'static str,
    value: &'a str,
) -> Result<[&'a str; N], SdpError> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    parts.try_into().map_err(|_| SdpError::InvalidField {
        line,
        field,
        value: value.to_string(),
    })
}

fn parse_origin(line: usize, value: &str) -> Result<Origin, SdpError> {
    let [username, session_id, session_version, net_type, addr_type, address] =
        fields::<6>(line, "origin", value)?;
    Ok(Origin {
        username: username.to_string(),
        session_id: session_id.to_string(),
        session_version: session_version.to_string(),
        net_type: net_type.to_string(),
        addr_type: addr_type.to_string(),
        address: address.to_string(),
    })
}

fn parse_connection(line: usize, value: &str) -> Result<Connection, SdpError> {
    let [net_type, addr_type, address] = fields::<3>(line, "connection", value)?;
    Ok(Connection {
        net_type: net_type.to_string(),
        addr_type: addr_type.to_string(),
        address: address.to_string(),
    })
}

fn parse_timing(line: usize, value: &str) -> Result<Timing, SdpError> {
    let [start, stop] = fields::<2>(line, "timing", value)?;
    Ok(Timing::new(
        parse_num(line, "timing", start)?,
        parse_num(line, "timing", stop)?,
    ))
}

fn parse_attribute(value: &str) -> Attribute {
    match value.split_once(':') {
        Some((name, v)) => Attribute::new(name, v),
        None => Attribute::flag(value),
    }
}

fn parse_media(line: usize, value: &str) -> Result<MediaSpec, SdpError> {
    let mut parts = value.split_whitespace();
    let invalid = || SdpError::InvalidField {
        line,
        field: "media",
        value: value.to_string(),
    };

    let kind = parts.next().ok_or_else(invalid)?;
    let port_text = parts.next().ok_or_else(invalid)?;
    let protocol = parts.next().ok_or_else(invalid)?;
    let (port, port_count) = match port_text.split_once('/') {
        Some((port, count)) => (
            parse_num(line, "media port", port)?,
            Some(parse_num(line, "media port", count)?),
        ),
        None => (parse_num(line, "media port", port_text)?, None),
    };

    Ok(MediaSpec {
        kind: kind.to_string(),
        port,
        port_count,
        protocol: protocol.to_string(),
        formats: parts.map(str::to_string).collect(),
        connections: Vec::new(),
        bandwidth: Vec::new(),
        attributes: Vec::new(),
        extra: Vec::new(),
    })
}

//! Typed command model.
//!
//! A request arrives as an array of bulk strings whose first element names
//! the verb, case-insensitively. [`Command::parse`] turns that frame into a
//! tagged value carrying only the typed fields each verb needs;
//! [`Command::to_frame`] is the inverse and produces the canonical form
//! (uppercased verb) used when propagating writes to followers.

use bytes::Bytes;

use cinnabar_types::{BoundStreamId, InputStreamId, ReadStreamId};

use crate::error::CommandError;
use crate::frame::Frame;

/// A parsed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    Echo {
        payload: Bytes,
    },
    Set {
        key: String,
        value: Bytes,
        expire_ms: Option<u64>,
    },
    Get {
        key: String,
    },
    Type {
        key: String,
    },
    Keys {
        pattern: String,
    },
    ConfigGet {
        key: String,
    },
    Info {
        sections: Vec<String>,
    },
    ReplConf {
        args: Vec<String>,
    },
    Psync {
        replica_id: String,
        offset: i64,
    },
    Wait {
        num_replicas: u64,
        timeout_ms: u64,
    },
    XAdd {
        key: String,
        id: InputStreamId,
        fields: Vec<(Bytes, Bytes)>,
    },
    XRange {
        key: String,
        start: BoundStreamId,
        end: BoundStreamId,
    },
    XRead {
        requests: Vec<(String, ReadStreamId)>,
        block_ms: Option<u64>,
    },
}

/// The bulk-string arguments of a request array, in order.
fn bulk_args(frame: &Frame) -> Result<Vec<&Bytes>, CommandError> {
    let Frame::Array(Some(items)) = frame else {
        return Err(CommandError::NotAnArray);
    };
    if items.is_empty() {
        return Err(CommandError::NotAnArray);
    }
    items
        .iter()
        .map(|item| item.as_bulk().ok_or(CommandError::NotAnArray))
        .collect()
}

fn text(arg: &Bytes, what: &str) -> Result<String, CommandError> {
    std::str::from_utf8(arg)
        .map(str::to_owned)
        .map_err(|_| CommandError::parse(format!("{what} is not valid utf-8")))
}

fn number<T: std::str::FromStr>(arg: &Bytes, what: &str) -> Result<T, CommandError> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| CommandError::parse(format!("{what} is not a number")))
}

fn need<'a>(args: &[&'a Bytes], index: usize, what: &str) -> Result<&'a Bytes, CommandError> {
    args.get(index)
        .copied()
        .ok_or_else(|| CommandError::parse(format!("missing {what}")))
}

impl Command {
    /// Parses a decoded frame into a command.
    pub fn parse(frame: &Frame) -> Result<Self, CommandError> {
        let args = bulk_args(frame)?;
        let verb = text(args[0], "verb")?.to_ascii_lowercase();

        match verb.as_str() {
            "ping" => Ok(Self::Ping),
            "echo" => Ok(Self::Echo {
                payload: need(&args, 1, "ECHO payload")?.clone(),
            }),
            "set" => Self::parse_set(&args),
            "get" => Ok(Self::Get {
                key: text(need(&args, 1, "GET key")?, "key")?,
            }),
            "type" => Ok(Self::Type {
                key: text(need(&args, 1, "TYPE key")?, "key")?,
            }),
            "keys" => Ok(Self::Keys {
                pattern: text(need(&args, 1, "KEYS pattern")?, "pattern")?,
            }),
            "config" => Self::parse_config(&args),
            "info" => {
                let sections = args[1..]
                    .iter()
                    .map(|arg| text(arg, "section").map(|s| s.to_ascii_lowercase()))
                    .collect::<Result<_, _>>()?;
                Ok(Self::Info { sections })
            }
            "replconf" => {
                let args = args[1..]
                    .iter()
                    .map(|arg| text(arg, "REPLCONF argument"))
                    .collect::<Result<_, _>>()?;
                Ok(Self::ReplConf { args })
            }
            "psync" => {
                if args.len() != 3 {
                    return Err(CommandError::parse("PSYNC expects 2 arguments"));
                }
                Ok(Self::Psync {
                    replica_id: text(args[1], "replication id")?,
                    offset: number(args[2], "offset")?,
                })
            }
            "wait" => {
                // Strict arity: verb plus exactly two arguments.
                if args.len() != 3 {
                    return Err(CommandError::parse("WAIT expects 2 arguments"));
                }
                Ok(Self::Wait {
                    num_replicas: number(args[1], "replica count")?,
                    timeout_ms: number(args[2], "timeout")?,
                })
            }
            "xadd" => Self::parse_xadd(&args),
            "xrange" => Self::parse_xrange(&args),
            "xread" => Self::parse_xread(&args),
            _ => Err(CommandError::UnknownCommand(verb)),
        }
    }

    fn parse_set(args: &[&Bytes]) -> Result<Self, CommandError> {
        let key = text(need(args, 1, "SET key")?, "key")?;
        let value = need(args, 2, "SET value")?.clone();

        let mut expire_ms = None;
        let mut pos = 3;
        while pos < args.len() {
            let param = text(args[pos], "SET parameter")?.to_ascii_lowercase();
            match param.as_str() {
                "px" => {
                    let raw = need(args, pos + 1, "PX argument")?;
                    let ms: u64 = number(raw, "PX argument")?;
                    if ms == 0 {
                        return Err(CommandError::parse("PX argument must be positive"));
                    }
                    expire_ms = Some(ms);
                    pos += 2;
                }
                _ => {
                    return Err(CommandError::parse(format!("unknown SET parameter {param:?}")));
                }
            }
        }

        Ok(Self::Set {
            key,
            value,
            expire_ms,
        })
    }

    fn parse_config(args: &[&Bytes]) -> Result<Self, CommandError> {
        let action = text(need(args, 1, "CONFIG action")?, "action")?.to_ascii_lowercase();
        if action != "get" {
            return Err(CommandError::parse(format!(
                "unsupported CONFIG action {action:?}"
            )));
        }
        Ok(Self::ConfigGet {
            key: text(need(args, 2, "CONFIG GET key")?, "key")?,
        })
    }

    fn parse_xadd(args: &[&Bytes]) -> Result<Self, CommandError> {
        if args.len() < 5 {
            return Err(CommandError::parse("XADD expects at least 4 arguments"));
        }
        let key = text(args[1], "stream key")?;
        let id = text(args[2], "stream id")?
            .parse::<InputStreamId>()
            .map_err(|e| CommandError::parse(e.to_string()))?;

        let mut fields = Vec::with_capacity((args.len() - 3) / 2);
        let mut pos = 3;
        while pos < args.len() {
            if pos + 1 >= args.len() {
                return Err(CommandError::parse("expected pairs of field and value"));
            }
            fields.push((args[pos].clone(), args[pos + 1].clone()));
            pos += 2;
        }

        Ok(Self::XAdd { key, id, fields })
    }

    fn parse_xrange(args: &[&Bytes]) -> Result<Self, CommandError> {
        if args.len() != 4 {
            return Err(CommandError::parse("XRANGE expects 3 arguments"));
        }
        let parse_bound = |arg: &Bytes, what: &str| -> Result<BoundStreamId, CommandError> {
            text(arg, what)?
                .parse::<BoundStreamId>()
                .map_err(|e| CommandError::parse(e.to_string()))
        };
        Ok(Self::XRange {
            key: text(args[1], "stream key")?,
            start: parse_bound(args[2], "range start")?,
            end: parse_bound(args[3], "range end")?,
        })
    }

    fn parse_xread(args: &[&Bytes]) -> Result<Self, CommandError> {
        if args.len() < 4 {
            return Err(CommandError::parse("XREAD expects at least 3 arguments"));
        }

        let mut block_ms = None;
        let mut keys: Vec<String> = Vec::new();
        let mut ids: Vec<ReadStreamId> = Vec::new();
        let mut expected_streams = 0;
        let mut met_streams = false;

        let mut pos = 1;
        while pos < args.len() {
            if met_streams {
                if keys.len() < expected_streams {
                    keys.push(text(args[pos], "stream key")?);
                } else if ids.len() < expected_streams {
                    let id = text(args[pos], "stream id")?
                        .parse::<ReadStreamId>()
                        .map_err(|e| CommandError::parse(e.to_string()))?;
                    ids.push(id);
                } else {
                    return Err(CommandError::parse("unexpected argument after streams"));
                }
                pos += 1;
                continue;
            }

            let arg = text(args[pos], "XREAD argument")?.to_ascii_lowercase();
            match arg.as_str() {
                "streams" => {
                    let remaining = args.len() - pos - 1;
                    if remaining < 2 || remaining % 2 != 0 {
                        return Err(CommandError::parse(
                            "STREAMS expects matching key and id lists",
                        ));
                    }
                    met_streams = true;
                    expected_streams = remaining / 2;
                    keys.reserve(expected_streams);
                    ids.reserve(expected_streams);
                    pos += 1;
                }
                "block" => {
                    let raw = need(args, pos + 1, "BLOCK argument")?;
                    block_ms = Some(number(raw, "BLOCK argument")?);
                    pos += 2;
                }
                _ => {
                    return Err(CommandError::parse(format!(
                        "unexpected XREAD argument {arg:?}"
                    )));
                }
            }
        }

        if !met_streams {
            return Err(CommandError::parse("XREAD requires a STREAMS clause"));
        }

        let requests = keys.into_iter().zip(ids).collect();
        Ok(Self::XRead { requests, block_ms })
    }

    /// Re-encodes the command in canonical form: an array of bulk strings
    /// with the verb (and any sub-action) uppercased.
    pub fn to_frame(&self) -> Frame {
        let mut parts: Vec<Frame> = Vec::new();
        match self {
            Self::Ping => parts.push(Frame::bulk_text("PING")),
            Self::Echo { payload } => {
                parts.push(Frame::bulk_text("ECHO"));
                parts.push(Frame::bulk(payload.clone()));
            }
            Self::Set {
                key,
                value,
                expire_ms,
            } => {
                parts.push(Frame::bulk_text("SET"));
                parts.push(Frame::bulk_text(key.clone()));
                parts.push(Frame::bulk(value.clone()));
                if let Some(ms) = expire_ms {
                    parts.push(Frame::bulk_text("PX"));
                    parts.push(Frame::bulk_text(ms.to_string()));
                }
            }
            Self::Get { key } => {
                parts.push(Frame::bulk_text("GET"));
                parts.push(Frame::bulk_text(key.clone()));
            }
            Self::Type { key } => {
                parts.push(Frame::bulk_text("TYPE"));
                parts.push(Frame::bulk_text(key.clone()));
            }
            Self::Keys { pattern } => {
                parts.push(Frame::bulk_text("KEYS"));
                parts.push(Frame::bulk_text(pattern.clone()));
            }
            Self::ConfigGet { key } => {
                parts.push(Frame::bulk_text("CONFIG"));
                parts.push(Frame::bulk_text("GET"));
                parts.push(Frame::bulk_text(key.clone()));
            }
            Self::Info { sections } => {
                parts.push(Frame::bulk_text("INFO"));
                for section in sections {
                    parts.push(Frame::bulk_text(section.clone()));
                }
            }
            Self::ReplConf { args } => {
                parts.push(Frame::bulk_text("REPLCONF"));
                for arg in args {
                    parts.push(Frame::bulk_text(arg.clone()));
                }
            }
            Self::Psync { replica_id, offset } => {
                parts.push(Frame::bulk_text("PSYNC"));
                parts.push(Frame::bulk_text(replica_id.clone()));
                parts.push(Frame::bulk_text(offset.to_string()));
            }
            Self::Wait {
                num_replicas,
                timeout_ms,
            } => {
                parts.push(Frame::bulk_text("WAIT"));
                parts.push(Frame::bulk_text(num_replicas.to_string()));
                parts.push(Frame::bulk_text(timeout_ms.to_string()));
            }
            Self::XAdd { key, id, fields } => {
                parts.push(Frame::bulk_text("XADD"));
                parts.push(Frame::bulk_text(key.clone()));
                parts.push(Frame::bulk_text(id.to_string()));
                for (field, value) in fields {
                    parts.push(Frame::bulk(field.clone()));
                    parts.push(Frame::bulk(value.clone()));
                }
            }
            Self::XRange { key, start, end } => {
                parts.push(Frame::bulk_text("XRANGE"));
                parts.push(Frame::bulk_text(key.clone()));
                let render = |bound: &BoundStreamId, unbound: &str| match bound {
                    BoundStreamId::Exact(id) => id.to_string(),
                    BoundStreamId::Unbound => unbound.to_owned(),
                };
                parts.push(Frame::bulk_text(render(start, "-")));
                parts.push(Frame::bulk_text(render(end, "+")));
            }
            Self::XRead { requests, block_ms } => {
                parts.push(Frame::bulk_text("XREAD"));
                if let Some(ms) = block_ms {
                    parts.push(Frame::bulk_text("BLOCK"));
                    parts.push(Frame::bulk_text(ms.to_string()));
                }
                parts.push(Frame::bulk_text("STREAMS"));
                for (key, _) in requests {
                    parts.push(Frame::bulk_text(key.clone()));
                }
                for (_, id) in requests {
                    parts.push(Frame::bulk_text(id.to_string()));
                }
            }
        }
        Frame::array(parts)
    }
}

#[cfg(test)]
mod tests {
    use cinnabar_types::StreamId;

    use super::*;

    fn request(parts: &[&str]) -> Frame {
        Frame::array(parts.iter().map(|p| Frame::bulk_text(*p)).collect())
    }

    #[test]
    fn parses_ping_any_case() {
        assert_eq!(Command::parse(&request(&["PING"])).unwrap(), Command::Ping);
        assert_eq!(Command::parse(&request(&["ping"])).unwrap(), Command::Ping);
        assert_eq!(Command::parse(&request(&["PiNg"])).unwrap(), Command::Ping);
    }

    #[test]
    fn parses_echo() {
        assert_eq!(
            Command::parse(&request(&["ECHO", "hi"])).unwrap(),
            Command::Echo {
                payload: Bytes::from_static(b"hi")
            }
        );
        assert!(matches!(
            Command::parse(&request(&["ECHO"])),
            Err(CommandError::Parse(_))
        ));
    }

    #[test]
    fn parses_set_with_px() {
        assert_eq!(
            Command::parse(&request(&["SET", "foo", "bar"])).unwrap(),
            Command::Set {
                key: "foo".into(),
                value: Bytes::from_static(b"bar"),
                expire_ms: None,
            }
        );
        assert_eq!(
            Command::parse(&request(&["set", "foo", "bar", "px", "100"])).unwrap(),
            Command::Set {
                key: "foo".into(),
                value: Bytes::from_static(b"bar"),
                expire_ms: Some(100),
            }
        );
    }

    #[test]
    fn rejects_bad_set_params() {
        assert!(Command::parse(&request(&["SET", "k", "v", "px"])).is_err());
        assert!(Command::parse(&request(&["SET", "k", "v", "px", "0"])).is_err());
        assert!(Command::parse(&request(&["SET", "k", "v", "px", "abc"])).is_err());
        assert!(Command::parse(&request(&["SET", "k", "v", "nx"])).is_err());
        assert!(Command::parse(&request(&["SET", "k"])).is_err());
    }

    #[test]
    fn parses_config_get() {
        assert_eq!(
            Command::parse(&request(&["CONFIG", "GET", "dir"])).unwrap(),
            Command::ConfigGet { key: "dir".into() }
        );
        assert!(Command::parse(&request(&["CONFIG", "SET", "dir", "/"])).is_err());
    }

    #[test]
    fn parses_info_sections_lowercased() {
        assert_eq!(
            Command::parse(&request(&["INFO", "Replication"])).unwrap(),
            Command::Info {
                sections: vec!["replication".into()]
            }
        );
        assert_eq!(
            Command::parse(&request(&["INFO"])).unwrap(),
            Command::Info { sections: vec![] }
        );
    }

    #[test]
    fn parses_wait_with_strict_arity() {
        assert_eq!(
            Command::parse(&request(&["WAIT", "2", "500"])).unwrap(),
            Command::Wait {
                num_replicas: 2,
                timeout_ms: 500,
            }
        );
        assert!(Command::parse(&request(&["WAIT", "2"])).is_err());
        assert!(Command::parse(&request(&["WAIT", "2", "500", "x"])).is_err());
    }

    #[test]
    fn parses_psync() {
        assert_eq!(
            Command::parse(&request(&["PSYNC", "?", "-1"])).unwrap(),
            Command::Psync {
                replica_id: "?".into(),
                offset: -1,
            }
        );
    }

    #[test]
    fn parses_xadd_pairs() {
        assert_eq!(
            Command::parse(&request(&["XADD", "s", "1-1", "a", "1", "b", "2"])).unwrap(),
            Command::XAdd {
                key: "s".into(),
                id: InputStreamId::Exact(StreamId::new(1, 1)),
                fields: vec![
                    (Bytes::from_static(b"a"), Bytes::from_static(b"1")),
                    (Bytes::from_static(b"b"), Bytes::from_static(b"2")),
                ],
            }
        );
        // Dangling field with no value
        assert!(Command::parse(&request(&["XADD", "s", "1-1", "a", "1", "b"])).is_err());
        assert!(Command::parse(&request(&["XADD", "s", "*"])).is_err());
    }

    #[test]
    fn parses_xrange_bounds() {
        assert_eq!(
            Command::parse(&request(&["XRANGE", "s", "-", "1-1"])).unwrap(),
            Command::XRange {
                key: "s".into(),
                start: BoundStreamId::Unbound,
                end: BoundStreamId::Exact(StreamId::new(1, 1)),
            }
        );
        assert!(Command::parse(&request(&["XRANGE", "s", "-"])).is_err());
    }

    #[test]
    fn parses_xread_forms() {
        assert_eq!(
            Command::parse(&request(&["XREAD", "streams", "a", "b", "0-0", "$"])).unwrap(),
            Command::XRead {
                requests: vec![
                    ("a".into(), ReadStreamId::Exact(StreamId::new(0, 0))),
                    ("b".into(), ReadStreamId::Latest),
                ],
                block_ms: None,
            }
        );
        assert_eq!(
            Command::parse(&request(&["XREAD", "BLOCK", "1500", "STREAMS", "s", "1-1"])).unwrap(),
            Command::XRead {
                requests: vec![("s".into(), ReadStreamId::Exact(StreamId::new(1, 1)))],
                block_ms: Some(1500),
            }
        );
    }

    #[test]
    fn rejects_lopsided_xread() {
        // Three trailing arguments cannot split into key/id pairs.
        assert!(Command::parse(&request(&["XREAD", "streams", "a", "b", "0-0"])).is_err());
        assert!(Command::parse(&request(&["XREAD", "block", "10"])).is_err());
        assert!(Command::parse(&request(&["XREAD", "streams"])).is_err());
    }

    #[test]
    fn unknown_verb_is_its_own_error() {
        assert!(matches!(
            Command::parse(&request(&["FLUSHALL"])),
            Err(CommandError::UnknownCommand(v)) if v == "flushall"
        ));
    }

    #[test]
    fn non_array_frames_are_rejected() {
        assert!(matches!(
            Command::parse(&Frame::simple("PING")),
            Err(CommandError::NotAnArray)
        ));
        assert!(matches!(
            Command::parse(&Frame::array(vec![Frame::Integer(1)])),
            Err(CommandError::NotAnArray)
        ));
    }

    #[test]
    fn construct_uppercases_the_verb() {
        let set = Command::Set {
            key: "foo".into(),
            value: Bytes::from_static(b"bar"),
            expire_ms: Some(100),
        };
        assert_eq!(
            set.to_frame(),
            request(&["SET", "foo", "bar", "PX", "100"])
        );

        let config = Command::ConfigGet { key: "dir".into() };
        assert_eq!(config.to_frame(), request(&["CONFIG", "GET", "dir"]));
    }

    #[test]
    fn construct_round_trips_through_parse() {
        let commands = [
            Command::Ping,
            Command::Echo {
                payload: Bytes::from_static(b"x"),
            },
            Command::Set {
                key: "k".into(),
                value: Bytes::from_static(b"v"),
                expire_ms: Some(10),
            },
            Command::Get { key: "k".into() },
            Command::Wait {
                num_replicas: 1,
                timeout_ms: 100,
            },
            Command::Psync {
                replica_id: "?".into(),
                offset: -1,
            },
            Command::ReplConf {
                args: vec!["GETACK".into(), "*".into()],
            },
            Command::XAdd {
                key: "s".into(),
                id: InputStreamId::Wildcard,
                fields: vec![(Bytes::from_static(b"f"), Bytes::from_static(b"v"))],
            },
            Command::XRange {
                key: "s".into(),
                start: BoundStreamId::Unbound,
                end: BoundStreamId::Exact(StreamId::new(2, 0)),
            },
            Command::XRead {
                requests: vec![("s".into(), ReadStreamId::Latest)],
                block_ms: Some(50),
            },
        ];
        for command in commands {
            assert_eq!(Command::parse(&command.to_frame()).unwrap(), command);
        }
    }
}
